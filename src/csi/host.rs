// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tonic::Status;
use tracing::{info, warn};

use super::mount::Mounter;
use super::volume::{VolumeConfig, VolumeInfo};
use super::{Publisher, internal};
use crate::metadata::{self, HostVolume, PathResolver, Store};

/// Shares the tenant's `osagent` directory with the host agent pod.
pub struct HostPublisher {
    store: Arc<Store>,
    path: PathResolver,
    mounter: Arc<dyn Mounter>,
}

fn store_err(e: metadata::Error) -> Status {
    internal("metadata store", e)
}

impl HostPublisher {
    pub fn new(store: Arc<Store>, path: PathResolver, mounter: Arc<dyn Mounter>) -> Self {
        HostPublisher {
            store,
            path,
            mounter,
        }
    }
}

#[async_trait]
impl Publisher for HostPublisher {
    async fn publish(&self, cfg: &VolumeConfig) -> Result<(), Status> {
        let Some(dk) = self.store.get_dynakube(&cfg.dynakube).map_err(store_err)? else {
            return Err(Status::unavailable(format!(
                "dynakube {} has not been provisioned on this node yet",
                cfg.dynakube
            )));
        };
        let osagent = self.path.osagent_dir(&dk.tenant_uuid);
        for dir in [&osagent, &cfg.target_path] {
            std::fs::create_dir_all(dir)
                .map_err(|e| internal(&format!("failed to create {}", dir.display()), e))?;
        }
        self.mounter
            .bind_mount(&osagent, &cfg.target_path, cfg.readonly)
            .map_err(|e| internal("failed to bind mount osagent dir", e))?;

        let record = HostVolume {
            tenant_uuid: dk.tenant_uuid.clone(),
            volume_id: cfg.volume_id.clone(),
            mounted: true,
            last_modified: Utc::now(),
        };
        let existing = self
            .store
            .get_host_volume_by_tenant_uuid(&dk.tenant_uuid)
            .map_err(store_err)?;
        let stored = match existing {
            Some(_) => self.store.update_host_volume(&record),
            None => self.store.insert_host_volume(&record),
        };
        if let Err(e) = stored {
            if let Err(e) = self.mounter.unmount(&cfg.target_path) {
                warn!(path=%cfg.target_path.display(), "unmount failed: {e}");
            }
            return Err(store_err(e));
        }
        info!(tenant = dk.tenant_uuid, "host volume published");
        Ok(())
    }

    async fn unpublish(&self, info: &VolumeInfo) -> Result<(), Status> {
        let Some(mut record) = self
            .store
            .get_host_volume_by_volume_id(&info.volume_id)
            .map_err(store_err)?
        else {
            return Ok(());
        };
        if let Err(e) = self.mounter.unmount(&info.target_path) {
            warn!(path=%info.target_path.display(), "unmount failed: {e}");
        }
        record.mounted = false;
        record.last_modified = Utc::now();
        self.store.update_host_volume(&record).map_err(store_err)?;
        match std::fs::remove_dir_all(&info.target_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(internal("failed to remove target path", e)),
        }
        info!(tenant = record.tenant_uuid, "host volume unpublished");
        Ok(())
    }

    async fn can_unpublish(&self, info: &VolumeInfo) -> Result<bool, Status> {
        Ok(self
            .store
            .get_host_volume_by_volume_id(&info.volume_id)
            .map_err(store_err)?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;
    use crate::csi::volume::Mode;
    use crate::test_helpers::{FakeMount, FakeMounter};

    fn config(root: &std::path::Path, volume_id: &str) -> VolumeConfig {
        VolumeConfig {
            volume_id: volume_id.to_string(),
            target_path: root.join("pods/agent").join(volume_id),
            pod_name: "oneagent-xyz".to_string(),
            pod_namespace: "dynatrace".to_string(),
            mode: Mode::Host,
            dynakube: "dk".to_string(),
            readonly: true,
        }
    }

    #[tokio::test]
    async fn publish_and_unpublish_keep_record() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_dynakube(&metadata::DynaKube::new("dk", "t1"))
            .unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let publisher = HostPublisher::new(
            store.clone(),
            PathResolver::new(root.path()),
            mounter.clone(),
        );

        let cfg = config(root.path(), "h1");
        publisher.publish(&cfg).await.unwrap();
        assert_eq!(
            mounter.mounts(),
            vec![FakeMount::Bind {
                source: root.path().join("t1/osagent"),
                target: cfg.target_path.clone(),
                readonly: true,
            }]
        );
        let record = store.get_host_volume_by_tenant_uuid("t1").unwrap().unwrap();
        assert!(record.mounted);
        assert_eq!(record.volume_id, "h1");

        let info = VolumeInfo {
            volume_id: "h1".to_string(),
            target_path: cfg.target_path.clone(),
        };
        assert!(publisher.can_unpublish(&info).await.unwrap());
        publisher.unpublish(&info).await.unwrap();
        assert!(mounter.mounts().is_empty());
        let record = store.get_host_volume_by_tenant_uuid("t1").unwrap().unwrap();
        assert!(!record.mounted);

        // A restarted host agent pod gets a new volume for the same tenant.
        let cfg = config(root.path(), "h2");
        publisher.publish(&cfg).await.unwrap();
        let record = store.get_host_volume_by_tenant_uuid("t1").unwrap().unwrap();
        assert!(record.mounted);
        assert_eq!(record.volume_id, "h2");
    }

    #[tokio::test]
    async fn unknown_dynakube_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let publisher = HostPublisher::new(
            Arc::new(Store::open_in_memory().unwrap()),
            PathResolver::new(root.path()),
            Arc::new(FakeMounter::default()),
        );
        let err = publisher
            .publish(&config(root.path(), "h1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
