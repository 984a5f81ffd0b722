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

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;
use tracing::{debug, info, warn};

use super::mount::Mounter;
use super::volume::{VolumeConfig, VolumeInfo};
use super::{Publisher, internal};
use crate::metadata::{self, PathResolver, Store, Volume};
use crate::metrics::Metrics;

/// Mounts the installed code modules into application pods through a per-volume overlay.
pub struct AppPublisher {
    store: Arc<Store>,
    path: PathResolver,
    mounter: Arc<dyn Mounter>,
    metrics: Arc<Metrics>,
}

/// Where a volume's agent comes from.
struct BindConfig {
    tenant_uuid: String,
    /// Version or image digest, used as the volume's record and metric label.
    version: String,
    lower: Vec<PathBuf>,
}

impl AppPublisher {
    pub fn new(
        store: Arc<Store>,
        path: PathResolver,
        mounter: Arc<dyn Mounter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        AppPublisher {
            store,
            path,
            mounter,
            metrics,
        }
    }

    fn bind_config(&self, dk: &metadata::DynaKube) -> BindConfig {
        if dk.image_digest.is_empty() {
            BindConfig {
                tenant_uuid: dk.tenant_uuid.clone(),
                version: dk.latest_version.clone(),
                lower: vec![
                    self.path
                        .agent_binary_dir_for_version(&dk.tenant_uuid, &dk.latest_version),
                ],
            }
        } else {
            // The tenant's config dir sits on top so its ruxitagentproc.conf wins.
            BindConfig {
                tenant_uuid: dk.tenant_uuid.clone(),
                version: dk.image_digest.clone(),
                lower: vec![
                    self.path.agent_config_dir(&dk.tenant_uuid),
                    self.path.agent_shared_binary_dir_for_image(&dk.image_digest),
                ],
            }
        }
    }

    fn mount_agent(&self, bind: &BindConfig, cfg: &VolumeConfig) -> Result<(), Status> {
        let mapped = self
            .path
            .overlay_mapped_dir(&bind.tenant_uuid, &cfg.volume_id);
        let upper = self.path.overlay_var_dir(&bind.tenant_uuid, &cfg.volume_id);
        let work = self.path.overlay_work_dir(&bind.tenant_uuid, &cfg.volume_id);
        for dir in [&mapped, &upper, &work, &cfg.target_path] {
            std::fs::create_dir_all(dir)
                .map_err(|e| internal(&format!("failed to create {}", dir.display()), e))?;
        }
        self.mounter
            .mount_overlay(&bind.lower, &upper, &work, &mapped)
            .map_err(|e| internal("failed to mount overlay", e))?;
        if let Err(e) = self
            .mounter
            .bind_mount(&mapped, &cfg.target_path, cfg.readonly)
        {
            if let Err(e) = self.mounter.unmount(&mapped) {
                warn!(path=%mapped.display(), "failed to roll back overlay: {e}");
            }
            return Err(internal("failed to bind mount agent", e));
        }
        Ok(())
    }

    /// Counts a failed attempt. Keeps a mounted version, else leaves a placeholder.
    fn record_failed_attempt(&self, cfg: &VolumeConfig, tenant_uuid: &str, previous: Option<Volume>) {
        let volume = match previous {
            Some(mut v) => {
                v.mount_attempts += 1;
                v
            }
            None => Volume {
                volume_id: cfg.volume_id.clone(),
                pod_name: cfg.pod_name.clone(),
                pod_namespace: cfg.pod_namespace.clone(),
                version: String::new(),
                tenant_uuid: tenant_uuid.to_string(),
                mount_attempts: 1,
            },
        };
        if let Err(e) = self.store.insert_volume(&volume) {
            warn!("failed to record mount attempt: {e}");
        }
    }

    fn unmount_agent(&self, volume: &Volume, info: &VolumeInfo) {
        if let Err(e) = self.mounter.unmount(&info.target_path) {
            warn!(path=%info.target_path.display(), "unmount failed: {e}");
        }
        let mapped = self
            .path
            .overlay_mapped_dir(&volume.tenant_uuid, &info.volume_id);
        if let Err(e) = self.mounter.unmount(&mapped) {
            warn!(path=%mapped.display(), "unmount failed: {e}");
        }
    }
}

fn store_err(e: metadata::Error) -> Status {
    internal("metadata store", e)
}

#[async_trait]
impl Publisher for AppPublisher {
    async fn publish(&self, cfg: &VolumeConfig) -> Result<(), Status> {
        let Some(dk) = self.store.get_dynakube(&cfg.dynakube).map_err(store_err)? else {
            return Err(Status::unavailable(format!(
                "dynakube {} has not been provisioned on this node yet",
                cfg.dynakube
            )));
        };
        let previous = self.store.get_volume(&cfg.volume_id).map_err(store_err)?;
        let attempts = previous.as_ref().map(|v| v.mount_attempts).unwrap_or(0);
        if attempts >= dk.max_failed_mount_attempts {
            info!(
                pod = cfg.pod_name,
                attempts, "reached max mount attempts, publishing empty volume"
            );
            self.metrics.mount_attempts_exhausted.inc();
            return Ok(());
        }
        if !dk.is_installed() {
            return Err(Status::unavailable(format!(
                "agent for tenant {} is not installed yet",
                dk.tenant_uuid
            )));
        }

        let bind = self.bind_config(&dk);
        if let Err(status) = self.mount_agent(&bind, cfg) {
            self.record_failed_attempt(cfg, &bind.tenant_uuid, previous);
            return Err(status);
        }
        let volume = Volume {
            volume_id: cfg.volume_id.clone(),
            pod_name: cfg.pod_name.clone(),
            pod_namespace: cfg.pod_namespace.clone(),
            version: bind.version.clone(),
            tenant_uuid: bind.tenant_uuid.clone(),
            mount_attempts: 0,
        };
        if let Err(e) = self.store.insert_volume(&volume) {
            self.unmount_agent(&volume, &VolumeInfo {
                volume_id: cfg.volume_id.clone(),
                target_path: cfg.target_path.clone(),
            });
            return Err(store_err(e));
        }
        self.metrics.volume_mounted(&bind.version);
        info!(version = bind.version, "volume published");
        Ok(())
    }

    async fn unpublish(&self, info: &VolumeInfo) -> Result<(), Status> {
        let Some(volume) = self.store.get_volume(&info.volume_id).map_err(store_err)? else {
            return Ok(());
        };
        if volume.is_placeholder() {
            debug!("placeholder volume, nothing mounted");
            return self.store.delete_volume(&volume.volume_id).map_err(store_err);
        }
        self.unmount_agent(&volume, info);
        self.store
            .delete_volume(&volume.volume_id)
            .map_err(store_err)?;
        self.metrics.volume_unmounted(&volume.version);
        match std::fs::remove_dir_all(&info.target_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(internal("failed to remove target path", e)),
        }
        info!(version = volume.version, "volume unpublished");
        Ok(())
    }

    async fn can_unpublish(&self, info: &VolumeInfo) -> Result<bool, Status> {
        Ok(self
            .store
            .get_volume(&info.volume_id)
            .map_err(store_err)?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tonic::Code;

    use super::*;
    use crate::csi::volume::Mode;
    use crate::test_helpers::{FakeMount, FakeMounter};

    struct Fixture {
        root: tempfile::TempDir,
        store: Arc<Store>,
        mounter: Arc<FakeMounter>,
        metrics: Arc<Metrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                root: tempfile::tempdir().unwrap(),
                store: Arc::new(Store::open_in_memory().unwrap()),
                mounter: Arc::new(FakeMounter::default()),
                metrics: Arc::new(Metrics::default()),
            }
        }

        fn path(&self) -> PathResolver {
            PathResolver::new(self.root.path())
        }

        fn publisher(&self) -> AppPublisher {
            AppPublisher::new(
                self.store.clone(),
                self.path(),
                self.mounter.clone(),
                self.metrics.clone(),
            )
        }

        fn target(&self) -> PathBuf {
            self.root.path().join("pods/p1/volume")
        }

        fn config(&self) -> VolumeConfig {
            VolumeConfig {
                volume_id: "v1".to_string(),
                target_path: self.target(),
                pod_name: "p1".to_string(),
                pod_namespace: "ns".to_string(),
                mode: Mode::App,
                dynakube: "dk".to_string(),
                readonly: false,
            }
        }

        fn info(&self) -> VolumeInfo {
            VolumeInfo {
                volume_id: "v1".to_string(),
                target_path: self.target(),
            }
        }

        fn add_dynakube(&self, version: &str, digest: &str) {
            let mut dk = metadata::DynaKube::new("dk", "t1");
            dk.latest_version = version.to_string();
            dk.image_digest = digest.to_string();
            self.store.insert_dynakube(&dk).unwrap();
        }
    }

    fn overlay_target(mounts: &[FakeMount]) -> Option<(PathBuf, String)> {
        mounts.iter().find_map(|m| match m {
            FakeMount::Overlay { target, options } => Some((target.clone(), options.clone())),
            _ => None,
        })
    }

    #[tokio::test]
    async fn publishes_url_installed_version() {
        let f = Fixture::new();
        f.add_dynakube("1.2-3", "");
        f.publisher().publish(&f.config()).await.unwrap();

        let root = f.root.path();
        let mounts = f.mounter.mounts();
        let (mapped, options) = overlay_target(&mounts).unwrap();
        assert_eq!(mapped, root.join("t1/run/v1/mapped"));
        assert!(options.starts_with(&format!("lowerdir={}", root.join("t1/bin/1.2-3").display())));
        assert!(mounts.contains(&FakeMount::Bind {
            source: mapped,
            target: f.target(),
            readonly: false,
        }));
        let volume = f.store.get_volume("v1").unwrap().unwrap();
        assert_eq!(volume.version, "1.2-3");
        assert_eq!(volume.mount_attempts, 0);
        assert_eq!(f.metrics.mounted_volumes("1.2-3"), 1);
    }

    #[tokio::test]
    async fn image_install_stacks_tenant_config() {
        let f = Fixture::new();
        f.add_dynakube("", "abc");
        f.publisher().publish(&f.config()).await.unwrap();

        let root = f.root.path();
        let (_, options) = overlay_target(&f.mounter.mounts()).unwrap();
        let lower = format!(
            "lowerdir={}:{}",
            root.join("t1/config").display(),
            root.join("codemodules/abc").display()
        );
        assert!(options.starts_with(&lower), "{options}");
        assert_eq!(f.store.get_volume("v1").unwrap().unwrap().version, "abc");
    }

    #[tokio::test]
    async fn missing_dynakube_is_unavailable() {
        let f = Fixture::new();
        let err = f.publisher().publish(&f.config()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn not_installed_is_unavailable() {
        let f = Fixture::new();
        f.add_dynakube("", "");
        let err = f.publisher().publish(&f.config()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(f.mounter.mounts().is_empty());
    }

    #[tokio::test]
    async fn fails_open_after_max_attempts() {
        let f = Fixture::new();
        f.add_dynakube("1.2-3", "");
        f.mounter.fail_next_overlays(3);
        let publisher = f.publisher();
        for attempt in 1..=3 {
            let err = publisher.publish(&f.config()).await.unwrap_err();
            assert_eq!(err.code(), Code::Internal);
            let volume = f.store.get_volume("v1").unwrap().unwrap();
            assert_eq!(volume.mount_attempts, attempt);
            assert!(volume.is_placeholder());
        }

        publisher.publish(&f.config()).await.unwrap();
        assert!(f.mounter.mounts().is_empty());
        assert_eq!(f.metrics.mount_attempts_exhausted.get(), 1);
        assert_eq!(f.store.get_volume("v1").unwrap().unwrap().mount_attempts, 3);

        publisher.unpublish(&f.info()).await.unwrap();
        assert!(f.store.get_volume("v1").unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_bind_rolls_back_overlay() {
        let f = Fixture::new();
        f.add_dynakube("1.2-3", "");
        f.mounter.fail_next_binds(1);
        let err = f.publisher().publish(&f.config()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(f.mounter.mounts().is_empty());
        assert_eq!(f.store.get_volume("v1").unwrap().unwrap().mount_attempts, 1);
    }

    #[tokio::test]
    async fn unpublish_unmounts_and_forgets() {
        let f = Fixture::new();
        f.add_dynakube("1.2-3", "");
        let publisher = f.publisher();
        publisher.publish(&f.config()).await.unwrap();
        assert!(publisher.can_unpublish(&f.info()).await.unwrap());

        publisher.unpublish(&f.info()).await.unwrap();
        assert!(f.mounter.mounts().is_empty());
        assert!(f.store.get_volume("v1").unwrap().is_none());
        assert!(!Path::new(&f.target()).exists());
        assert_eq!(f.metrics.mounted_volumes("1.2-3"), 0);
        assert!(!publisher.can_unpublish(&f.info()).await.unwrap());
    }
}
