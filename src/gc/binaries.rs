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

use std::collections::HashSet;

use tracing::debug;

use super::{Error, GarbageCollector, list_dirs};
use crate::metadata;

impl GarbageCollector {
    /// Removes versions under `<tenant>/bin` that are neither installed, pinned nor mounted.
    pub(super) async fn collect_binaries(
        &self,
        record: &metadata::DynaKube,
        pinned: &HashSet<String>,
    ) -> Result<(), Error> {
        let tenant = &record.tenant_uuid;
        let used = self.store.get_used_versions(tenant)?;
        for (version, dir) in list_dirs(&self.path.agent_bin_dir(tenant)).await? {
            if version == record.latest_version || pinned.contains(&version) || used.contains(&version)
            {
                debug!(tenant, version, "version still in use");
                continue;
            }
            self.reclaim(&dir).await?;
        }
        Ok(())
    }

    /// Removes unpacked images no DynaKube has installed and no volume has mounted.
    pub(super) async fn collect_images(&self) -> Result<(), Error> {
        let installed = self.store.get_used_image_digests()?;
        let mounted = self.store.get_all_used_versions()?;
        for (digest, dir) in list_dirs(&self.path.agent_shared_binary_dir_base()).await? {
            if installed.contains(&digest) || mounted.contains(&digest) {
                debug!(digest, "image still in use");
                continue;
            }
            self.reclaim(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::tests::{DIGEST, collector, image_dynakube, url_dynakube};
    use crate::k8s::MockKubeClient;
    use crate::metadata::{PathResolver, Store, Volume};

    fn volume(id: &str, version: &str) -> Volume {
        Volume {
            volume_id: id.to_string(),
            pod_name: format!("pod-{id}"),
            pod_namespace: "ns".to_string(),
            version: version.to_string(),
            tenant_uuid: "t1".to_string(),
            mount_attempts: 0,
        }
    }

    #[tokio::test]
    async fn keeps_latest_pinned_and_mounted_versions() {
        let root = tempfile::tempdir().unwrap();
        let path = PathResolver::new(root.path());
        for v in ["1.0-0", "1.1-0", "1.2-3", "1.2-4"] {
            let dir = path.agent_binary_dir_for_version("t1", v);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("lib.so"), b"agent").unwrap();
        }
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut record = crate::metadata::DynaKube::new("dk", "t1");
        record.latest_version = "1.2-4".to_string();
        store.insert_dynakube(&record).unwrap();
        store.insert_volume(&volume("v1", "1.1-0")).unwrap();

        let mut kube = MockKubeClient::new();
        kube.expect_list_dynakubes().returning(|| {
            Ok(vec![
                url_dynakube("dk", "1.2-4"),
                url_dynakube("pinned", "1.2-3"),
            ])
        });
        let gc = collector(root.path(), store, kube);
        gc.run(&url_dynakube("dk", "1.2-4"), &record).await.unwrap();

        assert!(!path.agent_binary_dir_for_version("t1", "1.0-0").exists());
        for kept in ["1.1-0", "1.2-3", "1.2-4"] {
            assert!(path.agent_binary_dir_for_version("t1", kept).exists(), "{kept}");
        }
        assert_eq!(gc.metrics.gc_reclaimed_bytes.get(), 5);
    }

    #[tokio::test]
    async fn removes_unreferenced_images() {
        let root = tempfile::tempdir().unwrap();
        let path = PathResolver::new(root.path());
        let mounted = "1111111111111111111111111111111111111111111111111111111111111111";
        let stale = "2222222222222222222222222222222222222222222222222222222222222222";
        for d in [DIGEST, mounted, stale] {
            std::fs::create_dir_all(path.agent_shared_binary_dir_for_image(d)).unwrap();
        }
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut record = crate::metadata::DynaKube::new("dk", "t1");
        record.image_digest = DIGEST.to_string();
        store.insert_dynakube(&record).unwrap();
        store.insert_volume(&volume("v1", mounted)).unwrap();

        let mut kube = MockKubeClient::new();
        kube.expect_list_dynakubes()
            .returning(|| Ok(vec![image_dynakube("dk", DIGEST)]));
        let gc = collector(root.path(), store, kube);
        gc.run(&image_dynakube("dk", DIGEST), &record).await.unwrap();

        assert!(path.agent_shared_binary_dir_for_image(DIGEST).exists());
        assert!(path.agent_shared_binary_dir_for_image(mounted).exists());
        assert!(!path.agent_shared_binary_dir_for_image(stale).exists());
    }
}
