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

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use super::{GarbageCollector, list_dirs};
use crate::metadata::OVERLAY_MAPPED_DIR;

impl GarbageCollector {
    /// Removes run directories of volumes that are no longer mounted and have not
    /// changed for longer than the configured age.
    pub(super) async fn collect_unmounted(&self, tenant: &str) {
        let Some(max_age) = self.max_unmounted_volume_age else {
            return;
        };
        let run_dirs = match list_dirs(&self.path.agent_run_dir(tenant)).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(tenant, "failed to list run directories: {e}");
                return;
            }
        };
        for (volume_id, dir) in run_dirs {
            if has_entries(&dir.join(OVERLAY_MAPPED_DIR)).await {
                continue;
            }
            if !older_than(&dir, max_age).await {
                debug!(tenant, volume_id, "unmounted volume is too recent to remove");
                continue;
            }
            if let Err(e) = self.reclaim(&dir).await {
                warn!(tenant, volume_id, "failed to remove unmounted volume: {e}");
            }
        }
    }
}

async fn has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn older_than(dir: &Path, age: Duration) -> bool {
    let Ok(modified) = tokio::fs::metadata(dir).await.and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|elapsed| elapsed > age)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::super::tests::collector;
    use crate::k8s::MockKubeClient;
    use crate::metadata::{PathResolver, Store};

    fn age(dir: &std::path::Path, by: Duration) {
        std::fs::File::open(dir)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn removes_old_unmounted_volumes() {
        let root = tempfile::tempdir().unwrap();
        let path = PathResolver::new(root.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gc = collector(root.path(), store, MockKubeClient::new());

        let old = path.agent_run_dir_for_volume("t1", "old");
        std::fs::create_dir_all(path.overlay_mapped_dir("t1", "old")).unwrap();
        std::fs::write(path.overlay_var_dir("t1", "old"), b"log").unwrap();
        age(&old, Duration::from_secs(3600));

        let recent = path.agent_run_dir_for_volume("t1", "recent");
        std::fs::create_dir_all(path.overlay_mapped_dir("t1", "recent")).unwrap();

        let mounted = path.agent_run_dir_for_volume("t1", "mounted");
        std::fs::create_dir_all(path.overlay_mapped_dir("t1", "mounted")).unwrap();
        std::fs::write(path.overlay_mapped_dir("t1", "mounted").join("agent"), b"").unwrap();
        age(&mounted, Duration::from_secs(3600));

        gc.collect_unmounted("t1").await;
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(mounted.exists());
    }

    #[tokio::test]
    async fn disabled_without_max_age() {
        let root = tempfile::tempdir().unwrap();
        let path = PathResolver::new(root.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut gc = collector(root.path(), store, MockKubeClient::new());
        gc.max_unmounted_volume_age = None;

        let old = path.agent_run_dir_for_volume("t1", "old");
        std::fs::create_dir_all(&old).unwrap();
        age(&old, Duration::from_secs(3600));
        gc.collect_unmounted("t1").await;
        assert!(old.exists());
    }
}
