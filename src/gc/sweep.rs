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

use tracing::info;

use super::{Error, GarbageCollector};

impl GarbageCollector {
    /// Drops volume records whose pod is gone and DynaKube records whose resource is gone.
    /// Run directories are left for the unmounted volume pass.
    pub async fn sweep(&self) -> Result<(), Error> {
        for volume in self.store.get_all_volumes()? {
            if !self
                .kube
                .pod_exists(&volume.pod_namespace, &volume.pod_name)
                .await?
            {
                info!(
                    pod = %volume.pod_name,
                    namespace = %volume.pod_namespace,
                    volume_id = %volume.volume_id,
                    "pod no longer exists, removing volume record"
                );
                self.store.delete_volume(&volume.volume_id)?;
            }
        }
        for record in self.store.get_all_dynakubes()? {
            if self.kube.get_dynakube(&record.name).await?.is_none() {
                info!(dynakube = record.name, "dynakube no longer exists, removing record");
                self.store.delete_dynakube(&record.name)?;
            }
        }
        Ok(())
    }
}
