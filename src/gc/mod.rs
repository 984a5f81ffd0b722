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

//! Reclaims agent versions, images and run directories nothing refers to anymore.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::DynaKube;
use crate::drain::DrainWatcher;
use crate::installer::ImageReference;
use crate::k8s::{self, KubeClient};
use crate::metadata::{self, PathResolver, Store};
use crate::metrics::Metrics;

mod binaries;
mod sweep;
mod unmounted;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Metadata(#[from] metadata::Error),
    #[error(transparent)]
    Kube(#[from] k8s::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    fn io(context: String, source: std::io::Error) -> Self {
        Error::Io { context, source }
    }
}

pub struct GarbageCollector {
    store: Arc<Store>,
    path: PathResolver,
    kube: Arc<dyn KubeClient>,
    metrics: Arc<Metrics>,
    max_unmounted_volume_age: Option<Duration>,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<Store>,
        path: PathResolver,
        kube: Arc<dyn KubeClient>,
        metrics: Arc<Metrics>,
        max_unmounted_volume_age: Option<Duration>,
    ) -> Self {
        GarbageCollector {
            store,
            path,
            kube,
            metrics,
            max_unmounted_volume_age,
        }
    }

    /// Runs the binary, image and unmounted volume passes for the tenant of a freshly
    /// reconciled DynaKube. Nothing is touched while another install or upgrade is in flight.
    pub async fn run(&self, dk: &DynaKube, record: &metadata::DynaKube) -> Result<(), Error> {
        let dynakubes = self.kube.list_dynakubes().await?;
        if !self.is_safe_to_gc(&dynakubes)? {
            info!(dynakube = record.name, "install in progress, skipping garbage collection");
            return Ok(());
        }
        let tenant = record.tenant_uuid.as_str();
        let pinned = pinned_versions(&dynakubes, tenant);
        debug!(dynakube = dk.name_any(), tenant, ?pinned, "running garbage collection");

        self.collect_binaries(record, &pinned).await?;
        self.collect_images().await?;
        self.collect_unmounted(tenant).await;
        Ok(())
    }

    /// Every record has finished its install, and every image based DynaKube has the
    /// digest it currently asks for installed.
    pub fn is_safe_to_gc(&self, dynakubes: &[DynaKube]) -> Result<bool, Error> {
        for record in self.store.get_all_dynakubes()? {
            let image = dynakubes
                .iter()
                .find(|dk| dk.name_any() == record.name)
                .map(DynaKube::code_modules_image)
                .unwrap_or_default();
            if image.is_empty() {
                if record.latest_version.is_empty() && record.image_digest.is_empty() {
                    debug!(dynakube = record.name, "agent not installed yet");
                    return Ok(false);
                }
                continue;
            }
            match ImageReference::parse(&image) {
                Ok(reference) if reference.digest_hex() == record.image_digest => {}
                _ => {
                    debug!(dynakube = record.name, image, "image upgrade pending");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Runs the correctness sweep and the unmounted volume pass every `interval`
    /// until a drain starts.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, drain: DrainWatcher) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let drained = drain.wait_for_drain();
        tokio::pin!(drained);
        loop {
            tokio::select! {
                _ = &mut drained => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("correctness sweep failed: {e}");
                    }
                    for tenant in self.tenant_dirs().await {
                        self.collect_unmounted(&tenant).await;
                    }
                }
            }
        }
    }

    async fn tenant_dirs(&self) -> Vec<String> {
        list_dirs(self.path.root_dir())
            .await
            .unwrap_or_else(|e| {
                warn!("failed to list tenants: {e}");
                Vec::new()
            })
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !self.path.is_reserved(name))
            .collect()
    }

    /// Removes `dir` and counts its size towards the reclaimed bytes.
    async fn reclaim(&self, dir: &Path) -> Result<(), Error> {
        let size = dir_size(dir.to_path_buf()).await;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(format!("failed to remove {}", dir.display()), e)),
        }
        self.metrics.gc_reclaimed_bytes.inc_by(size);
        info!(dir=%dir.display(), size, "removed");
        Ok(())
    }
}

/// Versions pinned by any DynaKube of `tenant`.
fn pinned_versions(dynakubes: &[DynaKube], tenant: &str) -> HashSet<String> {
    dynakubes
        .iter()
        .filter(|dk| dk.tenant_uuid().is_ok_and(|t| t == tenant))
        .map(DynaKube::code_modules_version)
        .filter(|v| !v.is_empty())
        .collect()
}

/// Subdirectories of `dir` by name. A missing `dir` has none.
async fn list_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(format!("failed to read {}", dir.display()), e)),
    };
    let mut dirs = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(Error::io(format!("failed to read {}", dir.display()), e)),
        };
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn dir_size(dir: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || walk_size(&dir))
        .await
        .unwrap_or_default()
}

fn walk_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| walk_size(&e.path()))
                .sum()
        })
        .unwrap_or_default()
}
