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

//! Fetches agent code modules onto the node, either from the tenant (zip
//! archives) or from an OCI registry (image layers).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::dtclient;
use crate::processmoduleconfig::ProcessModuleConfig;

mod extract;
pub mod image;
mod ruxitconf;
pub mod url;

pub use image::{DockerConfig, ImageInstaller, ImageReference};
pub use url::{UrlInstaller, UrlProperties};

pub const VERSION_LATEST: &str = "latest";

/// Bin directory of the standalone init container. It always gets a fresh install.
pub const STANDALONE_BIN_DIR: &str = "/mnt/bin";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to download agent: {0}")]
    Download(#[source] dtclient::Error),
    #[error("failed to fetch OneAgent version: {source}, available versions are: [ {available} ]")]
    VersionUnavailable {
        #[source]
        source: dtclient::Error,
        available: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open ZIP file: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("illegal file path: {0}")]
    IllegalPath(String),
    #[error("unsupported entry {0}: device files are not allowed")]
    DeviceEntry(String),
    #[error("invalid image reference {0}: {1}")]
    InvalidImage(String, String),
    #[error("registry request for {url} failed: {reason}")]
    Registry { url: String, reason: String },
    #[error("digest mismatch for {expected}: got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("unknown media type: {0}")]
    UnknownMediaType(String),
    #[error("media type {0} is not implemented")]
    UnsupportedMediaType(String),
    #[error("no manifest for linux/{0} in image index")]
    NoMatchingPlatform(String),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub(crate) trait IoContext<T> {
    fn context(self, what: &str, path: &Path) -> Result<T, Error>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context(self, what: &str, path: &Path) -> Result<T, Error> {
        self.map_err(|e| Error::io(format!("{what} {}", path.display()), e))
    }
}

/// Installs code modules into a target directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Returns whether anything was installed. An existing install yields `false`.
    async fn install_agent(&self, target_dir: &Path) -> Result<bool, Error>;

    /// Re-renders `ruxitagentproc.conf` for the install in `target_dir`.
    async fn update_process_module_config(
        &self,
        target_dir: &Path,
        config: &ProcessModuleConfig,
    ) -> Result<(), Error>;

    /// Removes temporary state such as download caches.
    async fn cleanup(&self) -> Result<(), Error>;
}

pub(crate) async fn is_non_empty_dir(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

pub(crate) async fn remove_dir_if_exists(dir: &Path) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("failed to remove {}", dir.display()), e)),
    }
}

pub(crate) fn standalone_bin_dir() -> PathBuf {
    PathBuf::from(STANDALONE_BIN_DIR)
}
