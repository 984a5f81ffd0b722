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

//! Node-local records linking DynaKubes, tenants, installed agents and live volumes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

mod path;
mod sqlite;

pub use path::{
    OVERLAY_MAPPED_DIR, OVERLAY_VAR_DIR, OVERLAY_WORK_DIR, PathResolver, RUXIT_CONF_FILE,
    RUXIT_CONF_SOURCE_FILE,
};
pub use sqlite::Store;

/// Mount attempts allowed before a publish fails open.
pub const DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS: i64 = 3;

/// DynaKube as seen by this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynaKube {
    pub name: String,
    pub tenant_uuid: String,
    /// Installed agent version, empty when the agent came from an image.
    pub latest_version: String,
    /// Digest of the installed code modules image, empty for URL installs.
    pub image_digest: String,
    pub max_failed_mount_attempts: i64,
}

impl DynaKube {
    pub fn new(name: &str, tenant_uuid: &str) -> Self {
        DynaKube {
            name: name.to_string(),
            tenant_uuid: tenant_uuid.to_string(),
            latest_version: String::new(),
            image_digest: String::new(),
            max_failed_mount_attempts: DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS,
        }
    }

    /// Both fields empty means no install has finished yet.
    pub fn is_installed(&self) -> bool {
        !self.latest_version.is_empty() || !self.image_digest.is_empty()
    }
}

/// A per-pod application volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub pod_name: String,
    /// Empty on records written before the namespace was tracked.
    pub pod_namespace: String,
    /// Version or image digest that was mounted. Empty for a record that only tracks failed attempts.
    pub version: String,
    pub tenant_uuid: String,
    pub mount_attempts: i64,
}

impl Volume {
    pub fn is_placeholder(&self) -> bool {
        self.version.is_empty()
    }
}

/// The per-node host agent volume of one tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostVolume {
    pub tenant_uuid: String,
    pub volume_id: String,
    pub mounted: bool,
    pub last_modified: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open metadata store {0}: {1}")]
    Open(PathBuf, #[source] rusqlite::Error),
    #[error("failed to {0}: {1}")]
    Query(&'static str, #[source] rusqlite::Error),
}
