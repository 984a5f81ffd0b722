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

use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "csi.db";
const SHARED_BINARY_DIR: &str = "codemodules";
const STAGING_DIR: &str = "tmp_zip";
const IMAGE_CACHE_DIR: &str = "images";
const BIN_DIR: &str = "bin";
const CONFIG_DIR: &str = "config";
const RUN_DIR: &str = "run";
const OSAGENT_DIR: &str = "osagent";
const REVISION_FILE: &str = "revision.json";

pub const OVERLAY_MAPPED_DIR: &str = "mapped";
pub const OVERLAY_VAR_DIR: &str = "var";
pub const OVERLAY_WORK_DIR: &str = "work";

pub const RUXIT_CONF_FILE: &str = "agent/conf/ruxitagentproc.conf";
pub const RUXIT_CONF_SOURCE_FILE: &str = "agent/conf/_ruxitagentproc.conf";

/// PathResolver maps tenants, versions and volumes onto the directory tree under the data root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathResolver {
    root_dir: PathBuf,
}

impl PathResolver {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        PathResolver {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_dir.join(DATABASE_FILE)
    }

    pub fn tenant_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.root_dir.join(tenant_uuid)
    }

    /// Per-tenant version store used by URL installs. Superseded by the shared
    /// `codemodules` tree for images but still read for existing volumes.
    pub fn agent_bin_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.tenant_dir(tenant_uuid).join(BIN_DIR)
    }

    pub fn agent_binary_dir_for_version(&self, tenant_uuid: &str, version: &str) -> PathBuf {
        self.agent_bin_dir(tenant_uuid).join(version)
    }

    pub fn agent_shared_binary_dir_base(&self) -> PathBuf {
        self.root_dir.join(SHARED_BINARY_DIR)
    }

    pub fn agent_shared_binary_dir_for_image(&self, digest: &str) -> PathBuf {
        self.agent_shared_binary_dir_base().join(digest)
    }

    /// Overlay layer stacked above an image so the rendered config wins.
    pub fn agent_config_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.tenant_dir(tenant_uuid).join(CONFIG_DIR)
    }

    pub fn agent_config_ruxit_conf(&self, tenant_uuid: &str) -> PathBuf {
        self.agent_config_dir(tenant_uuid).join(RUXIT_CONF_FILE)
    }

    pub fn agent_run_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.tenant_dir(tenant_uuid).join(RUN_DIR)
    }

    pub fn agent_run_dir_for_volume(&self, tenant_uuid: &str, volume_id: &str) -> PathBuf {
        self.agent_run_dir(tenant_uuid).join(volume_id)
    }

    pub fn overlay_mapped_dir(&self, tenant_uuid: &str, volume_id: &str) -> PathBuf {
        self.agent_run_dir_for_volume(tenant_uuid, volume_id)
            .join(OVERLAY_MAPPED_DIR)
    }

    pub fn overlay_var_dir(&self, tenant_uuid: &str, volume_id: &str) -> PathBuf {
        self.agent_run_dir_for_volume(tenant_uuid, volume_id)
            .join(OVERLAY_VAR_DIR)
    }

    pub fn overlay_work_dir(&self, tenant_uuid: &str, volume_id: &str) -> PathBuf {
        self.agent_run_dir_for_volume(tenant_uuid, volume_id)
            .join(OVERLAY_WORK_DIR)
    }

    pub fn osagent_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.tenant_dir(tenant_uuid).join(OSAGENT_DIR)
    }

    pub fn revision_file(&self, tenant_uuid: &str) -> PathBuf {
        self.tenant_dir(tenant_uuid).join(REVISION_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root_dir.join(STAGING_DIR)
    }

    /// OCI layout cache for images being pulled, keyed by digest.
    pub fn image_cache_dir(&self, digest: &str) -> PathBuf {
        self.staging_dir().join(IMAGE_CACHE_DIR).join(digest)
    }

    /// Directories directly under the root that are not tenants.
    pub fn is_reserved(&self, name: &str) -> bool {
        matches!(name, SHARED_BINARY_DIR | STAGING_DIR | DATABASE_FILE)
    }
}
