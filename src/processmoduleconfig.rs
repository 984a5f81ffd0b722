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

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const GENERAL_SECTION: &str = "general";
const HOST_GROUP_KEY: &str = "hostGroup";
const TENANT_KEY: &str = "tenant";
const TENANT_TOKEN_KEY: &str = "tenantToken";
const SERVER_ADDRESS_KEY: &str = "serverAddress";
const PROXY_KEY: &str = "proxy";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessModuleProperty {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Revisioned agent runtime configuration served by the tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessModuleConfig {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub properties: Vec<ProcessModuleProperty>,
}

/// Tenant connection details, as returned by the connectioninfo endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(rename = "tenantUUID", default)]
    pub tenant_uuid: String,
    #[serde(default)]
    pub tenant_token: String,
    #[serde(default)]
    pub communication_endpoints: Vec<String>,
    #[serde(default)]
    pub formatted_communication_endpoints: String,
}

impl ProcessModuleConfig {
    pub fn to_map(&self) -> HashMap<String, HashMap<String, String>> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        for prop in &self.properties {
            sections
                .entry(prop.section.clone())
                .or_default()
                .insert(prop.key.clone(), prop.value.clone());
        }
        sections
    }

    /// Sets `section/key`. An empty value removes the property; duplicates collapse into one.
    pub fn add(&mut self, prop: ProcessModuleProperty) {
        let mut replaced = false;
        self.properties.retain_mut(|p| {
            if p.section != prop.section || p.key != prop.key {
                return true;
            }
            if replaced || prop.value.is_empty() {
                return false;
            }
            p.value = prop.value.clone();
            replaced = true;
            true
        });
        if !replaced && !prop.value.is_empty() {
            self.properties.push(prop);
        }
    }

    fn add_general(&mut self, key: &str, value: &str) {
        self.add(ProcessModuleProperty {
            section: GENERAL_SECTION.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn add_host_group(mut self, host_group: &str) -> Self {
        self.add_general(HOST_GROUP_KEY, host_group);
        self
    }

    pub fn add_connection_info(mut self, info: &ConnectionInfo, tenant_token: &str) -> Self {
        self.add_general(TENANT_KEY, &info.tenant_uuid);
        self.add_general(TENANT_TOKEN_KEY, tenant_token);
        self.add_general(
            SERVER_ADDRESS_KEY,
            &format!("{{{}}}", info.communication_endpoints.join(";")),
        );
        self
    }

    pub fn add_proxy(mut self, proxy: &str) -> Self {
        if !proxy.is_empty() {
            self.add_general(PROXY_KEY, proxy);
        }
        self
    }

    /// FNV-1 32 bit hash of the JSON form, hex encoded.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", fnv1_32(&json))
    }
}

fn fnv1_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    data.iter().fold(OFFSET_BASIS, |hash, b| {
        hash.wrapping_mul(PRIME) ^ u32::from(*b)
    })
}

/// The last config fetched for a tenant together with its hash, persisted as `revision.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessModuleConfigCache {
    pub process_module_config: ProcessModuleConfig,
    pub hash: String,
}

impl ProcessModuleConfigCache {
    pub fn new(config: ProcessModuleConfig) -> Self {
        let hash = config.hash();
        ProcessModuleConfigCache {
            process_module_config: config,
            hash,
        }
    }

    /// Missing or unreadable cache files are treated as absent.
    pub async fn load(path: &Path) -> Option<Self> {
        let raw = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(cache) => Some(cache),
            Err(e) => {
                debug!(path=%path.display(), "ignoring unreadable process module config cache: {e}");
                None
            }
        }
    }

    pub async fn store(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        tokio::fs::write(path, raw).await
    }
}
