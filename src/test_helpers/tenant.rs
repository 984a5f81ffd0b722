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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::agent_zip;
use crate::dtclient::{AgentQuery, ClientBuilder, ClientOptions, DynatraceClient, Error};
use crate::processmoduleconfig::{ConnectionInfo, ProcessModuleConfig, ProcessModuleProperty};

/// Tenant serving a fixed set of agent versions.
#[derive(Debug)]
pub struct FakeTenant {
    tenant_uuid: String,
    versions: Vec<String>,
    downloads: AtomicUsize,
    revision: Mutex<u64>,
}

impl FakeTenant {
    pub fn new(tenant_uuid: &str, versions: &[&str]) -> Self {
        FakeTenant {
            tenant_uuid: tenant_uuid.to_string(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            downloads: AtomicUsize::new(0),
            revision: Mutex::new(1),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Publishes a new process module config revision.
    pub fn bump_revision(&self) {
        *self.revision.lock().unwrap() += 1;
    }

    fn download(&self, version: &str, dest: &Path) -> Result<(), Error> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        std::fs::write(dest, agent_zip(version))?;
        Ok(())
    }
}

#[async_trait]
impl DynatraceClient for FakeTenant {
    async fn get_latest_agent(&self, _query: &AgentQuery, dest: &Path) -> Result<(), Error> {
        let latest = self.versions.last().ok_or_else(|| Error::Server {
            status: 404,
            message: "no agent available".to_string(),
        })?;
        self.download(latest, dest)
    }

    async fn get_agent(&self, _query: &AgentQuery, version: &str, dest: &Path) -> Result<(), Error> {
        if !self.versions.iter().any(|v| v == version) {
            return Err(Error::Server {
                status: 404,
                message: format!("version {version} not found"),
            });
        }
        self.download(version, dest)
    }

    async fn get_agent_versions(&self, _query: &AgentQuery) -> Result<Vec<String>, Error> {
        Ok(self.versions.clone())
    }

    async fn get_agent_via_installer_url(&self, _url: &str, dest: &Path) -> Result<(), Error> {
        let version = self.versions.first().map(String::as_str).unwrap_or("1.0.0.0-0");
        self.download(version, dest)
    }

    async fn get_process_module_config(
        &self,
        prev_revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, Error> {
        let revision = *self.revision.lock().unwrap();
        if revision == prev_revision {
            return Ok(None);
        }
        Ok(Some(ProcessModuleConfig {
            revision,
            properties: vec![ProcessModuleProperty {
                section: "general".to_string(),
                key: "revision".to_string(),
                value: revision.to_string(),
            }],
        }))
    }

    async fn get_connection_info(&self) -> Result<ConnectionInfo, Error> {
        Ok(ConnectionInfo {
            tenant_uuid: self.tenant_uuid.clone(),
            tenant_token: "tenant-token".to_string(),
            communication_endpoints: vec!["https://tenant.example.com:443".to_string()],
            formatted_communication_endpoints: "https://tenant.example.com:443".to_string(),
        })
    }
}

/// Hands out the same [`FakeTenant`] regardless of credentials, remembering the last options.
#[derive(Debug)]
pub struct FakeTenantBuilder {
    tenant: Arc<FakeTenant>,
    last_options: Mutex<Option<ClientOptions>>,
}

impl FakeTenantBuilder {
    pub fn new(tenant: Arc<FakeTenant>) -> Self {
        FakeTenantBuilder {
            tenant,
            last_options: Mutex::new(None),
        }
    }

    pub fn last_options(&self) -> Option<ClientOptions> {
        self.last_options.lock().unwrap().clone()
    }
}

impl ClientBuilder for FakeTenantBuilder {
    fn build(&self, opts: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error> {
        *self.last_options.lock().unwrap() = Some(opts);
        Ok(self.tenant.clone())
    }
}
