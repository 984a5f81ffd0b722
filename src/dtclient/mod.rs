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

//! Client for the tenant deployment API.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::processmoduleconfig::{ConnectionInfo, ProcessModuleConfig};

mod http;

pub use http::HttpClient;

pub const OS_UNIX: &str = "unix";
pub const INSTALLER_TYPE_PAAS: &str = "paas";
pub const FLAVOR_MULTIDISTRO: &str = "multidistro";
pub const LATEST_VERSION: &str = "latest";

#[cfg(target_arch = "aarch64")]
pub const ARCH: &str = "arm";
#[cfg(not(target_arch = "aarch64"))]
pub const ARCH: &str = "x86";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("dynatrace server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to store download: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Selects an agent package on the tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentQuery {
    pub os: String,
    pub installer_type: String,
    pub flavor: String,
    pub arch: String,
    pub technologies: Vec<String>,
}

impl Default for AgentQuery {
    fn default() -> Self {
        AgentQuery {
            os: OS_UNIX.to_string(),
            installer_type: INSTALLER_TYPE_PAAS.to_string(),
            flavor: FLAVOR_MULTIDISTRO.to_string(),
            arch: ARCH.to_string(),
            technologies: vec!["all".to_string()],
        }
    }
}

/// Everything needed to talk to one tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub api_url: String,
    pub api_token: String,
    /// Used for installer downloads when set, otherwise the API token is.
    pub paas_token: Option<String>,
    pub proxy: Option<String>,
    /// PEM bundle added to the trusted roots.
    pub trusted_cas: Option<Vec<u8>>,
    pub skip_cert_check: bool,
    pub network_zone: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DynatraceClient: Send + Sync {
    async fn get_latest_agent(&self, query: &AgentQuery, dest: &Path) -> Result<(), Error>;

    async fn get_agent(&self, query: &AgentQuery, version: &str, dest: &Path) -> Result<(), Error>;

    async fn get_agent_versions(&self, query: &AgentQuery) -> Result<Vec<String>, Error>;

    /// Downloads from an explicit URL. The tenant token is not sent.
    async fn get_agent_via_installer_url(&self, url: &str, dest: &Path) -> Result<(), Error>;

    /// Returns `None` when the tenant reports `prev_revision` is still current.
    async fn get_process_module_config(
        &self,
        prev_revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, Error>;

    async fn get_connection_info(&self) -> Result<ConnectionInfo, Error>;
}

/// Builds tenant clients from resolved credentials.
#[cfg_attr(test, mockall::automock)]
pub trait ClientBuilder: Send + Sync {
    fn build(&self, opts: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error>;
}

/// Builds [`HttpClient`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpClientBuilder;

impl ClientBuilder for HttpClientBuilder {
    fn build(&self, opts: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error> {
        Ok(Arc::new(HttpClient::new(opts)?))
    }
}
