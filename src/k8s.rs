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

//! Kubernetes API access used by the provisioner and the correctness sweep.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::ListParams;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use tracing::warn;

use crate::crd::DynaKube;

/// Reporting component on events published by the driver.
pub const REPORTER: &str = "dynatrace-oneagent-csi";

pub const REASON_INSTALL: &str = "InstallAgentVersion";
pub const REASON_FAILED_INSTALL: &str = "FailedInstallAgentVersion";

const EVENT_ACTION: &str = "Provision";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
}

/// Reads and writes the objects the driver depends on. Missing objects are `None`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error>;

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, Error>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, Error>;

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, Error>;

    /// Whether the pod exists. An empty namespace matches the name in any namespace.
    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Publishes an event on the DynaKube. Failures are logged, never returned.
    async fn publish_event(&self, dk: &DynaKube, type_: EventType, reason: &str, note: String);
}

/// [`KubeClient`] backed by the API server.
pub struct KubeApi {
    client: Client,
    namespace: String,
    recorder: Recorder,
}

impl KubeApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: None,
        };
        KubeApi {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            namespace: namespace.to_string(),
        }
    }

    pub fn dynakubes(&self) -> Api<DynaKube> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn not_found_as_none<T>(res: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeApi {
    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error> {
        not_found_as_none(self.dynakubes().get(name).await)
    }

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        Ok(self.dynakubes().list(&ListParams::default()).await?.items)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        if !namespace.is_empty() {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            return Ok(api.get_opt(name).await?.is_some());
        }
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default()
            .fields(&format!("metadata.name={name}"))
            .limit(1);
        Ok(!api.list_metadata(&params).await?.items.is_empty())
    }

    async fn publish_event(&self, dk: &DynaKube, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: EVENT_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &dk.object_ref(&())).await {
            warn!(reason, error = %e, "failed to publish kubernetes event");
        }
    }
}

/// Value of `key` in a secret, checking both `data` and `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(v.0.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|s| s.as_bytes().to_vec())
}
