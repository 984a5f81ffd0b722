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

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use kube::runtime::events::EventType;

use crate::crd::DynaKube;
use crate::k8s::{Error, KubeClient};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub dynakube: String,
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

/// In-memory cluster holding the objects a [`KubeClient`] reads.
#[derive(Debug, Default)]
pub struct FakeKube {
    dynakubes: Mutex<BTreeMap<String, DynaKube>>,
    secrets: Mutex<BTreeMap<String, Secret>>,
    config_maps: Mutex<BTreeMap<String, ConfigMap>>,
    pods: Mutex<HashSet<(String, String)>>,
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeKube {
    pub fn put_dynakube(&self, dk: DynaKube) {
        self.dynakubes.lock().unwrap().insert(dk.name_any(), dk);
    }

    pub fn remove_dynakube(&self, name: &str) {
        self.dynakubes.lock().unwrap().remove(name);
    }

    pub fn put_secret(&self, name: &str, entries: &[(&str, &str)]) {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            string_data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.secrets.lock().unwrap().insert(name.to_string(), secret);
    }

    pub fn put_config_map(&self, name: &str, entries: &[(&str, &str)]) {
        let cm = ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.config_maps
            .lock()
            .unwrap()
            .insert(name.to_string(), cm);
    }

    pub fn put_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error> {
        Ok(self.dynakubes.lock().unwrap().get(name).cloned())
    }

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        Ok(self.dynakubes.lock().unwrap().values().cloned().collect())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secrets.lock().unwrap().get(name).cloned())
    }

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_maps.lock().unwrap().get(name).cloned())
    }

    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .any(|(ns, n)| n == name && (namespace.is_empty() || ns == namespace)))
    }

    async fn publish_event(&self, dk: &DynaKube, type_: EventType, reason: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            dynakube: dk.name_any(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}
