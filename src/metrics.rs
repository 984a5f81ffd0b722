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

use std::sync::Mutex;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};

pub mod process;
pub mod server;

pub use server::*;

const PREFIX: &str = "dynatrace_csi_driver";

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct VersionLabels {
    pub version: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct InstallLabels {
    pub outcome: InstallOutcome,
}

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum InstallOutcome {
    success,
    failure,
}

/// Process wide driver metrics. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Metrics {
    pub memory_usage_bytes: Gauge,
    agent_versions: Family<VersionLabels, Gauge>,
    // Serializes inc/dec on agent_versions so a label is never removed while another volume bumps it.
    agent_versions_lock: Mutex<()>,
    pub gc_reclaimed_bytes: Counter,
    installs: Family<InstallLabels, Counter>,
    pub mount_attempts_exhausted: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let memory_usage_bytes = Gauge::default();
        registry.register_with_unit(
            "memory_usage",
            "Resident memory of the driver process",
            Unit::Bytes,
            memory_usage_bytes.clone(),
        );

        let agent_versions = Family::default();
        registry.register(
            "agent_versions",
            "Application volumes currently mounted per agent version or image digest",
            agent_versions.clone(),
        );

        let gc_reclaimed_bytes = Counter::default();
        registry.register_with_unit(
            "gc_reclaimed",
            "Bytes removed by garbage collection",
            Unit::Bytes,
            gc_reclaimed_bytes.clone(),
        );

        let installs = Family::default();
        registry.register("installs", "Agent installations by outcome", installs.clone());

        let mount_attempts_exhausted = Counter::default();
        registry.register(
            "mount_attempts_exhausted",
            "Publish requests that skipped mounting after too many failures",
            mount_attempts_exhausted.clone(),
        );

        Self {
            memory_usage_bytes,
            agent_versions,
            agent_versions_lock: Mutex::new(()),
            gc_reclaimed_bytes,
            installs,
            mount_attempts_exhausted,
        }
    }

    pub fn volume_mounted(&self, version: &str) {
        let _guard = self.agent_versions_lock.lock().unwrap();
        self.agent_versions
            .get_or_create(&VersionLabels {
                version: version.to_string(),
            })
            .inc();
    }

    pub fn volume_unmounted(&self, version: &str) {
        let _guard = self.agent_versions_lock.lock().unwrap();
        let labels = VersionLabels {
            version: version.to_string(),
        };
        let left = self.agent_versions.get_or_create(&labels).dec() - 1;
        if left <= 0 {
            self.agent_versions.remove(&labels);
        }
    }

    /// Current gauge value for a version. Removes the label again if it was absent.
    #[cfg(any(test, feature = "testing"))]
    pub fn mounted_volumes(&self, version: &str) -> i64 {
        let _guard = self.agent_versions_lock.lock().unwrap();
        let labels = VersionLabels {
            version: version.to_string(),
        };
        let value = self.agent_versions.get_or_create(&labels).get();
        if value == 0 {
            self.agent_versions.remove(&labels);
        }
        value
    }

    pub fn record_install(&self, outcome: InstallOutcome) {
        self.installs.get_or_create(&InstallLabels { outcome }).inc();
    }

    pub fn installs(&self, outcome: InstallOutcome) -> u64 {
        self.installs.get_or_create(&InstallLabels { outcome }).get()
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix(PREFIX))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::new(registry.sub_registry_with_prefix(PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn version_label_removed_at_zero() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        metrics.volume_mounted("1.2-3");
        metrics.volume_mounted("1.2-3");
        metrics.volume_unmounted("1.2-3");

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("dynatrace_csi_driver_agent_versions{version=\"1.2-3\"} 1"));

        metrics.volume_unmounted("1.2-3");
        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(!out.contains("version=\"1.2-3\""));
    }

    #[test]
    fn install_outcome_labels() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        metrics.record_install(InstallOutcome::failure);
        metrics.gc_reclaimed_bytes.inc_by(42);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("dynatrace_csi_driver_installs_total{outcome=\"failure\"} 1"));
        assert!(out.contains("dynatrace_csi_driver_gc_reclaimed_bytes_total 42"));
    }
}
