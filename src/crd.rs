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

//! The subset of the DynaKube custom resource read by the driver and provisioner.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::metadata::DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS;

const ANNOTATION_FEATURE_PREFIX: &str = "feature.dynatrace.com/";
const DEPRECATED_FEATURE_PREFIX: &str = "alpha.operator.dynatrace.com/feature-";
pub const ANNOTATION_MAX_CSI_MOUNT_ATTEMPTS: &str = "feature.dynatrace.com/max-csi-mount-attempts";
pub const ANNOTATION_READONLY_HOST_FS: &str = "feature.dynatrace.com/oneagent-readonly-host-fs";
const ANNOTATION_DISABLE_READONLY_HOST_FS: &str =
    "feature.dynatrace.com/disable-oneagent-readonly-host-fs";

const PULL_SECRET_SUFFIX: &str = "-pull-secret";
const HOST_GROUP_ARG: &str = "--set-host-group";
const LATEST_TAG: &str = "latest";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    plural = "dynakubes",
    status = "DynaKubeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    pub api_url: String,
    /// Secret holding `apiToken` and optionally `paasToken`. Defaults to the DynaKube name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tokens: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_pull_secret: String,
    #[serde(default)]
    pub skip_cert_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<DynaKubeProxy>,
    /// ConfigMap with a `certs` key holding PEM encoded CAs.
    #[serde(default, rename = "trustedCAs", skip_serializing_if = "String::is_empty")]
    pub trusted_cas: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_zone: String,
    #[serde(default)]
    pub one_agent: OneAgentSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeProxy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Secret holding the proxy under the `proxy` key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value_from: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classic_full_stack: Option<HostInjectSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<CloudNativeFullStackSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<ApplicationMonitoringSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_monitoring: Option<HostInjectSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostInjectSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudNativeFullStackSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code_modules_image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMonitoringSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code_modules_image: String,
    #[serde(default, rename = "useCSIDriver", skip_serializing_if = "Option::is_none")]
    pub use_csi_driver: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    #[serde(default)]
    pub code_modules: CodeModulesStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_agent_version_unix_paas: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeModulesStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, rename = "imageID", skip_serializing_if = "String::is_empty")]
    pub image_id: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("cannot derive tenant UUID from API URL '{0}'")]
pub struct InvalidApiUrl(pub String);

impl DynaKube {
    pub fn cloud_native_mode(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
    }

    pub fn application_monitoring_mode(&self) -> bool {
        self.spec.one_agent.application_monitoring.is_some()
    }

    pub fn host_monitoring_mode(&self) -> bool {
        self.spec.one_agent.host_monitoring.is_some()
    }

    pub fn classic_full_stack_mode(&self) -> bool {
        self.spec.one_agent.classic_full_stack.is_some()
    }

    pub fn needs_csi_driver(&self) -> bool {
        let app_monitoring_with_csi = self
            .spec
            .one_agent
            .application_monitoring
            .as_ref()
            .is_some_and(|a| a.use_csi_driver.unwrap_or(false));
        let readonly_host_monitoring =
            self.host_monitoring_mode() && !self.readonly_host_fs_disabled();
        self.cloud_native_mode() || app_monitoring_with_csi || readonly_host_monitoring
    }

    pub fn needs_app_injection(&self) -> bool {
        self.cloud_native_mode() || self.application_monitoring_mode()
    }

    fn feature_flag(&self, annotation: &str) -> Option<&str> {
        let annotations = self.annotations();
        if let Some(v) = annotations.get(annotation) {
            return Some(v.as_str());
        }
        let name = annotation.strip_prefix(ANNOTATION_FEATURE_PREFIX)?;
        annotations
            .get(&format!("{DEPRECATED_FEATURE_PREFIX}{name}"))
            .map(String::as_str)
    }

    fn readonly_host_fs_disabled(&self) -> bool {
        match self.feature_flag(ANNOTATION_READONLY_HOST_FS) {
            Some(v) => v == "false",
            None => self.feature_flag(ANNOTATION_DISABLE_READONLY_HOST_FS) == Some("true"),
        }
    }

    /// Mount failures tolerated before a publish fails open.
    pub fn max_failed_mount_attempts(&self) -> i64 {
        match self
            .feature_flag(ANNOTATION_MAX_CSI_MOUNT_ATTEMPTS)
            .map(|v| v.trim().parse::<i64>())
        {
            Some(Ok(n)) if n >= 0 => n,
            _ => DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS,
        }
    }

    fn version(&self) -> &str {
        let oa = &self.spec.one_agent;
        if let Some(s) = &oa.classic_full_stack {
            return &s.version;
        }
        if let Some(s) = &oa.cloud_native_full_stack {
            return &s.version;
        }
        if let Some(s) = &oa.application_monitoring {
            return &s.version;
        }
        if let Some(s) = &oa.host_monitoring {
            return &s.version;
        }
        ""
    }

    /// Image the code modules should come from, if any. The spec wins over the status.
    pub fn code_modules_image(&self) -> String {
        let oa = &self.spec.one_agent;
        let from_spec = if let Some(cn) = &oa.cloud_native_full_stack {
            cn.code_modules_image.as_str()
        } else if let (Some(app), true) = (&oa.application_monitoring, self.needs_csi_driver()) {
            app.code_modules_image.as_str()
        } else {
            ""
        };
        if !from_spec.is_empty() {
            return from_spec.to_string();
        }
        self.status
            .as_ref()
            .map(|s| s.code_modules.image_id.clone())
            .unwrap_or_default()
    }

    /// Agent version pinned by this DynaKube. Empty when injection is off or nothing is known yet.
    pub fn code_modules_version(&self) -> String {
        if !self.needs_app_injection() {
            return String::new();
        }
        let image = self.code_modules_image();
        if !image.is_empty() {
            return raw_image_tag(&image).to_string();
        }
        if !self.version().is_empty() && !self.cloud_native_mode() {
            return self.version().to_string();
        }
        let status = self.status.clone().unwrap_or_default();
        if !status.code_modules.version.is_empty() {
            return status.code_modules.version;
        }
        status.latest_agent_version_unix_paas
    }

    pub fn host_group(&self) -> String {
        let oa = &self.spec.one_agent;
        let args = oa
            .cloud_native_full_stack
            .as_ref()
            .map(|s| &s.args)
            .or(oa.host_monitoring.as_ref().map(|s| &s.args))
            .or(oa.classic_full_stack.as_ref().map(|s| &s.args));
        args.into_iter()
            .flatten()
            .find_map(|arg| match arg.split_once('=') {
                Some((HOST_GROUP_ARG, value)) if !value.contains('=') => Some(value.to_string()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn tokens(&self) -> String {
        if self.spec.tokens.is_empty() {
            self.name_any()
        } else {
            self.spec.tokens.clone()
        }
    }

    pub fn pull_secret(&self) -> String {
        if self.spec.custom_pull_secret.is_empty() {
            format!("{}{PULL_SECRET_SUFFIX}", self.name_any())
        } else {
            self.spec.custom_pull_secret.clone()
        }
    }

    pub fn has_proxy(&self) -> bool {
        self.spec
            .proxy
            .as_ref()
            .is_some_and(|p| !p.value.is_empty() || !p.value_from.is_empty())
    }

    pub fn tenant_uuid(&self) -> Result<String, InvalidApiUrl> {
        tenant_uuid_from_api_url(&self.spec.api_url)
    }
}

/// A path of `/e/<uuid>/api` names the tenant, otherwise the first host label does.
pub fn tenant_uuid_from_api_url(api_url: &str) -> Result<String, InvalidApiUrl> {
    let invalid = || InvalidApiUrl(api_url.to_string());
    let parsed = url::Url::parse(api_url).map_err(|_| invalid())?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if let ["e", tenant, "api", ..] = segments.as_slice() {
        return Ok(tenant.to_string());
    }
    parsed
        .host_str()
        .and_then(|h| h.split('.').find(|l| !l.is_empty()))
        .map(str::to_string)
        .ok_or_else(invalid)
}

/// Text after the last ':' of an image reference, or `latest` when there is none.
pub fn raw_image_tag(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((_, tag)) => tag,
        None => LATEST_TAG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn with_annotations(mut dk: DynaKube, annotations: BTreeMap<String, String>) -> DynaKube {
        dk.metadata.annotations = Some(annotations);
        dk
    }

    fn dk(spec: DynaKubeSpec) -> DynaKube {
        DynaKube::new("dk", spec)
    }

    fn cloud_native(image: &str) -> DynaKubeSpec {
        DynaKubeSpec {
            api_url: "https://t1.example/api".to_string(),
            one_agent: OneAgentSpec {
                cloud_native_full_stack: Some(CloudNativeFullStackSpec {
                    code_modules_image: image.to_string(),
                    args: vec!["--set-host-group=prod".to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test_case("https://t1.example/api", "t1"; "host label")]
    #[test_case("https://managed.example/e/abc123/api", "abc123"; "managed path")]
    #[test_case("https://abc.live.dynatrace.com/api/", "abc"; "trailing slash")]
    fn tenant_uuid(url: &str, expected: &str) {
        assert_eq!(tenant_uuid_from_api_url(url).unwrap(), expected);
    }

    #[test]
    fn tenant_uuid_invalid() {
        assert!(tenant_uuid_from_api_url("not a url").is_err());
        assert!(tenant_uuid_from_api_url("unix:/socket").is_err());
    }

    #[test_case("registry/img:1.2-3", "1.2-3")]
    #[test_case("registry/img", "latest")]
    #[test_case("registry/img@sha256:abc", "abc")]
    fn image_tag(image: &str, expected: &str) {
        assert_eq!(raw_image_tag(image), expected);
    }

    #[test]
    fn cloud_native_predicates() {
        let d = dk(cloud_native("reg/img:1.2-3"));
        assert!(d.needs_csi_driver());
        assert!(d.needs_app_injection());
        assert_eq!(d.code_modules_image(), "reg/img:1.2-3");
        assert_eq!(d.code_modules_version(), "1.2-3");
        assert_eq!(d.host_group(), "prod");
        assert_eq!(d.tokens(), "dk");
        assert_eq!(d.pull_secret(), "dk-pull-secret");
        assert_eq!(d.max_failed_mount_attempts(), 3);
    }

    #[test]
    fn application_monitoring_without_csi() {
        let mut spec = cloud_native("");
        spec.one_agent = OneAgentSpec {
            application_monitoring: Some(ApplicationMonitoringSpec {
                version: "1.2-4".to_string(),
                code_modules_image: "reg/img:ignored".to_string(),
                use_csi_driver: Some(false),
            }),
            ..Default::default()
        };
        let d = dk(spec);
        assert!(!d.needs_csi_driver());
        assert!(d.needs_app_injection());
        assert_eq!(d.code_modules_image(), "");
        assert_eq!(d.code_modules_version(), "1.2-4");
    }

    #[test]
    fn version_from_status() {
        let mut d = dk(cloud_native(""));
        assert_eq!(d.code_modules_version(), "");
        d.status = Some(DynaKubeStatus {
            latest_agent_version_unix_paas: "1.2-5".to_string(),
            ..Default::default()
        });
        assert_eq!(d.code_modules_version(), "1.2-5");
        d.status.as_mut().unwrap().code_modules.version = "1.2-6".to_string();
        assert_eq!(d.code_modules_version(), "1.2-6");
    }

    #[test]
    fn host_monitoring_readonly_flag() {
        let mut spec = cloud_native("");
        spec.one_agent = OneAgentSpec {
            host_monitoring: Some(HostInjectSpec::default()),
            ..Default::default()
        };
        let d = dk(spec);
        assert!(d.needs_csi_driver());
        assert!(!d.needs_app_injection());

        let disabled = with_annotations(
            d.clone(),
            BTreeMap::from([(ANNOTATION_READONLY_HOST_FS.to_string(), "false".to_string())]),
        );
        assert!(!disabled.needs_csi_driver());
    }

    #[test_case("5", 5)]
    #[test_case("0", 0)]
    #[test_case("-1", 3)]
    #[test_case("many", 3)]
    fn mount_attempts_annotation(raw: &str, expected: i64) {
        let d = with_annotations(
            dk(cloud_native("")),
            BTreeMap::from([(ANNOTATION_MAX_CSI_MOUNT_ATTEMPTS.to_string(), raw.to_string())]),
        );
        assert_eq!(d.max_failed_mount_attempts(), expected);
    }

    #[test]
    fn deserializes_resource() {
        let d: DynaKube = serde_json::from_value(serde_json::json!({
            "apiVersion": "dynatrace.com/v1beta1",
            "kind": "DynaKube",
            "metadata": {"name": "dk", "namespace": "dynatrace"},
            "spec": {
                "apiUrl": "https://t1.example/api",
                "trustedCAs": "ca",
                "proxy": {"valueFrom": "proxy-secret"},
                "oneAgent": {"applicationMonitoring": {"useCSIDriver": true, "version": "1.2-3"}}
            },
            "status": {"codeModules": {"imageID": "reg/img@sha256:abc"}}
        }))
        .unwrap();
        assert!(d.needs_csi_driver());
        assert!(d.has_proxy());
        assert_eq!(d.spec.trusted_cas, "ca");
        assert_eq!(d.code_modules_image(), "reg/img@sha256:abc");
    }
}
