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

//! Resolves tenant credentials, proxy, CAs and pull secrets referenced by a DynaKube.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

use super::Error;
use crate::crd::DynaKube;
use crate::dtclient::ClientOptions;
use crate::installer::DockerConfig;
use crate::k8s::{KubeClient, secret_value};

pub const API_TOKEN_KEY: &str = "apiToken";
pub const PAAS_TOKEN_KEY: &str = "paasToken";
pub const PROXY_KEY: &str = "proxy";
pub const TRUSTED_CAS_KEY: &str = "certs";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

async fn fetch_secret(kube: &dyn KubeClient, name: &str) -> Result<Secret, Error> {
    kube.get_secret(name)
        .await?
        .ok_or_else(|| Error::MissingSecret(name.to_string()))
}

fn string_value(secret: &Secret, name: &str, key: &str) -> Result<String, Error> {
    let missing = || Error::MissingKey {
        object: name.to_string(),
        key: key.to_string(),
    };
    let value = secret_value(secret, key).ok_or_else(missing)?;
    String::from_utf8(value)
        .map(|v| v.trim().to_string())
        .map_err(|_| missing())
}

/// Proxy URL from the spec, or from the secret it references.
pub async fn proxy(kube: &dyn KubeClient, dk: &DynaKube) -> Result<Option<String>, Error> {
    let Some(proxy) = dk.spec.proxy.as_ref() else {
        return Ok(None);
    };
    if !proxy.value.is_empty() {
        return Ok(Some(proxy.value.clone()));
    }
    if !proxy.value_from.is_empty() {
        let secret = fetch_secret(kube, &proxy.value_from).await?;
        return string_value(&secret, &proxy.value_from, PROXY_KEY).map(Some);
    }
    Ok(None)
}

async fn trusted_cas(kube: &dyn KubeClient, dk: &DynaKube) -> Result<Option<Vec<u8>>, Error> {
    let name = &dk.spec.trusted_cas;
    if name.is_empty() {
        return Ok(None);
    }
    let cm = kube
        .get_config_map(name)
        .await?
        .ok_or_else(|| Error::MissingConfigMap(name.clone()))?;
    cm.data
        .as_ref()
        .and_then(|d| d.get(TRUSTED_CAS_KEY))
        .map(|certs| Some(certs.as_bytes().to_vec()))
        .ok_or_else(|| Error::MissingKey {
            object: name.clone(),
            key: TRUSTED_CAS_KEY.to_string(),
        })
}

/// Everything the tenant client needs, read from the token secret and friends.
pub async fn client_options(kube: &dyn KubeClient, dk: &DynaKube) -> Result<ClientOptions, Error> {
    let tokens = dk.tokens();
    let secret = fetch_secret(kube, &tokens).await?;
    let api_token = string_value(&secret, &tokens, API_TOKEN_KEY)?;
    let paas_token = match string_value(&secret, &tokens, PAAS_TOKEN_KEY) {
        Ok(token) if !token.is_empty() => Some(token),
        Ok(_) | Err(Error::MissingKey { .. }) => None,
        Err(e) => return Err(e),
    };
    Ok(ClientOptions {
        api_url: dk.spec.api_url.clone(),
        api_token,
        paas_token,
        proxy: proxy(kube, dk).await?,
        trusted_cas: trusted_cas(kube, dk).await?,
        skip_cert_check: dk.spec.skip_cert_check,
        network_zone: Some(dk.spec.network_zone.clone()).filter(|z| !z.is_empty()),
    })
}

/// Registry credentials from the pull secret. A missing secret means anonymous pulls.
pub async fn docker_config(kube: &dyn KubeClient, dk: &DynaKube) -> Result<DockerConfig, Error> {
    let name = dk.pull_secret();
    let Some(secret) = kube.get_secret(&name).await? else {
        debug!(dynakube = dk.name_any(), secret = name, "no pull secret, pulling anonymously");
        return Ok(DockerConfig::default());
    };
    let raw = secret_value(&secret, DOCKER_CONFIG_JSON_KEY).ok_or_else(|| Error::MissingKey {
        object: name.clone(),
        key: DOCKER_CONFIG_JSON_KEY.to_string(),
    })?;
    DockerConfig::from_json(&raw).map_err(|e| Error::PullSecret(name, e))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::ConfigMap;
    use matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;
    use crate::crd::{DynaKubeProxy, DynaKubeSpec};
    use crate::k8s::MockKubeClient;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn dynakube(spec: DynaKubeSpec) -> DynaKube {
        DynaKube::new(
            "dk",
            DynaKubeSpec {
                api_url: "https://t1.example.com/api".to_string(),
                ..spec
            },
        )
    }

    #[tokio::test]
    async fn reads_tokens_proxy_and_cas() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .with(eq("dk"))
            .returning(|_| Ok(Some(secret(&[("apiToken", "api\n"), ("paasToken", "paas")]))));
        kube.expect_get_secret()
            .with(eq("proxy-secret"))
            .returning(|_| Ok(Some(secret(&[("proxy", "http://proxy:3128")]))));
        kube.expect_get_config_map().with(eq("cas")).returning(|_| {
            Ok(Some(ConfigMap {
                data: Some(BTreeMap::from([("certs".to_string(), "PEM".to_string())])),
                ..Default::default()
            }))
        });
        let dk = dynakube(DynaKubeSpec {
            proxy: Some(DynaKubeProxy {
                value_from: "proxy-secret".to_string(),
                ..Default::default()
            }),
            trusted_cas: "cas".to_string(),
            network_zone: "zone-a".to_string(),
            ..Default::default()
        });

        let opts = client_options(&kube, &dk).await.unwrap();
        assert_eq!(opts.api_token, "api");
        assert_eq!(opts.paas_token.as_deref(), Some("paas"));
        assert_eq!(opts.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(opts.trusted_cas, Some(b"PEM".to_vec()));
        assert_eq!(opts.network_zone.as_deref(), Some("zone-a"));
    }

    #[tokio::test]
    async fn paas_token_is_optional() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_| Ok(Some(secret(&[("apiToken", "api")]))));
        let opts = client_options(&kube, &dynakube(DynaKubeSpec::default()))
            .await
            .unwrap();
        assert_eq!(opts.paas_token, None);
        assert_eq!(opts.proxy, None);
    }

    #[tokio::test]
    async fn missing_token_secret_or_key() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_| Ok(None));
        assert_matches!(
            client_options(&kube, &dynakube(DynaKubeSpec::default())).await,
            Err(Error::MissingSecret(ref s)) if s == "dk"
        );

        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_| Ok(Some(secret(&[("paasToken", "paas")]))));
        assert_matches!(
            client_options(&kube, &dynakube(DynaKubeSpec::default())).await,
            Err(Error::MissingKey { ref key, .. }) if key == "apiToken"
        );
    }

    #[tokio::test]
    async fn pull_secret_is_optional() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .with(eq("dk-pull-secret"))
            .returning(|_| Ok(None));
        let cfg = docker_config(&kube, &dynakube(DynaKubeSpec::default()))
            .await
            .unwrap();
        assert!(cfg.auths.is_empty());

        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_| {
            Ok(Some(secret(&[(
                ".dockerconfigjson",
                r#"{"auths":{"reg.example.com":{"username":"u","password":"p"}}}"#,
            )])))
        });
        let cfg = docker_config(&kube, &dynakube(DynaKubeSpec::default()))
            .await
            .unwrap();
        assert_eq!(
            cfg.credentials("reg.example.com"),
            Some(("u".to_string(), "p".to_string()))
        );
    }
}
