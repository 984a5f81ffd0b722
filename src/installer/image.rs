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
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::extract::{create_current_symlink, extract_tar_gzip};
use super::{Error, Installer, IoContext, is_non_empty_dir, remove_dir_if_exists, ruxitconf};
use crate::metadata::PathResolver;
use crate::processmoduleconfig::ProcessModuleConfig;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DIGEST_PREFIX: &str = "sha256:";

#[cfg(target_arch = "aarch64")]
const PLATFORM_ARCH: &str = "arm64";
#[cfg(not(target_arch = "aarch64"))]
const PLATFORM_ARCH: &str = "amd64";

static CHALLENGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

/// A canonical image reference. Code modules are only ever pulled by digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    /// `sha256:<hex>`
    pub digest: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidImage(image.to_string(), reason.to_string());
        let (name, digest) = image
            .split_once('@')
            .ok_or_else(|| invalid("reference has no digest"))?;
        let hex = digest
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| invalid("only sha256 digests are supported"))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("malformed digest"));
        }

        let (name, tag) = match name.rsplit_once(':') {
            Some((n, t)) if !t.contains('/') => (n, Some(t.to_string())),
            _ => (name, None),
        };
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest: digest.to_string(),
        })
    }

    pub fn digest_hex(&self) -> &str {
        self.digest
            .strip_prefix(DIGEST_PREFIX)
            .unwrap_or(&self.digest)
    }

    fn base_url(&self) -> String {
        let host = if self.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.registry
        };
        // Local registries are plain http, as with docker and containerd.
        let plain = ["localhost", "127.0.0.1", "[::1]"]
            .iter()
            .any(|h| host == *h || host.starts_with(&format!("{h}:")));
        let scheme = if plain { "http" } else { "https" };
        format!("{scheme}://{host}/v2/{}", self.repository)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Parsed `.dockerconfigjson` of a pull secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Username and password for `registry`, if the config has any.
    pub fn credentials(&self, registry: &str) -> Option<(String, String)> {
        let candidates: &[&str] = if registry == DOCKER_HUB {
            &[DOCKER_HUB, "https://index.docker.io/v1/", "index.docker.io"]
        } else {
            &[registry]
        };
        let auth = self.auths.iter().find_map(|(key, auth)| {
            let host = key
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            candidates
                .iter()
                .any(|c| *c == key.as_str() || host.split('/').next() == Some(*c))
                .then_some(auth)
        })?;
        if let (Some(user), Some(pass)) = (&auth.username, &auth.password) {
            return Some((user.clone(), pass.clone()));
        }
        let decoded = BASE64.decode(auth.auth.as_deref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

/// Registry access settings shared with the tenant client.
#[derive(Clone, Debug, Default)]
pub struct ImageProperties {
    pub image_uri: String,
    pub tenant_uuid: String,
    pub docker_config: DockerConfig,
    pub trusted_cas: Option<Vec<u8>>,
    pub proxy: Option<String>,
    pub skip_cert_check: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize, Debug)]
struct Platform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// Installs code modules shipped as an OCI image into the shared `codemodules` tree.
pub struct ImageInstaller {
    props: ImageProperties,
    reference: Result<ImageReference, String>,
    path: PathResolver,
    client: reqwest::Client,
    bearer: Mutex<Option<String>>,
}

impl ImageInstaller {
    pub fn new(props: ImageProperties, path: PathResolver) -> Result<Self, Error> {
        let client = registry_client(&props)?;
        Ok(ImageInstaller {
            reference: ImageReference::parse(&props.image_uri).map_err(|e| e.to_string()),
            props,
            path,
            client,
            bearer: Mutex::new(None),
        })
    }

    fn reference(&self) -> Result<&ImageReference, Error> {
        self.reference.as_ref().map_err(|reason| {
            Error::InvalidImage(self.props.image_uri.clone(), reason.clone())
        })
    }

    async fn send(&self, url: &str, accept: Option<&str>) -> Result<Response, Error> {
        let registry_err = |reason: String| Error::Registry {
            url: url.to_string(),
            reason,
        };
        let reference = self.reference()?;
        let credentials = self.props.docker_config.credentials(&reference.registry);
        let mut retried = false;
        loop {
            let mut req = self.client.get(url);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }
            let bearer = self.bearer.lock().unwrap().clone();
            if let Some(token) = bearer {
                req = req.header(AUTHORIZATION, format!("Bearer {token}"));
            } else if let Some((user, pass)) = &credentials {
                req = req.basic_auth(user, Some(pass));
            }
            let resp = req.send().await.map_err(|e| registry_err(e.to_string()))?;
            if resp.status() == StatusCode::UNAUTHORIZED && !retried {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if let Some(token) = self.fetch_token(&challenge, credentials.as_ref()).await? {
                    *self.bearer.lock().unwrap() = Some(token);
                    retried = true;
                    continue;
                }
            }
            if !resp.status().is_success() {
                return Err(registry_err(format!("unexpected status {}", resp.status())));
            }
            return Ok(resp);
        }
    }

    /// Exchanges a `Bearer` challenge for a token.
    async fn fetch_token(
        &self,
        challenge: &str,
        credentials: Option<&(String, String)>,
    ) -> Result<Option<String>, Error> {
        let Some(params) = challenge.strip_prefix("Bearer ") else {
            return Ok(None);
        };
        let params: HashMap<&str, &str> = CHALLENGE_PARAM
            .captures_iter(params)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();
        let Some(realm) = params.get("realm") else {
            return Ok(None);
        };
        let query: Vec<(&str, &str)> = ["service", "scope"]
            .iter()
            .filter_map(|k| params.get(k).map(|v| (*k, *v)))
            .collect();
        let mut req = self.client.get(*realm).query(&query);
        if let Some((user, pass)) = credentials {
            req = req.basic_auth(user, Some(pass));
        }
        #[derive(Deserialize)]
        struct Token {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let registry_err = |reason: String| Error::Registry {
            url: realm.to_string(),
            reason,
        };
        let resp = req.send().await.map_err(|e| registry_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(registry_err(format!("unexpected status {}", resp.status())));
        }
        let token: Token = resp.json().await.map_err(|e| registry_err(e.to_string()))?;
        Ok(token.token.or(token.access_token))
    }

    /// Fetches a manifest by digest into the cache and returns its parsed form.
    async fn fetch_manifest(
        &self,
        digest: &str,
        blobs: &Path,
    ) -> Result<(String, Manifest), Error> {
        let reference = self.reference()?;
        let url = format!("{}/manifests/{digest}", reference.base_url());
        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ]
        .join(", ");
        let resp = self.send(&url, Some(&accept)).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(|e| Error::Registry {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        verify_digest(digest, &Sha256::digest(&body))?;
        let path = blob_path(blobs, digest);
        tokio::fs::write(&path, &body)
            .await
            .context("failed to write", &path)?;
        let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| Error::Registry {
            url,
            reason: format!("invalid manifest: {e}"),
        })?;
        let media_type = manifest
            .media_type
            .clone()
            .or(content_type)
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
        Ok((media_type, manifest))
    }

    /// Streams a blob into the cache, verifying its digest on the way.
    async fn fetch_blob(&self, digest: &str, blobs: &Path) -> Result<PathBuf, Error> {
        let reference = self.reference()?;
        let url = format!("{}/blobs/{digest}", reference.base_url());
        let resp = self.send(&url, None).await?;
        let path = blob_path(blobs, digest);
        let mut file = tokio::fs::File::create(&path)
            .await
            .context("failed to create", &path)?;
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Registry {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .context("failed to write", &path)?;
        }
        file.flush().await.context("failed to write", &path)?;
        verify_digest(digest, &hasher.finalize())?;
        Ok(path)
    }

    /// Resolves the image to the manifests to unpack, selecting linux/<arch> from an index.
    async fn manifests(&self, blobs: &Path) -> Result<Vec<Manifest>, Error> {
        let reference = self.reference()?;
        let (media_type, top) = self.fetch_manifest(&reference.digest, blobs).await?;
        debug!(media_type, "fetched image manifest");
        match media_type.as_str() {
            MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => Ok(vec![top]),
            MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
                let selected = select_platform(&top.manifests)?;
                let mut manifests = Vec::with_capacity(selected.len());
                for descriptor in selected {
                    let (_, manifest) = self.fetch_manifest(&descriptor.digest, blobs).await?;
                    manifests.push(manifest);
                }
                Ok(manifests)
            }
            other => Err(Error::UnknownMediaType(other.to_string())),
        }
    }

    async fn pull_and_unpack(&self, target_dir: &Path, cache_dir: &Path) -> Result<(), Error> {
        let blobs = cache_dir.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs)
            .await
            .context("failed to create", &blobs)?;
        tokio::fs::write(
            cache_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .await
        .context("failed to write layout in", cache_dir)?;

        for manifest in self.manifests(&blobs).await? {
            for layer in &manifest.layers {
                match layer.media_type.as_str() {
                    MEDIA_TYPE_LAYER_GZIP | MEDIA_TYPE_DOCKER_LAYER_GZIP => {
                        info!(digest = layer.digest, "fetching image layer");
                        let blob = self.fetch_blob(&layer.digest, &blobs).await?;
                        let target = target_dir.to_path_buf();
                        tokio::task::spawn_blocking(move || extract_tar_gzip(&blob, &target))
                            .await??;
                    }
                    MEDIA_TYPE_LAYER_ZSTD => {
                        return Err(Error::UnsupportedMediaType(layer.media_type.clone()));
                    }
                    other => return Err(Error::UnknownMediaType(other.to_string())),
                }
            }
        }
        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || create_current_symlink(&target)).await??;
        Ok(())
    }
}

fn registry_client(props: &ImageProperties) -> Result<reqwest::Client, Error> {
    let config_err = |reason: String| Error::Registry {
        url: props.image_uri.clone(),
        reason,
    };
    let mut builder =
        reqwest::Client::builder().danger_accept_invalid_certs(props.skip_cert_check);
    if let Some(pem) = &props.trusted_cas {
        for cert in reqwest::Certificate::from_pem_bundle(pem)
            .map_err(|e| config_err(format!("invalid trusted CAs: {e}")))?
        {
            builder = builder.add_root_certificate(cert);
        }
    }
    if let Some(proxy) = props.proxy.as_deref().filter(|p| !p.is_empty()) {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy).map_err(|e| config_err(format!("invalid proxy: {e}")))?,
        );
    }
    builder.build().map_err(|e| config_err(e.to_string()))
}

fn blob_path(blobs: &Path, digest: &str) -> PathBuf {
    blobs.join(digest.strip_prefix(DIGEST_PREFIX).unwrap_or(digest))
}

fn verify_digest(expected: &str, actual: &[u8]) -> Result<(), Error> {
    let actual = format!("{DIGEST_PREFIX}{}", hex(actual));
    if actual != expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn select_platform(manifests: &[Descriptor]) -> Result<Vec<&Descriptor>, Error> {
    let matching: Vec<&Descriptor> = manifests
        .iter()
        .filter(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == PLATFORM_ARCH)
        })
        .collect();
    if !matching.is_empty() {
        return Ok(matching);
    }
    // Single-platform indexes often omit the platform.
    if manifests.iter().all(|d| d.platform.is_none()) {
        if let Some(first) = manifests.first() {
            return Ok(vec![first]);
        }
    }
    Err(Error::NoMatchingPlatform(PLATFORM_ARCH.to_string()))
}

#[async_trait]
impl Installer for ImageInstaller {
    async fn install_agent(&self, target_dir: &Path) -> Result<bool, Error> {
        let reference = self.reference()?;
        if is_non_empty_dir(target_dir).await {
            info!(image = self.props.image_uri, "image already installed");
            return Ok(false);
        }
        let base = self.path.agent_shared_binary_dir_base();
        tokio::fs::create_dir_all(&base)
            .await
            .context("failed to create", &base)?;

        let cache_dir = self.path.image_cache_dir(reference.digest_hex());
        info!(image = self.props.image_uri, target=%target_dir.display(), "installing agent from image");
        let result = self.pull_and_unpack(target_dir, &cache_dir).await;
        if let Err(e) = remove_dir_if_exists(&cache_dir).await {
            warn!("failed to remove image cache: {e}");
        }
        if let Err(e) = result {
            if let Err(cleanup) = remove_dir_if_exists(target_dir).await {
                warn!("failed to clean up after failed install: {cleanup}");
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn update_process_module_config(
        &self,
        target_dir: &Path,
        config: &ProcessModuleConfig,
    ) -> Result<(), Error> {
        let dest = self.path.agent_config_ruxit_conf(&self.props.tenant_uuid);
        info!(dest=%dest.display(), "updating ruxitagentproc.conf");
        ruxitconf::update(target_dir, &dest, config).await
    }

    async fn cleanup(&self) -> Result<(), Error> {
        let reference = self.reference()?;
        remove_dir_if_exists(&self.path.image_cache_dir(reference.digest_hex())).await
    }
}
