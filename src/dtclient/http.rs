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
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{AgentQuery, ClientOptions, DynatraceClient, Error};
use crate::processmoduleconfig::{ConnectionInfo, ProcessModuleConfig};

const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);
// Agent archives run to several hundred megabytes.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Deserialize, Debug, Default)]
struct ServerErrorEnvelope {
    #[serde(default)]
    error: ServerError,
}

#[derive(Deserialize, Debug, Default)]
struct ServerError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AgentVersions {
    #[serde(default)]
    available_versions: Vec<String>,
}

/// [`DynatraceClient`] backed by the tenant's REST API.
pub struct HttpClient {
    client: reqwest::Client,
    // Separate client so explicit installer URLs never see the tenant token.
    anonymous: reqwest::Client,
    api_url: String,
    api_token: String,
    download_token: String,
    network_zone: Option<String>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("api_url", &self.api_url)
            .field("network_zone", &self.network_zone)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(opts: ClientOptions) -> Result<Self, Error> {
        if opts.api_url.is_empty() {
            return Err(Error::Config("api url is empty".to_string()));
        }
        if opts.api_token.is_empty() {
            return Err(Error::Config("api token is empty".to_string()));
        }
        let download_token = opts
            .paas_token
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| opts.api_token.clone());
        Ok(HttpClient {
            client: build_reqwest(&opts)?,
            anonymous: build_reqwest(&opts)?,
            api_url: opts.api_url.trim_end_matches('/').to_string(),
            api_token: opts.api_token,
            download_token,
            network_zone: opts.network_zone.filter(|z| !z.is_empty()),
        })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<url::Url, Error> {
        let raw = format!("{}{}", self.api_url, path);
        let mut url = url::Url::parse(&raw).map_err(|e| Error::Config(format!("{raw}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get(&self, url: url::Url, token: &str, timeout: Duration) -> Result<Response, Error> {
        debug!(%url, "calling tenant api");
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Api-Token {token}"))
            .map_err(|e| Error::Config(format!("invalid token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        self.client
            .get(url.clone())
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| Error::Request {
                url: url.to_string(),
                source,
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: url::Url) -> Result<T, Error> {
        let resp = check_status(self.get(url.clone(), &self.api_token, API_CALL_TIMEOUT).await?)
            .await?;
        let body = resp.bytes().await.map_err(|source| Error::Request {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn download(&self, url: url::Url, dest: &Path) -> Result<(), Error> {
        let resp = self
            .get(url.clone(), &self.download_token, DOWNLOAD_TIMEOUT)
            .await?;
        write_body(check_status(resp).await?, &url, dest).await
    }
}

fn build_reqwest(opts: &ClientOptions) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(opts.skip_cert_check);
    if let Some(pem) = &opts.trusted_cas {
        let certs = reqwest::Certificate::from_pem_bundle(pem)
            .map_err(|e| Error::Config(format!("invalid trusted CAs: {e}")))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    if let Some(proxy) = opts.proxy.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| Error::Config(format!("invalid proxy: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {e}")))
}

fn agent_query(query: &AgentQuery) -> Vec<(&'static str, String)> {
    let mut q = vec![
        ("flavor", query.flavor.clone()),
        ("arch", query.arch.clone()),
        ("bitness", "64".to_string()),
    ];
    q.extend(query.technologies.iter().map(|t| ("include", t.clone())));
    q
}

/// Maps non-2xx responses onto [`Error::Server`], preferring the tenant's error envelope.
async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    Err(server_error(status, &body))
}

fn server_error(status: StatusCode, body: &[u8]) -> Error {
    match serde_json::from_slice::<ServerErrorEnvelope>(body) {
        Ok(env) if !env.error.message.is_empty() => Error::Server {
            status: if env.error.code != 0 {
                env.error.code
            } else {
                status.as_u16()
            },
            message: env.error.message,
        },
        _ => Error::Server {
            status: status.as_u16(),
            message: String::from_utf8_lossy(body).trim().to_string(),
        },
    }
}

async fn write_body(resp: Response, url: &url::Url, dest: &Path) -> Result<(), Error> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| Error::Request {
            url: url.to_string(),
            source,
        })?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    info!(%url, bytes = written, "download complete");
    Ok(())
}

#[async_trait]
impl DynatraceClient for HttpClient {
    async fn get_latest_agent(&self, query: &AgentQuery, dest: &Path) -> Result<(), Error> {
        let url = self.url(
            &format!(
                "/v1/deployment/installer/agent/{}/{}/latest",
                query.os, query.installer_type
            ),
            &agent_query(query),
        )?;
        self.download(url, dest).await
    }

    async fn get_agent(&self, query: &AgentQuery, version: &str, dest: &Path) -> Result<(), Error> {
        let url = self.url(
            &format!(
                "/v1/deployment/installer/agent/{}/{}/version/{}",
                query.os, query.installer_type, version
            ),
            &agent_query(query),
        )?;
        self.download(url, dest).await
    }

    async fn get_agent_versions(&self, query: &AgentQuery) -> Result<Vec<String>, Error> {
        let url = self.url(
            &format!(
                "/v1/deployment/installer/agent/versions/{}/{}",
                query.os, query.installer_type
            ),
            &[
                ("flavor", query.flavor.clone()),
                ("arch", query.arch.clone()),
            ],
        )?;
        let versions: AgentVersions = self.get_json(url).await?;
        Ok(versions.available_versions)
    }

    async fn get_agent_via_installer_url(&self, url: &str, dest: &Path) -> Result<(), Error> {
        let parsed =
            url::Url::parse(url).map_err(|e| Error::Config(format!("installer url {url}: {e}")))?;
        let resp = self
            .anonymous
            .get(parsed.clone())
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|source| Error::Request {
                url: url.to_string(),
                source,
            })?;
        write_body(check_status(resp).await?, &parsed, dest).await
    }

    async fn get_process_module_config(
        &self,
        prev_revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, Error> {
        let url = self.url(
            "/v1/deployment/installer/agent/processmodule",
            &[
                ("revision", prev_revision.to_string()),
                ("sections", "general".to_string()),
            ],
        )?;
        let resp = self
            .get(url.clone(), &self.download_token, API_CALL_TIMEOUT)
            .await?;
        if matches!(resp.status(), StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND) {
            return Ok(None);
        }
        let body = check_status(resp)
            .await?
            .bytes()
            .await
            .map_err(|source| Error::Request {
                url: url.to_string(),
                source,
            })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| Error::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get_connection_info(&self) -> Result<ConnectionInfo, Error> {
        let query = match &self.network_zone {
            Some(zone) => vec![("networkZone", zone.clone())],
            None => vec![],
        };
        let url = self.url("/v1/deployment/installer/agent/connectioninfo", &query)?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::{Request, Response};
    use matches::assert_matches;

    use super::*;
    use crate::drain;
    use crate::hyper_util::Server;

    #[derive(Clone, Default)]
    struct Tenant {
        // path -> (status, body)
        routes: Arc<HashMap<String, (u16, String)>>,
        seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    async fn serve(
        tenant: Tenant,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let full = match req.uri().query() {
            Some(q) => format!("{path}?{q}"),
            None => path.clone(),
        };
        tenant.seen.lock().unwrap().push((full, auth));
        let (status, body) = tenant
            .routes
            .get(&path)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(body)))
            .unwrap())
    }

    async fn start(routes: &[(&str, u16, &str)]) -> (Tenant, SocketAddr, drain::DrainTrigger) {
        let tenant = Tenant {
            routes: Arc::new(
                routes
                    .iter()
                    .map(|(p, s, b)| (p.to_string(), (*s, b.to_string())))
                    .collect(),
            ),
            ..Default::default()
        };
        let (trigger, watcher) = drain::new();
        let server = Server::bind(
            "tenant",
            "127.0.0.1:0".parse().unwrap(),
            watcher,
            tenant.clone(),
        )
        .await
        .unwrap();
        let addr = server.address();
        server.spawn(serve);
        (tenant, addr, trigger)
    }

    fn client(addr: SocketAddr, paas: Option<&str>) -> HttpClient {
        HttpClient::new(ClientOptions {
            api_url: format!("http://{addr}/api/"),
            api_token: "api".to_string(),
            paas_token: paas.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn downloads_version_with_paas_token() {
        let path = "/api/v1/deployment/installer/agent/unix/paas/version/1.2-3";
        let (tenant, addr, _trigger) = start(&[(path, 200, "zipdata")]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("agent.zip");
        client(addr, Some("paas"))
            .get_agent(&AgentQuery::default(), "1.2-3", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "zipdata");
        let seen = tenant.seen.lock().unwrap();
        let (url, auth) = &seen[0];
        assert!(url.contains("flavor=multidistro"), "{url}");
        assert!(url.contains("include=all"), "{url}");
        assert_eq!(auth.as_deref(), Some("Api-Token paas"));
    }

    #[tokio::test]
    async fn server_error_envelope() {
        let path = "/api/v1/deployment/installer/agent/unix/paas/latest";
        let (_tenant, addr, _trigger) = start(&[(
            path,
            400,
            r#"{"error":{"code":400,"message":"bad flavor"}}"#,
        )])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let err = client(addr, None)
            .get_latest_agent(&AgentQuery::default(), &dir.path().join("a.zip"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Server { status: 400, ref message } if message == "bad flavor");
    }

    #[tokio::test]
    async fn lists_versions() {
        let path = "/api/v1/deployment/installer/agent/versions/unix/paas";
        let (_tenant, addr, _trigger) =
            start(&[(path, 200, r#"{"availableVersions":["1.2-3","1.2-4"]}"#)]).await;
        let versions = client(addr, None)
            .get_agent_versions(&AgentQuery::default())
            .await
            .unwrap();
        assert_eq!(versions, vec!["1.2-3", "1.2-4"]);
    }

    #[tokio::test]
    async fn process_module_config_unchanged() {
        let path = "/api/v1/deployment/installer/agent/processmodule";
        let (tenant, addr, _trigger) = start(&[(path, 304, "")]).await;
        let pmc = client(addr, None).get_process_module_config(7).await.unwrap();
        assert!(pmc.is_none());
        let seen = tenant.seen.lock().unwrap();
        assert!(seen[0].0.contains("revision=7"), "{}", seen[0].0);
    }

    #[tokio::test]
    async fn process_module_config_changed() {
        let path = "/api/v1/deployment/installer/agent/processmodule";
        let body = r#"{"revision":8,"properties":[{"section":"general","key":"k","value":"v"}]}"#;
        let (_tenant, addr, _trigger) = start(&[(path, 200, body)]).await;
        let pmc = client(addr, None)
            .get_process_module_config(7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pmc.revision, 8);
        assert_eq!(pmc.properties.len(), 1);
    }

    #[tokio::test]
    async fn connection_info() {
        let path = "/api/v1/deployment/installer/agent/connectioninfo";
        let body = r#"{"tenantUUID":"t1","tenantToken":"tok","communicationEndpoints":["https://a:443"]}"#;
        let (_tenant, addr, _trigger) = start(&[(path, 200, body)]).await;
        let ci = client(addr, None).get_connection_info().await.unwrap();
        assert_eq!(ci.tenant_uuid, "t1");
        assert_eq!(ci.tenant_token, "tok");
        assert_eq!(ci.communication_endpoints, vec!["https://a:443"]);
    }

    #[tokio::test]
    async fn installer_url_is_anonymous() {
        let (tenant, addr, _trigger) = start(&[("/direct/agent.zip", 200, "zip")]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("agent.zip");
        client(addr, None)
            .get_agent_via_installer_url(&format!("http://{addr}/direct/agent.zip"), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "zip");
        assert_eq!(tenant.seen.lock().unwrap()[0].1, None);
    }

    #[test]
    fn rejects_missing_credentials() {
        assert_matches!(
            HttpClient::new(ClientOptions {
                api_url: "https://t1.example/api".to_string(),
                ..Default::default()
            }),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn debug_hides_tokens() {
        let client = HttpClient::new(ClientOptions {
            api_url: "https://t1.example/api".to_string(),
            api_token: "secret-token".to_string(),
            ..Default::default()
        })
        .unwrap();
        let printed = format!("{client:?}");
        assert!(printed.contains("https://t1.example/api"));
        assert!(!printed.contains("secret-token"));
    }
}
