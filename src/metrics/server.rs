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

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util;

pub struct Server {
    s: hyper_util::Server<Arc<Mutex<Registry>>>,
}

impl Server {
    pub async fn new(
        config: &Config,
        drain_rx: DrainWatcher,
        registry: Registry,
    ) -> anyhow::Result<Self> {
        hyper_util::Server::<Arc<Mutex<Registry>>>::bind(
            "metrics",
            config.metrics_addr,
            drain_rx,
            Arc::new(Mutex::new(registry)),
        )
        .await
        .map(|s| Server { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|registry, req| async move {
            match req.uri().path() {
                "/metrics" => Ok(handle_metrics(&registry, &req)),
                _ => Ok(hyper_util::empty_response(StatusCode::NOT_FOUND)),
            }
        })
    }
}

fn handle_metrics<B>(reg: &Mutex<Registry>, req: &Request<B>) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    let reg = reg.lock().unwrap();
    if let Err(err) = encode(&mut buf, &reg) {
        return hyper_util::plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type(req))
        .body(buf.into())
        .unwrap_or_default()
}

#[derive(Default)]
enum ContentType {
    #[default]
    PlainText,
    OpenMetrics,
}

impl From<ContentType> for &str {
    fn from(c: ContentType) -> Self {
        match c {
            ContentType::PlainText => "text/plain; charset=utf-8",
            ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
        }
    }
}

fn content_type<T>(req: &Request<T>) -> &'static str {
    req.headers()
        .get_all(http::header::ACCEPT)
        .iter()
        .find_map(|v| {
            let media = v.to_str().unwrap_or_default().to_lowercase();
            match media.split(';').next().map(str::trim) {
                Some("application/openmetrics-text") => Some(ContentType::OpenMetrics),
                _ => None,
            }
        })
        .unwrap_or_default()
        .into()
}
