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

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use itertools::Itertools;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{Server, empty_response, plaintext_response};
use crate::readiness;

pub struct Service {
    s: Server<readiness::Ready>,
}

impl Service {
    pub async fn new(
        config: &Config,
        ready: readiness::Ready,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        Server::<readiness::Ready>::bind("readiness", config.readiness_addr, drain_rx, ready)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|ready, req| async move {
            match req.uri().path() {
                "/healthz/ready" => Ok(handle_ready(&ready, &req)),
                _ => Ok(empty_response(StatusCode::NOT_FOUND)),
            }
        })
    }
}

fn handle_ready<B>(ready: &readiness::Ready, req: &Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::GET => {
            let pending = ready.pending();
            if pending.is_empty() {
                return plaintext_response(StatusCode::OK, "ready\n".into());
            }
            plaintext_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "not ready, pending: {}\n",
                    pending.into_iter().sorted().join(", ")
                ),
            )
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn reports_sorted_pending_tasks() {
        let ready = readiness::Ready::new();
        let _a = ready.register_task("provisioner");
        let b = ready.register_task("csi server");
        let req = Request::get("/healthz/ready").body(()).unwrap();

        let resp = handle_ready(&ready, &req);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "not ready, pending: csi server, provisioner\n");

        drop(b);
        drop(_a);
        let resp = handle_ready(&ready, &req);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await, "ready\n");
    }

    #[test]
    fn rejects_other_methods() {
        let ready = readiness::Ready::new();
        let req = Request::post("/healthz/ready").body(()).unwrap();
        assert_eq!(
            handle_ready(&ready, &req).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
