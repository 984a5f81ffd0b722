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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::drain::DrainWatcher;

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .unwrap_or_default()
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .unwrap_or_default()
}

/// Server implements a generic HTTP/1 server with the follow behavior:
/// * Binds eagerly, so the caller can learn the address before spawning.
/// * Stops accepting connections once a drain starts.
/// * Hands a clone of the shared state to every request.
pub struct Server<S> {
    name: String,
    address: SocketAddr,
    listener: TcpListener,
    drain_rx: DrainWatcher,
    state: S,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        state: S,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            address,
            listener,
            drain_rx,
            state,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
    {
        let address = self.address();
        let name = self.name.clone();
        info!(%address, component=name, "listener established");
        let Server {
            listener,
            drain_rx,
            state,
            ..
        } = self;
        let f = Arc::new(f);
        tokio::spawn(async move {
            let drained = drain_rx.wait_for_drain();
            tokio::pin!(drained);
            loop {
                tokio::select! {
                    blocker = &mut drained => {
                        info!(component=name, "stopped listening");
                        drop(blocker);
                        return;
                    }
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok((stream, _)) => stream,
                            Err(e) => {
                                warn!(component=name, "accept failed: {e}");
                                continue;
                            }
                        };
                        let f = f.clone();
                        let state = state.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            let svc = service_fn(move |req| {
                                let state = state.clone();
                                let f = f.clone();
                                async move { f(state, req).await }
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), svc)
                                .await
                            {
                                debug!(component=name, "connection closed with error: {e}");
                            }
                        });
                    }
                }
            }
        });
    }
}
