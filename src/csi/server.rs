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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::Status;
use tonic::body::Body;
use tower::{Layer, Service};
use tracing::{error, info, warn};

use super::proto::identity_server::IdentityServer;
use super::proto::node_server::NodeServer;
use super::{IdentityService, NodeService};
use crate::config::Endpoint;
use crate::drain::DrainWatcher;
use crate::signal::ShutdownTrigger;

/// Admits at most a fixed number of in-flight calls and rejects the rest.
#[derive(Clone, Debug)]
pub struct RequestLimitLayer {
    permits: Arc<Semaphore>,
}

impl RequestLimitLayer {
    pub fn new(max_requests: usize) -> Self {
        RequestLimitLayer {
            permits: Arc::new(Semaphore::new(max_requests)),
        }
    }
}

impl<S> Layer<S> for RequestLimitLayer {
    type Service = RequestLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLimit {
            inner,
            permits: self.permits.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestLimit<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S, B> Service<http::Request<B>> for RequestLimit<S>
where
    S: Service<http::Request<B>, Response = http::Response<Body>>,
    S::Future: Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(path = req.uri().path(), "rejecting request, too many in flight");
            let status = Status::resource_exhausted("too many concurrent requests");
            return Box::pin(async move { Ok(status.into_http()) });
        };
        let call = self.inner.call(req);
        Box::pin(async move {
            let response = call.await;
            drop(permit);
            response
        })
    }
}

/// gRPC server for the CSI identity and node services on a unix socket.
pub struct Server {
    path: PathBuf,
    listener: UnixListener,
    drain_rx: DrainWatcher,
    identity: IdentityService,
    node: NodeService,
    max_requests: usize,
}

/// Removes a socket left behind by a previous run.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path=%path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Server {
    pub fn bind(
        endpoint: &Endpoint,
        drain_rx: DrainWatcher,
        identity: IdentityService,
        node: NodeService,
        max_requests: usize,
    ) -> anyhow::Result<Self> {
        let Endpoint::Unix(path) = endpoint;
        remove_stale_socket(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Server {
            path: path.clone(),
            listener,
            drain_rx,
            identity,
            node,
            max_requests,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves until a drain starts. A server failure shuts the process down.
    pub fn spawn(self, shutdown: ShutdownTrigger) {
        let Server {
            path,
            listener,
            drain_rx,
            identity,
            node,
            max_requests,
        } = self;
        info!(path=%path.display(), component="csi", "listener established");
        tokio::spawn(async move {
            let (blocker_tx, blocker_rx) = tokio::sync::oneshot::channel();
            let signal = async move {
                let blocker = drain_rx.wait_for_drain().await;
                let _ = blocker_tx.send(blocker);
            };
            let served = tonic::transport::Server::builder()
                .layer(RequestLimitLayer::new(max_requests))
                .add_service(IdentityServer::new(identity))
                .add_service(NodeServer::new(node))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal)
                .await;
            if let Err(e) = served {
                error!(component = "csi", "grpc server failed: {e}");
                shutdown.shutdown_now().await;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path=%path.display(), "failed to remove socket: {e}");
            }
            info!(component = "csi", "stopped listening");
            drop(blocker_rx);
        });
    }
}
