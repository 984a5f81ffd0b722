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
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::time;
use tracing::{Instrument, info, warn};

use crate::config::Config;
use crate::csi::{AppPublisher, HostPublisher, IdentityService, NodeService, SystemMounter};
use crate::drain::{DrainTrigger, DrainWatcher};
use crate::dtclient::HttpClientBuilder;
use crate::gc::GarbageCollector;
use crate::k8s::KubeApi;
use crate::metadata::{PathResolver, Store};
use crate::metrics::Metrics;
use crate::provisioner::Provisioner;
use crate::readiness::BlockReady;
use crate::version::BuildInfo;
use crate::{csi, drain, metrics, readiness, signal};

/// Which parts of the driver run in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Components {
    /// CSI server, provisioner and sweeps.
    All,
    Server,
    Provisioner,
}

impl Components {
    fn server(self) -> bool {
        matches!(self, Components::All | Components::Server)
    }

    fn provisioner(self) -> bool {
        matches!(self, Components::All | Components::Provisioner)
    }
}

pub async fn build(
    config: Config,
    store: Arc<Store>,
    components: Components,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));
    let path = PathResolver::new(&config.root_dir);

    let shutdown = signal::Shutdown::new();
    // Every long running component holds a watcher; the drain completes once all are dropped.
    let (drain_tx, drain_rx) = drain::new();

    let ready = readiness::Ready::new();
    let store_task = ready.register_task("metadata store");
    let csi_task = components
        .server()
        .then(|| ready.register_task("csi server"));
    let provisioner_task = components
        .provisioner()
        .then(|| ready.register_task("provisioner"));

    let readiness_server = readiness::Service::new(&config, ready, drain_rx.clone())
        .await
        .context("readiness server starts")?;
    let metrics_server = metrics::Server::new(&config, drain_rx.clone(), registry)
        .await
        .context("metrics server starts")?;
    let readiness_address = readiness_server.address();
    let metrics_address = metrics_server.address();
    readiness_server.spawn();
    metrics_server.spawn();

    store
        .get_all_dynakubes()
        .context("metadata store is not readable")?;
    drop(store_task);

    let csi_socket = match csi_task {
        Some(task) => Some(start_csi_server(
            &config,
            store.clone(),
            path.clone(),
            metrics.clone(),
            shutdown.trigger(),
            drain_rx.clone(),
            task,
        )?),
        None => None,
    };

    if let Some(task) = provisioner_task {
        start_provisioner(&config, store, path, metrics.clone(), drain_rx.clone(), task).await?;
    }

    tokio::spawn(metrics::process::run_memory_sampler(metrics, drain_rx).in_current_span());

    Ok(Bound {
        readiness_address,
        metrics_address,
        csi_socket,
        shutdown,
        termination_grace_period: config.termination_grace_period,
        drain_tx,
    })
}

fn start_csi_server(
    config: &Config,
    store: Arc<Store>,
    path: PathResolver,
    metrics: Arc<Metrics>,
    shutdown: signal::ShutdownTrigger,
    drain_rx: DrainWatcher,
    task: BlockReady,
) -> anyhow::Result<PathBuf> {
    let node_id = config
        .node_id
        .clone()
        .context("KUBE_NODE_NAME must be set to run the csi server")?;
    let mounter = Arc::new(SystemMounter);
    let app = AppPublisher::new(store.clone(), path.clone(), mounter.clone(), metrics);
    let host = HostPublisher::new(store, path, mounter.clone());
    let node = NodeService::new(node_id, Arc::new(app), Arc::new(host), mounter);
    let server = csi::Server::bind(
        &config.endpoint,
        drain_rx,
        IdentityService::new(&BuildInfo::new()),
        node,
        config.grpc_max_requests,
    )
    .context("csi server starts")?;
    let socket = server.path().to_path_buf();
    server.spawn(shutdown);
    drop(task);
    Ok(socket)
}

async fn start_provisioner(
    config: &Config,
    store: Arc<Store>,
    path: PathResolver,
    metrics: Arc<Metrics>,
    drain_rx: DrainWatcher,
    task: BlockReady,
) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("kubernetes client")?;
    let kube = Arc::new(KubeApi::new(client, &config.namespace));
    let gc = Arc::new(GarbageCollector::new(
        store.clone(),
        path.clone(),
        kube.clone(),
        metrics.clone(),
        config.max_unmounted_volume_age,
    ));
    let provisioner = Arc::new(Provisioner::new(
        store,
        path,
        kube.clone(),
        Arc::new(HttpClientBuilder),
        gc.clone(),
        metrics,
        config.max_parallel_downloads,
    ));
    tokio::spawn(
        gc.run_periodic(config.gc_interval, drain_rx.clone())
            .in_current_span(),
    );
    tokio::spawn(
        provisioner
            .run(kube.dynakubes(), drain_rx)
            .in_current_span(),
    );
    drop(task);
    Ok(())
}

pub struct Bound {
    pub readiness_address: SocketAddr,
    pub metrics_address: SocketAddr,
    /// Socket of the CSI server, when it runs in this process.
    pub csi_socket: Option<PathBuf>,

    pub shutdown: signal::Shutdown,
    termination_grace_period: std::time::Duration,
    drain_tx: DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        self.shutdown.wait().await;

        // Components exit once they see the drain; give up after the grace period.
        match time::timeout(
            self.termination_grace_period,
            self.drain_tx.start_drain_and_wait(),
        )
        .await
        {
            Ok(()) => info!("shutdown completed gracefully"),
            Err(_) => warn!(
                "graceful shutdown did not complete in {:?}, terminating now",
                self.termination_grace_period
            ),
        }
        Ok(())
    }
}
