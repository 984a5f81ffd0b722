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

use tokio::sync::{mpsc, watch};

/// New constructs a new pair for draining
/// * DrainTrigger starts a drain and waits until every watcher has released it.
/// * DrainWatcher is held by every long running component (gRPC server,
///   controller, tickers). It can be cloned; the drain completes only once all
///   clones and the blockers they produced are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            drained_rx,
            signal_tx,
        },
        DrainWatcher {
            drained_tx,
            signal_rx,
        },
    )
}

enum Never {}

pub struct DrainTrigger {
    drained_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DrainWatcher {
    drained_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<bool>,
}

/// DrainBlocker keeps the drain from completing until the holder has finished cleanup.
#[must_use = "DrainBlocker should be dropped explicitly to release the runtime"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>);

impl DrainTrigger {
    /// Signals all watchers and waits for every handle to be dropped.
    pub async fn start_drain_and_wait(mut self) {
        let _ = self.signal_tx.send(true);
        match self.drained_rx.recv().await {
            None => {}
            Some(n) => match n {},
        }
    }
}

impl DrainWatcher {
    /// Completes once a drain is signaled, returning a handle that must be
    /// dropped when the caller is done shutting down.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // A dropped trigger means nobody will wait on us; treat it as a drain.
        let _ = self.signal_rx.wait_for(|draining| *draining).await;
        DrainBlocker(self.drained_tx)
    }
}

impl std::fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}
