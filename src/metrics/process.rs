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

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::drain::DrainWatcher;
use crate::metrics::Metrics;

const PROC_STAT_PATH: &str = "/proc/self/stat";
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Resident set size in pages, the 24th field of /proc/<pid>/stat.
fn parse_rss(contents: &str) -> Option<u64> {
    // The command name may contain spaces, so start after the last ')'.
    // Skipping pid and comm, rss is the 22nd remaining field.
    let start = contents.rfind(')')? + 2;
    contents.get(start..)?.split_whitespace().nth(21)?.parse().ok()
}

fn page_size() -> Option<u64> {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(s)) => s.try_into().ok(),
        Ok(None) => None,
        Err(e) => {
            warn!("failed to get page size: {e}");
            None
        }
    }
}

async fn sample(metrics: &Metrics, page_size: u64) {
    let contents = match tokio::fs::read_to_string(PROC_STAT_PATH).await {
        Ok(c) => c,
        Err(e) => {
            debug!("failed to read {PROC_STAT_PATH}: {e}");
            return;
        }
    };
    match parse_rss(&contents) {
        Some(rss) => {
            metrics
                .memory_usage_bytes
                .set((rss * page_size).try_into().unwrap_or(i64::MAX));
        }
        None => debug!("failed to parse {PROC_STAT_PATH}: {contents}"),
    }
}

/// Samples resident memory into `memory_usage_bytes` until a drain starts.
pub async fn run_memory_sampler(metrics: Arc<Metrics>, drain: DrainWatcher) {
    let Some(page_size) = page_size() else {
        warn!("page size unknown, memory usage will not be reported");
        return;
    };
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    let drained = drain.wait_for_drain();
    tokio::pin!(drained);
    loop {
        tokio::select! {
            _ = &mut drained => return,
            _ = ticker.tick() => sample(&metrics, page_size).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_from_stat_line() {
        let stat = "167211 (oneagent csi) S 55841 167211 55841 34817 167211 4194304 1133 0 0 0 2 1 0 0 20 0 1 0 6218712 3350528 844 18446744073709551615";
        assert_eq!(parse_rss(stat), Some(844));
        assert_eq!(parse_rss("garbage"), None);
    }
}
