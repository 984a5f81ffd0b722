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

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const KUBE_NODE_NAME: &str = "KUBE_NODE_NAME";
const CSI_ENDPOINT: &str = "CSI_ENDPOINT";
const CSI_DATA_DIR: &str = "CSI_DATA_DIR";
const POD_NAMESPACE: &str = "POD_NAMESPACE";
const MAX_UNMOUNTED_VOLUME_AGE: &str = "MAX_UNMOUNTED_VOLUME_AGE";
const MAX_RECONCILES_DOWNLOADS: &str = "MAX_RECONCILES_DOWNLOADS";
const GRPC_MAX_REQUESTS_LIMIT: &str = "GRPC_MAX_REQUESTS_LIMIT";
const GC_INTERVAL: &str = "GC_INTERVAL";
const METRICS_ADDR: &str = "METRICS_ADDR";
const READINESS_ADDR: &str = "READINESS_ADDR";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";

/// Name the driver registers with the kubelet.
pub const DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";
const DEFAULT_ROOT_DIR: &str = "/data";
const DEFAULT_NAMESPACE: &str = "dynatrace";
const DEFAULT_MAX_UNMOUNTED_VOLUME_AGE_DAYS: i64 = 7;
const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 5;
const MAX_PARALLEL_DOWNLOADS_LIMIT: usize = 40;
const DEFAULT_GRPC_MAX_REQUESTS: usize = 20;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_READINESS_PORT: u16 = 10080;
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Where the gRPC server listens. Node plugins only ever serve on a unix socket.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        let parsed = url::Url::parse(s).map_err(|e| e.to_string())?;
        match parsed.scheme() {
            "unix" => {
                // unix://relative/path puts the first segment into the host
                let path = match parsed.host_str() {
                    Some(host) => format!("{host}{}", parsed.path()),
                    None => parsed.path().to_string(),
                };
                if path.is_empty() {
                    return Err("empty socket path".to_string());
                }
                Ok(Endpoint::Unix(PathBuf::from(path)))
            }
            other => Err(format!("unsupported endpoint scheme {other}")),
        }
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Node name reported through NodeGetInfo.
    pub node_id: Option<String>,
    pub endpoint: Endpoint,
    /// Root of the on-disk agent tree and the metadata database.
    pub root_dir: PathBuf,
    /// Namespace holding the DynaKubes, their secrets and the pods using the driver.
    pub namespace: String,

    /// Age after which an unmounted run directory is removed. None disables the pass.
    pub max_unmounted_volume_age: Option<Duration>,
    /// Concurrent agent installs. Zero means unbounded.
    pub max_parallel_downloads: usize,
    /// Concurrent CSI calls admitted by the request limiter.
    pub grpc_max_requests: usize,
    pub gc_interval: Duration,

    pub metrics_addr: SocketAddr,
    pub readiness_addr: SocketAddr,
    pub termination_grace_period: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("invalid endpoint {0}: {1}")]
    Endpoint(String, String),
}

/// HumanDuration parses values such as `90s`, `10m` or `1h30m`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(HumanDuration)
    }
}

/// Source of configuration values, keyed by environment variable name.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, key).cloned()
    }
}

fn parse<T: FromStr>(env: &dyn EnvSource, key: &str) -> Result<Option<T>, Error> {
    match env.get(key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &dyn EnvSource, key: &str, default: T) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(&ProcessEnv)
}

pub fn construct_config(env: &dyn EnvSource) -> Result<Config, Error> {
    let endpoint_raw =
        empty_to_none(env.get(CSI_ENDPOINT)).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let endpoint = endpoint_raw
        .parse()
        .map_err(|e| Error::Endpoint(endpoint_raw.clone(), e))?;

    Ok(Config {
        node_id: empty_to_none(parse(env, KUBE_NODE_NAME)?),
        endpoint,
        root_dir: parse_default(env, CSI_DATA_DIR, PathBuf::from(DEFAULT_ROOT_DIR))?,
        namespace: empty_to_none(parse(env, POD_NAMESPACE)?)
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),

        max_unmounted_volume_age: unmounted_volume_age(parse_default(
            env,
            MAX_UNMOUNTED_VOLUME_AGE,
            DEFAULT_MAX_UNMOUNTED_VOLUME_AGE_DAYS,
        )?),
        max_parallel_downloads: max_parallel_downloads(parse(env, MAX_RECONCILES_DOWNLOADS)?),
        grpc_max_requests: parse_default(env, GRPC_MAX_REQUESTS_LIMIT, DEFAULT_GRPC_MAX_REQUESTS)?,
        gc_interval: parse(env, GC_INTERVAL)?
            .map(|d: HumanDuration| d.0)
            .unwrap_or(DEFAULT_GC_INTERVAL),

        metrics_addr: parse_default(
            env,
            METRICS_ADDR,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_METRICS_PORT),
        )?,
        readiness_addr: parse_default(
            env,
            READINESS_ADDR,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_READINESS_PORT),
        )?,
        termination_grace_period: parse(env, TERMINATION_GRACE_PERIOD)?
            .map(|d: HumanDuration| d.0)
            .unwrap_or(DEFAULT_DRAIN_DURATION),
    })
}

fn unmounted_volume_age(days: i64) -> Option<Duration> {
    if days <= 0 {
        return None;
    }
    Some(Duration::from_secs(days as u64 * SECONDS_PER_DAY))
}

fn max_parallel_downloads(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_MAX_PARALLEL_DOWNLOADS,
        Some(n) if (0..=MAX_PARALLEL_DOWNLOADS_LIMIT as i64).contains(&n) => n as usize,
        Some(n) => {
            warn!(
                "{MAX_RECONCILES_DOWNLOADS}={n} is outside 0..={MAX_PARALLEL_DOWNLOADS_LIMIT}, using {DEFAULT_MAX_PARALLEL_DOWNLOADS}"
            );
            DEFAULT_MAX_PARALLEL_DOWNLOADS
        }
    }
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}
