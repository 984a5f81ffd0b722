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

//! CSI identity and node services.

pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("csi.v1");
}

mod app;
mod host;
mod identity;
pub mod mount;
mod node;
mod server;
pub mod volume;

pub use app::AppPublisher;
pub use host::HostPublisher;
pub use identity::IdentityService;
pub use mount::{Mounter, SystemMounter};
pub use node::NodeService;
pub use server::Server;

use async_trait::async_trait;
use tonic::Status;

use volume::{VolumeConfig, VolumeInfo};

/// Mounts and unmounts one kind of volume.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, cfg: &VolumeConfig) -> Result<(), Status>;

    async fn unpublish(&self, info: &VolumeInfo) -> Result<(), Status>;

    /// Whether this publisher owns the volume.
    async fn can_unpublish(&self, info: &VolumeInfo) -> Result<bool, Status>;
}

pub(crate) fn internal(what: &str, e: impl std::fmt::Display) -> Status {
    Status::internal(format!("{what}: {e}"))
}
