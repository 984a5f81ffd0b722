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

use std::collections::HashMap;
use std::path::PathBuf;

use tonic::Status;

use super::proto::volume_capability::AccessType;
use super::proto::{NodePublishVolumeRequest, NodeUnpublishVolumeRequest};

pub const POD_NAME_ATTRIBUTE: &str = "csi.storage.k8s.io/pod.name";
pub const POD_NAMESPACE_ATTRIBUTE: &str = "csi.storage.k8s.io/pod.namespace";
pub const MODE_ATTRIBUTE: &str = "mode";
pub const DYNAKUBE_ATTRIBUTE: &str = "dynakube";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Per-pod application agent.
    App,
    /// Per-node host agent.
    Host,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s {
            "app" => Some(Mode::App),
            "host" => Some(Mode::Host),
            _ => None,
        }
    }
}

/// A validated publish request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeConfig {
    pub volume_id: String,
    pub target_path: PathBuf,
    pub pod_name: String,
    pub pod_namespace: String,
    pub mode: Mode,
    pub dynakube: String,
    pub readonly: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub target_path: PathBuf,
}

fn ids(volume_id: &str, target_path: &str) -> Result<VolumeInfo, Status> {
    if volume_id.is_empty() {
        return Err(Status::invalid_argument("Volume ID missing in request"));
    }
    if target_path.is_empty() {
        return Err(Status::invalid_argument("Target path missing in request"));
    }
    Ok(VolumeInfo {
        volume_id: volume_id.to_string(),
        target_path: PathBuf::from(target_path),
    })
}

fn attribute(ctx: &HashMap<String, String>, key: &str) -> Result<String, Status> {
    ctx.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Status::invalid_argument(format!("No {key} attribute in volume context")))
}

pub fn parse_publish_request(req: &NodePublishVolumeRequest) -> Result<VolumeConfig, Status> {
    let info = ids(&req.volume_id, &req.target_path)?;
    let capability = req
        .volume_capability
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;
    match capability.access_type {
        Some(AccessType::Mount(_)) => {}
        Some(AccessType::Block(_)) => {
            return Err(Status::invalid_argument("cannot have block access type"));
        }
        None => return Err(Status::invalid_argument("expecting to have mount access type")),
    }
    let ctx = &req.volume_context;
    if ctx.is_empty() {
        return Err(Status::invalid_argument("Publish context missing in request"));
    }
    let raw_mode = attribute(ctx, MODE_ATTRIBUTE)?;
    let mode = Mode::parse(&raw_mode).ok_or_else(|| {
        Status::invalid_argument(format!("unsupported {MODE_ATTRIBUTE} {raw_mode}"))
    })?;
    Ok(VolumeConfig {
        volume_id: info.volume_id,
        target_path: info.target_path,
        pod_name: attribute(ctx, POD_NAME_ATTRIBUTE)?,
        pod_namespace: attribute(ctx, POD_NAMESPACE_ATTRIBUTE)?,
        mode,
        dynakube: attribute(ctx, DYNAKUBE_ATTRIBUTE)?,
        readonly: req.readonly,
    })
}

pub fn parse_unpublish_request(req: &NodeUnpublishVolumeRequest) -> Result<VolumeInfo, Status> {
    ids(&req.volume_id, &req.target_path)
}
