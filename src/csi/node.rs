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

use tonic::{Request, Response, Status};
use tracing::{Instrument, info_span, warn};

use super::mount::Mounter;
use super::proto::node_server::Node;
use super::proto::{
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
};
use super::volume::{self, Mode, VolumeInfo};
use super::{Publisher, internal};

/// CSI node service, dispatching to the app or host publisher.
pub struct NodeService {
    node_id: String,
    app: Arc<dyn Publisher>,
    host: Arc<dyn Publisher>,
    mounter: Arc<dyn Mounter>,
}

impl NodeService {
    pub fn new(
        node_id: String,
        app: Arc<dyn Publisher>,
        host: Arc<dyn Publisher>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        NodeService {
            node_id,
            app,
            host,
            mounter,
        }
    }

    async fn unpublish(&self, info: &VolumeInfo) -> Result<(), Status> {
        for publisher in [&self.app, &self.host] {
            if publisher.can_unpublish(info).await? {
                return publisher.unpublish(info).await;
            }
        }
        // Not ours any more, still make sure the kubelet can clean up.
        if let Err(e) = self.mounter.unmount(&info.target_path) {
            warn!("unmount failed: {e}");
        }
        match std::fs::remove_dir_all(&info.target_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(internal("failed to remove target path", e)),
        }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let cfg = volume::parse_publish_request(request.get_ref())?;
        let span = info_span!(
            "publish",
            volume_id = cfg.volume_id,
            target_path = %cfg.target_path.display(),
            dynakube = cfg.dynakube,
        );
        async {
            let mounted = self
                .mounter
                .is_mount_point(&cfg.target_path)
                .map_err(|e| internal("failed to inspect target path", e))?;
            if mounted {
                return Ok(Response::new(NodePublishVolumeResponse {}));
            }
            match cfg.mode {
                Mode::App => self.app.publish(&cfg).await?,
                Mode::Host => self.host.publish(&cfg).await?,
            }
            Ok::<_, Status>(Response::new(NodePublishVolumeResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let info = volume::parse_unpublish_request(request.get_ref())?;
        let span = info_span!(
            "unpublish",
            volume_id = info.volume_id,
            target_path = %info.target_path.display(),
        );
        self.unpublish(&info).instrument(span).await?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse::default()))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tonic::Code;

    use super::*;
    use crate::csi::proto::VolumeCapability;
    use crate::csi::proto::volume_capability::{AccessType, MountVolume};
    use crate::csi::{AppPublisher, HostPublisher};
    use crate::metadata::{self, PathResolver, Store};
    use crate::metrics::Metrics;
    use crate::test_helpers::FakeMounter;

    struct Fixture {
        root: tempfile::TempDir,
        store: Arc<Store>,
        mounter: Arc<FakeMounter>,
        node: NodeService,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mounter = Arc::new(FakeMounter::default());
        let path = PathResolver::new(root.path());
        let app = AppPublisher::new(
            store.clone(),
            path.clone(),
            mounter.clone(),
            Arc::new(Metrics::default()),
        );
        let host = HostPublisher::new(store.clone(), path, mounter.clone());
        let node = NodeService::new(
            "node-1".to_string(),
            Arc::new(app),
            Arc::new(host),
            mounter.clone(),
        );
        Fixture {
            root,
            store,
            mounter,
            node,
        }
    }

    fn publish_request(f: &Fixture, mode: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "v1".to_string(),
            target_path: f.root.path().join("target").display().to_string(),
            volume_capability: Some(VolumeCapability {
                access_type: Some(AccessType::Mount(MountVolume::default())),
                access_mode: None,
            }),
            volume_context: HashMap::from([
                (volume::POD_NAME_ATTRIBUTE.to_string(), "p1".to_string()),
                (volume::POD_NAMESPACE_ATTRIBUTE.to_string(), "ns".to_string()),
                (volume::MODE_ATTRIBUTE.to_string(), mode.to_string()),
                (volume::DYNAKUBE_ATTRIBUTE.to_string(), "dk".to_string()),
            ]),
            ..Default::default()
        }
    }

    fn unpublish_request(f: &Fixture) -> NodeUnpublishVolumeRequest {
        NodeUnpublishVolumeRequest {
            volume_id: "v1".to_string(),
            target_path: f.root.path().join("target").display().to_string(),
        }
    }

    fn installed_dynakube(store: &Store) {
        let mut dk = metadata::DynaKube::new("dk", "t1");
        dk.latest_version = "1.2-3".to_string();
        store.insert_dynakube(&dk).unwrap();
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let f = fixture();
        installed_dynakube(&f.store);
        f.node
            .node_publish_volume(Request::new(publish_request(&f, "app")))
            .await
            .unwrap();
        assert_eq!(f.mounter.mounts().len(), 2);

        f.node
            .node_publish_volume(Request::new(publish_request(&f, "app")))
            .await
            .unwrap();
        assert_eq!(f.mounter.mounts().len(), 2);
    }

    #[tokio::test]
    async fn dispatches_unpublish_by_record() {
        let f = fixture();
        installed_dynakube(&f.store);
        f.node
            .node_publish_volume(Request::new(publish_request(&f, "host")))
            .await
            .unwrap();
        assert!(f.store.get_volume("v1").unwrap().is_none());

        f.node
            .node_unpublish_volume(Request::new(unpublish_request(&f)))
            .await
            .unwrap();
        let record = f.store.get_host_volume_by_volume_id("v1").unwrap().unwrap();
        assert!(!record.mounted);
        assert!(f.mounter.mounts().is_empty());
    }

    #[tokio::test]
    async fn unknown_volume_unpublishes() {
        let f = fixture();
        std::fs::create_dir_all(f.root.path().join("target")).unwrap();
        f.node
            .node_unpublish_volume(Request::new(unpublish_request(&f)))
            .await
            .unwrap();
        assert!(!f.root.path().join("target").exists());
    }

    #[tokio::test]
    async fn staging_is_unimplemented() {
        let f = fixture();
        let err = f
            .node
            .node_stage_volume(Request::new(NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        let info = f
            .node
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-1");
    }
}
