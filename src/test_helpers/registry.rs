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
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::StatusCode;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::drain::{self, DrainTrigger};
use crate::hyper_util::{Server, empty_response};
use crate::installer::image::{MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST};

type Blobs = HashMap<String, (String, Bytes)>;

/// OCI registry serving one `codemodules` image over plain http. Stops when dropped.
pub struct FakeRegistry {
    address: SocketAddr,
    digest: String,
    _drain: DrainTrigger,
}

fn insert(blobs: &mut Blobs, content_type: &str, data: Vec<u8>) -> String {
    let digest = format!("sha256:{:x}", Sha256::digest(&data));
    blobs.insert(digest.clone(), (content_type.to_string(), Bytes::from(data)));
    digest
}

impl FakeRegistry {
    /// Serves an image manifest listing `(media type, blob)` layers.
    pub async fn start(layers: Vec<(String, Vec<u8>)>) -> Self {
        Self::serve(layers, false).await
    }

    /// Same as [`FakeRegistry::start`], wrapped in an image index.
    pub async fn start_index(layers: Vec<(String, Vec<u8>)>) -> Self {
        Self::serve(layers, true).await
    }

    async fn serve(layers: Vec<(String, Vec<u8>)>, index: bool) -> Self {
        let mut blobs = Blobs::new();
        let descriptors: Vec<serde_json::Value> = layers
            .into_iter()
            .map(|(media_type, data)| {
                let size = data.len();
                let digest = insert(&mut blobs, "application/octet-stream", data);
                json!({"mediaType": media_type, "digest": digest, "size": size})
            })
            .collect();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "layers": descriptors,
        });
        let mut digest = insert(
            &mut blobs,
            MEDIA_TYPE_OCI_MANIFEST,
            serde_json::to_vec(&manifest).unwrap(),
        );
        if index {
            let index = json!({
                "schemaVersion": 2,
                "mediaType": MEDIA_TYPE_OCI_INDEX,
                "manifests": [{"mediaType": MEDIA_TYPE_OCI_MANIFEST, "digest": digest}],
            });
            digest = insert(
                &mut blobs,
                MEDIA_TYPE_OCI_INDEX,
                serde_json::to_vec(&index).unwrap(),
            );
        }

        let (trigger, watcher) = drain::new();
        let server = Server::bind(
            "registry",
            "127.0.0.1:0".parse().unwrap(),
            watcher,
            Arc::new(blobs),
        )
        .await
        .unwrap();
        let address = server.address();
        server.spawn(|blobs, req| async move {
            let digest = req.uri().path().rsplit('/').next().unwrap_or_default();
            let response = match blobs.get(digest) {
                Some((content_type, data)) => hyper::Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, content_type.as_str())
                    .body(data.clone().into())
                    .unwrap(),
                None => empty_response(StatusCode::NOT_FOUND),
            };
            Ok(response)
        });
        FakeRegistry {
            address,
            digest,
            _drain: trigger,
        }
    }

    pub fn host(&self) -> String {
        self.address.to_string()
    }

    pub fn image(&self) -> String {
        format!("{}/codemodules@{}", self.host(), self.digest)
    }

    pub fn digest_hex(&self) -> String {
        self.digest.trim_start_matches("sha256:").to_string()
    }
}
