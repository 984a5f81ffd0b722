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

//! Archives, fakes and fixtures shared by unit and integration tests.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

pub mod kube;
pub mod mounter;
pub mod registry;
pub mod tenant;

pub use kube::FakeKube;
pub use mounter::{FakeMount, FakeMounter};
pub use registry::FakeRegistry;
pub use tenant::{FakeTenant, FakeTenantBuilder};

/// Builds a zip from `(name, content)` pairs. Names ending in `/` become directories.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Builds a gzip'd tar from `(name, content)` pairs.
pub fn tar_gz_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub const AGENT_CONF: &str = "[general]\nkey value\n\n[container]\nenabled true\n";

fn agent_entries(version: &str) -> Vec<(String, &'static str)> {
    vec![
        ("agent/conf/ruxitagentproc.conf".to_string(), AGENT_CONF),
        (format!("agent/bin/{version}/liboneagentproc.so"), "elf"),
        ("manifest.json".to_string(), "{}"),
    ]
}

/// A minimal agent package as served by the tenant.
pub fn agent_zip(version: &str) -> Vec<u8> {
    let entries = agent_entries(version);
    let borrowed: Vec<(&str, &str)> = entries.iter().map(|(n, c)| (n.as_str(), *c)).collect();
    zip_bytes(&borrowed)
}

/// A minimal code modules image layer.
pub fn agent_layer(version: &str) -> Vec<u8> {
    let entries = agent_entries(version);
    let borrowed: Vec<(&str, &str)> = entries.iter().map(|(n, c)| (n.as_str(), *c)).collect();
    tar_gz_bytes(&borrowed)
}

/// Connects a gRPC channel to a unix socket.
pub async fn uds_channel(path: &Path) -> tonic::transport::Channel {
    let path = path.to_path_buf();
    tonic::transport::Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(tower::service_fn(move |_: http::Uri| {
            let path = path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(::hyper_util::rt::TokioIo::new(stream))
            }
        }))
        .await
        .unwrap()
}
