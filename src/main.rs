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

use anyhow::Context;
use oneagent_csi::app::Components;
use oneagent_csi::metadata::{PathResolver, Store};
use oneagent_csi::*;
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // A plain argv[1] switch is all the CLI the driver needs.
    let components = match std::env::args().nth(1).as_deref() {
        None | Some("driver") => Components::All,
        Some("server") => Components::Server,
        Some("provisioner") => Components::Provisioner,
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    let config = config::parse_config()?;
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&config)?);

    std::fs::create_dir_all(&config.root_dir)
        .with_context(|| format!("failed to create {}", config.root_dir.display()))?;
    let store = Arc::new(Store::open(
        &PathResolver::new(&config.root_dir).database_path(),
    )?);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            app::build(config, store, components)
                .await?
                .wait_termination()
                .await
        })
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Dynatrace OneAgent CSI driver ({version})

Commands:
driver (default) - Run the csi server, the provisioner and the garbage collector
server           - Run only the csi node server
provisioner      - Run only the provisioner and the garbage collector
version          - Print the version of the driver
help             - Print commands and version of the driver"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}
