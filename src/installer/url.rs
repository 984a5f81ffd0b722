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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::extract::{create_current_symlink, extract_zip};
use super::{
    Error, Installer, IoContext, VERSION_LATEST, is_non_empty_dir, remove_dir_if_exists, ruxitconf,
    standalone_bin_dir,
};
use crate::dtclient::{AgentQuery, DynatraceClient};
use crate::metadata::RUXIT_CONF_FILE;
use crate::processmoduleconfig::ProcessModuleConfig;

/// What to download from the tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UrlProperties {
    pub query: AgentQuery,
    /// An exact version or [`VERSION_LATEST`].
    pub version: String,
    /// Overrides every other property when set.
    pub url: Option<String>,
}

/// Installs agents delivered as zip archives by the tenant.
pub struct UrlInstaller {
    client: Arc<dyn DynatraceClient>,
    props: UrlProperties,
    staging_dir: PathBuf,
}

impl UrlInstaller {
    pub fn new(client: Arc<dyn DynatraceClient>, props: UrlProperties, staging_dir: PathBuf) -> Self {
        UrlInstaller {
            client,
            props,
            staging_dir,
        }
    }

    async fn download(&self, dest: &Path) -> Result<(), Error> {
        let props = &self.props;
        if let Some(url) = props.url.as_deref().filter(|u| !u.is_empty()) {
            info!(url, "downloading OneAgent package using provided url");
            return self
                .client
                .get_agent_via_installer_url(url, dest)
                .await
                .map_err(Error::Download);
        }
        if props.version == VERSION_LATEST {
            info!(query=?props.query, "downloading latest OneAgent package");
            return self
                .client
                .get_latest_agent(&props.query, dest)
                .await
                .map_err(Error::Download);
        }
        info!(version = props.version, "downloading specific OneAgent package");
        let Err(source) = self.client.get_agent(&props.query, &props.version, dest).await else {
            return Ok(());
        };
        match self.client.get_agent_versions(&props.query).await {
            Ok(versions) => Err(Error::VersionUnavailable {
                source,
                available: versions.join(" , "),
            }),
            Err(_) => Err(Error::Download(source)),
        }
    }

    async fn install(&self, target_dir: &Path) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .context("failed to create", &self.staging_dir)?;
        let download = tempfile::Builder::new()
            .prefix("download")
            .tempfile_in(&self.staging_dir)
            .context("failed to create temporary file in", &self.staging_dir)?;
        let archive = download.path().to_path_buf();
        self.download(&archive).await?;

        let size = tokio::fs::metadata(&archive)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        info!(dest=%archive.display(), size, "saved OneAgent package");

        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            extract_zip(&archive, &target)?;
            create_current_symlink(&target)
        })
        .await??;
        info!(target=%target_dir.display(), "unzipped OneAgent package");
        // The temporary file is removed once `download` drops.
        drop(download);
        Ok(())
    }
}

#[async_trait]
impl Installer for UrlInstaller {
    async fn install_agent(&self, target_dir: &Path) -> Result<bool, Error> {
        if target_dir != standalone_bin_dir() && is_non_empty_dir(target_dir).await {
            info!(target=%target_dir.display(), "agent already installed");
            return Ok(false);
        }
        info!(target=%target_dir.display(), "installing agent");
        if let Err(e) = self.install(target_dir).await {
            if let Err(cleanup) = remove_dir_if_exists(target_dir).await {
                warn!("failed to clean up after failed install: {cleanup}");
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn update_process_module_config(
        &self,
        target_dir: &Path,
        config: &ProcessModuleConfig,
    ) -> Result<(), Error> {
        info!(version = self.props.version, "updating ruxitagentproc.conf");
        ruxitconf::update(target_dir, &target_dir.join(RUXIT_CONF_FILE), config).await
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;
    use crate::dtclient::{self, MockDynatraceClient};
    use crate::test_helpers::{agent_zip, zip_bytes};

    fn installer(client: MockDynatraceClient, version: &str, staging: &Path) -> UrlInstaller {
        UrlInstaller::new(
            Arc::new(client),
            UrlProperties {
                version: version.to_string(),
                ..Default::default()
            },
            staging.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn installs_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockDynatraceClient::new();
        client
            .expect_get_agent()
            .withf(|_, version, _| version.to_string() == "1.2.3.4-5")
            .times(1)
            .returning(|_, _, dest| {
                std::fs::write(dest, agent_zip("1.2.3.4-5")).unwrap();
                Ok(())
            });
        let target = dir.path().join("t1/bin/1.2.3.4-5");
        let inst = installer(client, "1.2.3.4-5", &dir.path().join("tmp_zip"));

        assert!(inst.install_agent(&target).await.unwrap());
        assert!(target.join("agent/conf/ruxitagentproc.conf").exists());
        assert_eq!(
            std::fs::read_link(target.join("agent/bin/current")).unwrap(),
            PathBuf::from("1.2.3.4-5")
        );
        // staging is empty again
        assert_eq!(
            std::fs::read_dir(dir.path().join("tmp_zip")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn existing_install_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin/1.2.3.4-5");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("marker"), "x").unwrap();
        // no expectations: any download panics
        let inst = installer(MockDynatraceClient::new(), "1.2.3.4-5", dir.path());
        assert!(!inst.install_agent(&target).await.unwrap());
    }

    #[tokio::test]
    async fn latest_uses_latest_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockDynatraceClient::new();
        client.expect_get_latest_agent().times(1).returning(|_, dest| {
            std::fs::write(dest, agent_zip("1.2.3.4-5")).unwrap();
            Ok(())
        });
        let inst = installer(client, VERSION_LATEST, dir.path());
        assert!(inst.install_agent(&dir.path().join("target")).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_url_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockDynatraceClient::new();
        client
            .expect_get_agent_via_installer_url()
            .withf(|url, _| url.to_string() == "https://example.com/agent.zip")
            .times(1)
            .returning(|_, dest| {
                std::fs::write(dest, agent_zip("1.2.3.4-5")).unwrap();
                Ok(())
            });
        let inst = UrlInstaller::new(
            Arc::new(client),
            UrlProperties {
                version: "1.2.3.4-5".to_string(),
                url: Some("https://example.com/agent.zip".to_string()),
                ..Default::default()
            },
            dir.path().to_path_buf(),
        );
        assert!(inst.install_agent(&dir.path().join("target")).await.unwrap());
    }

    #[tokio::test]
    async fn missing_version_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockDynatraceClient::new();
        client.expect_get_agent().returning(|_, _, _| {
            Err(dtclient::Error::Server {
                status: 404,
                message: "not found".to_string(),
            })
        });
        client
            .expect_get_agent_versions()
            .returning(|_| Ok(vec!["1.2-3".to_string(), "1.2-4".to_string()]));
        let target = dir.path().join("target");
        let err = installer(client, "9.9-9", dir.path())
            .install_agent(&target)
            .await
            .unwrap_err();
        assert_matches!(err, Error::VersionUnavailable { .. });
        assert!(
            err.to_string()
                .ends_with("available versions are: [ 1.2-3 , 1.2-4 ]"),
            "{err}"
        );
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn traversal_removes_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockDynatraceClient::new();
        client.expect_get_agent().returning(|_, _, dest| {
            std::fs::write(dest, zip_bytes(&[("ok.txt", "x"), ("../../etc/passwd", "root")]))
                .unwrap();
            Ok(())
        });
        let target = dir.path().join("a/b/target");
        let err = installer(client, "1.2-3", &dir.path().join("tmp"))
            .install_agent(&target)
            .await
            .unwrap_err();
        assert_matches!(err, Error::IllegalPath(_));
        assert!(!target.exists());
        assert!(!dir.path().join("etc/passwd").exists());
    }

    #[tokio::test]
    async fn renders_config_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join(RUXIT_CONF_FILE);
        std::fs::create_dir_all(conf.parent().unwrap()).unwrap();
        std::fs::write(&conf, "[general]\nkey old\n").unwrap();
        let inst = installer(MockDynatraceClient::new(), "1.2-3", dir.path());
        let config = ProcessModuleConfig::default().add_host_group("hg");
        inst.update_process_module_config(dir.path(), &config)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&conf).unwrap(),
            "[general]\nkey old\nhostGroup hg\n"
        );
    }
}
