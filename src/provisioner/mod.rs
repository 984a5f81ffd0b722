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

//! Reconciles DynaKubes into installed code modules on this node.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kube::ResourceExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::watcher;
use kube::Api;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::crd::{DynaKube, InvalidApiUrl};
use crate::drain::DrainWatcher;
use crate::dtclient::{self, AgentQuery, ClientBuilder, ClientOptions, DynatraceClient};
use crate::gc::GarbageCollector;
use crate::installer::image::ImageProperties;
use crate::installer::{self, ImageInstaller, ImageReference, Installer, UrlInstaller, UrlProperties};
use crate::k8s::{self, KubeClient, REASON_FAILED_INSTALL, REASON_INSTALL};
use crate::metadata::{self, PathResolver, Store};
use crate::metrics::{InstallOutcome, Metrics};
use crate::processmoduleconfig::{ProcessModuleConfig, ProcessModuleConfigCache};

pub mod credentials;

/// Status not populated yet, or downloads saturated.
pub const SHORT_REQUEUE: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Nothing to do for this DynaKube on this node.
pub const LONG_REQUEUE: Duration = Duration::from_secs(30 * 60);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Metadata(#[from] metadata::Error),
    #[error(transparent)]
    Kube(#[from] k8s::Error),
    #[error(transparent)]
    TenantUuid(#[from] InvalidApiUrl),
    #[error("secret {0} not found")]
    MissingSecret(String),
    #[error("config map {0} not found")]
    MissingConfigMap(String),
    #[error("{object} has no {key} entry")]
    MissingKey { object: String, key: String },
    #[error("invalid pull secret {0}: {1}")]
    PullSecret(String, #[source] serde_json::Error),
    #[error("failed to create dynatrace client: {0}")]
    Client(#[source] dtclient::Error),
    #[error("failed to fetch process module config: {0}")]
    ProcessModuleConfig(#[source] dtclient::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Releases the install slot of a DynaKube when dropped.
struct InstallSlot<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    name: String,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for InstallSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().remove(&self.name);
    }
}

pub struct Provisioner {
    store: Arc<Store>,
    path: PathResolver,
    kube: Arc<dyn KubeClient>,
    client_builder: Arc<dyn ClientBuilder>,
    gc: Arc<GarbageCollector>,
    metrics: Arc<Metrics>,
    /// None when downloads are unbounded.
    downloads: Option<Arc<Semaphore>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Provisioner {
    pub fn new(
        store: Arc<Store>,
        path: PathResolver,
        kube: Arc<dyn KubeClient>,
        client_builder: Arc<dyn ClientBuilder>,
        gc: Arc<GarbageCollector>,
        metrics: Arc<Metrics>,
        max_parallel_downloads: usize,
    ) -> Self {
        Provisioner {
            store,
            path,
            kube,
            client_builder,
            gc,
            metrics,
            downloads: (max_parallel_downloads > 0)
                .then(|| Arc::new(Semaphore::new(max_parallel_downloads))),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Watches DynaKubes and reconciles them until a drain starts.
    pub async fn run(self: Arc<Self>, api: Api<DynaKube>, drain: DrainWatcher) {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let watch_drain = drain.clone();
        tokio::spawn(async move {
            let blocker = watch_drain.wait_for_drain().await;
            let _ = stop_tx.send(());
            drop(blocker);
        });
        info!("starting provisioner");
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(stop_rx.map(|_| ()))
            .run(reconcile, error_policy, self)
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => debug!(dynakube = obj.name, ?action, "reconciled"),
                    Err(e) => warn!("reconcile failed: {e}"),
                }
            })
            .await;
        info!("provisioner stopped");
        drop(drain);
    }

    /// Drives the named DynaKube towards an installed agent and returns when to look again.
    pub async fn reconcile(&self, name: &str) -> Result<Duration, Error> {
        let Some(dk) = self.kube.get_dynakube(name).await? else {
            info!("dynakube not found, removing its record");
            self.store.delete_dynakube(name)?;
            return Ok(LONG_REQUEUE);
        };
        if !dk.needs_csi_driver() {
            info!("csi driver not needed");
            self.store.delete_dynakube(name)?;
            return Ok(LONG_REQUEUE);
        }

        let tenant_uuid = dk.tenant_uuid()?;
        self.create_tenant_dirs(&tenant_uuid).await?;
        if !dk.needs_app_injection() {
            debug!("app injection not needed");
            return Ok(LONG_REQUEUE);
        }

        let stored = self.store.get_dynakube(name)?;
        let mut record = stored
            .clone()
            .unwrap_or_else(|| metadata::DynaKube::new(name, &tenant_uuid));
        record.tenant_uuid = tenant_uuid.clone();
        record.max_failed_mount_attempts = dk.max_failed_mount_attempts();
        // Written before installing so host volumes can mount while the agent downloads.
        self.create_or_update(stored.as_ref(), &record)?;
        let stored = Some(record.clone());

        let image = dk.code_modules_image();
        let version = dk.code_modules_version();
        if image.is_empty() && version.is_empty() {
            info!("code modules version and image not set yet");
            return Ok(SHORT_REQUEUE);
        }

        let Some(_slot) = self.acquire_install_slot(name) else {
            return Ok(SHORT_REQUEUE);
        };

        let opts = credentials::client_options(self.kube.as_ref(), &dk).await?;
        let client = self
            .client_builder
            .build(opts.clone())
            .map_err(Error::Client)?;
        let config = self
            .process_module_config(client.as_ref(), &dk, &tenant_uuid, opts.proxy.as_deref())
            .await?;
        let cache = ProcessModuleConfigCache::new(config);
        let stored_hash = ProcessModuleConfigCache::load(&self.path.revision_file(&tenant_uuid))
            .await
            .map(|c| c.hash);

        let installed = if image.is_empty() {
            let target = self.path.agent_binary_dir_for_version(&tenant_uuid, &version);
            self.install_from_url(client, &dk, &version, &target, &cache, stored_hash.as_deref())
                .await
        } else {
            self.install_from_image(&dk, &image, &tenant_uuid, &opts, &cache, stored_hash.as_deref())
                .await
        };
        match installed {
            Ok(Installed::Version(v)) => {
                record.latest_version = v;
                record.image_digest.clear();
            }
            Ok(Installed::Image(digest)) => {
                record.image_digest = digest;
                record.latest_version.clear();
            }
            Err(e) => {
                warn!("failed to install agent: {e}");
                self.metrics.record_install(InstallOutcome::failure);
                self.kube
                    .publish_event(
                        &dk,
                        EventType::Warning,
                        REASON_FAILED_INSTALL,
                        format!("Failed to install agent: {e}"),
                    )
                    .await;
                // Not an error: an immediate retry would hammer the tenant.
                return Ok(DEFAULT_REQUEUE);
            }
        }

        self.create_or_update(stored.as_ref(), &record)?;
        let revision_file = self.path.revision_file(&tenant_uuid);
        cache.store(&revision_file).await.map_err(|e| Error::Io {
            context: format!("failed to write {}", revision_file.display()),
            source: e,
        })?;

        if let Err(e) = self.gc.run(&dk, &record).await {
            warn!("garbage collection failed: {e}");
        }
        Ok(DEFAULT_REQUEUE)
    }

    fn create_or_update(
        &self,
        old: Option<&metadata::DynaKube>,
        record: &metadata::DynaKube,
    ) -> Result<(), Error> {
        match old {
            None => {
                info!(tenant = record.tenant_uuid, "adding dynakube record");
                self.store.insert_dynakube(record)?;
            }
            Some(old) if old != record => {
                info!(
                    old_version = old.latest_version,
                    new_version = record.latest_version,
                    old_digest = old.image_digest,
                    new_digest = record.image_digest,
                    "updating dynakube record"
                );
                self.store.update_dynakube(record)?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn create_tenant_dirs(&self, tenant_uuid: &str) -> Result<(), Error> {
        let bin = self.path.agent_bin_dir(tenant_uuid);
        tokio::fs::create_dir_all(&bin)
            .await
            .map_err(|e| Error::Io {
                context: format!("failed to create {}", bin.display()),
                source: e,
            })
    }

    fn acquire_install_slot(&self, name: &str) -> Option<InstallSlot<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains(name) {
            info!("install already in progress");
            return None;
        }
        let permit = match &self.downloads {
            Some(downloads) => match downloads.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    info!("max parallel downloads reached");
                    return None;
                }
            },
            None => None,
        };
        in_flight.insert(name.to_string());
        Some(InstallSlot {
            in_flight: &self.in_flight,
            name: name.to_string(),
            _permit: permit,
        })
    }

    /// Latest config from the tenant, or the cached one when unchanged, completed with
    /// the host group, connection info and proxy of the DynaKube.
    async fn process_module_config(
        &self,
        client: &dyn DynatraceClient,
        dk: &DynaKube,
        tenant_uuid: &str,
        proxy: Option<&str>,
    ) -> Result<ProcessModuleConfig, Error> {
        let cached = ProcessModuleConfigCache::load(&self.path.revision_file(tenant_uuid))
            .await
            .map(|c| c.process_module_config);
        let revision = cached.as_ref().map(|c| c.revision).unwrap_or_default();
        let latest = match client
            .get_process_module_config(revision)
            .await
            .map_err(Error::ProcessModuleConfig)?
        {
            Some(latest) => latest,
            None => {
                debug!(revision, "process module config unchanged");
                cached.unwrap_or_default()
            }
        };
        let info = client
            .get_connection_info()
            .await
            .map_err(Error::ProcessModuleConfig)?;
        let mut config = latest
            .add_host_group(&dk.host_group())
            .add_connection_info(&info, &info.tenant_token);
        if dk.has_proxy() {
            config = config.add_proxy(proxy.unwrap_or_default());
        }
        Ok(config)
    }

    async fn install_from_url(
        &self,
        client: Arc<dyn DynatraceClient>,
        dk: &DynaKube,
        version: &str,
        target: &Path,
        cache: &ProcessModuleConfigCache,
        stored_hash: Option<&str>,
    ) -> Result<Installed, installer::Error> {
        let installer = UrlInstaller::new(
            client,
            UrlProperties {
                query: AgentQuery::default(),
                version: version.to_string(),
                url: None,
            },
            self.path.staging_dir(),
        );
        self.install(dk, &installer, target, version, cache, stored_hash)
            .await?;
        Ok(Installed::Version(version.to_string()))
    }

    async fn install_from_image(
        &self,
        dk: &DynaKube,
        image: &str,
        tenant_uuid: &str,
        opts: &ClientOptions,
        cache: &ProcessModuleConfigCache,
        stored_hash: Option<&str>,
    ) -> Result<Installed, installer::Error> {
        let reference = ImageReference::parse(image)?;
        let docker_config = credentials::docker_config(self.kube.as_ref(), dk)
            .await
            .map_err(|e| installer::Error::InvalidImage(image.to_string(), e.to_string()))?;
        let installer = ImageInstaller::new(
            ImageProperties {
                image_uri: image.to_string(),
                tenant_uuid: tenant_uuid.to_string(),
                docker_config,
                trusted_cas: opts.trusted_cas.clone(),
                proxy: opts.proxy.clone(),
                skip_cert_check: dk.spec.skip_cert_check,
            },
            self.path.clone(),
        )?;
        let digest = reference.digest_hex().to_string();
        let target = self.path.agent_shared_binary_dir_for_image(&digest);
        self.install(dk, &installer, &target, image, cache, stored_hash)
            .await?;
        Ok(Installed::Image(digest))
    }

    async fn install(
        &self,
        dk: &DynaKube,
        installer: &dyn Installer,
        target: &Path,
        what: &str,
        cache: &ProcessModuleConfigCache,
        stored_hash: Option<&str>,
    ) -> Result<(), installer::Error> {
        let result = async {
            let is_new = installer.install_agent(target).await?;
            if is_new || stored_hash != Some(cache.hash.as_str()) {
                installer
                    .update_process_module_config(target, &cache.process_module_config)
                    .await?;
            }
            Ok::<_, installer::Error>(is_new)
        }
        .await;
        if let Err(e) = installer.cleanup().await {
            warn!("failed to clean up after install: {e}");
        }
        if result? {
            info!(agent = what, "installed agent");
            self.metrics.record_install(InstallOutcome::success);
            self.kube
                .publish_event(
                    dk,
                    EventType::Normal,
                    REASON_INSTALL,
                    format!("Installed agent {what}"),
                )
                .await;
        }
        Ok(())
    }
}

/// What a successful install put on disk.
enum Installed {
    Version(String),
    Image(String),
}

async fn reconcile(dk: Arc<DynaKube>, ctx: Arc<Provisioner>) -> Result<Action, Error> {
    let name = dk.name_any();
    let span = info_span!("reconcile", dynakube = name);
    ctx.reconcile(&name)
        .instrument(span)
        .await
        .map(Action::requeue)
}

fn error_policy(dk: Arc<DynaKube>, error: &Error, _ctx: Arc<Provisioner>) -> Action {
    warn!(dynakube = dk.name_any(), "reconcile failed: {error}");
    Action::requeue(SHORT_REQUEUE)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use mockall::predicate::eq;

    use super::*;
    use crate::crd::{ApplicationMonitoringSpec, DynaKubeSpec, HostInjectSpec, OneAgentSpec};
    use crate::dtclient::{MockClientBuilder, MockDynatraceClient};
    use crate::k8s::MockKubeClient;
    use crate::processmoduleconfig::ConnectionInfo;
    use crate::test_helpers::agent_zip;

    const VERSION: &str = "1.2.3.4-5";

    fn app_dynakube(version: &str) -> DynaKube {
        DynaKube::new(
            "dk",
            DynaKubeSpec {
                api_url: "https://t1.example.com/api".to_string(),
                one_agent: OneAgentSpec {
                    application_monitoring: Some(ApplicationMonitoringSpec {
                        use_csi_driver: Some(true),
                        version: version.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn token_secret() -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                "apiToken".to_string(),
                ByteString(b"token".to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn tenant(install_fails: bool) -> MockDynatraceClient {
        let mut client = MockDynatraceClient::new();
        client
            .expect_get_process_module_config()
            .returning(|_| Ok(Some(ProcessModuleConfig::default())));
        client.expect_get_connection_info().returning(|| {
            Ok(ConnectionInfo {
                tenant_uuid: "t1".to_string(),
                tenant_token: "tenant-token".to_string(),
                communication_endpoints: vec!["https://t1.example.com/communication".to_string()],
                ..Default::default()
            })
        });
        if install_fails {
            client.expect_get_agent().returning(|_, _, _| {
                Err(dtclient::Error::Server {
                    status: 500,
                    message: "boom".to_string(),
                })
            });
            client
                .expect_get_agent_versions()
                .returning(|_| Ok(vec!["1.0.0.0-0".to_string()]));
        } else {
            client.expect_get_agent().returning(|_, _, dest| {
                std::fs::write(dest, agent_zip(VERSION)).unwrap();
                Ok(())
            });
        }
        client
    }

    struct Fixture {
        root: tempfile::TempDir,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                root: tempfile::tempdir().unwrap(),
                store: Arc::new(Store::open_in_memory().unwrap()),
                metrics: Arc::new(Metrics::default()),
            }
        }

        fn path(&self) -> PathResolver {
            PathResolver::new(self.root.path())
        }

        fn provisioner(&self, kube: MockKubeClient, client: MockDynatraceClient) -> Provisioner {
            let kube: Arc<dyn KubeClient> = Arc::new(kube);
            let client: Arc<dyn DynatraceClient> = Arc::new(client);
            let mut builder = MockClientBuilder::new();
            builder
                .expect_build()
                .returning(move |_| Ok(client.clone()));
            let gc = Arc::new(GarbageCollector::new(
                self.store.clone(),
                self.path(),
                kube.clone(),
                self.metrics.clone(),
                None,
            ));
            Provisioner::new(
                self.store.clone(),
                self.path(),
                kube,
                Arc::new(builder),
                gc,
                self.metrics.clone(),
                2,
            )
        }
    }

    #[tokio::test]
    async fn missing_dynakube_removes_record() {
        let f = Fixture::new();
        f.store
            .insert_dynakube(&metadata::DynaKube::new("dk", "t1"))
            .unwrap();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube().with(eq("dk")).returning(|_| Ok(None));
        let p = f.provisioner(kube, MockDynatraceClient::new());

        assert_eq!(p.reconcile("dk").await.unwrap(), LONG_REQUEUE);
        assert!(f.store.get_dynakube("dk").unwrap().is_none());
    }

    #[tokio::test]
    async fn csi_driver_not_needed() {
        let f = Fixture::new();
        f.store
            .insert_dynakube(&metadata::DynaKube::new("dk", "t1"))
            .unwrap();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube()
            .returning(|_| Ok(Some(DynaKube::new("dk", DynaKubeSpec::default()))));
        let p = f.provisioner(kube, MockDynatraceClient::new());

        assert_eq!(p.reconcile("dk").await.unwrap(), LONG_REQUEUE);
        assert!(f.store.get_dynakube("dk").unwrap().is_none());
    }

    #[tokio::test]
    async fn host_monitoring_only_creates_directories() {
        let f = Fixture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube().returning(|_| {
            let mut dk = app_dynakube("");
            dk.spec.one_agent = OneAgentSpec {
                host_monitoring: Some(HostInjectSpec::default()),
                ..Default::default()
            };
            Ok(Some(dk))
        });
        let p = f.provisioner(kube, MockDynatraceClient::new());

        assert_eq!(p.reconcile("dk").await.unwrap(), LONG_REQUEUE);
        assert!(f.path().agent_bin_dir("t1").is_dir());
        assert!(f.store.get_dynakube("dk").unwrap().is_none());
    }

    #[tokio::test]
    async fn waits_for_status() {
        let f = Fixture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube()
            .returning(|_| Ok(Some(app_dynakube(""))));
        let p = f.provisioner(kube, MockDynatraceClient::new());

        assert_eq!(p.reconcile("dk").await.unwrap(), SHORT_REQUEUE);
        let record = f.store.get_dynakube("dk").unwrap().unwrap();
        assert_eq!(record.tenant_uuid, "t1");
        assert!(!record.is_installed());
    }

    #[tokio::test]
    async fn installs_version_from_tenant() {
        let f = Fixture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube()
            .returning(|_| Ok(Some(app_dynakube(VERSION))));
        kube.expect_get_secret()
            .with(eq("dk"))
            .returning(|_| Ok(Some(token_secret())));
        kube.expect_list_dynakubes()
            .returning(|| Ok(vec![app_dynakube(VERSION)]));
        kube.expect_publish_event()
            .withf(|_, t, reason, _| matches!(t, EventType::Normal) && reason == REASON_INSTALL)
            .times(1)
            .return_const(());
        let p = f.provisioner(kube, tenant(false));

        assert_eq!(p.reconcile("dk").await.unwrap(), DEFAULT_REQUEUE);
        let record = f.store.get_dynakube("dk").unwrap().unwrap();
        assert_eq!(record.latest_version, VERSION);
        assert!(record.image_digest.is_empty());

        let target = f.path().agent_binary_dir_for_version("t1", VERSION);
        let conf = std::fs::read_to_string(target.join("agent/conf/ruxitagentproc.conf")).unwrap();
        assert!(conf.contains("tenantToken tenant-token"), "{conf}");
        assert!(f.path().revision_file("t1").exists());
        assert_eq!(f.metrics.installs(InstallOutcome::success), 1);

        // a second pass finds the install in place
        assert_eq!(p.reconcile("dk").await.unwrap(), DEFAULT_REQUEUE);
        assert_eq!(f.metrics.installs(InstallOutcome::success), 1);
    }

    #[tokio::test]
    async fn install_failure_is_requeued_without_error() {
        let f = Fixture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube()
            .returning(|_| Ok(Some(app_dynakube(VERSION))));
        kube.expect_get_secret()
            .returning(|_| Ok(Some(token_secret())));
        kube.expect_publish_event()
            .withf(|_, t, reason, note| {
                matches!(t, EventType::Warning)
                    && reason == REASON_FAILED_INSTALL
                    && note.contains("available versions are: [ 1.0.0.0-0 ]")
            })
            .times(1)
            .return_const(());
        let p = f.provisioner(kube, tenant(true));

        assert_eq!(p.reconcile("dk").await.unwrap(), DEFAULT_REQUEUE);
        assert!(!f.store.get_dynakube("dk").unwrap().unwrap().is_installed());
        assert!(!f.path().agent_binary_dir_for_version("t1", VERSION).exists());
        assert_eq!(f.metrics.installs(InstallOutcome::failure), 1);
    }

    #[tokio::test]
    async fn missing_token_secret_is_an_error() {
        let f = Fixture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_dynakube()
            .returning(|_| Ok(Some(app_dynakube(VERSION))));
        kube.expect_get_secret().returning(|_| Ok(None));
        let p = f.provisioner(kube, MockDynatraceClient::new());

        assert!(matches!(
            p.reconcile("dk").await,
            Err(Error::MissingSecret(ref s)) if s == "dk"
        ));
    }

    #[test]
    fn install_slots() {
        let f = Fixture::new();
        let p = f.provisioner(MockKubeClient::new(), MockDynatraceClient::new());
        let a = p.acquire_install_slot("a").unwrap();
        assert!(p.acquire_install_slot("a").is_none());
        let b = p.acquire_install_slot("b").unwrap();
        // both permits taken
        assert!(p.acquire_install_slot("c").is_none());
        drop(a);
        assert!(p.acquire_install_slot("a").is_some());
        drop(b);
    }
}
