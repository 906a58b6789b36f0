//! The sphere: construction and lifecycle of the whole wallet engine.
//!
//! Wires identity, providers, transport subscriptions, the sidecar, and the
//! payments manager together; owns every background task and releases all of
//! it on `destroy`.

use std::{path::PathBuf, sync::{Arc, Mutex as StdMutex}, time::Duration};

use anyhow::Context;
use sphere_payments::{
    Aggregator, PaymentsManager, RateSource, TokenRegistry, TokenStore,
    WalletIdentity,
};
use sphere_sidecar::{ContentClient, SidecarStorage};
use sphere_store::{DiskFs, Ffs, MemFs};
use sphere_tokio::{notify_once::NotifyOnce, task::SpTask};
use sphere_transport::{
    IdentityView, RelayConnector, Subscription, Transport, TransportConfig,
};
use tracing::{info, instrument, warn};

use crate::identity::{Identity, IdentityManager};

/// Sphere configuration. Everything has a sensible default except the relay
/// urls, which an online wallet must set.
#[derive(Clone, Debug)]
pub struct SphereConfig {
    /// Root directory for persisted state. `None` keeps everything in
    /// memory (tests, ephemeral wallets).
    pub data_dir: Option<PathBuf>,
    pub relay_urls: Vec<String>,
    /// Registry JSON url; `None` disables the refresh task.
    pub registry_url: Option<String>,
    pub registry_refresh_interval: Duration,
    pub flush_debounce: Duration,
    pub query_timeout: Duration,
    /// Encrypts the wallet blob at rest when set.
    pub password: Option<String>,
}

impl Default for SphereConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            relay_urls: Vec::new(),
            registry_url: None,
            registry_refresh_interval:
                sphere_payments::registry::DEFAULT_REFRESH_INTERVAL,
            flush_debounce: sphere_sidecar::DEFAULT_FLUSH_DEBOUNCE,
            query_timeout: sphere_transport::DEFAULT_QUERY_TIMEOUT,
            password: None,
        }
    }
}

/// The provider bundle: one closed implementation choice per external
/// dependency, composed at construction.
pub struct Providers {
    pub relay_connector: RelayConnector,
    pub content_client: ContentClient,
    pub aggregator: Arc<dyn Aggregator>,
    pub rate_source: Option<Arc<dyn RateSource>>,
}

struct FfsRoots {
    wallet: Arc<dyn Ffs>,
    tokens: Arc<dyn Ffs>,
    sidecar: Arc<dyn Ffs>,
    registry: Arc<dyn Ffs>,
}

impl FfsRoots {
    fn open(data_dir: &Option<PathBuf>) -> anyhow::Result<Self> {
        fn root(
            data_dir: &Option<PathBuf>,
            name: &str,
        ) -> anyhow::Result<Arc<dyn Ffs>> {
            Ok(match data_dir {
                Some(dir) => Arc::new(DiskFs::create_dir_all(dir.join(name))?),
                None => Arc::new(MemFs::new()),
            })
        }
        Ok(Self {
            wallet: root(data_dir, "wallet")?,
            tokens: root(data_dir, "tokens")?,
            sidecar: root(data_dir, "sidecar")?,
            registry: root(data_dir, "registry")?,
        })
    }
}

pub struct Sphere {
    config: SphereConfig,
    identity_manager: IdentityManager,
    transport: Transport,
    payments: StdMutex<PaymentsManager>,
    registry: TokenRegistry,
    ffs: FfsRoots,
    content_client: ContentClient,
    aggregator: Arc<dyn Aggregator>,
    rate_source: Option<Arc<dyn RateSource>>,
    registry_task: StdMutex<Option<SpTask<()>>>,
    _inbound_log_sub: Subscription,
    shutdown: NotifyOnce,
}

impl Sphere {
    /// Bring up a wallet: load (or create) the identity, wire the providers,
    /// connect the transport, restore sidecar state, and load the inventory.
    #[instrument(skip_all, name = "(sphere-init)")]
    pub async fn init(
        config: SphereConfig,
        providers: Providers,
        mnemonic: Option<&str>,
    ) -> anyhow::Result<Self> {
        let ffs = FfsRoots::open(&config.data_dir)?;

        let identity_manager = IdentityManager::load_or_create(
            ffs.wallet.clone(),
            mnemonic,
            config.password.as_deref(),
        )
        .context("Identity load failed")?;
        let identity = identity_manager.active_identity();
        info!("Wallet identity: {}", identity.l1_address);

        // Registry: cached definitions now, remote refresh on a timer.
        let registry = TokenRegistry::new();
        if let Err(err) = registry.load_cached(&ffs.registry) {
            warn!("Registry cache load failed: {err:#}");
        }

        let transport = Transport::new(
            TransportConfig {
                relay_urls: config.relay_urls.clone(),
                query_timeout: config.query_timeout,
            },
            providers.relay_connector,
        );
        transport.connect().await;
        Self::install_identity(&transport, &identity).await;

        // After an import, the nametag lives only in our published binding.
        if transport.is_connected().await {
            match transport.recover_nametag().await {
                Ok(Some(nametag)) => {
                    info!("Recovered nametag '@{nametag}'");
                    identity_manager.set_nametag(Some(nametag));
                    let identity = identity_manager.active_identity();
                    Self::install_identity(&transport, &identity).await;
                }
                Ok(None) => (),
                Err(err) => warn!("Nametag recovery failed: {err}"),
            }
        }

        // Keep an inbound-transfer log subscription for observability; the
        // payments module drains the queue on `receive`.
        let inbound_log_sub = transport.on_token_transfer(|transfer| {
            info!(
                "Inbound transfer {} queued",
                transfer.payload.transfer_id,
            );
        });

        let payments = Self::build_payments(
            &config,
            &identity_manager,
            &transport,
            &ffs,
            &providers.content_client,
            &providers.aggregator,
            &providers.rate_source,
            &registry,
        );
        payments.load().await.context("Inventory load failed")?;

        let sphere = Self {
            config,
            identity_manager,
            transport,
            payments: StdMutex::new(payments),
            registry,
            ffs,
            content_client: providers.content_client,
            aggregator: providers.aggregator,
            rate_source: providers.rate_source,
            registry_task: StdMutex::new(None),
            _inbound_log_sub: inbound_log_sub,
            shutdown: NotifyOnce::new(),
        };
        sphere.schedule_registry_refresh();
        Ok(sphere)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_payments(
        config: &SphereConfig,
        identity_manager: &IdentityManager,
        transport: &Transport,
        ffs: &FfsRoots,
        content_client: &ContentClient,
        aggregator: &Arc<dyn Aggregator>,
        rate_source: &Option<Arc<dyn RateSource>>,
        registry: &TokenRegistry,
    ) -> PaymentsManager {
        let identity = identity_manager.active_identity();
        let sidecar = SidecarStorage::new(
            content_client.clone(),
            identity_manager.root_seed().derive_sidecar_keypair(),
            ffs.sidecar.clone(),
            config.flush_debounce,
        );
        PaymentsManager::new(
            WalletIdentity {
                chain_pubkey_hex: identity.chain_pubkey_hex.clone(),
                l1_address: identity.l1_address.clone(),
                nametag: identity.nametag.clone(),
            },
            TokenStore::new(ffs.tokens.clone()),
            transport.clone(),
            sidecar,
            aggregator.clone(),
            registry.clone(),
            rate_source.clone(),
        )
    }

    async fn install_identity(transport: &Transport, identity: &Identity) {
        transport
            .set_identity(IdentityView {
                transport_keypair: identity.transport_keypair.clone(),
                chain_pubkey: identity.chain_pubkey_hex.clone(),
                l1_address: identity.l1_address.clone(),
                direct_address: identity.direct_address.clone(),
                nametag: identity.nametag.clone(),
            })
            .await;
    }

    fn schedule_registry_refresh(&self) {
        let url = match &self.config.registry_url {
            Some(url) => url.clone(),
            None => return,
        };
        let registry = self.registry.clone();
        let ffs = self.ffs.registry.clone();
        let interval = self.config.registry_refresh_interval;
        let shutdown = self.shutdown.clone();
        let task = SpTask::spawn("registry-refresh", async move {
            let client = reqwest::Client::new();
            loop {
                if let Err(err) = registry.refresh(&client, &url, &ffs).await {
                    warn!("Registry refresh failed: {err:#}");
                }
                tokio::select! {
                    () = shutdown.recv() => break,
                    () = tokio::time::sleep(interval) => (),
                }
            }
        });
        *self.registry_task.lock().unwrap() = Some(task);
    }

    /// The payments module handle.
    pub fn payments(&self) -> PaymentsManager {
        self.payments.lock().unwrap().clone()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// The active identity.
    pub fn identity(&self) -> Identity {
        self.identity_manager.active_identity()
    }

    pub fn identity_manager(&self) -> &IdentityManager {
        &self.identity_manager
    }

    /// Claim a nametag: publishes a binding unless another identity owns it.
    pub async fn register_nametag(&self, name: &str) -> anyhow::Result<bool> {
        let registered = self
            .transport
            .register_nametag(name)
            .await
            .map_err(|err| anyhow::anyhow!("nametag registration failed: {err}"))?;
        if registered {
            self.identity_manager.set_nametag(Some(name.to_owned()));
        }
        Ok(registered)
    }

    /// Rotate the wallet to another HD index: re-derive keys, re-bind the
    /// transport, and rebuild the payments view over the same stores.
    #[instrument(skip_all, name = "(switch-address)")]
    pub async fn switch_to_address(&self, index: u32) -> anyhow::Result<Identity> {
        let identity = self.identity_manager.switch_to(index)?;
        Self::install_identity(&self.transport, &identity).await;

        // The old sidecar handle flushes anything buffered before the swap.
        let old = self.payments.lock().unwrap().clone();
        old.wait_for_pending_operations(Duration::from_secs(10)).await;
        old.shutdown_sidecar().await;

        let payments = Self::build_payments(
            &self.config,
            &self.identity_manager,
            &self.transport,
            &self.ffs,
            &self.content_client,
            &self.aggregator,
            &self.rate_source,
            &self.registry,
        );
        payments.load().await.context("Inventory reload failed")?;
        *self.payments.lock().unwrap() = payments;
        Ok(identity)
    }

    /// Wipe all persisted wallet state. The sphere is unusable afterwards.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.identity_manager.clear()?;
        self.ffs.tokens.delete_all()?;
        self.ffs.sidecar.delete_all()?;
        self.ffs.registry.delete_all()?;
        Ok(())
    }

    /// Graceful shutdown: join background work, drain the sidecar buffer,
    /// release relay connections.
    #[instrument(skip_all, name = "(sphere-destroy)")]
    pub async fn destroy(&self) {
        self.shutdown.send();
        let task = self.registry_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let payments = self.payments.lock().unwrap().clone();
        if !payments
            .wait_for_pending_operations(Duration::from_secs(10))
            .await
        {
            warn!("Some background finalizations did not finish in time");
        }
        payments.shutdown_sidecar().await;
        self.transport.shutdown().await;
        info!("Sphere destroyed");
    }
}
