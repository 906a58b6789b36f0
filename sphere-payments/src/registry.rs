//! The token registry: coin id -> display definition.
//!
//! A read-mostly shared handle over an [`arc_swap::ArcSwap`] map, hydrated
//! from a cached JSON file and refreshed from a remote url on a timer (the
//! facade owns the timer task). Unknown coins get a truncated-hex fallback
//! so balances always render.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sphere_common::ids::CoinId;
use sphere_store::Ffs;
use tracing::{debug, info, warn};

const REGISTRY_FILE: &str = "registry.json";

/// Default interval between remote refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Fungible,
    NonFungible,
}

/// Display definition of a coin.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub asset_kind: AssetKind,
    #[serde(default)]
    pub icons: Vec<String>,
}

impl Definition {
    /// Fallback definition for a coin the registry doesn't know.
    pub fn fallback(coin_id: &CoinId) -> Self {
        let coin_hex = coin_id.to_string();
        Self {
            symbol: coin_hex[..8].to_uppercase(),
            name: format!("Unknown coin {}", &coin_hex[..16]),
            decimals: 0,
            asset_kind: AssetKind::Fungible,
            icons: vec![],
        }
    }
}

type RegistryMap = HashMap<CoinId, Definition>;

/// Shared registry handle; clone freely.
#[derive(Clone)]
pub struct TokenRegistry {
    map: Arc<ArcSwap<RegistryMap>>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            map: Arc::new(ArcSwap::from_pointee(RegistryMap::new())),
        }
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = (CoinId, Definition)>,
    ) -> Self {
        let registry = Self::new();
        registry.replace(definitions.into_iter().collect());
        registry
    }

    /// Hydrate from the cached registry file, if present.
    pub fn load_cached(&self, ffs: &dyn Ffs) -> anyhow::Result<()> {
        let buf = match ffs.read(REGISTRY_FILE) {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("Failed to read registry cache"),
        };
        let map: RegistryMap = serde_json::from_slice(&buf)
            .context("Registry cache is malformed")?;
        info!("Loaded {} coin definitions from cache", map.len());
        self.replace(map);
        Ok(())
    }

    /// Fetch the registry JSON from `url`, replace the map, update the cache.
    pub async fn refresh(
        &self,
        client: &reqwest::Client,
        url: &str,
        ffs: &dyn Ffs,
    ) -> anyhow::Result<()> {
        let response = client
            .get(url)
            .send()
            .await
            .context("Registry fetch failed")?
            .error_for_status()
            .context("Registry fetch was rejected")?;
        let bytes = response
            .bytes()
            .await
            .context("Registry body read failed")?;
        let map: RegistryMap =
            serde_json::from_slice(&bytes).context("Registry JSON is malformed")?;

        if let Err(err) = ffs.write(REGISTRY_FILE, &bytes) {
            warn!("Could not update registry cache: {err:#}");
        }
        debug!("Refreshed registry with {} coin definitions", map.len());
        self.replace(map);
        Ok(())
    }

    pub fn get(&self, coin_id: &CoinId) -> Option<Definition> {
        self.map.load().get(coin_id).cloned()
    }

    /// The definition to display, falling back for unknown coins.
    pub fn get_or_fallback(&self, coin_id: &CoinId) -> Definition {
        self.get(coin_id)
            .unwrap_or_else(|| Definition::fallback(coin_id))
    }

    pub fn asset_kind(&self, coin_id: &CoinId) -> AssetKind {
        self.get(coin_id)
            .map(|def| def.asset_kind)
            .unwrap_or(AssetKind::Fungible)
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    fn replace(&self, map: RegistryMap) {
        self.map.store(Arc::new(map));
    }
}

/// Best-effort fiat rate lookup. `None` when no rate is available.
pub trait RateSource: Send + Sync {
    /// Fiat value of one base unit of `coin_id`.
    fn rate(&self, coin_id: &CoinId) -> Option<f64>;
}

/// Fixed-rate source for tests and offline operation.
#[derive(Default)]
pub struct FixedRateSource {
    rates: HashMap<CoinId, f64>,
}

impl FixedRateSource {
    pub fn new(rates: impl IntoIterator<Item = (CoinId, f64)>) -> Self {
        Self {
            rates: rates.into_iter().collect(),
        }
    }
}

impl RateSource for FixedRateSource {
    fn rate(&self, coin_id: &CoinId) -> Option<f64> {
        self.rates.get(coin_id).copied()
    }
}
