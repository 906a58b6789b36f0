//! Sphere: the client-side engine of a self-custody wallet for
//! cryptographically-verifiable bearer tokens.
//!
//! The wallet holds a token inventory, not a ledger balance: each token is a
//! self-contained history anchored in an external aggregator. This crate is
//! the facade that wires the engine together — identity, transport, the
//! payments module, and the content-addressed sidecar — and manages its
//! lifecycle.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use sphere::{Providers, Sphere, SphereConfig};
//! use sphere_payments::MockAggregator;
//! use sphere_sidecar::{ContentClient, MemContentStore};
//! use sphere_transport::{MemRelayHub, RelayConnector};
//!
//! let providers = Providers {
//!     relay_connector: RelayConnector::Mem(MemRelayHub::new()),
//!     content_client: ContentClient::Mem(MemContentStore::new()),
//!     aggregator: Arc::new(MockAggregator::new()),
//!     rate_source: None,
//! };
//! let sphere = Sphere::init(SphereConfig::default(), providers, None).await?;
//! let balances = sphere.payments().balances().await;
//! # drop(balances);
//! sphere.destroy().await;
//! # Ok(())
//! # }
//! ```

/// HD identity management.
pub mod identity;
/// Global logger configuration.
pub mod logger;
/// The facade.
pub mod sphere;

pub use identity::{Identity, IdentityManager};
pub use sphere::{Providers, Sphere, SphereConfig};
