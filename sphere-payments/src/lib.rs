//! The token inventory and transfer engine.
//!
//! The wallet does not hold a balance as a ledger number; it holds a token
//! inventory where each token is a self-contained history. This crate keeps
//! that inventory consistent under local spending and receipt, asynchronous
//! peer-to-peer delivery of transfers, and convergent replication through
//! the content-addressed sidecar.

/// The aggregator contract and mock.
pub mod aggregator;
/// Transfer-executor building blocks.
pub mod executor;
/// The payments manager.
pub mod manager;
/// The token registry and rate sources.
pub mod registry;
/// Inventory snapshots, tombstones, history, and the merge.
pub mod snapshot;
/// The token store.
pub mod storage;
/// Token records and the self-contained token serialization.
pub mod token;
/// Spent-token detection.
pub mod validator;

pub use aggregator::{Aggregator, AggregatorError, Commitment, InclusionProof, ProofResponse};
pub use executor::{
    AddressMode, SendRequest, TransferMode, TransferResult, TransferStage,
};
pub use manager::{
    CoinBalance, PaymentsEvent, PaymentsManager, ReceiveOptions, ReceiveProgress,
    ReceiveResult, ResolveOutcome, SyncResult, WalletIdentity,
};
pub use registry::{AssetKind, Definition, FixedRateSource, RateSource, TokenRegistry};
pub use snapshot::{
    merge, HistoryDirection, HistoryEntry, InventorySnapshot, MergeOutcome,
    Tombstone, TombstoneReason,
};
pub use storage::{TokenStore, ValidationIssue};
pub use token::{
    Genesis, SdkBlob, TokenChain, TokenRecord, TokenState, TokenStatus, Transition,
};
pub use validator::{TokenValidator, TokenVerdict, TokenVerdictKind};

pub use aggregator::MockAggregator;
