//! Transfer-executor building blocks: request/result types, deterministic
//! input selection, successor-chain construction, and the commit-then-prove
//! aggregator conversation.
//!
//! The [`PaymentsManager`] drives these through its state machines; nothing
//! here touches the inventory directly.
//!
//! [`PaymentsManager`]: crate::manager::PaymentsManager

use std::{collections::BTreeMap, time::Duration};

use sphere_common::{
    amount::Amount,
    backoff,
    error::WalletError,
    hex,
    ids::{CoinId, LocalTokenId, RequestId, StateHash, TokenId, TransferId},
    rng::{Crng, RngExt},
};
use sphere_transport::PeerInfo;
use tracing::{debug, warn};

use crate::{
    aggregator::{Aggregator, AggregatorError, Commitment, InclusionProof, ProofResponse},
    registry::AssetKind,
    token::{Genesis, TokenChain, TokenRecord, TokenState, TokenStatus, Transition},
};

/// How many times a commit is retried across aggregator outages.
const MAX_COMMIT_ATTEMPTS: u32 = 4;
/// How many proof polls before giving up on a commit round.
const MAX_PROOF_POLLS: u32 = 16;
/// Aggregator proof rounds are ~2s; poll a little faster than that.
const PROOF_POLL_INITIAL_MS: u64 = 500;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AddressMode {
    Direct,
    Proxy,
    #[default]
    Auto,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TransferMode {
    /// Deliver immediately with uncommitted outputs; finalize in background.
    Instant,
    /// Burn and mint on the aggregator before delivering.
    #[default]
    Conservative,
}

#[derive(Clone, Debug)]
pub struct SendRequest {
    pub recipient: String,
    pub amount: Amount,
    pub coin_id: CoinId,
    pub address_mode: AddressMode,
    pub transfer_mode: TransferMode,
}

/// Where a transfer got to. Recorded in results and failure metadata.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferStage {
    Prepared,
    Burning,
    Minting,
    Transferring,
    SplitLocal,
    Delivered,
    Finalized,
    Completed,
}

impl TransferStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Burning => "burning",
            Self::Minting => "minting",
            Self::Transferring => "transferring",
            Self::SplitLocal => "split-local",
            Self::Delivered => "delivered",
            Self::Finalized => "finalized",
            Self::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferResult {
    pub transfer_id: TransferId,
    pub recipient: PeerInfo,
    pub amount: Amount,
    pub coin_id: CoinId,
    pub mode: TransferMode,
    pub stage: TransferStage,
    /// Local ids of change tokens this transfer minted back to us.
    pub change_local_ids: Vec<LocalTokenId>,
}

// --- Selection --- //

#[derive(Clone, Debug)]
pub struct Selection {
    /// Oldest-first inputs. All but the last are consumed whole; the last is
    /// split when the sum overshoots.
    pub inputs: Vec<TokenRecord>,
    pub total: Amount,
}

/// Deterministic input selection: confirmed tokens of the coin, oldest
/// `created_at` first with `local_id` as the tiebreak. Prefers an exact
/// single-token match (whole transfer, no split); otherwise takes the
/// shortest prefix whose sum covers the amount. Non-fungible tokens must
/// match exactly.
pub fn select_inputs(
    live: &BTreeMap<LocalTokenId, TokenRecord>,
    coin_id: &CoinId,
    amount: Amount,
    asset_kind: AssetKind,
) -> Result<Selection, WalletError> {
    let mut candidates: Vec<&TokenRecord> = live
        .values()
        .filter(|record| {
            record.coin_id == *coin_id && record.status == TokenStatus::Confirmed
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.local_id.cmp(&b.local_id))
    });

    let available: Amount = candidates.iter().map(|record| record.amount).sum();

    if let Some(exact) = candidates.iter().find(|record| record.amount == amount) {
        return Ok(Selection {
            inputs: vec![(*exact).clone()],
            total: amount,
        });
    }

    if asset_kind == AssetKind::NonFungible {
        // No exact match; non-fungibles can't be split.
        return Err(WalletError::InsufficientBalance {
            available,
            requested: amount,
        });
    }

    let mut inputs = Vec::new();
    let mut total = Amount::ZERO;
    for candidate in candidates {
        inputs.push(candidate.clone());
        total = total.saturating_add(candidate.amount);
        if total >= amount {
            return Ok(Selection { inputs, total });
        }
    }

    Err(WalletError::InsufficientBalance {
        available,
        requested: amount,
    })
}

// --- Chain construction --- //

pub fn new_salt<R: Crng>(rng: &mut R) -> String {
    hex::encode(&rng.gen_bytes32())
}

/// Mint a successor token: genesis owned by the minter, with one (initially
/// uncommitted) transition handing it to `recipient_pubkey_hex`.
pub fn mint_successor_chain<R: Crng>(
    rng: &mut R,
    minter_pubkey_hex: &str,
    recipient_pubkey_hex: &str,
    coin_id: CoinId,
    amount: Amount,
) -> TokenChain {
    let genesis = Genesis {
        token_id: TokenId::from_array(rng.gen_bytes32()),
        coin_id,
        amount,
        owner: minter_pubkey_hex.to_owned(),
        salt: new_salt(rng),
    };
    let source = genesis.state().hash(&genesis.token_id);
    TokenChain {
        genesis,
        transactions: vec![Transition {
            source,
            state: TokenState {
                owner: recipient_pubkey_hex.to_owned(),
                salt: new_salt(rng),
            },
            proof: None,
        }],
    }
}

/// Append an (uncommitted) ownership transfer to an existing chain.
pub fn append_transfer<R: Crng>(
    chain: &mut TokenChain,
    new_owner_pubkey_hex: &str,
    rng: &mut R,
) {
    let source = chain.current_state_hash();
    chain.transactions.push(Transition {
        source,
        state: TokenState {
            owner: new_owner_pubkey_hex.to_owned(),
            salt: new_salt(rng),
        },
        proof: None,
    });
}

/// Append an (uncommitted) burn whose state binds the successor token ids,
/// so the burn commitment attests to exactly this split.
pub fn append_burn(chain: &mut TokenChain, successors: &[TokenId]) {
    let mut inputs: Vec<&[u8]> = vec![b"sphere/burn/v1"];
    for successor in successors {
        inputs.push(successor.as_slice());
    }
    let salt = hex::encode(
        sphere_common::sha256::digest_many(&inputs).as_slice(),
    );
    let source = chain.current_state_hash();
    chain.transactions.push(Transition {
        source,
        state: TokenState {
            owner: crate::token::BURNED_OWNER.to_owned(),
            salt,
        },
        proof: None,
    });
}

// --- Aggregator conversation --- //

/// Submit the commitment spending `source` (owned by `owner_pubkey_hex`) in
/// favor of `target`, then poll until the inclusion proof appears.
///
/// Transient unavailability is retried with backoff; an upstream rejection
/// (double spend) surfaces immediately as [`WalletError::AggregatorRejected`].
pub async fn commit_and_prove(
    aggregator: &dyn Aggregator,
    owner_pubkey_hex: &str,
    source: StateHash,
    target: StateHash,
) -> Result<InclusionProof, WalletError> {
    let owner_pubkey = hex::decode(owner_pubkey_hex)
        .map_err(|err| WalletError::InvalidInput(format!("bad owner pubkey: {err}")))?;
    let request_id = RequestId::compute(&owner_pubkey, &source);

    let mut waits = backoff::iter();
    let mut attempts = 0u32;
    loop {
        match aggregator
            .submit_commitment(Commitment {
                request_id,
                payload: target,
            })
            .await
        {
            Ok(()) => break,
            Err(AggregatorError::Rejected(message)) =>
                return Err(WalletError::AggregatorRejected(message)),
            Err(AggregatorError::Unavailable(message)) => {
                attempts += 1;
                if attempts >= MAX_COMMIT_ATTEMPTS {
                    return Err(WalletError::AggregatorUnavailable(message));
                }
                let wait = waits.next().expect("backoff iterator is infinite");
                debug!("Commit attempt {attempts} failed; retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    }

    poll_inclusion(aggregator, request_id).await
}

/// Poll for the inclusion proof of an already-submitted commitment.
pub async fn poll_inclusion(
    aggregator: &dyn Aggregator,
    request_id: RequestId,
) -> Result<InclusionProof, WalletError> {
    let mut waits = backoff::iter_with_initial_wait_ms(PROOF_POLL_INITIAL_MS);
    for _ in 0..MAX_PROOF_POLLS {
        match aggregator.get_proof(request_id).await {
            Ok(ProofResponse::Inclusion(proof)) => return Ok(proof),
            Ok(ProofResponse::Exclusion(_)) => (),
            Err(AggregatorError::Rejected(message)) =>
                return Err(WalletError::AggregatorRejected(message)),
            Err(AggregatorError::Unavailable(message)) =>
                warn!("Proof poll failed: {message}"),
        }
        let wait = waits.next().expect("backoff iterator is infinite");
        tokio::time::sleep(wait).await;
    }
    Err(WalletError::AggregatorUnavailable(
        "inclusion proof did not appear before the deadline".to_owned(),
    ))
}

/// Deadline helper for `receive({finalize})` loops. Uses the tokio clock so
/// paused-time tests advance it.
pub fn deadline_elapsed(
    started: tokio::time::Instant,
    deadline: Option<Duration>,
) -> bool {
    match deadline {
        Some(deadline) => started.elapsed() >= deadline,
        None => false,
    }
}

#[cfg(test)]
mod test {
    use sphere_common::{
        rng::FastRng,
        time::TimestampMs,
    };

    use super::*;
    use crate::{aggregator::MockAggregator, token::SdkBlob};

    fn owner_hex(byte: u8) -> String {
        hex::encode(&[byte; 33])
    }

    fn record(seed: u64, amount: u128, created_at: i64) -> TokenRecord {
        let mut rng = FastRng::from_u64(seed);
        let chain = TokenChain {
            genesis: Genesis {
                token_id: TokenId::from_array(rng.gen_bytes32()),
                coin_id: CoinId::from_array([1; 32]),
                amount: Amount::from_u128(amount),
                owner: owner_hex(2),
                salt: new_salt(&mut rng),
            },
            transactions: vec![],
        };
        TokenRecord {
            local_id: LocalTokenId::generate(&mut rng),
            token_id: chain.genesis.token_id,
            coin_id: chain.genesis.coin_id,
            amount: chain.genesis.amount,
            status: TokenStatus::Confirmed,
            symbol: None,
            decimals: None,
            created_at: TimestampMs::from_ms(created_at).unwrap(),
            updated_at: TimestampMs::from_ms(created_at).unwrap(),
            blob: SdkBlob::from(&chain),
        }
    }

    fn live_map(records: &[TokenRecord]) -> BTreeMap<LocalTokenId, TokenRecord> {
        records
            .iter()
            .map(|record| (record.local_id, record.clone()))
            .collect()
    }

    #[test]
    fn exact_match_wins_over_split() {
        let live = live_map(&[
            record(1, 50, 10),
            record(2, 30, 20),
            record(3, 100, 30),
        ]);
        let selection = select_inputs(
            &live,
            &CoinId::from_array([1; 32]),
            Amount::from_u128(30),
            AssetKind::Fungible,
        )
        .unwrap();
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].amount, Amount::from_u128(30));
    }

    #[test]
    fn prefix_selection_is_oldest_first() {
        let live = live_map(&[
            record(1, 50, 30),
            record(2, 40, 10),
            record(3, 25, 20),
        ]);
        let selection = select_inputs(
            &live,
            &CoinId::from_array([1; 32]),
            Amount::from_u128(60),
            AssetKind::Fungible,
        )
        .unwrap();
        // Oldest first: 40 (t=10) then 25 (t=20) covers 60.
        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.inputs[0].amount, Amount::from_u128(40));
        assert_eq!(selection.inputs[1].amount, Amount::from_u128(25));
        assert_eq!(selection.total, Amount::from_u128(65));
    }

    #[test]
    fn insufficient_balance_reports_available() {
        let live = live_map(&[record(1, 10, 1)]);
        let err = select_inputs(
            &live,
            &CoinId::from_array([1; 32]),
            Amount::from_u128(100),
            AssetKind::Fungible,
        )
        .unwrap_err();
        match err {
            WalletError::InsufficientBalance { available, requested } => {
                assert_eq!(available, Amount::from_u128(10));
                assert_eq!(requested, Amount::from_u128(100));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unconfirmed_tokens_are_not_spendable() {
        let mut unconfirmed = record(1, 100, 1);
        unconfirmed.status = TokenStatus::Unconfirmed;
        let live = live_map(&[unconfirmed]);
        assert!(select_inputs(
            &live,
            &CoinId::from_array([1; 32]),
            Amount::from_u128(50),
            AssetKind::Fungible,
        )
        .is_err());
    }

    #[test]
    fn non_fungibles_require_exact_match() {
        let live = live_map(&[record(1, 1, 1), record(2, 3, 2)]);
        let coin = CoinId::from_array([1; 32]);

        assert!(select_inputs(&live, &coin, Amount::from_u128(3), AssetKind::NonFungible).is_ok());
        assert!(select_inputs(&live, &coin, Amount::from_u128(2), AssetKind::NonFungible).is_err());
    }

    #[test]
    fn minted_chain_is_structurally_valid_and_unconfirmed() {
        let mut rng = FastRng::from_u64(1);
        let chain = mint_successor_chain(
            &mut rng,
            &owner_hex(2),
            &owner_hex(3),
            CoinId::from_array([1; 32]),
            Amount::from_u128(5),
        );
        chain.validate().unwrap();
        assert_eq!(chain.current_state().owner, owner_hex(3));
        let tail = chain.pending_tail().unwrap();
        assert_eq!(tail.previous_owner, owner_hex(2));
    }

    #[test]
    fn burn_binds_successors() {
        let base = record(1, 100, 1);
        let mut chain_a = base.blob.parse().unwrap();
        let mut chain_b = chain_a.clone();

        append_burn(&mut chain_a, &[TokenId::from_array([1; 32])]);
        append_burn(&mut chain_b, &[TokenId::from_array([2; 32])]);
        assert_ne!(
            chain_a.current_state_hash(),
            chain_b.current_state_hash(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commit_and_prove_roundtrip() {
        let aggregator = MockAggregator::new();
        aggregator.set_commit_latency_rounds(2);
        let source = StateHash::from_array([1; 32]);
        let target = StateHash::from_array([2; 32]);

        let proof = commit_and_prove(&aggregator, &owner_hex(2), source, target)
            .await
            .unwrap();
        let request_id =
            RequestId::compute(&hex::decode(&owner_hex(2)).unwrap(), &source);
        assert!(proof.indicates_spent(&request_id));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_surfaces_rejection() {
        let aggregator = MockAggregator::new();
        let source = StateHash::from_array([1; 32]);
        commit_and_prove(
            &aggregator,
            &owner_hex(2),
            source,
            StateHash::from_array([2; 32]),
        )
        .await
        .unwrap();

        // Same source, different target: double spend.
        let err = commit_and_prove(
            &aggregator,
            &owner_hex(2),
            source,
            StateHash::from_array([3; 32]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WalletError::AggregatorRejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_retries_through_outage_then_fails() {
        let aggregator = MockAggregator::new();
        aggregator.set_offline(true);
        let err = commit_and_prove(
            &aggregator,
            &owner_hex(2),
            StateHash::from_array([1; 32]),
            StateHash::from_array([2; 32]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WalletError::AggregatorUnavailable(_)));
    }
}
