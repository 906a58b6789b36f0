//! Inventory snapshots, tombstones, history, and the merge.
//!
//! The snapshot is the unit of sidecar publication: the live token map plus
//! the tombstone log and history, under a `_meta` header. The merge
//! reconciles a local and a remote snapshot without ever dropping tokens
//! that only one side knows about, and without resurrecting anything either
//! side has tombstoned.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sphere_common::{
    amount::Amount,
    ids::{CoinId, LocalTokenId, StateHash, TokenId, TransferId},
    time::TimestampMs,
};
use sphere_sidecar::SnapshotMeta;
use tracing::warn;

use crate::token::TokenRecord;

/// Why a token left the live set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TombstoneReason {
    Sent,
    SpentDetected,
    Invalid,
}

/// Asserts that a token (at a specific state) has left the live set, so a
/// re-sync can never reintroduce it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub token_id: TokenId,
    pub state_hash: StateHash,
    pub archived_at: TimestampMs,
    pub reason: TombstoneReason,
}

/// Payment direction in history.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryDirection {
    Sent,
    Received,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: TimestampMs,
    #[serde(rename = "type")]
    pub direction: HistoryDirection,
    pub coin_id: CoinId,
    pub amount: Amount,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_nametag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_pubkey: Option<String>,
    pub transfer_id: TransferId,
}

/// The replicated inventory snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(rename = "_meta")]
    pub meta: SnapshotMeta,
    pub tokens: BTreeMap<LocalTokenId, TokenRecord>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl InventorySnapshot {
    pub fn new(address: String) -> Self {
        Self {
            meta: SnapshotMeta {
                version: 0,
                address,
                format_version: sphere_sidecar::SNAPSHOT_FORMAT_VERSION,
                updated_at: TimestampMs::now(),
                last_cid: None,
            },
            tokens: BTreeMap::new(),
            tombstones: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("snapshots always serialize")
    }

    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(value).map_err(|err| {
            anyhow::anyhow!("snapshot failed shape validation: {err}")
        })
    }
}

/// The result of a merge.
#[derive(Debug)]
pub struct MergeOutcome {
    pub snapshot: InventorySnapshot,
    /// Tokens in the merge that the local side didn't have.
    pub added: usize,
    /// Local tokens dropped by the merge (tombstoned on some side).
    pub removed: usize,
    /// Ids present on both sides with diverging blobs.
    pub conflicts: usize,
}

/// Reconcile `local` with `remote`.
///
/// Live ids are the union of both sides minus the union of both tombstone
/// sets. Divergent records are resolved by the longer committed chain, then
/// by higher `updated_at` (tokens aren't scalar values, so plain
/// last-writer-wins would lose committed progress).
pub fn merge(local: &InventorySnapshot, remote: &InventorySnapshot) -> MergeOutcome {
    let mut tombstones = local.tombstones.clone();
    for tombstone in &remote.tombstones {
        if !tombstones
            .iter()
            .any(|t| t.token_id == tombstone.token_id && t.state_hash == tombstone.state_hash)
        {
            tombstones.push(tombstone.clone());
        }
    }
    let tombstone_keys: BTreeSet<(TokenId, StateHash)> = tombstones
        .iter()
        .map(|t| (t.token_id, t.state_hash))
        .collect();

    let all_ids: BTreeSet<LocalTokenId> = local
        .tokens
        .keys()
        .chain(remote.tokens.keys())
        .copied()
        .collect();

    let mut merged_tokens = BTreeMap::new();
    let mut added = 0usize;
    let mut removed = 0usize;
    let mut conflicts = 0usize;

    for local_id in all_ids {
        let chosen = match (local.tokens.get(&local_id), remote.tokens.get(&local_id)) {
            (Some(ours), Some(theirs)) => {
                if ours.blob != theirs.blob {
                    conflicts += 1;
                    Some(pick_divergent(ours, theirs))
                } else {
                    Some(ours)
                }
            }
            (Some(ours), None) => Some(ours),
            (None, Some(theirs)) => Some(theirs),
            (None, None) => None,
        };
        let record = match chosen {
            Some(record) => record,
            None => continue,
        };

        if is_tombstoned(record, &tombstone_keys) {
            if local.tokens.contains_key(&local_id) {
                removed += 1;
            }
            continue;
        }

        if !local.tokens.contains_key(&local_id) {
            added += 1;
        }
        merged_tokens.insert(local_id, record.clone());
    }

    // History: union, deduplicated by (transfer id, direction), time ordered.
    let mut history = local.history.clone();
    for entry in &remote.history {
        if !history
            .iter()
            .any(|h| h.transfer_id == entry.transfer_id && h.direction == entry.direction)
        {
            history.push(entry.clone());
        }
    }
    history.sort_by_key(|entry| entry.timestamp);

    let meta = SnapshotMeta {
        version: local.meta.version.max(remote.meta.version) + 1,
        address: local.meta.address.clone(),
        format_version: sphere_sidecar::SNAPSHOT_FORMAT_VERSION,
        updated_at: TimestampMs::now(),
        last_cid: None,
    };

    MergeOutcome {
        snapshot: InventorySnapshot {
            meta,
            tokens: merged_tokens,
            tombstones,
            history,
        },
        added,
        removed,
        conflicts,
    }
}

fn is_tombstoned(
    record: &TokenRecord,
    tombstone_keys: &BTreeSet<(TokenId, StateHash)>,
) -> bool {
    match record.current_state_hash() {
        Ok(state_hash) => tombstone_keys.contains(&(record.token_id, state_hash)),
        Err(err) => {
            // An unparseable record can't be matched against tombstones;
            // keep it out of the live set.
            warn!("Dropping unparseable token {}: {err}", record.local_id);
            true
        }
    }
}

/// Prefer the record whose state is further along the transaction chain;
/// tiebreak on higher `updated_at`.
fn pick_divergent<'a>(ours: &'a TokenRecord, theirs: &'a TokenRecord) -> &'a TokenRecord {
    let our_len = ours.blob.parse().map(|c| c.committed_len()).unwrap_or(0);
    let their_len = theirs.blob.parse().map(|c| c.committed_len()).unwrap_or(0);
    match our_len.cmp(&their_len) {
        std::cmp::Ordering::Greater => ours,
        std::cmp::Ordering::Less => theirs,
        std::cmp::Ordering::Equal =>
            if theirs.updated_at > ours.updated_at {
                theirs
            } else {
                ours
            },
    }
}

#[cfg(test)]
mod test {
    use sphere_common::{
        hex,
        rng::{FastRng, RngExt},
    };

    use super::*;
    use crate::{
        aggregator::test_proof,
        token::{Genesis, SdkBlob, TokenChain, TokenState, TokenStatus, Transition},
    };

    fn record(seed: u64, amount: u128) -> TokenRecord {
        let mut rng = FastRng::from_u64(seed);
        let chain = TokenChain {
            genesis: Genesis {
                token_id: TokenId::from_array(rng.gen_bytes32()),
                coin_id: CoinId::from_array([1; 32]),
                amount: Amount::from_u128(amount),
                owner: hex::encode(&[2; 33]),
                salt: hex::encode(&rng.gen_bytes16()),
            },
            transactions: vec![],
        };
        TokenRecord {
            local_id: LocalTokenId::generate(&mut rng),
            token_id: chain.genesis.token_id,
            coin_id: chain.genesis.coin_id,
            amount: chain.genesis.amount,
            status: TokenStatus::Confirmed,
            symbol: Some("UCT".to_owned()),
            decimals: Some(6),
            created_at: TimestampMs::from_ms(seed as i64).unwrap(),
            updated_at: TimestampMs::from_ms(seed as i64).unwrap(),
            blob: SdkBlob::from(&chain),
        }
    }

    fn snapshot_with(version: u64, records: &[&TokenRecord]) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::new("unc1test".to_owned());
        snapshot.meta.version = version;
        for record in records {
            snapshot.tokens.insert(record.local_id, (*record).clone());
        }
        snapshot
    }

    #[test]
    fn stale_local_keeps_remote_only_tokens() {
        let a = record(1, 10);
        let b = record(2, 20);
        let c = record(3, 30);
        let d = record(4, 40);

        let local = snapshot_with(3, &[&a, &b]);
        let remote = snapshot_with(10, &[&a, &b, &c, &d]);

        let outcome = merge(&local, &remote);
        assert_eq!(outcome.snapshot.tokens.len(), 4);
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.conflicts, 0);
        assert!(outcome.snapshot.meta.version >= 11);
    }

    #[test]
    fn local_extra_tokens_survive() {
        let a = record(1, 10);
        let extra = record(5, 50);
        let local = snapshot_with(7, &[&a, &extra]);
        let remote = snapshot_with(2, &[&a]);

        let outcome = merge(&local, &remote);
        assert_eq!(outcome.snapshot.tokens.len(), 2);
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.removed, 0);
    }

    #[test]
    fn tombstones_remove_and_propagate() {
        let a = record(1, 10);
        let b = record(2, 20);

        let local = snapshot_with(4, &[&a, &b]);
        let mut remote = snapshot_with(4, &[&a]);
        // Remote tombstoned b at its current state.
        remote.tombstones.push(Tombstone {
            token_id: b.token_id,
            state_hash: b.current_state_hash().unwrap(),
            archived_at: TimestampMs::from_ms(100).unwrap(),
            reason: TombstoneReason::Sent,
        });

        let outcome = merge(&local, &remote);
        assert!(!outcome.snapshot.tokens.contains_key(&b.local_id));
        assert_eq!(outcome.removed, 1);
        // The tombstone itself replicates.
        assert_eq!(outcome.snapshot.tombstones.len(), 1);

        // And it keeps the token out on the next merge too.
        let again = merge(&outcome.snapshot, &local);
        assert!(!again.snapshot.tokens.contains_key(&b.local_id));
    }

    #[test]
    fn tombstone_matches_state_not_just_token_id() {
        // A token that came back with a longer chain (new state) must not be
        // killed by a tombstone for its old state.
        let base = record(1, 10);
        let old_state = base.current_state_hash().unwrap();

        let mut advanced = base.clone();
        let mut chain = advanced.blob.parse().unwrap();
        chain.transactions.push(Transition {
            source: chain.current_state_hash(),
            state: TokenState {
                owner: hex::encode(&[2; 33]),
                salt: "bb".to_owned(),
            },
            proof: Some(test_proof()),
        });
        advanced.blob = SdkBlob::from(&chain);

        let mut local = snapshot_with(2, &[&advanced]);
        local.tombstones.push(Tombstone {
            token_id: base.token_id,
            state_hash: old_state,
            archived_at: TimestampMs::from_ms(1).unwrap(),
            reason: TombstoneReason::Sent,
        });
        let remote = snapshot_with(1, &[]);

        let outcome = merge(&local, &remote);
        assert!(outcome.snapshot.tokens.contains_key(&advanced.local_id));
    }

    #[test]
    fn divergent_records_prefer_longer_committed_chain() {
        let base = record(1, 10);

        let mut longer = base.clone();
        let mut chain = longer.blob.parse().unwrap();
        chain.transactions.push(Transition {
            source: chain.current_state_hash(),
            state: TokenState {
                owner: hex::encode(&[3; 33]),
                salt: "cc".to_owned(),
            },
            proof: Some(test_proof()),
        });
        longer.blob = SdkBlob::from(&chain);

        let local = snapshot_with(1, &[&base]);
        let remote = snapshot_with(1, &[&longer]);

        let outcome = merge(&local, &remote);
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(
            outcome.snapshot.tokens.get(&base.local_id).unwrap().blob,
            longer.blob,
        );
    }

    #[test]
    fn equal_chain_divergence_takes_higher_updated_at() {
        let base = record(1, 10);
        let mut newer = base.clone();
        newer.symbol = Some("NEW".to_owned());
        // Same chain, different metadata serialization: force blob change.
        let mut chain = newer.blob.parse().unwrap();
        chain.genesis.salt = "ff".repeat(16);
        newer.blob = SdkBlob::from(&chain);
        newer.updated_at = TimestampMs::from_ms(9999).unwrap();

        let local = snapshot_with(1, &[&base]);
        let remote = snapshot_with(1, &[&newer]);
        let outcome = merge(&local, &remote);
        assert_eq!(
            outcome
                .snapshot
                .tokens
                .get(&base.local_id)
                .unwrap()
                .updated_at,
            newer.updated_at,
        );
    }

    #[test]
    fn history_unions_without_duplicates() {
        let mut local = snapshot_with(1, &[]);
        let mut remote = snapshot_with(1, &[]);
        let entry = HistoryEntry {
            timestamp: TimestampMs::from_ms(5).unwrap(),
            direction: HistoryDirection::Sent,
            coin_id: CoinId::from_array([1; 32]),
            amount: Amount::from_u128(1),
            symbol: "UCT".to_owned(),
            counterparty_nametag: Some("bob".to_owned()),
            counterparty_pubkey: None,
            transfer_id: TransferId::from_array([7; 16]),
        };
        local.history.push(entry.clone());
        remote.history.push(entry.clone());
        let mut other = entry.clone();
        other.transfer_id = TransferId::from_array([8; 16]);
        remote.history.push(other);

        let outcome = merge(&local, &remote);
        assert_eq!(outcome.snapshot.history.len(), 2);
    }

    // Merge properties over random partitions of a token set.
    #[test]
    fn merge_never_loses_untombstoned_tokens() {
        use proptest::{collection::vec, prelude::*, proptest};

        proptest!(|(
            seeds in vec(1_u64..1000, 1..12),
            split_mask in vec(any::<bool>(), 12),
            local_version in 0_u64..50,
            remote_version in 0_u64..50,
        )| {
            let records: Vec<TokenRecord> = seeds
                .iter()
                .map(|seed| record(*seed, *seed as u128))
                .collect();

            // Partition: some tokens local-only, some remote-only, the rest
            // shared.
            let mut local = InventorySnapshot::new("unc1test".to_owned());
            local.meta.version = local_version;
            let mut remote = InventorySnapshot::new("unc1test".to_owned());
            remote.meta.version = remote_version;
            for (idx, rec) in records.iter().enumerate() {
                match (split_mask[idx % split_mask.len()], idx % 3) {
                    (_, 0) => {
                        local.tokens.insert(rec.local_id, rec.clone());
                        remote.tokens.insert(rec.local_id, rec.clone());
                    }
                    (true, _) => {
                        local.tokens.insert(rec.local_id, rec.clone());
                    }
                    (false, _) => {
                        remote.tokens.insert(rec.local_id, rec.clone());
                    }
                }
            }

            let outcome = merge(&local, &remote);

            // Union, no losses, no duplicates.
            let expected: BTreeSet<LocalTokenId> = local
                .tokens
                .keys()
                .chain(remote.tokens.keys())
                .copied()
                .collect();
            let merged: BTreeSet<LocalTokenId> =
                outcome.snapshot.tokens.keys().copied().collect();
            prop_assert_eq!(merged, expected);
            prop_assert_eq!(outcome.removed, 0);
            prop_assert!(
                outcome.snapshot.meta.version
                    > local_version.max(remote_version)
            );

            // Merging is idempotent against the result.
            let again = merge(&outcome.snapshot, &remote);
            prop_assert_eq!(
                again.snapshot.tokens.len(),
                outcome.snapshot.tokens.len()
            );
            prop_assert_eq!(again.added, 0);
            prop_assert_eq!(again.removed, 0);
        });
    }

    #[test]
    fn snapshot_value_roundtrip_keeps_meta_key() {
        let snapshot = snapshot_with(3, &[&record(1, 10)]);
        let value = snapshot.to_value();
        assert!(value.get("_meta").is_some());
        // The sidecar can read the meta header.
        let meta = sphere_sidecar::read_meta(&value).unwrap();
        assert_eq!(meta.version, 3);

        let back = InventorySnapshot::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
