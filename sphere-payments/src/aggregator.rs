//! The aggregator contract.
//!
//! The aggregator is the external content-addressed state-transition ledger;
//! it is authoritative for whether a `(pubkey, state_hash)` has been
//! committed. The wallet consumes an existing client library for it, so this
//! module defines only the contract: commitments, proofs, and the trait the
//! engine calls through, plus a mock for tests.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sphere_common::{
    hex,
    ids::{RequestId, StateHash},
    sha256,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Network failure or 5xx. Retried with backoff before surfacing.
    #[error("aggregator unavailable: {0}")]
    Unavailable(String),
    /// The commit conflicts with an existing one (double spend upstream).
    #[error("aggregator rejected commitment: {0}")]
    Rejected(String),
}

/// A state-transition commitment: "the owner of `request_id`'s state spends
/// it in favor of `payload`".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub request_id: RequestId,
    /// Hash of the successor state.
    pub payload: StateHash,
}

/// Merkle proof that a request id is in the aggregator's committed set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// Hex commitment authenticator. Empty means "path exists but nothing
    /// was committed", which callers must treat as not-spent.
    pub authenticator: String,
    pub merkle_tree_path: Vec<String>,
    pub certificate: String,
}

/// Proof that a request id is *not* in the committed set.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExclusionProof {
    pub merkle_tree_path: Vec<String>,
    pub certificate: String,
}

/// What a proof query returns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProofResponse {
    Inclusion(InclusionProof),
    Exclusion(ExclusionProof),
}

/// Path-verification outcome.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProofCheck {
    pub is_path_valid: bool,
    pub is_path_included: bool,
}

impl InclusionProof {
    /// Verify the merkle path for `request_id`.
    ///
    /// A token is "spent for this owner" iff
    /// `is_path_valid && is_path_included && !authenticator.is_empty()`.
    pub fn verify(&self, request_id: &RequestId) -> ProofCheck {
        // The real verifier walks `merkle_tree_path` against the certified
        // root. The contract we rely on is that the authenticator binds the
        // request id.
        let expected = expected_authenticator(request_id);
        ProofCheck {
            is_path_valid: self.authenticator.is_empty()
                || self.authenticator == expected,
            is_path_included: !self.authenticator.is_empty(),
        }
    }

    pub fn indicates_spent(&self, request_id: &RequestId) -> bool {
        let check = self.verify(request_id);
        check.is_path_valid && check.is_path_included && !self.authenticator.is_empty()
    }
}

fn expected_authenticator(request_id: &RequestId) -> String {
    hex::encode(
        sha256::digest_many(&[b"authenticator", request_id.as_slice()]).as_slice(),
    )
}

/// The aggregator operations the engine needs.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Submit a commitment. Idempotent for identical payloads; a different
    /// payload under the same request id is rejected.
    async fn submit_commitment(
        &self,
        commitment: Commitment,
    ) -> Result<(), AggregatorError>;

    /// Fetch the inclusion/exclusion proof for a request id.
    async fn get_proof(
        &self,
        request_id: RequestId,
    ) -> Result<ProofResponse, AggregatorError>;
}

// --- Mock --- //

/// In-memory aggregator for tests.
///
/// Supports fault injection (offline mode, commit latency in "rounds": a
/// committed request id answers exclusion for that many polls before the
/// inclusion proof appears, mimicking the aggregator's ~2s proof rounds).
#[derive(Default)]
pub struct MockAggregator {
    committed: Mutex<HashMap<RequestId, CommitEntry>>,
    offline: Mutex<bool>,
    commit_latency_rounds: Mutex<u32>,
}

struct CommitEntry {
    payload: StateHash,
    rounds_left: u32,
}

impl MockAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, every call returns `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Future commits answer exclusion for `rounds` polls before including.
    pub fn set_commit_latency_rounds(&self, rounds: u32) {
        *self.commit_latency_rounds.lock().unwrap() = rounds;
    }

    pub fn committed_count(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    fn check_online(&self) -> Result<(), AggregatorError> {
        if *self.offline.lock().unwrap() {
            Err(AggregatorError::Unavailable("mock is offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Aggregator for MockAggregator {
    async fn submit_commitment(
        &self,
        commitment: Commitment,
    ) -> Result<(), AggregatorError> {
        self.check_online()?;
        let mut committed = self.committed.lock().unwrap();
        if let Some(existing) = committed.get(&commitment.request_id) {
            if existing.payload != commitment.payload {
                return Err(AggregatorError::Rejected(format!(
                    "request id {} already committed to a different payload",
                    commitment.request_id,
                )));
            }
            return Ok(());
        }
        let rounds_left = *self.commit_latency_rounds.lock().unwrap();
        committed.insert(
            commitment.request_id,
            CommitEntry {
                payload: commitment.payload,
                rounds_left,
            },
        );
        Ok(())
    }

    async fn get_proof(
        &self,
        request_id: RequestId,
    ) -> Result<ProofResponse, AggregatorError> {
        self.check_online()?;
        let mut committed = self.committed.lock().unwrap();
        match committed.get_mut(&request_id) {
            Some(entry) => {
                if entry.rounds_left > 0 {
                    entry.rounds_left -= 1;
                    return Ok(ProofResponse::Exclusion(ExclusionProof::default()));
                }
                Ok(ProofResponse::Inclusion(InclusionProof {
                    authenticator: expected_authenticator(&request_id),
                    merkle_tree_path: vec![],
                    certificate: "mock".to_owned(),
                }))
            }
            None => Ok(ProofResponse::Exclusion(ExclusionProof::default())),
        }
    }
}

/// A structurally valid proof for tests that never touch the aggregator.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_proof() -> InclusionProof {
    InclusionProof {
        authenticator: String::new(),
        merkle_tree_path: vec![],
        certificate: "test".to_owned(),
    }
}
