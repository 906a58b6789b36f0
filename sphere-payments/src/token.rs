//! Token records and the self-contained token serialization.
//!
//! A token is its own history: a genesis plus a chain of state transitions,
//! each committed on the aggregator. The wallet persists the serialization
//! verbatim in an [`SdkBlob`] so unknown fields survive round trips; parsing
//! into a [`TokenChain`] is a total function returning either the structured
//! chain or an [`InvalidTokenError`].

use serde::{Deserialize, Serialize};
use sphere_common::{
    amount::Amount,
    hex,
    ids::{CoinId, LocalTokenId, StateHash, TokenId},
    sha256,
    time::TimestampMs,
};
use thiserror::Error;

use crate::aggregator::InclusionProof;

/// Marker owner for burned states. No key hashes to it.
pub const BURNED_OWNER: &str = "burned";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Latest transition has no inclusion proof yet.
    Unconfirmed,
    /// Every transition carries an inclusion proof.
    Confirmed,
    /// Detected as spent; must be archived and tombstoned.
    Spent,
    /// A commit for this token was rejected upstream.
    Failed,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfirmed => "unconfirmed",
            Self::Confirmed => "confirmed",
            Self::Spent => "spent",
            Self::Failed => "failed",
        }
    }
}

/// A persisted token record. Exactly one live record exists per `local_id`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub local_id: LocalTokenId,
    pub token_id: TokenId,
    pub coin_id: CoinId,
    pub amount: Amount,
    pub status: TokenStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    /// The full self-contained token serialization.
    pub blob: SdkBlob,
}

impl TokenRecord {
    /// The current state hash, recomputed from the blob rather than any
    /// stored metadata (the serialized state may have been mutated by a
    /// local split since metadata was written).
    pub fn current_state_hash(&self) -> Result<StateHash, InvalidTokenError> {
        Ok(self.blob.parse()?.current_state_hash())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum InvalidTokenError {
    #[error("token blob is not a JSON object")]
    NotAnObject,
    #[error("token blob is missing or has a malformed '{0}' field")]
    BadField(&'static str),
    #[error("transition {index} does not reference the previous state hash")]
    BrokenChain { index: usize },
    #[error("committed transition {index} follows an uncommitted one")]
    CommittedAfterUncommitted { index: usize },
    #[error("genesis amount and record amount disagree")]
    AmountMismatch,
}

/// The opaque token serialization, kept verbatim alongside the parsed form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SdkBlob(pub serde_json::Value);

impl SdkBlob {
    /// Parse into a structured chain. Total: every input maps to `Ok` or a
    /// specific [`InvalidTokenError`].
    pub fn parse(&self) -> Result<TokenChain, InvalidTokenError> {
        if !self.0.is_object() {
            return Err(InvalidTokenError::NotAnObject);
        }
        let chain: TokenChain = serde_json::from_value(self.0.clone())
            .map_err(|_| InvalidTokenError::BadField("genesis"))?;
        chain.validate()?;
        Ok(chain)
    }
}

impl From<&TokenChain> for SdkBlob {
    fn from(chain: &TokenChain) -> Self {
        Self(serde_json::to_value(chain).expect("chains always serialize"))
    }
}

/// The structured form of a token blob.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenChain {
    pub genesis: Genesis,
    #[serde(default)]
    pub transactions: Vec<Transition>,
}

/// The token's immutable birth record. Its owner and salt define the
/// genesis state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Genesis {
    pub token_id: TokenId,
    pub coin_id: CoinId,
    pub amount: Amount,
    /// 66-hex compressed chain pubkey of the genesis owner.
    pub owner: String,
    /// Hex salt distinguishing otherwise-identical states.
    pub salt: String,
}

impl Genesis {
    pub fn state(&self) -> TokenState {
        TokenState {
            owner: self.owner.clone(),
            salt: self.salt.clone(),
        }
    }
}

/// One ownership state in a token's life.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenState {
    /// 66-hex compressed chain pubkey, or [`BURNED_OWNER`].
    pub owner: String,
    pub salt: String,
}

impl TokenState {
    /// The hash the aggregator commits: binds the token id so states of
    /// different tokens can never collide.
    pub fn hash(&self, token_id: &TokenId) -> StateHash {
        StateHash::from(sha256::digest_many(&[
            b"sphere/token-state/v1",
            token_id.as_slice(),
            self.owner.as_bytes(),
            self.salt.as_bytes(),
        ]))
    }
}

/// A state transition. Committed iff it carries an inclusion proof.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Hash of the state this transition spends.
    pub source: StateHash,
    /// The new state.
    pub state: TokenState,
    /// Aggregator inclusion proof; `None` while pending confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<InclusionProof>,
}

impl TokenChain {
    /// Structural validation: every transition references the previous state
    /// hash, and no committed transition follows an uncommitted one.
    pub fn validate(&self) -> Result<(), InvalidTokenError> {
        if self.genesis.owner.is_empty() || !is_hex_owner(&self.genesis.owner) {
            return Err(InvalidTokenError::BadField("genesis.owner"));
        }

        let mut prev_hash = self.genesis.state().hash(&self.genesis.token_id);
        let mut seen_uncommitted = false;
        for (index, transition) in self.transactions.iter().enumerate() {
            if transition.source != prev_hash {
                return Err(InvalidTokenError::BrokenChain { index });
            }
            match &transition.proof {
                Some(_) if seen_uncommitted =>
                    return Err(InvalidTokenError::CommittedAfterUncommitted {
                        index,
                    }),
                Some(_) => (),
                None => seen_uncommitted = true,
            }
            prev_hash = transition.state.hash(&self.genesis.token_id);
        }
        Ok(())
    }

    /// The current (latest) state.
    pub fn current_state(&self) -> TokenState {
        self.transactions
            .last()
            .map(|t| t.state.clone())
            .unwrap_or_else(|| self.genesis.state())
    }

    pub fn current_state_hash(&self) -> StateHash {
        self.current_state().hash(&self.genesis.token_id)
    }

    /// The state the pending tail spends and its owner, if the tail is
    /// uncommitted. This is what `resolve_unconfirmed` polls for.
    pub fn pending_tail(&self) -> Option<PendingTail> {
        let last = self.transactions.last()?;
        if last.proof.is_some() {
            return None;
        }
        let previous_state = match self.transactions.len() {
            1 => self.genesis.state(),
            n => self.transactions[n - 2].state.clone(),
        };
        Some(PendingTail {
            previous_owner: previous_state.owner.clone(),
            previous_state_hash: previous_state.hash(&self.genesis.token_id),
        })
    }

    /// Number of committed transitions (the committed prefix).
    pub fn committed_len(&self) -> usize {
        self.transactions
            .iter()
            .take_while(|t| t.proof.is_some())
            .count()
    }

    pub fn is_fully_committed(&self) -> bool {
        self.transactions.iter().all(|t| t.proof.is_some())
    }

    /// Attach `proof` to the uncommitted tail.
    pub fn commit_tail(&mut self, proof: InclusionProof) {
        if let Some(last) = self.transactions.last_mut() {
            if last.proof.is_none() {
                last.proof = Some(proof);
            }
        }
    }

    /// The status implied by the chain alone (never `Spent`; spent detection
    /// is the validator's job).
    pub fn implied_status(&self) -> TokenStatus {
        if self.is_fully_committed() {
            TokenStatus::Confirmed
        } else {
            TokenStatus::Unconfirmed
        }
    }
}

/// See [`TokenChain::pending_tail`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingTail {
    /// 66-hex chain pubkey owning the spent state (the predicate pubkey).
    pub previous_owner: String,
    pub previous_state_hash: StateHash,
}

fn is_hex_owner(owner: &str) -> bool {
    owner == BURNED_OWNER || hex::is_hex_of_len(owner, 33)
}

#[cfg(test)]
mod test {
    use sphere_common::rng::{FastRng, RngExt};

    use super::*;
    use crate::aggregator::test_proof;

    fn hex_owner(byte: u8) -> String {
        hex::encode(&[byte; 33])
    }

    fn chain(byte: u8, amount: u128) -> TokenChain {
        let mut rng = FastRng::from_u64(byte as u64);
        TokenChain {
            genesis: Genesis {
                token_id: TokenId::from_array(rng.gen_bytes32()),
                coin_id: CoinId::from_array([1; 32]),
                amount: Amount::from_u128(amount),
                owner: hex_owner(byte),
                salt: hex::encode(&rng.gen_bytes16()),
            },
            transactions: vec![],
        }
    }

    fn extend(chain: &mut TokenChain, new_owner: String, committed: bool) {
        let source = chain.current_state_hash();
        chain.transactions.push(Transition {
            source,
            state: TokenState {
                owner: new_owner,
                salt: "aa".to_owned(),
            },
            proof: committed.then(test_proof),
        });
    }

    #[test]
    fn blob_roundtrip_preserves_unknown_fields() {
        let chain = chain(1, 100);
        let mut value = serde_json::to_value(&chain).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("vendor_extension".to_owned(), serde_json::json!({"x": 1}));

        let blob = SdkBlob(value.clone());
        blob.parse().unwrap();
        // The opaque form still carries the extension.
        assert_eq!(blob.0, value);
    }

    #[test]
    fn genesis_only_chain_is_confirmed() {
        let chain = chain(1, 100);
        chain.validate().unwrap();
        assert_eq!(chain.implied_status(), TokenStatus::Confirmed);
        assert_eq!(chain.pending_tail(), None);
        assert_eq!(chain.committed_len(), 0);
    }

    #[test]
    fn chain_continuity_is_enforced() {
        let mut c = chain(1, 100);
        extend(&mut c, hex_owner(2), true);
        c.validate().unwrap();

        // Break the link.
        c.transactions[0].source = StateHash::from_array([9; 32]);
        assert_eq!(
            c.validate(),
            Err(InvalidTokenError::BrokenChain { index: 0 })
        );
    }

    #[test]
    fn committed_after_uncommitted_is_invalid() {
        let mut c = chain(1, 100);
        extend(&mut c, hex_owner(2), false);
        extend(&mut c, hex_owner(3), true);
        assert_eq!(
            c.validate(),
            Err(InvalidTokenError::CommittedAfterUncommitted { index: 1 })
        );
    }

    #[test]
    fn pending_tail_names_the_predicate_owner() {
        let mut c = chain(1, 100);
        extend(&mut c, hex_owner(2), true);
        extend(&mut c, hex_owner(3), false);

        let tail = c.pending_tail().unwrap();
        assert_eq!(tail.previous_owner, hex_owner(2));
        assert_eq!(
            tail.previous_state_hash,
            c.transactions[0].state.hash(&c.genesis.token_id),
        );
        assert_eq!(c.implied_status(), TokenStatus::Unconfirmed);

        c.commit_tail(test_proof());
        assert_eq!(c.pending_tail(), None);
        assert_eq!(c.implied_status(), TokenStatus::Confirmed);
    }

    #[test]
    fn state_hash_binds_token_id() {
        let state = TokenState {
            owner: hex_owner(1),
            salt: "ab".to_owned(),
        };
        let h1 = state.hash(&TokenId::from_array([1; 32]));
        let h2 = state.hash(&TokenId::from_array([2; 32]));
        assert_ne!(h1, h2);
    }

    #[test]
    fn malformed_blobs_are_total_errors() {
        assert!(SdkBlob(serde_json::json!("string")).parse().is_err());
        assert!(SdkBlob(serde_json::json!({})).parse().is_err());
        assert!(SdkBlob(serde_json::json!({"genesis": {"bad": true}}))
            .parse()
            .is_err());

        let mut c = chain(1, 5);
        c.genesis.owner = "not hex".to_owned();
        assert_eq!(
            SdkBlob::from(&c).parse(),
            Err(InvalidTokenError::BadField("genesis.owner"))
        );
    }
}
