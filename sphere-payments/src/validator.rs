//! Spent-token detection.
//!
//! For each live token, the validator recomputes the current state hash from
//! the parsed blob, forms `RequestId = H(wallet_pubkey, state_hash)`, and
//! asks the aggregator. An inclusion proof means we committed this state as
//! the input to another transition, i.e. the token is spent. This is the
//! safety net behind transfer bookkeeping: if a send completed on the
//! aggregator but a crash prevented the local archive, the next verify pass
//! surfaces it.

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::Duration,
};

use lru::LruCache;
use sphere_common::{
    hex,
    ids::{RequestId, StateHash, TokenId},
    time::TimestampMs,
};
use tracing::{debug, instrument, warn};

use crate::{
    aggregator::{Aggregator, AggregatorError, ProofResponse},
    token::TokenRecord,
};

const CACHE_SIZE: usize = 1024;
/// Unspent verdicts go stale; spent is forever (within a session).
const UNSPENT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TokenVerdictKind {
    Unspent,
    Spent,
    Invalid,
}

#[derive(Clone, Debug)]
pub struct TokenVerdict {
    pub token_id: TokenId,
    pub state_hash: Option<StateHash>,
    pub kind: TokenVerdictKind,
    pub detail: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct CacheEntry {
    kind: TokenVerdictKind,
    at: TimestampMs,
}

/// Classifies live tokens as unspent/spent/invalid, with caching.
pub struct TokenValidator {
    /// 66-hex compressed chain pubkey whose spends we're looking for.
    wallet_pubkey_hex: String,
    cache: Mutex<LruCache<(TokenId, StateHash, String), CacheEntry>>,
}

impl TokenValidator {
    pub fn new(wallet_pubkey_hex: String) -> Self {
        Self {
            wallet_pubkey_hex,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("nonzero const"),
            )),
        }
    }

    /// Classify one token. Transient aggregator failures surface as errors
    /// rather than verdicts; the caller decides whether to retry.
    #[instrument(skip_all, name = "(verify-token)")]
    pub async fn verify(
        &self,
        aggregator: &dyn Aggregator,
        record: &TokenRecord,
    ) -> Result<TokenVerdict, AggregatorError> {
        // Compute the state hash from the blob itself, never from stored
        // metadata: a local split mutates the serialized state.
        let state_hash = match record.current_state_hash() {
            Ok(state_hash) => state_hash,
            Err(err) => {
                warn!("Token {} failed to parse: {err}", record.local_id);
                return Ok(TokenVerdict {
                    token_id: record.token_id,
                    state_hash: None,
                    kind: TokenVerdictKind::Invalid,
                    detail: Some(err.to_string()),
                });
            }
        };

        let cache_key =
            (record.token_id, state_hash, self.wallet_pubkey_hex.clone());
        if let Some(kind) = self.cached_verdict(&cache_key) {
            return Ok(TokenVerdict {
                token_id: record.token_id,
                state_hash: Some(state_hash),
                kind,
                detail: None,
            });
        }

        let pubkey_bytes = hex::decode(&self.wallet_pubkey_hex)
            .expect("validator pubkey is always valid hex");
        let request_id = RequestId::compute(&pubkey_bytes, &state_hash);

        let kind = match aggregator.get_proof(request_id).await? {
            ProofResponse::Inclusion(proof) =>
                if proof.indicates_spent(&request_id) {
                    TokenVerdictKind::Spent
                } else {
                    // Path exists but no authenticator: not spent by us.
                    TokenVerdictKind::Unspent
                },
            ProofResponse::Exclusion(_) => TokenVerdictKind::Unspent,
        };
        debug!("Token {} verdict: {kind:?}", record.local_id);

        self.cache.lock().unwrap().put(
            cache_key,
            CacheEntry {
                kind,
                at: TimestampMs::now(),
            },
        );

        Ok(TokenVerdict {
            token_id: record.token_id,
            state_hash: Some(state_hash),
            kind,
            detail: None,
        })
    }

    fn cached_verdict(
        &self,
        key: &(TokenId, StateHash, String),
    ) -> Option<TokenVerdictKind> {
        let mut cache = self.cache.lock().unwrap();
        let entry = *cache.get(key)?;
        match entry.kind {
            // Spent is permanent for the session.
            TokenVerdictKind::Spent => Some(TokenVerdictKind::Spent),
            TokenVerdictKind::Unspent | TokenVerdictKind::Invalid => {
                let age = TimestampMs::now().saturating_since(entry.at);
                if age < UNSPENT_TTL {
                    Some(entry.kind)
                } else {
                    cache.pop(key);
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use sphere_common::{
        amount::Amount,
        ids::{CoinId, LocalTokenId},
        rng::{FastRng, RngExt},
    };

    use super::*;
    use crate::{
        aggregator::{Commitment, MockAggregator},
        token::{Genesis, SdkBlob, TokenChain, TokenStatus},
    };

    fn wallet_pubkey() -> String {
        hex::encode(&[2; 33])
    }

    fn record(seed: u64) -> TokenRecord {
        let mut rng = FastRng::from_u64(seed);
        let chain = TokenChain {
            genesis: Genesis {
                token_id: TokenId::from_array(rng.gen_bytes32()),
                coin_id: CoinId::from_array([1; 32]),
                amount: Amount::from_u128(10),
                owner: wallet_pubkey(),
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
            symbol: None,
            decimals: None,
            created_at: TimestampMs::from_ms(1).unwrap(),
            updated_at: TimestampMs::from_ms(1).unwrap(),
            blob: SdkBlob::from(&chain),
        }
    }

    async fn mark_spent(aggregator: &MockAggregator, record: &TokenRecord) {
        let state_hash = record.current_state_hash().unwrap();
        let request_id = RequestId::compute(
            &hex::decode(&wallet_pubkey()).unwrap(),
            &state_hash,
        );
        aggregator
            .submit_commitment(Commitment {
                request_id,
                payload: StateHash::from_array([9; 32]),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unspent_token_is_unspent() {
        let aggregator = MockAggregator::new();
        let validator = TokenValidator::new(wallet_pubkey());
        let verdict = validator.verify(&aggregator, &record(1)).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Unspent);
    }

    #[tokio::test]
    async fn committed_state_is_spent() {
        let aggregator = MockAggregator::new();
        let validator = TokenValidator::new(wallet_pubkey());
        let token = record(1);
        mark_spent(&aggregator, &token).await;

        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Spent);
        assert_eq!(
            verdict.state_hash,
            Some(token.current_state_hash().unwrap())
        );
    }

    #[tokio::test]
    async fn spent_verdict_is_cached_for_the_session() {
        let aggregator = MockAggregator::new();
        let validator = TokenValidator::new(wallet_pubkey());
        let token = record(1);
        mark_spent(&aggregator, &token).await;

        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Spent);

        // Even with the aggregator offline the cached spent verdict holds.
        aggregator.set_offline(true);
        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Spent);
    }

    #[tokio::test]
    async fn unspent_verdict_is_cached_but_transient() {
        let aggregator = MockAggregator::new();
        let validator = TokenValidator::new(wallet_pubkey());
        let token = record(1);

        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Unspent);

        // Cached: an offline aggregator doesn't matter within the TTL.
        aggregator.set_offline(true);
        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Unspent);
    }

    #[tokio::test]
    async fn aggregator_outage_is_an_error_not_a_verdict() {
        let aggregator = MockAggregator::new();
        aggregator.set_offline(true);
        let validator = TokenValidator::new(wallet_pubkey());
        assert!(validator.verify(&aggregator, &record(1)).await.is_err());
    }

    #[tokio::test]
    async fn unparseable_token_is_invalid() {
        let aggregator = MockAggregator::new();
        let validator = TokenValidator::new(wallet_pubkey());
        let mut token = record(1);
        token.blob = SdkBlob(serde_json::json!({"garbage": true}));
        let verdict = validator.verify(&aggregator, &token).await.unwrap();
        assert_eq!(verdict.kind, TokenVerdictKind::Invalid);
    }
}
