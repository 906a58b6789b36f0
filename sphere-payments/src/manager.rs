//! The payments manager: single source of truth for the live inventory.
//!
//! All mutation goes through this type. Each state update is staged the same
//! way: check (validate the proposed transition), persist (token store),
//! commit (the in-memory map), then schedule a sidecar snapshot publish. A
//! per-coin lock serializes `send` and `resolve_unconfirmed` so token
//! selection never races.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use sphere_common::{
    amount::Amount,
    error::WalletError,
    hex,
    ids::{CoinId, LocalTokenId, RequestId, TransferId},
    rng::{RngExt, SysRng},
    time::TimestampMs,
};
use sphere_sidecar::{SidecarError, SidecarStorage};
use sphere_store::Ffs;
use sphere_tokio::{events_bus::EventsBus, task::SpTask};
use sphere_transport::{
    InboundTransfer, PeerInfo, SenderInfo, TokenTransferPayload, Transport,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    aggregator::{Aggregator, AggregatorError, ProofResponse},
    executor::{
        self, AddressMode, SendRequest, TransferMode, TransferResult, TransferStage,
    },
    registry::{RateSource, TokenRegistry},
    snapshot::{
        self, HistoryDirection, HistoryEntry, InventorySnapshot, Tombstone,
        TombstoneReason,
    },
    storage::{TokenStore, ValidationIssue},
    token::{SdkBlob, TokenRecord, TokenStatus},
    validator::{TokenValidator, TokenVerdict, TokenVerdictKind},
};

/// Pause between finalize passes in `receive`.
const FINALIZE_PASS_INTERVAL: Duration = Duration::from_secs(1);

/// The identity facts payments needs; the facade owns the rest.
#[derive(Clone, Debug)]
pub struct WalletIdentity {
    /// 66-hex compressed chain pubkey. Token states we own name this key.
    pub chain_pubkey_hex: String,
    pub l1_address: String,
    pub nametag: Option<String>,
}

/// Per-coin balance aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct CoinBalance {
    pub coin_id: CoinId,
    pub symbol: String,
    pub decimals: u8,
    pub confirmed_amount: Amount,
    pub unconfirmed_amount: Amount,
    pub total_amount: Amount,
    pub token_count: usize,
    pub confirmed_token_count: usize,
    pub unconfirmed_token_count: usize,
    /// Best-effort fiat value; `None` when no rate source answers.
    pub fiat_value: Option<f64>,
}

#[derive(Default)]
pub struct ReceiveOptions {
    /// Keep resolving until every unconfirmed token confirms (or deadline).
    pub finalize: bool,
    pub deadline: Option<Duration>,
    /// Called once per finalize pass.
    #[allow(clippy::type_complexity)]
    pub on_progress: Option<Box<dyn Fn(ReceiveProgress) + Send + Sync>>,
}

#[derive(Copy, Clone, Debug)]
pub struct ReceiveProgress {
    pub still_pending: usize,
    pub resolved: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ReceiveResult {
    pub received: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub timed_out: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ResolveOutcome {
    pub resolved: usize,
    pub still_pending: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub conflicts: usize,
}

#[derive(Clone, Debug)]
pub enum PaymentsEvent {
    TokenReceived { local_id: LocalTokenId },
    TokenConfirmed { local_id: LocalTokenId },
    TokenArchived { local_id: LocalTokenId },
    TransferCompleted { transfer_id: TransferId },
}

/// A delivery that failed at the transport and awaits retransmission.
#[derive(Clone, Debug)]
struct PendingDelivery {
    recipient_transport_pubkey: String,
    payload: TokenTransferPayload,
}

struct InventoryData {
    live: BTreeMap<LocalTokenId, TokenRecord>,
    tombstones: Vec<Tombstone>,
    history: Vec<HistoryEntry>,
    issues: Vec<ValidationIssue>,
    /// Receive-side idempotency: transfers already applied.
    seen_transfers: HashSet<(String, TransferId, sphere_common::ids::TokenId)>,
    /// Deliveries to retransmit (transport failed after mint).
    pending_deliveries: Vec<PendingDelivery>,
}

#[derive(Clone)]
pub struct PaymentsManager {
    inner: Arc<PaymentsInner>,
}

struct PaymentsInner {
    identity: WalletIdentity,
    store: TokenStore,
    transport: Transport,
    sidecar: SidecarStorage<Arc<dyn Ffs>>,
    aggregator: Arc<dyn Aggregator>,
    registry: TokenRegistry,
    rate_source: Option<Arc<dyn RateSource>>,
    validator: TokenValidator,
    data: tokio::sync::Mutex<InventoryData>,
    coin_locks: StdMutex<HashMap<CoinId, Arc<tokio::sync::Mutex<()>>>>,
    pending_ops: StdMutex<Vec<SpTask<()>>>,
    events: EventsBus<PaymentsEvent>,
}

impl PaymentsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: WalletIdentity,
        store: TokenStore,
        transport: Transport,
        sidecar: SidecarStorage<Arc<dyn Ffs>>,
        aggregator: Arc<dyn Aggregator>,
        registry: TokenRegistry,
        rate_source: Option<Arc<dyn RateSource>>,
    ) -> Self {
        let validator = TokenValidator::new(identity.chain_pubkey_hex.clone());
        Self {
            inner: Arc::new(PaymentsInner {
                identity,
                store,
                transport,
                sidecar,
                aggregator,
                registry,
                rate_source,
                validator,
                data: tokio::sync::Mutex::new(InventoryData {
                    live: BTreeMap::new(),
                    tombstones: Vec::new(),
                    history: Vec::new(),
                    issues: Vec::new(),
                    seen_transfers: HashSet::new(),
                    pending_deliveries: Vec::new(),
                }),
                coin_locks: StdMutex::new(HashMap::new()),
                pending_ops: StdMutex::new(Vec::new()),
                events: EventsBus::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventsBus<PaymentsEvent> {
        &self.inner.events
    }

    /// Rebuild the in-memory inventory from the token store. Records that
    /// fail structural validation are dropped and recorded as issues.
    #[instrument(skip_all, name = "(payments-load)")]
    pub async fn load(&self) -> Result<(), WalletError> {
        let (records, issues) = self
            .inner
            .store
            .load_live()
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        let tombstones = self
            .inner
            .store
            .load_tombstones()
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        let history = self
            .inner
            .store
            .load_history()
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;

        let mut data = self.inner.data.lock().await;
        data.live = records
            .into_iter()
            .map(|record| (record.local_id, record))
            .collect();
        // The seen-transfer set is per-session. Replays that arrive after a
        // restart are caught by the live-set and tombstone checks instead.
        data.seen_transfers = HashSet::new();
        data.tombstones = tombstones;
        data.history = history;
        data.issues = issues;
        info!(
            "Loaded {} live tokens, {} tombstones",
            data.live.len(),
            data.tombstones.len(),
        );
        Ok(())
    }

    /// All live tokens, cloned.
    pub async fn tokens(&self) -> Vec<TokenRecord> {
        self.inner.data.lock().await.live.values().cloned().collect()
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.data.lock().await.history.clone()
    }

    pub async fn tombstones(&self) -> Vec<Tombstone> {
        self.inner.data.lock().await.tombstones.clone()
    }

    pub async fn validation_issues(&self) -> Vec<ValidationIssue> {
        self.inner.data.lock().await.issues.clone()
    }

    /// Per-coin balances over the live inventory.
    pub async fn balances(&self) -> Vec<CoinBalance> {
        let data = self.inner.data.lock().await;
        let mut by_coin: BTreeMap<CoinId, Vec<&TokenRecord>> = BTreeMap::new();
        for record in data.live.values() {
            by_coin.entry(record.coin_id).or_default().push(record);
        }
        by_coin
            .into_iter()
            .map(|(coin_id, records)| self.aggregate_balance(coin_id, &records))
            .collect()
    }

    pub async fn balance(&self, coin_id: &CoinId) -> CoinBalance {
        let data = self.inner.data.lock().await;
        let records: Vec<&TokenRecord> = data
            .live
            .values()
            .filter(|record| record.coin_id == *coin_id)
            .collect();
        self.aggregate_balance(*coin_id, &records)
    }

    fn aggregate_balance(&self, coin_id: CoinId, records: &[&TokenRecord]) -> CoinBalance {
        let definition = self.inner.registry.get_or_fallback(&coin_id);
        let mut balance = CoinBalance {
            coin_id,
            symbol: definition.symbol,
            decimals: definition.decimals,
            confirmed_amount: Amount::ZERO,
            unconfirmed_amount: Amount::ZERO,
            total_amount: Amount::ZERO,
            token_count: 0,
            confirmed_token_count: 0,
            unconfirmed_token_count: 0,
            fiat_value: None,
        };
        for record in records {
            balance.token_count += 1;
            balance.total_amount = balance.total_amount.saturating_add(record.amount);
            match record.status {
                TokenStatus::Confirmed => {
                    balance.confirmed_token_count += 1;
                    balance.confirmed_amount =
                        balance.confirmed_amount.saturating_add(record.amount);
                }
                TokenStatus::Unconfirmed => {
                    balance.unconfirmed_token_count += 1;
                    balance.unconfirmed_amount =
                        balance.unconfirmed_amount.saturating_add(record.amount);
                }
                // Spent/failed tokens shouldn't be live, but if one slips
                // through it must not count toward spendable balance.
                TokenStatus::Spent | TokenStatus::Failed => (),
            }
        }
        balance.fiat_value = self
            .inner
            .rate_source
            .as_ref()
            .and_then(|source| source.rate(&coin_id))
            .map(|rate| balance.total_amount.to_f64() * rate);
        balance
    }

    // --- Send --- //

    /// Execute a transfer.
    #[instrument(skip_all, name = "(send)")]
    pub async fn send(&self, request: SendRequest) -> Result<TransferResult, WalletError> {
        if request.amount.is_zero() {
            return Err(WalletError::InvalidInput(
                "amount must be positive".to_owned(),
            ));
        }
        if !self.inner.transport.is_connected().await {
            return Err(WalletError::NotConnected);
        }

        // Flush older failed deliveries first so retransmissions keep their
        // ordering relative to new sends.
        self.retry_pending_deliveries().await;

        let recipient = self
            .resolve_recipient(&request.recipient, request.address_mode)
            .await?;

        // Per-coin lock: two concurrent sends can't select the same inputs.
        let coin_lock = self.coin_lock(&request.coin_id);
        let _coin_guard = coin_lock.lock().await;

        let asset_kind = self.inner.registry.asset_kind(&request.coin_id);
        let selection = {
            let data = self.inner.data.lock().await;
            executor::select_inputs(
                &data.live,
                &request.coin_id,
                request.amount,
                asset_kind,
            )?
        };
        debug!(
            "Selected {} input(s) totalling {}",
            selection.inputs.len(),
            selection.total,
        );

        let transfer_id = TransferId::generate(&mut SysRng::new());
        let mut change_local_ids = Vec::new();
        let mut remaining = request.amount;

        for input in &selection.inputs {
            let portion = remaining.min(input.amount);
            let is_split = portion < input.amount;
            if is_split {
                let change_id = self
                    .execute_split(
                        &request,
                        transfer_id,
                        &recipient,
                        input,
                        portion,
                    )
                    .await?;
                change_local_ids.push(change_id);
            } else {
                self.execute_whole(&request, transfer_id, &recipient, input)
                    .await?;
            }
            remaining = remaining
                .checked_sub(portion)
                .expect("portion never exceeds remaining");
        }
        debug_assert!(remaining.is_zero());

        // History: one entry per send.
        let definition = self.inner.registry.get_or_fallback(&request.coin_id);
        let entry = HistoryEntry {
            timestamp: TimestampMs::now(),
            direction: HistoryDirection::Sent,
            coin_id: request.coin_id,
            amount: request.amount,
            symbol: definition.symbol,
            counterparty_nametag: recipient.nametag.clone(),
            counterparty_pubkey: Some(recipient.chain_pubkey.clone()),
            transfer_id,
        };
        {
            let mut data = self.inner.data.lock().await;
            data.history.push(entry.clone());
        }
        if let Err(err) = self.inner.store.append_history(&entry) {
            warn!("Could not persist history entry: {err:#}");
        }

        self.publish_snapshot().await;
        self.inner
            .events
            .notify(PaymentsEvent::TransferCompleted { transfer_id });

        let stage = match request.transfer_mode {
            TransferMode::Conservative => TransferStage::Completed,
            TransferMode::Instant => TransferStage::Delivered,
        };
        Ok(TransferResult {
            transfer_id,
            recipient,
            amount: request.amount,
            coin_id: request.coin_id,
            mode: request.transfer_mode,
            stage,
            change_local_ids,
        })
    }

    /// Whole transfer: a single commit transition on the input, then
    /// delivery. No split, no mint.
    async fn execute_whole(
        &self,
        request: &SendRequest,
        transfer_id: TransferId,
        recipient: &PeerInfo,
        input: &TokenRecord,
    ) -> Result<(), WalletError> {
        let mut rng = SysRng::new();
        let mut chain = input
            .blob
            .parse()
            .map_err(|err| WalletError::InvalidToken(err.to_string()))?;
        let source = chain.current_state_hash();
        executor::append_transfer(&mut chain, &recipient.chain_pubkey, &mut rng);
        let target = chain.current_state_hash();

        let proof = match request.transfer_mode {
            TransferMode::Conservative => Some(
                executor::commit_and_prove(
                    self.inner.aggregator.as_ref(),
                    &self.inner.identity.chain_pubkey_hex,
                    source,
                    target,
                )
                .await?,
            ),
            TransferMode::Instant => None,
        };
        if let Some(proof) = proof.clone() {
            chain.commit_tail(proof);
        }

        // The input leaves the live set no matter what happens to delivery;
        // the recipient-bound token is retransmitted if transport fails.
        self.archive_input(input, &chain).await?;

        if request.transfer_mode == TransferMode::Instant {
            self.spawn_finalization(
                transfer_id,
                vec![FinalizeCommit {
                    owner_pubkey_hex: self.inner.identity.chain_pubkey_hex.clone(),
                    source,
                    target,
                    change_local_id: None,
                }],
            );
        }

        self.deliver(
            transfer_id,
            recipient,
            SdkBlob::from(&chain),
            proof.map(|p| serde_json::to_value(p).expect("proofs serialize")),
        )
        .await
    }

    /// Split transfer: burn the input, mint a recipient token of exactly
    /// `portion` and a change token of the rest back to ourselves.
    async fn execute_split(
        &self,
        request: &SendRequest,
        transfer_id: TransferId,
        recipient: &PeerInfo,
        input: &TokenRecord,
        portion: Amount,
    ) -> Result<LocalTokenId, WalletError> {
        let mut rng = SysRng::new();
        let me = self.inner.identity.chain_pubkey_hex.clone();
        let change_amount = input
            .amount
            .checked_sub(portion)
            .expect("split portion is less than the input amount");

        // S0 Prepared: construct both successors with uncommitted tails.
        let mut recipient_chain = executor::mint_successor_chain(
            &mut rng,
            &me,
            &recipient.chain_pubkey,
            request.coin_id,
            portion,
        );
        let mut change_chain = executor::mint_successor_chain(
            &mut rng,
            &me,
            &me,
            request.coin_id,
            change_amount,
        );

        // Burn of the input binds the successor token ids.
        let mut input_chain = input
            .blob
            .parse()
            .map_err(|err| WalletError::InvalidToken(err.to_string()))?;
        let burn_source = input_chain.current_state_hash();
        executor::append_burn(
            &mut input_chain,
            &[
                recipient_chain.genesis.token_id,
                change_chain.genesis.token_id,
            ],
        );
        let burn_target = input_chain.current_state_hash();

        let recipient_mint = MintStep::of(&recipient_chain);
        let change_mint = MintStep::of(&change_chain);

        match request.transfer_mode {
            TransferMode::Conservative => {
                // S1 Burning: the input is burn-committed on the aggregator.
                let burn_proof = executor::commit_and_prove(
                    self.inner.aggregator.as_ref(),
                    &me,
                    burn_source,
                    burn_target,
                )
                .await?;
                input_chain.commit_tail(burn_proof);
                // Tombstone for the input is written at the S1 -> S2 edge.
                self.archive_input(input, &input_chain).await?;

                // S2 Minting: both successors get their inclusion proofs.
                let recipient_proof = executor::commit_and_prove(
                    self.inner.aggregator.as_ref(),
                    &me,
                    recipient_mint.source,
                    recipient_mint.target,
                )
                .await?;
                recipient_chain.commit_tail(recipient_proof.clone());

                let change_proof = executor::commit_and_prove(
                    self.inner.aggregator.as_ref(),
                    &me,
                    change_mint.source,
                    change_mint.target,
                )
                .await?;
                change_chain.commit_tail(change_proof);

                let change_id = self
                    .insert_minted_change(&change_chain, request, TokenStatus::Confirmed)
                    .await?;

                // S3 Transferring: publish the transfer event.
                self.deliver(
                    transfer_id,
                    recipient,
                    SdkBlob::from(&recipient_chain),
                    Some(
                        serde_json::to_value(recipient_proof)
                            .expect("proofs serialize"),
                    ),
                )
                .await?;
                Ok(change_id)
            }
            TransferMode::Instant => {
                // S1 SplitLocal: both successors exist only locally, with
                // uncommitted tails. The input is archived immediately.
                self.archive_input(input, &input_chain).await?;
                let change_id = self
                    .insert_minted_change(&change_chain, request, TokenStatus::Unconfirmed)
                    .await?;

                // S2 Delivered: the recipient sees an unconfirmed token one
                // round trip after send.
                self.deliver(
                    transfer_id,
                    recipient,
                    SdkBlob::from(&recipient_chain),
                    None,
                )
                .await?;

                // S3 Finalized happens in the background.
                self.spawn_finalization(
                    transfer_id,
                    vec![
                        FinalizeCommit {
                            owner_pubkey_hex: me.clone(),
                            source: burn_source,
                            target: burn_target,
                            change_local_id: None,
                        },
                        FinalizeCommit {
                            owner_pubkey_hex: me.clone(),
                            source: recipient_mint.source,
                            target: recipient_mint.target,
                            change_local_id: None,
                        },
                        FinalizeCommit {
                            owner_pubkey_hex: me,
                            source: change_mint.source,
                            target: change_mint.target,
                            change_local_id: Some(change_id),
                        },
                    ],
                );
                Ok(change_id)
            }
        }
    }

    /// Archive a spent input: Sent-folder copy, tombstone, live-map removal.
    async fn archive_input(
        &self,
        input: &TokenRecord,
        final_chain: &crate::token::TokenChain,
    ) -> Result<(), WalletError> {
        let mut archived = input.clone();
        archived.status = TokenStatus::Spent;
        archived.updated_at = TimestampMs::now();
        archived.blob = SdkBlob::from(final_chain);

        let tombstone = Tombstone {
            token_id: input.token_id,
            // The state the wallet held before this transfer; a stale remote
            // copy of the token sits at exactly this state.
            state_hash: input
                .current_state_hash()
                .map_err(|err| WalletError::InvalidToken(err.to_string()))?,
            archived_at: TimestampMs::now(),
            reason: TombstoneReason::Sent,
        };

        self.inner
            .store
            .archive(&archived)
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        if let Err(err) = self.inner.store.append_tombstone(&tombstone) {
            warn!("Could not persist tombstone: {err:#}");
        }

        let mut data = self.inner.data.lock().await;
        data.live.remove(&input.local_id);
        data.tombstones.push(tombstone);
        drop(data);

        self.inner
            .events
            .notify(PaymentsEvent::TokenArchived { local_id: input.local_id });
        Ok(())
    }

    /// Add a freshly minted change token to the live inventory.
    async fn insert_minted_change(
        &self,
        chain: &crate::token::TokenChain,
        request: &SendRequest,
        status: TokenStatus,
    ) -> Result<LocalTokenId, WalletError> {
        let definition = self.inner.registry.get_or_fallback(&request.coin_id);
        let now = TimestampMs::now();
        let record = TokenRecord {
            local_id: LocalTokenId::generate(&mut SysRng::new()),
            token_id: chain.genesis.token_id,
            coin_id: request.coin_id,
            amount: chain.genesis.amount,
            status,
            symbol: Some(definition.symbol),
            decimals: Some(definition.decimals),
            created_at: now,
            updated_at: now,
            blob: SdkBlob::from(chain),
        };
        self.inner
            .store
            .upsert_live(&record)
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        let local_id = record.local_id;
        self.inner.data.lock().await.live.insert(local_id, record);
        Ok(local_id)
    }

    /// Publish the transfer event; on transport failure, queue the payload
    /// for retransmission and surface a partial failure.
    async fn deliver(
        &self,
        transfer_id: TransferId,
        recipient: &PeerInfo,
        token_blob: SdkBlob,
        proof: Option<serde_json::Value>,
    ) -> Result<(), WalletError> {
        let payload = TokenTransferPayload {
            token: token_blob.0,
            proof,
            memo: None,
            sender: SenderInfo {
                pubkey: self.inner.identity.chain_pubkey_hex.clone(),
                nametag: self.inner.identity.nametag.clone(),
            },
            transfer_id,
        };
        match self
            .inner
            .transport
            .send_token_transfer(&recipient.transport_pubkey, &payload)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Delivery failed, queueing retransmission: {err}");
                self.inner.data.lock().await.pending_deliveries.push(
                    PendingDelivery {
                        recipient_transport_pubkey: recipient
                            .transport_pubkey
                            .clone(),
                        payload,
                    },
                );
                Err(WalletError::TransferFailed {
                    stage: TransferStage::Transferring.as_str().to_owned(),
                    message: format!("transport delivery failed: {err}"),
                })
            }
        }
    }

    /// Retransmit queued deliveries. Receivers dedupe by transfer id, so
    /// this is safe to call at every opportunity.
    pub async fn retry_pending_deliveries(&self) {
        let pending = {
            let mut data = self.inner.data.lock().await;
            std::mem::take(&mut data.pending_deliveries)
        };
        for delivery in pending {
            if let Err(err) = self
                .inner
                .transport
                .send_token_transfer(
                    &delivery.recipient_transport_pubkey,
                    &delivery.payload,
                )
                .await
            {
                debug!("Retransmission still failing: {err}");
                self.inner
                    .data
                    .lock()
                    .await
                    .pending_deliveries
                    .push(delivery);
            }
        }
    }

    async fn resolve_recipient(
        &self,
        recipient: &str,
        address_mode: AddressMode,
    ) -> Result<PeerInfo, WalletError> {
        // Proxy mode forces the nametag-derived proxy address even when a
        // direct identifier would resolve.
        let identifier = match (sphere_transport::Identifier::parse(recipient), address_mode)
        {
            (Some(sphere_transport::Identifier::Nametag(name)), AddressMode::Proxy) =>
                sphere_transport::peer::proxy_address(&name),
            _ => recipient.to_owned(),
        };
        match self.inner.transport.resolve(&identifier).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(WalletError::InvalidRecipient(recipient.to_owned())),
            Err(err) => Err(WalletError::InvalidRecipient(format!(
                "{recipient}: {err}"
            ))),
        }
    }

    fn coin_lock(&self, coin_id: &CoinId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .coin_locks
            .lock()
            .unwrap()
            .entry(*coin_id)
            .or_default()
            .clone()
    }

    // --- Background finalization --- //

    fn spawn_finalization(&self, transfer_id: TransferId, commits: Vec<FinalizeCommit>) {
        let inner = Arc::clone(&self.inner);
        let manager = PaymentsManager { inner };
        let task = SpTask::spawn(format!("finalize-{transfer_id}"), async move {
            manager.run_finalization(commits).await;
        });
        self.inner.pending_ops.lock().unwrap().push(task);
    }

    async fn run_finalization(&self, commits: Vec<FinalizeCommit>) {
        for commit in commits {
            let proof = match executor::commit_and_prove(
                self.inner.aggregator.as_ref(),
                &commit.owner_pubkey_hex,
                commit.source,
                commit.target,
            )
            .await
            {
                Ok(proof) => proof,
                Err(err) => {
                    // Tokens stay unconfirmed; a later resolve pass can
                    // finish the job once the aggregator recovers.
                    warn!("Background finalization failed: {err}");
                    continue;
                }
            };
            if let Some(local_id) = commit.change_local_id {
                if let Err(err) = self.attach_proof(local_id, proof).await {
                    warn!("Could not attach change proof: {err:#}");
                }
            }
        }
        self.publish_snapshot().await;
    }

    async fn attach_proof(
        &self,
        local_id: LocalTokenId,
        proof: crate::aggregator::InclusionProof,
    ) -> anyhow::Result<()> {
        let mut data = self.inner.data.lock().await;
        let record = match data.live.get_mut(&local_id) {
            Some(record) => record,
            // Archived or merged away in the meantime.
            None => return Ok(()),
        };
        let mut chain = record.blob.parse().context("Change token unparseable")?;
        chain.commit_tail(proof);
        record.blob = SdkBlob::from(&chain);
        record.status = chain.implied_status();
        record.updated_at = TimestampMs::now();
        let record = record.clone();
        drop(data);

        self.inner
            .store
            .upsert_live(&record)
            .context("Change token persist failed")?;
        if record.status == TokenStatus::Confirmed {
            self.inner
                .events
                .notify(PaymentsEvent::TokenConfirmed { local_id });
        }
        Ok(())
    }

    /// Join outstanding background finalizations, up to `deadline`. Returns
    /// whether everything finished.
    pub async fn wait_for_pending_operations(&self, deadline: Duration) -> bool {
        let tasks: Vec<SpTask<()>> =
            std::mem::take(&mut *self.inner.pending_ops.lock().unwrap());
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        tokio::time::timeout(deadline, join_all).await.is_ok()
    }

    // --- Receive --- //

    /// Drain transport-delivered transfers; optionally keep resolving until
    /// every unconfirmed token confirms or the deadline passes.
    #[instrument(skip_all, name = "(receive)")]
    pub async fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Result<ReceiveResult, WalletError> {
        self.retry_pending_deliveries().await;

        let mut result = ReceiveResult::default();
        let inbound = self.inner.transport.drain_pending_transfers();
        for transfer in inbound {
            match self.apply_inbound_transfer(&transfer).await {
                Ok(true) => result.received += 1,
                Ok(false) => (),
                Err(err) => warn!("Rejecting inbound transfer: {err:#}"),
            }
        }
        if result.received > 0 {
            self.publish_snapshot().await;
        }

        if !options.finalize {
            let outcome = self.count_pending().await;
            result.still_pending = outcome;
            return Ok(result);
        }

        let started = tokio::time::Instant::now();
        loop {
            let outcome = self.resolve_unconfirmed().await?;
            result.resolved += outcome.resolved;
            result.still_pending = outcome.still_pending;
            if let Some(on_progress) = &options.on_progress {
                on_progress(ReceiveProgress {
                    still_pending: outcome.still_pending,
                    resolved: outcome.resolved,
                });
            }
            if outcome.still_pending == 0 {
                break;
            }
            if executor::deadline_elapsed(started, options.deadline) {
                result.timed_out = true;
                break;
            }
            tokio::time::sleep(FINALIZE_PASS_INTERVAL).await;
        }
        Ok(result)
    }

    /// Apply one inbound transfer. Returns whether a token was added;
    /// duplicates are a clean `false`.
    async fn apply_inbound_transfer(
        &self,
        transfer: &InboundTransfer,
    ) -> anyhow::Result<bool> {
        let blob = SdkBlob(transfer.payload.token.clone());
        let chain = blob
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid inbound token: {err}"))?;

        // The token must actually be ours.
        let current = chain.current_state();
        anyhow::ensure!(
            current.owner == self.inner.identity.chain_pubkey_hex,
            "inbound token is not owned by this wallet",
        );

        let key = (
            transfer.sender_transport_pubkey.clone(),
            transfer.payload.transfer_id,
            chain.genesis.token_id,
        );
        let current_hash = chain.current_state_hash();

        let mut data = self.inner.data.lock().await;
        if data.seen_transfers.contains(&key) {
            debug!("Duplicate transfer {}; ignoring", transfer.payload.transfer_id);
            return Ok(false);
        }
        // Tombstoned tokens never re-enter the live set.
        if data
            .tombstones
            .iter()
            .any(|t| t.token_id == chain.genesis.token_id && t.state_hash == current_hash)
        {
            return Ok(false);
        }
        // The same token at the same state may already be live (e.g. replay
        // with a different transfer id).
        if data.live.values().any(|record| {
            record.token_id == chain.genesis.token_id
                && record
                    .current_state_hash()
                    .map(|hash| hash == current_hash)
                    .unwrap_or(false)
        }) {
            data.seen_transfers.insert(key);
            return Ok(false);
        }

        let definition = self.inner.registry.get_or_fallback(&chain.genesis.coin_id);
        let now = TimestampMs::now();
        let record = TokenRecord {
            local_id: LocalTokenId::generate(&mut SysRng::new()),
            token_id: chain.genesis.token_id,
            coin_id: chain.genesis.coin_id,
            amount: chain.genesis.amount,
            status: chain.implied_status(),
            symbol: Some(definition.symbol.clone()),
            decimals: Some(definition.decimals),
            created_at: now,
            updated_at: now,
            blob,
        };

        let entry = HistoryEntry {
            timestamp: now,
            direction: HistoryDirection::Received,
            coin_id: record.coin_id,
            amount: record.amount,
            symbol: definition.symbol,
            counterparty_nametag: transfer.payload.sender.nametag.clone(),
            counterparty_pubkey: Some(transfer.payload.sender.pubkey.clone()),
            transfer_id: transfer.payload.transfer_id,
        };

        data.seen_transfers.insert(key);
        data.live.insert(record.local_id, record.clone());
        data.history.push(entry.clone());
        drop(data);

        self.inner
            .store
            .upsert_live(&record)
            .context("Inbound token persist failed")?;
        if let Err(err) = self.inner.store.append_history(&entry) {
            warn!("Could not persist history entry: {err:#}");
        }
        info!(
            "Received {} {} (status {})",
            record.amount,
            record.symbol.as_deref().unwrap_or("?"),
            record.status.as_str(),
        );
        self.inner
            .events
            .notify(PaymentsEvent::TokenReceived { local_id: record.local_id });
        Ok(true)
    }

    async fn count_pending(&self) -> usize {
        self.inner
            .data
            .lock()
            .await
            .live
            .values()
            .filter(|record| record.status == TokenStatus::Unconfirmed)
            .count()
    }

    // --- Unconfirmed resolution --- //

    /// A single pass promoting unconfirmed tokens whose pending transition
    /// has landed on the aggregator.
    #[instrument(skip_all, name = "(resolve-unconfirmed)")]
    pub async fn resolve_unconfirmed(&self) -> Result<ResolveOutcome, WalletError> {
        let pending: Vec<(LocalTokenId, CoinId)> = {
            let data = self.inner.data.lock().await;
            data.live
                .values()
                .filter(|record| record.status == TokenStatus::Unconfirmed)
                .map(|record| (record.local_id, record.coin_id))
                .collect()
        };

        let mut outcome = ResolveOutcome::default();
        for (local_id, coin_id) in pending {
            // Serialize against send on the same coin.
            let coin_lock = self.coin_lock(&coin_id);
            let _guard = coin_lock.lock().await;

            match self.resolve_one(local_id).await {
                Ok(true) => outcome.resolved += 1,
                Ok(false) => outcome.still_pending += 1,
                Err(err) if err.is_transient() => {
                    debug!("Transient resolve failure for {local_id}: {err}");
                    outcome.still_pending += 1;
                }
                Err(err) => return Err(err),
            }
        }
        if outcome.resolved > 0 {
            self.publish_snapshot().await;
        }
        Ok(outcome)
    }

    async fn resolve_one(&self, local_id: LocalTokenId) -> Result<bool, WalletError> {
        let (tail, token_failed) = {
            let data = self.inner.data.lock().await;
            let record = match data.live.get(&local_id) {
                Some(record) => record,
                None => return Ok(true),
            };
            let chain = record
                .blob
                .parse()
                .map_err(|err| WalletError::InvalidToken(err.to_string()))?;
            (chain.pending_tail(), record.status == TokenStatus::Failed)
        };
        if token_failed {
            return Ok(false);
        }
        let tail = match tail {
            // No uncommitted tail; nothing to resolve.
            None => {
                self.mark_confirmed(local_id).await?;
                return Ok(true);
            }
            Some(tail) => tail,
        };

        let owner_pubkey = hex::decode(&tail.previous_owner).map_err(|err| {
            WalletError::InvalidToken(format!("bad predicate pubkey: {err}"))
        })?;
        let request_id =
            RequestId::compute(&owner_pubkey, &tail.previous_state_hash);

        match self.inner.aggregator.get_proof(request_id).await {
            Ok(ProofResponse::Inclusion(proof))
                if proof.indicates_spent(&request_id) =>
            {
                self.attach_proof(local_id, proof)
                    .await
                    .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(AggregatorError::Unavailable(message)) =>
                Err(WalletError::AggregatorUnavailable(message)),
            Err(AggregatorError::Rejected(message)) => {
                // Double spend upstream: this token will never confirm.
                self.mark_failed(local_id).await?;
                Err(WalletError::AggregatorRejected(message))
            }
        }
    }

    async fn mark_confirmed(&self, local_id: LocalTokenId) -> Result<(), WalletError> {
        let mut data = self.inner.data.lock().await;
        if let Some(record) = data.live.get_mut(&local_id) {
            record.status = TokenStatus::Confirmed;
            record.updated_at = TimestampMs::now();
            let record = record.clone();
            drop(data);
            self.inner
                .store
                .upsert_live(&record)
                .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
            self.inner
                .events
                .notify(PaymentsEvent::TokenConfirmed { local_id });
        }
        Ok(())
    }

    async fn mark_failed(&self, local_id: LocalTokenId) -> Result<(), WalletError> {
        let mut data = self.inner.data.lock().await;
        if let Some(record) = data.live.get_mut(&local_id) {
            record.status = TokenStatus::Failed;
            record.updated_at = TimestampMs::now();
            let record = record.clone();
            drop(data);
            self.inner
                .store
                .upsert_live(&record)
                .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        }
        Ok(())
    }

    // --- Spent detection --- //

    /// Run the validator over every live token. With `remove`, spent tokens
    /// are archived and tombstoned so the next sync can't resurrect them.
    #[instrument(skip_all, name = "(verify-tokens)")]
    pub async fn verify_tokens(
        &self,
        remove: bool,
    ) -> Result<Vec<TokenVerdict>, WalletError> {
        let records = self.tokens().await;
        let mut verdicts = Vec::with_capacity(records.len());
        for record in records {
            let verdict = self
                .inner
                .validator
                .verify(self.inner.aggregator.as_ref(), &record)
                .await
                .map_err(|err| match err {
                    AggregatorError::Unavailable(m) =>
                        WalletError::AggregatorUnavailable(m),
                    AggregatorError::Rejected(m) => WalletError::AggregatorRejected(m),
                })?;
            if remove && verdict.kind == TokenVerdictKind::Spent {
                info!("Archiving spent token {}", record.local_id);
                self.remove_token(record.local_id, None, true, TombstoneReason::SpentDetected)
                    .await?;
            }
            verdicts.push(verdict);
        }
        if remove {
            self.publish_snapshot().await;
        }
        Ok(verdicts)
    }

    /// Archive a token to the Sent folder and write a tombstone. Used by
    /// transfer completion and spent detection.
    pub async fn remove_token(
        &self,
        local_id: LocalTokenId,
        recipient_nametag: Option<String>,
        skip_history: bool,
        reason: TombstoneReason,
    ) -> Result<(), WalletError> {
        let record = {
            let data = self.inner.data.lock().await;
            data.live
                .get(&local_id)
                .cloned()
                .ok_or_else(|| {
                    WalletError::InvalidInput(format!("no live token {local_id}"))
                })?
        };
        let state_hash = record
            .current_state_hash()
            .map_err(|err| WalletError::InvalidToken(err.to_string()))?;

        let mut archived = record.clone();
        archived.status = TokenStatus::Spent;
        archived.updated_at = TimestampMs::now();
        self.inner
            .store
            .archive(&archived)
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;

        let tombstone = Tombstone {
            token_id: record.token_id,
            state_hash,
            archived_at: TimestampMs::now(),
            reason,
        };
        if let Err(err) = self.inner.store.append_tombstone(&tombstone) {
            warn!("Could not persist tombstone: {err:#}");
        }

        let mut data = self.inner.data.lock().await;
        data.live.remove(&local_id);
        data.tombstones.push(tombstone);

        if !skip_history {
            let definition = self.inner.registry.get_or_fallback(&record.coin_id);
            let entry = HistoryEntry {
                timestamp: TimestampMs::now(),
                direction: HistoryDirection::Sent,
                coin_id: record.coin_id,
                amount: record.amount,
                symbol: definition.symbol,
                counterparty_nametag: recipient_nametag,
                counterparty_pubkey: None,
                transfer_id: TransferId::generate(&mut SysRng::new()),
            };
            data.history.push(entry.clone());
            drop(data);
            if let Err(err) = self.inner.store.append_history(&entry) {
                warn!("Could not persist history entry: {err:#}");
            }
        } else {
            drop(data);
        }

        self.inner
            .events
            .notify(PaymentsEvent::TokenArchived { local_id });
        Ok(())
    }

    // --- Sync --- //

    /// Pull the remote snapshot, merge, apply, and publish the result.
    #[instrument(skip_all, name = "(sync)")]
    pub async fn sync(&self) -> Result<SyncResult, WalletError> {
        let local = self.build_snapshot().await;

        let remote = match self.inner.sidecar.load().await {
            Ok(loaded) => InventorySnapshot::from_value(loaded.data)
                .map_err(|err| WalletError::InvalidToken(format!("{err:#}")))?,
            Err(SidecarError::NotFound) => {
                // Nothing remote yet: publish what we have.
                debug!("No remote snapshot; publishing local state");
                self.inner.sidecar.save(local.to_value());
                return Ok(SyncResult::default());
            }
            Err(SidecarError::SequenceRegressed { remote, local }) =>
                return Err(WalletError::ConflictingPublish(format!(
                    "remote sequence {remote} behind local {local}"
                ))),
            Err(err) =>
                return Err(WalletError::AggregatorUnavailable(format!(
                    "sidecar load failed: {err}"
                ))),
        };

        let outcome = snapshot::merge(&local, &remote);
        info!(
            "Sync merged: +{} -{} ({} conflicts)",
            outcome.added, outcome.removed, outcome.conflicts,
        );

        // Apply the merged state to the store and the live map.
        let merged = outcome.snapshot;
        {
            let mut data = self.inner.data.lock().await;
            let old_ids: Vec<LocalTokenId> = data.live.keys().copied().collect();
            for old_id in old_ids {
                if !merged.tokens.contains_key(&old_id) {
                    if let Err(err) = self.inner.store.remove_live(&old_id) {
                        warn!("Could not remove merged-away token: {err:#}");
                    }
                }
            }
            for record in merged.tokens.values() {
                if data.live.get(&record.local_id) != Some(record) {
                    if let Err(err) = self.inner.store.upsert_live(record) {
                        warn!("Could not persist merged token: {err:#}");
                    }
                }
            }
            if let Err(err) = self.inner.store.replace_tombstones(&merged.tombstones) {
                warn!("Could not rewrite tombstone log: {err:#}");
            }
            if let Err(err) = self.inner.store.replace_history(&merged.history) {
                warn!("Could not rewrite history log: {err:#}");
            }
            data.live = merged.tokens.clone();
            data.tombstones = merged.tombstones.clone();
            data.history = merged.history.clone();
        }

        self.inner.sidecar.save(merged.to_value());
        Ok(SyncResult {
            added: outcome.added,
            removed: outcome.removed,
            conflicts: outcome.conflicts,
        })
    }

    /// Build a snapshot of the current inventory.
    pub async fn build_snapshot(&self) -> InventorySnapshot {
        let data = self.inner.data.lock().await;
        let state = self.inner.sidecar.state();
        let mut snapshot = InventorySnapshot::new(self.inner.identity.l1_address.clone());
        snapshot.meta.version = state.data_version;
        snapshot.meta.last_cid = state.last_published_cid;
        snapshot.tokens = data.live.clone();
        snapshot.tombstones = data.tombstones.clone();
        snapshot.history = data.history.clone();
        snapshot
    }

    /// Hand the current inventory to the sidecar's write-behind buffer.
    pub async fn publish_snapshot(&self) {
        let snapshot = self.build_snapshot().await;
        self.inner.sidecar.save(snapshot.to_value());
    }

    /// Drain and stop the sidecar writer. Call once, at shutdown.
    pub async fn shutdown_sidecar(&self) {
        self.inner.sidecar.shutdown().await;
    }

    /// Seed the inventory with an existing record (wallet import, faucet).
    pub async fn import_token(&self, record: TokenRecord) -> Result<(), WalletError> {
        record
            .blob
            .parse()
            .map_err(|err| WalletError::InvalidToken(err.to_string()))?;
        self.inner
            .store
            .upsert_live(&record)
            .map_err(|err| WalletError::Fatal(format!("{err:#}")))?;
        self.inner
            .data
            .lock()
            .await
            .live
            .insert(record.local_id, record);
        Ok(())
    }

    /// Generate fresh ids for imported chains.
    pub fn generate_local_id(&self) -> LocalTokenId {
        LocalTokenId::generate(&mut SysRng::new())
    }

    /// New random salt, exposed for genesis construction by callers that
    /// mint (the faucet contract).
    pub fn generate_salt(&self) -> String {
        hex::encode(&SysRng::new().gen_bytes32())
    }
}

/// One aggregator commitment owed by a background finalization.
struct FinalizeCommit {
    owner_pubkey_hex: String,
    source: sphere_common::ids::StateHash,
    target: sphere_common::ids::StateHash,
    /// Change token to attach the resulting proof to, if any.
    change_local_id: Option<LocalTokenId>,
}

struct MintStep {
    source: sphere_common::ids::StateHash,
    target: sphere_common::ids::StateHash,
}

impl MintStep {
    fn of(chain: &crate::token::TokenChain) -> Self {
        let tail = chain
            .pending_tail()
            .expect("freshly minted chains always have a pending tail");
        Self {
            source: tail.previous_state_hash,
            target: chain.current_state_hash(),
        }
    }
}

#[cfg(test)]
mod test {
    use sphere_common::{
        ids::TokenId,
        rng::{FastRng, RngExt},
        root_seed::RootSeed,
    };
    use sphere_sidecar::{ContentClient, MemContentStore};
    use sphere_store::MemFs;
    use sphere_transport::{
        peer, IdentityView, MemRelayHub, RelayConnector, TransportConfig,
    };

    use super::*;
    use crate::{
        aggregator::MockAggregator,
        registry::{AssetKind, Definition},
        token::{Genesis, TokenChain},
    };

    fn uct() -> CoinId {
        CoinId::from_array([1; 32])
    }

    fn registry() -> TokenRegistry {
        TokenRegistry::from_definitions([(
            uct(),
            Definition {
                symbol: "UCT".to_owned(),
                name: "Unicity Token".to_owned(),
                decimals: 6,
                asset_kind: AssetKind::Fungible,
                icons: vec![],
            },
        )])
    }

    struct TestWallet {
        manager: PaymentsManager,
        transport: Transport,
        identity: WalletIdentity,
    }

    struct TestNet {
        hub: MemRelayHub,
        content: MemContentStore,
        aggregator: Arc<MockAggregator>,
    }

    impl TestNet {
        fn new() -> Self {
            Self {
                hub: MemRelayHub::new(),
                content: MemContentStore::new(),
                aggregator: Arc::new(MockAggregator::new()),
            }
        }

        async fn wallet(&self, seed_byte: u8, nametag: &str) -> TestWallet {
            let seed = RootSeed::try_from([seed_byte; 32].as_slice()).unwrap();
            let chain_keypair = seed.derive_chain_keypair(0);
            let chain_pk = chain_keypair.public_key().serialize();
            let chain_pubkey_hex = hex::encode(&chain_pk);

            let identity_view = IdentityView {
                transport_keypair: seed.derive_transport_keypair(0),
                chain_pubkey: chain_pubkey_hex.clone(),
                l1_address: peer::l1_address(&chain_pk),
                direct_address: peer::direct_address(&chain_pk),
                nametag: Some(nametag.to_owned()),
            };
            let transport = Transport::new(
                TransportConfig {
                    relay_urls: vec!["mem://relay".to_owned()],
                    query_timeout: Duration::from_secs(1),
                },
                RelayConnector::Mem(self.hub.clone()),
            );
            transport.connect().await;
            transport.set_identity(identity_view).await;
            assert!(transport.register_nametag(nametag).await.unwrap());

            let sidecar = SidecarStorage::new(
                ContentClient::Mem(self.content.clone()),
                seed.derive_sidecar_keypair(),
                Arc::new(MemFs::new()) as Arc<dyn Ffs>,
                Duration::from_millis(10),
            );

            let identity = WalletIdentity {
                chain_pubkey_hex,
                l1_address: peer::l1_address(&chain_pk),
                nametag: Some(nametag.to_owned()),
            };
            let manager = PaymentsManager::new(
                identity.clone(),
                TokenStore::new(Arc::new(MemFs::new())),
                transport.clone(),
                sidecar,
                self.aggregator.clone(),
                registry(),
                None,
            );
            manager.load().await.unwrap();

            TestWallet {
                manager,
                transport,
                identity,
            }
        }
    }

    async fn fund(wallet: &TestWallet, amount: u128, seed: u64) {
        let mut rng = FastRng::from_u64(seed);
        let chain = TokenChain {
            genesis: Genesis {
                token_id: TokenId::from_array(rng.gen_bytes32()),
                coin_id: uct(),
                amount: Amount::from_u128(amount),
                owner: wallet.identity.chain_pubkey_hex.clone(),
                salt: hex::encode(&rng.gen_bytes32()),
            },
            transactions: vec![],
        };
        let now = TimestampMs::now();
        let record = TokenRecord {
            local_id: LocalTokenId::generate(&mut rng),
            token_id: chain.genesis.token_id,
            coin_id: uct(),
            amount: chain.genesis.amount,
            status: TokenStatus::Confirmed,
            symbol: Some("UCT".to_owned()),
            decimals: Some(6),
            created_at: now,
            updated_at: now,
            blob: SdkBlob::from(&chain),
        };
        wallet.manager.import_token(record).await.unwrap();
    }

    fn send_request(recipient: &str, amount: u128, mode: TransferMode) -> SendRequest {
        SendRequest {
            recipient: recipient.to_owned(),
            amount: Amount::from_u128(amount),
            coin_id: uct(),
            address_mode: AddressMode::Auto,
            transfer_mode: mode,
        }
    }

    async fn settle() {
        // Let dispatch loops and relay fanout run.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn split_conservation_conservative() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 100, 1).await;

        let result = alice
            .manager
            .send(send_request("@bob", 1, TransferMode::Conservative))
            .await
            .unwrap();
        assert_eq!(result.stage, TransferStage::Completed);
        assert_eq!(result.change_local_ids.len(), 1);

        // Alice: 99 in a single confirmed change token, one tombstone.
        let balance = alice.manager.balance(&uct()).await;
        assert_eq!(balance.confirmed_amount, Amount::from_u128(99));
        assert_eq!(balance.unconfirmed_amount, Amount::ZERO);
        assert_eq!(balance.token_count, 1);
        assert_eq!(alice.manager.tombstones().await.len(), 1);

        // Bob: 1 confirmed after draining the transport.
        settle().await;
        let received = bob
            .manager
            .receive(ReceiveOptions::default())
            .await
            .unwrap();
        assert_eq!(received.received, 1);
        let balance = bob.manager.balance(&uct()).await;
        assert_eq!(balance.confirmed_amount, Amount::from_u128(1));
        assert_eq!(balance.token_count, 1);

        // Conservation: no token was lost or duplicated.
        let alice_total = balance_total(&alice).await;
        let bob_total = balance_total(&bob).await;
        assert_eq!(alice_total + bob_total, 100);

        // History on both sides.
        let sent = alice.manager.history().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].direction, HistoryDirection::Sent);
        assert_eq!(sent[0].counterparty_nametag.as_deref(), Some("bob"));
        let recv = bob.manager.history().await;
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[0].direction, HistoryDirection::Received);
    }

    async fn balance_total(wallet: &TestWallet) -> u128 {
        wallet.manager.balance(&uct()).await.total_amount.to_u128()
    }

    #[tokio::test(start_paused = true)]
    async fn instant_send_then_finalize() {
        let net = TestNet::new();
        net.aggregator.set_commit_latency_rounds(1);
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 100, 1).await;

        let result = alice
            .manager
            .send(send_request("@bob", 1, TransferMode::Instant))
            .await
            .unwrap();
        assert_eq!(result.stage, TransferStage::Delivered);

        // Bob immediately sees an unconfirmed token.
        settle().await;
        bob.manager.receive(ReceiveOptions::default()).await.unwrap();
        let balance = bob.manager.balance(&uct()).await;
        assert_eq!(balance.confirmed_amount, Amount::ZERO);
        assert_eq!(balance.unconfirmed_amount, Amount::from_u128(1));

        // Sender-side background finalization confirms the change token.
        assert!(
            alice
                .manager
                .wait_for_pending_operations(Duration::from_secs(60))
                .await
        );
        let balance = alice.manager.balance(&uct()).await;
        assert_eq!(balance.confirmed_amount, Amount::from_u128(99));
        assert_eq!(balance.unconfirmed_amount, Amount::ZERO);

        // Bob finalizes: unconfirmed becomes confirmed.
        let result = bob
            .manager
            .receive(ReceiveOptions {
                finalize: true,
                deadline: Some(Duration::from_secs(60)),
                on_progress: None,
            })
            .await
            .unwrap();
        assert!(!result.timed_out);
        let balance = bob.manager.balance(&uct()).await;
        assert_eq!(balance.confirmed_amount, Amount::from_u128(1));
        assert_eq!(balance.unconfirmed_amount, Amount::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn whole_transfer_exact_amount() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 42, 1).await;

        let result = alice
            .manager
            .send(send_request("@bob", 42, TransferMode::Conservative))
            .await
            .unwrap();
        // Exact match: no change token minted.
        assert!(result.change_local_ids.is_empty());

        assert_eq!(balance_total(&alice).await, 0);
        assert_eq!(alice.manager.tombstones().await.len(), 1);

        settle().await;
        bob.manager.receive(ReceiveOptions::default()).await.unwrap();
        assert_eq!(balance_total(&bob).await, 42);
        // The token id is preserved across a whole transfer.
        let bob_tokens = bob.manager.tokens().await;
        let alice_tombstones = alice.manager.tombstones().await;
        assert_eq!(bob_tokens[0].token_id, alice_tombstones[0].token_id);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_input_send_covers_amount() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 30, 1).await;
        fund(&alice, 30, 2).await;
        fund(&alice, 30, 3).await;

        alice
            .manager
            .send(send_request("@bob", 70, TransferMode::Conservative))
            .await
            .unwrap();

        assert_eq!(balance_total(&alice).await, 20);

        settle().await;
        bob.manager.receive(ReceiveOptions::default()).await.unwrap();
        assert_eq!(balance_total(&bob).await, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_applies_once() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 10, 1).await;

        alice
            .manager
            .send(send_request("@bob", 10, TransferMode::Conservative))
            .await
            .unwrap();
        settle().await;

        // Replay every stored transfer event.
        let stored = net.hub.query(&[sphere_transport::Filter::new()
            .kind(sphere_transport::EventKind::TokenTransfer)]);
        for event in stored {
            net.hub.publish(event);
        }
        settle().await;

        let result = bob
            .manager
            .receive(ReceiveOptions::default())
            .await
            .unwrap();
        assert_eq!(result.received, 1);
        assert_eq!(balance_total(&bob).await, 10);
        assert_eq!(bob.manager.history().await.len(), 1);
        assert_eq!(bob.manager.tokens().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_classes() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        fund(&alice, 10, 1).await;

        // Zero amount.
        let err = alice
            .manager
            .send(send_request("@bob", 0, TransferMode::Conservative))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidInput(_)));

        // Unresolvable recipient, no state change.
        let err = alice
            .manager
            .send(send_request("@nobody", 1, TransferMode::Conservative))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidRecipient(_)));
        assert_eq!(balance_total(&alice).await, 10);
        assert!(alice.manager.tombstones().await.is_empty());

        // Insufficient balance.
        let bob = net.wallet(2, "bob").await;
        let _ = &bob;
        let err = alice
            .manager
            .send(send_request("@bob", 1000, TransferMode::Conservative))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientBalance { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregator_outage_leaves_tokens_untouched() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        let _ = &bob;
        fund(&alice, 100, 1).await;

        net.aggregator.set_offline(true);
        let err = alice
            .manager
            .send(send_request("@bob", 1, TransferMode::Conservative))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AggregatorUnavailable(_)));

        // The input is untouched: still live, still spendable.
        assert_eq!(balance_total(&alice).await, 100);
        assert!(alice.manager.tombstones().await.is_empty());

        net.aggregator.set_offline(false);
        alice
            .manager
            .send(send_request("@bob", 1, TransferMode::Conservative))
            .await
            .unwrap();
        assert_eq!(balance_total(&alice).await, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn spent_detection_archives_and_stays_gone() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        fund(&alice, 100, 1).await;

        // Simulate a send that completed on the aggregator but crashed
        // before the local archive: the current state is committed.
        let tokens = alice.manager.tokens().await;
        let state_hash = tokens[0].current_state_hash().unwrap();
        let pubkey = hex::decode(&alice.identity.chain_pubkey_hex).unwrap();
        net.aggregator
            .submit_commitment(crate::aggregator::Commitment {
                request_id: RequestId::compute(&pubkey, &state_hash),
                payload: sphere_common::ids::StateHash::from_array([9; 32]),
            })
            .await
            .unwrap();

        let verdicts = alice.manager.verify_tokens(true).await.unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].kind, TokenVerdictKind::Spent);

        // Archived and tombstoned.
        assert_eq!(balance_total(&alice).await, 0);
        let tombstones = alice.manager.tombstones().await;
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].state_hash, state_hash);
        assert_eq!(tombstones[0].reason, TombstoneReason::SpentDetected);

        // It does not reappear on sync.
        alice.manager.sync().await.unwrap();
        assert_eq!(balance_total(&alice).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_finalize_times_out_cleanly() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        fund(&alice, 100, 1).await;

        // Take the aggregator down right after delivery so finalization
        // cannot complete.
        alice
            .manager
            .send(send_request("@bob", 1, TransferMode::Instant))
            .await
            .unwrap();
        net.aggregator.set_offline(true);

        settle().await;
        let result = bob
            .manager
            .receive(ReceiveOptions {
                finalize: true,
                deadline: Some(Duration::from_secs(5)),
                on_progress: None,
            })
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.still_pending, 1);

        // Open question resolution: the token stays unconfirmed
        // indefinitely and a later pass can still finish the job.
        net.aggregator.set_offline(false);
        assert!(
            alice
                .manager
                .wait_for_pending_operations(Duration::from_secs(60))
                .await
        );
        let outcome = bob.manager.resolve_unconfirmed().await.unwrap();
        assert_eq!(outcome.resolved, 1);
        assert_eq!(balance_total(&bob).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_coin_lock_prevents_double_selection() {
        let net = TestNet::new();
        let alice = net.wallet(1, "alice").await;
        let bob = net.wallet(2, "bob").await;
        let _ = &bob;
        fund(&alice, 10, 1).await;

        // Two concurrent sends of 10 from a 10 balance: exactly one wins.
        let first = alice
            .manager
            .send(send_request("@bob", 10, TransferMode::Conservative));
        let second = alice
            .manager
            .send(send_request("@bob", 10, TransferMode::Conservative));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(balance_total(&alice).await, 0);
    }
}
