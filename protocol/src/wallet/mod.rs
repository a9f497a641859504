//! # Wallet Core
//!
//! The device side of the protocol. A [`WalletCore`] holds tokens, plans and
//! signs offline payments, accepts payments from peers, and keeps the
//! transfer records that reconciliation later syncs to the issuer.
//!
//! ## Spending
//!
//! A spend is three steps so the receiver's acknowledgement can sit in the
//! middle:
//!
//! 1. [`WalletCore::select_tokens_for_amount`] picks tokens and reserves them
//!    under a lease ([`SpendPlan`]).
//! 2. [`WalletCore::prepare_payment`] divides a token if the plan needs
//!    change, then signs a [`TransferRecord`] and parks the payment as
//!    pending.
//! 3. [`WalletCore::confirm_payment`] marks the tokens spent once the
//!    receiver has acknowledged, or [`WalletCore::cancel_payment`] hands them
//!    back.
//!
//! Tokens in a pending payment are never offered to another plan, even if
//! the lease that first reserved them has lapsed.
//!
//! ## Locking
//!
//! `state` is always taken before the reservation table's own lock. Neither
//! is held across an `.await`; nothing in this module is async.

pub mod error;
pub mod exchange;
pub mod payment;
pub mod reservation;
pub mod selection;

pub use error::{ReceiveRejection, WalletError};
pub use exchange::PaymentExchange;
pub use payment::{OfflinePayment, SpendPlan, WireMessage};
pub use reservation::{Lease, ReservationTable};
pub use selection::{Candidate, Selection, SelectionError};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WalletConfig;
use crate::crypto::keys::{Keypair, PublicKey};
use crate::issuer::RedemptionRequest;
use crate::ports::PeerId;
use crate::storage::TokenStore;
use crate::token::{
    self, order_provenance, resolve_owner, verify_signature, DelegatedDivider, SyncStatus, Token,
    TokenId, TokenStatus, TransferRecord,
};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Offline balance broken down by what the value can be used for right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    /// Free to put into a new payment.
    pub spendable: u64,
    /// Held by a live reservation or a payment awaiting acknowledgement.
    pub reserved: u64,
    /// Portion of `spendable + reserved` that arrived from peers.
    pub received: u64,
    /// Past expiry and waiting for the issuer's refund sweep.
    pub expired: u64,
    /// Set aside after the issuer refused it.
    pub quarantined: u64,
}

impl WalletBalance {
    pub fn total_usable(&self) -> u64 {
        self.spendable + self.reserved
    }
}

/// Received tokens reserved for one redemption attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RedemptionBatch {
    pub lease_id: Uuid,
    pub request: RedemptionRequest,
}

impl RedemptionBatch {
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.request.tokens.iter().map(|t| t.id).collect()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Holding {
    token: Token,
    /// Hops that brought the token here. Empty for tokens issued to us.
    provenance: Vec<TransferRecord>,
}

#[derive(Debug, Clone)]
struct PendingSpend {
    lease: Lease,
    payment: OfflinePayment,
}

#[derive(Debug, Default)]
struct WalletState {
    holdings: HashMap<TokenId, Holding>,
    pending: HashMap<Uuid, PendingSpend>,
    /// Records this wallet signed and settled.
    outgoing: HashMap<Uuid, TransferRecord>,
    /// Records this wallet accepted, provenance included.
    incoming: HashMap<Uuid, TransferRecord>,
    quarantined: HashSet<TokenId>,
    divider: Option<DelegatedDivider>,
}

impl WalletState {
    fn in_flight(&self) -> HashSet<TokenId> {
        self.pending
            .values()
            .flat_map(|p| p.payment.record.token_ids.iter().copied())
            .collect()
    }

    fn knows_record(&self, id: &Uuid) -> bool {
        self.outgoing.contains_key(id) || self.incoming.contains_key(id) || self.pending.contains_key(id)
    }
}

// ---------------------------------------------------------------------------
// WalletCore
// ---------------------------------------------------------------------------

pub struct WalletCore {
    identity: Keypair,
    issuer_pk: PublicKey,
    state: Mutex<WalletState>,
    reservations: ReservationTable,
    store: Option<Arc<dyn TokenStore>>,
}

impl std::fmt::Debug for WalletCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCore")
            .field("owner", &self.identity.public_key())
            .field("issuer", &self.issuer_pk)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl WalletCore {
    pub fn new(identity: Keypair, issuer_pk: PublicKey, config: &WalletConfig) -> Self {
        Self {
            identity,
            issuer_pk,
            state: Mutex::new(WalletState::default()),
            reservations: ReservationTable::new(config.reservation_timeout()),
            store: None,
        }
    }

    /// Reload holdings and records from `store` and keep writing through.
    ///
    /// Reservations and pending payments are not persisted; anything that was
    /// mid-flight when the process died comes back as plain held tokens.
    pub fn restore(
        identity: Keypair,
        issuer_pk: PublicKey,
        config: &WalletConfig,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, WalletError> {
        let me = identity.public_key();
        let tokens = store.list_tokens()?;
        let transfers = store.list_transfers()?;

        let mut state = WalletState::default();
        for token in tokens {
            let listing: Vec<TransferRecord> = transfers
                .iter()
                .filter(|r| r.lists(&token.id))
                .cloned()
                .collect();
            let provenance = order_provenance(&token, listing);
            state.holdings.insert(token.id, Holding { token, provenance });
        }
        for record in transfers {
            if record.sender == me {
                state.outgoing.insert(record.id, record);
            } else {
                state.incoming.insert(record.id, record);
            }
        }
        info!(
            owner = %me.short(),
            tokens = state.holdings.len(),
            outgoing = state.outgoing.len(),
            "wallet restored"
        );

        Ok(Self {
            identity,
            issuer_pk,
            state: Mutex::new(state),
            reservations: ReservationTable::new(config.reservation_timeout()),
            store: Some(store),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn issuer_key(&self) -> PublicKey {
        self.issuer_pk
    }

    /// Install the delegate key the issuer certified for offline division.
    pub fn install_divider(&self, divider: DelegatedDivider) -> Result<(), WalletError> {
        let cert = divider.certificate();
        if cert.holder != self.public_key() {
            return Err(WalletError::InvalidDelegation(
                "certificate names a different holder".into(),
            ));
        }
        if !cert.verify(&self.issuer_pk) {
            return Err(WalletError::InvalidDelegation(
                "certificate is not signed by the issuer".into(),
            ));
        }
        let valid_until = cert.valid_until;
        self.state.lock().divider = Some(divider);
        info!(valid_until = %valid_until, "delegated divider installed");
        Ok(())
    }

    pub fn can_divide(&self) -> bool {
        self.state.lock().divider.is_some()
    }

    pub fn get_token(&self, id: &TokenId) -> Option<Token> {
        self.state.lock().holdings.get(id).map(|h| h.token.clone())
    }

    /// Every token this wallet has ever held, in any status.
    pub fn tokens(&self) -> Vec<Token> {
        let mut out: Vec<Token> = self
            .state
            .lock()
            .holdings
            .values()
            .map(|h| h.token.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Ids of tokens that have left this wallet for good.
    pub fn spent_ids(&self) -> Vec<TokenId> {
        self.state
            .lock()
            .holdings
            .values()
            .filter(|h| h.token.status != TokenStatus::Active)
            .map(|h| h.token.id)
            .collect()
    }

    // -- Deposits -----------------------------------------------------------

    /// Take in tokens the issuer minted for this wallet. All or nothing.
    pub fn deposit_issued(&self, tokens: Vec<Token>, now: DateTime<Utc>) -> Result<u64, WalletError> {
        let me = self.public_key();
        let mut state = self.state.lock();
        let mut total: u64 = 0;
        for token in &tokens {
            let reject = |reason| WalletError::InvalidToken {
                id: token.id,
                reason,
            };
            if !verify_signature(token, &self.issuer_pk) {
                return Err(reject(ReceiveRejection::BadSignature));
            }
            if token.owner != me {
                return Err(reject(ReceiveRejection::NotOwned));
            }
            if token.status != TokenStatus::Active {
                return Err(reject(ReceiveRejection::NotActive));
            }
            if token.is_expired(now) {
                return Err(reject(ReceiveRejection::Expired));
            }
            if state.holdings.contains_key(&token.id) {
                return Err(reject(ReceiveRejection::AlreadyHeld));
            }
            total = total
                .checked_add(token.amount)
                .ok_or_else(|| WalletError::InvalidAmount("deposit overflows".into()))?;
        }

        self.persist_tokens(&tokens)?;
        let count = tokens.len();
        for token in tokens {
            state.holdings.insert(
                token.id,
                Holding {
                    token,
                    provenance: Vec::new(),
                },
            );
        }
        info!(count, total, "issued tokens deposited");
        Ok(total)
    }

    // -- Balance ------------------------------------------------------------

    pub fn balance(&self, now: DateTime<Utc>) -> WalletBalance {
        let me = self.public_key();
        let state = self.state.lock();
        let in_flight = state.in_flight();
        let mut b = WalletBalance::default();

        for h in state.holdings.values() {
            let t = &h.token;
            match t.status {
                TokenStatus::Expired => b.expired += t.amount,
                TokenStatus::Active => {
                    if state.quarantined.contains(&t.id) {
                        b.quarantined += t.amount;
                        continue;
                    }
                    if t.is_expired(now) {
                        b.expired += t.amount;
                        continue;
                    }
                    if in_flight.contains(&t.id) || self.reservations.is_reserved(&t.id, now) {
                        b.reserved += t.amount;
                    } else {
                        b.spendable += t.amount;
                    }
                    if is_received(h, &me) {
                        b.received += t.amount;
                    }
                }
                _ => {}
            }
        }
        b
    }

    // -- Selection & reservation -------------------------------------------

    /// Choose tokens worth exactly `amount` (after any division) and reserve
    /// them.
    pub fn select_tokens_for_amount(
        &self,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<SpendPlan, WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount("cannot pay zero".into()));
        }
        let me = self.public_key();
        let state = self.state.lock();
        let in_flight = state.in_flight();
        let valid_until = state.divider.as_ref().map(|d| d.certificate().valid_until);

        let candidates: Vec<Candidate> = state
            .holdings
            .values()
            .filter(|h| {
                h.token.is_spendable(now)
                    && !state.quarantined.contains(&h.token.id)
                    && !in_flight.contains(&h.token.id)
                    && !self.reservations.is_reserved(&h.token.id, now)
            })
            .map(|h| Candidate {
                id: h.token.id,
                amount: h.token.amount,
                divisible: !is_received(h, &me)
                    && valid_until.is_some_and(|v| h.token.expires_at <= v),
            })
            .collect();

        let selection = selection::select(&candidates, amount).map_err(|e| match e {
            SelectionError::Insufficient { available } => WalletError::InsufficientOfflineBalance {
                needed: amount,
                available,
            },
            SelectionError::NoExactChange => WalletError::CannotMakeChange { amount },
        })?;

        let lease = self
            .reservations
            .reserve(&selection.token_ids(), now)
            .map_err(WalletError::AlreadyReserved)?;
        debug!(
            amount,
            tokens = selection.whole.len(),
            divides = selection.split.is_some(),
            lease = %lease.lease_id,
            "spend planned"
        );
        Ok(SpendPlan {
            lease_id: lease.lease_id,
            lease_expires_at: lease.expires_at,
            target: amount,
            selection,
        })
    }

    /// Reserve specific tokens. Fails without reserving anything if any of
    /// them isn't spendable or is already taken.
    pub fn reserve(&self, ids: &[TokenId], now: DateTime<Utc>) -> Result<Lease, WalletError> {
        let state = self.state.lock();
        let in_flight = state.in_flight();
        for id in ids {
            let holding = state.holdings.get(id).ok_or(WalletError::UnknownToken(*id))?;
            if !holding.token.is_spendable(now) || state.quarantined.contains(id) {
                return Err(WalletError::Token(token::TokenError::NotSpendable {
                    id: *id,
                    status: holding.token.status,
                }));
            }
            if in_flight.contains(id) {
                return Err(WalletError::AlreadyReserved(*id));
            }
        }
        self.reservations
            .reserve(ids, now)
            .map_err(WalletError::AlreadyReserved)
    }

    pub fn release(&self, lease_id: &Uuid) -> usize {
        let _state = self.state.lock();
        self.reservations.release(lease_id)
    }

    // -- Paying -------------------------------------------------------------

    /// Turn a plan into a signed payment. Divides first when the plan needs
    /// change. The payment stays pending until confirmed or cancelled.
    pub fn prepare_payment(
        &self,
        plan: &SpendPlan,
        receiver: PublicKey,
        now: DateTime<Utc>,
    ) -> Result<OfflinePayment, WalletError> {
        if receiver == self.public_key() {
            return Err(WalletError::PaymentRejected("cannot pay yourself".into()));
        }
        let mut state = self.state.lock();
        if !self
            .reservations
            .holds(&plan.lease_id, &plan.token_ids(), now)
        {
            return Err(WalletError::LeaseExpired(plan.lease_id));
        }
        let lease = Lease {
            lease_id: plan.lease_id,
            expires_at: plan.lease_expires_at,
        };

        let mut tokens = Vec::with_capacity(plan.selection.whole.len() + 1);
        for id in &plan.selection.whole {
            let holding = state.holdings.get(id).ok_or(WalletError::UnknownToken(*id))?;
            tokens.push(holding.token.clone());
        }

        if let Some((split_id, portion)) = plan.selection.split {
            let divider = state.divider.clone().ok_or(WalletError::NoDivider)?;
            let mut parent = state
                .holdings
                .get(&split_id)
                .ok_or(WalletError::UnknownToken(split_id))?
                .token
                .clone();
            let (payment, change) = token::divide(&mut parent, portion, &divider, now)?;
            self.persist_tokens(&[parent.clone(), payment.clone(), change.clone()])?;

            self.reservations
                .extend(&lease, payment.id, now)
                .map_err(WalletError::AlreadyReserved)?;
            self.reservations.release_ids(&[split_id]);
            debug!(
                parent = %parent.id.short(),
                payment = payment.amount,
                change = change.amount,
                "token divided for payment"
            );
            for t in [parent, payment.clone(), change] {
                state.holdings.insert(
                    t.id,
                    Holding {
                        token: t,
                        provenance: Vec::new(),
                    },
                );
            }
            tokens.push(payment);
        }

        let record = TransferRecord::create(&self.identity, receiver, &tokens, now)?;

        let mut seen = HashSet::new();
        let provenance: Vec<TransferRecord> = tokens
            .iter()
            .filter_map(|t| state.holdings.get(&t.id))
            .flat_map(|h| h.provenance.iter())
            .filter(|r| seen.insert(r.id))
            .cloned()
            .collect();

        let payment = OfflinePayment {
            record,
            tokens,
            provenance,
        };
        state.pending.insert(
            payment.transfer_id(),
            PendingSpend {
                lease,
                payment: payment.clone(),
            },
        );
        info!(
            transfer = %payment.transfer_id(),
            receiver = %receiver.short(),
            amount = payment.amount(),
            "payment prepared"
        );
        Ok(payment)
    }

    /// Plan and prepare in one step. The reservation is released if
    /// preparation fails.
    pub fn pay(
        &self,
        amount: u64,
        receiver: PublicKey,
        now: DateTime<Utc>,
    ) -> Result<OfflinePayment, WalletError> {
        let plan = self.select_tokens_for_amount(amount, now)?;
        match self.prepare_payment(&plan, receiver, now) {
            Ok(payment) => Ok(payment),
            Err(e) => {
                self.release(&plan.lease_id);
                Err(e)
            }
        }
    }

    /// The receiver acknowledged: the tokens are gone.
    pub fn confirm_payment(&self, transfer_id: &Uuid) -> Result<TransferRecord, WalletError> {
        let record = self.settle(transfer_id)?;
        info!(transfer = %transfer_id, amount = record.amount, "payment confirmed");
        Ok(record)
    }

    /// Abandon a pending payment and free its tokens. Division outputs stay
    /// in the wallet as ordinary tokens.
    pub fn cancel_payment(&self, transfer_id: &Uuid) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .remove(transfer_id)
            .ok_or(WalletError::UnknownPayment(*transfer_id))?;
        self.reservations.release(&pending.lease.lease_id);
        info!(transfer = %transfer_id, "payment cancelled");
        Ok(())
    }

    fn settle(&self, transfer_id: &Uuid) -> Result<TransferRecord, WalletError> {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .get(transfer_id)
            .cloned()
            .ok_or(WalletError::UnknownPayment(*transfer_id))?;
        let record = pending.payment.record.clone();

        let mut spent = Vec::with_capacity(record.token_ids.len());
        for id in &record.token_ids {
            let mut token = state
                .holdings
                .get(id)
                .ok_or(WalletError::UnknownToken(*id))?
                .token
                .clone();
            token.transition(TokenStatus::Spent)?;
            spent.push(token);
        }
        self.persist_tokens(&spent)?;
        self.persist_records(std::slice::from_ref(&record))?;

        state.pending.remove(transfer_id);
        for token in spent {
            if let Some(h) = state.holdings.get_mut(&token.id) {
                h.token = token;
                h.provenance.push(record.clone());
            }
        }
        state.outgoing.insert(record.id, record.clone());
        self.reservations.release(&pending.lease.lease_id);
        Ok(record)
    }

    pub fn pending_payments(&self) -> Vec<Uuid> {
        self.state.lock().pending.keys().copied().collect()
    }

    // -- Receiving ----------------------------------------------------------

    /// Accept a single token delivered by `from_peer`, with the records that
    /// prove it reached this wallet. Returns whether it was kept.
    pub fn receive_token(
        &self,
        token: Token,
        from_peer: &PeerId,
        provenance: &[TransferRecord],
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.lock();
        let chain = match self.check_incoming(&state, &token, from_peer, provenance, now) {
            Ok(chain) => chain,
            Err(reason) => {
                log_rejection(&token.id, from_peer, reason);
                return false;
            }
        };
        if let Err(e) = self
            .persist_tokens(std::slice::from_ref(&token))
            .and_then(|_| self.persist_records(&chain))
        {
            warn!(token = %token.id.short(), error = %e, "could not store received token");
            return false;
        }
        for record in &chain {
            state.incoming.entry(record.id).or_insert_with(|| record.clone());
        }
        debug!(token = %token.id.short(), amount = token.amount, "token received");
        state.holdings.insert(
            token.id,
            Holding {
                token,
                provenance: chain,
            },
        );
        true
    }

    /// Verify and keep a whole payment, or nothing of it.
    pub fn receive_payment(
        &self,
        payment: &OfflinePayment,
        from_peer: &PeerId,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, WalletError> {
        let record = &payment.record;
        record.verify()?;
        if record.sender != *from_peer {
            return Err(WalletError::PaymentRejected(
                "record is not signed by the delivering peer".into(),
            ));
        }
        if record.receiver != self.public_key() {
            return Err(WalletError::PaymentRejected(
                "payment is addressed to someone else".into(),
            ));
        }
        if !record.matches_tokens(&payment.tokens) {
            return Err(WalletError::PaymentRejected(
                "record does not match the attached tokens".into(),
            ));
        }

        let full = payment.full_provenance();
        let mut state = self.state.lock();
        if state.knows_record(&record.id) {
            return Err(WalletError::PaymentRejected(format!(
                "transfer {} already seen",
                record.id
            )));
        }

        let mut accepted = Vec::with_capacity(payment.tokens.len());
        for token in &payment.tokens {
            match self.check_incoming(&state, token, from_peer, &full, now) {
                Ok(chain) => accepted.push((token.clone(), chain)),
                Err(reason) => {
                    log_rejection(&token.id, from_peer, reason);
                    return Err(WalletError::InvalidToken {
                        id: token.id,
                        reason,
                    });
                }
            }
        }

        let tokens: Vec<Token> = accepted.iter().map(|(t, _)| t.clone()).collect();
        self.persist_tokens(&tokens)?;
        self.persist_records(&full)?;

        for r in full {
            state.incoming.entry(r.id).or_insert(r);
        }
        for (token, chain) in accepted {
            state.holdings.insert(
                token.id,
                Holding {
                    token,
                    provenance: chain,
                },
            );
        }
        info!(
            transfer = %record.id,
            sender = %from_peer.short(),
            amount = record.amount,
            "payment received"
        );
        Ok(record.clone())
    }

    /// Every check an incoming token must pass. Returns its ordered chain.
    fn check_incoming(
        &self,
        state: &WalletState,
        token: &Token,
        from_peer: &PeerId,
        provenance: &[TransferRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferRecord>, ReceiveRejection> {
        let me = self.public_key();
        if !verify_signature(token, &self.issuer_pk) {
            return Err(ReceiveRejection::BadSignature);
        }
        if token.status != TokenStatus::Active {
            return Err(ReceiveRejection::NotActive);
        }
        if token.is_expired(now) {
            return Err(ReceiveRejection::Expired);
        }
        if state.quarantined.contains(&token.id) {
            return Err(ReceiveRejection::Quarantined);
        }

        let listing: Vec<TransferRecord> = provenance
            .iter()
            .filter(|r| r.lists(&token.id))
            .cloned()
            .collect();
        let chain = order_provenance(token, listing);
        if resolve_owner(token, &chain) != Some(me) {
            return Err(ReceiveRejection::NotOwned);
        }
        let delivered_by = chain.last().map(|r| r.sender).unwrap_or(self.issuer_pk);
        if delivered_by != *from_peer {
            return Err(ReceiveRejection::WrongSender);
        }

        if let Some(held) = state.holdings.get(&token.id) {
            if held.token.status == TokenStatus::Active {
                return Err(ReceiveRejection::AlreadyHeld);
            }
            // Coming back after we spent it: the chain must include our hop.
            let ours_included = state
                .outgoing
                .values()
                .filter(|r| r.lists(&token.id))
                .all(|r| chain.iter().any(|c| c.id == r.id));
            if !ours_included {
                return Err(ReceiveRejection::Replayed);
            }
        }
        Ok(chain)
    }

    // -- Redemption & housekeeping -----------------------------------------

    /// Reserve every redeemable received token into one redemption request.
    /// `None` when there is nothing to redeem.
    pub fn prepare_redemption(&self, now: DateTime<Utc>) -> Option<RedemptionBatch> {
        let me = self.public_key();
        let state = self.state.lock();
        let in_flight = state.in_flight();

        let holdings: Vec<&Holding> = state
            .holdings
            .values()
            .filter(|h| {
                is_received(h, &me)
                    && h.token.is_spendable(now)
                    && !state.quarantined.contains(&h.token.id)
                    && !in_flight.contains(&h.token.id)
                    && !self.reservations.is_reserved(&h.token.id, now)
            })
            .collect();
        if holdings.is_empty() {
            return None;
        }

        let ids: Vec<TokenId> = holdings.iter().map(|h| h.token.id).collect();
        let lease = self.reservations.reserve(&ids, now).ok()?;
        let mut seen = HashSet::new();
        let provenance = holdings
            .iter()
            .flat_map(|h| h.provenance.iter())
            .filter(|r| seen.insert(r.id))
            .cloned()
            .collect();
        Some(RedemptionBatch {
            lease_id: lease.lease_id,
            request: RedemptionRequest {
                presenter: me,
                tokens: holdings.iter().map(|h| h.token.clone()).collect(),
                provenance,
            },
        })
    }

    /// The issuer credited these tokens.
    pub fn mark_redeemed(&self, ids: &[TokenId]) -> Result<(), WalletError> {
        self.transition_all(ids, TokenStatus::Redeemed)?;
        info!(count = ids.len(), "tokens redeemed");
        Ok(())
    }

    /// Take a token out of circulation locally after the issuer refused it.
    pub fn quarantine(&self, id: &TokenId, reason: &str) -> bool {
        let mut state = self.state.lock();
        if !state.holdings.contains_key(id) {
            return false;
        }
        let fresh = state.quarantined.insert(*id);
        self.reservations.release_ids(&[*id]);
        if fresh {
            warn!(target: "otm::security", token = %id.short(), reason, "token quarantined");
        }
        fresh
    }

    pub fn quarantined(&self) -> Vec<TokenId> {
        self.state.lock().quarantined.iter().copied().collect()
    }

    /// Mark every held, unreserved token past its expiry as `Expired`.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<TokenId>, WalletError> {
        let stale: Vec<TokenId> = {
            let state = self.state.lock();
            let in_flight = state.in_flight();
            state
                .holdings
                .values()
                .filter(|h| {
                    h.token.status == TokenStatus::Active
                        && h.token.is_expired(now)
                        && !in_flight.contains(&h.token.id)
                })
                .map(|h| h.token.id)
                .collect()
        };
        if stale.is_empty() {
            return Ok(stale);
        }
        self.transition_all(&stale, TokenStatus::Expired)?;
        self.reservations.purge_expired(now);
        info!(count = stale.len(), "stale tokens expired");
        Ok(stale)
    }

    fn transition_all(&self, ids: &[TokenId], next: TokenStatus) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let mut token = state
                .holdings
                .get(id)
                .ok_or(WalletError::UnknownToken(*id))?
                .token
                .clone();
            token.transition(next)?;
            updated.push(token);
        }
        self.persist_tokens(&updated)?;
        self.reservations.release_ids(ids);
        for token in updated {
            if let Some(h) = state.holdings.get_mut(&token.id) {
                h.token = token;
            }
        }
        Ok(())
    }

    // -- Sync bookkeeping ---------------------------------------------------

    /// Outgoing records the issuer hasn't accepted yet, oldest first.
    pub fn pending_records(&self) -> Vec<TransferRecord> {
        let state = self.state.lock();
        let mut out: Vec<TransferRecord> = state
            .outgoing
            .values()
            .filter(|r| r.sync_status.awaits_sync())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        out
    }

    pub fn mark_synced(&self, ids: &[Uuid]) -> Result<(), WalletError> {
        self.set_sync_status(ids, SyncStatus::Synced)
    }

    /// Record a failed sync. Records that are `retryable` stay in
    /// [`WalletCore::pending_records`], across restarts too; the rest are
    /// dropped from it.
    pub fn mark_failed(&self, ids: &[Uuid], reason: &str, retryable: bool) -> Result<(), WalletError> {
        self.set_sync_status(
            ids,
            SyncStatus::Failed {
                reason: reason.to_string(),
                retryable,
            },
        )
    }

    fn set_sync_status(&self, ids: &[Uuid], status: SyncStatus) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = state.outgoing.get(id) {
                let mut r = r.clone();
                r.sync_status = status.clone();
                updated.push(r);
            }
        }
        self.persist_records(&updated)?;
        for r in updated {
            state.outgoing.insert(r.id, r);
        }
        Ok(())
    }

    // -- Persistence --------------------------------------------------------

    fn persist_tokens(&self, tokens: &[Token]) -> Result<(), WalletError> {
        if let Some(store) = &self.store {
            for token in tokens {
                store.put_token(token)?;
            }
        }
        Ok(())
    }

    fn persist_records(&self, records: &[TransferRecord]) -> Result<(), WalletError> {
        if let Some(store) = &self.store {
            for record in records {
                store.put_transfer(record)?;
            }
        }
        Ok(())
    }
}

/// Came from a peer rather than straight from the issuer.
fn is_received(h: &Holding, me: &PublicKey) -> bool {
    h.token.owner != *me || !h.provenance.is_empty()
}

fn log_rejection(id: &TokenId, from: &PeerId, reason: ReceiveRejection) {
    if reason.class().is_security_event() {
        warn!(
            target: "otm::security",
            token = %id.short(),
            peer = %from.short(),
            %reason,
            "incoming token rejected"
        );
    } else {
        warn!(token = %id.short(), peer = %from.short(), %reason, "incoming token rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TokenDb;
    use crate::token::DelegationCertificate;
    use chrono::Duration;

    struct Setup {
        issuer: Keypair,
        alice: WalletCore,
        bob: WalletCore,
        now: DateTime<Utc>,
    }

    fn config() -> WalletConfig {
        WalletConfig::default()
    }

    fn setup() -> Setup {
        let issuer = Keypair::generate();
        let alice = WalletCore::new(Keypair::generate(), issuer.public_key(), &config());
        let bob = WalletCore::new(Keypair::generate(), issuer.public_key(), &config());
        Setup {
            issuer,
            alice,
            bob,
            now: Utc::now(),
        }
    }

    fn mint(s: &Setup, owner: &WalletCore, amounts: &[u64]) -> Vec<Token> {
        amounts
            .iter()
            .map(|&a| {
                Token::mint(owner.public_key(), a, s.now + Duration::days(30), &s.issuer).unwrap()
            })
            .collect()
    }

    fn give_divider(s: &Setup, wallet: &WalletCore) {
        let delegate = Keypair::generate();
        let cert = DelegationCertificate::issue(
            &s.issuer,
            wallet.public_key(),
            delegate.public_key(),
            s.now + Duration::days(60),
        );
        wallet
            .install_divider(DelegatedDivider::new(delegate, cert).unwrap())
            .unwrap();
    }

    #[test]
    fn deposit_rejects_foreign_tokens() {
        let s = setup();
        let for_bob = mint(&s, &s.bob, &[100]);
        let err = s.alice.deposit_issued(for_bob, s.now).unwrap_err();
        assert!(matches!(
            err,
            WalletError::InvalidToken {
                reason: ReceiveRejection::NotOwned,
                ..
            }
        ));
        assert_eq!(s.alice.balance(s.now).spendable, 0);
    }

    #[test]
    fn divided_payment_end_to_end() {
        let s = setup();
        give_divider(&s, &s.alice);
        s.alice.deposit_issued(mint(&s, &s.alice, &[100]), s.now).unwrap();

        let payment = s.alice.pay(30, s.bob.public_key(), s.now).unwrap();
        assert_eq!(payment.amount(), 30);
        assert_eq!(s.alice.balance(s.now).reserved, 30);
        assert_eq!(s.alice.balance(s.now).spendable, 70);

        s.bob
            .receive_payment(&payment, &s.alice.public_key(), s.now)
            .unwrap();
        s.alice.confirm_payment(&payment.transfer_id()).unwrap();

        let a = s.alice.balance(s.now);
        assert_eq!((a.spendable, a.reserved), (70, 0));
        let b = s.bob.balance(s.now);
        assert_eq!((b.spendable, b.received), (30, 30));
        assert_eq!(s.alice.pending_records().len(), 1);
    }

    #[test]
    fn received_tokens_move_on_whole_with_provenance() {
        let s = setup();
        let carol = WalletCore::new(Keypair::generate(), s.issuer.public_key(), &config());
        s.alice.deposit_issued(mint(&s, &s.alice, &[40]), s.now).unwrap();

        let p1 = s.alice.pay(40, s.bob.public_key(), s.now).unwrap();
        s.bob.receive_payment(&p1, &s.alice.public_key(), s.now).unwrap();
        s.alice.confirm_payment(&p1.transfer_id()).unwrap();

        // Bob can't divide a received token.
        let err = s.bob.pay(10, carol.public_key(), s.now).unwrap_err();
        assert!(matches!(err, WalletError::CannotMakeChange { amount: 10 }));

        let p2 = s.bob.pay(40, carol.public_key(), s.now).unwrap();
        assert_eq!(p2.provenance.len(), 1);
        carol.receive_payment(&p2, &s.bob.public_key(), s.now).unwrap();
        assert_eq!(carol.balance(s.now).received, 40);
    }

    #[test]
    fn insufficient_balance_is_reported() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[10, 20]), s.now).unwrap();
        let err = s.alice.select_tokens_for_amount(31, s.now).unwrap_err();
        assert!(matches!(
            err,
            WalletError::InsufficientOfflineBalance {
                needed: 31,
                available: 30
            }
        ));
        assert_eq!(err.class(), crate::error::ErrorClass::InsufficientOfflineBalance);
    }

    #[test]
    fn reserved_tokens_are_not_selected_twice() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[50]), s.now).unwrap();
        let plan = s.alice.select_tokens_for_amount(50, s.now).unwrap();
        assert!(s.alice.select_tokens_for_amount(50, s.now).is_err());

        s.alice.release(&plan.lease_id);
        assert!(s.alice.select_tokens_for_amount(50, s.now).is_ok());
    }

    #[test]
    fn pending_payment_outlives_its_lease() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[50]), s.now).unwrap();
        s.alice.pay(50, s.bob.public_key(), s.now).unwrap();

        let later = s.now + Duration::seconds(3_600);
        assert!(s.alice.select_tokens_for_amount(50, later).is_err());
    }

    #[test]
    fn cancel_returns_tokens() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[50]), s.now).unwrap();
        let payment = s.alice.pay(50, s.bob.public_key(), s.now).unwrap();
        s.alice.cancel_payment(&payment.transfer_id()).unwrap();
        assert_eq!(s.alice.balance(s.now).spendable, 50);
        assert!(s.alice.pending_records().is_empty());
        assert!(matches!(
            s.alice.confirm_payment(&payment.transfer_id()),
            Err(WalletError::UnknownPayment(_))
        ));
    }

    #[test]
    fn tampered_payment_is_rejected_whole() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[10, 20]), s.now).unwrap();
        let mut payment = s.alice.pay(30, s.bob.public_key(), s.now).unwrap();
        payment.tokens[1].amount += 1;

        assert!(s
            .bob
            .receive_payment(&payment, &s.alice.public_key(), s.now)
            .is_err());
        assert_eq!(s.bob.balance(s.now).spendable, 0);
    }

    #[test]
    fn replayed_payment_is_rejected() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[25]), s.now).unwrap();
        let payment = s.alice.pay(25, s.bob.public_key(), s.now).unwrap();
        s.bob.receive_payment(&payment, &s.alice.public_key(), s.now).unwrap();
        assert!(s
            .bob
            .receive_payment(&payment, &s.alice.public_key(), s.now)
            .is_err());
    }

    #[test]
    fn receive_token_checks_delivering_peer() {
        let s = setup();
        let mallory = Keypair::generate();
        let token = mint(&s, &s.alice, &[15]).remove(0);
        let record = TransferRecord::create(
            &s.alice.identity,
            s.bob.public_key(),
            std::slice::from_ref(&token),
            s.now,
        )
        .unwrap();

        let chain = std::slice::from_ref(&record);
        assert!(!s
            .bob
            .receive_token(token.clone(), &mallory.public_key(), chain, s.now));
        assert!(s.bob.receive_token(token.clone(), &s.alice.public_key(), chain, s.now));
        assert!(!s.bob.receive_token(token, &s.alice.public_key(), chain, s.now));
    }

    #[test]
    fn expire_stale_moves_value_to_expired() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[10]), s.now).unwrap();
        let after = s.now + Duration::days(31);
        assert_eq!(s.alice.expire_stale(after).unwrap().len(), 1);
        let b = s.alice.balance(after);
        assert_eq!((b.spendable, b.expired), (0, 10));
    }

    #[test]
    fn redemption_batch_reserves_received_tokens() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[60]), s.now).unwrap();
        let payment = s.alice.pay(60, s.bob.public_key(), s.now).unwrap();
        s.bob.receive_payment(&payment, &s.alice.public_key(), s.now).unwrap();

        let batch = s.bob.prepare_redemption(s.now).unwrap();
        assert_eq!(batch.request.tokens.len(), 1);
        assert_eq!(batch.request.provenance.len(), 1);
        assert!(s.bob.prepare_redemption(s.now).is_none());
        assert!(s.bob.select_tokens_for_amount(60, s.now).is_err());

        s.bob.mark_redeemed(&batch.token_ids()).unwrap();
        s.bob.release(&batch.lease_id);
        assert_eq!(s.bob.balance(s.now).total_usable(), 0);
    }

    #[test]
    fn quarantined_tokens_are_excluded() {
        let s = setup();
        let tokens = mint(&s, &s.alice, &[10]);
        let id = tokens[0].id;
        s.alice.deposit_issued(tokens, s.now).unwrap();
        assert!(s.alice.quarantine(&id, "issuer refused"));
        assert_eq!(s.alice.balance(s.now).quarantined, 10);
        assert!(s.alice.select_tokens_for_amount(10, s.now).is_err());
    }

    #[test]
    fn sync_status_bookkeeping() {
        let s = setup();
        s.alice.deposit_issued(mint(&s, &s.alice, &[5, 7]), s.now).unwrap();
        let p1 = s.alice.pay(5, s.bob.public_key(), s.now).unwrap();
        s.alice.confirm_payment(&p1.transfer_id()).unwrap();
        let p2 = s.alice.pay(7, s.bob.public_key(), s.now).unwrap();
        s.alice.confirm_payment(&p2.transfer_id()).unwrap();

        s.alice.mark_failed(&[p1.transfer_id()], "link down", true).unwrap();
        assert_eq!(s.alice.pending_records().len(), 2);
        s.alice.mark_failed(&[p1.transfer_id()], "double spend", false).unwrap();
        s.alice.mark_synced(&[p2.transfer_id()]).unwrap();
        assert!(s.alice.pending_records().is_empty());
    }

    #[test]
    fn restore_rebuilds_holdings_and_records() {
        let s = setup();
        let db: Arc<dyn TokenStore> = Arc::new(TokenDb::open_temporary().unwrap());
        let alice_key = Keypair::generate();
        let alice =
            WalletCore::restore(alice_key.clone(), s.issuer.public_key(), &config(), db.clone())
                .unwrap();
        let tokens: Vec<Token> = [30u64, 20]
            .iter()
            .map(|&a| {
                Token::mint(alice.public_key(), a, s.now + Duration::days(30), &s.issuer).unwrap()
            })
            .collect();
        alice.deposit_issued(tokens, s.now).unwrap();
        let p = alice.pay(20, s.bob.public_key(), s.now).unwrap();
        alice.confirm_payment(&p.transfer_id()).unwrap();
        drop(alice);

        let again = WalletCore::restore(alice_key, s.issuer.public_key(), &config(), db).unwrap();
        let b = again.balance(s.now);
        assert_eq!(b.spendable, 30);
        assert_eq!(again.pending_records().len(), 1);
        assert_eq!(again.spent_ids().len(), 1);
    }

    #[test]
    fn refused_records_stay_refused_after_restart() {
        let s = setup();
        let db: Arc<dyn TokenStore> = Arc::new(TokenDb::open_temporary().unwrap());
        let alice_key = Keypair::generate();
        let alice =
            WalletCore::restore(alice_key.clone(), s.issuer.public_key(), &config(), db.clone())
                .unwrap();
        let tokens: Vec<Token> = [10u64, 10]
            .iter()
            .map(|&a| {
                Token::mint(alice.public_key(), a, s.now + Duration::days(30), &s.issuer).unwrap()
            })
            .collect();
        alice.deposit_issued(tokens, s.now).unwrap();
        let refused = alice.pay(10, s.bob.public_key(), s.now).unwrap();
        alice.confirm_payment(&refused.transfer_id()).unwrap();
        let deferred = alice.pay(10, s.bob.public_key(), s.now).unwrap();
        alice.confirm_payment(&deferred.transfer_id()).unwrap();

        alice.mark_failed(&[refused.transfer_id()], "double spend", false).unwrap();
        alice.mark_failed(&[deferred.transfer_id()], "link down", true).unwrap();
        drop(alice);

        let again = WalletCore::restore(alice_key, s.issuer.public_key(), &config(), db).unwrap();
        let pending = again.pending_records();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, deferred.transfer_id());
    }

    #[test]
    fn foreign_divider_is_refused() {
        let s = setup();
        let delegate = Keypair::generate();
        let cert = DelegationCertificate::issue(
            &s.issuer,
            s.bob.public_key(),
            delegate.public_key(),
            s.now + Duration::days(1),
        );
        let divider = DelegatedDivider::new(delegate, cert).unwrap();
        assert!(matches!(
            s.alice.install_divider(divider),
            Err(WalletError::InvalidDelegation(_))
        ));
    }
}
