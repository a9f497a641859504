//! # Issuer Registry
//!
//! Everything the issuer knows, in one struct that lives behind a single
//! mutex: every token it has minted or seen redeemed, the conservation budget
//! of every minted root ("origin"), and the audit log of synced transfers.
//!
//! All methods are synchronous and never touch the ledger. Anything that needs
//! the ledger is split into a `begin_*` step that reserves state under the
//! lock and a `commit_*` / `abort_*` step that finishes it once the ledger has
//! answered. While a redemption is in flight its tokens are marked pending, so
//! a concurrent redemption of the same id, or an expiry sweep of the same
//! origin, backs off.
//!
//! ## Why a per-origin budget
//!
//! Offline divisions are signed on the holder's device. The issuer learns
//! about those children only when they are presented, so it cannot keep a
//! per-token spent list for them in advance. What it *can* check is that the
//! sum of everything ever redeemed from one root never exceeds that root's
//! face value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::crypto::keys::PublicKey;
use crate::error::ErrorClass;
use crate::token::{
    order_provenance, resolve_owner, verify_signature, Token, TokenId, TokenStatus, TransferRecord,
};

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why a redemption batch was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    EmptyBatch,
    BatchTooLarge,
    DuplicateInBatch,
    InvalidSignature,
    Expired,
    NotOwned,
    NotSpendable,
    AlreadyRedeemed,
    /// The presenter already handed this token to someone else in a synced
    /// transfer.
    AlreadyTransferred,
    UnknownLineage,
    /// Redeeming would take more out of a root than was ever paid in.
    ConservationViolated,
}

impl RejectReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            RejectReason::InvalidSignature => ErrorClass::Signature,
            RejectReason::Expired => ErrorClass::TokenExpired,
            RejectReason::AlreadyRedeemed
            | RejectReason::AlreadyTransferred
            | RejectReason::ConservationViolated
            | RejectReason::DuplicateInBatch => ErrorClass::DoubleSpendDetected,
            RejectReason::EmptyBatch
            | RejectReason::BatchTooLarge
            | RejectReason::NotOwned
            | RejectReason::NotSpendable
            | RejectReason::UnknownLineage => ErrorClass::RedemptionRejected,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::EmptyBatch => "empty batch",
            RejectReason::BatchTooLarge => "batch too large",
            RejectReason::DuplicateInBatch => "token listed twice in batch",
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::Expired => "token expired",
            RejectReason::NotOwned => "presenter does not own token",
            RejectReason::NotSpendable => "token is not spendable",
            RejectReason::AlreadyRedeemed => "token already redeemed",
            RejectReason::AlreadyTransferred => "token was already transferred away",
            RejectReason::UnknownLineage => "token does not descend from a known issuance",
            RejectReason::ConservationViolated => "redemption exceeds the value of its origin",
        };
        f.write_str(s)
    }
}

/// A refused redemption: the first offending token (when there is one) and
/// the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub first_invalid_token_id: Option<TokenId>,
    pub reason: RejectReason,
}

impl Rejection {
    fn batch(reason: RejectReason) -> Self {
        Self {
            first_invalid_token_id: None,
            reason,
        }
    }

    fn token(id: TokenId, reason: RejectReason) -> Self {
        Self {
            first_invalid_token_id: Some(id),
            reason,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first_invalid_token_id {
            Some(id) => write!(f, "{} (token {})", self.reason, id.short()),
            None => write!(f, "{}", self.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Tracked {
    token: Token,
    /// Part of a redemption whose ledger credit hasn't settled yet.
    pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundState {
    Unrefunded,
    InFlight,
    Refunded { amount: u64 },
}

/// Conservation budget of one minted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBudget {
    pub amount: u64,
    pub purchaser: PublicKey,
    pub expires_at: DateTime<Utc>,
    /// Value already redeemed out of this root.
    pub claimed: u64,
    /// Value reserved by in-flight redemptions.
    pub pending: u64,
    pub refund: RefundState,
}

impl OriginBudget {
    fn from_root(root: &Token) -> Self {
        Self {
            amount: root.amount,
            purchaser: root.owner,
            expires_at: root.expires_at,
            claimed: 0,
            pending: 0,
            refund: RefundState::Unrefunded,
        }
    }

    /// Value neither redeemed, reserved, nor refunded.
    pub fn outstanding(&self) -> u64 {
        match self.refund {
            RefundState::Refunded { .. } => 0,
            _ => self.amount.saturating_sub(self.claimed + self.pending),
        }
    }
}

/// What `begin_redemption` reserved, handed back to commit or abort.
#[derive(Debug, Clone)]
pub struct RedemptionTicket {
    pub presenter: PublicKey,
    pub total: u64,
    items: Vec<TicketItem>,
}

impl RedemptionTicket {
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.items.iter().map(|i| i.id).collect()
    }
}

#[derive(Debug, Clone)]
struct TicketItem {
    id: TokenId,
    origin: TokenId,
    amount: u64,
    /// First time the issuer sees this token (an offline division output).
    inserted: bool,
}

/// A refund the sweep decided to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundClaim {
    pub origin_id: TokenId,
    pub purchaser: PublicKey,
    pub amount: u64,
}

/// Why a transfer record failed to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub reason: String,
    pub double_spend: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub tokens_tracked: usize,
    pub origins: usize,
    pub outstanding_value: u64,
    pub redeemed_value: u64,
    pub refunded_value: u64,
    pub synced_transfers: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    tokens: HashMap<TokenId, Tracked>,
    origins: HashMap<TokenId, OriginBudget>,
    /// origin -> every token of that lineage the issuer knows about.
    lineage: HashMap<TokenId, Vec<TokenId>>,
    transfers: HashMap<Uuid, TransferRecord>,
    transfers_by_token: HashMap<TokenId, Vec<Uuid>>,
    redeemed_value: u64,
    refunded_value: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Tokens -------------------------------------------------------------

    /// Track a freshly minted root and open its budget.
    pub fn insert_minted(&mut self, token: Token) {
        self.origins
            .insert(token.id, OriginBudget::from_root(&token));
        self.track(token);
    }

    /// Track a token derived from a known origin (online division output).
    pub fn insert_derived(&mut self, token: Token) {
        self.track(token);
    }

    fn track(&mut self, token: Token) {
        self.lineage.entry(token.origin_id).or_default().push(token.id);
        self.tokens.insert(
            token.id,
            Tracked {
                token,
                pending: false,
            },
        );
    }

    /// Overwrite the stored copy of a known token (e.g. after a division
    /// marked it `Divided`).
    pub fn update(&mut self, token: Token) {
        if let Some(tracked) = self.tokens.get_mut(&token.id) {
            tracked.token = token;
        }
    }

    pub fn get(&self, id: &TokenId) -> Option<&Token> {
        self.tokens.get(id).map(|t| &t.token)
    }

    pub fn origin(&self, id: &TokenId) -> Option<&OriginBudget> {
        self.origins.get(id)
    }

    /// Mark a token busy (or free it again) without touching its status.
    /// A held token is consumed for every other caller.
    pub fn set_held(&mut self, id: &TokenId, held: bool) {
        if let Some(tracked) = self.tokens.get_mut(id) {
            tracked.pending = held;
        }
    }

    /// Whether the token has been consumed as far as the issuer knows:
    /// redeemed, divided, expired, or locked in an in-flight redemption.
    pub fn is_consumed(&self, id: &TokenId) -> bool {
        self.tokens.get(id).is_some_and(|t| {
            t.pending
                || matches!(
                    t.token.status,
                    TokenStatus::Redeemed | TokenStatus::Divided | TokenStatus::Expired
                )
        })
    }

    /// Who holds `token` according to the synced transfer log.
    pub fn synced_holder(&self, token: &Token) -> Option<PublicKey> {
        let records: Vec<TransferRecord> = self
            .transfers_by_token
            .get(&token.id)
            .map(|ids| ids.iter().filter_map(|id| self.transfers.get(id).cloned()).collect())
            .unwrap_or_default();
        resolve_owner(token, &order_provenance(token, records))
    }

    // -- Redemption ---------------------------------------------------------

    /// Check a whole batch and, if every token passes, reserve it.
    ///
    /// Nothing is modified when this returns `Err`.
    pub fn begin_redemption(
        &mut self,
        presenter: &PublicKey,
        tokens: &[Token],
        provenance: &[TransferRecord],
        issuer_pk: &PublicKey,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> Result<RedemptionTicket, Rejection> {
        if tokens.is_empty() {
            return Err(Rejection::batch(RejectReason::EmptyBatch));
        }
        if tokens.len() > max_batch {
            return Err(Rejection::batch(RejectReason::BatchTooLarge));
        }

        let presented_records: HashSet<Uuid> = provenance.iter().map(|r| r.id).collect();
        let mut seen = HashSet::with_capacity(tokens.len());
        let mut per_origin: HashMap<TokenId, (u64, TokenId)> = HashMap::new();
        let mut items = Vec::with_capacity(tokens.len());
        let mut total: u64 = 0;

        for token in tokens {
            let id = token.id;
            if !seen.insert(id) {
                return Err(Rejection::token(id, RejectReason::DuplicateInBatch));
            }
            if !verify_signature(token, issuer_pk) {
                return Err(Rejection::token(id, RejectReason::InvalidSignature));
            }
            if token.is_expired(now) {
                return Err(Rejection::token(id, RejectReason::Expired));
            }
            if resolve_owner(token, provenance).as_ref() != Some(presenter) {
                return Err(Rejection::token(id, RejectReason::NotOwned));
            }
            if self.gave_away(presenter, &id, &presented_records) {
                return Err(Rejection::token(id, RejectReason::AlreadyTransferred));
            }

            let inserted = match self.tokens.get(&id) {
                Some(tracked) => {
                    if tracked.pending || tracked.token.status == TokenStatus::Redeemed {
                        return Err(Rejection::token(id, RejectReason::AlreadyRedeemed));
                    }
                    match tracked.token.status {
                        TokenStatus::Active | TokenStatus::Spent => {}
                        TokenStatus::Expired => {
                            return Err(Rejection::token(id, RejectReason::Expired))
                        }
                        _ => return Err(Rejection::token(id, RejectReason::NotSpendable)),
                    }
                    false
                }
                None => {
                    // Unknown to the issuer: must be an offline division output
                    // of a root we minted.
                    if token.parent_id.is_none() {
                        return Err(Rejection::token(id, RejectReason::UnknownLineage));
                    }
                    true
                }
            };

            let origin = self
                .origins
                .get(&token.origin_id)
                .ok_or(Rejection::token(id, RejectReason::UnknownLineage))?;
            // Division never changes owner or expiry, so every descendant of
            // a root looks like the root in those two fields.
            if origin.purchaser != token.owner || origin.expires_at != token.expires_at {
                return Err(Rejection::token(id, RejectReason::UnknownLineage));
            }
            if !matches!(origin.refund, RefundState::Unrefunded) {
                return Err(Rejection::token(id, RejectReason::Expired));
            }

            let entry = per_origin.entry(token.origin_id).or_insert((0, id));
            entry.0 = entry
                .0
                .checked_add(token.amount)
                .ok_or(Rejection::token(id, RejectReason::ConservationViolated))?;
            total = total
                .checked_add(token.amount)
                .ok_or(Rejection::token(id, RejectReason::ConservationViolated))?;

            items.push(TicketItem {
                id,
                origin: token.origin_id,
                amount: token.amount,
                inserted,
            });
        }

        for (origin_id, (sum, first)) in &per_origin {
            let Some(origin) = self.origins.get(origin_id) else {
                return Err(Rejection::token(*first, RejectReason::UnknownLineage));
            };
            let committed = origin.claimed + origin.pending;
            if committed.checked_add(*sum).map_or(true, |v| v > origin.amount) {
                return Err(Rejection::token(*first, RejectReason::ConservationViolated));
            }
        }

        // Every check passed: reserve.
        for (token, item) in tokens.iter().zip(items.iter()) {
            if item.inserted {
                // Status isn't signed: start from what the issuer can vouch for.
                let mut fresh = token.clone();
                fresh.status = TokenStatus::Active;
                self.track(fresh);
            }
            if let Some(tracked) = self.tokens.get_mut(&item.id) {
                tracked.pending = true;
            }
            if let Some(origin) = self.origins.get_mut(&item.origin) {
                origin.pending += item.amount;
            }
        }

        Ok(RedemptionTicket {
            presenter: *presenter,
            total,
            items,
        })
    }

    /// Did `presenter` hand `id` to somebody else in a synced transfer that
    /// the presented provenance doesn't account for?
    fn gave_away(&self, presenter: &PublicKey, id: &TokenId, presented: &HashSet<Uuid>) -> bool {
        self.transfers_by_token.get(id).is_some_and(|ids| {
            ids.iter().any(|rid| {
                self.transfers
                    .get(rid)
                    .is_some_and(|r| r.sender == *presenter && !presented.contains(rid))
            })
        })
    }

    /// The ledger paid out: mark everything `Redeemed`. Returns the tokens to
    /// persist.
    pub fn commit_redemption(&mut self, ticket: &RedemptionTicket) -> Vec<Token> {
        let mut updated = Vec::with_capacity(ticket.items.len());
        for item in &ticket.items {
            if let Some(tracked) = self.tokens.get_mut(&item.id) {
                tracked.pending = false;
                if let Err(e) = tracked.token.transition(TokenStatus::Redeemed) {
                    tracing::error!(error = %e, "reserved token could not be marked redeemed");
                }
                updated.push(tracked.token.clone());
            }
            if let Some(origin) = self.origins.get_mut(&item.origin) {
                origin.pending -= item.amount;
                origin.claimed += item.amount;
            }
        }
        self.redeemed_value += ticket.total;
        updated
    }

    /// The ledger failed: put everything back exactly as it was.
    pub fn abort_redemption(&mut self, ticket: &RedemptionTicket) {
        for item in &ticket.items {
            if item.inserted {
                self.tokens.remove(&item.id);
                if let Some(ids) = self.lineage.get_mut(&item.origin) {
                    ids.retain(|id| id != &item.id);
                }
            } else if let Some(tracked) = self.tokens.get_mut(&item.id) {
                tracked.pending = false;
            }
            if let Some(origin) = self.origins.get_mut(&item.origin) {
                origin.pending -= item.amount;
            }
        }
    }

    // -- Expiry -------------------------------------------------------------

    /// Claim every expired, unrefunded root that has no redemption in flight.
    /// `now` is read once by the caller for the whole sweep.
    pub fn begin_refunds(&mut self, now: DateTime<Utc>) -> Vec<RefundClaim> {
        let mut claims = Vec::new();
        for (origin_id, origin) in self.origins.iter_mut() {
            if now < origin.expires_at
                || origin.refund != RefundState::Unrefunded
                || origin.pending > 0
            {
                continue;
            }
            let busy = self.lineage.get(origin_id).is_some_and(|ids| {
                ids.iter()
                    .any(|id| self.tokens.get(id).is_some_and(|t| t.pending))
            });
            if busy {
                continue;
            }
            origin.refund = RefundState::InFlight;
            claims.push(RefundClaim {
                origin_id: *origin_id,
                purchaser: origin.purchaser,
                amount: origin.amount - origin.claimed,
            });
        }
        claims
    }

    /// The refund settled: close the budget and expire the lineage. Returns
    /// the tokens to persist.
    pub fn commit_refund(&mut self, claim: &RefundClaim) -> Vec<Token> {
        if let Some(origin) = self.origins.get_mut(&claim.origin_id) {
            origin.refund = RefundState::Refunded {
                amount: claim.amount,
            };
        }
        self.refunded_value += claim.amount;

        let mut updated = Vec::new();
        if let Some(ids) = self.lineage.get(&claim.origin_id) {
            for id in ids {
                if let Some(tracked) = self.tokens.get_mut(id) {
                    if tracked.token.status.can_transition_to(TokenStatus::Expired) {
                        tracked.token.status = TokenStatus::Expired;
                        updated.push(tracked.token.clone());
                    }
                }
            }
        }
        updated
    }

    pub fn abort_refund(&mut self, claim: &RefundClaim) {
        if let Some(origin) = self.origins.get_mut(&claim.origin_id) {
            if origin.refund == RefundState::InFlight {
                origin.refund = RefundState::Unrefunded;
            }
        }
    }

    // -- Transfer audit log -------------------------------------------------

    /// Record a verified transfer. Returns issuer-known tokens that moved to
    /// `Spent`, or why the record was refused. Re-recording an identical
    /// record is a no-op success.
    pub fn record_transfer(&mut self, record: &TransferRecord) -> Result<Vec<Token>, SyncFailure> {
        if let Some(existing) = self.transfers.get(&record.id) {
            if existing.signing_payload() == record.signing_payload() {
                return Ok(Vec::new());
            }
            return Err(SyncFailure {
                reason: "conflicting record with the same id".into(),
                double_spend: false,
            });
        }

        if let Err(e) = record.verify() {
            return Err(SyncFailure {
                reason: e.to_string(),
                double_spend: false,
            });
        }

        // Amount must match when every listed token is known here.
        let known: Option<Vec<u64>> = record
            .token_ids
            .iter()
            .map(|id| self.tokens.get(id).map(|t| t.token.amount))
            .collect();
        if let Some(amounts) = known {
            let sum = amounts.iter().try_fold(0u64, |acc, a| acc.checked_add(*a));
            if sum != Some(record.amount) {
                return Err(SyncFailure {
                    reason: "amount does not match the listed tokens".into(),
                    double_spend: false,
                });
            }
        }

        for id in &record.token_ids {
            let reused = self.transfers_by_token.get(id).is_some_and(|ids| {
                ids.iter().any(|rid| {
                    self.transfers
                        .get(rid)
                        .is_some_and(|r| r.sender == record.sender)
                })
            });
            if reused {
                return Err(SyncFailure {
                    reason: format!("token {} already transferred by this sender", id.short()),
                    double_spend: true,
                });
            }
        }

        let mut stored = record.clone();
        stored.sync_status = crate::token::SyncStatus::Synced;
        for id in &record.token_ids {
            self.transfers_by_token.entry(*id).or_default().push(record.id);
        }
        self.transfers.insert(record.id, stored);

        let mut updated = Vec::new();
        for id in &record.token_ids {
            if let Some(tracked) = self.tokens.get_mut(id) {
                if tracked.token.status == TokenStatus::Active {
                    tracked.token.status = TokenStatus::Spent;
                    updated.push(tracked.token.clone());
                }
            }
        }
        Ok(updated)
    }

    pub fn transfer(&self, id: &Uuid) -> Option<&TransferRecord> {
        self.transfers.get(id)
    }

    // -- Restore & stats ----------------------------------------------------

    /// Rebuild from persisted tokens, transfer records and refund marks.
    ///
    /// Roots open a budget; `claimed` is the sum of redeemed tokens in each
    /// lineage. An origin is refunded when the store holds a refund mark for
    /// it, or when any token of its lineage is `Expired`: only a paid refund
    /// expires tokens here.
    pub fn restore(
        tokens: Vec<Token>,
        transfers: Vec<TransferRecord>,
        refunds: Vec<(TokenId, u64)>,
    ) -> Self {
        let mut registry = Registry::new();

        let (roots, derived): (Vec<Token>, Vec<Token>) =
            tokens.into_iter().partition(|t| t.is_root());
        for root in roots {
            registry.insert_minted(root);
        }
        for token in derived {
            registry.track(token);
        }

        let redeemed: Vec<(TokenId, u64)> = registry
            .tokens
            .values()
            .filter(|t| t.token.status == TokenStatus::Redeemed)
            .map(|t| (t.token.origin_id, t.token.amount))
            .collect();
        for (origin_id, amount) in redeemed {
            if let Some(origin) = registry.origins.get_mut(&origin_id) {
                origin.claimed += amount;
            }
            registry.redeemed_value += amount;
        }

        let expired_lineages: HashSet<TokenId> = registry
            .tokens
            .values()
            .filter(|t| t.token.status == TokenStatus::Expired)
            .map(|t| t.token.origin_id)
            .collect();
        let marks: HashMap<TokenId, u64> = refunds.into_iter().collect();
        for (origin_id, origin) in registry.origins.iter_mut() {
            let amount = match marks.get(origin_id) {
                Some(&paid) => paid,
                None if expired_lineages.contains(origin_id) => {
                    origin.amount - origin.claimed.min(origin.amount)
                }
                None => continue,
            };
            origin.refund = RefundState::Refunded { amount };
            registry.refunded_value += amount;
        }

        for record in transfers {
            if record.sync_status == crate::token::SyncStatus::Synced {
                for id in &record.token_ids {
                    registry
                        .transfers_by_token
                        .entry(*id)
                        .or_default()
                        .push(record.id);
                }
                registry.transfers.insert(record.id, record);
            }
        }

        registry
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tokens_tracked: self.tokens.len(),
            origins: self.origins.len(),
            outstanding_value: self.origins.values().map(|o| o.outstanding()).sum(),
            redeemed_value: self.redeemed_value,
            refunded_value: self.refunded_value,
            synced_transfers: self.transfers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::token::divide;
    use chrono::Duration;

    struct World {
        issuer: Keypair,
        alice: Keypair,
        registry: Registry,
        root: Token,
        now: DateTime<Utc>,
    }

    fn world() -> World {
        let issuer = Keypair::generate();
        let alice = Keypair::generate();
        let now = Utc::now();
        let root = Token::mint(alice.public_key(), 100, now + Duration::days(30), &issuer).unwrap();
        let mut registry = Registry::new();
        registry.insert_minted(root.clone());
        World {
            issuer,
            alice,
            registry,
            root,
            now,
        }
    }

    fn redeem(w: &mut World, tokens: &[Token]) -> Result<RedemptionTicket, Rejection> {
        let presenter = w.alice.public_key();
        let issuer_pk = w.issuer.public_key();
        w.registry
            .begin_redemption(&presenter, tokens, &[], &issuer_pk, 64, w.now)
    }

    #[test]
    fn redeem_root_commits() {
        let mut w = world();
        let root = w.root.clone();
        let ticket = redeem(&mut w, &[root.clone()]).unwrap();
        assert_eq!(ticket.total, 100);
        assert!(w.registry.is_consumed(&root.id), "pending counts as consumed");

        let updated = w.registry.commit_redemption(&ticket);
        assert_eq!(updated[0].status, TokenStatus::Redeemed);
        assert_eq!(w.registry.origin(&root.id).unwrap().claimed, 100);

        let again = redeem(&mut w, &[root.clone()]).unwrap_err();
        assert_eq!(again.reason, RejectReason::AlreadyRedeemed);
        assert_eq!(again.first_invalid_token_id, Some(root.id));
    }

    #[test]
    fn abort_restores_everything() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, _) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();

        let ticket = redeem(&mut w, &[pay.clone()]).unwrap();
        assert!(w.registry.get(&pay.id).is_some());
        w.registry.abort_redemption(&ticket);

        assert!(w.registry.get(&pay.id).is_none());
        let origin = w.registry.origin(&w.root.id).unwrap();
        assert_eq!((origin.claimed, origin.pending), (0, 0));
        assert!(redeem(&mut w, &[pay]).is_ok());
    }

    #[test]
    fn children_cannot_exceed_their_root() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();

        // Root redeemed whole first; the offline children now overdraw it.
        let root = w.root.clone();
        let t = redeem(&mut w, &[root]).unwrap();
        w.registry.commit_redemption(&t);

        let err = redeem(&mut w, &[pay]).unwrap_err();
        assert_eq!(err.reason, RejectReason::ConservationViolated);
        assert!(err.reason.class().is_security_event());
        let err = redeem(&mut w, &[change]).unwrap_err();
        assert_eq!(err.reason, RejectReason::ConservationViolated);
    }

    #[test]
    fn split_redeems_exactly_once() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();

        let t = redeem(&mut w, &[pay.clone(), change.clone()]).unwrap();
        assert_eq!(t.total, 100);
        w.registry.commit_redemption(&t);
        assert_eq!(w.registry.stats().redeemed_value, 100);

        assert_eq!(
            redeem(&mut w, &[pay]).unwrap_err().reason,
            RejectReason::AlreadyRedeemed
        );
    }

    #[test]
    fn batch_checks_fail_without_side_effects() {
        let mut w = world();
        let root = w.root.clone();
        assert_eq!(redeem(&mut w, &[]).unwrap_err().reason, RejectReason::EmptyBatch);
        assert_eq!(
            redeem(&mut w, &[root.clone(), root.clone()]).unwrap_err().reason,
            RejectReason::DuplicateInBatch
        );

        let mut forged = root.clone();
        forged.amount = 1_000;
        assert_eq!(
            redeem(&mut w, &[root.clone(), forged]).unwrap_err().reason,
            RejectReason::InvalidSignature
        );
        let origin = w.registry.origin(&root.id).unwrap();
        assert_eq!(origin.pending, 0);
        assert!(!w.registry.is_consumed(&root.id));
    }

    #[test]
    fn unknown_root_is_unknown_lineage() {
        let mut w = world();
        let stray = Token::mint(w.alice.public_key(), 5, w.root.expires_at, &w.issuer).unwrap();
        assert_eq!(
            redeem(&mut w, &[stray]).unwrap_err().reason,
            RejectReason::UnknownLineage
        );
    }

    #[test]
    fn presenter_must_own() {
        let mut w = world();
        let mallory = Keypair::generate().public_key();
        let issuer_pk = w.issuer.public_key();
        let err = w
            .registry
            .begin_redemption(&mallory, &[w.root.clone()], &[], &issuer_pk, 64, w.now)
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::NotOwned);
    }

    #[test]
    fn refund_sweep_is_idempotent() {
        let mut w = world();
        let later = w.root.expires_at + Duration::seconds(1);

        assert!(w.registry.begin_refunds(w.now).is_empty());
        let claims = w.registry.begin_refunds(later);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].amount, 100);
        assert_eq!(claims[0].purchaser, w.alice.public_key());

        // Still in flight: a second sweep must not claim it again.
        assert!(w.registry.begin_refunds(later).is_empty());

        let expired = w.registry.commit_refund(&claims[0]);
        assert_eq!(expired[0].status, TokenStatus::Expired);
        assert!(w.registry.begin_refunds(later).is_empty());
        assert_eq!(w.registry.stats().refunded_value, 100);
    }

    #[test]
    fn refund_covers_only_unclaimed_value() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, _change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();
        let t = redeem(&mut w, &[pay]).unwrap();
        w.registry.commit_redemption(&t);

        let claims = w.registry.begin_refunds(w.root.expires_at);
        assert_eq!(claims[0].amount, 70);
    }

    #[test]
    fn sweep_skips_origins_with_pending_redemption() {
        let mut w = world();
        let root = w.root.clone();
        let ticket = redeem(&mut w, &[root.clone()]).unwrap();
        assert!(w.registry.begin_refunds(root.expires_at).is_empty());
        w.registry.abort_redemption(&ticket);
        assert_eq!(w.registry.begin_refunds(root.expires_at).len(), 1);
    }

    #[test]
    fn aborted_refund_is_retried() {
        let mut w = world();
        let claims = w.registry.begin_refunds(w.root.expires_at);
        w.registry.abort_refund(&claims[0]);
        assert_eq!(w.registry.begin_refunds(w.root.expires_at).len(), 1);
    }

    #[test]
    fn transfer_log_detects_double_spend() {
        let mut w = world();
        let bob = Keypair::generate().public_key();
        let carol = Keypair::generate().public_key();
        let first = TransferRecord::create(&w.alice, bob, &[w.root.clone()], w.now).unwrap();
        let second = TransferRecord::create(&w.alice, carol, &[w.root.clone()], w.now).unwrap();

        let spent = w.registry.record_transfer(&first).unwrap();
        assert_eq!(spent[0].status, TokenStatus::Spent);
        assert!(w.registry.record_transfer(&first).unwrap().is_empty(), "idempotent");

        let failure = w.registry.record_transfer(&second).unwrap_err();
        assert!(failure.double_spend);
        assert_eq!(w.registry.synced_holder(&w.root), Some(bob));
    }

    #[test]
    fn presenter_who_gave_token_away_is_refused() {
        let mut w = world();
        let bob = Keypair::generate().public_key();
        let record = TransferRecord::create(&w.alice, bob, &[w.root.clone()], w.now).unwrap();
        w.registry.record_transfer(&record).unwrap();

        let root = w.root.clone();
        assert_eq!(
            redeem(&mut w, &[root]).unwrap_err().reason,
            RejectReason::AlreadyTransferred
        );
    }

    #[test]
    fn transfer_amount_mismatch_fails() {
        let mut w = world();
        let mut record =
            TransferRecord::create(&w.alice, Keypair::generate().public_key(), &[w.root.clone()], w.now)
                .unwrap();
        record.amount = 99;
        record.sender_signature = w.alice.sign(&record.signing_payload());
        let failure = w.registry.record_transfer(&record).unwrap_err();
        assert!(!failure.double_spend);
    }

    #[test]
    fn restore_rebuilds_budgets() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();
        let t = redeem(&mut w, &[pay.clone()]).unwrap();
        let mut persisted = w.registry.commit_redemption(&t);
        persisted.push(w.registry.get(&w.root.id).unwrap().clone());

        let mut restored = Registry::restore(persisted, Vec::new(), Vec::new());
        let origin = restored.origin(&w.root.id).unwrap();
        assert_eq!(origin.claimed, 30);
        assert_eq!(origin.refund, RefundState::Unrefunded);

        let issuer_pk = w.issuer.public_key();
        let err = restored
            .begin_redemption(&w.alice.public_key(), &[pay], &[], &issuer_pk, 64, w.now)
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::AlreadyRedeemed);
        assert!(restored
            .begin_redemption(&w.alice.public_key(), &[change], &[], &issuer_pk, 64, w.now)
            .is_ok());
    }

    /// Root divided online, both halves redeemed, then swept: nothing is
    /// left `Expired`, so only the refund mark says the origin is closed.
    #[test]
    fn restore_honours_refund_marks() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();
        w.registry.update(parent.clone());
        w.registry.insert_derived(pay.clone());
        w.registry.insert_derived(change.clone());
        let t = redeem(&mut w, &[pay, change]).unwrap();
        let mut persisted = w.registry.commit_redemption(&t);
        persisted.push(parent);

        let claims = w.registry.begin_refunds(w.root.expires_at);
        assert_eq!(claims[0].amount, 0);
        w.registry.commit_refund(&claims[0]);

        let mut restored =
            Registry::restore(persisted.clone(), Vec::new(), vec![(w.root.id, 0)]);
        assert!(restored.begin_refunds(w.root.expires_at).is_empty());
        assert_eq!(
            restored.origin(&w.root.id).unwrap().refund,
            RefundState::Refunded { amount: 0 }
        );

        // Without the mark the origin would look open again.
        let mut unmarked = Registry::restore(persisted, Vec::new(), Vec::new());
        assert_eq!(unmarked.begin_refunds(w.root.expires_at).len(), 1);
    }

    #[test]
    fn expired_lineage_member_means_refunded() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (pay, change) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();
        w.registry.update(parent.clone());
        w.registry.insert_derived(pay);
        w.registry.insert_derived(change);

        let claims = w.registry.begin_refunds(w.root.expires_at);
        let mut persisted = w.registry.commit_refund(&claims[0]);
        assert_eq!(persisted.len(), 2, "both children expire, the divided root can't");
        persisted.push(parent);

        let mut restored = Registry::restore(persisted, Vec::new(), Vec::new());
        assert!(restored.begin_refunds(w.root.expires_at).is_empty());
        assert_eq!(restored.stats().refunded_value, 100);
        assert_eq!(restored.stats().outstanding_value, 0);
    }

    #[test]
    fn held_token_blocks_redemption_and_sweep() {
        let mut w = world();
        let root = w.root.clone();
        w.registry.set_held(&root.id, true);
        assert!(w.registry.is_consumed(&root.id));
        assert!(w.registry.begin_refunds(root.expires_at).is_empty());
        assert_eq!(
            redeem(&mut w, &[root.clone()]).unwrap_err().reason,
            RejectReason::AlreadyRedeemed
        );

        w.registry.set_held(&root.id, false);
        assert!(redeem(&mut w, &[root]).is_ok());
    }

    #[test]
    fn first_seen_token_is_tracked_as_active() {
        let mut w = world();
        let mut parent = w.root.clone();
        let (mut pay, _) = divide(&mut parent, 30, &w.issuer, w.now).unwrap();
        pay.status = TokenStatus::Expired;

        let t = redeem(&mut w, &[pay.clone()]).unwrap();
        let updated = w.registry.commit_redemption(&t);
        assert_eq!(updated[0].status, TokenStatus::Redeemed);
    }
}
