//! # Issuer (Offline Token Manager)
//!
//! The one party everybody trusts to tell the truth about money. It holds the
//! issuer keypair, mints tokens against a paid-in amount, validates and
//! redeems them back into ledger value, certifies delegate keys for offline
//! division, keeps the audit log of synced transfers, and refunds whatever
//! expires unredeemed.
//!
//! ## Concurrency
//!
//! All bookkeeping lives in a [`Registry`] behind one `parking_lot::Mutex`.
//! The lock is never held across an `.await`: ledger calls happen between a
//! `begin_*` and a `commit_*`/`abort_*` step, and the registry marks the
//! affected tokens pending in between so nothing else can grab them.
//!
//! ## Persistence
//!
//! With a [`TokenStore`] attached, every status change is written through.
//! [`Issuer::restore`] rebuilds the registry from the store on startup.

pub mod denomination;
pub mod error;
pub mod registry;

pub use denomination::{issuance_cost, split_into_denominations};
pub use error::IssuerError;
pub use registry::{
    RefundClaim, RefundState, Registry, RegistryStats, RejectReason, Rejection,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IssuerConfig;
use crate::crypto::keys::{Keypair, PublicKey, Signature};
use crate::ports::{Confirmation, LedgerClient, TxHandle};
use crate::storage::TokenStore;
use crate::token::{
    self, verify_token, verify_token_for, DelegationCertificate, SyncStatus, Token, TokenId,
    TokenStatus, TransferRecord, ValidationOutcome,
};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Tokens a holder presents for conversion back into ledger value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    /// Who is asking, and who gets credited.
    pub presenter: PublicKey,
    pub tokens: Vec<Token>,
    /// Transfer records proving how each token reached the presenter.
    #[serde(default)]
    pub provenance: Vec<TransferRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionReceipt {
    pub presenter: PublicKey,
    pub redeemed_total: u64,
    pub token_ids: Vec<TokenId>,
    pub ledger_tx: Uuid,
}

/// Result of an online division request.
#[derive(Debug, Clone, PartialEq)]
pub enum Split {
    /// `payment_amount` equalled the token's amount: nothing was divided.
    Whole(Token),
    Divided {
        original: Token,
        payment: Token,
        change: Token,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSyncResult {
    pub transfer_id: Uuid,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundBatch {
    pub refunds: Vec<RefundClaim>,
    /// Origins whose refund didn't settle. They are retried by the next sweep.
    pub failed: Vec<(TokenId, String)>,
    pub total_refunded: u64,
}

// ---------------------------------------------------------------------------
// Issuer
// ---------------------------------------------------------------------------

pub struct Issuer {
    keypair: Keypair,
    config: IssuerConfig,
    registry: Mutex<Registry>,
    ledger: Arc<dyn LedgerClient>,
    store: Option<Arc<dyn TokenStore>>,
}

impl Issuer {
    /// A fresh issuer with an empty registry and no persistence.
    pub fn new(keypair: Keypair, config: IssuerConfig, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            keypair,
            config,
            registry: Mutex::new(Registry::new()),
            ledger,
            store: None,
        }
    }

    /// Rebuild an issuer from whatever `store` holds and keep writing
    /// through to it.
    pub fn restore(
        keypair: Keypair,
        config: IssuerConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, IssuerError> {
        let tokens = store.list_tokens()?;
        let transfers = store.list_transfers()?;
        let refunds = store.list_refunds()?;
        let registry = Registry::restore(tokens, transfers, refunds);
        let stats = registry.stats();
        info!(
            tokens = stats.tokens_tracked,
            origins = stats.origins,
            outstanding = stats.outstanding_value,
            "issuer registry restored"
        );
        Ok(Self {
            keypair,
            config,
            registry: Mutex::new(registry),
            ledger,
            store: Some(store),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    pub fn get_token(&self, id: &TokenId) -> Option<Token> {
        self.registry.lock().get(id).cloned()
    }

    // -- Issuance -----------------------------------------------------------

    /// Mint tokens worth `total` for `owner`, who has paid `paid` into the
    /// ledger out of band.
    pub fn issue_tokens(
        &self,
        owner: PublicKey,
        total: u64,
        paid: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Token>, IssuerError> {
        if total == 0 {
            return Err(IssuerError::InvalidAmount("cannot issue zero".into()));
        }
        let required = issuance_cost(total, self.config.issuance_fee_bps)
            .ok_or_else(|| IssuerError::InvalidAmount("amount overflows issuance cost".into()))?;
        if paid < required {
            return Err(IssuerError::InsufficientFunds { required, paid });
        }

        let amounts = split_into_denominations(total, &self.config.denominations);
        if amounts.len() > self.config.max_tokens_per_issue {
            return Err(IssuerError::TooManyTokens {
                count: amounts.len(),
                max: self.config.max_tokens_per_issue,
            });
        }

        let expires_at = now + self.config.token_validity();
        let tokens = amounts
            .into_iter()
            .map(|amount| Token::mint(owner, amount, expires_at, &self.keypair))
            .collect::<Result<Vec<_>, _>>()?;

        // Persist before registering, so a storage failure mints nothing.
        self.persist(&tokens)?;
        {
            let mut registry = self.registry.lock();
            for token in &tokens {
                registry.insert_minted(token.clone());
            }
        }

        info!(
            owner = %owner.short(),
            total,
            count = tokens.len(),
            expires_at = %expires_at,
            "tokens issued"
        );
        Ok(tokens)
    }

    // -- Validation ---------------------------------------------------------

    /// Full four-flag check of a presented token. With `holder` set, the
    /// provenance must lead to it; without, it only has to be unbroken.
    pub fn validate_token(
        &self,
        token: &Token,
        holder: Option<&PublicKey>,
        provenance: &[TransferRecord],
        now: DateTime<Utc>,
    ) -> ValidationOutcome {
        let consumed = self.registry.lock().is_consumed(&token.id);
        let issuer_pk = self.public_key();
        let outcome = match holder {
            Some(h) => verify_token_for(token, &issuer_pk, h, provenance, consumed, now),
            None => {
                let mut o = verify_token(token, &issuer_pk, now);
                o.not_spent = !consumed;
                o.ownership_valid = token::resolve_owner(token, provenance).is_some();
                o
            }
        };
        self.log_outcome(&token.id, &outcome);
        outcome
    }

    /// Validate by id with a caller-supplied signature and amount, against the
    /// issuer's own copy of the token. Ownership is checked against the synced
    /// transfer log. Unknown ids fail every flag.
    pub fn validate_by_id(
        &self,
        id: &TokenId,
        signature: &Signature,
        amount: u64,
        holder: Option<&PublicKey>,
        now: DateTime<Utc>,
    ) -> ValidationOutcome {
        let registry = self.registry.lock();
        let Some(known) = registry.get(id) else {
            debug!(token = %id.short(), "validation of unknown token");
            return ValidationOutcome::rejected();
        };

        let mut candidate = known.clone();
        candidate.issuer_signature = signature.clone();
        candidate.amount = amount;

        let mut outcome = verify_token(&candidate, &self.public_key(), now);
        outcome.not_spent = !registry.is_consumed(id);
        outcome.ownership_valid = match holder {
            Some(h) => registry.synced_holder(known).as_ref() == Some(h),
            None => true,
        };
        drop(registry);

        self.log_outcome(id, &outcome);
        outcome
    }

    fn log_outcome(&self, id: &TokenId, outcome: &ValidationOutcome) {
        if !outcome.signature_valid {
            warn!(target: "otm::security", token = %id.short(), "token signature rejected");
        } else {
            debug!(token = %id.short(), valid = outcome.is_valid(), "token validated");
        }
    }

    // -- Division & delegation ----------------------------------------------

    /// Online, issuer-signed division of a known `Active` token. Asking for
    /// the whole amount returns the token unchanged.
    pub fn divide(
        &self,
        id: &TokenId,
        payment_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Split, IssuerError> {
        // Sign and write outside the lock; the hold keeps redemptions, other
        // divisions and the expiry sweep off the token meanwhile.
        let mut token = {
            let mut registry = self.registry.lock();
            let token = registry
                .get(id)
                .cloned()
                .ok_or(IssuerError::UnknownToken(*id))?;
            if token.status != TokenStatus::Active || registry.is_consumed(id) {
                return Err(IssuerError::NotSpendable {
                    id: *id,
                    status: token.status,
                });
            }
            if payment_amount == token.amount {
                if token.is_expired(now) {
                    return Err(IssuerError::Token(token::TokenError::Expired { id: *id }));
                }
                return Ok(Split::Whole(token));
            }
            registry.set_held(id, true);
            token
        };

        let outcome = token::divide(&mut token, payment_amount, &self.keypair, now)
            .map_err(IssuerError::from)
            .and_then(|(payment, change)| {
                self.persist(&[token.clone(), payment.clone(), change.clone()])?;
                Ok((payment, change))
            });

        let mut registry = self.registry.lock();
        registry.set_held(id, false);
        let (payment, change) = match outcome {
            Ok(split) => split,
            Err(e) => {
                // A failed write may have landed partially; put the parent back.
                let parent = registry.get(id).cloned();
                drop(registry);
                if let Some(parent) = parent {
                    self.persist_quietly(&[parent]);
                }
                return Err(e);
            }
        };
        let current = registry.get(id).map(|t| t.status);
        if current != Some(TokenStatus::Active) {
            // A transfer sync moved it on while we were signing.
            let status = current.unwrap_or(TokenStatus::Active);
            let parent = registry.get(id).cloned();
            drop(registry);
            if let Some(parent) = parent {
                self.persist_quietly(&[parent]);
            }
            return Err(IssuerError::NotSpendable { id: *id, status });
        }
        registry.update(token.clone());
        registry.insert_derived(payment.clone());
        registry.insert_derived(change.clone());
        drop(registry);

        info!(
            parent = %id.short(),
            payment = payment.amount,
            change = change.amount,
            "token divided online"
        );
        Ok(Split::Divided {
            original: token,
            payment,
            change,
        })
    }

    /// Certify `delegate` to sign offline divisions of `holder`'s tokens
    /// expiring no later than `valid_until`.
    pub fn delegate_division(
        &self,
        holder: PublicKey,
        delegate: PublicKey,
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DelegationCertificate, IssuerError> {
        if valid_until <= now {
            return Err(IssuerError::InvalidDelegation(
                "certificate would already be expired".into(),
            ));
        }
        if delegate == self.public_key() {
            return Err(IssuerError::InvalidDelegation(
                "the issuer key cannot be a delegate".into(),
            ));
        }
        let cert = DelegationCertificate::issue(&self.keypair, holder, delegate, valid_until);
        info!(
            holder = %holder.short(),
            delegate = %delegate.short(),
            valid_until = %valid_until,
            "division delegated"
        );
        Ok(cert)
    }

    // -- Transfer sync ------------------------------------------------------

    /// Take in offline transfer records. Each one is judged on its own.
    pub fn sync_transfer_records(&self, records: &[TransferRecord]) -> Vec<RecordSyncResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let verdict = self.registry.lock().record_transfer(record);
            let status = match verdict {
                Ok(spent) => {
                    let mut synced = record.clone();
                    synced.sync_status = SyncStatus::Synced;
                    self.persist_quietly(&spent);
                    if let Some(store) = &self.store {
                        if let Err(e) = store.put_transfer(&synced) {
                            warn!(error = %e, transfer = %record.id, "failed to persist synced transfer");
                        }
                    }
                    debug!(transfer = %record.id, tokens = record.token_ids.len(), "transfer synced");
                    SyncStatus::Synced
                }
                Err(failure) => {
                    if failure.double_spend {
                        warn!(
                            target: "otm::security",
                            transfer = %record.id,
                            sender = %record.sender.short(),
                            reason = %failure.reason,
                            "double spend detected in transfer sync"
                        );
                    } else {
                        warn!(transfer = %record.id, reason = %failure.reason, "transfer sync failed");
                    }
                    SyncStatus::Failed {
                        reason: failure.reason,
                        retryable: false,
                    }
                }
            };
            results.push(RecordSyncResult {
                transfer_id: record.id,
                status,
            });
        }
        results
    }

    // -- Redemption ---------------------------------------------------------

    /// Redeem a batch atomically: every token passes and the presenter is
    /// credited the sum, or nothing changes at all.
    pub async fn redeem_tokens(
        &self,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedemptionReceipt, IssuerError> {
        let begun = self.registry.lock().begin_redemption(
            &request.presenter,
            &request.tokens,
            &request.provenance,
            &self.public_key(),
            self.config.max_redemption_batch,
            now,
        );
        let ticket = match begun {
            Ok(ticket) => ticket,
            Err(rejection) => {
                if rejection.reason.class().is_security_event() {
                    warn!(
                        target: "otm::security",
                        presenter = %request.presenter.short(),
                        token = ?rejection.first_invalid_token_id,
                        reason = %rejection.reason,
                        "redemption refused"
                    );
                } else {
                    info!(presenter = %request.presenter.short(), reason = %rejection, "redemption refused");
                }
                return Err(IssuerError::RedemptionRejected(rejection));
            }
        };

        let handle = match self.settle_credit(&ticket.presenter, ticket.total).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.lock().abort_redemption(&ticket);
                warn!(error = %e, total = ticket.total, "redemption credit failed, rolled back");
                return Err(e);
            }
        };

        let redeemed = self.registry.lock().commit_redemption(&ticket);
        self.persist_quietly(&redeemed);

        info!(
            presenter = %ticket.presenter.short(),
            total = ticket.total,
            count = redeemed.len(),
            "tokens redeemed"
        );
        Ok(RedemptionReceipt {
            presenter: ticket.presenter,
            redeemed_total: ticket.total,
            token_ids: ticket.token_ids(),
            ledger_tx: handle.0,
        })
    }

    // -- Expiry -------------------------------------------------------------

    /// Refund the unredeemed remainder of every expired root to its original
    /// purchaser. Safe to call repeatedly: a root is refunded at most once.
    pub async fn handle_expired_tokens(&self, now: DateTime<Utc>) -> RefundBatch {
        let claims = self.registry.lock().begin_refunds(now);
        let mut batch = RefundBatch::default();

        for claim in claims {
            if claim.amount > 0 {
                if let Err(e) = self.settle_credit(&claim.purchaser, claim.amount).await {
                    self.registry.lock().abort_refund(&claim);
                    warn!(origin = %claim.origin_id.short(), error = %e, "refund failed, will retry");
                    batch.failed.push((claim.origin_id, e.to_string()));
                    continue;
                }
            }
            let expired = self.registry.lock().commit_refund(&claim);
            self.persist_refund(&claim);
            self.persist_quietly(&expired);
            batch.total_refunded += claim.amount;
            batch.refunds.push(claim);
        }

        if !batch.refunds.is_empty() || !batch.failed.is_empty() {
            info!(
                refunded = batch.refunds.len(),
                failed = batch.failed.len(),
                total = batch.total_refunded,
                "expiry sweep finished"
            );
        }
        batch
    }

    // -- Internals ----------------------------------------------------------

    async fn settle_credit(&self, to: &PublicKey, amount: u64) -> Result<TxHandle, IssuerError> {
        let handle = self.ledger.credit(to, amount).await?;
        match self.ledger.wait_for_confirmation(&handle).await? {
            Confirmation::Confirmed => Ok(handle),
            Confirmation::Failed { reason } => Err(IssuerError::LedgerRefused(reason)),
        }
    }

    fn persist(&self, tokens: &[Token]) -> Result<(), IssuerError> {
        if let Some(store) = &self.store {
            for token in tokens {
                store.put_token(token)?;
            }
        }
        Ok(())
    }

    fn persist_refund(&self, claim: &RefundClaim) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_refund(&claim.origin_id, claim.amount) {
                warn!(origin = %claim.origin_id.short(), error = %e, "failed to persist refund mark");
            }
        }
    }

    /// Write-through after the ledger already moved value: a storage hiccup
    /// here must not undo the in-memory state.
    fn persist_quietly(&self, tokens: &[Token]) {
        if let Err(e) = self.persist(tokens) {
            warn!(error = %e, count = tokens.len(), "failed to persist token updates");
        }
    }
}

impl std::fmt::Debug for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer")
            .field("public_key", &self.public_key())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
