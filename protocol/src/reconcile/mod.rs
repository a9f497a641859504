//! # Reconciliation
//!
//! What a wallet does when it gets back online:
//!
//! 1. expire tokens whose validity has passed (their value comes back
//!    through the issuer's refund sweep, not through the wallet);
//! 2. push pending outgoing transfer records to the issuer;
//! 3. redeem tokens received from peers.
//!
//! Transient gateway failures are retried with [`RetryPolicy`]. A sync that
//! still fails leaves the records marked `Failed` but queued for the next
//! run. A redemption the issuer refuses quarantines the offending token and
//! retries with the rest.

pub mod retry;

pub use retry::{Exhausted, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::issuer::{
    Issuer, IssuerError, RecordSyncResult, RedemptionReceipt, RedemptionRequest, Rejection,
};
use crate::token::{SyncStatus, TokenId, TransferRecord};
use crate::wallet::{WalletCore, WalletError};

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The issuer couldn't be reached or its ledger was down. Worth retrying.
    #[error("issuer unavailable: {0}")]
    Unavailable(String),

    #[error("redemption rejected: {0}")]
    Rejected(Rejection),

    #[error("{class}: {message}")]
    Failed { class: ErrorClass, message: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

impl From<IssuerError> for GatewayError {
    fn from(e: IssuerError) -> Self {
        if let Some(rejection) = e.rejection() {
            return GatewayError::Rejected(rejection.clone());
        }
        let class = e.class();
        if class.is_transient() {
            GatewayError::Unavailable(e.to_string())
        } else {
            GatewayError::Failed {
                class,
                message: e.to_string(),
            }
        }
    }
}

/// The issuer as seen from a wallet: sync records, redeem tokens.
#[async_trait]
pub trait IssuerGateway: Send + Sync {
    async fn submit_transfers(
        &self,
        records: &[TransferRecord],
    ) -> Result<Vec<RecordSyncResult>, GatewayError>;

    async fn redeem(
        &self,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedemptionReceipt, GatewayError>;
}

#[async_trait]
impl IssuerGateway for Issuer {
    async fn submit_transfers(
        &self,
        records: &[TransferRecord],
    ) -> Result<Vec<RecordSyncResult>, GatewayError> {
        Ok(self.sync_transfer_records(records))
    }

    async fn redeem(
        &self,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedemptionReceipt, GatewayError> {
        Ok(self.redeem_tokens(request, now).await?)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub expired: Vec<TokenId>,
    pub synced: usize,
    /// Records the issuer refused, with its reason. Not retried.
    pub sync_rejected: Vec<(Uuid, String)>,
    /// Records left for the next run after retries ran out.
    pub sync_deferred: usize,
    pub redeemed_total: u64,
    pub redeemed_tokens: Vec<TokenId>,
    pub quarantined: Vec<TokenId>,
    pub redemption_error: Option<String>,
}

pub struct ReconciliationCoordinator {
    wallet: Arc<WalletCore>,
    gateway: Arc<dyn IssuerGateway>,
    retry: RetryPolicy,
}

impl ReconciliationCoordinator {
    pub fn new(wallet: Arc<WalletCore>, gateway: Arc<dyn IssuerGateway>, retry: RetryPolicy) -> Self {
        Self {
            wallet,
            gateway,
            retry,
        }
    }

    /// One full reconciliation pass. Gateway trouble is reported, not
    /// returned; only local storage failures surface as `Err`.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, WalletError> {
        let mut report = ReconciliationReport {
            expired: self.wallet.expire_stale(now)?,
            ..Default::default()
        };
        self.sync_records(&mut report).await?;
        self.redeem_received(now, &mut report).await?;

        info!(
            expired = report.expired.len(),
            synced = report.synced,
            deferred = report.sync_deferred,
            redeemed = report.redeemed_total,
            quarantined = report.quarantined.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn sync_records(&self, report: &mut ReconciliationReport) -> Result<(), WalletError> {
        let records = self.wallet.pending_records();
        if records.is_empty() {
            return Ok(());
        }
        let gateway = self.gateway.as_ref();
        let batch = records.as_slice();
        let outcome = self
            .retry
            .run("sync_transfers", GatewayError::is_transient, move || {
                gateway.submit_transfers(batch)
            })
            .await;

        match outcome {
            Ok(results) => {
                let synced: Vec<Uuid> = results
                    .iter()
                    .filter(|r| r.status == SyncStatus::Synced)
                    .map(|r| r.transfer_id)
                    .collect();
                self.wallet.mark_synced(&synced)?;
                report.synced += synced.len();

                for r in results {
                    if let SyncStatus::Failed { reason, .. } = r.status {
                        self.wallet.mark_failed(&[r.transfer_id], &reason, false)?;
                        report.sync_rejected.push((r.transfer_id, reason));
                    }
                }
            }
            Err(exhausted) => {
                let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
                let reason = exhausted.last_error.to_string();
                self.wallet.mark_failed(&ids, &reason, true)?;
                report.sync_deferred += ids.len();
                warn!(
                    records = ids.len(),
                    attempts = exhausted.attempts,
                    error = %reason,
                    "transfer sync deferred"
                );
            }
        }
        Ok(())
    }

    async fn redeem_received(
        &self,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<(), WalletError> {
        while let Some(batch) = self.wallet.prepare_redemption(now) {
            let gateway = self.gateway.as_ref();
            let request = &batch.request;
            let outcome = self
                .retry
                .run("redeem", GatewayError::is_transient, move || {
                    gateway.redeem(request, now)
                })
                .await;
            self.wallet.release(&batch.lease_id);

            match outcome {
                Ok(receipt) => {
                    self.wallet.mark_redeemed(&receipt.token_ids)?;
                    report.redeemed_total += receipt.redeemed_total;
                    report.redeemed_tokens.extend(receipt.token_ids);
                    return Ok(());
                }
                Err(Exhausted {
                    last_error: GatewayError::Rejected(rejection),
                    ..
                }) => {
                    // Without a culprit there's nothing to set aside; retrying
                    // the same batch would fail the same way.
                    let Some(culprit) = rejection.first_invalid_token_id else {
                        report.redemption_error = Some(rejection.to_string());
                        return Ok(());
                    };
                    if !self.wallet.quarantine(&culprit, &rejection.reason.to_string()) {
                        report.redemption_error = Some(rejection.to_string());
                        return Ok(());
                    }
                    report.quarantined.push(culprit);
                }
                Err(exhausted) => {
                    report.redemption_error = Some(exhausted.last_error.to_string());
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
