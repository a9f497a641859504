//! # Transfer Records
//!
//! A [`TransferRecord`] is the sender's signed statement "I hand these tokens
//! to that receiver". It is created at spend time on the sender's device,
//! travels with the tokens to the receiver, and is later synced to the issuer
//! as part of the audit trail. Records are never deleted; only their
//! `sync_status` changes.
//!
//! The token's own issuer signature is untouched by a transfer. Ownership is
//! proven by the chain of these records (see
//! [`crate::token::validation::resolve_owner`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::TRANSFER_DOMAIN_TAG;
use crate::crypto::keys::{Keypair, PublicKey, Signature};

use super::model::{Token, TokenId};
use super::TokenError;

/// Where a record stands with the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Synced,
    /// `retryable` failures go out again on the next sync; the rest were
    /// refused by the issuer and stay put.
    Failed { reason: String, retryable: bool },
}

impl SyncStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Pending)
    }

    /// Still owed to the issuer: pending, or failed for a transient reason.
    pub fn awaits_sync(&self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::Failed { retryable: true, .. }
        )
    }
}

/// A signed, offline transfer of one or more tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: Uuid,
    #[serde(rename = "senderId")]
    pub sender: PublicKey,
    #[serde(rename = "receiverId")]
    pub receiver: PublicKey,
    /// Sum of the listed tokens, minor units.
    pub amount: u64,
    /// Ordered, duplicate-free.
    pub token_ids: Vec<TokenId>,
    pub sender_signature: Signature,
    pub timestamp: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl TransferRecord {
    /// Build and sign a record moving `tokens` from `sender` to `receiver`.
    pub fn create(
        sender: &Keypair,
        receiver: PublicKey,
        tokens: &[Token],
        now: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        if tokens.is_empty() {
            return Err(TokenError::EmptyTransfer);
        }

        let mut amount: u64 = 0;
        let mut seen = HashSet::with_capacity(tokens.len());
        let mut token_ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            if !seen.insert(token.id) {
                return Err(TokenError::DuplicateTokenId(token.id));
            }
            amount = amount
                .checked_add(token.amount)
                .ok_or(TokenError::AmountOverflow)?;
            token_ids.push(token.id);
        }

        let mut record = TransferRecord {
            id: Uuid::new_v4(),
            sender: sender.public_key(),
            receiver,
            amount,
            token_ids,
            sender_signature: Signature::from_bytes([0u8; 64]),
            timestamp: now,
            sync_status: SyncStatus::Pending,
        };
        record.sender_signature = sender.sign(&record.signing_payload());
        Ok(record)
    }

    /// `"otm/transfer/v1" || id || sender || receiver || amount || count ||
    /// token_ids || timestamp`. Sync status is not covered.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(TRANSFER_DOMAIN_TAG.len() + 16 + 64 + 8 + 4 + 32 * self.token_ids.len() + 8);
        buf.extend_from_slice(TRANSFER_DOMAIN_TAG);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.receiver.as_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&(self.token_ids.len() as u32).to_be_bytes());
        for id in &self.token_ids {
            buf.extend_from_slice(id.as_bytes());
        }
        buf.extend_from_slice(&self.timestamp.timestamp_millis().to_be_bytes());
        buf
    }

    pub fn verify_signature(&self) -> bool {
        self.sender.verify(&self.signing_payload(), &self.sender_signature)
    }

    /// Structural checks plus the sender's signature. Does not look at the
    /// tokens themselves; see [`TransferRecord::matches_tokens`].
    pub fn verify(&self) -> Result<(), TokenError> {
        if self.token_ids.is_empty() {
            return Err(TokenError::EmptyTransfer);
        }
        let mut seen = HashSet::with_capacity(self.token_ids.len());
        for id in &self.token_ids {
            if !seen.insert(*id) {
                return Err(TokenError::DuplicateTokenId(*id));
            }
        }
        if !self.verify_signature() {
            return Err(TokenError::InvalidSignature);
        }
        Ok(())
    }

    /// The record lists exactly these tokens, in order, and its amount is
    /// their sum.
    pub fn matches_tokens(&self, tokens: &[Token]) -> bool {
        if tokens.len() != self.token_ids.len() {
            return false;
        }
        let ids_match = tokens
            .iter()
            .zip(self.token_ids.iter())
            .all(|(t, id)| t.id == *id);
        let sum = tokens
            .iter()
            .try_fold(0u64, |acc, t| acc.checked_add(t.amount));
        ids_match && sum == Some(self.amount)
    }

    pub fn lists(&self, id: &TokenId) -> bool {
        self.token_ids.contains(id)
    }
}
