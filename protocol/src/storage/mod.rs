//! # Storage
//!
//! Tokens and transfer records keyed by id, plus the issuer's refund marks
//! keyed by origin id. Nothing else is authoritative. Registries, reservation
//! tables and balances are all rebuilt from these collections on restart.
//!
//! [`TokenStore`] is deliberately dumb CRUD. It is synchronous because sled is,
//! and because every caller already holds a short-lived lock when it writes
//! through.

pub mod db;

pub use db::TokenDb;

use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::token::{Token, TokenId, TokenStatus, TransferRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Storage trouble is infrastructure, not a verdict on the token.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransportFailure
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence port for tokens and transfer records.
pub trait TokenStore: Send + Sync {
    /// Insert or overwrite by `token.id`.
    fn put_token(&self, token: &Token) -> StoreResult<()>;

    fn get_token(&self, id: &TokenId) -> StoreResult<Option<Token>>;

    fn list_by_status(&self, status: TokenStatus) -> StoreResult<Vec<Token>>;

    fn list_tokens(&self) -> StoreResult<Vec<Token>>;

    /// Insert or overwrite by `record.id`.
    fn put_transfer(&self, record: &TransferRecord) -> StoreResult<()>;

    fn get_transfer(&self, id: &Uuid) -> StoreResult<Option<TransferRecord>>;

    /// Records still owed to the issuer: pending or retryably failed.
    fn list_pending(&self) -> StoreResult<Vec<TransferRecord>>;

    fn list_transfers(&self) -> StoreResult<Vec<TransferRecord>>;

    /// Note that the expiry refund of `origin` paid `amount`. Written once the
    /// ledger confirmed the credit.
    fn put_refund(&self, origin: &TokenId, amount: u64) -> StoreResult<()>;

    fn list_refunds(&self) -> StoreResult<Vec<(TokenId, u64)>>;
}
