//! Error types for the issuer.

use thiserror::Error;

use super::registry::Rejection;
use crate::error::ErrorClass;
use crate::ports::LedgerError;
use crate::storage::StoreError;
use crate::token::{TokenError, TokenId, TokenStatus};

/// Everything an issuer operation can fail with.
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The purchaser didn't pay enough to cover face value plus fee.
    #[error("insufficient funds: issuing requires {required}, paid {paid}")]
    InsufficientFunds { required: u64, paid: u64 },

    #[error("issuance would mint {count} tokens (limit {max})")]
    TooManyTokens { count: usize, max: usize },

    #[error("unknown token {0}")]
    UnknownToken(TokenId),

    #[error("token {id} is not spendable (status {status})")]
    NotSpendable { id: TokenId, status: TokenStatus },

    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    /// The whole redemption batch was refused.
    #[error("redemption rejected: {0}")]
    RedemptionRejected(Rejection),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The ledger answered but refused to confirm the operation.
    #[error("ledger did not confirm: {0}")]
    LedgerRefused(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl IssuerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IssuerError::InvalidAmount(_)
            | IssuerError::TooManyTokens { .. }
            | IssuerError::UnknownToken(_)
            | IssuerError::NotSpendable { .. }
            | IssuerError::InvalidDelegation(_) => ErrorClass::Validation,
            IssuerError::InsufficientFunds { .. } => ErrorClass::InsufficientFunds,
            IssuerError::Token(e) => e.class(),
            IssuerError::RedemptionRejected(_) => ErrorClass::RedemptionRejected,
            IssuerError::Ledger(e) => e.class(),
            IssuerError::LedgerRefused(_) => ErrorClass::TransportFailure,
            IssuerError::Store(e) => e.class(),
        }
    }

    /// The rejection details, when this is a refused redemption.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            IssuerError::RedemptionRejected(r) => Some(r),
            _ => None,
        }
    }
}
