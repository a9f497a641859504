//! # Token Model
//!
//! The value object ([`Token`]), the functions that derive new tokens from old
//! ones ([`divide`]), the checks that decide whether a token is any good
//! ([`verify_token`], [`verify_token_for`]), and the signed records that move
//! tokens between people ([`TransferRecord`]).
//!
//! Everything here is deterministic given `now`. No I/O, no clocks, no locks.

pub mod delegation;
pub mod division;
pub mod model;
pub mod transfer;
pub mod validation;

pub use delegation::DelegationCertificate;
pub use division::{divide, DelegatedDivider, DivisionSigner};
pub use model::{Token, TokenId, TokenStatus};
pub use transfer::{SyncStatus, TransferRecord};
pub use validation::{
    order_provenance, resolve_owner, verify_signature, verify_token, verify_token_for, ValidationOutcome,
};

use thiserror::Error;

use crate::error::ErrorClass;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("token {id} is not spendable (status {status})")]
    NotSpendable { id: TokenId, status: TokenStatus },

    #[error("token {id} has expired")]
    Expired { id: TokenId },

    #[error("illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    },

    #[error("delegation refused: {0}")]
    DelegationMismatch(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("token {0} listed twice")]
    DuplicateTokenId(TokenId),

    #[error("a transfer must carry at least one token")]
    EmptyTransfer,

    #[error("amount overflow")]
    AmountOverflow,
}

impl TokenError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TokenError::Expired { .. } => ErrorClass::TokenExpired,
            TokenError::DelegationMismatch(_) | TokenError::InvalidSignature => {
                ErrorClass::Signature
            }
            TokenError::InvalidAmount(_)
            | TokenError::NotSpendable { .. }
            | TokenError::InvalidTransition { .. }
            | TokenError::DuplicateTokenId(_)
            | TokenError::EmptyTransfer
            | TokenError::AmountOverflow => ErrorClass::Validation,
        }
    }
}
