//! Error types for the wallet.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::ports::TransportError;
use crate::storage::StoreError;
use crate::token::{TokenError, TokenId};

/// Why an incoming token was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveRejection {
    BadSignature,
    NotActive,
    Expired,
    /// The provenance chain does not end at this wallet.
    NotOwned,
    /// The last hop was not signed by the peer that delivered it.
    WrongSender,
    AlreadyHeld,
    /// A token this wallet already gave away, presented without the record
    /// that gave it away.
    Replayed,
    Quarantined,
}

impl ReceiveRejection {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReceiveRejection::BadSignature | ReceiveRejection::WrongSender => {
                ErrorClass::Signature
            }
            ReceiveRejection::Expired => ErrorClass::TokenExpired,
            ReceiveRejection::AlreadyHeld | ReceiveRejection::Replayed => {
                ErrorClass::DoubleSpendDetected
            }
            ReceiveRejection::NotActive
            | ReceiveRejection::NotOwned
            | ReceiveRejection::Quarantined => ErrorClass::Validation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiveRejection::BadSignature => "bad_signature",
            ReceiveRejection::NotActive => "not_active",
            ReceiveRejection::Expired => "expired",
            ReceiveRejection::NotOwned => "not_owned",
            ReceiveRejection::WrongSender => "wrong_sender",
            ReceiveRejection::AlreadyHeld => "already_held",
            ReceiveRejection::Replayed => "replayed",
            ReceiveRejection::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for ReceiveRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient offline balance: need {needed}, have {available}")]
    InsufficientOfflineBalance { needed: u64, available: u64 },

    /// Enough value is held, but only in tokens that can't be divided.
    #[error("cannot make exact change for {amount}")]
    CannotMakeChange { amount: u64 },

    #[error("token {0} is already reserved")]
    AlreadyReserved(TokenId),

    #[error("reservation {0} has lapsed")]
    LeaseExpired(Uuid),

    #[error("no pending payment {0}")]
    UnknownPayment(Uuid),

    #[error("unknown token {0}")]
    UnknownToken(TokenId),

    #[error("no delegated divider installed")]
    NoDivider,

    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error("token {id} rejected: {reason}")]
    InvalidToken {
        id: TokenId,
        reason: ReceiveRejection,
    },

    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    /// The receiver answered and said no.
    #[error("payment {transfer_id} refused by receiver: {reason}")]
    Refused { transfer_id: Uuid, reason: String },

    /// No acknowledgement arrived in time; the payment was cancelled.
    #[error("no acknowledgement for payment {0}")]
    AckTimeout(Uuid),

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl WalletError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WalletError::InsufficientOfflineBalance { .. }
            | WalletError::CannotMakeChange { .. } => ErrorClass::InsufficientOfflineBalance,
            WalletError::InvalidDelegation(_) => ErrorClass::Signature,
            WalletError::InvalidToken { reason, .. } => reason.class(),
            WalletError::AckTimeout(_) => ErrorClass::TransportFailure,
            WalletError::Token(e) => e.class(),
            WalletError::Store(e) => e.class(),
            WalletError::Transport(e) => e.class(),
            WalletError::InvalidAmount(_)
            | WalletError::AlreadyReserved(_)
            | WalletError::LeaseExpired(_)
            | WalletError::UnknownPayment(_)
            | WalletError::UnknownToken(_)
            | WalletError::NoDivider
            | WalletError::PaymentRejected(_)
            | WalletError::Refused { .. }
            | WalletError::Codec(_) => ErrorClass::Validation,
        }
    }
}
