//! Error taxonomy shared by every module.
//!
//! Each module owns its own `thiserror` enum. All of them map onto a single
//! [`ErrorClass`] so callers (the reconciliation loop, the HTTP layer) can
//! decide what to do without matching on every variant in the crate: retry,
//! surface to the user, or raise a security alarm.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The coarse kind of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Malformed input: bad amount, unknown id, wrong status.
    Validation,
    /// A signature failed to verify. Security event.
    Signature,
    /// The paid-in amount does not cover issuance.
    InsufficientFunds,
    /// The wallet cannot cover a payment from spendable tokens.
    InsufficientOfflineBalance,
    TokenExpired,
    /// A token was presented or transferred twice. Security event, permanent.
    DoubleSpendDetected,
    /// Network or ledger trouble. Transient, retried with backoff.
    TransportFailure,
    /// The issuer refused a redemption batch.
    RedemptionRejected,
}

impl ErrorClass {
    /// Only transport failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::TransportFailure)
    }

    /// Classes that must be logged on the security target.
    pub fn is_security_event(&self) -> bool {
        matches!(self, ErrorClass::Signature | ErrorClass::DoubleSpendDetected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Signature => "signature",
            ErrorClass::InsufficientFunds => "insufficient_funds",
            ErrorClass::InsufficientOfflineBalance => "insufficient_offline_balance",
            ErrorClass::TokenExpired => "token_expired",
            ErrorClass::DoubleSpendDetected => "double_spend_detected",
            ErrorClass::TransportFailure => "transport_failure",
            ErrorClass::RedemptionRejected => "redemption_rejected",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracing target for security-relevant events.
pub const SECURITY_TARGET: &str = "otm::security";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_transient() {
        assert!(ErrorClass::TransportFailure.is_transient());
        assert!(!ErrorClass::DoubleSpendDetected.is_transient());
        assert!(!ErrorClass::Validation.is_transient());
    }

    #[test]
    fn security_events() {
        assert!(ErrorClass::Signature.is_security_event());
        assert!(ErrorClass::DoubleSpendDetected.is_security_event());
        assert!(!ErrorClass::TokenExpired.is_security_event());
    }

    #[test]
    fn display_uses_snake_case() {
        assert_eq!(ErrorClass::RedemptionRejected.to_string(), "redemption_rejected");
    }
}
