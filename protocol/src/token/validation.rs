//! # Token Validation
//!
//! Pure, side-effect-free checks over a token. Each check is reported on its
//! own in a [`ValidationOutcome`] so a caller (or an API client) can tell a
//! forgery apart from an expired token apart from a double spend.
//!
//! The clock is always a parameter. Nothing in here reads the system time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::PublicKey;

use super::model::Token;
use super::transfer::TransferRecord;

/// Four independent verdicts about a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub signature_valid: bool,
    pub not_expired: bool,
    /// Supplied by the caller from its spent ledger.
    pub not_spent: bool,
    pub ownership_valid: bool,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.signature_valid && self.not_expired && self.not_spent && self.ownership_valid
    }

    /// An outcome with every flag false, for tokens the caller couldn't even
    /// parse or locate.
    pub fn rejected() -> Self {
        Self {
            signature_valid: false,
            not_expired: false,
            not_spent: false,
            ownership_valid: false,
        }
    }
}

/// Check the token's signature.
///
/// Root tokens must be signed by the issuer. Division outputs may instead be
/// signed by a delegate, but only when the attached certificate verifies under
/// the issuer key and covers the token (right holder, has a parent, does not
/// outlive the certificate).
pub fn verify_signature(token: &Token, issuer_pk: &PublicKey) -> bool {
    let payload = token.canonical_bytes();
    match &token.delegation {
        None => issuer_pk.verify(&payload, &token.issuer_signature),
        Some(cert) => {
            cert.verify(issuer_pk)
                && cert.covers(token)
                && cert.delegate.verify(&payload, &token.issuer_signature)
        }
    }
}

/// Walk the provenance records for `token` and return who holds it now.
///
/// Starting from `token.owner`, every record that lists the token must be sent
/// by the current holder and carry a valid sender signature; the receiver then
/// becomes the holder. Records that don't mention the token are ignored.
/// `None` means the chain is broken.
pub fn resolve_owner(token: &Token, provenance: &[TransferRecord]) -> Option<PublicKey> {
    let mut current = token.owner;
    for record in provenance.iter().filter(|r| r.lists(&token.id)) {
        if record.sender != current || record.verify().is_err() {
            return None;
        }
        current = record.receiver;
    }
    Some(current)
}

/// Order unsorted records for one token into a hop chain starting at its
/// owner. Records that don't connect are left out.
pub fn order_provenance(token: &Token, mut records: Vec<TransferRecord>) -> Vec<TransferRecord> {
    let mut chain = Vec::with_capacity(records.len());
    let mut current = token.owner;
    while let Some(pos) = records
        .iter()
        .position(|r| r.sender == current && r.lists(&token.id))
    {
        let next = records.swap_remove(pos);
        current = next.receiver;
        chain.push(next);
    }
    chain
}

/// Signature and expiry only. Spent and ownership flags are reported true;
/// use [`verify_token_for`] when those matter.
pub fn verify_token(token: &Token, issuer_pk: &PublicKey, now: DateTime<Utc>) -> ValidationOutcome {
    ValidationOutcome {
        signature_valid: verify_signature(token, issuer_pk),
        not_expired: !token.is_expired(now),
        not_spent: true,
        ownership_valid: true,
    }
}

/// Full check: signature, expiry, the caller's spent-ledger verdict, and that
/// the provenance chain ends at `holder`.
pub fn verify_token_for(
    token: &Token,
    issuer_pk: &PublicKey,
    holder: &PublicKey,
    provenance: &[TransferRecord],
    already_spent: bool,
    now: DateTime<Utc>,
) -> ValidationOutcome {
    let mut outcome = verify_token(token, issuer_pk, now);
    outcome.not_spent = !already_spent;
    outcome.ownership_valid = resolve_owner(token, provenance).as_ref() == Some(holder);
    outcome
}
