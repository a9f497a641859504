//! # Token Division
//!
//! "Making change": one token of amount `A` becomes a payment token of `P`
//! and a change token of `A - P`. Both outputs keep the parent's owner, origin
//! and expiry, point back at the parent, and carry fresh signatures. The
//! parent becomes `Divided` and is never spendable again.
//!
//! Who signs the outputs is pluggable through [`DivisionSigner`]:
//!
//! - the issuer's own [`Keypair`] (online division, issuer of record);
//! - a [`DelegatedDivider`] (offline, an on-device key plus the issuer's
//!   certificate for it).
//!
//! Division either fully succeeds or leaves the parent untouched. All checks
//! happen before anything is signed or mutated.

use chrono::{DateTime, Utc};

use crate::crypto::keys::{Keypair, PublicKey, Signature};

use super::delegation::DelegationCertificate;
use super::model::{Token, TokenId, TokenStatus};
use super::TokenError;

/// Anything allowed to sign division outputs.
pub trait DivisionSigner: Send + Sync {
    /// The key whose signature will appear on the outputs.
    fn signer_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> Signature;

    /// The certificate to attach to outputs, if the signer is a delegate.
    fn delegation(&self) -> Option<&DelegationCertificate> {
        None
    }
}

impl DivisionSigner for Keypair {
    fn signer_key(&self) -> PublicKey {
        self.public_key()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Keypair::sign(self, message)
    }
}

/// An on-device delegate key together with the certificate that authorizes it.
#[derive(Debug, Clone)]
pub struct DelegatedDivider {
    keypair: Keypair,
    certificate: DelegationCertificate,
}

impl DelegatedDivider {
    /// Pair a delegate key with its certificate. Fails when the certificate
    /// names a different delegate key.
    pub fn new(keypair: Keypair, certificate: DelegationCertificate) -> Result<Self, TokenError> {
        if certificate.delegate != keypair.public_key() {
            return Err(TokenError::DelegationMismatch(
                "certificate was issued for a different delegate key".into(),
            ));
        }
        Ok(Self {
            keypair,
            certificate,
        })
    }

    pub fn certificate(&self) -> &DelegationCertificate {
        &self.certificate
    }
}

impl DivisionSigner for DelegatedDivider {
    fn signer_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }

    fn delegation(&self) -> Option<&DelegationCertificate> {
        Some(&self.certificate)
    }
}

/// Split `token` into `(payment, change)` where `payment.amount ==
/// payment_amount`.
///
/// Requires `token` to be `Active`, unexpired at `now`, and
/// `0 < payment_amount < token.amount`. Sending a whole token is a different
/// path and never goes through here.
pub fn divide(
    token: &mut Token,
    payment_amount: u64,
    signer: &dyn DivisionSigner,
    now: DateTime<Utc>,
) -> Result<(Token, Token), TokenError> {
    if token.status != TokenStatus::Active {
        return Err(TokenError::NotSpendable {
            id: token.id,
            status: token.status,
        });
    }
    if token.is_expired(now) {
        return Err(TokenError::Expired { id: token.id });
    }
    if payment_amount == 0 || payment_amount >= token.amount {
        return Err(TokenError::InvalidAmount(format!(
            "division requires 0 < {} < {}",
            payment_amount, token.amount
        )));
    }

    if let Some(cert) = signer.delegation() {
        if cert.holder != token.owner {
            return Err(TokenError::DelegationMismatch(
                "delegate is not certified for this token's owner".into(),
            ));
        }
        if token.expires_at > cert.valid_until {
            return Err(TokenError::DelegationMismatch(
                "token outlives the delegation certificate".into(),
            ));
        }
    }

    let change_amount = token.amount - payment_amount;
    let payment = derive_output(token, 0, payment_amount, signer);
    let change = derive_output(token, 1, change_amount, signer);

    token.transition(TokenStatus::Divided)?;

    tracing::debug!(
        parent = %token.id.short(),
        payment = payment_amount,
        change = change_amount,
        delegated = signer.delegation().is_some(),
        "token divided"
    );

    Ok((payment, change))
}

fn derive_output(parent: &Token, branch: u8, amount: u64, signer: &dyn DivisionSigner) -> Token {
    let mut child = Token {
        id: TokenId::derive_child(&parent.id, branch, amount),
        amount,
        owner: parent.owner,
        expires_at: parent.expires_at,
        status: TokenStatus::Active,
        parent_id: Some(parent.id),
        origin_id: parent.origin_id,
        issuer_signature: Signature::from_bytes([0u8; 64]),
        delegation: signer.delegation().cloned(),
    };
    child.issuer_signature = signer.sign(&child.canonical_bytes());
    child
}
