//! # Delegation Certificates
//!
//! Offline division needs *something* on the device to sign the two output
//! tokens, and the issuer's private key never leaves the issuer. The answer is
//! a delegate key: generated on the holder's device, certified online by the
//! issuer, and good only for dividing tokens that the named holder owns and
//! that expire before the certificate does.
//!
//! A delegate cannot mint. A delegated signature is only accepted on a token
//! that has a `parent_id`, and the issuer's per-origin budget caps what any
//! lineage can ever redeem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DELEGATION_DOMAIN_TAG;
use crate::crypto::keys::{Keypair, PublicKey, Signature};

use super::model::Token;

/// The issuer's grant of division rights to an on-device key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationCertificate {
    /// The on-device key allowed to sign division outputs.
    pub delegate: PublicKey,
    /// The participant whose tokens the delegate may divide.
    pub holder: PublicKey,
    pub valid_until: DateTime<Utc>,
    pub issuer_signature: Signature,
}

impl DelegationCertificate {
    /// Issue a certificate. Runs on the issuer.
    pub fn issue(
        issuer: &Keypair,
        holder: PublicKey,
        delegate: PublicKey,
        valid_until: DateTime<Utc>,
    ) -> Self {
        let payload = Self::payload(&delegate, &holder, valid_until);
        Self {
            delegate,
            holder,
            valid_until,
            issuer_signature: issuer.sign(&payload),
        }
    }

    fn payload(delegate: &PublicKey, holder: &PublicKey, valid_until: DateTime<Utc>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DELEGATION_DOMAIN_TAG.len() + 72);
        buf.extend_from_slice(DELEGATION_DOMAIN_TAG);
        buf.extend_from_slice(delegate.as_bytes());
        buf.extend_from_slice(holder.as_bytes());
        buf.extend_from_slice(&valid_until.timestamp_millis().to_be_bytes());
        buf
    }

    pub fn signing_payload(&self) -> Vec<u8> {
        Self::payload(&self.delegate, &self.holder, self.valid_until)
    }

    /// The certificate itself was signed by `issuer_pk`.
    pub fn verify(&self, issuer_pk: &PublicKey) -> bool {
        issuer_pk.verify(&self.signing_payload(), &self.issuer_signature)
    }

    /// Whether this certificate authorizes signing `token`: it must belong to
    /// the certified holder, be a division output, and not outlive the
    /// certificate.
    pub fn covers(&self, token: &Token) -> bool {
        token.owner == self.holder
            && token.parent_id.is_some()
            && token.expires_at <= self.valid_until
    }
}
