//! # Token
//!
//! The immutable value object at the heart of the protocol. A [`Token`] is a
//! fixed amount of value, bound to an owner's public key, signed by the issuer
//! (or by a certified delegate, for offline division outputs), and valid until
//! a fixed expiry.
//!
//! Nothing here ever extends `expires_at` or changes `amount`, `owner` or the
//! lineage fields after signing. The only mutable part is `status`, and that
//! only moves forward (see [`TokenStatus::can_transition_to`]).
//!
//! ## Canonical encoding
//!
//! ```text
//! "otm/token/v1" || id(32) || amount(u64 BE) || owner(32)
//!     || expires_at(unix ms, i64 BE) || origin_id(32) || parent_flag(1) || parent_id(32)?
//! ```
//!
//! This is what signatures cover. It never goes through serde, so a JSON
//! library reordering fields can't break verification.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::config::{DIVISION_ID_TAG, ID_LENGTH, TOKEN_DOMAIN_TAG};
use crate::crypto::hash::tagged_hash;
use crate::crypto::keys::{Keypair, PublicKey, Signature};

use super::delegation::DelegationCertificate;
use super::TokenError;

// ---------------------------------------------------------------------------
// TokenId
// ---------------------------------------------------------------------------

/// A 32-byte token identifier.
///
/// Minted tokens get random ids. Division outputs get
/// `BLAKE3(tag || parent_id || branch || amount)`, so a child id commits to its
/// parent and two divisions of the same parent at the same amount collide on
/// purpose.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId([u8; ID_LENGTH]);

impl TokenId {
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Fresh random id from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the id of a division output. `branch` is 0 for the payment
    /// half and 1 for the change half.
    pub fn derive_child(parent: &TokenId, branch: u8, amount: u64) -> Self {
        Self(tagged_hash(
            DIVISION_ID_TAG,
            &[&parent.0, &[branch], &amount.to_be_bytes()],
        ))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ID_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}...)", self.short())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for TokenId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for TokenId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TokenId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// TokenStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a token.
///
/// ```text
/// Active ──► Divided   (terminal, replaced by two children)
///   │  ├───► Redeemed  (terminal)
///   │  ├───► Expired   (terminal, refunded)
///   └──────► Spent ──► Redeemed | Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStatus {
    Active,
    Divided,
    Spent,
    Redeemed,
    Expired,
}

impl TokenStatus {
    /// Whether `self -> next` is a legal move. Staying put is not a
    /// transition.
    pub fn can_transition_to(&self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        matches!(
            (self, next),
            (Active, Divided)
                | (Active, Spent)
                | (Active, Redeemed)
                | (Active, Expired)
                | (Spent, Redeemed)
                | (Spent, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::Divided | TokenStatus::Redeemed | TokenStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Divided => "divided",
            TokenStatus::Spent => "spent",
            TokenStatus::Redeemed => "redeemed",
            TokenStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A signed, divisible unit of value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: TokenId,
    /// Value in minor units. Never zero.
    pub amount: u64,
    /// The participant the token was issued (or divided) to.
    #[serde(rename = "ownerId")]
    pub owner: PublicKey,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    pub parent_id: Option<TokenId>,
    /// Id of the issuer-minted root this token descends from.
    pub origin_id: TokenId,
    pub issuer_signature: Signature,
    /// Present when a certified delegate, not the issuer, signed this token.
    pub delegation: Option<DelegationCertificate>,
}

impl Token {
    /// Mint a fresh root token signed by the issuer.
    ///
    /// `amount == 0` is rejected: a zero-value token is useless and would
    /// break the division invariant `0 < P < amount`.
    pub fn mint(
        owner: PublicKey,
        amount: u64,
        expires_at: DateTime<Utc>,
        issuer: &Keypair,
    ) -> Result<Token, TokenError> {
        if amount == 0 {
            return Err(TokenError::InvalidAmount("cannot mint a zero-value token".into()));
        }

        let id = TokenId::random();
        let mut token = Token {
            id,
            amount,
            owner,
            expires_at,
            status: TokenStatus::Active,
            parent_id: None,
            origin_id: id,
            issuer_signature: Signature::from_bytes([0u8; 64]),
            delegation: None,
        };
        token.issuer_signature = issuer.sign(&token.canonical_bytes());
        Ok(token)
    }

    /// The byte string every token signature covers.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOKEN_DOMAIN_TAG.len() + 32 * 4 + 8 + 8 + 1);
        buf.extend_from_slice(TOKEN_DOMAIN_TAG);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(self.owner.as_bytes());
        buf.extend_from_slice(&self.expires_at.timestamp_millis().to_be_bytes());
        buf.extend_from_slice(self.origin_id.as_bytes());
        match &self.parent_id {
            Some(parent) => {
                buf.push(1);
                buf.extend_from_slice(parent.as_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    /// Expired at or after `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and not yet expired.
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.status == TokenStatus::Active && !self.is_expired(now)
    }

    /// Minted by the issuer rather than produced by a division.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Move to `next`, refusing anything that isn't a legal forward step.
    pub fn transition(&mut self, next: TokenStatus) -> Result<(), TokenError> {
        if !self.status.can_transition_to(next) {
            return Err(TokenError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
