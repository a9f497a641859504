//! # Signature Engine
//!
//! Key generation, signing, verification and hashing. No state lives here.
//!
//! Deliberately boring choices:
//!
//! - **Ed25519** for every signature in the protocol (issuer mints, delegated
//!   divisions, transfer authorizations).
//! - **BLAKE3** for derived identifiers.
//!
//! Everything is a thin, typed wrapper around audited implementations. Signers
//! and verifiers always operate on explicit canonical byte encodings produced
//! by the token and transfer types, never on serde output.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{blake3_hash, tagged_hash};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
pub use signatures::{batch_verify, sign, sign_with_secret, verify, verify_raw, SignatureError};
