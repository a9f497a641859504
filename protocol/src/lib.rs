// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Offline Token Protocol — Core Library
//!
//! Digital value that moves between two phones with no network in sight, and
//! still settles honestly once somebody gets back online.
//!
//! An issuer (the Offline Token Manager) mints tokens against money paid into
//! a ledger. Tokens are Ed25519-signed value objects with an owner and an
//! expiry. Holders pay each other offline by handing over tokens along with a
//! signed transfer record; a token that's too big is divided on the device
//! by a delegate key the issuer certified. When devices reconnect they sync
//! their records and redeem what they received. Whatever expires unredeemed
//! goes back to whoever bought it.
//!
//! ## Modules
//!
//! - **token** — the token, division, transfer records, validation. Pure.
//! - **issuer** — minting, redemption, delegation, transfer audit, expiry refunds.
//! - **wallet** — holdings, coin selection, reservations, offline payments.
//! - **reconcile** — the back-online pass: expire, sync, redeem, with retries.
//! - **ports** — the ledger and peer transport seams, with in-memory versions.
//! - **storage** — sled-backed persistence for tokens and transfer records.
//! - **crypto** — Ed25519 keys and signatures, BLAKE3 hashing.
//! - **config** — protocol constants and TOML configuration.
//! - **error** — the cross-cutting error classification.
//!
//! ## Ground Rules
//!
//! 1. Amounts are integer minor units. No floats anywhere near money.
//! 2. Every time-dependent function takes `now` as an argument.
//! 3. Value is conserved: division, transfer and redemption never create it.
//! 4. Offline double spends can't be prevented, only caught. The issuer
//!    catches them.

pub mod config;
pub mod crypto;
pub mod error;
pub mod issuer;
pub mod ports;
pub mod reconcile;
pub mod storage;
pub mod token;
pub mod wallet;

pub use error::ErrorClass;
pub use issuer::{Issuer, IssuerError};
pub use reconcile::{IssuerGateway, ReconciliationCoordinator, RetryPolicy};
pub use token::{Token, TokenId, TokenStatus, TransferRecord};
pub use wallet::{PaymentExchange, WalletCore, WalletError};
