//! # Ledger Client
//!
//! The issuer never moves real value itself. It asks a ledger (a bank core,
//! a chain client, whatever backs the tokens) to credit or debit an account
//! and then waits for the ledger to confirm. [`LedgerClient`] is that narrow
//! seam; [`InMemoryLedger`] is the reference implementation used by the node
//! and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::keys::PublicKey;
use crate::error::ErrorClass;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("insufficient ledger balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("unknown ledger transaction {0}")]
    UnknownHandle(Uuid),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Unavailable(_) => ErrorClass::TransportFailure,
            LedgerError::InsufficientBalance { .. } => ErrorClass::InsufficientFunds,
            LedgerError::UnknownHandle(_) => ErrorClass::Validation,
        }
    }
}

/// Opaque reference to a submitted ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub Uuid);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    Confirmed,
    Failed { reason: String },
}

/// Ledger operations the issuer depends on. Accounts are participant keys.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_balance(&self, address: &PublicKey) -> Result<u64, LedgerError>;

    async fn debit(&self, address: &PublicKey, amount: u64) -> Result<TxHandle, LedgerError>;

    async fn credit(&self, address: &PublicKey, amount: u64) -> Result<TxHandle, LedgerError>;

    /// Resolve a submitted operation. Value only moves on `Confirmed`.
    async fn wait_for_confirmation(&self, handle: &TxHandle) -> Result<Confirmation, LedgerError>;
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy)]
struct PendingTx {
    address: PublicKey,
    amount: u64,
    direction: Direction,
}

/// Ledger kept in a pair of `DashMap`s.
///
/// Operations are staged by `credit`/`debit` and applied on
/// `wait_for_confirmation`. Failure injection knobs let tests simulate an
/// outage (`fail_next_submissions`) or a ledger that refuses to confirm
/// (`reject_next_confirmations`).
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: DashMap<PublicKey, u64>,
    pending: DashMap<Uuid, PendingTx>,
    fail_submissions: AtomicU32,
    reject_confirmations: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account, e.g. a purchaser's bank balance.
    pub fn fund(&self, address: &PublicKey, amount: u64) {
        *self.balances.entry(*address).or_insert(0) += amount;
    }

    /// Synchronous balance read for tests and the status endpoint.
    pub fn balance_of(&self, address: &PublicKey) -> u64 {
        self.balances.get(address).map(|b| *b).unwrap_or(0)
    }

    /// The next `n` credit/debit submissions fail with `Unavailable`.
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_submissions.store(n, Ordering::SeqCst);
    }

    /// The next `n` confirmations come back `Failed`.
    pub fn reject_next_confirmations(&self, n: u32) {
        self.reject_confirmations.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn submit(&self, address: &PublicKey, amount: u64, direction: Direction) -> Result<TxHandle, LedgerError> {
        if Self::take_one(&self.fail_submissions) {
            return Err(LedgerError::Unavailable("injected submission failure".into()));
        }
        let id = Uuid::new_v4();
        self.pending.insert(
            id,
            PendingTx {
                address: *address,
                amount,
                direction,
            },
        );
        Ok(TxHandle(id))
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_balance(&self, address: &PublicKey) -> Result<u64, LedgerError> {
        Ok(self.balance_of(address))
    }

    async fn debit(&self, address: &PublicKey, amount: u64) -> Result<TxHandle, LedgerError> {
        let available = self.balance_of(address);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        self.submit(address, amount, Direction::Debit)
    }

    async fn credit(&self, address: &PublicKey, amount: u64) -> Result<TxHandle, LedgerError> {
        self.submit(address, amount, Direction::Credit)
    }

    async fn wait_for_confirmation(&self, handle: &TxHandle) -> Result<Confirmation, LedgerError> {
        let (_, tx) = self
            .pending
            .remove(&handle.0)
            .ok_or(LedgerError::UnknownHandle(handle.0))?;

        if Self::take_one(&self.reject_confirmations) {
            return Ok(Confirmation::Failed {
                reason: "injected confirmation failure".into(),
            });
        }

        let mut balance = self.balances.entry(tx.address).or_insert(0);
        let current = *balance;
        match tx.direction {
            Direction::Credit => *balance = current.saturating_add(tx.amount),
            Direction::Debit => {
                if current < tx.amount {
                    return Ok(Confirmation::Failed {
                        reason: "balance changed before confirmation".into(),
                    });
                }
                *balance = current - tx.amount;
            }
        }
        Ok(Confirmation::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[tokio::test]
    async fn credit_applies_on_confirmation() {
        let ledger = InMemoryLedger::new();
        let alice = Keypair::generate().public_key();

        let handle = ledger.credit(&alice, 100).await.unwrap();
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), 0);
        assert_eq!(
            ledger.wait_for_confirmation(&handle).await.unwrap(),
            Confirmation::Confirmed
        );
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn debit_checks_balance() {
        let ledger = InMemoryLedger::new();
        let alice = Keypair::generate().public_key();
        ledger.fund(&alice, 50);

        assert!(matches!(
            ledger.debit(&alice, 60).await,
            Err(LedgerError::InsufficientBalance {
                needed: 60,
                available: 50
            })
        ));

        let handle = ledger.debit(&alice, 20).await.unwrap();
        ledger.wait_for_confirmation(&handle).await.unwrap();
        assert_eq!(ledger.balance_of(&alice), 30);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let ledger = InMemoryLedger::new();
        let alice = Keypair::generate().public_key();
        ledger.fail_next_submissions(1);

        let err = ledger.credit(&alice, 1).await.unwrap_err();
        assert!(err.class().is_transient());
        assert!(ledger.credit(&alice, 1).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_confirmation_moves_nothing() {
        let ledger = InMemoryLedger::new();
        let alice = Keypair::generate().public_key();
        ledger.reject_next_confirmations(1);

        let handle = ledger.credit(&alice, 10).await.unwrap();
        assert!(matches!(
            ledger.wait_for_confirmation(&handle).await.unwrap(),
            Confirmation::Failed { .. }
        ));
        assert_eq!(ledger.balance_of(&alice), 0);
    }

    #[tokio::test]
    async fn handles_resolve_once() {
        let ledger = InMemoryLedger::new();
        let alice = Keypair::generate().public_key();
        let handle = ledger.credit(&alice, 5).await.unwrap();
        ledger.wait_for_confirmation(&handle).await.unwrap();
        assert!(matches!(
            ledger.wait_for_confirmation(&handle).await,
            Err(LedgerError::UnknownHandle(_))
        ));
        assert_eq!(ledger.balance_of(&alice), 5);
    }
}
