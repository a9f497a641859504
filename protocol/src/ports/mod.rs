//! External collaborators, consumed through narrow async traits.
//!
//! - [`LedgerClient`]: moves real value when tokens are redeemed or refunded.
//! - [`Transport`]: the offline peer-to-peer link.
//!
//! Each trait ships with an in-memory implementation that can inject failures.

pub mod ledger;
pub mod transport;

pub use ledger::{Confirmation, InMemoryLedger, LedgerClient, LedgerError, TxHandle};
pub use transport::{
    LoopbackNetwork, LoopbackTransport, PeerId, ReceiveHandler, Transport, TransportError,
};
