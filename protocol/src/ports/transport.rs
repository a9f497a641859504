//! # Peer Transport
//!
//! The short-range link between two devices (Bluetooth, NFC, a QR ping-pong)
//! reduced to two calls: send bytes to a peer, and register a handler for
//! bytes that arrive. Delivery is at-most-once. Messages can vanish, and the
//! payment layer above copes by waiting for an explicit acknowledgement.
//!
//! [`LoopbackNetwork`] wires any number of in-process endpoints together and
//! can drop or refuse messages on demand.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::keys::PublicKey;
use crate::error::ErrorClass;

/// Peers are addressed by their identity key.
pub type PeerId = PublicKey;

/// Called once per delivered message with the sender and the raw bytes.
pub type ReceiveHandler = Arc<dyn Fn(PeerId, Vec<u8>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0:?} is unreachable")]
    Unreachable(PeerId),

    #[error("link down: {0}")]
    LinkDown(String),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransportFailure
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// The identity this endpoint sends as.
    fn local_peer(&self) -> PeerId;

    /// Best-effort send. `Ok` means handed to the link, not delivered.
    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Replace the inbound handler.
    fn on_receive(&self, handler: ReceiveHandler);
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackInner {
    handlers: DashMap<PeerId, ReceiveHandler>,
    drop_next: AtomicU32,
    link_down: AtomicBool,
}

/// An in-process network. Cheap to clone; clones share the same wiring.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<LoopbackInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint for `peer` on this network.
    pub fn endpoint(&self, peer: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            local: peer,
            network: self.clone(),
        }
    }

    /// Silently lose the next `n` messages. `send` still returns `Ok`.
    pub fn drop_next(&self, n: u32) {
        self.inner.drop_next.store(n, Ordering::SeqCst);
    }

    /// Make every `send` fail until toggled back.
    pub fn set_link_down(&self, down: bool) {
        self.inner.link_down.store(down, Ordering::SeqCst);
    }
}

/// One device's view of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    local: PeerId,
    network: LoopbackNetwork,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let inner = &self.network.inner;
        if inner.link_down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown("loopback link disabled".into()));
        }

        // Clone the handler out so no map guard is held across the spawn.
        let handler = inner
            .handlers
            .get(peer)
            .map(|h| Arc::clone(h.value()))
            .ok_or(TransportError::Unreachable(*peer))?;

        let dropped = inner
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            tracing::debug!(to = %peer.short(), "loopback dropped a message");
            return Ok(());
        }

        let from = self.local;
        tokio::spawn(async move {
            handler(from, bytes);
        });
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.network.inner.handlers.insert(self.local, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use tokio::sync::mpsc;

    fn pair() -> (LoopbackNetwork, LoopbackTransport, LoopbackTransport) {
        let net = LoopbackNetwork::new();
        let a = net.endpoint(Keypair::generate().public_key());
        let b = net.endpoint(Keypair::generate().public_key());
        (net, a, b)
    }

    fn capture(t: &LoopbackTransport) -> mpsc::UnboundedReceiver<(PeerId, Vec<u8>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        t.on_receive(Arc::new(move |from, bytes| {
            let _ = tx.send((from, bytes));
        }));
        rx
    }

    #[tokio::test]
    async fn delivers_with_sender_identity() {
        let (_, a, b) = pair();
        let mut inbox = capture(&b);

        a.send(&b.local_peer(), b"hello".to_vec()).await.unwrap();
        let (from, bytes) = inbox.recv().await.unwrap();
        assert_eq!(from, a.local_peer());
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let (_, a, _) = pair();
        let stranger = Keypair::generate().public_key();
        let err = a.send(&stranger, vec![1]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(err.class().is_transient());
    }

    #[tokio::test]
    async fn dropped_messages_vanish() {
        let (net, a, b) = pair();
        let mut inbox = capture(&b);
        net.drop_next(1);

        a.send(&b.local_peer(), vec![1]).await.unwrap();
        a.send(&b.local_peer(), vec![2]).await.unwrap();
        let (_, bytes) = inbox.recv().await.unwrap();
        assert_eq!(bytes, vec![2]);
    }

    #[tokio::test]
    async fn link_down_fails_sends() {
        let (net, a, b) = pair();
        let _inbox = capture(&b);
        net.set_link_down(true);
        assert!(matches!(
            a.send(&b.local_peer(), vec![]).await,
            Err(TransportError::LinkDown(_))
        ));
        net.set_link_down(false);
        assert!(a.send(&b.local_peer(), vec![]).await.is_ok());
    }
}
