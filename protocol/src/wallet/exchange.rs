//! Payment exchange over a peer [`Transport`].
//!
//! The sender prepares a payment, ships it, and waits for the receiver's
//! [`WireMessage::Ack`]. An accepting ack confirms the spend. A refusal, a
//! failed send, or silence past the ack timeout cancels it and the tokens
//! return to the sender's spendable balance.
//!
//! On the receiving side every inbound payment goes through
//! [`WalletCore::receive_payment`] and is answered with an ack either way.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WalletConfig;
use crate::ports::{PeerId, ReceiveHandler, Transport};
use crate::token::TransferRecord;

use super::payment::WireMessage;
use super::{WalletCore, WalletError};

#[derive(Debug)]
struct AckOutcome {
    accepted: bool,
    reason: Option<String>,
}

struct AwaitingAck {
    peer: PeerId,
    reply: oneshot::Sender<AckOutcome>,
}

pub struct PaymentExchange {
    wallet: Arc<WalletCore>,
    transport: Arc<dyn Transport>,
    awaiting: DashMap<Uuid, AwaitingAck>,
    ack_timeout: Duration,
}

impl PaymentExchange {
    pub fn new(
        wallet: Arc<WalletCore>,
        transport: Arc<dyn Transport>,
        config: &WalletConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            wallet,
            transport,
            awaiting: DashMap::new(),
            ack_timeout: config.ack_timeout(),
        })
    }

    /// Start handling inbound frames. Must be called from within a tokio
    /// runtime.
    pub fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handler: ReceiveHandler = Arc::new(move |from, bytes| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.handle_inbound(from, bytes).await });
            }
        });
        self.transport.on_receive(handler);
    }

    pub fn wallet(&self) -> &Arc<WalletCore> {
        &self.wallet
    }

    /// Pay `amount` to `receiver` and wait for the acknowledgement.
    pub async fn send_payment(
        &self,
        receiver: PeerId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, WalletError> {
        let payment = self.wallet.pay(amount, receiver, now)?;
        let transfer_id = payment.transfer_id();

        let bytes = match WireMessage::Payment(payment).encode() {
            Ok(b) => b,
            Err(e) => {
                self.wallet.cancel_payment(&transfer_id)?;
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.awaiting.insert(
            transfer_id,
            AwaitingAck {
                peer: receiver,
                reply: tx,
            },
        );

        if let Err(e) = self.transport.send(&receiver, bytes).await {
            self.awaiting.remove(&transfer_id);
            self.wallet.cancel_payment(&transfer_id)?;
            warn!(transfer = %transfer_id, error = %e, "payment send failed");
            return Err(e.into());
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) if ack.accepted => self.wallet.confirm_payment(&transfer_id),
            Ok(Ok(ack)) => {
                self.wallet.cancel_payment(&transfer_id)?;
                Err(WalletError::Refused {
                    transfer_id,
                    reason: ack.reason.unwrap_or_else(|| "unspecified".into()),
                })
            }
            Ok(Err(_)) | Err(_) => {
                self.awaiting.remove(&transfer_id);
                self.wallet.cancel_payment(&transfer_id)?;
                warn!(
                    transfer = %transfer_id,
                    timeout_ms = self.ack_timeout.as_millis() as u64,
                    "no acknowledgement, payment cancelled"
                );
                Err(WalletError::AckTimeout(transfer_id))
            }
        }
    }

    async fn handle_inbound(&self, from: PeerId, bytes: Vec<u8>) {
        let message = match WireMessage::decode(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "undecodable frame dropped");
                return;
            }
        };

        match message {
            WireMessage::Payment(payment) => {
                let transfer_id = payment.transfer_id();
                let ack = match self.wallet.receive_payment(&payment, &from, Utc::now()) {
                    Ok(_) => WireMessage::Ack {
                        transfer_id,
                        accepted: true,
                        reason: None,
                    },
                    Err(e) => WireMessage::Ack {
                        transfer_id,
                        accepted: false,
                        reason: Some(e.to_string()),
                    },
                };
                let sent = match ack.encode() {
                    Ok(bytes) => self.transport.send(&from, bytes).await.map_err(WalletError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(transfer = %transfer_id, error = %e, "ack not sent");
                }
            }
            WireMessage::Ack {
                transfer_id,
                accepted,
                reason,
            } => {
                let Some((_, waiting)) = self
                    .awaiting
                    .remove_if(&transfer_id, |_, w| w.peer == from)
                else {
                    debug!(transfer = %transfer_id, peer = %from.short(), "unexpected ack ignored");
                    return;
                };
                if waiting.reply.send(AckOutcome { accepted, reason }).is_err() {
                    debug!(transfer = %transfer_id, "ack arrived after the sender gave up");
                } else {
                    info!(transfer = %transfer_id, accepted, "ack received");
                }
            }
        }
    }
}
