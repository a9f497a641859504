//! Spend plans and the messages two wallets exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WIRE_FORMAT_VERSION;
use crate::token::{Token, TokenId, TransferRecord};

use super::selection::Selection;
use super::WalletError;

/// A reserved selection, ready to be turned into a payment before the lease
/// runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPlan {
    pub lease_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
    pub target: u64,
    pub selection: Selection,
}

impl SpendPlan {
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.selection.token_ids()
    }

    pub fn needs_division(&self) -> bool {
        self.selection.split.is_some()
    }
}

/// Everything a receiver needs to verify and keep a payment: the signed
/// record, the tokens it lists (in order), and the earlier records that prove
/// the sender held any tokens it had itself received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePayment {
    pub record: TransferRecord,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub provenance: Vec<TransferRecord>,
}

impl OfflinePayment {
    pub fn transfer_id(&self) -> Uuid {
        self.record.id
    }

    pub fn amount(&self) -> u64 {
        self.record.amount
    }

    /// Prior hops plus this one, in the order the chain was built.
    pub fn full_provenance(&self) -> Vec<TransferRecord> {
        let mut all = self.provenance.clone();
        all.push(self.record.clone());
        all
    }
}

/// Peer-to-peer frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Payment(OfflinePayment),
    Ack {
        transfer_id: Uuid,
        accepted: bool,
        reason: Option<String>,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    message: WireMessage,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WalletError> {
        let envelope = Envelope {
            version: WIRE_FORMAT_VERSION,
            message: self.clone(),
        };
        bincode::serialize(&envelope).map_err(|e| WalletError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WalletError> {
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| WalletError::Codec(e.to_string()))?;
        if envelope.version != WIRE_FORMAT_VERSION {
            return Err(WalletError::Codec(format!(
                "unsupported wire version {}",
                envelope.version
            )));
        }
        Ok(envelope.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use chrono::Duration;

    #[test]
    fn payment_frame_survives_the_wire() {
        let issuer = Keypair::generate();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let now = Utc::now();
        let token =
            Token::mint(alice.public_key(), 250, now + Duration::days(1), &issuer).unwrap();
        let record =
            TransferRecord::create(&alice, bob.public_key(), std::slice::from_ref(&token), now)
                .unwrap();
        let msg = WireMessage::Payment(OfflinePayment {
            record,
            tokens: vec![token],
            provenance: Vec::new(),
        });

        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        let WireMessage::Payment(p) = decoded else {
            panic!("expected a payment");
        };
        assert!(p.record.verify().is_ok());
        assert!(p.record.matches_tokens(&p.tokens));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = WireMessage::decode(&[0xde, 0xad]).unwrap_err();
        assert!(matches!(err, WalletError::Codec(_)));
    }
}
