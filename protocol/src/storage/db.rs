//! # TokenDb — sled-backed token store
//!
//! ## Tree Layout
//!
//! | Tree        | Key                  | Value                    |
//! |-------------|----------------------|--------------------------|
//! | `tokens`    | `token_id` (32B)     | `bincode(Token)`         |
//! | `transfers` | `transfer_id` (16B)  | `bincode(TransferRecord)`|
//! | `refunds`   | `origin_id` (32B)    | amount, u64 big-endian   |
//! | `metadata`  | key (UTF-8)          | value (bytes)            |
//!
//! Writes are single-key inserts, so every put is atomic on its own. Status
//! listings are full scans of the `tokens` tree. The tree stays small (a
//! wallet holds tens of tokens, the issuer prunes nothing but is read once at
//! startup), so there is no secondary index.

use sled::{Db, Tree};
use std::path::Path;
use uuid::Uuid;

use super::{StoreError, StoreResult, TokenStore};
use crate::config::ID_LENGTH;
use crate::token::{Token, TokenId, TokenStatus, TransferRecord};

/// Persistent token storage.
///
/// sled handles are cheap to clone and thread-safe, so `TokenDb` can be
/// shared as `Arc<TokenDb>` (or `Arc<dyn TokenStore>`) without extra locking.
#[derive(Debug, Clone)]
pub struct TokenDb {
    db: Db,
    tokens: Tree,
    transfers: Tree,
    refunds: Tree,
    metadata: Tree,
}

impl TokenDb {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed on drop. For tests and ephemeral wallets.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let tokens = db.open_tree("tokens")?;
        let transfers = db.open_tree("transfers")?;
        let refunds = db.open_tree("refunds")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            tokens,
            transfers,
            refunds,
            metadata,
        })
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Small key/value side channel, e.g. the node's issuer public key.
    pub fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.metadata.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.metadata.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scan<T: serde::de::DeserializeOwned>(tree: &Tree) -> StoreResult<Vec<T>> {
        let mut out = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl TokenStore for TokenDb {
    fn put_token(&self, token: &Token) -> StoreResult<()> {
        self.tokens.insert(token.id.as_bytes(), encode(token)?)?;
        Ok(())
    }

    fn get_token(&self, id: &TokenId) -> StoreResult<Option<Token>> {
        match self.tokens.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_by_status(&self, status: TokenStatus) -> StoreResult<Vec<Token>> {
        Ok(Self::scan::<Token>(&self.tokens)?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    fn list_tokens(&self) -> StoreResult<Vec<Token>> {
        Self::scan(&self.tokens)
    }

    fn put_transfer(&self, record: &TransferRecord) -> StoreResult<()> {
        self.transfers.insert(record.id.as_bytes(), encode(record)?)?;
        Ok(())
    }

    fn get_transfer(&self, id: &Uuid) -> StoreResult<Option<TransferRecord>> {
        match self.transfers.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_pending(&self) -> StoreResult<Vec<TransferRecord>> {
        Ok(Self::scan::<TransferRecord>(&self.transfers)?
            .into_iter()
            .filter(|r| r.sync_status.awaits_sync())
            .collect())
    }

    fn list_transfers(&self) -> StoreResult<Vec<TransferRecord>> {
        Self::scan(&self.transfers)
    }

    fn put_refund(&self, origin: &TokenId, amount: u64) -> StoreResult<()> {
        self.refunds
            .insert(origin.as_bytes(), &amount.to_be_bytes()[..])?;
        Ok(())
    }

    fn list_refunds(&self) -> StoreResult<Vec<(TokenId, u64)>> {
        let mut out = Vec::with_capacity(self.refunds.len());
        for entry in self.refunds.iter() {
            let (key, value) = entry?;
            let id: [u8; ID_LENGTH] = key[..].try_into().map_err(|_| {
                StoreError::Serialization(format!("refund key of {} bytes", key.len()))
            })?;
            let amount: [u8; 8] = value[..].try_into().map_err(|_| {
                StoreError::Serialization(format!("refund amount of {} bytes", value.len()))
            })?;
            out.push((TokenId::from_bytes(id), u64::from_be_bytes(amount)));
        }
        Ok(out)
    }
}
