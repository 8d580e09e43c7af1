// src/storage.rs

use crate::blind_vote::BlindVote;
use crate::governance::Ballot;
use crate::my_vote::MyVote;
use crate::state::LedgerState;
use log::debug;
use sled::Db;
use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// Sled Tree definitions
const SNAPSHOTS_TREE: &str = "dao_snapshots";
const METADATA_TREE: &str = "dao_metadata";
const MY_VOTES_KEY: &str = "my_votes";
const BALLOTS_KEY: &str = "ballots";
const BLIND_VOTES_KEY: &str = "blind_votes";

/// Number of persisted snapshots kept besides the latest.
const RETAINED_SNAPSHOTS: usize = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    SledError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),
}

/// Durable storage for ledger snapshots and the local voter's secrets.
#[derive(Clone)]
pub struct DaoStore {
    db: Arc<Db>,
}

impl DaoStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    /// In-memory database, removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::new(Arc::new(db)))
    }

    /// Snapshots are keyed by big-endian chain height so iteration order is height order.
    pub fn save_snapshot(&self, state: &LedgerState) -> Result<(), StorageError> {
        let tree = self.db.open_tree(SNAPSHOTS_TREE)?;
        let height = state.chain_height();
        tree.insert(height.to_be_bytes(), bincode::serialize(state)?)?;

        while tree.len() > RETAINED_SNAPSHOTS + 1 {
            match tree.pop_min()? {
                Some((key, _)) => debug!("[STORAGE] Pruned snapshot {:?}.", key),
                None => break,
            }
        }
        tree.flush()?;
        Ok(())
    }

    pub fn load_latest_snapshot(&self) -> Result<Option<LedgerState>, StorageError> {
        let tree = self.db.open_tree(SNAPSHOTS_TREE)?;
        match tree.last()? {
            Some((_, value)) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn snapshot_heights(&self) -> Result<Vec<u32>, StorageError> {
        let tree = self.db.open_tree(SNAPSHOTS_TREE)?;
        tree.iter()
            .keys()
            .map(|key| {
                let key = key?;
                let bytes: [u8; 4] = key.as_ref().try_into().map_err(|_| {
                    StorageError::DataIntegrityError("Malformed snapshot key".to_string())
                })?;
                Ok(u32::from_be_bytes(bytes))
            })
            .collect()
    }

    /// The MyVote list is rewritten as a whole on every change.
    pub fn save_my_votes(&self, my_votes: &[MyVote]) -> Result<(), StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        tree.insert(MY_VOTES_KEY, bincode::serialize(my_votes)?)?;
        tree.flush()?;
        Ok(())
    }

    pub fn load_my_votes(&self) -> Result<Vec<MyVote>, StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        match tree.get(MY_VOTES_KEY)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_ballots(&self, ballots: &[Ballot]) -> Result<(), StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        tree.insert(BALLOTS_KEY, bincode::serialize(ballots)?)?;
        tree.flush()?;
        Ok(())
    }

    pub fn load_ballots(&self) -> Result<Vec<Ballot>, StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        match tree.get(BALLOTS_KEY)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Every blind vote seen on the network, own ones included.
    pub fn save_blind_votes(&self, blind_votes: &[BlindVote]) -> Result<(), StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        tree.insert(BLIND_VOTES_KEY, bincode::serialize(blind_votes)?)?;
        tree.flush()?;
        Ok(())
    }

    pub fn load_blind_votes(&self) -> Result<Vec<BlindVote>, StorageError> {
        let tree = self.db.open_tree(METADATA_TREE)?;
        match tree.get(BLIND_VOTES_KEY)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Vec::new()),
        }
    }
}
