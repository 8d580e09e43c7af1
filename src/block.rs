// src/block.rs

use crate::opreturn;
use crate::state::StateChangeEvent;
use crate::transaction::{TxId, TxOutputKey};
use bitcoin_hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};

pub type BlockHash = sha256d::Hash;

/// An output exactly as the block source delivers it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RawTxOutput {
    pub value: u64,
    pub script_pub_key: Vec<u8>,
    #[serde(default)]
    pub address: Option<String>,
}

impl RawTxOutput {
    pub fn new(value: u64, script_pub_key: Vec<u8>, address: Option<String>) -> Self {
        Self { value, script_pub_key, address }
    }

    pub fn is_op_return(&self) -> bool {
        self.script_pub_key.first() == Some(&0x6a)
    }

    pub fn op_return_data(&self) -> Option<Vec<u8>> {
        opreturn::extract_op_return_data(&self.script_pub_key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RawTx {
    pub id: TxId,
    pub inputs: Vec<TxOutputKey>,
    pub outputs: Vec<RawTxOutput>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub height: u32,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub time: u32,
    pub txs: Vec<RawTx>,
}

#[derive(Serialize)]
struct HeaderPreimage<'a> {
    height: u32,
    prev_hash: &'a BlockHash,
    time: u32,
    tx_ids: Vec<&'a TxId>,
}

impl RawBlock {
    /// Builds a block whose hash commits to its height, parent, time and
    /// transaction ids. Blocks read from a chain keep the hash the chain gave them.
    pub fn new(height: u32, prev_hash: BlockHash, time: u32, txs: Vec<RawTx>) -> Self {
        let preimage = HeaderPreimage {
            height,
            prev_hash: &prev_hash,
            time,
            tx_ids: txs.iter().map(|tx| &tx.id).collect(),
        };
        let hash = match bincode::serialize(&preimage) {
            Ok(bytes) => sha256d::Hash::hash(&bytes),
            Err(_) => sha256d::Hash::all_zeros(),
        };
        Self { height, hash, prev_hash, time, txs }
    }
}

/// A parsed block. Holds only the ids of the BSQ-relevant transactions it
/// contained; the transactions themselves live in the ledger's tx table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    pub height: u32,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub time: u32,
    pub tx_ids: Vec<TxId>,
    pub state_change_events: Vec<StateChangeEvent>,
}

impl Block {
    pub fn from_raw(raw: &RawBlock) -> Self {
        Self {
            height: raw.height,
            hash: raw.hash,
            prev_hash: raw.prev_hash,
            time: raw.time,
            tx_ids: Vec::new(),
            state_change_events: Vec::new(),
        }
    }
}
