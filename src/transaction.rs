// src/transaction.rs - Parsed transaction records and output classification

use bitcoin_hashes::sha256d;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

pub type TxId = sha256d::Hash;

/// Addresses one output of one transaction. Every relation between outputs,
/// inputs and transactions in the ledger is expressed through this key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxOutputKey {
    pub tx_id: TxId,
    pub index: u32,
}

impl TxOutputKey {
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for TxOutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    Undefined,
    Unverified,
    Invalid,
    Genesis,
    TransferBsq,
    PayTradeFee,
    Proposal,
    CompensationRequest,
    BlindVote,
    VoteReveal,
    Lockup,
    Unlock,
    Irrelevant,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOutputType {
    Undefined,
    GenesisOutput,
    BsqOutput,
    BtcOutput,
    ProposalOpReturnOutput,
    CompReqOpReturnOutput,
    IssuanceCandidateOutput,
    BlindVoteLockStakeOutput,
    BlindVoteOpReturnOutput,
    VoteRevealUnlockStakeOutput,
    VoteRevealOpReturnOutput,
    BondLock,
    LockupOpReturnOutput,
    BondUnlock,
    InvalidOutput,
}

impl TxOutputType {
    /// Outputs of these types carry BSQ and enter the unspent index as soon
    /// as their transaction is parsed.
    pub fn is_tracked(self) -> bool {
        matches!(
            self,
            TxOutputType::GenesisOutput
                | TxOutputType::BsqOutput
                | TxOutputType::BlindVoteLockStakeOutput
                | TxOutputType::VoteRevealUnlockStakeOutput
                | TxOutputType::BondLock
                | TxOutputType::BondUnlock
        )
    }

    pub fn is_op_return(self) -> bool {
        matches!(
            self,
            TxOutputType::ProposalOpReturnOutput
                | TxOutputType::CompReqOpReturnOutput
                | TxOutputType::BlindVoteOpReturnOutput
                | TxOutputType::VoteRevealOpReturnOutput
                | TxOutputType::LockupOpReturnOutput
        )
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub index: u32,
    pub value: u64,
    pub tx_id: TxId,
    pub block_height: u32,
    pub address: Option<String>,
    #[serde_as(as = "Option<Bytes>")]
    pub op_return_data: Option<Vec<u8>>,
    pub output_type: TxOutputType,
}

impl TxOutput {
    pub fn key(&self) -> TxOutputKey {
        TxOutputKey::new(self.tx_id, self.index)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub connected_output: TxOutputKey,
}

/// Where and by whom a tracked output was spent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpentInfo {
    pub block_height: u32,
    pub tx_id: TxId,
    pub input_index: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub id: TxId,
    pub block_height: u32,
    pub time: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub tx_type: TxType,
}

impl Tx {
    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.get(index as usize)
    }

    /// Governance metadata is only ever carried by the final output.
    pub fn op_return_data(&self) -> Option<&[u8]> {
        self.outputs.last().and_then(|o| o.op_return_data.as_deref())
    }
}
