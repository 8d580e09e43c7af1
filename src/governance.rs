// src/governance.rs - Types shared by the voting services

use crate::crypto::CryptoError;
use crate::params::ParamError;
use crate::period::Phase;
use crate::proposal::Proposal;
use crate::storage::StorageError;
use crate::transaction::{TxId, TxOutputKey, TxType};
use crate::wallet::WalletError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote {
    Accept,
    Reject,
}

/// A proposal together with the local voter's decision on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ballot {
    pub proposal: Proposal,
    pub vote: Option<Vote>,
}

impl Ballot {
    pub fn new(proposal: Proposal) -> Self {
        Self { proposal, vote: None }
    }

    pub fn tx_id(&self) -> Option<TxId> {
        self.proposal.tx_id
    }
}

/// Sorts ballots by proposal tx id so every voter encrypts the same order.
pub fn sort_ballots(ballots: &mut [Ballot]) {
    ballots.sort_by(|a, b| a.proposal.tx_id.cmp(&b.proposal.tx_id));
}

/// Reasons a proposal or blind vote received from the network is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Name must not be empty")]
    EmptyName,
    #[error("Link must not be empty")]
    EmptyLink,
    #[error("BSQ address must not be empty")]
    EmptyAddress,
    #[error("Requested amount {requested} outside [{min}, {max}]")]
    RequestOutOfRange { requested: u64, min: u64, max: u64 },
    #[error("Parameter change refused: {0}")]
    InvalidParam(#[from] ParamError),
    #[error("Transaction id is missing")]
    MissingTxId,
    #[error("Encrypted votes are empty")]
    EmptyEncryptedVotes,
    #[error("Stake must be positive")]
    ZeroStake,
    #[error("Tx {tx_id} locks {locked} but the blind vote declares {declared}")]
    StakeMismatch { tx_id: TxId, declared: u64, locked: u64 },
    #[error("Tx {tx_id} has type {actual:?}, expected {expected:?}")]
    WrongTxType { tx_id: TxId, actual: TxType, expected: TxType },
    #[error("Tx {0} is not in the current cycle")]
    WrongCycle(TxId),
    #[error("Tx {tx_id} was confirmed in phase {actual:?}, expected {expected:?}")]
    WrongPhase { tx_id: TxId, actual: Phase, expected: Phase },
    #[error("OP_RETURN of tx {0} does not commit to this payload")]
    HashMismatch(TxId),
}

#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("A blind vote was already cast in the cycle starting at height {0}")]
    AlreadyVoted(u32),
    #[error("Action requires phase {expected:?} but the chain is in {actual:?}")]
    WrongPhase { expected: Phase, actual: Phase },
    #[error("Stake output {0} is not unspent")]
    StakeOutputNotFound(TxOutputKey),
    #[error("Ballot for proposal {0} not found")]
    BallotNotFound(String),
}

/// A failed governance action, kept for the voter-facing caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceException {
    pub id: String,
    pub height: u32,
    pub message: String,
}

impl GovernanceException {
    pub fn new(id: impl Into<String>, height: u32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            height,
            message: message.into(),
        }
    }
}
