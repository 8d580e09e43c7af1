// src/wallet.rs - Transaction construction and broadcast collaborators

use crate::my_vote::PendingBlindVote;
use crate::proposal::Proposal;
use crate::transaction::{TxId, TxOutputKey};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("Transaction construction failed: {0}")]
    Construction(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcast of {0} timed out")]
    Timeout(TxId),
    #[error("Tx {0} was malleated")]
    Malleability(TxId),
    #[error("Broadcast of {0} failed: {1}")]
    Failure(TxId, String),
}

/// The output structure the wallet has to build. The OP_RETURN payload of the
/// request always becomes the final output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TxPurpose {
    Proposal { fee: u64 },
    CompensationRequest { fee: u64, requested_bsq: u64, bsq_address: String },
    /// Output 0 locks `stake`, `fee` is burnt.
    BlindVote { stake: u64, fee: u64 },
    /// Spends `stake_output` into output 0.
    VoteReveal { stake_output: TxOutputKey, stake: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub purpose: TxPurpose,
    pub op_return_data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub tx_id: TxId,
    pub raw: Vec<u8>,
}

pub trait WalletService: Send + Sync {
    fn prepare_and_sign_tx(&self, request: &TxRequest) -> Result<SignedTx, WalletError>;
}

/// What a broadcast was for, so the writer can finish the action once the
/// outcome arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastContext {
    Proposal(Proposal),
    BlindVote(Box<PendingBlindVote>),
    VoteReveal { blind_vote_tx_id: TxId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastReport {
    pub tx_id: TxId,
    pub context: BroadcastContext,
    pub result: Result<(), BroadcastError>,
}

/// Completion handle passed to the broadcaster. Each outcome is queued to the
/// writer without blocking the caller.
#[derive(Debug)]
pub struct BroadcastCallback {
    tx_id: TxId,
    context: BroadcastContext,
    reports: mpsc::UnboundedSender<BroadcastReport>,
}

impl BroadcastCallback {
    pub fn new(tx_id: TxId, context: BroadcastContext, reports: mpsc::UnboundedSender<BroadcastReport>) -> Self {
        Self { tx_id, context, reports }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    fn report(self, result: Result<(), BroadcastError>) {
        let report = BroadcastReport {
            tx_id: self.tx_id,
            context: self.context,
            result,
        };
        if self.reports.send(report).is_err() {
            debug!("[WALLET] Broadcast report for {} dropped, writer is gone.", self.tx_id);
        }
    }

    pub fn on_success(self) {
        self.report(Ok(()));
    }

    pub fn on_timeout(self) {
        let tx_id = self.tx_id;
        self.report(Err(BroadcastError::Timeout(tx_id)));
    }

    pub fn on_malleability(self) {
        let tx_id = self.tx_id;
        self.report(Err(BroadcastError::Malleability(tx_id)));
    }

    pub fn on_failure(self, message: impl Into<String>) {
        let tx_id = self.tx_id;
        self.report(Err(BroadcastError::Failure(tx_id, message.into())));
    }
}

/// Fire-and-forget broadcasting. Implementations must return immediately and
/// complete the callback later.
pub trait TxBroadcaster: Send + Sync {
    fn broadcast(&self, tx: SignedTx, callback: BroadcastCallback);
}

/// Wallet of a node that only follows the chain.
#[derive(Debug, Default)]
pub struct WatchOnlyWallet;

impl WalletService for WatchOnlyWallet {
    fn prepare_and_sign_tx(&self, _request: &TxRequest) -> Result<SignedTx, WalletError> {
        Err(WalletError::Construction("watch-only node holds no keys".to_string()))
    }
}

impl TxBroadcaster for WatchOnlyWallet {
    fn broadcast(&self, _tx: SignedTx, callback: BroadcastCallback) {
        callback.on_failure("watch-only node cannot broadcast");
    }
}
