// src/tests/support.rs - Chain builder and mock collaborators shared by the tests

use crate::block::{BlockHash, RawBlock, RawTx, RawTxOutput};
use crate::config::DaoConfig;
use crate::node::{Collaborators, DaoNode};
use crate::opreturn;
use crate::p2p::{NetworkPayload, PayloadFilter, Transport};
use crate::params::Param;
use crate::snapshot::SnapshotManager;
use crate::storage::DaoStore;
use crate::transaction::{TxId, TxOutputKey};
use crate::wallet::{BroadcastCallback, SignedTx, TxBroadcaster, TxPurpose, TxRequest, WalletError, WalletService};
use bitcoin_hashes::Hash;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const GENESIS_SUPPLY: u64 = 1_000_000;
pub const FEE: u64 = 10;

pub fn txid(n: u32) -> TxId {
    TxId::hash(&n.to_be_bytes())
}

pub fn genesis_tx_id() -> TxId {
    txid(1)
}

pub fn key(tx_id: TxId, index: u32) -> TxOutputKey {
    TxOutputKey::new(tx_id, index)
}

/// Config with every phase lasting `phase_blocks` blocks and small fees.
pub fn test_config(genesis_height: u32, phase_blocks: u64) -> DaoConfig {
    let mut params = BTreeMap::new();
    for param in [
        Param::PhaseProposal,
        Param::PhaseBreak1,
        Param::PhaseBlindVote,
        Param::PhaseBreak2,
        Param::PhaseVoteReveal,
        Param::PhaseBreak3,
    ] {
        params.insert(param, phase_blocks);
    }
    params.insert(Param::ProposalFee, FEE);
    params.insert(Param::BlindVoteFee, FEE);
    params.insert(Param::CompensationRequestMin, 100);
    params.insert(Param::Quorum, 100);
    params.insert(Param::LockTimeMin, 1);
    DaoConfig {
        genesis_tx_id: genesis_tx_id(),
        genesis_block_height: genesis_height,
        genesis_total_supply: GENESIS_SUPPLY,
        dev_mode: false,
        dao_activated: true,
        params,
    }
}

/// A pay-to-witness-key-hash style script; anything not starting with OP_RETURN works.
pub fn out(value: u64) -> RawTxOutput {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[0xab; 20]);
    RawTxOutput::new(value, script, None)
}

pub fn op_return(data: &[u8]) -> RawTxOutput {
    RawTxOutput::new(0, opreturn::op_return_script(data), None)
}

pub fn tx(id: TxId, inputs: Vec<TxOutputKey>, outputs: Vec<RawTxOutput>) -> RawTx {
    RawTx { id, inputs, outputs }
}

pub fn genesis_tx(values: &[u64]) -> RawTx {
    tx(genesis_tx_id(), Vec::new(), values.iter().map(|v| out(*v)).collect())
}

/// Produces linked raw blocks one height at a time.
pub struct ChainBuilder {
    next_height: u32,
    prev_hash: BlockHash,
}

impl ChainBuilder {
    pub fn new(genesis_height: u32) -> Self {
        Self {
            next_height: genesis_height,
            prev_hash: BlockHash::all_zeros(),
        }
    }

    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    pub fn block(&mut self, txs: Vec<RawTx>) -> RawBlock {
        let block = RawBlock::new(self.next_height, self.prev_hash, self.next_height * 600, txs);
        self.prev_hash = block.hash;
        self.next_height += 1;
        block
    }

    pub fn empty(&mut self) -> RawBlock {
        self.block(Vec::new())
    }

    /// A block at the next height whose parent is not the current tip.
    pub fn orphan(&self) -> RawBlock {
        RawBlock::new(self.next_height, BlockHash::hash(b"elsewhere"), 0, Vec::new())
    }
}

/// Signs every request with a fresh tx id and remembers it.
#[derive(Default)]
pub struct MockWallet {
    signed: Mutex<Vec<(TxId, TxRequest)>>,
}

impl MockWallet {
    pub fn signed(&self) -> Vec<(TxId, TxRequest)> {
        self.signed.lock().clone()
    }

    pub fn last_for(&self, matches: impl Fn(&TxPurpose) -> bool) -> Option<(TxId, TxRequest)> {
        self.signed.lock().iter().rev().find(|(_, r)| matches(&r.purpose)).cloned()
    }
}

impl WalletService for MockWallet {
    fn prepare_and_sign_tx(&self, request: &TxRequest) -> Result<SignedTx, WalletError> {
        let mut signed = self.signed.lock();
        let tx_id = txid(10_000 + signed.len() as u32);
        signed.push((tx_id, request.clone()));
        Ok(SignedTx {
            tx_id,
            raw: request.op_return_data.clone(),
        })
    }
}

/// Completes every callback on the spot.
pub struct MockBroadcaster {
    pub succeed: bool,
    broadcast: Mutex<Vec<TxId>>,
}

impl MockBroadcaster {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            broadcast: Mutex::new(Vec::new()),
        }
    }

    pub fn broadcast_ids(&self) -> Vec<TxId> {
        self.broadcast.lock().clone()
    }
}

impl TxBroadcaster for MockBroadcaster {
    fn broadcast(&self, tx: SignedTx, callback: BroadcastCallback) {
        self.broadcast.lock().push(tx.tx_id);
        if self.succeed {
            callback.on_success();
        } else {
            callback.on_timeout();
        }
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub peers: usize,
    pub bootstrapped: bool,
    published: Mutex<Vec<NetworkPayload>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<NetworkPayload>>>,
}

impl MockTransport {
    pub fn connected(peers: usize) -> Self {
        Self {
            peers,
            bootstrapped: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<NetworkPayload> {
        self.published.lock().clone()
    }

    /// Delivers `payload` to every receiver handed out so far.
    pub fn deliver(&self, payload: NetworkPayload) {
        for sender in self.senders.lock().iter() {
            sender.send(payload.clone()).ok();
        }
    }
}

impl Transport for MockTransport {
    fn publish(&self, payload: NetworkPayload, _key: TxId) -> bool {
        self.published.lock().push(payload);
        true
    }

    fn on_received(&self, _filter: PayloadFilter) -> mpsc::UnboundedReceiver<NetworkPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    fn num_connected_peers(&self) -> usize {
        self.peers
    }

    fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }
}

pub struct TestNode {
    pub node: DaoNode,
    pub store: DaoStore,
    pub wallet: Arc<MockWallet>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub transport: Arc<MockTransport>,
}

impl TestNode {
    pub fn new(config: DaoConfig, grid: u32) -> Self {
        Self::with_store(config, grid, DaoStore::temporary().unwrap(), true)
    }

    pub fn with_store(config: DaoConfig, grid: u32, store: DaoStore, succeed: bool) -> Self {
        let wallet = Arc::new(MockWallet::default());
        let broadcaster = Arc::new(MockBroadcaster::new(succeed));
        let transport = Arc::new(MockTransport::connected(8));
        let collaborators = Collaborators {
            wallet: wallet.clone(),
            broadcaster: broadcaster.clone(),
            transport: transport.clone(),
        };
        let snapshots = SnapshotManager::with_grid(store.clone(), &config, grid);
        let mut node = DaoNode::with_snapshot_manager(config, store.clone(), collaborators, snapshots).unwrap();
        node.start().unwrap();
        Self {
            node,
            store,
            wallet,
            broadcaster,
            transport,
        }
    }

    /// Parses `block` and handles the broadcast outcomes it caused.
    pub fn feed(&mut self, block: &RawBlock) -> crate::node::BlockOutcome {
        let outcome = self.node.process_raw_block(block).unwrap();
        self.node.drain_broadcast_reports();
        outcome
    }
}
