// src/state.rs - The canonical derived ledger

use crate::block::Block;
use crate::config::DaoConfig;
use crate::params::{Param, ParamChangeEvent, ParamRegistry};
use crate::period::{Cycle, PeriodService};
use crate::proposal::Proposal;
use crate::transaction::{SpentInfo, Tx, TxId, TxOutput, TxOutputKey, TxOutputType};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Transaction {0} was already parsed")]
    TxAlreadyParsed(TxId),
}

/// A proposal folded into consensus at `height`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProposalEvent {
    pub proposal: Proposal,
    pub height: u32,
}

/// BSQ minted to the issuance candidate output of an accepted compensation request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issuance {
    pub output: TxOutputKey,
    pub height: u32,
    pub amount: u64,
}

/// Governance side effects attached to the block at which they take effect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StateChangeEvent {
    ParamChange(ParamChangeEvent),
    Proposal(ProposalEvent),
    Issuance(Issuance),
}

/// Logs a consensus invariant violation. Fatal when running in dev mode.
pub(crate) fn report_invariant_violation(dev_mode: bool, message: &str) {
    error!("[INVARIANT] {}", message);
    if dev_mode {
        panic!("Invariant violation: {}", message);
    }
}

/// All state derived from replaying the chain. Relations are expressed as
/// keys into flat tables so that a `clone()` is a complete, independent copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerState {
    genesis_tx_id: TxId,
    genesis_block_height: u32,
    genesis_total_supply: u64,
    blocks: Vec<Block>,
    txs: BTreeMap<TxId, Tx>,
    unspent_tx_outputs: BTreeSet<TxOutputKey>,
    spent_infos: BTreeMap<TxOutputKey, SpentInfo>,
    burnt_fees: BTreeMap<TxId, u64>,
    issuance_candidates: BTreeSet<TxOutputKey>,
    issuances: BTreeMap<TxOutputKey, Issuance>,
    lock_times: BTreeMap<TxOutputKey, u16>,
    unlock_heights: BTreeMap<TxOutputKey, u32>,
    cycles: Vec<Cycle>,
    params: ParamRegistry,
}

impl LedgerState {
    /// Fresh state with the genesis cycle already in place.
    pub fn new(config: &DaoConfig) -> Self {
        let params = ParamRegistry::new(config.params.clone());
        let genesis_cycle = Cycle::from_params(
            config.genesis_block_height,
            &params,
            config.genesis_block_height,
        );
        Self {
            genesis_tx_id: config.genesis_tx_id,
            genesis_block_height: config.genesis_block_height,
            genesis_total_supply: config.genesis_total_supply,
            blocks: Vec::new(),
            txs: BTreeMap::new(),
            unspent_tx_outputs: BTreeSet::new(),
            spent_infos: BTreeMap::new(),
            burnt_fees: BTreeMap::new(),
            issuance_candidates: BTreeSet::new(),
            issuances: BTreeMap::new(),
            lock_times: BTreeMap::new(),
            unlock_heights: BTreeMap::new(),
            cycles: vec![genesis_cycle],
            params,
        }
    }

    // --- Chain ---

    pub fn genesis_tx_id(&self) -> &TxId {
        &self.genesis_tx_id
    }

    pub fn genesis_block_height(&self) -> u32 {
        self.genesis_block_height
    }

    pub fn genesis_total_supply(&self) -> u64 {
        self.genesis_total_supply
    }

    /// Height of the last parsed block, or the genesis height before any block.
    pub fn chain_height(&self) -> u32 {
        self.last_block()
            .map(|b| b.height)
            .unwrap_or(self.genesis_block_height)
    }

    pub fn next_block_height(&self) -> u32 {
        match self.last_block() {
            Some(block) => block.height + 1,
            None => self.genesis_block_height,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn block_at_height(&self, height: u32) -> Option<&Block> {
        let first = self.blocks.first()?.height;
        let index = height.checked_sub(first)? as usize;
        self.blocks.get(index).filter(|b| b.height == height)
    }

    /// Parsed transactions of the blocks in `from..=to`, in chain order.
    pub fn txs_in_range(&self, from: u32, to: u32) -> impl Iterator<Item = &Tx> {
        self.blocks
            .iter()
            .filter(move |b| b.height >= from && b.height <= to)
            .flat_map(|b| b.tx_ids.iter())
            .filter_map(move |id| self.txs.get(id))
    }

    // --- Transactions and outputs ---

    pub fn tx(&self, tx_id: &TxId) -> Option<&Tx> {
        self.txs.get(tx_id)
    }

    pub fn tx_output(&self, key: &TxOutputKey) -> Option<&TxOutput> {
        self.txs.get(&key.tx_id).and_then(|tx| tx.output(key.index))
    }

    pub fn tx_output_type(&self, key: &TxOutputKey) -> Option<TxOutputType> {
        self.tx_output(key).map(|o| o.output_type)
    }

    pub fn is_unspent(&self, key: &TxOutputKey) -> bool {
        self.unspent_tx_outputs.contains(key)
    }

    pub fn unspent_tx_output(&self, key: &TxOutputKey) -> Option<&TxOutput> {
        if self.is_unspent(key) {
            self.tx_output(key)
        } else {
            None
        }
    }

    pub fn unspent_tx_outputs(&self) -> impl Iterator<Item = &TxOutput> {
        self.unspent_tx_outputs
            .iter()
            .filter_map(move |key| self.tx_output(key))
    }

    pub fn unspent_count(&self) -> usize {
        self.unspent_tx_outputs.len()
    }

    pub fn total_unspent_bsq(&self) -> u64 {
        self.unspent_tx_outputs().map(|o| o.value).sum()
    }

    pub fn spent_info(&self, key: &TxOutputKey) -> Option<&SpentInfo> {
        self.spent_infos.get(key)
    }

    pub fn burnt_fee(&self, tx_id: &TxId) -> u64 {
        self.burnt_fees.get(tx_id).copied().unwrap_or(0)
    }

    pub fn total_burnt_fee(&self) -> u64 {
        self.burnt_fees.values().sum()
    }

    pub fn is_issuance_candidate(&self, key: &TxOutputKey) -> bool {
        self.issuance_candidates.contains(key)
    }

    pub fn issuance(&self, key: &TxOutputKey) -> Option<&Issuance> {
        self.issuances.get(key)
    }

    pub fn total_issued(&self) -> u64 {
        self.issuances.values().map(|i| i.amount).sum()
    }

    pub fn lock_time(&self, key: &TxOutputKey) -> Option<u16> {
        self.lock_times.get(key).copied()
    }

    pub fn unlock_height(&self, key: &TxOutputKey) -> Option<u32> {
        self.unlock_heights.get(key).copied()
    }

    // --- Governance ---

    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    pub fn period(&self) -> PeriodService<'_> {
        PeriodService::new(&self.cycles, self.chain_height())
    }

    pub fn params(&self) -> &ParamRegistry {
        &self.params
    }

    pub fn param_value(&self, param: Param, height: u32) -> u64 {
        self.params.value(param, height)
    }

    /// Proposals included into consensus during `cycle`.
    pub fn proposal_events_in_cycle<'a>(
        &'a self,
        cycle: &'a Cycle,
    ) -> impl Iterator<Item = &'a ProposalEvent> {
        self.blocks
            .iter()
            .filter(move |b| cycle.contains(b.height))
            .flat_map(|b| b.state_change_events.iter())
            .filter_map(|e| match e {
                StateChangeEvent::Proposal(event) => Some(event),
                _ => None,
            })
    }

    // --- Mutation, reserved to the parser and period engine ---

    pub(crate) fn add_cycle(&mut self, cycle: Cycle) {
        self.cycles.push(cycle);
    }

    pub(crate) fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub(crate) fn insert_tx(&mut self, tx: Tx) -> Result<(), StateError> {
        if self.txs.contains_key(&tx.id) {
            return Err(StateError::TxAlreadyParsed(tx.id));
        }
        for output in &tx.outputs {
            if output.output_type.is_tracked() {
                self.unspent_tx_outputs.insert(output.key());
            } else if output.output_type == TxOutputType::IssuanceCandidateOutput {
                self.issuance_candidates.insert(output.key());
            }
        }
        self.txs.insert(tx.id, tx);
        Ok(())
    }

    /// Marks a tracked output spent and drops its bond bookkeeping. Returns
    /// false if it was not unspent.
    pub(crate) fn spend_output(&mut self, key: &TxOutputKey, info: SpentInfo) -> bool {
        if !self.unspent_tx_outputs.remove(key) {
            return false;
        }
        self.lock_times.remove(key);
        self.unlock_heights.remove(key);
        self.spent_infos.insert(*key, info);
        true
    }

    pub(crate) fn remove_issuance_candidate(&mut self, key: &TxOutputKey) -> bool {
        self.issuance_candidates.remove(key)
    }

    pub(crate) fn put_burnt_fee(&mut self, tx_id: TxId, fee: u64) {
        if fee > 0 {
            self.burnt_fees.insert(tx_id, fee);
        }
    }

    pub(crate) fn put_lock_time(&mut self, key: TxOutputKey, lock_time: u16) {
        self.lock_times.insert(key, lock_time);
    }

    pub(crate) fn put_unlock_height(&mut self, key: TxOutputKey, height: u32) {
        self.unlock_heights.insert(key, height);
    }

    /// Applies governance events for the block at `height` and returns the
    /// ones that were accepted.
    pub(crate) fn apply_state_change_events(
        &mut self,
        events: Vec<StateChangeEvent>,
        dev_mode: bool,
    ) -> Vec<StateChangeEvent> {
        let mut accepted = Vec::with_capacity(events.len());
        for event in events {
            match &event {
                StateChangeEvent::ParamChange(change) => {
                    match self.params.add_change_event(*change) {
                        Ok(true) => accepted.push(event),
                        Ok(false) => {}
                        Err(e) => report_invariant_violation(dev_mode, &e.to_string()),
                    }
                }
                StateChangeEvent::Issuance(issuance) => {
                    if !self.issuance_candidates.remove(&issuance.output) {
                        warn!(
                            "[STATE] Issuance for {} has no unspent candidate output, skipped.",
                            issuance.output
                        );
                        continue;
                    }
                    self.unspent_tx_outputs.insert(issuance.output);
                    self.issuances.insert(issuance.output, *issuance);
                    accepted.push(event);
                }
                StateChangeEvent::Proposal(_) => accepted.push(event),
            }
        }
        accepted
    }

    /// Replaces the whole state with a snapshot.
    pub fn apply_snapshot(&mut self, snapshot: LedgerState) {
        *self = snapshot;
    }
}
