// src/parser.rs - Block parsing and BSQ output classification

use crate::block::{Block, BlockHash, RawBlock, RawTx};
use crate::config::DaoConfig;
use crate::opreturn::{self, OpReturnType};
use crate::params::Param;
use crate::period::Phase;
use crate::state::{report_invariant_violation, LedgerState, StateChangeEvent};
use crate::transaction::{SpentInfo, Tx, TxId, TxInput, TxOutput, TxOutputKey, TxOutputType, TxType};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Block {height} ({hash}) does not connect to chain head {head_height} ({head_hash})")]
    BlockNotConnecting {
        height: u32,
        hash: BlockHash,
        head_height: u32,
        head_hash: BlockHash,
    },
    #[error("Block {height} is ahead of the chain tip, expected height {expected}")]
    HeightGap { height: u32, expected: u32 },
    #[error("Block {height} is below the genesis height {genesis_height}")]
    BeforeGenesis { height: u32, genesis_height: u32 },
}

/// Supplies governance events for the block being parsed. Called after the
/// block's transactions were classified and before the block is appended.
pub trait StateChangeEventsProvider {
    fn provide_state_change_events(&mut self, block: &Block, state: &LedgerState) -> Vec<StateChangeEvent>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBlock {
    pub block: Block,
    /// False when the block had already been accepted and nothing changed.
    pub is_new: bool,
}

#[derive(Error, Debug)]
enum OpReturnRejection {
    #[error("height {height} is in phase {actual:?} but {required:?} is required")]
    WrongPhase { height: u32, actual: Phase, required: Phase },
    #[error("payload length {actual}, expected {expected}")]
    WrongLength { actual: usize, expected: usize },
    #[error("burnt fee {burnt} is below the required {required}")]
    FeeTooLow { burnt: u64, required: u64 },
    #[error("no {0:?} output")]
    MissingCounterpart(TxOutputType),
    #[error("lock time {lock_time} outside [{min}, {max}]")]
    LockTimeOutOfRange { lock_time: u64, min: u64, max: u64 },
}

/// Per-transaction scratch state shared by the input and output passes.
#[derive(Debug, Default)]
struct TxState {
    available_input_value: u64,
    spent_tracked_output: bool,
    stake_input: Option<TxOutputKey>,
    multiple_stake_inputs: bool,
    spent_lockup_value: Option<u64>,
    unlock_block_height: u32,
    /// Value of BOND_UNLOCK outputs spent before their unlock height.
    burnt_bond_value: u64,
}

pub struct BlockParser {
    dev_mode: bool,
}

impl BlockParser {
    pub fn new(config: &DaoConfig) -> Self {
        Self {
            dev_mode: config.dev_mode,
        }
    }

    /// Classifies all transactions of `raw`, collects governance events from
    /// `providers` and appends the block. Connectivity is checked before any
    /// mutation, so a failed block leaves `state` untouched.
    pub fn process_block(
        &self,
        raw: &RawBlock,
        state: &mut LedgerState,
        providers: &mut [&mut dyn StateChangeEventsProvider],
    ) -> Result<ParsedBlock, ParseError> {
        if let Some(existing) = self.check_connectivity(raw, state)? {
            debug!("[PARSER] Block {} already parsed, ignoring re-delivery.", raw.height);
            return Ok(ParsedBlock {
                block: existing,
                is_new: false,
            });
        }

        state.on_block_start(raw.height);

        let mut block = Block::from_raw(raw);
        for raw_tx in &raw.txs {
            if let Some(tx_id) = self.process_tx(raw_tx, raw.height, raw.time, state) {
                block.tx_ids.push(tx_id);
            }
        }

        let mut events = Vec::new();
        for provider in providers.iter_mut() {
            events.extend(provider.provide_state_change_events(&block, state));
        }
        block.state_change_events = state.apply_state_change_events(events, self.dev_mode);

        info!(
            "[PARSER] Block {} parsed: {} BSQ txs, {} governance events, {} unspent outputs.",
            block.height,
            block.tx_ids.len(),
            block.state_change_events.len(),
            state.unspent_count()
        );
        state.push_block(block.clone());
        Ok(ParsedBlock { block, is_new: true })
    }

    /// `Ok(Some(block))` for an already accepted block, `Ok(None)` if `raw`
    /// extends the chain head.
    fn check_connectivity(&self, raw: &RawBlock, state: &LedgerState) -> Result<Option<Block>, ParseError> {
        let head = match state.last_block() {
            Some(head) => head,
            None => {
                let genesis_height = state.genesis_block_height();
                return match raw.height.cmp(&genesis_height) {
                    std::cmp::Ordering::Equal => Ok(None),
                    std::cmp::Ordering::Less => Err(ParseError::BeforeGenesis {
                        height: raw.height,
                        genesis_height,
                    }),
                    std::cmp::Ordering::Greater => Err(ParseError::HeightGap {
                        height: raw.height,
                        expected: genesis_height,
                    }),
                };
            }
        };

        let not_connecting = || ParseError::BlockNotConnecting {
            height: raw.height,
            hash: raw.hash,
            head_height: head.height,
            head_hash: head.hash,
        };

        if raw.height == head.height + 1 {
            return if raw.prev_hash == head.hash {
                Ok(None)
            } else {
                Err(not_connecting())
            };
        }
        if raw.height > head.height {
            return Err(ParseError::HeightGap {
                height: raw.height,
                expected: head.height + 1,
            });
        }
        match state.block_at_height(raw.height) {
            Some(existing) if existing.hash == raw.hash => Ok(Some(existing.clone())),
            Some(_) => Err(not_connecting()),
            None => Err(ParseError::BeforeGenesis {
                height: raw.height,
                genesis_height: state.genesis_block_height(),
            }),
        }
    }

    /// Returns the tx id if the transaction is relevant for BSQ and was recorded.
    fn process_tx(&self, raw_tx: &RawTx, height: u32, time: u32, state: &mut LedgerState) -> Option<TxId> {
        if raw_tx.id == *state.genesis_tx_id() && height == state.genesis_block_height() {
            return self.process_genesis_tx(raw_tx, height, time, state);
        }

        let mut tx_state = TxState::default();
        let inputs = self.process_inputs(raw_tx, height, state, &mut tx_state);
        if !tx_state.spent_tracked_output {
            return None;
        }

        let (outputs, tx_type, burnt_fee) = self.process_outputs(raw_tx, height, state, &tx_state);
        let tx = Tx {
            id: raw_tx.id,
            block_height: height,
            time,
            inputs,
            outputs,
            tx_type,
        };
        self.commit_tx(tx, burnt_fee, &tx_state, state)
    }

    fn process_genesis_tx(&self, raw_tx: &RawTx, height: u32, time: u32, state: &mut LedgerState) -> Option<TxId> {
        let outputs: Vec<TxOutput> = raw_tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, raw)| TxOutput {
                index: index as u32,
                value: raw.value,
                tx_id: raw_tx.id,
                block_height: height,
                address: raw.address.clone(),
                op_return_data: None,
                output_type: TxOutputType::GenesisOutput,
            })
            .collect();
        let total: u64 = outputs.iter().map(|o| o.value).sum();
        if total != state.genesis_total_supply() {
            warn!(
                "[PARSER] Genesis outputs sum to {} but the configured supply is {}.",
                total,
                state.genesis_total_supply()
            );
        }
        let tx = Tx {
            id: raw_tx.id,
            block_height: height,
            time,
            inputs: raw_tx
                .inputs
                .iter()
                .map(|key| TxInput { connected_output: *key })
                .collect(),
            outputs,
            tx_type: TxType::Genesis,
        };
        info!("[PARSER] Genesis tx {} with {} BSQ.", raw_tx.id, total);
        self.commit_tx(tx, 0, &TxState::default(), state)
    }

    fn process_inputs(
        &self,
        raw_tx: &RawTx,
        height: u32,
        state: &mut LedgerState,
        tx_state: &mut TxState,
    ) -> Vec<TxInput> {
        let mut inputs = Vec::with_capacity(raw_tx.inputs.len());
        for (input_index, key) in raw_tx.inputs.iter().enumerate() {
            inputs.push(TxInput { connected_output: *key });

            let (output_type, value) = match state.unspent_tx_output(key) {
                Some(output) => (output.output_type, output.value),
                None => {
                    if state.remove_issuance_candidate(key) {
                        info!("[PARSER] Issuance candidate {} spent before issuance.", key);
                    }
                    continue;
                }
            };
            tx_state.spent_tracked_output = true;

            match output_type {
                TxOutputType::BlindVoteLockStakeOutput => {
                    if tx_state.stake_input.is_some() {
                        tx_state.multiple_stake_inputs = true;
                    } else {
                        tx_state.stake_input = Some(*key);
                    }
                    tx_state.available_input_value += value;
                }
                TxOutputType::BondLock => {
                    if tx_state.spent_lockup_value.is_none() {
                        let lock_time = state.lock_time(key).unwrap_or(0);
                        tx_state.spent_lockup_value = Some(value);
                        tx_state.unlock_block_height = height + u32::from(lock_time);
                    }
                    tx_state.available_input_value += value;
                }
                TxOutputType::BondUnlock => {
                    let unlock_height = state.unlock_height(key).unwrap_or(0);
                    if height <= unlock_height {
                        warn!(
                            "[PARSER] Bond {} spent at height {} before its unlock height {}, {} BSQ burnt.",
                            key, height, unlock_height, value
                        );
                        tx_state.burnt_bond_value += value;
                    } else {
                        tx_state.available_input_value += value;
                    }
                }
                _ => tx_state.available_input_value += value,
            }

            state.spend_output(
                key,
                SpentInfo {
                    block_height: height,
                    tx_id: raw_tx.id,
                    input_index: input_index as u32,
                },
            );
        }
        inputs
    }

    /// Output classification for the bookkeeping-only outputs at index 0.
    fn counterpart_type(candidate: Option<OpReturnType>, tx_state: &TxState, value: u64) -> TxOutputType {
        match candidate {
            Some(OpReturnType::BlindVote) => TxOutputType::BlindVoteLockStakeOutput,
            Some(OpReturnType::VoteReveal) if tx_state.stake_input.is_some() => {
                TxOutputType::VoteRevealUnlockStakeOutput
            }
            Some(OpReturnType::Lockup) => TxOutputType::BondLock,
            None if tx_state.spent_lockup_value == Some(value) => TxOutputType::BondUnlock,
            _ => TxOutputType::BsqOutput,
        }
    }

    fn process_outputs(
        &self,
        raw_tx: &RawTx,
        height: u32,
        state: &LedgerState,
        tx_state: &TxState,
    ) -> (Vec<TxOutput>, TxType, u64) {
        let last_index = raw_tx.outputs.len().saturating_sub(1);
        let op_return_data = raw_tx.outputs.last().and_then(|o| o.op_return_data());
        let candidate = op_return_data.as_deref().and_then(OpReturnType::from_data);

        let mut types = vec![TxOutputType::Undefined; raw_tx.outputs.len()];
        let mut available = tx_state.available_input_value;
        let mut prohibit_bsq_outputs = false;
        let mut counterpart: Option<usize> = None;

        for (index, output) in raw_tx.outputs.iter().enumerate() {
            if output.is_op_return() {
                // Only a well-formed final OP_RETURN is classified by its payload.
                if index != last_index || op_return_data.is_none() {
                    types[index] = TxOutputType::InvalidOutput;
                }
                continue;
            }
            if index == 1 && candidate == Some(OpReturnType::CompensationRequest) {
                types[index] = TxOutputType::IssuanceCandidateOutput;
                counterpart = Some(index);
                continue;
            }
            if !prohibit_bsq_outputs && available > 0 && output.value <= available {
                available -= output.value;
                types[index] = if index == 0 {
                    Self::counterpart_type(candidate, tx_state, output.value)
                } else {
                    TxOutputType::BsqOutput
                };
                if types[index] != TxOutputType::BsqOutput {
                    counterpart = Some(index);
                }
            } else {
                types[index] = TxOutputType::BtcOutput;
                prohibit_bsq_outputs = true;
            }
        }

        let mut burnt_fee = available;
        let mut tx_type = None;
        let has_op_return = op_return_data.is_some();

        if tx_state.multiple_stake_inputs {
            warn!(
                "[PARSER] Tx {} spends more than one stake output and is invalid.",
                raw_tx.id
            );
            for t in types.iter_mut() {
                *t = TxOutputType::BtcOutput;
            }
            if has_op_return {
                types[last_index] = TxOutputType::InvalidOutput;
            }
            burnt_fee = tx_state.available_input_value;
            tx_type = Some(TxType::Invalid);
        } else if let Some(data) = op_return_data.as_deref() {
            match candidate {
                Some(op_return_type) => {
                    let counterpart_type = counterpart.map(|i| types[i]);
                    match self.validate_op_return(
                        op_return_type,
                        data,
                        height,
                        burnt_fee,
                        counterpart_type,
                        state,
                    ) {
                        Ok(()) => {
                            types[last_index] = op_return_type.output_type();
                            tx_type = Some(op_return_type.tx_type());
                        }
                        Err(reason) => {
                            info!(
                                "[PARSER] Tx {} carries an invalid {:?} payload: {}.",
                                raw_tx.id, op_return_type, reason
                            );
                            types[last_index] = TxOutputType::InvalidOutput;
                            if let Some(i) = counterpart {
                                types[i] = if types[i] == TxOutputType::IssuanceCandidateOutput {
                                    TxOutputType::BtcOutput
                                } else {
                                    TxOutputType::BsqOutput
                                };
                            }
                        }
                    }
                }
                None => {
                    debug!("[PARSER] Tx {} has an unknown OP_RETURN payload.", raw_tx.id);
                    types[last_index] = TxOutputType::InvalidOutput;
                }
            }
        }

        let tx_type = tx_type.unwrap_or_else(|| {
            if types.contains(&TxOutputType::BondUnlock) {
                TxType::Unlock
            } else if burnt_fee == 0 && tx_state.burnt_bond_value == 0 && !types.iter().any(|t| t.is_tracked()) {
                TxType::Irrelevant
            } else if burnt_fee > 0 {
                TxType::PayTradeFee
            } else {
                TxType::TransferBsq
            }
        });

        let outputs = raw_tx
            .outputs
            .iter()
            .zip(types)
            .enumerate()
            .map(|(index, (raw, output_type))| TxOutput {
                index: index as u32,
                value: raw.value,
                tx_id: raw_tx.id,
                block_height: height,
                address: raw.address.clone(),
                op_return_data: raw.op_return_data(),
                output_type,
            })
            .collect();
        (outputs, tx_type, burnt_fee + tx_state.burnt_bond_value)
    }

    /// Validator table keyed by payload type.
    fn validate_op_return(
        &self,
        op_return_type: OpReturnType,
        data: &[u8],
        height: u32,
        burnt_fee: u64,
        counterpart: Option<TxOutputType>,
        state: &LedgerState,
    ) -> Result<(), OpReturnRejection> {
        if let Some(required) = op_return_type.required_phase() {
            let actual = state.period().phase_for_height(height);
            if actual != required {
                return Err(OpReturnRejection::WrongPhase { height, actual, required });
            }
        }

        let expected = op_return_type.expected_len();
        if data.len() != expected {
            return Err(OpReturnRejection::WrongLength {
                actual: data.len(),
                expected,
            });
        }

        if let Some(fee_param) = op_return_type.fee_param() {
            let required = state.param_value(fee_param, height);
            if burnt_fee < required {
                return Err(OpReturnRejection::FeeTooLow { burnt: burnt_fee, required });
            }
        }

        let required_counterpart = match op_return_type {
            OpReturnType::Proposal => None,
            OpReturnType::CompensationRequest => Some(TxOutputType::IssuanceCandidateOutput),
            OpReturnType::BlindVote => Some(TxOutputType::BlindVoteLockStakeOutput),
            OpReturnType::VoteReveal => Some(TxOutputType::VoteRevealUnlockStakeOutput),
            OpReturnType::Lockup => Some(TxOutputType::BondLock),
        };
        if let Some(required) = required_counterpart {
            if counterpart != Some(required) {
                return Err(OpReturnRejection::MissingCounterpart(required));
            }
        }

        if op_return_type == OpReturnType::Lockup {
            let lock_time = u64::from(opreturn::lock_time_of_lockup(data).unwrap_or(0));
            let min = state.param_value(Param::LockTimeMin, height);
            let max = state.param_value(Param::LockTimeMax, height);
            if lock_time < min || lock_time > max {
                return Err(OpReturnRejection::LockTimeOutOfRange { lock_time, min, max });
            }
        }
        Ok(())
    }

    fn commit_tx(&self, tx: Tx, burnt_fee: u64, tx_state: &TxState, state: &mut LedgerState) -> Option<TxId> {
        let tx_id = tx.id;
        let lockup = match tx.tx_type {
            TxType::Lockup => tx.op_return_data().and_then(opreturn::lock_time_of_lockup),
            _ => None,
        };
        let is_unlock = tx.tx_type == TxType::Unlock;
        debug!("[PARSER] Tx {} classified as {:?}, burnt fee {}.", tx_id, tx.tx_type, burnt_fee);

        if let Err(e) = state.insert_tx(tx) {
            report_invariant_violation(self.dev_mode, &e.to_string());
            return None;
        }
        state.put_burnt_fee(tx_id, burnt_fee);
        if let Some(lock_time) = lockup {
            state.put_lock_time(TxOutputKey::new(tx_id, 0), lock_time);
        }
        if is_unlock {
            state.put_unlock_height(TxOutputKey::new(tx_id, 0), tx_state.unlock_block_height);
        }
        Some(tx_id)
    }
}
