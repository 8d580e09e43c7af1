// src/period.rs - Governance calendar: cycles, phases and height queries

use crate::params::{Param, ParamChangeEvent, ParamRegistry, MAX_PHASE_DURATION};
use crate::state::{LedgerState, StateChangeEvent};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Undefined,
    Proposal,
    Break1,
    BlindVote,
    Break2,
    VoteReveal,
    Break3,
}

impl Phase {
    /// Fixed order of the phases inside every cycle.
    pub const ORDERED: [Phase; 6] = [
        Phase::Proposal,
        Phase::Break1,
        Phase::BlindVote,
        Phase::Break2,
        Phase::VoteReveal,
        Phase::Break3,
    ];
}

/// Phase lengths are capped so cycle heights stay far from `u32::MAX`.
fn phase_blocks(value: u64) -> u32 {
    value.min(MAX_PHASE_DURATION) as u32
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDuration {
    pub phase: Phase,
    pub duration: u32,
}

/// One repetition of the phase sequence. Immutable once created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    height_of_first_block: u32,
    phases: Vec<PhaseDuration>,
}

impl Cycle {
    pub fn new(height_of_first_block: u32, phases: Vec<PhaseDuration>) -> Self {
        Self { height_of_first_block, phases }
    }

    /// Builds a cycle from the durations the registry holds at `height`.
    pub fn from_params(height_of_first_block: u32, params: &ParamRegistry, height: u32) -> Self {
        let phases = Phase::ORDERED
            .iter()
            .map(|&phase| {
                let duration = Param::for_phase(phase)
                    .map(|p| params.value(p, height))
                    .unwrap_or(0);
                PhaseDuration {
                    phase,
                    duration: phase_blocks(duration),
                }
            })
            .collect();
        Self::new(height_of_first_block, phases)
    }

    /// A cycle starting at `height_of_first_block` that repeats `previous`'s
    /// durations except where `changes` sets a phase duration.
    pub fn next(previous: &Cycle, height_of_first_block: u32, changes: &[ParamChangeEvent]) -> Self {
        let phases = previous
            .phases
            .iter()
            .map(|pd| {
                let changed = changes
                    .iter()
                    .filter(|c| c.param.phase() == Some(pd.phase))
                    .last()
                    .map(|c| phase_blocks(c.value));
                PhaseDuration {
                    phase: pd.phase,
                    duration: changed.unwrap_or(pd.duration),
                }
            })
            .collect();
        Self::new(height_of_first_block, phases)
    }

    pub fn height_of_first_block(&self) -> u32 {
        self.height_of_first_block
    }

    pub fn duration(&self) -> u32 {
        self.phases
            .iter()
            .fold(0u32, |total, pd| total.saturating_add(pd.duration))
    }

    pub fn height_of_last_block(&self) -> u32 {
        self.height_of_first_block
            .saturating_add(self.duration().max(1) - 1)
    }

    pub fn phases(&self) -> &[PhaseDuration] {
        &self.phases
    }

    pub fn contains(&self, height: u32) -> bool {
        height >= self.height_of_first_block && height <= self.height_of_last_block()
    }

    pub fn duration_of_phase(&self, phase: Phase) -> u32 {
        self.phases
            .iter()
            .find(|pd| pd.phase == phase)
            .map(|pd| pd.duration)
            .unwrap_or(0)
    }

    pub fn first_block_of_phase(&self, phase: Phase) -> Option<u32> {
        let mut start = self.height_of_first_block;
        for pd in &self.phases {
            if pd.phase == phase {
                return Some(start);
            }
            start = start.saturating_add(pd.duration);
        }
        None
    }

    /// For a zero-length phase this is one below its first block.
    pub fn last_block_of_phase(&self, phase: Phase) -> Option<u32> {
        let first = self.first_block_of_phase(phase)?;
        first.saturating_add(self.duration_of_phase(phase)).checked_sub(1)
    }

    pub fn phase_for_height(&self, height: u32) -> Phase {
        if !self.contains(height) {
            return Phase::Undefined;
        }
        let mut start = self.height_of_first_block;
        for pd in &self.phases {
            if height < start.saturating_add(pd.duration) {
                return pd.phase;
            }
            start = start.saturating_add(pd.duration);
        }
        Phase::Undefined
    }
}

/// Read-only queries over the cycle list, evaluated against a chain height.
#[derive(Debug, Clone, Copy)]
pub struct PeriodService<'a> {
    cycles: &'a [Cycle],
    chain_height: u32,
}

impl<'a> PeriodService<'a> {
    pub fn new(cycles: &'a [Cycle], chain_height: u32) -> Self {
        Self { cycles, chain_height }
    }

    pub fn chain_height(&self) -> u32 {
        self.chain_height
    }

    pub fn cycle(&self, height: u32) -> Option<&'a Cycle> {
        self.cycles.iter().rev().find(|c| c.contains(height))
    }

    pub fn current_cycle(&self) -> Option<&'a Cycle> {
        self.cycle(self.chain_height)
    }

    pub fn cycle_index(&self, cycle: &Cycle) -> Option<usize> {
        self.cycles.iter().position(|c| c == cycle)
    }

    pub fn current_phase(&self) -> Phase {
        self.phase_for_height(self.chain_height)
    }

    pub fn phase_for_height(&self, height: u32) -> Phase {
        self.cycle(height)
            .map(|c| c.phase_for_height(height))
            .unwrap_or(Phase::Undefined)
    }

    pub fn is_in_phase(&self, height: u32, phase: Phase) -> bool {
        self.phase_for_height(height) == phase
    }

    pub fn is_first_block_in_cycle(&self, height: u32) -> bool {
        self.cycle(height)
            .map(|c| c.height_of_first_block() == height)
            .unwrap_or(false)
    }

    pub fn is_last_block_in_cycle(&self, height: u32) -> bool {
        self.cycle(height)
            .map(|c| c.height_of_last_block() == height)
            .unwrap_or(false)
    }

    /// True while the chain head has not yet left the cycle of the tx.
    pub fn is_tx_in_correct_cycle(&self, tx_height: u32, chain_head_height: u32) -> bool {
        self.cycle(tx_height)
            .map(|c| chain_head_height <= c.height_of_last_block())
            .unwrap_or(false)
    }

    pub fn is_tx_in_past_cycle(&self, tx_height: u32, chain_head_height: u32) -> bool {
        self.cycle(tx_height)
            .map(|c| chain_head_height > c.height_of_last_block())
            .unwrap_or(false)
    }

    pub fn duration_for_phase(&self, phase: Phase, height: u32) -> u32 {
        self.cycle(height)
            .map(|c| c.duration_of_phase(phase))
            .unwrap_or(0)
    }

    pub fn first_block_of_phase(&self, height: u32, phase: Phase) -> Option<u32> {
        self.cycle(height).and_then(|c| c.first_block_of_phase(phase))
    }

    pub fn last_block_of_phase(&self, height: u32, phase: Phase) -> Option<u32> {
        self.cycle(height).and_then(|c| c.last_block_of_phase(phase))
    }

    pub fn is_first_block_of_phase(&self, height: u32, phase: Phase) -> bool {
        self.first_block_of_phase(height, phase) == Some(height)
    }

    pub fn is_last_block_of_phase(&self, height: u32, phase: Phase) -> bool {
        self.last_block_of_phase(height, phase) == Some(height)
    }
}

impl LedgerState {
    /// Opens a new cycle when `height` is the first height after the last
    /// cycle. Phase-duration changes attached to the preceding block are
    /// applied to the new cycle. Returns true if a cycle was added.
    pub fn on_block_start(&mut self, height: u32) -> bool {
        let previous = match self.cycles().last() {
            Some(cycle) => cycle.clone(),
            None => {
                let genesis = Cycle::from_params(height, self.params(), height);
                info!("[PERIOD] Genesis cycle starts at height {}.", height);
                self.add_cycle(genesis);
                return true;
            }
        };
        if previous.height_of_last_block().checked_add(1) != Some(height) {
            return false;
        }
        let changes: Vec<ParamChangeEvent> = self
            .last_block()
            .map(|b| {
                b.state_change_events
                    .iter()
                    .filter_map(|e| match e {
                        StateChangeEvent::ParamChange(change) => Some(*change),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let cycle = Cycle::next(&previous, height, &changes);
        info!(
            "[PERIOD] New cycle at height {} lasting {} blocks.",
            height,
            cycle.duration()
        );
        self.add_cycle(cycle);
        true
    }
}
