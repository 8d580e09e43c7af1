// src/params.rs

use crate::period::Phase;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Basis points denominator used by `Param::Threshold`.
pub const BPS_MAX: u64 = 10_000;
/// Upper bound for a single phase, roughly two years of blocks.
pub const MAX_PHASE_DURATION: u64 = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("Conflicting value for {param:?} at height {height}: existing {existing}, rejected {rejected}")]
    ConflictingValue {
        param: Param,
        height: u32,
        existing: u64,
        rejected: u64,
    },
    #[error("Invalid value {value} for parameter {param:?}. Constraint violated: {reason}")]
    InvalidValue {
        param: Param,
        value: u64,
        reason: String,
    },
}

/// Every governance-tunable value. Amounts are in BSQ base units (1 BSQ = 100),
/// durations in blocks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    ProposalFee,
    BlindVoteFee,
    CompensationRequestMin,
    CompensationRequestMax,
    Quorum,
    Threshold,
    LockTimeMin,
    LockTimeMax,
    PhaseProposal,
    PhaseBreak1,
    PhaseBlindVote,
    PhaseBreak2,
    PhaseVoteReveal,
    PhaseBreak3,
}

impl Param {
    pub const ALL: [Param; 14] = [
        Param::ProposalFee,
        Param::BlindVoteFee,
        Param::CompensationRequestMin,
        Param::CompensationRequestMax,
        Param::Quorum,
        Param::Threshold,
        Param::LockTimeMin,
        Param::LockTimeMax,
        Param::PhaseProposal,
        Param::PhaseBreak1,
        Param::PhaseBlindVote,
        Param::PhaseBreak2,
        Param::PhaseVoteReveal,
        Param::PhaseBreak3,
    ];

    pub fn default_value(self) -> u64 {
        match self {
            Param::ProposalFee => 200,
            Param::BlindVoteFee => 200,
            Param::CompensationRequestMin => 1_000,
            Param::CompensationRequestMax => 10_000_000,
            Param::Quorum => 100_000,
            Param::Threshold => 5_000,
            Param::LockTimeMin => 6,
            Param::LockTimeMax => 50_000,
            Param::PhaseProposal => 3_600,
            Param::PhaseBreak1 => 150,
            Param::PhaseBlindVote => 600,
            Param::PhaseBreak2 => 10,
            Param::PhaseVoteReveal => 300,
            Param::PhaseBreak3 => 10,
        }
    }

    /// The phase whose duration this parameter controls, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Param::PhaseProposal => Some(Phase::Proposal),
            Param::PhaseBreak1 => Some(Phase::Break1),
            Param::PhaseBlindVote => Some(Phase::BlindVote),
            Param::PhaseBreak2 => Some(Phase::Break2),
            Param::PhaseVoteReveal => Some(Phase::VoteReveal),
            Param::PhaseBreak3 => Some(Phase::Break3),
            _ => None,
        }
    }

    pub fn for_phase(phase: Phase) -> Option<Param> {
        Param::ALL.iter().copied().find(|p| p.phase() == Some(phase))
    }

    /// Per-parameter constraint table, applied to proposed changes.
    pub fn validate_value(self, value: u64) -> Result<(), ParamError> {
        let invalid = |reason: &str| {
            Err(ParamError::InvalidValue {
                param: self,
                value,
                reason: reason.to_string(),
            })
        };
        match self {
            _ if self.phase().is_some() => {
                if value == 0 || value > MAX_PHASE_DURATION {
                    return invalid("phase duration must be between 1 and 100000 blocks");
                }
            }
            Param::Threshold => {
                if value == 0 || value > BPS_MAX {
                    return invalid("must be between 1 and 10000 basis points");
                }
            }
            Param::LockTimeMin | Param::LockTimeMax => {
                if value == 0 || value > u64::from(u16::MAX) {
                    return invalid("lock time must fit in 16 bits and be positive");
                }
            }
            _ => {
                if value == 0 {
                    return invalid("must be positive");
                }
            }
        }
        Ok(())
    }
}

/// An accepted change of a parameter, effective from `height` on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamChangeEvent {
    pub param: Param,
    pub value: u64,
    pub height: u32,
}

/// Default values plus the height-ordered log of accepted changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamRegistry {
    overrides: BTreeMap<Param, u64>,
    changes: BTreeMap<Param, Vec<ParamChangeEvent>>,
}

impl ParamRegistry {
    /// `overrides` replaces the built-in default of the listed parameters.
    pub fn new(overrides: BTreeMap<Param, u64>) -> Self {
        Self {
            overrides,
            changes: BTreeMap::new(),
        }
    }

    pub fn default_value(&self, param: Param) -> u64 {
        self.overrides
            .get(&param)
            .copied()
            .unwrap_or_else(|| param.default_value())
    }

    /// Value of the most recent change at or below `height`, else the default.
    pub fn value(&self, param: Param, height: u32) -> u64 {
        self.changes
            .get(&param)
            .and_then(|events| events.iter().rev().find(|e| e.height <= height))
            .map(|e| e.value)
            .unwrap_or_else(|| self.default_value(param))
    }

    /// Records a change. Returns `Ok(false)` for an exact duplicate, which is
    /// ignored. A different value at an already-used height is rejected and
    /// the first value stays authoritative.
    pub fn add_change_event(&mut self, event: ParamChangeEvent) -> Result<bool, ParamError> {
        let events = self.changes.entry(event.param).or_default();
        if let Some(existing) = events.iter().find(|e| e.height == event.height) {
            if existing.value == event.value {
                warn!(
                    "[PARAMS] Duplicate change event for {:?} at height {} ignored.",
                    event.param, event.height
                );
                return Ok(false);
            }
            return Err(ParamError::ConflictingValue {
                param: event.param,
                height: event.height,
                existing: existing.value,
                rejected: event.value,
            });
        }
        let position = events
            .iter()
            .position(|e| e.height > event.height)
            .unwrap_or(events.len());
        events.insert(position, event);
        Ok(true)
    }

    pub fn change_events(&self, param: Param) -> &[ParamChangeEvent] {
        self.changes.get(&param).map(Vec::as_slice).unwrap_or(&[])
    }
}
