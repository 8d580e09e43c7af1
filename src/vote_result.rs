// src/vote_result.rs - Tallying revealed votes at the end of a cycle

use crate::blind_vote::{BlindVoteService, BlindVoteValidator};
use crate::block::Block;
use crate::crypto;
use crate::governance::{Ballot, Vote};
use crate::opreturn::{self, HASH_LENGTH};
use crate::params::{Param, ParamChangeEvent, BPS_MAX};
use crate::parser::StateChangeEventsProvider;
use crate::period::Cycle;
use crate::proposal::{Proposal, ProposalPayload};
use crate::state::{Issuance, LedgerState, StateChangeEvent};
use crate::transaction::{Tx, TxId, TxOutputKey, TxOutputType, TxType};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// A reveal tx found in the cycle together with the stake it unlocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedVote {
    pub reveal_tx_id: TxId,
    pub blind_vote_tx_id: TxId,
    pub stake: u64,
    pub blind_vote_list_hash: [u8; HASH_LENGTH],
    pub secret_key: crypto::SecretKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedProposal {
    pub proposal: Proposal,
    pub accepted_stake: u64,
    pub rejected_stake: u64,
    pub is_accepted: bool,
}

impl EvaluatedProposal {
    pub fn total_stake(&self) -> u64 {
        self.accepted_stake + self.rejected_stake
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    pub cycle_start: u32,
    pub height: u32,
    pub majority_hash: Option<[u8; HASH_LENGTH]>,
    pub evaluated: Vec<EvaluatedProposal>,
}

/// Passing requires the quorum and an accepted share strictly above the threshold.
pub fn is_accepted(accepted: u64, rejected: u64, quorum: u64, threshold_bps: u64) -> bool {
    let total = u128::from(accepted) + u128::from(rejected);
    total > 0 && total >= u128::from(quorum) && u128::from(accepted) * u128::from(BPS_MAX) > total * u128::from(threshold_bps)
}

/// Digest backed by the most stake. Ties go to the smallest digest.
pub fn majority_hash(reveals: &[RevealedVote]) -> Option<[u8; HASH_LENGTH]> {
    let mut stake_by_hash: BTreeMap<[u8; HASH_LENGTH], u64> = BTreeMap::new();
    for reveal in reveals {
        *stake_by_hash.entry(reveal.blind_vote_list_hash).or_insert(0) += reveal.stake;
    }
    let mut best: Option<([u8; HASH_LENGTH], u64)> = None;
    for (hash, stake) in stake_by_hash {
        if best.map(|(_, s)| stake > s).unwrap_or(true) {
            best = Some((hash, stake));
        }
    }
    best.map(|(hash, _)| hash)
}

#[derive(Debug, Default)]
pub struct VoteResultService {
    results: Vec<CycleResult>,
}

impl VoteResultService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[CycleResult] {
        &self.results
    }

    pub fn result_of_cycle(&self, cycle_start: u32) -> Option<&CycleResult> {
        self.results.iter().find(|r| r.cycle_start == cycle_start)
    }

    /// Reveal txs of `cycle` up to and including `block`, which is not yet appended.
    fn revealed_votes(cycle: &Cycle, block: &Block, state: &LedgerState) -> Vec<RevealedVote> {
        let earlier = state.txs_in_range(cycle.height_of_first_block(), block.height.saturating_sub(1));
        let current = block.tx_ids.iter().filter_map(|id| state.tx(id));
        earlier
            .chain(current)
            .filter(|tx| tx.tx_type == TxType::VoteReveal && cycle.contains(tx.block_height))
            .filter_map(|tx| Self::revealed_vote(tx, state))
            .collect()
    }

    fn revealed_vote(tx: &Tx, state: &LedgerState) -> Option<RevealedVote> {
        let stake_input = tx
            .inputs
            .iter()
            .map(|i| i.connected_output)
            .find(|key| state.tx_output_type(key) == Some(TxOutputType::BlindVoteLockStakeOutput))?;
        let stake = state.tx_output(&stake_input)?.value;
        let data = tx.op_return_data()?;
        Some(RevealedVote {
            reveal_tx_id: tx.id,
            blind_vote_tx_id: stake_input.tx_id,
            stake,
            blind_vote_list_hash: opreturn::hash_of(data)?,
            secret_key: opreturn::secret_key_of_vote_reveal(data)?,
        })
    }

    /// Decrypted ballots of a reveal, or `None` if its blind vote is unknown
    /// or does not match the on-chain commitment.
    fn decrypt_ballots(
        reveal: &RevealedVote,
        blind_votes: &BlindVoteService,
        state: &LedgerState,
        height: u32,
    ) -> Option<Vec<Ballot>> {
        let blind_vote = match blind_votes.find(&reveal.blind_vote_tx_id) {
            Some(bv) => bv,
            None => {
                warn!("[TALLY] Blind vote {} was never received, reveal ignored.", reveal.blind_vote_tx_id);
                return None;
            }
        };
        if let Err(e) = BlindVoteValidator::validate_tx(blind_vote, state, height) {
            warn!("[TALLY] Blind vote {} invalid: {}", reveal.blind_vote_tx_id, e);
            return None;
        }
        let plaintext = match crypto::decrypt(&reveal.secret_key, &blind_vote.encrypted_votes) {
            Ok(p) => p,
            Err(e) => {
                warn!("[TALLY] Could not decrypt blind vote {}: {}", reveal.blind_vote_tx_id, e);
                return None;
            }
        };
        match bincode::deserialize::<Vec<Ballot>>(&plaintext) {
            Ok(ballots) => Some(ballots),
            Err(e) => {
                warn!("[TALLY] Malformed ballot list in {}: {}", reveal.blind_vote_tx_id, e);
                None
            }
        }
    }

    /// Counts the revealed votes of the cycle ending at `block` and returns the
    /// events of the accepted proposals.
    pub fn tally(&mut self, block: &Block, state: &LedgerState, blind_votes: &BlindVoteService) -> Vec<StateChangeEvent> {
        let height = block.height;
        let cycle = match state.period().cycle(height) {
            Some(cycle) if cycle.height_of_last_block() == height => cycle,
            _ => return Vec::new(),
        };

        let mut evaluated: Vec<EvaluatedProposal> = state
            .proposal_events_in_cycle(cycle)
            .map(|event| EvaluatedProposal {
                proposal: event.proposal.clone(),
                accepted_stake: 0,
                rejected_stake: 0,
                is_accepted: false,
            })
            .collect();
        evaluated.sort_by(|a, b| a.proposal.tx_id.cmp(&b.proposal.tx_id));

        let reveals = Self::revealed_votes(cycle, block, state);
        let majority = majority_hash(&reveals);
        info!(
            "[TALLY] Cycle {}: {} proposals, {} reveals.",
            cycle.height_of_first_block(),
            evaluated.len(),
            reveals.len()
        );

        for reveal in reveals.iter().filter(|r| Some(r.blind_vote_list_hash) == majority) {
            let ballots = match Self::decrypt_ballots(reveal, blind_votes, state, height) {
                Some(ballots) => ballots,
                None => continue,
            };
            let stake = blind_votes
                .find(&reveal.blind_vote_tx_id)
                .map(|bv| bv.stake)
                .unwrap_or(reveal.stake);
            for ballot in ballots {
                let entry = evaluated
                    .iter_mut()
                    .find(|e| e.proposal.uid == ballot.proposal.uid && e.proposal.tx_id == ballot.proposal.tx_id);
                match (entry, ballot.vote) {
                    (Some(e), Some(Vote::Accept)) => e.accepted_stake += stake,
                    (Some(e), Some(Vote::Reject)) => e.rejected_stake += stake,
                    _ => {}
                }
            }
        }
        let skipped = reveals.iter().filter(|r| Some(r.blind_vote_list_hash) != majority).count();
        if skipped > 0 {
            debug!("[TALLY] {} reveals ignored for not matching the majority hash.", skipped);
        }

        let quorum = state.param_value(Param::Quorum, height);
        let threshold = state.param_value(Param::Threshold, height);
        let mut events = Vec::new();
        let mut changed: BTreeMap<Param, u64> = BTreeMap::new();
        for e in evaluated.iter_mut() {
            e.is_accepted = is_accepted(e.accepted_stake, e.rejected_stake, quorum, threshold);
            if !e.is_accepted {
                continue;
            }
            info!(
                "[TALLY] Proposal {} '{}' accepted with {} of {} stake.",
                e.proposal.uid,
                e.proposal.name,
                e.accepted_stake,
                e.total_stake()
            );
            if let Some(event) = Self::event_for(&e.proposal, height, state, &mut changed) {
                events.push(event);
            }
        }

        let result = CycleResult {
            cycle_start: cycle.height_of_first_block(),
            height,
            majority_hash: majority,
            evaluated,
        };
        self.results.retain(|r| r.cycle_start != result.cycle_start);
        self.results.push(result);
        events
    }

    fn event_for(
        proposal: &Proposal,
        height: u32,
        state: &LedgerState,
        changed: &mut BTreeMap<Param, u64>,
    ) -> Option<StateChangeEvent> {
        match &proposal.payload {
            ProposalPayload::Generic => None,
            ProposalPayload::Compensation { requested_bsq, .. } => {
                let output = TxOutputKey::new(proposal.tx_id?, 1);
                if !state.is_issuance_candidate(&output) {
                    warn!("[TALLY] Issuance candidate {} is gone, no issuance.", output);
                    return None;
                }
                Some(StateChangeEvent::Issuance(Issuance {
                    output,
                    height,
                    amount: *requested_bsq,
                }))
            }
            ProposalPayload::ChangeParam { param, value } => {
                if let Err(e) = param.validate_value(*value) {
                    warn!("[TALLY] Accepted change of {:?} refused: {}", param, e);
                    return None;
                }
                if let Some(existing) = changed.get(param) {
                    warn!(
                        "[TALLY] {:?} already changed to {} in this cycle, {} ignored.",
                        param, existing, value
                    );
                    return None;
                }
                changed.insert(*param, *value);
                Some(StateChangeEvent::ParamChange(ParamChangeEvent {
                    param: *param,
                    value: *value,
                    height,
                }))
            }
        }
    }
}

/// Hands the tally to the parser together with the blind votes it needs.
pub struct VoteResultProvider<'a> {
    pub service: &'a mut VoteResultService,
    pub blind_votes: &'a BlindVoteService,
}

impl StateChangeEventsProvider for VoteResultProvider<'_> {
    fn provide_state_change_events(&mut self, block: &Block, state: &LedgerState) -> Vec<StateChangeEvent> {
        if !state.period().is_last_block_in_cycle(block.height) {
            return Vec::new();
        }
        self.service.tally(block, state, self.blind_votes)
    }
}
