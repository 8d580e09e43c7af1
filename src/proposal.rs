// src/proposal.rs - Proposals, their validation and the local ballot list

use crate::block::Block;
use crate::crypto::{self, CryptoError};
use crate::governance::{sort_ballots, Ballot, GovernanceError, ValidationError, Vote};
use crate::opreturn::{self, OpReturnType, HASH_LENGTH};
use crate::p2p::{NetworkPayload, Transport};
use crate::params::{Param, ParamRegistry};
use crate::parser::StateChangeEventsProvider;
use crate::period::Phase;
use crate::state::{report_invariant_violation, LedgerState, ProposalEvent, StateChangeEvent};
use crate::storage::DaoStore;
use crate::transaction::{TxId, TxType};
use crate::wallet::{BroadcastCallback, BroadcastContext, BroadcastReport, TxBroadcaster, TxPurpose, TxRequest, WalletService};
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ProposalPayload {
    Generic,
    Compensation { requested_bsq: u64, bsq_address: String },
    ChangeParam { param: Param, value: u64 },
}

/// An immutable governance request. `tx_id` is set once its fee tx was built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub uid: String,
    pub name: String,
    pub link: String,
    pub payload: ProposalPayload,
    pub tx_id: Option<TxId>,
}

#[derive(Serialize)]
struct ProposalPreimage<'a> {
    uid: &'a str,
    name: &'a str,
    link: &'a str,
    payload: &'a ProposalPayload,
}

impl Proposal {
    pub fn new(name: impl Into<String>, link: impl Into<String>, payload: ProposalPayload) -> Self {
        let mut uid = [0u8; 16];
        OsRng.fill_bytes(&mut uid);
        Self {
            uid: uid.iter().map(|b| format!("{:02x}", b)).collect(),
            name: name.into(),
            link: link.into(),
            payload,
            tx_id: None,
        }
    }

    pub fn with_tx_id(mut self, tx_id: TxId) -> Self {
        self.tx_id = Some(tx_id);
        self
    }

    /// Digest committed to in the proposal tx. Excludes the tx id.
    pub fn hash(&self) -> Result<[u8; HASH_LENGTH], CryptoError> {
        crypto::hash_of_serialized(&ProposalPreimage {
            uid: &self.uid,
            name: &self.name,
            link: &self.link,
            payload: &self.payload,
        })
    }

    pub fn op_return_type(&self) -> OpReturnType {
        match self.payload {
            ProposalPayload::Compensation { .. } => OpReturnType::CompensationRequest,
            _ => OpReturnType::Proposal,
        }
    }

    pub fn tx_type(&self) -> TxType {
        self.op_return_type().tx_type()
    }

    pub fn op_return_data(&self) -> Result<Vec<u8>, CryptoError> {
        let hash = self.hash()?;
        Ok(match self.op_return_type() {
            OpReturnType::CompensationRequest => opreturn::compensation_request_data(&hash),
            _ => opreturn::proposal_data(&hash),
        })
    }
}

/// Stateless checks applied to proposals from the network and before inclusion.
pub struct ProposalValidator;

impl ProposalValidator {
    /// Per-payload rules that do not depend on the chain.
    pub fn validate_data_fields(proposal: &Proposal, params: &ParamRegistry, height: u32) -> Result<(), ValidationError> {
        if proposal.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if proposal.link.trim().is_empty() {
            return Err(ValidationError::EmptyLink);
        }
        match &proposal.payload {
            ProposalPayload::Generic => {}
            ProposalPayload::Compensation { requested_bsq, bsq_address } => {
                if bsq_address.trim().is_empty() {
                    return Err(ValidationError::EmptyAddress);
                }
                let min = params.value(Param::CompensationRequestMin, height);
                let max = params.value(Param::CompensationRequestMax, height);
                if *requested_bsq < min || *requested_bsq > max {
                    return Err(ValidationError::RequestOutOfRange {
                        requested: *requested_bsq,
                        min,
                        max,
                    });
                }
            }
            ProposalPayload::ChangeParam { param, value } => param.validate_value(*value)?,
        }
        Ok(())
    }

    /// Chain checks for a proposal whose tx is confirmed, evaluated as of
    /// `chain_height`. `Ok(false)` means the tx is not confirmed yet.
    pub fn validate_tx(proposal: &Proposal, state: &LedgerState, chain_height: u32) -> Result<bool, ValidationError> {
        let tx_id = proposal.tx_id.ok_or(ValidationError::MissingTxId)?;
        let tx = match state.tx(&tx_id) {
            Some(tx) => tx,
            None => return Ok(false),
        };
        let expected = proposal.tx_type();
        if tx.tx_type != expected {
            return Err(ValidationError::WrongTxType {
                tx_id,
                actual: tx.tx_type,
                expected,
            });
        }
        let period = state.period();
        if !period.is_tx_in_correct_cycle(tx.block_height, chain_height) {
            return Err(ValidationError::WrongCycle(tx_id));
        }
        let phase = period.phase_for_height(tx.block_height);
        if phase != Phase::Proposal {
            return Err(ValidationError::WrongPhase {
                tx_id,
                actual: phase,
                expected: Phase::Proposal,
            });
        }
        let committed = tx.op_return_data().and_then(opreturn::hash_of);
        let matches = proposal.hash().map(|h| Some(h) == committed).unwrap_or(false);
        if !matches {
            return Err(ValidationError::HashMismatch(tx_id));
        }
        Ok(true)
    }

    pub fn is_valid_or_unconfirmed(proposal: &Proposal, state: &LedgerState, chain_height: u32) -> bool {
        Self::validate_data_fields(proposal, state.params(), chain_height).is_ok()
            && Self::validate_tx(proposal, state, chain_height).is_ok()
    }

    pub fn is_valid_and_confirmed(proposal: &Proposal, state: &LedgerState, chain_height: u32) -> bool {
        Self::validate_data_fields(proposal, state.params(), chain_height).is_ok()
            && matches!(Self::validate_tx(proposal, state, chain_height), Ok(true))
    }
}

/// Collects proposals into the local ballot list and folds them into
/// consensus at the last block of BREAK1.
pub struct ProposalService {
    ballots: Vec<Ballot>,
    store: DaoStore,
}

impl ProposalService {
    pub fn new(store: DaoStore) -> Result<Self, GovernanceError> {
        let ballots = store.load_ballots()?;
        Ok(Self { ballots, store })
    }

    pub fn ballots(&self) -> &[Ballot] {
        &self.ballots
    }

    pub fn ballot(&self, uid: &str) -> Option<&Ballot> {
        self.ballots.iter().find(|b| b.proposal.uid == uid)
    }

    /// Ballots whose proposal tx is confirmed in the PROPOSAL phase of the
    /// cycle `chain_height` belongs to, sorted by tx id.
    pub fn valid_ballots_of_cycle(&self, state: &LedgerState, chain_height: u32) -> Vec<Ballot> {
        let mut ballots: Vec<Ballot> = self
            .ballots
            .iter()
            .filter(|b| ProposalValidator::is_valid_and_confirmed(&b.proposal, state, chain_height))
            .cloned()
            .collect();
        sort_ballots(&mut ballots);
        ballots
    }

    /// Accepts a proposal received from the network while the chain is
    /// before the last block of BREAK1. Returns true if it was added.
    pub fn on_proposal_received(&mut self, proposal: Proposal, state: &LedgerState) -> bool {
        if self.ballot(&proposal.uid).is_some() {
            return false;
        }
        let height = state.chain_height();
        let last_tolerated = state.period().last_block_of_phase(height, Phase::Break1);
        if !matches!(last_tolerated, Some(last) if height < last) {
            warn!(
                "[VOTE] Proposal {} received at height {} after the last tolerated height {:?}, rejected.",
                proposal.uid, height, last_tolerated
            );
            return false;
        }
        if !ProposalValidator::is_valid_or_unconfirmed(&proposal, state, height) {
            warn!("[VOTE] Proposal {} failed validation, dropped.", proposal.uid);
            return false;
        }
        info!("[VOTE] Proposal {} '{}' added to ballots.", proposal.uid, proposal.name);
        self.ballots.push(Ballot::new(proposal));
        self.persist();
        true
    }

    /// Drops a withdrawn proposal while its tx is unconfirmed or confirmed in
    /// the PROPOSAL phase of the current cycle. Later removals are refused.
    pub fn on_proposal_removed(&mut self, proposal: &Proposal, state: &LedgerState, dev_mode: bool) -> bool {
        let position = match self.ballots.iter().position(|b| b.proposal.uid == proposal.uid) {
            Some(position) => position,
            None => return false,
        };
        let chain_height = state.chain_height();
        let period = state.period();
        let removable = match self.ballots[position].proposal.tx_id.and_then(|tx_id| state.tx(&tx_id)) {
            None => true,
            Some(tx) => {
                period.is_in_phase(tx.block_height, Phase::Proposal)
                    && period.is_tx_in_correct_cycle(tx.block_height, chain_height)
            }
        };
        if !removable {
            report_invariant_violation(
                dev_mode,
                &format!(
                    "Removal of proposal {} at height {} is outside of its PROPOSAL phase, ignored",
                    proposal.uid, chain_height
                ),
            );
            return false;
        }
        info!("[VOTE] Proposal {} removed from ballots.", proposal.uid);
        self.ballots.remove(position);
        self.persist();
        true
    }

    pub fn set_vote(&mut self, uid: &str, vote: Option<Vote>) -> Result<(), GovernanceError> {
        let ballot = self
            .ballots
            .iter_mut()
            .find(|b| b.proposal.uid == uid)
            .ok_or_else(|| GovernanceError::BallotNotFound(uid.to_string()))?;
        ballot.vote = vote;
        self.store.save_ballots(&self.ballots)?;
        Ok(())
    }

    /// Builds and broadcasts the fee tx of `proposal`. The proposal is only
    /// published once the broadcast succeeds.
    pub fn publish_proposal(
        &self,
        proposal: Proposal,
        state: &LedgerState,
        wallet: &dyn WalletService,
        broadcaster: &dyn TxBroadcaster,
        reports: &mpsc::UnboundedSender<BroadcastReport>,
    ) -> Result<TxId, GovernanceError> {
        let height = state.chain_height();
        let phase = state.period().phase_for_height(height);
        if phase != Phase::Proposal {
            return Err(GovernanceError::WrongPhase {
                expected: Phase::Proposal,
                actual: phase,
            });
        }
        ProposalValidator::validate_data_fields(&proposal, state.params(), height)?;

        let fee = state.param_value(Param::ProposalFee, height);
        let purpose = match &proposal.payload {
            ProposalPayload::Compensation { requested_bsq, bsq_address } => TxPurpose::CompensationRequest {
                fee,
                requested_bsq: *requested_bsq,
                bsq_address: bsq_address.clone(),
            },
            _ => TxPurpose::Proposal { fee },
        };
        let request = TxRequest {
            purpose,
            op_return_data: proposal.op_return_data()?,
        };
        let signed = wallet.prepare_and_sign_tx(&request)?;
        let tx_id = signed.tx_id;
        let proposal = proposal.with_tx_id(tx_id);
        info!("[VOTE] Broadcasting proposal {} in tx {}.", proposal.uid, tx_id);
        broadcaster.broadcast(
            signed,
            BroadcastCallback::new(tx_id, BroadcastContext::Proposal(proposal), reports.clone()),
        );
        Ok(tx_id)
    }

    /// Keeps our own proposal and hands it to the network after its tx was broadcast.
    pub fn on_proposal_published(&mut self, proposal: Proposal, transport: &dyn Transport) {
        let tx_id = match proposal.tx_id {
            Some(tx_id) => tx_id,
            None => return,
        };
        if !transport.publish(NetworkPayload::Proposal(proposal.clone()), tx_id) {
            warn!("[VOTE] Proposal {} could not be published to peers.", proposal.uid);
        }
        if self.ballot(&proposal.uid).is_none() {
            self.ballots.push(Ballot::new(proposal));
            self.persist();
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save_ballots(&self.ballots) {
            warn!("[VOTE] Failed to persist ballots: {}", e);
        }
    }
}

impl StateChangeEventsProvider for ProposalService {
    fn provide_state_change_events(&mut self, block: &Block, state: &LedgerState) -> Vec<StateChangeEvent> {
        let height = block.height;
        if !state.period().is_last_block_of_phase(height, Phase::Break1) {
            return Vec::new();
        }
        let mut events: Vec<StateChangeEvent> = Vec::new();
        let mut included: Vec<&str> = Vec::new();
        for ballot in &self.ballots {
            let proposal = &ballot.proposal;
            if included.contains(&proposal.uid.as_str()) {
                continue;
            }
            if ProposalValidator::is_valid_and_confirmed(proposal, state, height) {
                included.push(&proposal.uid);
                events.push(StateChangeEvent::Proposal(ProposalEvent {
                    proposal: proposal.clone(),
                    height,
                }));
            }
        }
        info!("[VOTE] {} proposals included at height {}.", events.len(), height);
        events
    }
}
