// src/my_vote.rs - Casting the local voter's blind vote

use crate::blind_vote::{BlindVote, BlindVoteService};
use crate::crypto::{self, SecretKey};
use crate::governance::{sort_ballots, Ballot, GovernanceError, GovernanceException};
use crate::opreturn;
use crate::p2p::{NetworkPayload, Transport};
use crate::params::Param;
use crate::period::Phase;
use crate::proposal::ProposalService;
use crate::state::LedgerState;
use crate::storage::DaoStore;
use crate::transaction::TxId;
use crate::wallet::{
    BroadcastCallback, BroadcastContext, BroadcastError, BroadcastReport, TxBroadcaster, TxPurpose, TxRequest,
    WalletService,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Peers required before our own blind votes are pushed again.
const MIN_PEERS_FOR_REPUBLISH: usize = 4;

/// The secret half of a cast vote. Only this record can reveal it later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MyVote {
    pub height: u32,
    pub ballots: Vec<Ballot>,
    pub secret_key: SecretKey,
    pub blind_vote: BlindVote,
    pub reveal_tx_id: Option<TxId>,
}

impl MyVote {
    pub fn tx_id(&self) -> TxId {
        self.blind_vote.tx_id
    }
}

/// A blind vote whose tx is being broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBlindVote {
    pub height: u32,
    pub ballots: Vec<Ballot>,
    pub secret_key: SecretKey,
    pub blind_vote: BlindVote,
}

pub struct MyBlindVoteService {
    my_votes: Vec<MyVote>,
    store: DaoStore,
    /// Cycle start height and sorted proposal uids taken at the first block of BLIND_VOTE.
    ballot_snapshot: Option<(u32, Vec<String>)>,
    /// Cycle start height of a blind vote still being broadcast.
    pending_cycle: Option<u32>,
    exceptions: Vec<GovernanceException>,
}

impl MyBlindVoteService {
    pub fn new(store: DaoStore) -> Result<Self, GovernanceError> {
        let my_votes = store.load_my_votes()?;
        Ok(Self {
            my_votes,
            store,
            ballot_snapshot: None,
            pending_cycle: None,
            exceptions: Vec::new(),
        })
    }

    pub fn my_votes(&self) -> &[MyVote] {
        &self.my_votes
    }

    pub fn exceptions(&self) -> &[GovernanceException] {
        &self.exceptions
    }

    /// Takes the ballot snapshot at the first block of BLIND_VOTE.
    pub fn on_block_added(&mut self, height: u32, state: &LedgerState, proposals: &ProposalService) {
        let period = state.period();
        if !period.is_first_block_of_phase(height, Phase::BlindVote) {
            return;
        }
        if let Some(cycle) = period.cycle(height) {
            let uids = proposals
                .valid_ballots_of_cycle(state, height)
                .into_iter()
                .map(|b| b.proposal.uid)
                .collect::<Vec<_>>();
            info!("[VOTE] Ballot snapshot with {} proposals at height {}.", uids.len(), height);
            self.ballot_snapshot = Some((cycle.height_of_first_block(), uids));
        }
    }

    pub fn has_voted_in_cycle(&self, state: &LedgerState, height: u32) -> bool {
        let period = state.period();
        let cycle_start = match period.cycle(height) {
            Some(cycle) => cycle.height_of_first_block(),
            None => return false,
        };
        self.pending_cycle == Some(cycle_start)
            || self.my_votes.iter().any(|v| {
                period
                    .cycle(v.height)
                    .map(|c| c.height_of_first_block() == cycle_start)
                    .unwrap_or(false)
            })
    }

    /// Sorted ballots of the snapshot with the votes currently set on them.
    fn ballots_for_vote(&self, state: &LedgerState, height: u32, cycle_start: u32, proposals: &ProposalService) -> Vec<Ballot> {
        let mut ballots = match &self.ballot_snapshot {
            Some((start, uids)) if *start == cycle_start => uids
                .iter()
                .filter_map(|uid| proposals.ballot(uid).cloned())
                .collect(),
            _ => proposals.valid_ballots_of_cycle(state, height),
        };
        sort_ballots(&mut ballots);
        ballots
    }

    /// Encrypts the ballot list with a fresh key, commits to the ciphertext in
    /// a stake-locking tx and broadcasts it. Casting twice per cycle is refused.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_blind_vote(
        &mut self,
        stake: u64,
        state: &LedgerState,
        proposals: &ProposalService,
        wallet: &dyn WalletService,
        broadcaster: &dyn TxBroadcaster,
        reports: &mpsc::UnboundedSender<BroadcastReport>,
    ) -> Result<TxId, GovernanceError> {
        let height = state.chain_height();
        let period = state.period();
        let phase = period.phase_for_height(height);
        if phase != Phase::BlindVote {
            return Err(GovernanceError::WrongPhase {
                expected: Phase::BlindVote,
                actual: phase,
            });
        }
        let cycle_start = period
            .cycle(height)
            .map(|c| c.height_of_first_block())
            .unwrap_or(height);
        if self.has_voted_in_cycle(state, height) {
            return Err(GovernanceError::AlreadyVoted(cycle_start));
        }

        let ballots = self.ballots_for_vote(state, height, cycle_start, proposals);
        let secret_key = crypto::generate_secret_key();
        let encrypted_votes = crypto::encrypt(&secret_key, &bincode::serialize(&ballots).map_err(crypto::CryptoError::from)?)?;
        let op_return_data = opreturn::blind_vote_data(&crypto::hash160(&encrypted_votes));

        let fee_height = period
            .first_block_of_phase(height, Phase::Proposal)
            .unwrap_or(height);
        let fee = state.param_value(Param::BlindVoteFee, fee_height);
        let signed = wallet.prepare_and_sign_tx(&TxRequest {
            purpose: TxPurpose::BlindVote { stake, fee },
            op_return_data,
        })?;
        let tx_id = signed.tx_id;

        let pending = PendingBlindVote {
            height,
            ballots,
            secret_key,
            blind_vote: BlindVote {
                encrypted_votes,
                tx_id,
                stake,
            },
        };
        self.pending_cycle = Some(cycle_start);
        info!("[VOTE] Broadcasting blind vote tx {} with stake {}.", tx_id, stake);
        broadcaster.broadcast(
            signed,
            BroadcastCallback::new(tx_id, BroadcastContext::BlindVote(Box::new(pending)), reports.clone()),
        );
        Ok(tx_id)
    }

    /// Stores the MyVote and hands the ciphertext to the network.
    pub fn on_blind_vote_broadcast(
        &mut self,
        pending: PendingBlindVote,
        blind_votes: &mut BlindVoteService,
        transport: &dyn Transport,
    ) -> Result<(), GovernanceError> {
        let blind_vote = pending.blind_vote;
        blind_votes.add_my_blind_vote(blind_vote.clone())?;
        if !transport.publish(NetworkPayload::BlindVote(blind_vote.clone()), blind_vote.tx_id) {
            warn!("[VOTE] Blind vote {} could not be published to peers.", blind_vote.tx_id);
        }
        self.my_votes.push(MyVote {
            height: pending.height,
            ballots: pending.ballots,
            secret_key: pending.secret_key,
            blind_vote,
            reveal_tx_id: None,
        });
        self.pending_cycle = None;
        self.store.save_my_votes(&self.my_votes)?;
        Ok(())
    }

    /// Clears the pending marker so the vote can be cast again.
    pub fn on_broadcast_failed(&mut self, error: &BroadcastError, height: u32) {
        let id = match error {
            BroadcastError::Timeout(tx_id)
            | BroadcastError::Malleability(tx_id)
            | BroadcastError::Failure(tx_id, _) => tx_id.to_string(),
        };
        warn!("[VOTE] Blind vote broadcast failed: {}", error);
        self.exceptions.push(GovernanceException::new(id, height, error.to_string()));
        self.pending_cycle = None;
    }

    pub fn apply_reveal_tx_id(&mut self, blind_vote_tx_id: &TxId, reveal_tx_id: TxId) -> Result<(), GovernanceError> {
        if let Some(my_vote) = self.my_votes.iter_mut().find(|v| v.tx_id() == *blind_vote_tx_id) {
            my_vote.reveal_tx_id = Some(reveal_tx_id);
            self.store.save_my_votes(&self.my_votes)?;
        }
        Ok(())
    }

    /// Pushes our blind votes of the current cycle again once the node is
    /// bootstrapped and has enough peers. Returns the number published.
    pub fn republish_if_well_connected(&self, state: &LedgerState, transport: &dyn Transport) -> usize {
        if transport.num_connected_peers() <= MIN_PEERS_FOR_REPUBLISH || !transport.is_bootstrapped() {
            return 0;
        }
        let period = state.period();
        let height = state.chain_height();
        self.my_votes
            .iter()
            .filter(|v| period.is_tx_in_correct_cycle(v.height, height))
            .filter(|v| transport.publish(NetworkPayload::BlindVote(v.blind_vote.clone()), v.tx_id()))
            .count()
    }
}
