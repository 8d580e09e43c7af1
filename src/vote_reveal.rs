// src/vote_reveal.rs - Unlocking stake and disclosing vote keys in VOTE_REVEAL

use crate::blind_vote::{hash_of_blind_vote_list, BlindVoteService, BlindVoteValidator};
use crate::governance::{GovernanceError, GovernanceException};
use crate::my_vote::{MyBlindVoteService, MyVote};
use crate::opreturn;
use crate::period::Phase;
use crate::state::LedgerState;
use crate::transaction::{TxId, TxOutputKey};
use crate::wallet::{
    BroadcastCallback, BroadcastContext, BroadcastError, BroadcastReport, TxBroadcaster, TxPurpose, TxRequest,
    WalletService,
};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct VoteRevealService {
    /// Blind vote tx ids whose reveal tx is being broadcast.
    pending_reveals: BTreeSet<TxId>,
    exceptions: Vec<GovernanceException>,
}

impl VoteRevealService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exceptions(&self) -> &[GovernanceException] {
        &self.exceptions
    }

    pub fn is_pending(&self, blind_vote_tx_id: &TxId) -> bool {
        self.pending_reveals.contains(blind_vote_tx_id)
    }

    /// Reveals every vote of the current cycle that still needs it. Runs on
    /// each new block and does nothing outside VOTE_REVEAL. Returns the
    /// reveal tx ids handed to the broadcaster.
    pub fn maybe_reveal_votes(
        &mut self,
        state: &LedgerState,
        my_votes: &MyBlindVoteService,
        blind_votes: &BlindVoteService,
        wallet: &dyn WalletService,
        broadcaster: &dyn TxBroadcaster,
        reports: &mpsc::UnboundedSender<BroadcastReport>,
    ) -> Vec<TxId> {
        let height = state.chain_height();
        if !state.period().is_in_phase(height, Phase::VoteReveal) {
            return Vec::new();
        }

        let candidates: Vec<&MyVote> = my_votes
            .my_votes()
            .iter()
            .filter(|v| v.reveal_tx_id.is_none() && !self.pending_reveals.contains(&v.tx_id()))
            .filter(|v| matches!(BlindVoteValidator::validate_tx(&v.blind_vote, state, height), Ok(true)))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let blind_vote_list = blind_votes.sorted_valid_blind_votes(state, height);
        let list_hash = match hash_of_blind_vote_list(&blind_vote_list) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("[VOTE] Could not hash the blind vote list: {}", e);
                return Vec::new();
            }
        };
        debug!("[VOTE] Revealing against a list of {} blind votes.", blind_vote_list.len());

        let mut revealed = Vec::new();
        for my_vote in candidates {
            let blind_vote_tx_id = my_vote.tx_id();
            match self.reveal(my_vote, &list_hash, state, wallet, broadcaster, reports) {
                Ok(tx_id) => {
                    self.pending_reveals.insert(blind_vote_tx_id);
                    revealed.push(tx_id);
                }
                Err(e) => {
                    warn!("[VOTE] Reveal of blind vote {} failed: {}", blind_vote_tx_id, e);
                    self.exceptions
                        .push(GovernanceException::new(blind_vote_tx_id.to_string(), height, e.to_string()));
                }
            }
        }
        revealed
    }

    fn reveal(
        &self,
        my_vote: &MyVote,
        list_hash: &[u8; opreturn::HASH_LENGTH],
        state: &LedgerState,
        wallet: &dyn WalletService,
        broadcaster: &dyn TxBroadcaster,
        reports: &mpsc::UnboundedSender<BroadcastReport>,
    ) -> Result<TxId, GovernanceError> {
        let blind_vote_tx_id = my_vote.tx_id();
        let stake_output = TxOutputKey::new(blind_vote_tx_id, 0);
        let stake = state
            .unspent_tx_output(&stake_output)
            .map(|o| o.value)
            .ok_or(GovernanceError::StakeOutputNotFound(stake_output))?;

        let signed = wallet.prepare_and_sign_tx(&TxRequest {
            purpose: TxPurpose::VoteReveal { stake_output, stake },
            op_return_data: opreturn::vote_reveal_data(list_hash, &my_vote.secret_key),
        })?;
        let tx_id = signed.tx_id;
        info!("[VOTE] Broadcasting reveal tx {} for blind vote {}.", tx_id, blind_vote_tx_id);
        broadcaster.broadcast(
            signed,
            BroadcastCallback::new(tx_id, BroadcastContext::VoteReveal { blind_vote_tx_id }, reports.clone()),
        );
        Ok(tx_id)
    }

    pub fn on_reveal_broadcast(
        &mut self,
        blind_vote_tx_id: &TxId,
        reveal_tx_id: TxId,
        my_votes: &mut MyBlindVoteService,
    ) -> Result<(), GovernanceError> {
        self.pending_reveals.remove(blind_vote_tx_id);
        my_votes.apply_reveal_tx_id(blind_vote_tx_id, reveal_tx_id)
    }

    /// The vote stays unrevealed and is retried on the next block while the phase lasts.
    pub fn on_broadcast_failed(&mut self, blind_vote_tx_id: &TxId, error: &BroadcastError, height: u32) {
        self.pending_reveals.remove(blind_vote_tx_id);
        warn!("[VOTE] Reveal broadcast for {} failed: {}", blind_vote_tx_id, error);
        self.exceptions
            .push(GovernanceException::new(blind_vote_tx_id.to_string(), height, error.to_string()));
    }
}
