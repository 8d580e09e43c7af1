// src/blind_vote.rs - Encrypted vote commitments observed on the network

use crate::crypto::{self, CryptoError};
use crate::governance::ValidationError;
use crate::opreturn::{self, HASH_LENGTH};
use crate::period::Phase;
use crate::state::LedgerState;
use crate::storage::{DaoStore, StorageError};
use crate::transaction::{TxId, TxType};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Ciphertext of a voter's sorted ballot list, keyed by the tx that locks the stake.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlindVote {
    #[serde_as(as = "Bytes")]
    pub encrypted_votes: Vec<u8>,
    pub tx_id: TxId,
    pub stake: u64,
}

impl BlindVote {
    pub fn encrypted_votes_hash(&self) -> [u8; HASH_LENGTH] {
        crypto::hash160(&self.encrypted_votes)
    }
}

pub struct BlindVoteValidator;

impl BlindVoteValidator {
    pub fn validate_data_fields(blind_vote: &BlindVote) -> Result<(), ValidationError> {
        if blind_vote.encrypted_votes.is_empty() {
            return Err(ValidationError::EmptyEncryptedVotes);
        }
        if blind_vote.stake == 0 {
            return Err(ValidationError::ZeroStake);
        }
        Ok(())
    }

    /// `Ok(false)` while the blind vote tx is not confirmed.
    pub fn validate_tx(blind_vote: &BlindVote, state: &LedgerState, chain_height: u32) -> Result<bool, ValidationError> {
        let tx_id = blind_vote.tx_id;
        let tx = match state.tx(&tx_id) {
            Some(tx) => tx,
            None => return Ok(false),
        };
        if tx.tx_type != TxType::BlindVote {
            return Err(ValidationError::WrongTxType {
                tx_id,
                actual: tx.tx_type,
                expected: TxType::BlindVote,
            });
        }
        let period = state.period();
        if !period.is_tx_in_correct_cycle(tx.block_height, chain_height) {
            return Err(ValidationError::WrongCycle(tx_id));
        }
        let phase = period.phase_for_height(tx.block_height);
        if phase != Phase::BlindVote {
            return Err(ValidationError::WrongPhase {
                tx_id,
                actual: phase,
                expected: Phase::BlindVote,
            });
        }
        let committed = tx.op_return_data().and_then(opreturn::hash_of);
        if committed != Some(blind_vote.encrypted_votes_hash()) {
            return Err(ValidationError::HashMismatch(tx_id));
        }
        let locked = tx.output(0).map(|o| o.value).unwrap_or(0);
        if locked != blind_vote.stake {
            return Err(ValidationError::StakeMismatch {
                tx_id,
                declared: blind_vote.stake,
                locked,
            });
        }
        Ok(true)
    }

    /// Unconfirmed blind votes are only tolerated while the chain is in BLIND_VOTE.
    pub fn is_valid_or_unconfirmed(blind_vote: &BlindVote, state: &LedgerState, chain_height: u32) -> bool {
        if Self::validate_data_fields(blind_vote).is_err() {
            return false;
        }
        match Self::validate_tx(blind_vote, state, chain_height) {
            Ok(true) => true,
            Ok(false) => state.period().is_in_phase(chain_height, Phase::BlindVote),
            Err(e) => {
                debug!("[VOTE] Blind vote {} invalid: {}", blind_vote.tx_id, e);
                false
            }
        }
    }

    pub fn is_valid_and_confirmed(blind_vote: &BlindVote, state: &LedgerState, chain_height: u32) -> bool {
        Self::validate_data_fields(blind_vote).is_ok()
            && matches!(Self::validate_tx(blind_vote, state, chain_height), Ok(true))
    }
}

/// Every blind vote this node has seen, own ones included. The list is
/// persisted so the tally after a restart sees the same votes.
pub struct BlindVoteService {
    blind_votes: Vec<BlindVote>,
    store: DaoStore,
}

impl BlindVoteService {
    pub fn new(store: DaoStore) -> Result<Self, StorageError> {
        let blind_votes = store.load_blind_votes()?;
        Ok(Self { blind_votes, store })
    }

    pub fn blind_votes(&self) -> &[BlindVote] {
        &self.blind_votes
    }

    pub fn find(&self, tx_id: &TxId) -> Option<&BlindVote> {
        self.blind_votes.iter().find(|bv| bv.tx_id == *tx_id)
    }

    pub fn on_blind_vote_received(&mut self, blind_vote: BlindVote, state: &LedgerState) -> bool {
        if self.find(&blind_vote.tx_id).is_some() {
            return false;
        }
        if !BlindVoteValidator::is_valid_or_unconfirmed(&blind_vote, state, state.chain_height()) {
            warn!("[VOTE] Blind vote {} failed validation, dropped.", blind_vote.tx_id);
            return false;
        }
        self.blind_votes.push(blind_vote);
        if let Err(e) = self.store.save_blind_votes(&self.blind_votes) {
            warn!("[VOTE] Failed to persist blind votes: {}", e);
        }
        true
    }

    /// Our own votes skip validation, their tx may not be mined yet.
    pub fn add_my_blind_vote(&mut self, blind_vote: BlindVote) -> Result<(), StorageError> {
        if self.find(&blind_vote.tx_id).is_none() {
            self.blind_votes.push(blind_vote);
            self.store.save_blind_votes(&self.blind_votes)?;
        }
        Ok(())
    }

    /// Confirmed, valid blind votes of the cycle of `chain_height`, sorted by tx id.
    /// Every honest node must derive the same list.
    pub fn sorted_valid_blind_votes(&self, state: &LedgerState, chain_height: u32) -> Vec<BlindVote> {
        let mut list: Vec<BlindVote> = self
            .blind_votes
            .iter()
            .filter(|bv| BlindVoteValidator::is_valid_and_confirmed(bv, state, chain_height))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));
        list
    }
}

pub fn hash_of_blind_vote_list(list: &[BlindVote]) -> Result<[u8; HASH_LENGTH], CryptoError> {
    crypto::hash_of_serialized(list)
}
