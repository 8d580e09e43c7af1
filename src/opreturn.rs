// src/opreturn.rs - Embedded metadata carried by the final output of a BSQ transaction

use crate::params::Param;
use crate::period::Phase;
use crate::transaction::{TxOutputType, TxType};
use bitcoin::opcodes;
use bitcoin::script::{Instruction, Script};

pub const VERSION: u8 = 0x01;
pub const HASH_LENGTH: usize = 20;
pub const SECRET_KEY_LENGTH: usize = 16;

/// Type tag in byte 0 of the payload. Byte 1 is the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpReturnType {
    Proposal,
    CompensationRequest,
    BlindVote,
    VoteReveal,
    Lockup,
}

impl OpReturnType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x10 => Some(OpReturnType::Proposal),
            0x11 => Some(OpReturnType::CompensationRequest),
            0x12 => Some(OpReturnType::BlindVote),
            0x13 => Some(OpReturnType::VoteReveal),
            0x14 => Some(OpReturnType::Lockup),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            OpReturnType::Proposal => 0x10,
            OpReturnType::CompensationRequest => 0x11,
            OpReturnType::BlindVote => 0x12,
            OpReturnType::VoteReveal => 0x13,
            OpReturnType::Lockup => 0x14,
        }
    }

    pub fn from_data(data: &[u8]) -> Option<Self> {
        data.first().copied().and_then(Self::from_tag)
    }

    pub fn expected_len(self) -> usize {
        match self {
            OpReturnType::Proposal
            | OpReturnType::CompensationRequest
            | OpReturnType::BlindVote => 2 + HASH_LENGTH,
            OpReturnType::VoteReveal => 2 + HASH_LENGTH + SECRET_KEY_LENGTH,
            OpReturnType::Lockup => 5,
        }
    }

    /// Phase the block height must be in for the payload to be valid.
    pub fn required_phase(self) -> Option<Phase> {
        match self {
            OpReturnType::Proposal | OpReturnType::CompensationRequest => Some(Phase::Proposal),
            OpReturnType::BlindVote => Some(Phase::BlindVote),
            OpReturnType::VoteReveal => Some(Phase::VoteReveal),
            OpReturnType::Lockup => None,
        }
    }

    /// Fee parameter the tx must burn at least.
    pub fn fee_param(self) -> Option<Param> {
        match self {
            OpReturnType::Proposal | OpReturnType::CompensationRequest => Some(Param::ProposalFee),
            OpReturnType::BlindVote => Some(Param::BlindVoteFee),
            OpReturnType::VoteReveal | OpReturnType::Lockup => None,
        }
    }

    pub fn tx_type(self) -> TxType {
        match self {
            OpReturnType::Proposal => TxType::Proposal,
            OpReturnType::CompensationRequest => TxType::CompensationRequest,
            OpReturnType::BlindVote => TxType::BlindVote,
            OpReturnType::VoteReveal => TxType::VoteReveal,
            OpReturnType::Lockup => TxType::Lockup,
        }
    }

    pub fn output_type(self) -> TxOutputType {
        match self {
            OpReturnType::Proposal => TxOutputType::ProposalOpReturnOutput,
            OpReturnType::CompensationRequest => TxOutputType::CompReqOpReturnOutput,
            OpReturnType::BlindVote => TxOutputType::BlindVoteOpReturnOutput,
            OpReturnType::VoteReveal => TxOutputType::VoteRevealOpReturnOutput,
            OpReturnType::Lockup => TxOutputType::LockupOpReturnOutput,
        }
    }
}

/// Concatenated push data of an `OP_RETURN` script, `None` for any other script.
pub fn extract_op_return_data(script_pub_key: &[u8]) -> Option<Vec<u8>> {
    let script = Script::from_bytes(script_pub_key);
    let mut instructions = script.instructions();

    match instructions.next()?.ok()? {
        Instruction::Op(opcodes::all::OP_RETURN) => {}
        _ => return None,
    }

    let mut data = Vec::new();
    for instruction in instructions {
        match instruction.ok()? {
            Instruction::PushBytes(bytes) => data.extend_from_slice(bytes.as_bytes()),
            Instruction::Op(_) => return None,
        }
    }
    Some(data)
}

fn with_header(op_return_type: OpReturnType, body: &[&[u8]]) -> Vec<u8> {
    let mut data = vec![op_return_type.tag(), VERSION];
    for part in body {
        data.extend_from_slice(part);
    }
    data
}

pub fn proposal_data(proposal_hash: &[u8; HASH_LENGTH]) -> Vec<u8> {
    with_header(OpReturnType::Proposal, &[proposal_hash])
}

pub fn compensation_request_data(proposal_hash: &[u8; HASH_LENGTH]) -> Vec<u8> {
    with_header(OpReturnType::CompensationRequest, &[proposal_hash])
}

pub fn blind_vote_data(encrypted_votes_hash: &[u8; HASH_LENGTH]) -> Vec<u8> {
    with_header(OpReturnType::BlindVote, &[encrypted_votes_hash])
}

pub fn vote_reveal_data(
    blind_vote_list_hash: &[u8; HASH_LENGTH],
    secret_key: &[u8; SECRET_KEY_LENGTH],
) -> Vec<u8> {
    with_header(OpReturnType::VoteReveal, &[blind_vote_list_hash, secret_key])
}

pub fn lockup_data(reason: u8, lock_time: u16) -> Vec<u8> {
    with_header(OpReturnType::Lockup, &[&[reason], &lock_time.to_be_bytes()])
}

/// The 20-byte hash following the tag and version bytes.
pub fn hash_of(data: &[u8]) -> Option<[u8; HASH_LENGTH]> {
    data.get(2..2 + HASH_LENGTH)?.try_into().ok()
}

pub fn secret_key_of_vote_reveal(data: &[u8]) -> Option<[u8; SECRET_KEY_LENGTH]> {
    let start = 2 + HASH_LENGTH;
    data.get(start..start + SECRET_KEY_LENGTH)?.try_into().ok()
}

pub fn lock_time_of_lockup(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(3..5)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

#[cfg(test)]
pub(crate) fn op_return_script(data: &[u8]) -> Vec<u8> {
    use bitcoin::script::PushBytesBuf;
    use bitcoin::ScriptBuf;

    let push = PushBytesBuf::try_from(data.to_vec()).expect("invalid push data length");
    ScriptBuf::builder()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(push)
        .into_script()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_push_data_from_op_return_script() {
        let payload = proposal_data(&[7u8; HASH_LENGTH]);
        let script = op_return_script(&payload);
        assert_eq!(extract_op_return_data(&script), Some(payload));
    }

    #[test]
    fn ignores_non_op_return_scripts() {
        let p2pkh = vec![0x76, 0xa9, 0x14, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x88, 0xac];
        assert_eq!(extract_op_return_data(&p2pkh), None);
        assert_eq!(extract_op_return_data(&[]), None);
    }

    #[test]
    fn payload_lengths_match_type_table() {
        let reveal = vote_reveal_data(&[1u8; HASH_LENGTH], &[2u8; SECRET_KEY_LENGTH]);
        assert_eq!(reveal.len(), OpReturnType::VoteReveal.expected_len());
        assert_eq!(reveal.len(), 38);
        assert_eq!(secret_key_of_vote_reveal(&reveal), Some([2u8; SECRET_KEY_LENGTH]));

        let lockup = lockup_data(1, 4_000);
        assert_eq!(lockup.len(), OpReturnType::Lockup.expected_len());
        assert_eq!(lock_time_of_lockup(&lockup), Some(4_000));
        assert_eq!(OpReturnType::from_data(&lockup), Some(OpReturnType::Lockup));
    }
}
