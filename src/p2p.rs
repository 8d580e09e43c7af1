// src/p2p.rs - Data-broadcast collaborator

use crate::blind_vote::BlindVote;
use crate::proposal::Proposal;
use crate::transaction::TxId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Governance data exchanged between peers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum NetworkPayload {
    Proposal(Proposal),
    /// The author withdrew the proposal from the network.
    RemoveProposal(Proposal),
    BlindVote(BlindVote),
}

impl NetworkPayload {
    pub fn is_governance_data(&self) -> bool {
        matches!(
            self,
            NetworkPayload::Proposal(_) | NetworkPayload::RemoveProposal(_) | NetworkPayload::BlindVote(_)
        )
    }
}

pub type PayloadFilter = Box<dyn Fn(&NetworkPayload) -> bool + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Returns false if the payload could not be handed to the network.
    fn publish(&self, payload: NetworkPayload, key: TxId) -> bool;
    /// Stream of received payloads matching `filter`.
    fn on_received(&self, filter: PayloadFilter) -> mpsc::UnboundedReceiver<NetworkPayload>;
    fn num_connected_peers(&self) -> usize;
    fn is_bootstrapped(&self) -> bool;
}

/// Transport of a node without network access.
#[derive(Debug, Default)]
pub struct DisconnectedTransport;

impl Transport for DisconnectedTransport {
    fn publish(&self, _payload: NetworkPayload, _key: TxId) -> bool {
        false
    }

    fn on_received(&self, _filter: PayloadFilter) -> mpsc::UnboundedReceiver<NetworkPayload> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn num_connected_peers(&self) -> usize {
        0
    }

    fn is_bootstrapped(&self) -> bool {
        false
    }
}
