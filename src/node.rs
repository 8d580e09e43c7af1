// src/node.rs - The single writer driving parser, period engine, snapshots and voting

use crate::blind_vote::BlindVoteService;
use crate::block::RawBlock;
use crate::block_source::{BlockSource, BlockSourceError};
use crate::config::DaoConfig;
use crate::governance::{GovernanceError, GovernanceException, Vote};
use crate::listener::{ListenerRegistry, StateFacade};
use crate::my_vote::MyBlindVoteService;
use crate::p2p::{NetworkPayload, Transport};
use crate::parser::{BlockParser, ParseError, StateChangeEventsProvider};
use crate::proposal::{Proposal, ProposalService};
use crate::snapshot::SnapshotManager;
use crate::state::LedgerState;
use crate::storage::{DaoStore, StorageError};
use crate::transaction::TxId;
use crate::vote_reveal::VoteRevealService;
use crate::vote_result::{VoteResultProvider, VoteResultService};
use crate::wallet::{BroadcastContext, BroadcastReport, TxBroadcaster, WalletService};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Consecutive rollbacks tolerated before syncing gives up.
const MAX_CONSECUTIVE_ROLLBACKS: u32 = 3;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Governance error: {0}")]
    Governance(#[from] GovernanceError),
    #[error("Block source error: {0}")]
    Source(#[from] BlockSourceError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Gave up after {0} consecutive rollbacks")]
    TooManyRollbacks(u32),
    #[error("The node loop is already running")]
    AlreadyRunning,
}

/// External services the node talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn WalletService>,
    pub broadcaster: Arc<dyn TxBroadcaster>,
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Added(u32),
    AlreadyKnown(u32),
    /// The block did not connect. State was rolled back and parsing resumes here.
    Reorg { resume_from: u32 },
}

pub struct DaoNode {
    config: DaoConfig,
    state: LedgerState,
    parser: BlockParser,
    snapshots: SnapshotManager,
    proposals: ProposalService,
    blind_votes: BlindVoteService,
    my_votes: MyBlindVoteService,
    vote_reveal: VoteRevealService,
    vote_results: VoteResultService,
    listeners: ListenerRegistry,
    facade: StateFacade,
    collaborators: Collaborators,
    proposal_exceptions: Vec<GovernanceException>,
    reports_tx: mpsc::UnboundedSender<BroadcastReport>,
    reports_rx: Option<mpsc::UnboundedReceiver<BroadcastReport>>,
}

impl DaoNode {
    pub fn new(config: DaoConfig, store: DaoStore, collaborators: Collaborators) -> Result<Self, NodeError> {
        Self::with_snapshot_manager(config.clone(), store.clone(), collaborators, SnapshotManager::new(store, &config))
    }

    pub fn with_snapshot_manager(
        config: DaoConfig,
        store: DaoStore,
        collaborators: Collaborators,
        snapshots: SnapshotManager,
    ) -> Result<Self, NodeError> {
        let state = LedgerState::new(&config);
        let facade = StateFacade::new(&state);
        let mut listeners = ListenerRegistry::new();
        listeners.add_parser_listener(Box::new(facade.clone()));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let my_votes = MyBlindVoteService::new(store.clone())?;
        let mut blind_votes = BlindVoteService::new(store.clone())?;
        for my_vote in my_votes.my_votes() {
            blind_votes.add_my_blind_vote(my_vote.blind_vote.clone())?;
        }

        Ok(Self {
            parser: BlockParser::new(&config),
            snapshots,
            proposals: ProposalService::new(store)?,
            blind_votes,
            my_votes,
            vote_reveal: VoteRevealService::new(),
            vote_results: VoteResultService::new(),
            listeners,
            facade,
            collaborators,
            proposal_exceptions: Vec::new(),
            reports_tx,
            reports_rx: Some(reports_rx),
            config,
            state,
        })
    }

    /// Applies the latest persisted snapshot. Returns the height parsing resumes from.
    pub fn start(&mut self) -> Result<u32, NodeError> {
        self.snapshots.apply_snapshot(&mut self.state)?;
        self.facade.update(&self.state);
        let republished = self
            .my_votes
            .republish_if_well_connected(&self.state, self.collaborators.transport.as_ref());
        if republished > 0 {
            info!("[NODE] Republished {} own blind votes.", republished);
        }
        let next = self.state.next_block_height();
        info!(
            "[NODE] Started at chain height {}, {} ballots, {} own votes.",
            self.state.chain_height(),
            self.proposals.ballots().len(),
            self.my_votes.my_votes().len()
        );
        Ok(next)
    }

    pub fn config(&self) -> &DaoConfig {
        &self.config
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn facade(&self) -> StateFacade {
        self.facade.clone()
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    pub fn proposals(&self) -> &ProposalService {
        &self.proposals
    }

    pub fn blind_votes(&self) -> &BlindVoteService {
        &self.blind_votes
    }

    pub fn my_votes(&self) -> &MyBlindVoteService {
        &self.my_votes
    }

    pub fn vote_reveal(&self) -> &VoteRevealService {
        &self.vote_reveal
    }

    pub fn vote_results(&self) -> &VoteResultService {
        &self.vote_results
    }

    pub fn proposal_exceptions(&self) -> &[GovernanceException] {
        &self.proposal_exceptions
    }

    pub fn process_raw_block(&mut self, raw: &RawBlock) -> Result<BlockOutcome, NodeError> {
        let result = {
            let mut tally = VoteResultProvider {
                service: &mut self.vote_results,
                blind_votes: &self.blind_votes,
            };
            let mut providers: [&mut dyn StateChangeEventsProvider; 2] = [&mut self.proposals, &mut tally];
            self.parser.process_block(raw, &mut self.state, &mut providers)
        };

        match result {
            Ok(parsed) if parsed.is_new => {
                let height = parsed.block.height;
                self.listeners.notify_block_added(&parsed.block, &self.state);
                self.snapshots.on_chain_height_changed(&self.state)?;
                self.on_governance_tick(height);
                Ok(BlockOutcome::Added(height))
            }
            Ok(parsed) => Ok(BlockOutcome::AlreadyKnown(parsed.block.height)),
            Err(e @ ParseError::BlockNotConnecting { .. }) => {
                warn!("[NODE] {}. Rolling back.", e);
                let resume_from = self.snapshots.reset_to_last_snapshot(&mut self.state, &self.config)?;
                self.facade.refresh(&self.state);
                info!("[NODE] Resuming from height {}.", resume_from);
                Ok(BlockOutcome::Reorg { resume_from })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Phase-triggered voter actions, run after every new block.
    fn on_governance_tick(&mut self, height: u32) {
        self.my_votes.on_block_added(height, &self.state, &self.proposals);
        self.vote_reveal.maybe_reveal_votes(
            &self.state,
            &self.my_votes,
            &self.blind_votes,
            self.collaborators.wallet.as_ref(),
            self.collaborators.broadcaster.as_ref(),
            &self.reports_tx,
        );
    }

    /// Pulls blocks until the source has no more. Returns the number of blocks
    /// added. The facade is published once the batch is done.
    pub fn sync_from(&mut self, source: &mut dyn BlockSource) -> Result<u32, NodeError> {
        if !self.config.dao_activated {
            info!("[NODE] DAO is not activated, blocks are not parsed.");
            return Ok(0);
        }
        self.facade.defer_updates();
        let result = self.sync_batch(source);
        self.facade.resume_updates(&self.state);
        result
    }

    fn sync_batch(&mut self, source: &mut dyn BlockSource) -> Result<u32, NodeError> {
        let mut height = self.state.next_block_height();
        let mut added = 0;
        let mut rollbacks = 0;
        let mut failed_at: Option<u32> = None;
        loop {
            let raw = match source.get_block(height) {
                Ok(raw) => raw,
                Err(BlockSourceError::NotAvailable(_)) => break,
                Err(e) => return Err(e.into()),
            };
            match self.process_raw_block(&raw)? {
                BlockOutcome::Added(h) => {
                    added += 1;
                    if failed_at.map(|f| h > f).unwrap_or(false) {
                        rollbacks = 0;
                        failed_at = None;
                    }
                    height = h + 1;
                }
                BlockOutcome::AlreadyKnown(h) => height = h + 1,
                BlockOutcome::Reorg { resume_from } => {
                    rollbacks += 1;
                    if rollbacks > MAX_CONSECUTIVE_ROLLBACKS {
                        return Err(NodeError::TooManyRollbacks(rollbacks - 1));
                    }
                    failed_at = Some(failed_at.map_or(height, |f| f.max(height)));
                    height = resume_from;
                }
            }
        }
        self.drain_broadcast_reports();
        Ok(added)
    }

    pub fn on_network_payload(&mut self, payload: NetworkPayload) -> bool {
        match payload {
            NetworkPayload::Proposal(proposal) => self.proposals.on_proposal_received(proposal, &self.state),
            NetworkPayload::RemoveProposal(proposal) => {
                self.proposals
                    .on_proposal_removed(&proposal, &self.state, self.config.dev_mode)
            }
            NetworkPayload::BlindVote(blind_vote) => self.blind_votes.on_blind_vote_received(blind_vote, &self.state),
        }
    }

    pub fn handle_broadcast_report(&mut self, report: BroadcastReport) -> Result<(), NodeError> {
        let height = self.state.chain_height();
        let transport = self.collaborators.transport.as_ref();
        match (report.context, report.result) {
            (BroadcastContext::Proposal(proposal), Ok(())) => {
                self.proposals.on_proposal_published(proposal, transport);
            }
            (BroadcastContext::Proposal(proposal), Err(e)) => {
                warn!("[VOTE] Proposal {} broadcast failed: {}", proposal.uid, e);
                self.proposal_exceptions
                    .push(GovernanceException::new(proposal.uid, height, e.to_string()));
            }
            (BroadcastContext::BlindVote(pending), Ok(())) => {
                self.my_votes
                    .on_blind_vote_broadcast(*pending, &mut self.blind_votes, transport)?;
            }
            (BroadcastContext::BlindVote(_), Err(e)) => self.my_votes.on_broadcast_failed(&e, height),
            (BroadcastContext::VoteReveal { blind_vote_tx_id }, Ok(())) => {
                self.vote_reveal
                    .on_reveal_broadcast(&blind_vote_tx_id, report.tx_id, &mut self.my_votes)?;
            }
            (BroadcastContext::VoteReveal { blind_vote_tx_id }, Err(e)) => {
                self.vote_reveal.on_broadcast_failed(&blind_vote_tx_id, &e, height);
            }
        }
        Ok(())
    }

    /// Handles every report already queued. Only used while the run loop is not active.
    pub fn drain_broadcast_reports(&mut self) -> usize {
        let mut reports = Vec::new();
        if let Some(rx) = self.reports_rx.as_mut() {
            while let Ok(report) = rx.try_recv() {
                reports.push(report);
            }
        }
        let count = reports.len();
        for report in reports {
            if let Err(e) = self.handle_broadcast_report(report) {
                warn!("[NODE] Failed to handle broadcast report: {}", e);
            }
        }
        count
    }

    pub fn publish_proposal(&mut self, proposal: Proposal) -> Result<TxId, NodeError> {
        Ok(self.proposals.publish_proposal(
            proposal,
            &self.state,
            self.collaborators.wallet.as_ref(),
            self.collaborators.broadcaster.as_ref(),
            &self.reports_tx,
        )?)
    }

    pub fn set_vote(&mut self, uid: &str, vote: Option<Vote>) -> Result<(), NodeError> {
        Ok(self.proposals.set_vote(uid, vote)?)
    }

    pub fn publish_blind_vote(&mut self, stake: u64) -> Result<TxId, NodeError> {
        Ok(self.my_votes.publish_blind_vote(
            stake,
            &self.state,
            &self.proposals,
            self.collaborators.wallet.as_ref(),
            self.collaborators.broadcaster.as_ref(),
            &self.reports_tx,
        )?)
    }

    /// Polls `source` every `poll_interval` and reacts to network payloads and
    /// broadcast outcomes until `shutdown` fires.
    pub async fn run(
        &mut self,
        source: &mut dyn BlockSource,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), NodeError> {
        let mut reports_rx = self.reports_rx.take().ok_or(NodeError::AlreadyRunning)?;
        let mut payload_rx = self
            .collaborators
            .transport
            .on_received(Box::new(|payload: &NetworkPayload| payload.is_governance_data()));
        let mut ticker = tokio::time::interval(poll_interval);
        info!("[NODE] Following blocks every {:?}.", poll_interval);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_from(source) {
                        Ok(0) => {}
                        Ok(n) => info!("[NODE] Added {} blocks, chain height {}.", n, self.state.chain_height()),
                        Err(e @ NodeError::TooManyRollbacks(_)) => break Err(e),
                        Err(e) => warn!("[NODE] Sync failed: {}", e),
                    }
                }
                Some(payload) = payload_rx.recv() => {
                    self.on_network_payload(payload);
                }
                Some(report) = reports_rx.recv() => {
                    if let Err(e) = self.handle_broadcast_report(report) {
                        warn!("[NODE] Failed to handle broadcast report: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("[NODE] Shutdown signal received.");
                    break Ok(());
                }
            }
        };
        self.reports_rx = Some(reports_rx);
        outcome
    }
}
