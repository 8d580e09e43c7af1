// src/tests/integration_tests.rs - Whole-node runs over prepared chains

#[cfg(test)]
mod tests {
    use crate::block::{Block, RawBlock};
    use crate::block_source::{DirectoryBlockSource, MemoryBlockSource};
    use crate::governance::Vote;
    use crate::listener::{StateFacade, StateListener, StateUpdate};
    use crate::node::{BlockOutcome, NodeError};
    use crate::p2p::NetworkPayload;
    use crate::params::{Param, ParamChangeEvent};
    use crate::period::Phase;
    use crate::proposal::{Proposal, ProposalPayload};
    use crate::state::{LedgerState, StateChangeEvent};
    use crate::storage::DaoStore;
    use crate::tests::support::*;
    use crate::transaction::{TxOutputType, TxType};
    use crate::wallet::TxPurpose;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const TEST_DIR: &str = "bsq_dao_blocks_";

    fn compensation(requested_bsq: u64) -> Proposal {
        Proposal::new(
            "Q3 development",
            "https://example.org/compensation/42",
            ProposalPayload::Compensation {
                requested_bsq,
                bsq_address: "Bbsq1qcontributor".to_string(),
            },
        )
    }

    fn longer_proposal_phase() -> Proposal {
        Proposal::new(
            "Longer proposal phase",
            "https://example.org/params/7",
            ProposalPayload::ChangeParam {
                param: Param::PhaseProposal,
                value: 3,
            },
        )
    }

    fn unique_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}{}_{}", TEST_DIR, name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn linear_chain(length: u32) -> Vec<RawBlock> {
        let mut chain = ChainBuilder::new(0);
        (0..length)
            .map(|h| {
                if h == 0 {
                    chain.block(vec![genesis_tx(&[GENESIS_SUPPLY])])
                } else {
                    chain.empty()
                }
            })
            .collect()
    }

    #[test]
    fn test_proposal_is_included_at_last_break1_block() {
        let mut node = TestNode::new(test_config(0, 1), 10_000);
        let mut chain = ChainBuilder::new(0);

        let proposal = Proposal::new("Translate the docs", "https://example.org/proposals/1", ProposalPayload::Generic);
        let tx_id = node.node.publish_proposal(proposal).unwrap();
        node.node.drain_broadcast_reports();
        assert_eq!(node.node.proposals().ballots().len(), 1);
        assert!(matches!(node.transport.published().first(), Some(NetworkPayload::Proposal(_))));

        let (_, request) = node.wallet.signed()[0].clone();
        assert_eq!(request.purpose, TxPurpose::Proposal { fee: FEE });
        let proposal_tx = tx(
            tx_id,
            vec![key(genesis_tx_id(), 0)],
            vec![out(GENESIS_SUPPLY - FEE), op_return(&request.op_return_data)],
        );
        node.feed(&chain.block(vec![genesis_tx(&[GENESIS_SUPPLY]), proposal_tx]));

        let state = node.node.state();
        assert_eq!(state.tx(&tx_id).unwrap().tx_type, TxType::Proposal);
        assert_eq!(state.burnt_fee(&tx_id), FEE);
        assert_eq!(state.total_unspent_bsq(), GENESIS_SUPPLY - FEE);

        assert_eq!(node.feed(&chain.empty()), BlockOutcome::Added(1));
        let events = &node.node.state().block_at_height(1).unwrap().state_change_events;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StateChangeEvent::Proposal(e) if e.proposal.tx_id == Some(tx_id) && e.height == 1));

        // Too late for the network and for the chain.
        node.feed(&chain.empty());
        let late = Proposal::new("Late", "https://example.org/late", ProposalPayload::Generic).with_tx_id(txid(900));
        assert!(!node.node.on_network_payload(NetworkPayload::Proposal(late)));

        let late_tx = tx(
            txid(901),
            vec![key(tx_id, 0)],
            vec![out(GENESIS_SUPPLY - 2 * FEE), op_return(&request.op_return_data)],
        );
        node.feed(&chain.block(vec![late_tx]));
        let state = node.node.state();
        assert_eq!(state.period().phase_for_height(3), Phase::Break2);
        assert_eq!(state.tx_output_type(&key(txid(901), 1)), Some(TxOutputType::InvalidOutput));
        assert_ne!(state.tx(&txid(901)).unwrap().tx_type, TxType::Proposal);
    }

    /// Feeds `block` and keeps it for a later replay.
    fn feed_kept(node: &mut TestNode, fed: &mut Vec<RawBlock>, block: RawBlock) -> BlockOutcome {
        let outcome = node.feed(&block);
        fed.push(block);
        outcome
    }

    /// Runs one cycle with 2-block phases in which a compensation request and a
    /// phase-duration change are accepted. Returns the fed blocks 0..=11.
    fn run_voting_cycle(node: &mut TestNode) -> Vec<RawBlock> {
        let mut chain = ChainBuilder::new(0);
        let mut fed = Vec::new();
        let genesis = genesis_tx(&[300_000, 300_000, 400_000]);

        // PROPOSAL: 0-1, BREAK1: 2-3, BLIND_VOTE: 4-5, BREAK2: 6-7, VOTE_REVEAL: 8-9, BREAK3: 10-11
        let comp_id = node.node.publish_proposal(compensation(5_000)).unwrap();
        let param_id = node.node.publish_proposal(longer_proposal_phase()).unwrap();
        node.node.drain_broadcast_reports();
        let requests = node.wallet.signed();
        let comp_tx = tx(
            comp_id,
            vec![key(genesis_tx_id(), 0)],
            vec![out(300_000 - FEE), out(5_000), op_return(&requests[0].1.op_return_data)],
        );
        let param_tx = tx(
            param_id,
            vec![key(genesis_tx_id(), 2)],
            vec![out(400_000 - FEE), op_return(&requests[1].1.op_return_data)],
        );
        feed_kept(node, &mut fed, chain.block(vec![genesis, comp_tx, param_tx]));
        assert!(node.node.state().is_issuance_candidate(&key(comp_id, 1)));

        for ballot in node.node.proposals().ballots().to_vec() {
            node.node.set_vote(&ballot.proposal.uid, Some(Vote::Accept)).unwrap();
        }
        for _ in 1..=4 {
            feed_kept(node, &mut fed, chain.empty());
        }
        let included = node
            .node
            .state()
            .block_at_height(3)
            .unwrap()
            .state_change_events
            .len();
        assert_eq!(included, 2);

        // BLIND_VOTE
        assert_eq!(node.node.state().period().current_phase(), Phase::BlindVote);
        let blind_vote_id = node.node.publish_blind_vote(200_000).unwrap();
        node.node.drain_broadcast_reports();
        let (_, blind_request) = node
            .wallet
            .last_for(|p| matches!(p, TxPurpose::BlindVote { .. }))
            .unwrap();
        assert_eq!(blind_request.purpose, TxPurpose::BlindVote { stake: 200_000, fee: FEE });
        let blind_vote_tx = tx(
            blind_vote_id,
            vec![key(genesis_tx_id(), 1)],
            vec![out(200_000), out(100_000 - FEE), op_return(&blind_request.op_return_data)],
        );
        feed_kept(node, &mut fed, chain.block(vec![blind_vote_tx]));
        assert_eq!(
            node.node.state().tx_output_type(&key(blind_vote_id, 0)),
            Some(TxOutputType::BlindVoteLockStakeOutput)
        );

        // BREAK2, then the first VOTE_REVEAL block triggers the reveal.
        for _ in 6..=8 {
            feed_kept(node, &mut fed, chain.empty());
        }
        let (reveal_id, reveal_request) = node
            .wallet
            .last_for(|p| matches!(p, TxPurpose::VoteReveal { .. }))
            .unwrap();
        assert_eq!(
            reveal_request.purpose,
            TxPurpose::VoteReveal {
                stake_output: key(blind_vote_id, 0),
                stake: 200_000
            }
        );
        assert_eq!(node.node.my_votes().my_votes()[0].reveal_tx_id, Some(reveal_id));

        let reveal_tx = tx(
            reveal_id,
            vec![key(blind_vote_id, 0)],
            vec![out(200_000), op_return(&reveal_request.op_return_data)],
        );
        feed_kept(node, &mut fed, chain.block(vec![reveal_tx]));
        assert_eq!(node.node.state().tx(&reveal_id).unwrap().tx_type, TxType::VoteReveal);
        assert_eq!(
            node.node.state().tx_output_type(&key(reveal_id, 0)),
            Some(TxOutputType::VoteRevealUnlockStakeOutput)
        );

        // BREAK3, tally at the last block of the cycle.
        feed_kept(node, &mut fed, chain.empty());
        assert_eq!(feed_kept(node, &mut fed, chain.empty()), BlockOutcome::Added(11));
        let state = node.node.state();
        let events = &state.block_at_height(11).unwrap().state_change_events;
        assert!(events.iter().any(|e| matches!(
            e,
            StateChangeEvent::Issuance(i) if i.output == key(comp_id, 1) && i.amount == 5_000
        )));
        assert!(events.contains(&StateChangeEvent::ParamChange(ParamChangeEvent {
            param: Param::PhaseProposal,
            value: 3,
            height: 11,
        })));
        assert!(state.is_unspent(&key(comp_id, 1)));
        assert_eq!(state.total_issued(), 5_000);

        let result = node.node.vote_results().result_of_cycle(0).unwrap();
        assert!(result.majority_hash.is_some());
        assert_eq!(result.evaluated.len(), 2);
        assert!(result.evaluated.iter().all(|e| e.is_accepted && e.accepted_stake == 200_000));

        fed
    }

    #[test]
    fn test_full_voting_cycle_issues_bsq_and_changes_params() {
        let mut node = TestNode::new(test_config(0, 2), 10_000);
        let fed = run_voting_cycle(&mut node);
        assert_eq!(fed.len(), 12);

        // The next cycle uses the new PROPOSAL duration.
        node.feed(&RawBlock::new(12, fed[11].hash, 12 * 600, Vec::new()));
        let cycles = node.node.state().cycles();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[1].height_of_first_block(), 12);
        assert_eq!(cycles[1].duration_of_phase(Phase::Proposal), 3);
        assert_eq!(cycles[1].duration(), 13);
    }

    #[test]
    fn test_restart_and_replay_derives_the_same_issuance() {
        let store = DaoStore::temporary().unwrap();
        let (fed, before) = {
            let mut node = TestNode::with_store(test_config(0, 2), 10_000, store.clone(), true);
            let fed = run_voting_cycle(&mut node);
            (fed, node.node.state().clone())
        };
        assert_eq!(store.load_blind_votes().unwrap().len(), 1);

        // No snapshot yet, so the restarted node parses from genesis again.
        let mut restarted = TestNode::with_store(test_config(0, 2), 10_000, store, true);
        assert_eq!(restarted.node.state().next_block_height(), 0);
        assert_eq!(restarted.node.blind_votes().blind_votes().len(), 1);
        for block in &fed {
            restarted.feed(block);
        }

        let state = restarted.node.state();
        assert_eq!(state.total_issued(), 5_000);
        assert_eq!(
            state.block_at_height(11).unwrap().state_change_events,
            before.block_at_height(11).unwrap().state_change_events
        );
        assert_eq!(state, &before);
        // The vote was revealed before the restart and is not revealed twice.
        assert_eq!(
            restarted.wallet.signed().iter().filter(|(_, r)| matches!(r.purpose, TxPurpose::VoteReveal { .. })).count(),
            0
        );
    }

    #[test]
    fn test_replay_from_block_directory() {
        let dir = unique_dir("replay");
        let blocks = linear_chain(8);
        for block in &blocks {
            let path = dir.join(format!("{}.json", block.height));
            std::fs::write(path, serde_json::to_vec(block).unwrap()).unwrap();
        }

        let mut node = TestNode::new(test_config(0, 1), 10_000);
        let mut source = DirectoryBlockSource::new(&dir);
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 8);
        assert_eq!(node.node.state().chain_height(), 7);
        assert_eq!(node.node.state().total_unspent_bsq(), GENESIS_SUPPLY);
        // Nothing new on a second pass.
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 0);

        std::fs::write(dir.join("8.json"), b"not json").unwrap();
        assert!(node.node.sync_from(&mut source).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sync_follows_a_competing_branch() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let main = linear_chain(36);
        let mut source = MemoryBlockSource::new(main.clone());
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 36);

        // Branch forking off after block 29.
        let mut prev = main[29].hash;
        for height in 30..=37 {
            let block = RawBlock::new(height, prev, height * 600 + 1, Vec::new());
            prev = block.hash;
            source.push(block);
        }

        // Rolls back to the snapshot at 20 and re-parses 21..=37.
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 17);
        let state = node.node.state();
        assert_eq!(state.chain_height(), 37);
        assert_ne!(state.block_at_height(30).unwrap().hash, main[30].hash);
        assert_eq!(state.block_at_height(29).unwrap().hash, main[29].hash);
        assert_eq!(node.node.facade().chain_height(), 37);
        assert_eq!(node.node.facade().snapshot().block_at_height(30), state.block_at_height(30));
    }

    #[test]
    fn test_sync_gives_up_on_a_block_that_never_connects() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let mut source = MemoryBlockSource::new(linear_chain(36));
        source.push(ChainBuilder::new(36).empty());

        assert!(matches!(
            node.node.sync_from(&mut source),
            Err(NodeError::TooManyRollbacks(3))
        ));
    }

    #[test]
    fn test_user_context_subscribers_receive_updates() {
        let mut node = TestNode::new(test_config(0, 1), 10_000);
        let facade = node.node.facade();
        let mut updates = node.node.listeners_mut().subscribe_user_context();
        assert_eq!(node.node.listeners_mut().parser_listener_count(), 1);

        let mut chain = ChainBuilder::new(0);
        node.feed(&chain.block(vec![genesis_tx(&[GENESIS_SUPPLY])]));
        node.feed(&chain.empty());

        assert_eq!(
            updates.try_recv().unwrap(),
            StateUpdate {
                height: 0,
                phase: Phase::Proposal,
                tx_count: 1,
                unspent_bsq: GENESIS_SUPPLY,
            }
        );
        assert_eq!(updates.try_recv().unwrap().phase, Phase::Break1);
        assert!(updates.try_recv().is_err());
        assert_eq!(facade.chain_height(), 1);
        assert_eq!(facade.snapshot().total_unspent_bsq(), GENESIS_SUPPLY);

        drop(updates);
        node.feed(&chain.empty());
        assert_eq!(node.node.listeners_mut().user_subscriber_count(), 0);
    }

    /// Records the facade height seen by a later parser listener.
    struct FacadeWatcher {
        facade: StateFacade,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl StateListener for FacadeWatcher {
        fn on_block_added(&mut self, _block: &Block, _state: &LedgerState) {
            self.seen.lock().push(self.facade.chain_height());
        }
    }

    #[test]
    fn test_facade_is_published_once_per_sync_batch() {
        let mut node = TestNode::new(test_config(0, 1), 10_000);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = FacadeWatcher {
            facade: node.node.facade(),
            seen: seen.clone(),
        };
        node.node.listeners_mut().add_parser_listener(Box::new(watcher));

        let blocks = linear_chain(6);
        let mut source = MemoryBlockSource::new(blocks[..5].to_vec());
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 5);
        // The copy is not refreshed block by block during the batch.
        assert_eq!(*seen.lock(), vec![0; 5]);
        assert_eq!(node.node.facade().chain_height(), 4);
        assert_eq!(node.node.facade().snapshot().blocks().len(), 5);

        // A single block outside a batch is published right away.
        node.feed(&blocks[5]);
        assert_eq!(seen.lock().last(), Some(&5));
        assert_eq!(node.node.facade().chain_height(), 5);
    }

    #[test]
    fn test_inactive_dao_parses_nothing() {
        let mut config = test_config(0, 1);
        config.dao_activated = false;
        let mut node = TestNode::with_store(config, 10_000, DaoStore::temporary().unwrap(), true);
        let mut source = MemoryBlockSource::new(linear_chain(5));
        assert_eq!(node.node.sync_from(&mut source).unwrap(), 0);
        assert!(node.node.state().blocks().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_follows_source_until_shutdown() {
        let mut node = TestNode::new(test_config(0, 1), 10_000);
        let mut source = MemoryBlockSource::new(linear_chain(7));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let transport = node.transport.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let proposal = Proposal::new("From a peer", "https://example.org/peer", ProposalPayload::Generic)
                .with_tx_id(txid(800));
            transport.deliver(NetworkPayload::Proposal(proposal));
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown_tx.send(()).ok();
        });

        node.node
            .run(&mut source, Duration::from_millis(10), shutdown_rx)
            .await
            .unwrap();
        // Head at 6 is in PROPOSAL, so the peer's proposal is still on time.
        assert_eq!(node.node.state().chain_height(), 6);
        assert_eq!(node.node.proposals().ballots().len(), 1);
        // The report receiver is handed back on exit.
        assert_eq!(node.node.drain_broadcast_reports(), 0);
    }
}
