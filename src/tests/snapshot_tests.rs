// src/tests/snapshot_tests.rs

#[cfg(test)]
mod tests {
    use crate::block::RawBlock;
    use crate::node::BlockOutcome;
    use crate::snapshot::{is_snapshot_height, snapshot_floor};
    use crate::storage::DaoStore;
    use crate::tests::support::*;

    /// Feeds blocks 0..=`last` and returns them for later replay.
    fn feed_chain(node: &mut TestNode, chain: &mut ChainBuilder, last: u32) -> Vec<RawBlock> {
        let mut blocks = Vec::new();
        while chain.next_height() <= last {
            let raw = if chain.next_height() == 0 {
                chain.block(vec![genesis_tx(&[GENESIS_SUPPLY])])
            } else {
                chain.empty()
            };
            assert_eq!(node.feed(&raw), BlockOutcome::Added(raw.height));
            blocks.push(raw);
        }
        blocks
    }

    #[test]
    fn test_snapshot_heights_on_the_default_grid() {
        assert!(is_snapshot_height(0, 30_000, 10_000));
        assert!(is_snapshot_height(0, 20_000, 10_000));
        assert!(!is_snapshot_height(0, 29_999, 10_000));
        assert!(!is_snapshot_height(0, 10_000, 10_000));
        assert!(!is_snapshot_height(0, 30_000, 0));
        assert_eq!(snapshot_floor(0, 55_000, 10_000), 40_000);
        // Genesis above the first grid points pushes the floor up.
        assert!(!is_snapshot_height(15_000, 20_000, 10_000));
        assert!(is_snapshot_height(15_000, 30_000, 10_000));
    }

    #[test]
    fn test_candidate_is_persisted_one_grid_later() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let mut chain = ChainBuilder::new(0);

        feed_chain(&mut node, &mut chain, 25);
        assert!(node.store.snapshot_heights().unwrap().is_empty());

        feed_chain(&mut node, &mut chain, 40);
        assert_eq!(node.store.snapshot_heights().unwrap(), vec![20, 30]);

        let latest = node.store.load_latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.chain_height(), 30);
        assert_eq!(latest.total_unspent_bsq(), GENESIS_SUPPLY);
        assert_eq!(latest.blocks().len(), 31);
    }

    #[test]
    fn test_reorg_rolls_back_to_last_persisted_snapshot() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let mut chain = ChainBuilder::new(0);
        let blocks = feed_chain(&mut node, &mut chain, 35);

        let outcome = node.feed(&chain.orphan());
        assert_eq!(outcome, BlockOutcome::Reorg { resume_from: 21 });
        assert_eq!(node.node.state().chain_height(), 20);
        assert_eq!(node.node.facade().chain_height(), 20);
        assert_eq!(node.node.state().total_unspent_bsq(), GENESIS_SUPPLY);

        // The dropped blocks reconnect on top of the restored head.
        for raw in &blocks[21..] {
            assert_eq!(node.feed(raw), BlockOutcome::Added(raw.height));
        }
        assert_eq!(node.node.state().chain_height(), 35);
    }

    #[test]
    fn test_reorg_without_snapshot_restarts_from_genesis() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let mut chain = ChainBuilder::new(0);
        feed_chain(&mut node, &mut chain, 15);

        let outcome = node.feed(&chain.orphan());
        assert_eq!(outcome, BlockOutcome::Reorg { resume_from: 0 });
        assert!(node.node.state().blocks().is_empty());
        assert_eq!(node.node.state().unspent_count(), 0);
        assert_eq!(node.node.state().cycles().len(), 1);
    }

    #[test]
    fn test_restart_resumes_from_persisted_snapshot() {
        let store = DaoStore::temporary().unwrap();
        {
            let mut node = TestNode::with_store(test_config(0, 1), 10, store.clone(), true);
            let mut chain = ChainBuilder::new(0);
            feed_chain(&mut node, &mut chain, 35);
        }

        let restarted = TestNode::with_store(test_config(0, 1), 10, store.clone(), true);
        assert_eq!(restarted.node.state().next_block_height(), 21);
        assert_eq!(restarted.node.facade().chain_height(), 20);
        assert_eq!(restarted.node.state().total_unspent_bsq(), GENESIS_SUPPLY);
    }

    #[test]
    fn test_persisted_snapshot_equals_live_state() {
        let mut node = TestNode::new(test_config(0, 1), 10);
        let mut chain = ChainBuilder::new(0);
        feed_chain(&mut node, &mut chain, 30);
        let original = node.node.state().clone();

        node.store.save_snapshot(&original).unwrap();
        let loaded = node.store.load_latest_snapshot().unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.period().current_phase(), original.period().current_phase());
    }
}
