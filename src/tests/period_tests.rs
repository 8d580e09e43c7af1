// src/tests/period_tests.rs

#[cfg(test)]
mod tests {
    use crate::block::Block;
    use crate::params::{Param, ParamChangeEvent, ParamRegistry, MAX_PHASE_DURATION};
    use crate::parser::{BlockParser, StateChangeEventsProvider};
    use crate::period::{Cycle, Phase, PhaseDuration};
    use crate::state::{LedgerState, StateChangeEvent};
    use crate::tests::support::*;
    use std::collections::BTreeMap;

    /// Emits one phase-duration change at a fixed height.
    struct ScheduledChange {
        at: u32,
        param: Param,
        value: u64,
    }

    impl StateChangeEventsProvider for ScheduledChange {
        fn provide_state_change_events(&mut self, block: &Block, _state: &LedgerState) -> Vec<StateChangeEvent> {
            if block.height != self.at {
                return Vec::new();
            }
            vec![StateChangeEvent::ParamChange(ParamChangeEvent {
                param: self.param,
                value: self.value,
                height: block.height,
            })]
        }
    }

    fn one_block_cycle(start: u32) -> Cycle {
        Cycle::new(
            start,
            Phase::ORDERED
                .iter()
                .map(|&phase| PhaseDuration { phase, duration: 1 })
                .collect(),
        )
    }

    #[test]
    fn test_genesis_cycle_exists_before_any_block() {
        let state = LedgerState::new(&test_config(100, 2));
        assert_eq!(state.cycles().len(), 1);
        let cycle = &state.cycles()[0];
        assert_eq!(cycle.height_of_first_block(), 100);
        assert_eq!(cycle.duration(), 12);
        assert_eq!(cycle.height_of_last_block(), 111);
        assert_eq!(state.period().current_phase(), Phase::Proposal);
    }

    #[test]
    fn test_phase_boundaries_of_a_cycle() {
        let cycle = one_block_cycle(0);
        for (height, phase) in Phase::ORDERED.iter().enumerate() {
            assert_eq!(cycle.phase_for_height(height as u32), *phase);
            assert_eq!(cycle.first_block_of_phase(*phase), Some(height as u32));
            assert_eq!(cycle.last_block_of_phase(*phase), Some(height as u32));
        }
        assert_eq!(cycle.phase_for_height(6), Phase::Undefined);
        assert!(!cycle.contains(6));
    }

    #[test]
    fn test_huge_phase_durations_are_capped_and_do_not_overflow() {
        let change = ParamChangeEvent {
            param: Param::PhaseProposal,
            value: 5_000_000_000,
            height: 5,
        };
        let next = Cycle::next(&one_block_cycle(0), 6, &[change]);
        assert_eq!(u64::from(next.duration_of_phase(Phase::Proposal)), MAX_PHASE_DURATION);
        assert_eq!(u64::from(next.duration()), MAX_PHASE_DURATION + 5);
        assert_eq!(next.first_block_of_phase(Phase::Break1), Some(100_006));

        // Near the top of the height range every query saturates.
        let late = Cycle::new(
            u32::MAX - 10,
            Phase::ORDERED
                .iter()
                .map(|&phase| PhaseDuration { phase, duration: u32::MAX })
                .collect(),
        );
        assert_eq!(late.duration(), u32::MAX);
        assert_eq!(late.height_of_last_block(), u32::MAX);
        assert_eq!(late.phase_for_height(u32::MAX - 1), Phase::Proposal);
        assert_eq!(late.first_block_of_phase(Phase::Break3), Some(u32::MAX));
    }

    #[test]
    fn test_defaults_give_the_standard_cycle() {
        let cycle = Cycle::from_params(0, &ParamRegistry::new(BTreeMap::new()), 0);
        assert_eq!(cycle.duration_of_phase(Phase::Proposal), 3_600);
        assert_eq!(cycle.first_block_of_phase(Phase::Break1), Some(3_600));
        assert_eq!(cycle.first_block_of_phase(Phase::BlindVote), Some(3_750));
        assert_eq!(cycle.last_block_of_phase(Phase::Break3), Some(cycle.height_of_last_block()));
    }

    #[test]
    fn test_cycles_are_contiguous_and_every_height_has_a_phase() {
        let config = test_config(0, 1);
        let parser = BlockParser::new(&config);
        let mut state = LedgerState::new(&config);
        let mut chain = ChainBuilder::new(0);
        // Last block of the first cycle stretches the next PROPOSAL phase to 3 blocks.
        let mut change = ScheduledChange {
            at: 5,
            param: Param::PhaseProposal,
            value: 3,
        };

        for _ in 0..30 {
            let raw = chain.empty();
            let mut providers: Vec<&mut dyn StateChangeEventsProvider> = vec![&mut change];
            parser.process_block(&raw, &mut state, &mut providers).unwrap();
        }

        let cycles = state.cycles();
        assert_eq!(cycles[1].height_of_first_block(), 6);
        assert_eq!(cycles[1].duration_of_phase(Phase::Proposal), 3);
        assert_eq!(cycles[1].height_of_last_block(), 13);
        assert_eq!(cycles[2].height_of_first_block(), 14);
        assert_eq!(cycles[2].duration(), 8);

        for pair in cycles.windows(2) {
            assert_eq!(pair[0].height_of_last_block() + 1, pair[1].height_of_first_block());
        }
        let period = state.period();
        for height in 0..30 {
            assert_ne!(period.phase_for_height(height), Phase::Undefined, "height {}", height);
        }
        assert_eq!(state.param_value(Param::PhaseProposal, 5), 3);
        assert_eq!(state.param_value(Param::PhaseProposal, 4), 1);
    }

    #[test]
    fn test_period_queries() {
        let config = test_config(0, 1);
        let parser = BlockParser::new(&config);
        let mut state = LedgerState::new(&config);
        let mut chain = ChainBuilder::new(0);
        for _ in 0..8 {
            let mut providers: Vec<&mut dyn StateChangeEventsProvider> = Vec::new();
            parser.process_block(&chain.empty(), &mut state, &mut providers).unwrap();
        }

        let period = state.period();
        assert_eq!(period.chain_height(), 7);
        assert_eq!(period.current_phase(), Phase::Break1);
        assert!(period.is_first_block_in_cycle(6));
        assert!(period.is_last_block_in_cycle(5));
        assert!(period.is_in_phase(4, Phase::VoteReveal));
        assert!(period.is_first_block_of_phase(8, Phase::BlindVote));
        assert!(period.is_last_block_of_phase(7, Phase::Break1));

        // A tx of the first cycle is out of date once the head moved on.
        assert!(!period.is_tx_in_correct_cycle(2, 7));
        assert!(period.is_tx_in_past_cycle(2, 7));
        assert!(period.is_tx_in_correct_cycle(6, 7));
        assert_eq!(period.duration_for_phase(Phase::Break2, 7), 1);
        assert_eq!(period.cycle_index(period.current_cycle().unwrap()), Some(1));
    }
}
