// src/snapshot.rs - Periodic ledger snapshots and rollback

use crate::config::DaoConfig;
use crate::state::LedgerState;
use crate::storage::{DaoStore, StorageError};
use log::{debug, info, warn};

pub const SNAPSHOT_GRID: u32 = 10_000;

/// Lowest height eligible for a snapshot. Keeps the first snapshot at least
/// three grid widths above genesis.
pub fn snapshot_floor(genesis_height: u32, height: u32, grid: u32) -> u32 {
    let base = genesis_height.saturating_add(grid.saturating_mul(3)).max(height);
    (base / grid * grid).saturating_sub(grid)
}

pub fn is_snapshot_height(genesis_height: u32, height: u32, grid: u32) -> bool {
    grid > 0 && height % grid == 0 && height >= snapshot_floor(genesis_height, height, grid)
}

/// Holds an in-memory candidate taken at one snapshot height and persists it
/// at the next, so a persisted snapshot is always at least one grid behind the tip.
pub struct SnapshotManager {
    store: DaoStore,
    grid: u32,
    genesis_height: u32,
    candidate: Option<LedgerState>,
}

impl SnapshotManager {
    pub fn new(store: DaoStore, config: &DaoConfig) -> Self {
        Self::with_grid(store, config, SNAPSHOT_GRID)
    }

    pub fn with_grid(store: DaoStore, config: &DaoConfig, grid: u32) -> Self {
        Self {
            store,
            grid,
            genesis_height: config.genesis_block_height,
            candidate: None,
        }
    }

    pub fn candidate_height(&self) -> Option<u32> {
        self.candidate.as_ref().map(|c| c.chain_height())
    }

    pub fn on_chain_height_changed(&mut self, state: &LedgerState) -> Result<(), StorageError> {
        let height = state.chain_height();
        if !is_snapshot_height(self.genesis_height, height, self.grid) || self.candidate_height() == Some(height) {
            return Ok(());
        }
        if let Some(candidate) = self.candidate.take() {
            self.store.save_snapshot(&candidate)?;
            info!(
                "[SNAPSHOT] Persisted snapshot of height {} at height {}.",
                candidate.chain_height(),
                height
            );
        }
        self.candidate = Some(state.clone());
        debug!("[SNAPSHOT] New snapshot candidate at height {}.", height);
        Ok(())
    }

    /// Loads the latest persisted snapshot into `state`. Returns false if none exists.
    pub fn apply_snapshot(&self, state: &mut LedgerState) -> Result<bool, StorageError> {
        match self.store.load_latest_snapshot()? {
            Some(snapshot) => {
                info!("[SNAPSHOT] Applying snapshot at height {}.", snapshot.chain_height());
                state.apply_snapshot(snapshot);
                Ok(true)
            }
            None => {
                info!("[SNAPSHOT] No persisted snapshot available.");
                Ok(false)
            }
        }
    }

    /// Drops the candidate and restores the last persisted snapshot, or a
    /// fresh genesis state. Returns the height to resume parsing from.
    pub fn reset_to_last_snapshot(&mut self, state: &mut LedgerState, config: &DaoConfig) -> Result<u32, StorageError> {
        self.candidate = None;
        if !self.apply_snapshot(state)? {
            warn!("[SNAPSHOT] Rolling back to genesis height {}.", config.genesis_block_height);
            *state = LedgerState::new(config);
        }
        Ok(state.next_block_height())
    }
}
