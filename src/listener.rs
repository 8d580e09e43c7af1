// src/listener.rs - Block-added notification and the read-only state facade

use crate::block::Block;
use crate::period::Phase;
use crate::state::LedgerState;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Observers that must see every block on the writer before the next height
/// is processed.
pub trait StateListener: Send {
    fn on_block_added(&mut self, block: &Block, state: &LedgerState);
}

/// Summary sent to user-context subscribers. Receiving it never blocks the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub height: u32,
    pub phase: Phase,
    pub tx_count: usize,
    pub unspent_bsq: u64,
}

#[derive(Default)]
pub struct ListenerRegistry {
    parser_listeners: Vec<Box<dyn StateListener>>,
    user_subscribers: Vec<mpsc::UnboundedSender<StateUpdate>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parser_listener(&mut self, listener: Box<dyn StateListener>) {
        self.parser_listeners.push(listener);
    }

    pub fn subscribe_user_context(&mut self) -> mpsc::UnboundedReceiver<StateUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.user_subscribers.push(tx);
        rx
    }

    pub fn parser_listener_count(&self) -> usize {
        self.parser_listeners.len()
    }

    pub fn user_subscriber_count(&self) -> usize {
        self.user_subscribers.len()
    }

    /// Calls parser listeners in registration order, then queues an update for
    /// each user subscriber. Subscribers whose receiver was dropped are removed.
    pub fn notify_block_added(&mut self, block: &Block, state: &LedgerState) {
        for listener in self.parser_listeners.iter_mut() {
            listener.on_block_added(block, state);
        }
        if self.user_subscribers.is_empty() {
            return;
        }
        let update = StateUpdate {
            height: block.height,
            phase: state.period().phase_for_height(block.height),
            tx_count: block.tx_ids.len(),
            unspent_bsq: state.total_unspent_bsq(),
        };
        let before = self.user_subscribers.len();
        self.user_subscribers.retain(|s| s.send(update.clone()).is_ok());
        if self.user_subscribers.len() < before {
            debug!("[LISTENER] Dropped {} closed subscribers.", before - self.user_subscribers.len());
        }
    }
}

/// Read-only view of the ledger for other threads. The shared copy is swapped
/// whole, so readers never observe a block half applied. While a batch of
/// blocks is replayed the swap is deferred to the end of the batch, otherwise
/// a long replay would copy the whole ledger once per block.
#[derive(Clone)]
pub struct StateFacade {
    inner: Arc<RwLock<Arc<LedgerState>>>,
    deferred: Arc<AtomicBool>,
}

impl StateFacade {
    pub fn new(state: &LedgerState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(state.clone()))),
            deferred: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self) -> Arc<LedgerState> {
        self.inner.read().clone()
    }

    pub fn chain_height(&self) -> u32 {
        self.inner.read().chain_height()
    }

    /// Publishes `state` regardless of deferral.
    pub fn update(&self, state: &LedgerState) {
        let copy = Arc::new(state.clone());
        *self.inner.write() = copy;
    }

    /// Publishes `state` unless updates are deferred.
    pub fn refresh(&self, state: &LedgerState) {
        if !self.deferred.load(Ordering::Acquire) {
            self.update(state);
        }
    }

    pub fn defer_updates(&self) {
        self.deferred.store(true, Ordering::Release);
    }

    /// Ends deferral and publishes the state reached by the batch. Nothing is
    /// copied when the batch left the chain head unchanged.
    pub fn resume_updates(&self, state: &LedgerState) {
        self.deferred.store(false, Ordering::Release);
        let stale = {
            let current = self.inner.read();
            current.last_block().map(|b| b.hash) != state.last_block().map(|b| b.hash)
        };
        if stale {
            self.update(state);
        }
    }
}

impl StateListener for StateFacade {
    fn on_block_added(&mut self, _block: &Block, state: &LedgerState) {
        self.refresh(state);
    }
}
