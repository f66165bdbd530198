//! Execution queue and concurrency gate.
//!
//! Executions are admitted in FIFO order. `drain` hands out queued ids only
//! while the running set is below the configured bound, so the active count
//! never exceeds `max_running`. Enqueueing never blocks or rejects.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    running: HashSet<Uuid>,
}

/// FIFO admission queue bounding concurrently running executions.
#[derive(Debug)]
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    max_running: usize,
}

impl ExecutionQueue {
    /// `max_running` is floored at 1.
    pub fn new(max_running: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_running: max_running.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, id: Uuid) {
        self.lock().pending.push_back(id);
    }

    /// Pop queued ids into the running set while capacity allows.
    ///
    /// The caller must dispatch every returned id.
    pub fn drain(&self) -> Vec<Uuid> {
        let mut state = self.lock();
        let mut admitted = Vec::new();
        while state.running.len() < self.max_running {
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            state.running.insert(id);
            admitted.push(id);
        }
        admitted
    }

    /// Release the running slot held by `id`.
    pub fn complete(&self, id: Uuid) -> bool {
        self.lock().running.remove(&id)
    }

    /// Remove a still-queued id. Returns false if it was not pending.
    pub fn remove_pending(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        match state.pending.iter().position(|p| *p == id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empty the queue, returning what was pending in admission order.
    pub fn take_pending(&self) -> Vec<Uuid> {
        self.lock().pending.drain(..).collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }
}
