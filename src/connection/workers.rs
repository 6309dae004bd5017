//! Worker registry for load-balanced dispatch.
//!
//! The pool is owned by one [`LoadBalancedConnection`](super::LoadBalancedConnection); no
//! other stage sees it. A worker enters the pool with its first Ready message and leaves
//! on Goodbye, Terminate or disconnect.

use crate::network::PeerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Whether a worker may receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Waiting for work.
    Ready,
    /// Holding one unacknowledged message.
    Busy,
}

/// Per-worker bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    /// Worker identity on the output socket.
    pub worker_id: PeerId,
    /// Current readiness.
    pub readiness: Readiness,
    /// Last time the worker was heard from.
    pub last_seen: DateTime<Utc>,
    /// Messages handed to this worker so far.
    pub dispatched: u64,
}

/// Ready queue plus per-worker state.
///
/// `ready_queue` holds exactly the workers whose readiness is `Ready`, oldest first.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<PeerId, WorkerState>,
    ready_queue: VecDeque<PeerId>,
}

impl WorkerPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `worker` ready, creating it if unknown.
    ///
    /// Returns `false` when the worker was already ready.
    pub fn register_ready(&mut self, worker: &str) -> bool {
        let now = Utc::now();
        match self.workers.get_mut(worker) {
            Some(state) => {
                state.last_seen = now;
                if state.readiness == Readiness::Ready {
                    return false;
                }
                state.readiness = Readiness::Ready;
            }
            None => {
                self.workers.insert(
                    worker.to_string(),
                    WorkerState {
                        worker_id: worker.to_string(),
                        readiness: Readiness::Ready,
                        last_seen: now,
                        dispatched: 0,
                    },
                );
            }
        }
        self.ready_queue.push_back(worker.to_string());
        true
    }

    /// Take the worker that has been ready longest and mark it busy.
    pub fn next_ready(&mut self) -> Option<PeerId> {
        let worker = self.ready_queue.pop_front()?;
        if let Some(state) = self.workers.get_mut(&worker) {
            state.readiness = Readiness::Busy;
            state.dispatched += 1;
        }
        Some(worker)
    }

    /// Drop a worker. Its in-flight message, if any, is not redelivered.
    pub fn remove(&mut self, worker: &str) -> Option<WorkerState> {
        let state = self.workers.remove(worker)?;
        if state.readiness == Readiness::Ready {
            self.ready_queue.retain(|w| w != worker);
        }
        Some(state)
    }

    /// Refresh the last-seen time.
    pub fn touch(&mut self, worker: &str) {
        if let Some(state) = self.workers.get_mut(worker) {
            state.last_seen = Utc::now();
        }
    }

    /// State of one worker.
    pub fn get(&self, worker: &str) -> Option<&WorkerState> {
        self.workers.get(worker)
    }

    /// All workers, unordered.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    /// Number of known workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers waiting for work.
    pub fn ready_count(&self) -> usize {
        self.ready_queue.len()
    }

    /// Workers holding a message.
    pub fn busy_count(&self) -> usize {
        self.workers.len() - self.ready_queue.len()
    }
}
