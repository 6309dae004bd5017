//! Stop bookkeeping and the drain state machine.
//!
//! ```text
//!            Stop                    timeout / every upstream peer stopped
//! Running ─────────> Draining ──────────────────────────────────────────> Stopped   (Forward)
//!    ^                  │  └───────────────────────────────────────────> Running   (Reset)
//!    └──── Start ───────┘
//! ```
//!
//! The drain clock is the [`StopCounter`]'s last-event instant: it is set when the
//! machine enters `Draining` and moved forward by every accepted data message, so
//! continued traffic postpones the forced stop. Further Stop signals never move it.

use crate::network::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::time::{Duration, Instant};

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    /// Normal dispatch.
    Running,
    /// A Stop was seen; waiting for the remaining peers or the timeout.
    Draining,
    /// Stop was forwarded downstream. Terminal for this run.
    Stopped,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollectorState::Running => "running",
            CollectorState::Draining => "draining",
            CollectorState::Stopped => "stopped",
        })
    }
}

/// How a drain completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Forward Stop downstream and stop.
    Forward,
    /// Terminal stage: clear the stop bookkeeping and keep running.
    Reset,
    /// Count Stop signals, never change state.
    Ignore,
}

/// Side effect the app has to carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    /// Nothing to do.
    None,
    /// Send Stop to the output peers.
    ForwardStop,
    /// Stop bookkeeping was cleared; the stage is running again.
    Reset,
}

/// Distinct peers that reported Stop, plus the time of the last observed event.
#[derive(Debug, Default, Clone)]
pub struct StopCounter {
    stopped: BTreeSet<PeerId>,
    last_event: Option<Instant>,
}

impl StopCounter {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a Stop from `peer`. Returns `false` for a repeated Stop.
    pub fn record_stop(&mut self, peer: &str) -> bool {
        self.stopped.insert(peer.to_string())
    }

    /// Number of distinct peers that sent Stop.
    pub fn count(&self) -> usize {
        self.stopped.len()
    }

    /// Whether `peer` has sent Stop.
    pub fn has_stopped(&self, peer: &str) -> bool {
        self.stopped.contains(peer)
    }

    /// Peers that sent Stop.
    pub fn stopped_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.stopped.iter()
    }

    /// True when `peers` is non-empty and every one of them has sent Stop.
    pub fn covers<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>) -> bool {
        let mut any = false;
        for peer in peers {
            if !self.stopped.contains(peer) {
                return false;
            }
            any = true;
        }
        any
    }

    /// Mark an event at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_event = Some(now);
    }

    /// Instant of the last event, if any.
    pub fn last_event(&self) -> Option<Instant> {
        self.last_event
    }

    /// Time elapsed since the last event.
    pub fn since_last_event(&self, now: Instant) -> Option<Duration> {
        self.last_event.map(|t| now.saturating_duration_since(t))
    }

    /// Forget all Stop signals and the event clock.
    pub fn reset(&mut self) {
        self.stopped.clear();
        self.last_event = None;
    }
}

/// State machine deciding when a drain completes.
#[derive(Debug, Clone)]
pub struct DrainMachine {
    state: CollectorState,
    policy: DrainPolicy,
    stop_waiting_time: Duration,
}

impl DrainMachine {
    /// New machine in `Running`.
    pub fn new(policy: DrainPolicy, stop_waiting_time: Duration) -> Self {
        Self {
            state: CollectorState::Running,
            policy,
            stop_waiting_time,
        }
    }

    /// Current state.
    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Completion policy.
    pub fn policy(&self) -> DrainPolicy {
        self.policy
    }

    /// Configured drain timeout.
    pub fn stop_waiting_time(&self) -> Duration {
        self.stop_waiting_time
    }

    /// A data message was accepted for dispatch.
    pub fn on_data(&mut self, counter: &mut StopCounter, now: Instant) {
        counter.touch(now);
    }

    /// Start signal: a drain is abandoned; otherwise nothing changes.
    pub fn on_start(&mut self, counter: &mut StopCounter) -> DrainAction {
        match self.state {
            CollectorState::Draining => {
                counter.reset();
                self.state = CollectorState::Running;
            }
            CollectorState::Running => {
                // Only the Ignore policy can hold counts while running.
                if counter.count() > 0 {
                    counter.reset();
                }
            }
            CollectorState::Stopped => {}
        }
        DrainAction::None
    }

    /// Stop signal from `peer`. `upstream` are the peers the input currently knows.
    pub fn on_stop(
        &mut self,
        counter: &mut StopCounter,
        peer: &str,
        upstream: &[PeerId],
        now: Instant,
    ) -> DrainAction {
        if self.state == CollectorState::Stopped {
            return DrainAction::None;
        }
        counter.record_stop(peer);
        if self.policy == DrainPolicy::Ignore {
            return DrainAction::None;
        }

        if self.state == CollectorState::Running {
            self.state = CollectorState::Draining;
            counter.touch(now);
        }
        self.complete_if_covered(counter, upstream)
    }

    /// An upstream peer went away; the remaining ones may all have stopped already.
    pub fn on_peer_left(&mut self, counter: &mut StopCounter, upstream: &[PeerId]) -> DrainAction {
        if self.state != CollectorState::Draining {
            return DrainAction::None;
        }
        self.complete_if_covered(counter, upstream)
    }

    /// When the drain times out, if a drain is in progress.
    pub fn deadline(&self, counter: &StopCounter) -> Option<Instant> {
        if self.state != CollectorState::Draining || self.policy == DrainPolicy::Ignore {
            return None;
        }
        counter.last_event().map(|t| t + self.stop_waiting_time)
    }

    /// Timer fired. Completes the drain only if the deadline really passed.
    pub fn on_timeout(&mut self, counter: &mut StopCounter, now: Instant) -> DrainAction {
        match self.deadline(counter) {
            Some(deadline) if now >= deadline => self.complete(counter),
            _ => DrainAction::None,
        }
    }

    fn complete_if_covered(&mut self, counter: &mut StopCounter, upstream: &[PeerId]) -> DrainAction {
        if counter.covers(upstream) {
            self.complete(counter)
        } else {
            DrainAction::None
        }
    }

    fn complete(&mut self, counter: &mut StopCounter) -> DrainAction {
        match self.policy {
            DrainPolicy::Forward => {
                self.state = CollectorState::Stopped;
                DrainAction::ForwardStop
            }
            DrainPolicy::Reset => {
                counter.reset();
                self.state = CollectorState::Running;
                DrainAction::Reset
            }
            DrainPolicy::Ignore => DrainAction::None,
        }
    }
}
