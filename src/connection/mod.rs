//! Connection abstractions composed by the collector apps.
//!
//! Every collector owns one [`InputConnection`] and one [`OutputConnection`]:
//!
//! - [`ConfirmedConnection`]: input that acknowledges every data message to its sender.
//! - [`ConfirmedOutput`]: the sending half of that protocol; tracks unconfirmed messages.
//! - [`LoadBalancedConnection`]: output that hands each message to the oldest ready
//!   worker, at most one in flight per worker.
//! - [`RawConnection`]: unbuffered, always-ready output towards a storage sink.
//! - [`DataAndRoiOutput`]: two raw outputs fed from one logical event.
//!
//! Both traits expose a cancel-safe `async` wait, so the app's event loop can put every
//! connection into a single `tokio::select!`.

pub mod confirmed;
pub mod load_balanced;
pub mod raw;
pub mod workers;

pub use confirmed::{ConfirmedConnection, ConfirmedOutput};
pub use load_balanced::LoadBalancedConnection;
pub use raw::{DataAndRoiOutput, PairDelivery, RawConnection};
pub use workers::{Readiness, WorkerPool, WorkerState};

use crate::error::CollectorResult;
use crate::message::{Message, MessageKind, SequenceId};
use crate::network::PeerId;
use crate::state::StopCounter;
use async_trait::async_trait;

/// A data message accepted by an input connection.
#[derive(Debug)]
pub struct Received {
    /// Sender identity.
    pub peer: PeerId,
    /// The data message.
    pub message: Message,
    /// Outcome of sending the confirmation. The message is delivered either way.
    pub confirmation: CollectorResult<()>,
}

/// Event produced by an input connection.
#[derive(Debug)]
pub enum InputEvent {
    /// Data to forward.
    Data(Received),
    /// Start, Stop or Terminate from an upstream peer.
    Signal {
        /// Signal kind.
        kind: MessageKind,
        /// Sender identity.
        peer: PeerId,
    },
    /// An upstream peer connected.
    PeerJoined(PeerId),
    /// An upstream peer disconnected.
    PeerLeft(PeerId),
    /// Any other message kind; never forwarded.
    Other {
        /// Sender identity.
        peer: PeerId,
        /// The message as received.
        message: Message,
    },
}

/// Result of handing a message to an output connection.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The message was queued for delivery.
    Sent,
    /// No worker is ready. Nothing happened; the message is handed back for retry.
    Backpressure(Message),
    /// Lax mode discarded the message because no worker was ready.
    Dropped,
}

impl DispatchOutcome {
    /// Whether the message went out.
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent)
    }
}

/// Event produced by an output connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A worker became ready for one more message.
    WorkerReady(PeerId),
    /// A downstream peer connected.
    PeerJoined(PeerId),
    /// A downstream peer left or said goodbye.
    PeerLeft(PeerId),
    /// Downstream confirmed a message.
    Confirmed(SequenceId),
    /// Nothing the app needs to act on.
    Ignored,
}

/// Receiving side of a collector.
#[async_trait]
pub trait InputConnection: Send {
    /// Wait for the next event. Cancel-safe.
    async fn receive(&mut self) -> CollectorResult<InputEvent>;

    /// Wait for the next event that is not data. Cancel-safe.
    ///
    /// Used while the output cannot take work: data arriving meanwhile stays
    /// unacknowledged until a later [`receive`](Self::receive) returns it.
    async fn receive_control(&mut self) -> CollectorResult<InputEvent>;

    /// Non-blocking variant of [`receive`](Self::receive).
    fn try_receive(&mut self) -> CollectorResult<Option<InputEvent>>;

    /// Upstream peers currently known to this connection.
    fn upstream_peers(&self) -> Vec<PeerId>;

    /// Stop bookkeeping for this connection.
    fn stop_counter(&self) -> &StopCounter;

    /// Mutable stop bookkeeping for this connection.
    fn stop_counter_mut(&mut self) -> &mut StopCounter;

    /// JSON snapshot for monitoring.
    fn status(&self) -> serde_json::Value;
}

/// Sending side of a collector.
#[async_trait]
pub trait OutputConnection: Send {
    /// Whether a dispatch right now would go out.
    fn is_ready(&self) -> bool;

    /// Hand one data message downstream.
    fn dispatch(&mut self, message: Message) -> CollectorResult<DispatchOutcome>;

    /// Forward a Stop or Terminate to the downstream peers.
    fn send_signal(&mut self, kind: MessageKind) -> CollectorResult<()>;

    /// Wait for the next event from downstream. Cancel-safe.
    async fn next_event(&mut self) -> CollectorResult<OutputEvent>;

    /// JSON snapshot for monitoring.
    fn status(&self) -> serde_json::Value;
}
