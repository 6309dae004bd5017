//! Confirmed delivery: every accepted data message is acknowledged to its sender.

use super::{DispatchOutcome, InputConnection, InputEvent, OutputConnection, OutputEvent, Received};
use crate::error::{CollectorError, CollectorResult};
use crate::message::{Message, MessageKind, SequenceId};
use crate::network::{Context, Incoming, PeerId, Socket, SocketOptions};
use crate::state::StopCounter;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Input side of the confirmed protocol.
///
/// The confirmation for a data message is queued on the socket before the message is
/// returned, so per peer it always precedes anything the caller does next.
///
/// Data read by [`receive_control`](InputConnection::receive_control) is held back
/// unconfirmed and handed out, oldest first, by the next [`receive`](InputConnection::receive).
#[derive(Debug)]
pub struct ConfirmedConnection {
    socket: Socket,
    upstream: BTreeSet<PeerId>,
    held: VecDeque<(PeerId, Message)>,
    stop_counter: StopCounter,
    received: u64,
    confirmed: u64,
    confirmation_failures: u64,
}

impl ConfirmedConnection {
    /// Bind the input socket.
    pub async fn bind(ctx: &Context, address: &str, options: SocketOptions) -> CollectorResult<Self> {
        let socket = ctx.bind(address, options).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: Socket) -> Self {
        Self {
            socket,
            upstream: BTreeSet::new(),
            held: VecDeque::new(),
            stop_counter: StopCounter::new(),
            received: 0,
            confirmed: 0,
            confirmation_failures: 0,
        }
    }

    /// Address the input listens on.
    pub fn local_address(&self) -> &str {
        self.socket.local_address()
    }

    /// Data messages read but not yet confirmed.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    fn deliver(&mut self, peer: PeerId, message: Message) -> InputEvent {
        self.received += 1;
        let confirmation = self.confirm(&peer, message.sequence_id());
        InputEvent::Data(Received {
            peer,
            message,
            confirmation,
        })
    }

    fn handle(&mut self, incoming: Incoming) -> InputEvent {
        match incoming {
            Incoming::Connected(peer) => {
                self.upstream.insert(peer.clone());
                InputEvent::PeerJoined(peer)
            }
            Incoming::Disconnected(peer) => {
                self.upstream.remove(&peer);
                InputEvent::PeerLeft(peer)
            }
            Incoming::Message(peer, message) => {
                if self.upstream.insert(peer.clone()) {
                    debug!(%peer, "upstream peer registered by first message");
                }
                match message.kind() {
                    MessageKind::Data => self.deliver(peer, message),
                    kind if kind.is_signal() => InputEvent::Signal { kind, peer },
                    _ => InputEvent::Other { peer, message },
                }
            }
        }
    }

    fn confirm(&mut self, peer: &str, seq: Option<SequenceId>) -> CollectorResult<()> {
        match self.socket.send(peer, Message::confirm(seq)) {
            Ok(()) => {
                self.confirmed += 1;
                trace!(%peer, ?seq, "confirmed");
                Ok(())
            }
            Err(e) => {
                self.confirmation_failures += 1;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl InputConnection for ConfirmedConnection {
    async fn receive(&mut self) -> CollectorResult<InputEvent> {
        if let Some((peer, message)) = self.held.pop_front() {
            return Ok(self.deliver(peer, message));
        }
        let incoming = self.socket.recv().await?;
        Ok(self.handle(incoming))
    }

    async fn receive_control(&mut self) -> CollectorResult<InputEvent> {
        loop {
            match self.socket.recv().await? {
                Incoming::Message(peer, message) if message.is_data() => {
                    self.upstream.insert(peer.clone());
                    trace!(%peer, held = self.held.len() + 1, "data held back");
                    self.held.push_back((peer, message));
                }
                incoming => return Ok(self.handle(incoming)),
            }
        }
    }

    fn try_receive(&mut self) -> CollectorResult<Option<InputEvent>> {
        if let Some((peer, message)) = self.held.pop_front() {
            return Ok(Some(self.deliver(peer, message)));
        }
        Ok(self.socket.try_recv()?.map(|incoming| self.handle(incoming)))
    }

    fn upstream_peers(&self) -> Vec<PeerId> {
        self.upstream.iter().cloned().collect()
    }

    fn stop_counter(&self) -> &StopCounter {
        &self.stop_counter
    }

    fn stop_counter_mut(&mut self) -> &mut StopCounter {
        &mut self.stop_counter
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": "confirmed",
            "address": self.socket.local_address(),
            "peers": self.upstream,
            "received": self.received,
            "confirmed": self.confirmed,
            "confirmation_failures": self.confirmation_failures,
            "held": self.held.len(),
            "stop_signals": self.stop_counter.count(),
            "stopped_peers": self.stop_counter.stopped_peers().collect::<Vec<_>>(),
        })
    }
}

/// Sending side of the confirmed protocol.
///
/// Numbers outgoing data messages and keeps every sequence id until the matching
/// confirmation arrives. Ready whenever the downstream input is connected.
#[derive(Debug)]
pub struct ConfirmedOutput {
    socket: Socket,
    peer: PeerId,
    next_sequence: SequenceId,
    unconfirmed: BTreeSet<SequenceId>,
    sent: u64,
    confirmed: u64,
    unknown_confirmations: u64,
}

impl ConfirmedOutput {
    /// Connect to a downstream [`ConfirmedConnection`].
    pub async fn connect(ctx: &Context, address: &str, options: SocketOptions) -> CollectorResult<Self> {
        let socket = ctx.connect(address, options).await?;
        let peer = socket
            .peers()
            .next()
            .cloned()
            .ok_or_else(|| CollectorError::NoPeers(address.to_string()))?;
        Ok(Self {
            socket,
            peer,
            next_sequence: 0,
            unconfirmed: BTreeSet::new(),
            sent: 0,
            confirmed: 0,
            unknown_confirmations: 0,
        })
    }

    /// Sequence ids sent but not yet confirmed, oldest first.
    pub fn unconfirmed(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.unconfirmed.iter().copied()
    }

    /// Number of unconfirmed messages.
    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    fn handle(&mut self, incoming: Incoming) -> OutputEvent {
        match incoming {
            Incoming::Connected(peer) => OutputEvent::PeerJoined(peer),
            Incoming::Disconnected(peer) => {
                warn!(%peer, unconfirmed = self.unconfirmed.len(), "downstream input went away");
                OutputEvent::PeerLeft(peer)
            }
            Incoming::Message(peer, message) => match (message.kind(), message.sequence_id()) {
                (MessageKind::Confirm, Some(seq)) if self.unconfirmed.remove(&seq) => {
                    self.confirmed += 1;
                    OutputEvent::Confirmed(seq)
                }
                (MessageKind::Confirm, seq) => {
                    self.unknown_confirmations += 1;
                    warn!(%peer, ?seq, "confirmation for unknown sequence id ignored");
                    OutputEvent::Ignored
                }
                (kind, _) => {
                    warn!(%peer, %kind, "unexpected message from downstream ignored");
                    OutputEvent::Ignored
                }
            },
        }
    }
}

#[async_trait]
impl OutputConnection for ConfirmedOutput {
    fn is_ready(&self) -> bool {
        self.socket.has_peer(&self.peer)
    }

    fn dispatch(&mut self, message: Message) -> CollectorResult<DispatchOutcome> {
        let seq = self.next_sequence;
        self.socket.send(&self.peer, message.with_sequence(seq))?;
        self.next_sequence += 1;
        self.unconfirmed.insert(seq);
        self.sent += 1;
        Ok(DispatchOutcome::Sent)
    }

    fn send_signal(&mut self, kind: MessageKind) -> CollectorResult<()> {
        self.socket.send(&self.peer, Message::control(kind))
    }

    async fn next_event(&mut self) -> CollectorResult<OutputEvent> {
        let incoming = self.socket.recv().await?;
        Ok(self.handle(incoming))
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": "confirmed_output",
            "address": self.peer,
            "connected": self.is_ready(),
            "sent": self.sent,
            "confirmed": self.confirmed,
            "unconfirmed": self.unconfirmed.len(),
            "unknown_confirmations": self.unknown_confirmations,
        })
    }
}
