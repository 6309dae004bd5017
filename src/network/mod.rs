//! Message transport between pipeline stages.
//!
//! A [`Context`] creates [`Socket`]s by binding or connecting to an [`Endpoint`]. Every
//! socket keeps a map of its peers keyed by identity, so a bound socket can address each
//! connected peer individually (the ROUTER pattern) and a connecting socket has exactly
//! one peer: the address it connected to.
//!
//! # Event Flow
//!
//! ```text
//! peer tasks / inproc peers ──SocketEvent──> inbound channel ──recv()──> Incoming
//! Socket::send(peer, msg) ──Outbox──> peer inbound channel (inproc)
//!                                 └──> stream writer task (tcp)
//! ```
//!
//! `send` never waits: it queues to the peer's outbox. `recv` waits only on the inbound
//! channel, which makes it safe to use as a `tokio::select!` branch.
//!
//! # Example
//!
//! ```
//! use daq_collector::network::{Context, Incoming, SocketOptions};
//! use daq_collector::Message;
//!
//! # tokio_test::block_on(async {
//! let ctx = Context::new();
//! let mut hub = ctx.bind("inproc://hub", SocketOptions::new("hub")).await?;
//! let worker = ctx.connect("inproc://hub", SocketOptions::new("w1")).await?;
//!
//! worker.send("inproc://hub", Message::data(&b"event"[..])?)?;
//! assert_eq!(hub.recv().await?, Incoming::Connected("w1".into()));
//! assert!(matches!(hub.recv().await?, Incoming::Message(peer, _) if peer == "w1"));
//! # Ok::<(), daq_collector::CollectorError>(())
//! # }).unwrap();
//! ```

mod endpoint;
mod tcp;

pub use endpoint::Endpoint;

use crate::error::{CollectorError, CollectorResult};
use crate::message::Message;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identity of a peer as seen from one socket.
pub type PeerId = String;

/// How a socket frames outgoing messages on TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketMode {
    /// Length-prefixed encoded messages with an identity handshake.
    #[default]
    Framed,
    /// Payload bytes only; no handshake. For plain storage sinks.
    Raw,
}

/// Options applied when creating a socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Identity announced to the remote side when connecting.
    pub identity: PeerId,
    /// Framing mode.
    pub mode: SocketMode,
}

impl SocketOptions {
    /// Framed socket with the given identity.
    pub fn new(identity: impl Into<PeerId>) -> Self {
        Self {
            identity: identity.into(),
            mode: SocketMode::Framed,
        }
    }

    /// Switch to raw mode.
    pub fn raw(mut self) -> Self {
        self.mode = SocketMode::Raw;
        self
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Event surfaced by [`Socket::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A new peer attached.
    Connected(PeerId),
    /// A message from a peer.
    Message(PeerId, Message),
    /// A peer went away.
    Disconnected(PeerId),
}

pub(crate) enum SocketEvent {
    Connected { peer: PeerId, outbox: Outbox },
    Message { peer: PeerId, message: Message },
    Disconnected { peer: PeerId },
}

/// Sending half towards one peer.
pub(crate) enum Outbox {
    /// Pushes straight into the peer socket's inbound channel, tagged with our identity.
    Inproc {
        events: mpsc::UnboundedSender<SocketEvent>,
        from: PeerId,
    },
    /// Feeds the writer task of a TCP stream.
    Stream(mpsc::UnboundedSender<Message>),
}

impl Outbox {
    fn deliver(&self, message: Message) -> bool {
        match self {
            Outbox::Inproc { events, from } => events
                .send(SocketEvent::Message {
                    peer: from.clone(),
                    message,
                })
                .is_ok(),
            Outbox::Stream(tx) => tx.send(message).is_ok(),
        }
    }

    fn hang_up(&self) {
        // Streams close when the writer channel is dropped.
        if let Outbox::Inproc { events, from } = self {
            let _ = events.send(SocketEvent::Disconnected { peer: from.clone() });
        }
    }
}

type InprocRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SocketEvent>>>>;

/// Factory for sockets; owns the registry of bound `inproc://` endpoints.
///
/// Clones share the same registry. Stages that talk over `inproc://` must use the same
/// context.
#[derive(Clone, Default)]
pub struct Context {
    inproc: InprocRegistry,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket that accepts any number of peers.
    pub async fn bind(&self, address: &str, options: SocketOptions) -> CollectorResult<Socket> {
        let endpoint = Endpoint::parse(address)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut socket = match &endpoint {
            Endpoint::Inproc(name) => {
                let mut registry = self.inproc.lock();
                if registry.get(name).is_some_and(|bound| !bound.is_closed()) {
                    return Err(CollectorError::Bind {
                        address: endpoint.to_string(),
                        reason: "address already in use".into(),
                    });
                }
                registry.insert(name.clone(), tx.clone());
                drop(registry);

                let mut socket = Socket::new(endpoint.to_string(), &options, tx, rx);
                socket.registration = Some((self.inproc.clone(), name.clone()));
                socket
            }
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr)
                        .await
                        .map_err(|e| CollectorError::Bind {
                            address: endpoint.to_string(),
                            reason: e.to_string(),
                        })?;
                let local = listener.local_addr()?;
                let acceptor = tcp::spawn_acceptor(listener, options.mode, tx.clone());

                let mut socket = Socket::new(format!("tcp://{local}"), &options, tx, rx);
                socket.tasks.push(acceptor);
                socket
            }
        };

        socket.endpoint = Some(endpoint);
        debug!(address = %socket.local_address, "socket bound");
        Ok(socket)
    }

    /// Connect a socket to a bound endpoint. The bound side becomes the only peer,
    /// identified by its address.
    pub async fn connect(&self, address: &str, options: SocketOptions) -> CollectorResult<Socket> {
        let endpoint = Endpoint::parse(address)?;
        let peer = endpoint.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut reader = None;
        let outbox = match &endpoint {
            Endpoint::Inproc(name) => {
                let bound = self.inproc.lock().get(name).cloned().ok_or_else(|| {
                    CollectorError::Bind {
                        address: peer.clone(),
                        reason: "no socket bound to this address".into(),
                    }
                })?;
                bound
                    .send(SocketEvent::Connected {
                        peer: options.identity.clone(),
                        outbox: Outbox::Inproc {
                            events: tx.clone(),
                            from: peer.clone(),
                        },
                    })
                    .map_err(|_| CollectorError::TransportClosed(peer.clone()))?;
                Outbox::Inproc {
                    events: bound,
                    from: options.identity.clone(),
                }
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| CollectorError::Bind {
                        address: peer.clone(),
                        reason: e.to_string(),
                    })?;
                let (outbox, task) =
                    tcp::attach_outgoing(stream, peer.clone(), &options, tx.clone()).await?;
                reader = Some(task);
                outbox
            }
        };

        let mut socket = Socket::new(peer.clone(), &options, tx, rx);
        socket.endpoint = Some(endpoint);
        socket.tasks.extend(reader);
        socket.peers.insert(peer, outbox);
        Ok(socket)
    }
}

/// One end of a connection, owned by exactly one connection object.
pub struct Socket {
    endpoint: Option<Endpoint>,
    local_address: String,
    identity: PeerId,
    peers: BTreeMap<PeerId, Outbox>,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
    // Keeps the inbound channel open while the socket lives.
    _loopback: mpsc::UnboundedSender<SocketEvent>,
    registration: Option<(InprocRegistry, String)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Socket {
    fn new(
        local_address: String,
        options: &SocketOptions,
        loopback: mpsc::UnboundedSender<SocketEvent>,
        inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self {
            endpoint: None,
            local_address,
            identity: options.identity.clone(),
            peers: BTreeMap::new(),
            inbound,
            _loopback: loopback,
            registration: None,
            tasks: Vec::new(),
        }
    }

    /// Endpoint this socket was created for.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Resolved address; for `tcp://host:0` this carries the assigned port.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Identity announced when connecting.
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Currently attached peers, in identity order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// Whether `peer` is attached.
    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue a message for one peer. Never waits.
    pub fn send(&self, peer: &str, message: Message) -> CollectorResult<()> {
        let outbox = self
            .peers
            .get(peer)
            .ok_or_else(|| CollectorError::PeerNotConnected(peer.to_string()))?;
        if outbox.deliver(message) {
            Ok(())
        } else {
            Err(CollectorError::PeerNotConnected(peer.to_string()))
        }
    }

    /// Queue a copy of the message for every peer; returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> CollectorResult<usize> {
        if self.peers.is_empty() {
            return Err(CollectorError::NoPeers(self.local_address.clone()));
        }
        Ok(self
            .peers
            .values()
            .filter(|outbox| outbox.deliver(message.clone()))
            .count())
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn recv(&mut self) -> CollectorResult<Incoming> {
        let event = self
            .inbound
            .recv()
            .await
            .ok_or_else(|| CollectorError::TransportClosed(self.local_address.clone()))?;
        Ok(self.apply(event))
    }

    /// Non-blocking poll for the next event.
    pub fn try_recv(&mut self) -> CollectorResult<Option<Incoming>> {
        match self.inbound.try_recv() {
            Ok(event) => Ok(Some(self.apply(event))),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(
                CollectorError::TransportClosed(self.local_address.clone()),
            ),
        }
    }

    fn apply(&mut self, event: SocketEvent) -> Incoming {
        match event {
            SocketEvent::Connected { peer, outbox } => {
                if self.peers.insert(peer.clone(), outbox).is_some() {
                    warn!(%peer, address = %self.local_address, "peer reconnected, replacing previous connection");
                } else {
                    debug!(%peer, address = %self.local_address, "peer connected");
                }
                Incoming::Connected(peer)
            }
            SocketEvent::Message { peer, message } => Incoming::Message(peer, message),
            SocketEvent::Disconnected { peer } => {
                self.peers.remove(&peer);
                debug!(%peer, address = %self.local_address, "peer disconnected");
                Incoming::Disconnected(peer)
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        for outbox in self.peers.values() {
            outbox.hang_up();
        }
        if let Some((registry, name)) = self.registration.take() {
            registry.lock().remove(&name);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local_address", &self.local_address)
            .field("identity", &self.identity)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}
