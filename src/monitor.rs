//! Out-of-band control channel.
//!
//! Controllers connect to the monitoring socket and send Start, Stop, Terminate or a
//! StatusRequest. Status requests are answered on the same socket with a Status message
//! carrying the app's JSON snapshot. [`MonitorClient`] is the controller end.

use crate::error::{CollectorError, CollectorResult};
use crate::message::{Message, MessageKind};
use crate::network::{Context, Incoming, PeerId, Socket, SocketOptions};
use tracing::{debug, warn};

/// Event read from the monitoring channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Start, Stop or Terminate.
    Signal {
        /// Signal kind.
        kind: MessageKind,
        /// Controller that sent it.
        peer: PeerId,
    },
    /// A controller asks for the status snapshot.
    StatusRequest {
        /// Controller to answer.
        peer: PeerId,
    },
    /// Connection churn or an unsupported message.
    Ignored,
}

/// Bound monitoring socket of one app.
#[derive(Debug)]
pub struct MonitoringConnection {
    socket: Socket,
}

impl MonitoringConnection {
    /// Bind the monitoring socket.
    pub async fn bind(ctx: &Context, address: &str, options: SocketOptions) -> CollectorResult<Self> {
        Ok(Self {
            socket: ctx.bind(address, options).await?,
        })
    }

    /// Address controllers connect to.
    pub fn local_address(&self) -> &str {
        self.socket.local_address()
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn receive(&mut self) -> CollectorResult<MonitorEvent> {
        let incoming = self.socket.recv().await?;
        Ok(classify(incoming))
    }

    /// Non-blocking poll.
    pub fn try_receive(&mut self) -> CollectorResult<Option<MonitorEvent>> {
        Ok(self.socket.try_recv()?.map(classify))
    }

    /// Answer a status request.
    pub fn reply_status(&self, peer: &str, snapshot: &serde_json::Value) -> CollectorResult<()> {
        self.socket.send(peer, Message::status(snapshot))
    }
}

/// Controller connected to a stage's monitoring channel.
#[derive(Debug)]
pub struct MonitorClient {
    socket: Socket,
    stage: PeerId,
}

impl MonitorClient {
    /// Connect to the monitoring address of a running stage.
    pub async fn connect(ctx: &Context, address: &str, options: SocketOptions) -> CollectorResult<Self> {
        let socket = ctx.connect(address, options).await?;
        // The stage is keyed by its normalised address, not the string given here.
        let stage = socket
            .peers()
            .next()
            .cloned()
            .ok_or_else(|| CollectorError::NoPeers(address.to_string()))?;
        Ok(Self { socket, stage })
    }

    /// Address the stage is known by.
    pub fn stage(&self) -> &PeerId {
        &self.stage
    }

    /// Send Start, Stop or Terminate.
    pub fn signal(&self, kind: MessageKind) -> CollectorResult<()> {
        self.socket.send(&self.stage, Message::control(kind))
    }

    /// Request the status snapshot and wait for the reply.
    pub async fn status(&mut self) -> CollectorResult<serde_json::Value> {
        self.signal(MessageKind::StatusRequest)?;
        loop {
            match self.socket.recv().await? {
                Incoming::Message(_, message) if message.kind() == MessageKind::Status => {
                    return message.status_json();
                }
                Incoming::Disconnected(peer) => return Err(CollectorError::TransportClosed(peer)),
                _ => {}
            }
        }
    }

    /// Wait until the stage closes the connection.
    pub async fn closed(&mut self) {
        loop {
            match self.socket.recv().await {
                Ok(Incoming::Disconnected(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn classify(incoming: Incoming) -> MonitorEvent {
    match incoming {
        Incoming::Message(peer, message) => match message.kind() {
            kind if kind.is_signal() => MonitorEvent::Signal { kind, peer },
            MessageKind::StatusRequest => MonitorEvent::StatusRequest { peer },
            kind => {
                warn!(%peer, %kind, "unsupported message on monitoring channel ignored");
                MonitorEvent::Ignored
            }
        },
        Incoming::Connected(peer) => {
            debug!(%peer, "controller connected");
            MonitorEvent::Ignored
        }
        Incoming::Disconnected(peer) => {
            debug!(%peer, "controller disconnected");
            MonitorEvent::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn status_request_is_answered_on_the_same_socket() {
        let ctx = Context::new();
        let mut monitor = MonitoringConnection::bind(&ctx, "inproc://mon", SocketOptions::new("app"))
            .await
            .unwrap();
        let mut controller = ctx
            .connect("inproc://mon", SocketOptions::new("ctl"))
            .await
            .unwrap();

        controller
            .send("inproc://mon", Message::control(MessageKind::StatusRequest))
            .unwrap();
        controller
            .send("inproc://mon", Message::data(&b"noise"[..]).unwrap())
            .unwrap();

        assert_eq!(monitor.receive().await.unwrap(), MonitorEvent::Ignored);
        let peer = match monitor.receive().await.unwrap() {
            MonitorEvent::StatusRequest { peer } => peer,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(monitor.try_receive().unwrap(), Some(MonitorEvent::Ignored));
        assert_eq!(monitor.try_receive().unwrap(), None);

        monitor
            .reply_status(&peer, &json!({"state": "running"}))
            .unwrap();
        match controller.recv().await.unwrap() {
            Incoming::Message(_, reply) => {
                assert_eq!(reply.status_json().unwrap()["state"], "running");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_reaches_wildcard_address_as_configured() {
        let ctx = Context::new();
        let mut monitor = MonitoringConnection::bind(&ctx, "tcp://*:0", SocketOptions::new("app"))
            .await
            .unwrap();
        let port = monitor.local_address().rsplit(':').next().unwrap().to_string();
        let address = format!("tcp://*:{port}");

        let mut client = MonitorClient::connect(&ctx, &address, SocketOptions::new("ctl"))
            .await
            .unwrap();
        assert_eq!(client.stage(), &format!("tcp://0.0.0.0:{port}"));

        client.signal(MessageKind::Stop).unwrap();
        loop {
            if let MonitorEvent::Signal { kind, peer } = monitor.receive().await.unwrap() {
                assert_eq!(kind, MessageKind::Stop);
                assert_eq!(peer, "ctl");
                break;
            }
        }

        let (status, ()) = tokio::join!(client.status(), async {
            loop {
                if let MonitorEvent::StatusRequest { peer } = monitor.receive().await.unwrap() {
                    monitor
                        .reply_status(&peer, &json!({"state": "draining"}))
                        .unwrap();
                    break;
                }
            }
        });
        assert_eq!(status.unwrap()["state"], "draining");

        drop(monitor);
        tokio::time::timeout(std::time::Duration::from_secs(5), client.closed())
            .await
            .unwrap();
    }
}
