//! Load-balanced dispatch to a pool of workers.
//!
//! Workers connect to the bound output socket and announce themselves with a Ready
//! message. Each dispatch goes to the worker that has been ready the longest; the worker
//! is then busy until it sends Ready again, so at most one message is in flight per
//! worker.
//!
//! Without a ready worker, [`dispatch`](OutputConnection::dispatch) hands the message back
//! as [`DispatchOutcome::Backpressure`]. In lax mode it is dropped instead and only the
//! `dropped` counter in the status snapshot shows it.

use super::workers::{Readiness, WorkerPool};
use super::{DispatchOutcome, OutputConnection, OutputEvent};
use crate::error::CollectorResult;
use crate::message::{Message, MessageKind};
use crate::network::{Context, Incoming, Socket, SocketOptions};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, trace, warn};

/// Output connection dispatching to ready workers, oldest-ready first.
#[derive(Debug)]
pub struct LoadBalancedConnection {
    socket: Socket,
    pool: WorkerPool,
    lax: bool,
    dispatched: u64,
    dropped: u64,
    backpressured: u64,
    lost_in_flight: u64,
}

impl LoadBalancedConnection {
    /// Bind the socket workers connect to.
    pub async fn bind(
        ctx: &Context,
        address: &str,
        options: SocketOptions,
        lax: bool,
    ) -> CollectorResult<Self> {
        let socket = ctx.bind(address, options).await?;
        Ok(Self::from_socket(socket, lax))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: Socket, lax: bool) -> Self {
        Self {
            socket,
            pool: WorkerPool::new(),
            lax,
            dispatched: 0,
            dropped: 0,
            backpressured: 0,
            lost_in_flight: 0,
        }
    }

    /// Address workers connect to.
    pub fn local_address(&self) -> &str {
        self.socket.local_address()
    }

    /// Whether messages are dropped instead of refused when no worker is ready.
    pub fn is_lax(&self) -> bool {
        self.lax
    }

    /// Worker registry.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Mark a worker ready. Returns `false` if it already was.
    pub fn register_ready(&mut self, worker: &str) -> bool {
        self.pool.register_ready(worker)
    }

    /// Messages discarded by lax mode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn forget_worker(&mut self, worker: &str, reason: &str) {
        if let Some(state) = self.pool.remove(worker) {
            if state.readiness == Readiness::Busy {
                self.lost_in_flight += 1;
                warn!(%worker, reason, "busy worker removed, in-flight message is not redelivered");
            } else {
                debug!(%worker, reason, "worker removed");
            }
        }
    }

    fn handle(&mut self, incoming: Incoming) -> OutputEvent {
        match incoming {
            Incoming::Connected(worker) => OutputEvent::PeerJoined(worker),
            Incoming::Disconnected(worker) => {
                self.forget_worker(&worker, "disconnected");
                OutputEvent::PeerLeft(worker)
            }
            Incoming::Message(worker, message) => match message.kind() {
                MessageKind::Ready => {
                    if self.pool.register_ready(&worker) {
                        trace!(%worker, "worker ready");
                        OutputEvent::WorkerReady(worker)
                    } else {
                        debug!(%worker, "duplicate ready ignored");
                        OutputEvent::Ignored
                    }
                }
                MessageKind::Goodbye | MessageKind::Terminate => {
                    self.forget_worker(&worker, message.kind().as_str());
                    OutputEvent::PeerLeft(worker)
                }
                kind => {
                    self.pool.touch(&worker);
                    warn!(%worker, %kind, "unexpected message from worker ignored");
                    OutputEvent::Ignored
                }
            },
        }
    }
}

#[async_trait]
impl OutputConnection for LoadBalancedConnection {
    /// In lax mode the connection always accepts work.
    fn is_ready(&self) -> bool {
        self.lax || self.pool.ready_count() > 0
    }

    fn dispatch(&mut self, message: Message) -> CollectorResult<DispatchOutcome> {
        while let Some(worker) = self.pool.next_ready() {
            match self.socket.send(&worker, message.clone()) {
                Ok(()) => {
                    self.dispatched += 1;
                    trace!(%worker, "dispatched");
                    return Ok(DispatchOutcome::Sent);
                }
                Err(e) => {
                    // Nothing reached the worker, so nothing is lost; try the next one.
                    self.pool.remove(&worker);
                    warn!(%worker, error = %e, "ready worker unreachable, removed");
                }
            }
        }

        if self.lax {
            self.dropped += 1;
            debug!(dropped = self.dropped, "no ready worker, message dropped");
            Ok(DispatchOutcome::Dropped)
        } else {
            self.backpressured += 1;
            Ok(DispatchOutcome::Backpressure(message))
        }
    }

    fn send_signal(&mut self, kind: MessageKind) -> CollectorResult<()> {
        let delivered = self.socket.broadcast(&Message::control(kind))?;
        debug!(%kind, delivered, "signal sent to workers");
        Ok(())
    }

    async fn next_event(&mut self) -> CollectorResult<OutputEvent> {
        let incoming = self.socket.recv().await?;
        Ok(self.handle(incoming))
    }

    fn status(&self) -> serde_json::Value {
        let workers: Vec<_> = self.pool.workers().collect();
        json!({
            "type": "load_balanced",
            "address": self.socket.local_address(),
            "lax": self.lax,
            "workers": self.pool.len(),
            "ready": self.pool.ready_count(),
            "busy": self.pool.busy_count(),
            "dispatched": self.dispatched,
            "dropped": self.dropped,
            "backpressured": self.backpressured,
            "lost_in_flight": self.lost_in_flight,
            "worker_states": workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(payload: &'static [u8]) -> Message {
        Message::data(payload).unwrap()
    }

    #[tokio::test]
    async fn refused_dispatch_has_no_side_effect() {
        let ctx = Context::new();
        let mut output =
            LoadBalancedConnection::bind(&ctx, "inproc://lb-refuse", SocketOptions::new("lb"), false)
                .await
                .unwrap();

        assert!(!output.is_ready());
        match output.dispatch(event(b"e1")).unwrap() {
            DispatchOutcome::Backpressure(message) => assert_eq!(message, event(b"e1")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(output.pool().is_empty());
        assert_eq!(output.status()["backpressured"], 1);
    }

    #[tokio::test]
    async fn lax_mode_drops_and_counts() {
        let ctx = Context::new();
        let mut output =
            LoadBalancedConnection::bind(&ctx, "inproc://lb-lax", SocketOptions::new("lb"), true)
                .await
                .unwrap();

        assert!(output.is_ready());
        assert!(matches!(
            output.dispatch(event(b"e1")).unwrap(),
            DispatchOutcome::Dropped
        ));
        assert_eq!(output.dropped(), 1);
        assert_eq!(output.status()["dropped"], 1);
    }

    #[tokio::test]
    async fn goodbye_removes_the_worker() {
        let ctx = Context::new();
        let mut output =
            LoadBalancedConnection::bind(&ctx, "inproc://lb-bye", SocketOptions::new("lb"), false)
                .await
                .unwrap();
        let worker = ctx
            .connect("inproc://lb-bye", SocketOptions::new("w1"))
            .await
            .unwrap();

        worker
            .send("inproc://lb-bye", Message::control(MessageKind::Ready))
            .unwrap();
        worker
            .send("inproc://lb-bye", Message::control(MessageKind::Goodbye))
            .unwrap();

        assert_eq!(
            output.next_event().await.unwrap(),
            OutputEvent::PeerJoined("w1".into())
        );
        assert_eq!(
            output.next_event().await.unwrap(),
            OutputEvent::WorkerReady("w1".into())
        );
        assert_eq!(
            output.next_event().await.unwrap(),
            OutputEvent::PeerLeft("w1".into())
        );
        assert!(output.pool().is_empty());
        assert!(!output.is_ready());
    }

    #[tokio::test]
    async fn unreachable_ready_worker_is_skipped() {
        let ctx = Context::new();
        let mut output =
            LoadBalancedConnection::bind(&ctx, "inproc://lb-skip", SocketOptions::new("lb"), false)
                .await
                .unwrap();
        let mut w2 = ctx
            .connect("inproc://lb-skip", SocketOptions::new("w2"))
            .await
            .unwrap();

        // w1 was announced ready but never attached to the socket.
        output.register_ready("w1");
        output.next_event().await.unwrap();
        output.register_ready("w2");

        assert!(output.dispatch(event(b"e1")).unwrap().is_sent());
        assert!(output.pool().get("w1").is_none());
        assert!(matches!(
            w2.recv().await.unwrap(),
            Incoming::Message(_, m) if m.payload().as_ref() == b"e1"
        ));
    }
}
