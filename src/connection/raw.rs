//! Raw pass-through outputs towards storage sinks.
//!
//! A raw output has no flow control: it is always ready, never refuses a message and
//! sends only the payload bytes. With `add_event_size` every payload is prefixed by its
//! length as a little-endian `u32` so a plain byte-stream sink can split events again.

use super::{DispatchOutcome, OutputConnection, OutputEvent};
use crate::error::{CollectorError, CollectorResult};
use crate::message::{length_prefix, Message, MessageKind};
use crate::network::{Context, Incoming, Socket, SocketOptions};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::json;
use tracing::{debug, warn};

/// Unbuffered, always-ready output.
#[derive(Debug)]
pub struct RawConnection {
    socket: Socket,
    add_event_size: bool,
    sent: u64,
    bytes_sent: u64,
    failures: u64,
}

impl RawConnection {
    /// Bind a raw-mode socket for sinks to connect to.
    pub async fn bind(
        ctx: &Context,
        address: &str,
        options: SocketOptions,
        add_event_size: bool,
    ) -> CollectorResult<Self> {
        let socket = ctx.bind(address, options.raw()).await?;
        Ok(Self {
            socket,
            add_event_size,
            sent: 0,
            bytes_sent: 0,
            failures: 0,
        })
    }

    /// Address sinks connect to.
    pub fn local_address(&self) -> &str {
        self.socket.local_address()
    }

    /// Bytes that go on the wire for `payload`.
    pub fn frame(&self, payload: Bytes) -> CollectorResult<Bytes> {
        if !self.add_event_size {
            return Ok(payload);
        }
        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.put_u32_le(length_prefix(payload.len())?);
        framed.put_slice(&payload);
        Ok(framed.freeze())
    }

    /// Send one payload to every attached sink. Never waits.
    pub fn send_payload(&mut self, payload: Bytes) -> CollectorResult<()> {
        let framed = self.frame(payload);
        let len = framed.as_ref().map_or(0, |f| f.len() as u64);
        let result = framed.and_then(Message::data).and_then(|message| {
            match self.socket.broadcast(&message)? {
                0 => Err(CollectorError::TransportClosed(
                    self.socket.local_address().to_string(),
                )),
                _ => Ok(()),
            }
        });
        match &result {
            Ok(()) => {
                self.sent += 1;
                self.bytes_sent += len;
            }
            Err(_) => self.failures += 1,
        }
        result
    }
}

#[async_trait]
impl OutputConnection for RawConnection {
    fn is_ready(&self) -> bool {
        true
    }

    fn dispatch(&mut self, message: Message) -> CollectorResult<DispatchOutcome> {
        self.send_payload(message.into_payload())?;
        Ok(DispatchOutcome::Sent)
    }

    /// Sinks have no control protocol; signals end here.
    fn send_signal(&mut self, kind: MessageKind) -> CollectorResult<()> {
        debug!(%kind, address = %self.socket.local_address(), "signal not forwarded to raw sink");
        Ok(())
    }

    async fn next_event(&mut self) -> CollectorResult<OutputEvent> {
        Ok(match self.socket.recv().await? {
            Incoming::Connected(peer) => OutputEvent::PeerJoined(peer),
            Incoming::Disconnected(peer) => OutputEvent::PeerLeft(peer),
            Incoming::Message(peer, _) => {
                debug!(%peer, "ignoring bytes from raw sink");
                OutputEvent::Ignored
            }
        })
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": "raw",
            "address": self.socket.local_address(),
            "sinks": self.socket.peer_count(),
            "add_event_size": self.add_event_size,
            "sent": self.sent,
            "bytes_sent": self.bytes_sent,
            "failures": self.failures,
        })
    }
}

/// Per-channel outcome of [`DataAndRoiOutput::dispatch_pair`].
#[derive(Debug)]
pub struct PairDelivery {
    /// Bulk data channel.
    pub data: CollectorResult<()>,
    /// Region-of-interest channel.
    pub roi: CollectorResult<()>,
}

/// Two independent raw outputs fed from one logical event.
///
/// The data channel carries the event payload, the ROI channel the message's ROI part.
/// Both sends are always attempted; neither rolls back the other.
#[derive(Debug)]
pub struct DataAndRoiOutput {
    data: RawConnection,
    roi: RawConnection,
    missing_roi: u64,
    roi_failures: u64,
}

impl DataAndRoiOutput {
    /// Combine two raw outputs.
    pub fn new(data: RawConnection, roi: RawConnection) -> Self {
        Self {
            data,
            roi,
            missing_roi: 0,
            roi_failures: 0,
        }
    }

    /// Bulk data channel.
    pub fn data(&self) -> &RawConnection {
        &self.data
    }

    /// ROI side channel.
    pub fn roi(&self) -> &RawConnection {
        &self.roi
    }

    /// Send `primary` on the data channel and `secondary` on the ROI channel.
    pub fn dispatch_pair(&mut self, primary: Bytes, secondary: Bytes) -> PairDelivery {
        let data = self.data.send_payload(primary);
        let roi = self.roi.send_payload(secondary);
        if let Err(e) = &roi {
            self.roi_failures += 1;
            warn!(error = %e, data_ok = data.is_ok(), "ROI channel send failed");
        }
        PairDelivery { data, roi }
    }
}

#[async_trait]
impl OutputConnection for DataAndRoiOutput {
    fn is_ready(&self) -> bool {
        true
    }

    fn dispatch(&mut self, message: Message) -> CollectorResult<DispatchOutcome> {
        let (payload, roi) = message.into_parts();
        match roi {
            Some(roi) => self.dispatch_pair(payload, roi).data?,
            None => {
                self.missing_roi += 1;
                debug!("event without ROI part, data channel only");
                self.data.send_payload(payload)?;
            }
        }
        Ok(DispatchOutcome::Sent)
    }

    fn send_signal(&mut self, kind: MessageKind) -> CollectorResult<()> {
        self.data.send_signal(kind)?;
        self.roi.send_signal(kind)
    }

    async fn next_event(&mut self) -> CollectorResult<OutputEvent> {
        tokio::select! {
            event = self.data.next_event() => event,
            event = self.roi.next_event() => event,
        }
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": "data_and_roi",
            "data": self.data.status(),
            "roi": self.roi.status(),
            "missing_roi": self.missing_roi,
            "roi_failures": self.roi_failures,
        })
    }
}
