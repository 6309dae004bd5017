//! Messages exchanged between pipeline stages.
//!
//! A [`Message`] is either an opaque data payload travelling downstream, or one of a
//! small set of control messages (ready, confirm, start/stop/terminate, status). The
//! collectors never look inside a data payload.
//!
//! # Wire Format
//!
//! ```text
//! kind:u8 | flags:u8 | [sequence_id:u64] | payload_len:u32 | payload | [roi_len:u32 | roi]
//! ```
//!
//! All integers are little-endian. `flags` bit 0 marks a sequence id, bit 1 an ROI part.

use crate::error::{CollectorError, CollectorResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequence identifier used to match confirmations to data messages.
pub type SequenceId = u64;

const FLAG_SEQUENCE: u8 = 0b01;
const FLAG_ROI: u8 = 0b10;
const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
/// Kind of a [`Message`].
pub enum MessageKind {
    /// Event payload.
    Data = 0,
    /// Worker is ready to take one more event.
    Ready = 1,
    /// Acknowledgement of a data message, echoing its sequence id.
    Confirm = 2,
    /// A new run starts; clears stop bookkeeping.
    Start = 3,
    /// The sender has no more events for this run.
    Stop = 4,
    /// Shut the stage down immediately.
    Terminate = 5,
    /// Worker leaves the pool.
    Goodbye = 6,
    /// Monitoring query for the status snapshot.
    StatusRequest = 7,
    /// Reply to a status request, JSON payload.
    Status = 8,
}

impl MessageKind {
    /// Decode the kind tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Data),
            1 => Some(MessageKind::Ready),
            2 => Some(MessageKind::Confirm),
            3 => Some(MessageKind::Start),
            4 => Some(MessageKind::Stop),
            5 => Some(MessageKind::Terminate),
            6 => Some(MessageKind::Goodbye),
            7 => Some(MessageKind::StatusRequest),
            8 => Some(MessageKind::Status),
            _ => None,
        }
    }

    /// Short lowercase label, also used as the payload of control messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Data => "data",
            MessageKind::Ready => "ready",
            MessageKind::Confirm => "confirm",
            MessageKind::Start => "start",
            MessageKind::Stop => "stop",
            MessageKind::Terminate => "terminate",
            MessageKind::Goodbye => "goodbye",
            MessageKind::StatusRequest => "status_request",
            MessageKind::Status => "status",
        }
    }

    /// Start, Stop and Terminate steer the collector state machine.
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            MessageKind::Start | MessageKind::Stop | MessageKind::Terminate
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit exchanged between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    sequence_id: Option<SequenceId>,
    payload: Bytes,
    roi: Option<Bytes>,
}

impl Message {
    /// Build a data message. The payload must not be empty.
    pub fn data(payload: impl Into<Bytes>) -> CollectorResult<Self> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(CollectorError::EmptyPayload);
        }
        Ok(Self {
            kind: MessageKind::Data,
            sequence_id: None,
            payload,
            roi: None,
        })
    }

    /// Build a control message of the given kind.
    pub fn control(kind: MessageKind) -> Self {
        Self {
            kind,
            sequence_id: None,
            payload: Bytes::from_static(kind.as_str().as_bytes()),
            roi: None,
        }
    }

    /// Confirmation for the data message carrying `sequence_id`.
    pub fn confirm(sequence_id: Option<SequenceId>) -> Self {
        Self {
            sequence_id,
            ..Self::control(MessageKind::Confirm)
        }
    }

    /// Status reply carrying a JSON snapshot.
    pub fn status(snapshot: &serde_json::Value) -> Self {
        Self {
            payload: Bytes::from(snapshot.to_string()),
            ..Self::control(MessageKind::Status)
        }
    }

    /// Attach a sequence id.
    pub fn with_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Attach a region-of-interest side payload.
    pub fn with_roi(mut self, roi: impl Into<Bytes>) -> Self {
        self.roi = Some(roi.into());
        self
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Sequence id, present on confirmed data and confirmations.
    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.sequence_id
    }

    /// Opaque payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// ROI side payload, if any.
    pub fn roi(&self) -> Option<&Bytes> {
        self.roi.as_ref()
    }

    /// Whether this is a data message.
    pub fn is_data(&self) -> bool {
        self.kind == MessageKind::Data
    }

    /// Strip the sequence id and ROI part, keeping the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Split into the payload and the ROI part.
    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.payload, self.roi)
    }

    /// Parse a status reply payload back into JSON.
    pub fn status_json(&self) -> CollectorResult<serde_json::Value> {
        if self.kind != MessageKind::Status {
            return Err(CollectorError::Decode(format!(
                "expected status message, got {}",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload).map_err(|e| CollectorError::Decode(e.to_string()))
    }

    /// Encode into the wire format.
    pub fn encode(&self) -> CollectorResult<Bytes> {
        let roi_len = self.roi.as_ref().map_or(0, |r| 4 + r.len());
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 8 + 4 + self.payload.len() + roi_len);

        let mut flags = 0u8;
        if self.sequence_id.is_some() {
            flags |= FLAG_SEQUENCE;
        }
        if self.roi.is_some() {
            flags |= FLAG_ROI;
        }

        buf.put_u8(self.kind as u8);
        buf.put_u8(flags);
        if let Some(seq) = self.sequence_id {
            buf.put_u64_le(seq);
        }
        buf.put_u32_le(length_prefix(self.payload.len())?);
        buf.put_slice(&self.payload);
        if let Some(roi) = &self.roi {
            buf.put_u32_le(length_prefix(roi.len())?);
            buf.put_slice(roi);
        }

        Ok(buf.freeze())
    }

    /// Decode from the wire format.
    pub fn decode(mut data: &[u8]) -> CollectorResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CollectorError::Decode("insufficient data for header".into()));
        }

        let tag = data.get_u8();
        let kind = MessageKind::from_u8(tag)
            .ok_or_else(|| CollectorError::Decode(format!("invalid message kind {tag}")))?;
        let flags = data.get_u8();

        let sequence_id = if flags & FLAG_SEQUENCE != 0 {
            if data.remaining() < 8 {
                return Err(CollectorError::Decode("sequence id truncated".into()));
            }
            Some(data.get_u64_le())
        } else {
            None
        };

        let payload = take_part(&mut data, "payload")?;
        let roi = if flags & FLAG_ROI != 0 {
            Some(take_part(&mut data, "roi")?)
        } else {
            None
        };

        if data.has_remaining() {
            return Err(CollectorError::Decode(format!(
                "{} trailing bytes",
                data.remaining()
            )));
        }
        if kind == MessageKind::Data && payload.is_empty() {
            return Err(CollectorError::EmptyPayload);
        }

        Ok(Self {
            kind,
            sequence_id,
            payload,
            roi,
        })
    }
}

/// Length of a payload or frame as its little-endian `u32` prefix.
pub fn length_prefix(len: usize) -> CollectorResult<u32> {
    u32::try_from(len).map_err(|_| CollectorError::PayloadTooLarge(len))
}

fn take_part(data: &mut &[u8], what: &str) -> CollectorResult<Bytes> {
    if data.remaining() < 4 {
        return Err(CollectorError::Decode(format!("{what} length missing")));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(CollectorError::Decode(format!("{what} size mismatch")));
    }
    Ok(data.copy_to_bytes(len))
}
