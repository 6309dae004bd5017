//! TCP streams behind a [`Socket`](super::Socket).
//!
//! Each stream gets a reader task feeding the socket's inbound channel and a writer task
//! draining the peer's outbox. Framed streams carry `len:u32 | encoded message` frames and
//! open with one identity frame from the connecting side.
//!
//! Readers belong to the owning socket and are aborted with it. Writers end on their own
//! once the socket drops the outbox, after flushing what was already queued.

use super::{Outbox, PeerId, SocketEvent, SocketMode, SocketOptions};
use crate::error::{CollectorError, CollectorResult};
use crate::message::{length_prefix, Message};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const RAW_READ_CHUNK: usize = 64 * 1024;
const ACCEPT_BACKOFF_MS: u64 = 100;

pub(super) fn spawn_acceptor(
    listener: TcpListener,
    mode: SocketMode,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Aborting the acceptor drops this set and every reader in it.
        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let events = events.clone();
                        streams.spawn(async move {
                            if let Err(e) = handle_accepted(stream, addr, mode, events).await {
                                warn!(%addr, error = %e, "stream setup failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                        sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                    }
                },
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }
    })
}

async fn handle_accepted(
    stream: TcpStream,
    addr: SocketAddr,
    mode: SocketMode,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> CollectorResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    let peer = match mode {
        SocketMode::Framed => {
            let frame = read_frame(&mut reader).await?.ok_or_else(|| {
                CollectorError::TransportClosed(format!("{addr} closed during handshake"))
            })?;
            String::from_utf8(frame.to_vec())
                .map_err(|e| CollectorError::Decode(format!("identity frame: {e}")))?
        }
        SocketMode::Raw => addr.to_string(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    events
        .send(SocketEvent::Connected {
            peer: peer.clone(),
            outbox: Outbox::Stream(tx),
        })
        .map_err(|_| CollectorError::TransportClosed(addr.to_string()))?;

    tokio::spawn(write_loop(writer, rx, mode));
    read_loop(reader, peer, mode, events).await;
    Ok(())
}

/// Start the writer and reader of a connected stream. The reader's handle goes to the socket.
pub(super) async fn attach_outgoing(
    stream: TcpStream,
    peer: PeerId,
    options: &SocketOptions,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> CollectorResult<(Outbox, JoinHandle<()>)> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();

    if options.mode == SocketMode::Framed {
        write_frame(&mut writer, options.identity.as_bytes()).await?;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, rx, options.mode));
    let reader = tokio::spawn(read_loop(reader, peer, options.mode, events));
    Ok((Outbox::Stream(tx), reader))
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    mode: SocketMode,
) {
    while let Some(message) = outbox.recv().await {
        let result = match mode {
            SocketMode::Framed => match message.encode() {
                Ok(frame) => write_frame(&mut writer, &frame).await,
                Err(e) => {
                    warn!(error = %e, "message dropped before framing");
                    continue;
                }
            },
            SocketMode::Raw => writer
                .write_all(message.payload())
                .await
                .map_err(CollectorError::from),
        };
        if let Err(e) = result {
            debug!(error = %e, "stream writer stopped");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    mode: SocketMode,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    loop {
        let message = match mode {
            SocketMode::Framed => match read_frame(&mut reader).await {
                Ok(Some(frame)) => match Message::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping undecodable frame");
                        continue;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer, error = %e, "stream reader stopped");
                    break;
                }
            },
            SocketMode::Raw => {
                let mut buf = BytesMut::with_capacity(RAW_READ_CHUNK);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => match Message::data(buf.freeze()) {
                        Ok(message) => message,
                        Err(_) => continue,
                    },
                    Err(e) => {
                        debug!(%peer, error = %e, "raw reader stopped");
                        break;
                    }
                }
            }
        };

        if events
            .send(SocketEvent::Message {
                peer: peer.clone(),
                message,
            })
            .is_err()
        {
            return;
        }
    }
    let _ = events.send(SocketEvent::Disconnected { peer });
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> CollectorResult<()> {
    writer.write_u32_le(length_prefix(frame.len())?).await?;
    writer.write_all(frame).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> CollectorResult<Option<Bytes>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CollectorError::Decode(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}
