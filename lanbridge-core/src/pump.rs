//! Reader and writer tasks that move data between a socket and a
//! [`Connection`].
//!
//! Framed pumps (control channels and tunnels) decode [`Frame`]s and carry
//! the idle monitor: read silence closes the connection, write silence emits
//! a heartbeat. Raw pumps (user and backend connections) move byte chunks.
//! Both honour the connection's read gate.

use crate::connection::{Connection, Outbound};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use kanal::AsyncReceiver;
use lanbridge_common::IdleConfig;
use lanbridge_protocol::{Frame, ProxyCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace, warn};

const READ_CHUNK_SIZE: usize = 64 * 1024;
const MAX_BATCH_ITEMS: usize = 64;

/// Receives decoded frames from control channels and tunnels.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, conn: &Arc<Connection>, frame: Frame);
    /// Called exactly once, after the connection stopped reading.
    fn on_closed(&self, conn: &Arc<Connection>);
}

/// Receives raw bytes from user and backend connections.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_data(&self, conn: &Arc<Connection>, data: Bytes);
    /// Called exactly once, after the connection stopped reading.
    fn on_closed(&self, conn: &Arc<Connection>);
}

pub(crate) fn spawn_framed<S>(
    conn: Arc<Connection>,
    outbound: AsyncReceiver<Outbound>,
    stream: S,
    codec: ProxyCodec,
    idle: IdleConfig,
    handler: Arc<dyn FrameHandler>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(
        conn.clone(),
        outbound,
        writer,
        Some(codec),
        Some(idle.write_idle),
    ));
    tokio::spawn(read_frames(conn, reader, codec, idle.read_idle, handler));
}

pub(crate) fn spawn_raw<S>(
    conn: Arc<Connection>,
    outbound: AsyncReceiver<Outbound>,
    stream: S,
    handler: Arc<dyn StreamHandler>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(conn.clone(), outbound, writer, None, None));
    tokio::spawn(read_bytes(conn, reader, handler));
}

/// Waits until reads are enabled. Returns false if the connection closed first.
async fn wait_readable(conn: &Connection, gate: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = conn.cancel_token().cancelled() => false,
        open = async { gate.wait_for(|open| *open).await.is_ok() } => open,
    }
}

async fn read_frames<R>(
    conn: Arc<Connection>,
    reader: R,
    codec: ProxyCodec,
    read_idle: Duration,
    handler: Arc<dyn FrameHandler>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, codec);
    let mut gate = conn.read_gate();

    loop {
        if !wait_readable(&conn, &mut gate).await {
            break;
        }

        let next = tokio::select! {
            () = conn.cancel_token().cancelled() => break,
            _ = gate.changed() => continue,
            next = timeout(read_idle, frames.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(conn_id = conn.id(), kind = ?conn.kind(), "Read idle timeout, closing");
                break;
            }
            Ok(None) => {
                debug!(conn_id = conn.id(), "Peer closed connection");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(conn_id = conn.id(), "Frame decode error: {}", e);
                break;
            }
            Ok(Some(Ok(frame))) => {
                trace!(conn_id = conn.id(), frame_type = %frame.frame_type, uri = frame.uri(), "frame received");
                handler.on_frame(&conn, frame);
            }
        }
    }

    conn.abort();
    handler.on_closed(&conn);
}

async fn read_bytes<R>(conn: Arc<Connection>, mut reader: R, handler: Arc<dyn StreamHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut gate = conn.read_gate();

    loop {
        if !wait_readable(&conn, &mut gate).await {
            break;
        }

        buf.reserve(READ_CHUNK_SIZE);
        let read = tokio::select! {
            () = conn.cancel_token().cancelled() => break,
            _ = gate.changed() => continue,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(conn_id = conn.id(), "Peer closed connection");
                break;
            }
            Ok(_) => handler.on_data(&conn, buf.split().freeze()),
            Err(e) => {
                debug!(conn_id = conn.id(), "Read error: {}", e);
                break;
            }
        }
    }

    conn.abort();
    handler.on_closed(&conn);
}

/// Next queued item, or `None` when `write_idle` elapsed with nothing to send.
async fn next_outbound(
    outbound: &AsyncReceiver<Outbound>,
    write_idle: Option<Duration>,
) -> Result<Option<Outbound>, kanal::ReceiveError> {
    match write_idle {
        Some(idle) => match timeout(idle, outbound.recv()).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        },
        None => outbound.recv().await.map(Some),
    }
}

async fn write_loop<W>(
    conn: Arc<Connection>,
    outbound: AsyncReceiver<Outbound>,
    mut writer: W,
    mut codec: Option<ProxyCodec>,
    write_idle: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            () = conn.cancel_token().cancelled() => break,
            item = next_outbound(&outbound, write_idle) => item,
        };

        buf.clear();
        let mut accounted = 0;
        let mut closing = false;

        match first {
            Err(_) => break,
            Ok(None) => {
                // write idle: only framed connections have a timer
                if let Some(codec) = codec.as_mut() {
                    trace!(conn_id = conn.id(), "Write idle, sending heartbeat");
                    if let Err(e) = codec.encode(Frame::heartbeat(), &mut buf) {
                        warn!(conn_id = conn.id(), "Failed to encode heartbeat: {}", e);
                        break;
                    }
                }
            }
            Ok(Some(item)) => {
                let mut next = Some(item);
                let mut batched = 0;
                while let Some(item) = next.take() {
                    accounted += item.wire_len();
                    match item {
                        Outbound::Close => {
                            closing = true;
                            break;
                        }
                        Outbound::Bytes(bytes) => buf.extend_from_slice(&bytes),
                        Outbound::Frame(frame) => match codec.as_mut() {
                            Some(codec) => {
                                if let Err(e) = codec.encode(frame, &mut buf) {
                                    warn!(conn_id = conn.id(), "Dropping connection, frame encode failed: {}", e);
                                    conn.abort();
                                    return;
                                }
                            }
                            None => {
                                warn!(conn_id = conn.id(), "Frame queued on a raw connection, ignored");
                            }
                        },
                    }
                    batched += 1;
                    if batched < MAX_BATCH_ITEMS {
                        next = outbound.try_recv().ok().flatten();
                    }
                }
            }
        }

        if !buf.is_empty() {
            let written = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            };
            let result = tokio::select! {
                biased;
                () = conn.cancel_token().cancelled() => break,
                result = written => result,
            };
            if let Err(e) = result {
                debug!(conn_id = conn.id(), "Write error: {}", e);
                break;
            }
        }
        conn.on_flushed(accounted);

        if closing {
            let _ = writer.shutdown().await;
            break;
        }
    }

    conn.abort();
}
