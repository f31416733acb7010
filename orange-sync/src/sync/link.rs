//! Per-connection IO.
//!
//! Both directions speak the same protocol: one hello frame each way first,
//! then newline-delimited message frames until the socket dies. The link
//! layer owns the handshake gates (self-loop, version, environment, bot
//! principal) because they need no table state; everything that touches the
//! peer table goes through the event loop.

use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;

use super::{EstablishedLink, Event, LinkCtx, LinkDirection, WRITE_QUEUE};
use crate::message::{self, HELLO_ID, MAX_FRAME_LEN, Message, Payload};

/// Frames drained per writer wake-up before flushing.
const WRITE_BATCH: usize = 64;

/// Accept inbound connections forever; one task per connection.
pub(crate) async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, ctx: LinkCtx) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!("accept failed: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(ctx.timing.handshake_timeout, acceptor.accept(tcp))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(%remote, "inbound TLS handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::debug!(%remote, "inbound TLS handshake timed out");
                    return;
                }
            };
            run_link(stream, LinkDirection::Inbound, None, None, ctx).await;
        });
    }
}

/// Why a hello exchange did not produce a peer.
enum HelloOutcome {
    Peer(String),
    SelfLoop,
    Rejected,
}

/// Drive one connection from hello to close. Returns true if the link was
/// established (hello passed and the core accepted it).
pub(crate) async fn run_link<S>(
    stream: S,
    direction: LinkDirection,
    expected: Option<String>,
    dialed_addr: Option<String>,
    ctx: LinkCtx,
) -> bool
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let hello = tokio::time::timeout(
        ctx.timing.handshake_timeout,
        exchange_hello(&mut reader, &mut write_half, direction, &ctx),
    )
    .await;
    let peer_name = match hello {
        Ok(Some(HelloOutcome::Peer(name))) => name,
        Ok(Some(HelloOutcome::SelfLoop)) => {
            // Connected to ourselves; close silently and let the core drop
            // the entry that pointed here.
            let _ = ctx
                .event_tx
                .send(Event::SelfLoop {
                    expected,
                    dialed_addr,
                })
                .await;
            return false;
        }
        Ok(Some(HelloOutcome::Rejected)) => return false,
        Ok(None) => {
            tracing::debug!("connection closed during hello");
            return false;
        }
        Err(_) => {
            tracing::debug!("hello exchange timed out");
            return false;
        }
    };

    let link_id = ctx.link_ids.fetch_add(1, Ordering::Relaxed);
    let (write_tx, write_rx) = mpsc::channel::<String>(WRITE_QUEUE);
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let established = Event::LinkEstablished {
        link: EstablishedLink {
            id: link_id,
            peer: peer_name.clone(),
            tx: write_tx,
        },
        direction,
        expected,
        dialed_addr,
        verdict: verdict_tx,
    };
    if ctx.event_tx.send(established).await.is_err() {
        return false;
    }
    if !matches!(verdict_rx.await, Ok(true)) {
        tracing::debug!(peer = %peer_name, "link rejected by core");
        return false;
    }

    let writer = tokio::spawn(write_loop(write_half, write_rx));
    read_loop(&mut reader, link_id, &peer_name, &ctx).await;

    let _ = ctx.event_tx.send(Event::LinkClosed { link_id }).await;
    writer.abort();
    true
}

/// First frame each way is hello. The server only introduces itself after
/// the client's hello passed every gate; the client sends first and then
/// requires a valid hello back.
async fn exchange_hello<R, W>(
    reader: &mut BufReader<ReadHalf<R>>,
    writer: &mut WriteHalf<W>,
    direction: LinkDirection,
    ctx: &LinkCtx,
) -> Option<HelloOutcome>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let our_hello = message::encode(&Message {
        source: ctx.identity.name.clone(),
        id: HELLO_ID,
        payload: Payload::Hello {
            version: ctx.identity.version.clone(),
            env: ctx.identity.environment,
            user_id: ctx.identity.user_id.clone(),
        },
    });

    match direction {
        LinkDirection::Outbound => {
            if write_frame(writer, &our_hello).await.is_err() {
                return None;
            }
            let line = read_frame(reader).await?;
            Some(check_hello(&line, ctx))
        }
        LinkDirection::Inbound => {
            let line = read_frame(reader).await?;
            let outcome = check_hello(&line, ctx);
            if matches!(outcome, HelloOutcome::Peer(_))
                && write_frame(writer, &our_hello).await.is_err()
            {
                return None;
            }
            Some(outcome)
        }
    }
}

/// Apply the hello gates to the first frame of a connection.
fn check_hello(line: &str, ctx: &LinkCtx) -> HelloOutcome {
    let msg = match message::decode(line) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("invalid first frame: {e}");
            return HelloOutcome::Rejected;
        }
    };
    let Payload::Hello { version, env, user_id } = msg.payload else {
        tracing::warn!(kind = msg.payload.kind(), "first frame was not hello");
        return HelloOutcome::Rejected;
    };
    if msg.source == ctx.identity.name {
        return HelloOutcome::SelfLoop;
    }
    if version != ctx.identity.version {
        tracing::warn!(peer = %msg.source, theirs = %version, ours = %ctx.identity.version, "hello version mismatch");
        return HelloOutcome::Rejected;
    }
    if env != ctx.identity.environment {
        tracing::warn!(peer = %msg.source, theirs = %env, ours = %ctx.identity.environment, "hello environment mismatch");
        return HelloOutcome::Rejected;
    }
    if user_id != ctx.identity.user_id {
        tracing::warn!(peer = %msg.source, "hello bot principal mismatch");
        return HelloOutcome::Rejected;
    }
    HelloOutcome::Peer(msg.source)
}

/// Read frames and feed them to the core until the connection dies or a
/// frame violates the protocol.
async fn read_loop<R>(reader: &mut BufReader<ReadHalf<R>>, link_id: u64, peer: &str, ctx: &LinkCtx)
where
    R: AsyncRead,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::debug!(peer = %peer, "connection closed by peer");
                return;
            }
            Ok(_) => {
                let frame = line.trim_end_matches(['\r', '\n']);
                if frame.is_empty() {
                    continue;
                }
                if frame.len() > MAX_FRAME_LEN {
                    tracing::warn!(peer = %peer, len = frame.len(), "oversize frame, closing");
                    return;
                }
                match message::decode(frame) {
                    Ok(msg) => {
                        let event = Event::Frame {
                            link_id,
                            raw: frame.to_string(),
                            message: msg,
                        };
                        if ctx.event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, "protocol violation, closing: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, "read failed: {e}");
                return;
            }
        }
    }
}

/// Drain the writer queue onto the socket, batching before each flush.
async fn write_loop<W>(mut writer: WriteHalf<W>, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite,
{
    while let Some(frame) = rx.recv().await {
        if write_unflushed(&mut writer, &frame).await.is_err() {
            return;
        }
        let mut batched = 0;
        while batched < WRITE_BATCH {
            match rx.try_recv() {
                Ok(frame) => {
                    if write_unflushed(&mut writer, &frame).await.is_err() {
                        return;
                    }
                    batched += 1;
                }
                Err(_) => break,
            }
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

async fn write_unflushed<W>(writer: &mut WriteHalf<W>, frame: &str) -> std::io::Result<()>
where
    W: AsyncWrite,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn write_frame<W>(writer: &mut WriteHalf<W>, frame: &str) -> std::io::Result<()>
where
    W: AsyncWrite,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_frame<R>(reader: &mut BufReader<ReadHalf<R>>) -> Option<String>
where
    R: AsyncRead,
{
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => None,
        Ok(_) => {
            let frame = line.trim_end_matches(['\r', '\n']);
            if frame.len() > MAX_FRAME_LEN {
                tracing::warn!(len = frame.len(), "oversize hello frame");
                return None;
            }
            Some(frame.to_string())
        }
        Err(e) => {
            tracing::debug!("read failed during hello: {e}");
            None
        }
    }
}
