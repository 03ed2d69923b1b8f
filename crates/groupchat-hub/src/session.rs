use crate::{
    config::ServerConfig,
    dispatch::{DispatchHandle, OutgoingMessage},
    error::HandshakeError,
    registry::{SessionHandle, SessionId, SessionRegistry},
};
use groupchat_core::{decode_chat_line, decode_frame, encode_frame, Frame};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Handshaking,
    Active,
    Closed,
}

/// Shared by every session spawned from one listener.
pub(crate) struct SessionContext {
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub dispatch: DispatchHandle,
}

pub(crate) enum LineRead {
    Line(Vec<u8>),
    Oversized(usize),
    Eof,
}

/// Reads one `\n` terminated line without buffering more than `max_bytes` of
/// it. Longer lines are consumed and reported as `Oversized`.
pub(crate) async fn read_line_bounded<R>(reader: &mut R, max_bytes: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut dropped = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() && dropped == 0 {
                return Ok(LineRead::Eof);
            }
            break;
        }
        let (chunk, found) = match available.iter().position(|byte| *byte == b'\n') {
            Some(idx) => (&available[..=idx], true),
            None => (available, false),
        };
        let used = chunk.len();
        if dropped == 0 && line.len() + used <= max_bytes + 2 {
            line.extend_from_slice(chunk);
        } else {
            dropped += line.len() + used;
            line.clear();
        }
        reader.consume(used);
        if found {
            break;
        }
    }
    if dropped > 0 {
        return Ok(LineRead::Oversized(dropped));
    }
    Ok(LineRead::Line(line))
}

struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    state: SessionState,
    /// Set once the registry holds this name.
    display_name: Option<String>,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        debug!(
            event = "session_state",
            session = %self.id,
            from = ?self.state,
            to = ?next
        );
        self.state = next;
    }
}

pub(crate) async fn run_session(
    ctx: Arc<SessionContext>,
    id: SessionId,
    stream: TcpStream,
    remote_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session = Session {
        id,
        remote_addr,
        state: SessionState::Handshaking,
        display_name: None,
    };
    let (reader_half, mut writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    let requested = tokio::select! {
        result = read_join_request(&mut reader, &ctx.config) => result,
        _ = wait_for_shutdown(&mut shutdown) => Err(HandshakeError::Shutdown),
    };
    let requested = match requested {
        Ok(name) => name,
        Err(err) => {
            warn!(
                event = "session_handshake_failed",
                session = %id,
                remote = %remote_addr,
                code = err.code(),
                error = %err
            );
            session.transition(SessionState::Closed);
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Arc<[u8]>>(ctx.config.queue_capacity);
    let evicted = Arc::new(Notify::new());
    let admission = ctx
        .registry
        .register(&requested, SessionHandle::new(id, tx, evicted.clone()))
        .await;
    let name = admission.resolved_name.clone();
    session.display_name = Some(name.clone());
    session.transition(SessionState::Active);

    // The ack goes straight to the socket; anything the dispatcher queued in
    // the meantime waits in `rx` until the writer task starts.
    let ack = Frame::JoinAck {
        resolved_name: admission.resolved_name,
        users: admission.roster,
    };
    if let Err(err) = write_frame(&mut writer_half, &ack, &ctx.config).await {
        warn!(event = "session_ack_failed", session = %id, name = %name, error = %err);
        close_session(&ctx, &mut session).await;
        return;
    }

    info!(
        event = "session_joined",
        session = %id,
        name = %name,
        requested = %requested,
        remote = %remote_addr
    );
    enqueue(&ctx, Some(id), &Frame::Join { name: name.clone() });

    let mut writer_task = spawn_writer(id, writer_half, rx, ctx.config.write_timeout);
    let mut writer_done = false;
    let mut was_evicted = false;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!(event = "session_shutdown_signal", session = %id);
                break;
            }
            _ = evicted.notified() => {
                warn!(event = "session_evicted", session = %id, name = %name);
                was_evicted = true;
                break;
            }
            _ = &mut writer_task => {
                writer_done = true;
                debug!(event = "session_writer_stopped", session = %id);
                break;
            }
            read = read_line_bounded(&mut reader, ctx.config.max_frame_bytes) => {
                match read {
                    Ok(LineRead::Eof) => break,
                    Ok(LineRead::Oversized(size)) => {
                        warn!(event = "session_oversized_line", session = %id, size);
                    }
                    Ok(LineRead::Line(line)) => match decode_chat_line(&line, ctx.config.max_frame_bytes) {
                        Ok(Some(text)) => {
                            info!(event = "chat_message", session = %id, name = %name, text = %text);
                            enqueue(&ctx, Some(id), &Frame::ChatMessage { name: name.clone(), text });
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(event = "session_malformed_line", session = %id, error = %err);
                        }
                    },
                    Err(err) => {
                        debug!(event = "session_read_error", session = %id, error = %err);
                        break;
                    }
                }
            }
        }
    }

    close_session(&ctx, &mut session).await;
    if was_evicted {
        // Whatever is still queued would only keep a stalled peer around.
        writer_task.abort();
    }
    if !writer_done {
        let _ = writer_task.await;
    }
}

async fn close_session(ctx: &SessionContext, session: &mut Session) {
    if session.state == SessionState::Closed {
        return;
    }
    session.transition(SessionState::Closed);
    let Some(name) = session.display_name.clone() else {
        return;
    };
    ctx.registry.unregister(&name, session.id).await;
    // Sent even if the Join never went out: anyone who joined meanwhile
    // already has this name from their ack roster.
    enqueue(ctx, Some(session.id), &Frame::Leave { name: name.clone() });
    info!(
        event = "session_left",
        session = %session.id,
        name = %name,
        remote = %session.remote_addr
    );
}

fn enqueue(ctx: &SessionContext, origin: Option<SessionId>, frame: &Frame) {
    match OutgoingMessage::new(origin, frame, ctx.config.max_frame_bytes) {
        Ok(message) => {
            if !ctx.dispatch.enqueue(message) {
                debug!(event = "dispatch_closed", kind = frame.kind());
            }
        }
        Err(err) => warn!(event = "session_encode_error", kind = frame.kind(), error = %err),
    }
}

async fn read_join_request(
    reader: &mut BufReader<OwnedReadHalf>,
    config: &ServerConfig,
) -> Result<String, HandshakeError> {
    let read = tokio::time::timeout(
        config.handshake_timeout,
        read_line_bounded(reader, config.max_frame_bytes),
    )
    .await
    .map_err(|_| HandshakeError::Timeout(config.handshake_timeout))??;

    let line = match read {
        LineRead::Line(line) => line,
        LineRead::Eof => return Err(HandshakeError::Closed),
        LineRead::Oversized(size) => {
            return Err(HandshakeError::Malformed(
                groupchat_core::FrameError::OversizedFrame {
                    size,
                    max: config.max_frame_bytes,
                },
            ))
        }
    };
    match decode_frame(&line, config.max_frame_bytes)? {
        Frame::JoinRequest { name } => Ok(name),
        other => Err(HandshakeError::UnexpectedFrame(other.kind())),
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Frame,
    config: &ServerConfig,
) -> io::Result<()> {
    let bytes = encode_frame(frame, config.max_frame_bytes)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let send = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    };
    tokio::time::timeout(config.write_timeout, send)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

fn spawn_writer(
    id: SessionId,
    writer: OwnedWriteHalf,
    rx: mpsc::Receiver<Arc<[u8]>>,
    write_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(writer_loop(id, writer, rx, write_timeout))
}

async fn writer_loop(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<[u8]>>,
    write_timeout: Duration,
) {
    while let Some(payload) = rx.recv().await {
        let send = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "session_write_error", session = %id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "session_write_timeout", session = %id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch, registry::SessionIdAllocator};

    #[tokio::test]
    async fn bounded_reader_splits_lines_and_skips_oversized() {
        let input: &[u8] = b"hello\nthis line is far too long\nok\npartial";
        let mut reader = BufReader::with_capacity(4, input);

        assert!(matches!(
            read_line_bounded(&mut reader, 8).await.expect("read"),
            LineRead::Line(line) if line == b"hello\n"
        ));
        assert!(matches!(
            read_line_bounded(&mut reader, 8).await.expect("read"),
            LineRead::Oversized(size) if size == 26
        ));
        assert!(matches!(
            read_line_bounded(&mut reader, 8).await.expect("read"),
            LineRead::Line(line) if line == b"ok\n"
        ));
        assert!(matches!(
            read_line_bounded(&mut reader, 8).await.expect("read"),
            LineRead::Line(line) if line == b"partial"
        ));
        assert!(matches!(
            read_line_bounded(&mut reader, 8).await.expect("read"),
            LineRead::Eof
        ));
    }

    #[tokio::test]
    async fn registered_session_always_leaves_once() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, dispatcher) = dispatch::channel(registry.clone());
        let ctx = SessionContext {
            config: ServerConfig::new("127.0.0.1:0".parse().expect("addr")),
            registry: registry.clone(),
            dispatch: handle,
        };
        let ids = SessionIdAllocator::default();

        let (early_tx, mut early_rx) = mpsc::channel(4);
        registry
            .register(
                "early",
                SessionHandle::new(ids.next_id(), early_tx, Arc::new(Notify::new())),
            )
            .await;
        // Registered and listed in "early"'s view, but its ack and Join never
        // made it out.
        let ghost_id = ids.next_id();
        let (ghost_tx, _ghost_rx) = mpsc::channel(4);
        let admission = registry
            .register(
                "ghost",
                SessionHandle::new(ghost_id, ghost_tx, Arc::new(Notify::new())),
            )
            .await;
        assert_eq!(admission.roster, vec!["early", "ghost"]);

        let mut session = Session {
            id: ghost_id,
            remote_addr: "127.0.0.1:9".parse().expect("addr"),
            state: SessionState::Active,
            display_name: Some("ghost".to_string()),
        };
        close_session(&ctx, &mut session).await;
        close_session(&ctx, &mut session).await;
        drop(ctx);
        dispatcher.run().await;

        assert_eq!(early_rx.recv().await.as_deref(), Some(&b"[DC]\tghost\n"[..]));
        assert!(early_rx.try_recv().is_err());
        assert_eq!(registry.names().await, vec!["early"]);
    }
}
