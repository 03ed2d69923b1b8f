use crate::{error::ClientError, surface::PresentationSurface, users::UserSet};
use groupchat_core::{
    decode_frame, encode_chat_line, encode_frame, sanitize_field, DecodeReport, Frame,
    LineFrameDecoder, DEFAULT_MAX_FRAME_BYTES,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A joined chat session. Dropping it stops the receive loop; [`close`]
/// additionally says goodbye to the hub.
///
/// [`close`]: ChatConnection::close
pub struct ChatConnection {
    display_name: String,
    users: Arc<UserSet>,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    surface: Arc<dyn PresentationSurface>,
    max_frame_bytes: usize,
    stop_tx: watch::Sender<bool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connects, performs the join handshake and starts the receive loop.
///
/// Any failure before the ack has been read is reported to `surface` as a
/// handshake error. A failed TCP connect returns [`ClientError::Connect`];
/// everything after that returns [`ClientError::HandshakeFailed`].
pub async fn connect(
    config: ClientConfig,
    surface: Arc<dyn PresentationSurface>,
) -> Result<ChatConnection, ClientError> {
    let addr = config.addr();
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(source) => {
            warn!(event = "client_connect_failed", addr = %addr, error = %source);
            surface.on_handshake_error(&format!("could not reach {addr}: {source}"));
            return Err(ClientError::Connect { addr, source });
        }
    };
    let (reader_half, mut writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    let (display_name, users) = match handshake(&config, &mut reader, &mut writer_half).await {
        Ok(joined) => joined,
        Err(reason) => {
            warn!(event = "client_handshake_failed", addr = %addr, reason = %reason);
            surface.on_handshake_error(&reason);
            return Err(ClientError::HandshakeFailed(reason));
        }
    };
    info!(
        event = "client_joined",
        addr = %addr,
        requested = %config.name,
        name = %display_name,
        online = users.len()
    );

    let user_set = Arc::new(UserSet::new());
    user_set.seed(users.iter().cloned());
    surface.on_connected(&display_name, &user_set.sorted());

    let connected = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = watch::channel(false);
    let receive_task = tokio::spawn(receive_loop(
        reader,
        LineFrameDecoder::new(config.max_frame_bytes),
        user_set.clone(),
        surface.clone(),
        connected.clone(),
        stop_rx,
    ));

    Ok(ChatConnection {
        display_name,
        users: user_set,
        connected,
        writer: Mutex::new(Some(writer_half)),
        surface,
        max_frame_bytes: config.max_frame_bytes,
        stop_tx,
        receive_task: Mutex::new(Some(receive_task)),
    })
}

async fn handshake(
    config: &ClientConfig,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<(String, Vec<String>), String> {
    let requested = sanitize_field(&config.name);
    if requested.trim().is_empty() {
        return Err("display name is empty".to_string());
    }
    let request = encode_frame(
        &Frame::JoinRequest {
            name: requested.into_owned(),
        },
        config.max_frame_bytes,
    )
    .map_err(|err| err.to_string())?;
    writer
        .write_all(&request)
        .await
        .map_err(|err| format!("failed to send join request: {err}"))?;
    writer
        .flush()
        .await
        .map_err(|err| format!("failed to send join request: {err}"))?;

    let mut line = Vec::new();
    let limit = (config.max_frame_bytes + 2) as u64;
    let mut limited = (&mut *reader).take(limit);
    let read = tokio::time::timeout(
        config.handshake_timeout,
        limited.read_until(b'\n', &mut line),
    )
    .await
    .map_err(|_| format!("no reply within {:?}", config.handshake_timeout))?
    .map_err(|err| format!("failed to read reply: {err}"))?;
    if read == 0 {
        return Err("server closed the connection before acknowledging".to_string());
    }

    match decode_frame(&line, config.max_frame_bytes) {
        Ok(Frame::JoinAck {
            resolved_name,
            users,
        }) => Ok((resolved_name, users)),
        Ok(other) => Err(format!("expected join_ack, got {}", other.kind())),
        Err(err) => Err(format!("malformed reply: {err}")),
    }
}

async fn receive_loop(
    mut reader: BufReader<OwnedReadHalf>,
    mut decoder: LineFrameDecoder,
    users: Arc<UserSet>,
    surface: Arc<dyn PresentationSurface>,
    connected: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut read_buf = [0u8; 8192];
    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!(event = "client_receive_stopped");
                break;
            }
            read = reader.read(&mut read_buf) => {
                let read = match read {
                    Ok(0) => {
                        apply_report(decoder.finish(), &users, surface.as_ref());
                        debug!(event = "client_eof");
                        break;
                    }
                    Ok(read) => read,
                    Err(err) => {
                        warn!(event = "client_read_error", error = %err);
                        break;
                    }
                };
                apply_report(decoder.push_chunk(&read_buf[..read]), &users, surface.as_ref());
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    surface.on_disconnected();
}

fn apply_report(report: DecodeReport, users: &UserSet, surface: &dyn PresentationSurface) {
    for err in report.errors {
        warn!(event = "client_decode_error", error = %err);
    }
    for frame in report.frames {
        apply_frame(frame, users, surface);
    }
}

fn apply_frame(frame: Frame, users: &UserSet, surface: &dyn PresentationSurface) {
    match frame {
        Frame::Join { name } => {
            if users.insert(&name) {
                surface.on_user_joined(&name);
            } else {
                debug!(event = "client_duplicate_join", name = %name);
            }
        }
        Frame::Leave { name } => {
            if users.remove(&name) {
                surface.on_user_left(&name);
            } else {
                debug!(event = "client_unknown_leave", name = %name);
            }
        }
        Frame::ChatMessage { name, text } => surface.on_message_received(&name, &text),
        other => warn!(event = "client_unexpected_frame", kind = other.kind()),
    }
}

impl ChatConnection {
    /// The name the hub assigned, which may carry a numeric suffix.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn users(&self) -> Vec<String> {
        self.users.sorted()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends one chat line and echoes it locally, since the hub never sends
    /// a message back to its author. Empty text is ignored.
    pub async fn submit_chat_text(&self, text: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let text = sanitize_field(text.trim_end_matches(['\r', '\n']));
        if text.is_empty() {
            return Ok(());
        }
        let line = encode_chat_line(&text, self.max_frame_bytes)?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let send = async {
            stream.write_all(&line).await?;
            stream.flush().await
        };
        if let Err(err) = send.await {
            warn!(event = "client_write_error", error = %err);
            self.connected.store(false, Ordering::SeqCst);
            writer.take();
            return Err(ClientError::ConnectionLost(err));
        }
        drop(writer);

        self.surface.on_self_message_sent(&text);
        Ok(())
    }

    /// Closes the write half and waits for the receive loop to finish. The
    /// surface sees exactly one disconnect either way.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.receive_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ChannelSurface;
    use groupchat_core::ChatEvent;
    use tokio::{net::TcpListener, sync::mpsc};

    async fn fake_hub() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    async fn read_request(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_line(&mut line))
            .await
            .expect("request timeout")
            .expect("request read");
        line
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    fn joined(name: &str) -> ChatEvent {
        ChatEvent::UserJoined {
            name: name.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_seeds_users_and_relays_notices() {
        let (listener, port) = fake_hub().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut stream = BufReader::new(stream);
            let request = read_request(&mut stream).await;
            // Ack and the first notices arrive in one write.
            stream
                .get_mut()
                .write_all(
                    b"[ACK_CONN]\tzoe1\tzoe\tzoe1\n[NC]\tmax\n[NC]\tzoe\n[DC]\tnobody\ngarbage\n\
                      [MSG]\tmax\thi there\n[DC]\tmax\n",
                )
                .await
                .expect("write");
            request
        });

        let (surface, mut events) = ChannelSurface::channel();
        let connection = connect(ClientConfig::new("zoe", "127.0.0.1", port), Arc::new(surface))
            .await
            .expect("connect");
        assert_eq!(server.await.expect("server"), "[UNAME]\tzoe\n");
        assert_eq!(connection.display_name(), "zoe1");

        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::Connected {
                display_name: "zoe1".to_string(),
                users: vec!["zoe".to_string(), "zoe1".to_string()],
            }
        );
        assert_eq!(next_event(&mut events).await, joined("max"));
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::MessageReceived {
                name: "max".to_string(),
                text: "hi there".to_string(),
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::UserLeft {
                name: "max".to_string()
            }
        );
        assert_eq!(next_event(&mut events).await, ChatEvent::Disconnected);
        assert!(!connection.is_connected());
        assert_eq!(connection.users(), vec!["zoe", "zoe1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_first_reply_fails_handshake() {
        let (listener, port) = fake_hub().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut stream = BufReader::new(stream);
            read_request(&mut stream).await;
            let _ = stream.get_mut().write_all(b"[MSG]\tx\ty\n").await;
        });

        let (surface, mut events) = ChannelSurface::channel();
        let result = connect(ClientConfig::new("amy", "127.0.0.1", port), Arc::new(surface)).await;
        assert!(matches!(result, Err(ClientError::HandshakeFailed(_))));
        assert!(matches!(
            next_event(&mut events).await,
            ChatEvent::HandshakeError { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_before_ack_fails_handshake() {
        let (listener, port) = fake_hub().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut stream = BufReader::new(stream);
            read_request(&mut stream).await;
        });

        let (surface, _events) = ChannelSurface::channel();
        let result = connect(ClientConfig::new("amy", "127.0.0.1", port), Arc::new(surface)).await;
        match result {
            Err(ClientError::HandshakeFailed(reason)) => {
                assert!(reason.contains("closed"), "unexpected reason: {reason}")
            }
            other => panic!("expected handshake failure, got {:?}", other.err()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_server_times_out_handshake() {
        let (listener, port) = fake_hub().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(stream);
        });

        let mut config = ClientConfig::new("amy", "127.0.0.1", port);
        config.handshake_timeout = Duration::from_millis(100);
        let (surface, _events) = ChannelSurface::channel();
        let result = connect(config, Arc::new(surface)).await;
        assert!(matches!(result, Err(ClientError::HandshakeFailed(_))));
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_sanitizes_echoes_and_rejects_after_disconnect() {
        let (listener, port) = fake_hub().await;
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut stream = BufReader::new(stream);
            read_request(&mut stream).await;
            stream
                .get_mut()
                .write_all(b"[ACK_CONN]\tamy\tamy\n")
                .await
                .expect("write");
            let line = read_request(&mut stream).await;
            let _ = release_rx.await;
            line
        });

        let (surface, mut events) = ChannelSurface::channel();
        let connection = connect(ClientConfig::new("amy", "127.0.0.1", port), Arc::new(surface))
            .await
            .expect("connect");
        assert!(matches!(
            next_event(&mut events).await,
            ChatEvent::Connected { .. }
        ));

        connection.submit_chat_text("").await.expect("empty is ignored");
        connection
            .submit_chat_text("a\tb")
            .await
            .expect("submit");
        assert_eq!(
            next_event(&mut events).await,
            ChatEvent::SelfMessageSent {
                text: "a b".to_string()
            }
        );

        let _ = release_tx.send(());
        assert_eq!(server.await.expect("server"), "a b\n");
        assert_eq!(next_event(&mut events).await, ChatEvent::Disconnected);
        assert!(matches!(
            connection.submit_chat_text("late").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_reports_one_disconnect() {
        let (listener, port) = fake_hub().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut stream = BufReader::new(stream);
            read_request(&mut stream).await;
            stream
                .get_mut()
                .write_all(b"[ACK_CONN]\tamy\tamy\n")
                .await
                .expect("write");
            let mut rest = String::new();
            let _ = stream.read_line(&mut rest).await;
            rest
        });

        let (surface, mut events) = ChannelSurface::channel();
        let connection = connect(ClientConfig::new("amy", "127.0.0.1", port), Arc::new(surface))
            .await
            .expect("connect");
        next_event(&mut events).await;

        connection.close().await;
        connection.close().await;
        assert!(!connection.is_connected());
        assert_eq!(next_event(&mut events).await, ChatEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(server.await.expect("server"), "");
    }
}
