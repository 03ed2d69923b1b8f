use chrono::Local;
use groupchat_core::{ChatEvent, TimedEvent};
use std::{
    io::{self, Write},
    sync::Mutex,
};
use tokio::sync::mpsc;

/// Whatever shows the conversation to a person (or a test). Callbacks come
/// from the receive loop and from the sending side, so they must not block.
pub trait PresentationSurface: Send + Sync {
    fn on_connected(&self, _display_name: &str, _users: &[String]) {}
    fn on_user_joined(&self, name: &str);
    fn on_user_left(&self, name: &str);
    fn on_message_received(&self, name: &str, text: &str);
    fn on_self_message_sent(&self, text: &str);
    fn on_disconnected(&self);
    fn on_handshake_error(&self, reason: &str);
}

/// Routes an event to the matching callback.
pub fn present(surface: &dyn PresentationSurface, event: &ChatEvent) {
    match event {
        ChatEvent::Connected {
            display_name,
            users,
        } => surface.on_connected(display_name, users),
        ChatEvent::UserJoined { name } => surface.on_user_joined(name),
        ChatEvent::UserLeft { name } => surface.on_user_left(name),
        ChatEvent::MessageReceived { name, text } => surface.on_message_received(name, text),
        ChatEvent::SelfMessageSent { text } => surface.on_self_message_sent(text),
        ChatEvent::Disconnected => surface.on_disconnected(),
        ChatEvent::HandshakeError { reason } => surface.on_handshake_error(reason),
    }
}

/// Human readable transcript, one timestamped line per event.
pub struct TerminalSurface<W: Write + Send> {
    out: Mutex<W>,
}

impl TerminalSurface<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn line(&self, text: &str) {
        let stamp = Local::now().format("%H:%M:%S");
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "[{stamp}] {text}");
            let _ = out.flush();
        }
    }
}

impl<W: Write + Send> PresentationSurface for TerminalSurface<W> {
    fn on_connected(&self, display_name: &str, users: &[String]) {
        self.line(&format!(
            "connected as {display_name} (online: {})",
            users.join(", ")
        ));
    }

    fn on_user_joined(&self, name: &str) {
        self.line(&format!("* {name} joined"));
    }

    fn on_user_left(&self, name: &str) {
        self.line(&format!("* {name} left"));
    }

    fn on_message_received(&self, name: &str, text: &str) {
        self.line(&format!("{name}: {text}"));
    }

    fn on_self_message_sent(&self, text: &str) {
        self.line(&format!("you: {text}"));
    }

    fn on_disconnected(&self) {
        self.line("disconnected from server");
    }

    fn on_handshake_error(&self, reason: &str) {
        self.line(&format!("could not join: {reason}"));
    }
}

/// Newline delimited JSON, one [`TimedEvent`] per line.
pub struct JsonLinesSurface<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesSurface<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        let line = match TimedEvent::now(event).to_json_line() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(event = "surface_encode_error", error = %err);
                return;
            }
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

impl<W: Write + Send> PresentationSurface for JsonLinesSurface<W> {
    fn on_connected(&self, display_name: &str, users: &[String]) {
        self.emit(ChatEvent::Connected {
            display_name: display_name.to_string(),
            users: users.to_vec(),
        });
    }

    fn on_user_joined(&self, name: &str) {
        self.emit(ChatEvent::UserJoined {
            name: name.to_string(),
        });
    }

    fn on_user_left(&self, name: &str) {
        self.emit(ChatEvent::UserLeft {
            name: name.to_string(),
        });
    }

    fn on_message_received(&self, name: &str, text: &str) {
        self.emit(ChatEvent::MessageReceived {
            name: name.to_string(),
            text: text.to_string(),
        });
    }

    fn on_self_message_sent(&self, text: &str) {
        self.emit(ChatEvent::SelfMessageSent {
            text: text.to_string(),
        });
    }

    fn on_disconnected(&self) {
        self.emit(ChatEvent::Disconnected);
    }

    fn on_handshake_error(&self, reason: &str) {
        self.emit(ChatEvent::HandshakeError {
            reason: reason.to_string(),
        });
    }
}

/// Forwards every callback as a [`ChatEvent`] so another task can consume
/// them in order.
#[derive(Clone)]
pub struct ChannelSurface {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelSurface {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ChatEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl PresentationSurface for ChannelSurface {
    fn on_connected(&self, display_name: &str, users: &[String]) {
        self.send(ChatEvent::Connected {
            display_name: display_name.to_string(),
            users: users.to_vec(),
        });
    }

    fn on_user_joined(&self, name: &str) {
        self.send(ChatEvent::UserJoined {
            name: name.to_string(),
        });
    }

    fn on_user_left(&self, name: &str) {
        self.send(ChatEvent::UserLeft {
            name: name.to_string(),
        });
    }

    fn on_message_received(&self, name: &str, text: &str) {
        self.send(ChatEvent::MessageReceived {
            name: name.to_string(),
            text: text.to_string(),
        });
    }

    fn on_self_message_sent(&self, text: &str) {
        self.send(ChatEvent::SelfMessageSent {
            text: text.to_string(),
        });
    }

    fn on_disconnected(&self) {
        self.send(ChatEvent::Disconnected);
    }

    fn on_handshake_error(&self, reason: &str) {
        self.send(ChatEvent::HandshakeError {
            reason: reason.to_string(),
        });
    }
}
