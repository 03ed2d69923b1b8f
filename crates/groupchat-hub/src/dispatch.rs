use crate::registry::{DeliveryError, SessionId, SessionRegistry};
use groupchat_core::{encode_frame, Frame, FrameError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One unit of broadcast work. The payload is encoded once and shared by
/// every recipient; `origin` only decides who is skipped.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub origin: Option<SessionId>,
    pub kind: &'static str,
    pub payload: Arc<[u8]>,
}

impl OutgoingMessage {
    pub fn new(
        origin: Option<SessionId>,
        frame: &Frame,
        max_frame_bytes: usize,
    ) -> Result<Self, FrameError> {
        let payload = encode_frame(frame, max_frame_bytes)?;
        Ok(Self {
            origin,
            kind: frame.kind(),
            payload: Arc::from(payload),
        })
    }
}

#[derive(Clone, Debug)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl DispatchHandle {
    /// Appends to the queue without waiting. Returns false once the
    /// dispatcher has stopped.
    pub fn enqueue(&self, message: OutgoingMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub messages: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub evictions: u64,
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    rx: mpsc::UnboundedReceiver<OutgoingMessage>,
}

pub fn channel(registry: Arc<SessionRegistry>) -> (DispatchHandle, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchHandle { tx }, Dispatcher { registry, rx })
}

impl Dispatcher {
    /// Drains the queue until every `DispatchHandle` is gone and the queue
    /// is empty.
    pub async fn run(mut self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        while let Some(message) = self.rx.recv().await {
            self.fan_out(&message, &mut stats).await;
        }
        debug!(
            event = "dispatch_stop",
            messages = stats.messages,
            deliveries = stats.deliveries,
            failures = stats.failures,
            evictions = stats.evictions
        );
        stats
    }

    /// A recipient whose queue is full has fallen behind for good; it is told
    /// to close so it leaves through the normal path instead of silently
    /// missing frames. A closed queue means that session is already leaving.
    async fn fan_out(&self, message: &OutgoingMessage, stats: &mut DispatchStats) {
        stats.messages += 1;
        let mut slow = Vec::new();
        for (name, handle) in self.registry.snapshot().await {
            if Some(handle.id) == message.origin {
                continue;
            }
            match handle.try_deliver(message.payload.clone()) {
                Ok(()) => stats.deliveries += 1,
                Err(err) => {
                    stats.failures += 1;
                    warn!(
                        event = "dispatch_delivery_failed",
                        session = %handle.id,
                        name = %name,
                        kind = message.kind,
                        reason = %err
                    );
                    if err == DeliveryError::QueueFull {
                        slow.push((name, handle));
                    }
                }
            }
        }

        for (name, handle) in slow {
            warn!(event = "dispatch_slow_consumer", session = %handle.id, name = %name);
            handle.evict();
            stats.evictions += 1;
        }
    }
}
