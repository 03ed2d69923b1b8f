use crate::{
    config::ServerConfig,
    dispatch,
    error::HubError,
    registry::{SessionIdAllocator, SessionRegistry},
    session::{run_session, SessionContext},
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
}

/// Binds `config.bind_addr` and serves until `shutdown` flips to true.
pub async fn run(config: ServerConfig, shutdown: watch::Receiver<bool>) -> Result<(), HubError> {
    ChatServer::bind(config).await?.run(shutdown).await
}

impl ChatServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, HubError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(HubError::Listener)?;
        Ok(Self {
            config,
            listener,
            local_addr,
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), HubError> {
        let ChatServer {
            config,
            listener,
            local_addr,
            registry,
        } = self;

        let (dispatch, dispatcher) = dispatch::channel(registry.clone());
        let dispatcher_task = tokio::spawn(dispatcher.run());
        let ctx = Arc::new(SessionContext {
            config: config.clone(),
            registry: registry.clone(),
            dispatch,
        });
        let (close_tx, close_rx) = watch::channel(false);
        let ids = SessionIdAllocator::default();
        let mut sessions = JoinSet::new();

        info!(event = "hub_start", addr = %local_addr);

        let result = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(event = "session_panicked", error = %err);
                        }
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, remote_addr)) => {
                            let id = ids.next_id();
                            debug!(event = "hub_accept", session = %id, remote = %remote_addr);
                            sessions.spawn(run_session(
                                ctx.clone(),
                                id,
                                stream,
                                remote_addr,
                                close_rx.clone(),
                            ));
                        }
                        Err(err) if is_transient_accept_error(&err) => {
                            warn!(event = "hub_accept_error", error = %err);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(err) => {
                            error!(event = "hub_listener_failed", error = %err);
                            break Err(HubError::Listener(err));
                        }
                    }
                }
            }
        };

        drop(listener);
        let registered = registry.len().await;
        info!(
            event = "hub_stopping",
            active_sessions = sessions.len(),
            registered
        );

        let _ = close_tx.send(true);
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(event = "hub_sessions_aborted", remaining = sessions.len());
            sessions.shutdown().await;
            let dropped = registry.clear().await;
            if dropped > 0 {
                warn!(event = "hub_registry_cleared", dropped);
            }
        }

        // Sessions held the other dispatch handles; once ours is gone the
        // dispatcher finishes whatever is queued and returns.
        drop(ctx);
        match tokio::time::timeout(config.shutdown_grace, dispatcher_task).await {
            Ok(Ok(stats)) => info!(
                event = "hub_stop",
                messages = stats.messages,
                deliveries = stats.deliveries,
                failures = stats.failures,
                evictions = stats.evictions
            ),
            Ok(Err(err)) => error!(event = "dispatch_task_failed", error = %err),
            Err(_) => warn!(event = "dispatch_drain_timeout"),
        }

        result
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    // ENFILE / EMFILE: out of descriptors, may clear once sessions close.
    matches!(err.raw_os_error(), Some(23) | Some(24))
}
