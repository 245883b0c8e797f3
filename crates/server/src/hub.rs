//! The hub: accepts connections and wires them to the router.
//!
//! [`Hub`] owns the listener, the [`Registry`] and the shared
//! [`HubContext`]. Each accepted socket becomes a [`Connection`] driven by a
//! [`HubHandler`]; a watchdog closes it if the handshake does not complete
//! within `network.handshake_timeout_secs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use net::{CloseReason, Connection, ConnectionConfig, ConnectionState};
use protocol::Cvid;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::registry::Registry;
use crate::router::{HubContext, HubHandler};

/// Hub lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the hub.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Hub state changed.
    StateChanged(HubState),
    /// A socket was accepted.
    Accepted { peer: SocketAddr },
    /// A connection was closed for not completing its handshake in time.
    HandshakeTimedOut { peer: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Everything an accepted socket needs to become a hub connection.
#[derive(Clone)]
struct Acceptor {
    context: Arc<HubContext>,
    tls: Option<TlsAcceptor>,
    connection_config: ConnectionConfig,
    handshake_timeout: Duration,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<HubEvent>,
}

/// The Tether hub.
pub struct Hub {
    config: Config,
    context: Arc<HubContext>,
    state: Arc<RwLock<HubState>>,
    local_addr: Option<SocketAddr>,
    shutdown_token: CancellationToken,
    tasks: TaskTracker,
    event_tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    /// Creates a hub from its configuration. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(config: Config) -> Self {
        let server_uuid = config
            .server
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let auth = Authenticator::new(&config.auth);
        if auth.user_count() == 0 && config.auth.require_login {
            warn!("No users configured: viewers will not be able to log in");
        }

        let context = HubContext::new(Registry::new(), auth, server_uuid)
            .notify_endpoint_closed(config.network.notify_endpoint_closed);
        info!(
            cvid = context.server_cvid,
            uuid = %context.server_uuid,
            "Hub identity"
        );

        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            context: Arc::new(context),
            state: Arc::new(RwLock::new(HubState::Stopped)),
            local_addr: None,
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> HubState {
        *self.state.read().await
    }

    /// Returns a receiver for hub events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    /// The registry of established instances.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }

    /// The hub's own CVID.
    pub fn server_cvid(&self) -> Cvid {
        self.context.server_cvid
    }

    /// The hub's long-term uuid.
    pub fn server_uuid(&self) -> &str {
        &self.context.server_uuid
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != HubState::Stopped {
                anyhow::bail!("Hub is already running");
            }
            *state = HubState::Starting;
        }
        self.emit_event(HubEvent::StateChanged(HubState::Starting));

        // A previous stop cancelled these
        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
            self.tasks = TaskTracker::new();
        }

        match self.bind().await {
            Ok((listener, tls)) => {
                self.spawn_accept_loop(listener, tls);
            }
            Err(e) => {
                *self.state.write().await = HubState::Stopped;
                self.emit_event(HubEvent::Error {
                    message: format!("{:#}", e),
                });
                self.emit_event(HubEvent::StateChanged(HubState::Stopped));
                return Err(e);
            }
        }

        *self.state.write().await = HubState::Running;
        self.emit_event(HubEvent::StateChanged(HubState::Running));
        Ok(())
    }

    async fn bind(&mut self) -> Result<(TcpListener, Option<TlsAcceptor>)> {
        let tls = if self.config.tls.enabled {
            let cert = self
                .config
                .tls
                .cert_path
                .as_deref()
                .context("tls.cert_path is not set")?;
            let key = self
                .config
                .tls
                .key_path
                .as_deref()
                .context("tls.key_path is not set")?;
            Some(net::transport::acceptor(cert, key).context("Failed to load TLS certificate")?)
        } else {
            None
        };

        let address = (
            self.config.server.listen_address.as_str(),
            self.config.server.port,
        );
        let listener = TcpListener::bind(address).await.with_context(|| {
            format!(
                "Failed to bind {}:{}",
                self.config.server.listen_address, self.config.server.port
            )
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(
            address = %local_addr,
            tls = tls.is_some(),
            "Hub listening"
        );
        Ok((listener, tls))
    }

    fn spawn_accept_loop(&self, listener: TcpListener, tls: Option<TlsAcceptor>) {
        let acceptor = Acceptor {
            context: Arc::clone(&self.context),
            tls,
            connection_config: ConnectionConfig::default()
                .max_frame_size(self.config.network.max_frame_size),
            handshake_timeout: self.config.network.handshake_timeout(),
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
        };
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = acceptor.shutdown_token.cancelled() => {
                        debug!("Accept loop received shutdown signal");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let acceptor = acceptor.clone();
                            tasks.spawn(async move {
                                acceptor.handle(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            let _ = acceptor.event_tx.send(HubEvent::Error {
                                message: e.to_string(),
                            });
                            // Back off so a persistent error (e.g. EMFILE) does not spin
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });
    }

    /// Stops accepting, disconnects every connection and waits for their
    /// tasks to finish.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != HubState::Running {
                debug!("Hub is not running, nothing to stop");
                return Ok(());
            }
            *state = HubState::ShuttingDown;
        }
        self.emit_event(HubEvent::StateChanged(HubState::ShuttingDown));

        info!("Stopping hub...");
        self.shutdown_token.cancel();
        self.context.registry.disconnect_all();

        self.tasks.close();
        self.tasks.wait().await;

        *self.state.write().await = HubState::Stopped;
        self.local_addr = None;
        self.emit_event(HubEvent::StateChanged(HubState::Stopped));

        info!("Hub stopped");
        Ok(())
    }

    /// Emits a hub event.
    fn emit_event(&self, event: HubEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Acceptor {
    async fn handle(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let _ = self.event_tx.send(HubEvent::Accepted { peer });

        let connection = Connection::new(self.connection_config.clone().peer_addr(peer));
        let handler = HubHandler::new(Arc::clone(&self.context));

        match &self.tls {
            Some(tls) => {
                let handshake = tokio::time::timeout(self.handshake_timeout, tls.accept(stream));
                match handshake.await {
                    Ok(Ok(stream)) => connection.attach(stream, handler),
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "TLS handshake failed");
                        connection.close_with(CloseReason::Handshake(e.to_string()));
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "TLS handshake timed out");
                        connection.close_with(CloseReason::Handshake("tls handshake timed out".into()));
                        let _ = self.event_tx.send(HubEvent::HandshakeTimedOut { peer });
                        return;
                    }
                }
            }
            None => connection.attach(stream, handler),
        }

        debug!(%peer, conn = connection.id(), "Connection accepted");
        self.watch(connection, peer).await;
    }

    /// Enforce the handshake deadline and close the connection on shutdown.
    async fn watch(self, connection: Connection, peer: SocketAddr) {
        let mut state = connection.subscribe_state();
        let established = tokio::time::timeout(
            self.handshake_timeout,
            state.wait_for(|s| *s >= ConnectionState::Established),
        );

        let timed_out = tokio::select! {
            _ = self.shutdown_token.cancelled() => {
                connection.disconnect();
                return;
            }
            result = established => result.is_err(),
        };
        if timed_out {
            warn!(%peer, conn = connection.id(), "Handshake timed out");
            connection.close_with(CloseReason::Handshake("handshake timed out".into()));
            let _ = self.event_tx.send(HubEvent::HandshakeTimedOut { peer });
            return;
        }

        tokio::select! {
            _ = self.shutdown_token.cancelled() => connection.disconnect(),
            _ = connection.closed() => {}
        }
    }
}
