//! Connecting to a hub.
//!
//! [`connect`] takes a [`ConnectOptions`] through the whole client lifecycle:
//! TCP connect, optional TLS, CVID exchange and, when credentials are given,
//! login. The returned connection is `Established`.
//!
//! [`connect_loop`] keeps an instance attached: it reconnects whenever the
//! connection closes or an attempt fails, waiting between attempts as
//! directed by a [`RetryWait`].

use std::path::PathBuf;
use std::time::Duration;

use protocol::{InstanceType, MAX_FRAME_SIZE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, MessageHandler, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{CloseReason, Error, Result};
use crate::handshake;
use crate::transport::{self, CertPolicy};

/// Default hub port.
pub const DEFAULT_PORT: u16 = 8768;

/// Username and plaintext password presented at login.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach and identify to a hub.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: String,
    pub port: u16,
    /// Wrap the socket in TLS.
    pub tls: bool,
    pub cert_policy: CertPolicy,
    /// Extra trust anchors (PEM), typically the hub's own certificate.
    pub ca_file: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    pub instance: InstanceType,
    pub flavor: u8,
    /// Long-term instance uuid. A random one is used when `None`.
    pub uuid: Option<String>,
    pub connect_timeout: Duration,
    /// Deadline for handshake exchanges and [`Timeout::Default`](crate::Timeout::Default) requests.
    pub request_timeout: Duration,
    pub max_frame_size: usize,
}

impl ConnectOptions {
    /// Options for an instance of `instance` type reaching `address:port`.
    pub fn new(address: impl Into<String>, port: u16, instance: InstanceType) -> Self {
        Self {
            address: address.into(),
            port,
            tls: false,
            cert_policy: CertPolicy::Verify,
            ca_file: None,
            credentials: None,
            instance,
            flavor: 0,
            uuid: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn tls(mut self, policy: CertPolicy) -> Self {
        self.tls = true;
        self.cert_policy = policy;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn flavor(mut self, flavor: u8) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Connect to a hub and complete the handshake.
///
/// A certificate the client does not trust fails with
/// [`Error::Certificate`]; retrying with [`CertPolicy::Insecure`] is the
/// caller's decision.
pub async fn connect<H: MessageHandler>(options: &ConnectOptions, handler: H) -> Result<Connection> {
    let tcp = transport::connect_tcp(&options.address, options.port, options.connect_timeout).await?;

    let mut config = ConnectionConfig::default()
        .max_frame_size(options.max_frame_size)
        .request_timeout(Some(options.request_timeout));
    if let Ok(addr) = tcp.peer_addr() {
        config = config.peer_addr(addr);
    }
    let connection = Connection::new(config);

    if options.tls {
        let tls_config = transport::client_config(options.cert_policy, options.ca_file.as_deref())?;
        let stream = match transport::connect_tls(tcp, &options.address, tls_config).await {
            Ok(stream) => stream,
            Err(e) => {
                connection.close_with(CloseReason::Handshake(e.to_string()));
                return Err(e);
            }
        };
        connection.attach(stream, handler);
    } else {
        connection.attach(tcp, handler);
    }

    establish(&connection, options).await?;
    Ok(connection)
}

/// How long to wait before the next connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryWait {
    /// Start at `initial`, multiply by `factor` after every attempt, never
    /// exceed `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
    /// Always the same wait.
    Constant(Duration),
}

impl RetryWait {
    /// A fresh sequence of waits, starting from the first.
    pub fn delays(&self) -> RetryDelays {
        RetryDelays {
            policy: self.clone(),
            next: match self {
                RetryWait::Exponential { initial, .. } => *initial,
                RetryWait::Constant(wait) => *wait,
            },
        }
    }
}

impl Default for RetryWait {
    fn default() -> Self {
        RetryWait::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

/// Endless iterator over the waits of a [`RetryWait`].
#[derive(Debug, Clone)]
pub struct RetryDelays {
    policy: RetryWait,
    next: Duration,
}

impl Iterator for RetryDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match &self.policy {
            RetryWait::Exponential { max, factor, .. } => {
                let current = self.next.min(*max);
                self.next = Duration::try_from_secs_f64(current.as_secs_f64() * factor.max(1.0))
                    .map_or(*max, |grown| grown.min(*max));
                Some(current)
            }
            RetryWait::Constant(wait) => Some(*wait),
        }
    }
}

/// Keep a connection to the hub until `cancel` fires.
///
/// `handler` builds the message handler for each new connection. Every
/// established connection is sent on `connected`; the loop then waits for it
/// to close and starts over. Failed attempts and closures are followed by the
/// next wait from `retry`, which restarts from its first value after each
/// successful connect.
///
/// A cancelled loop disconnects the live connection and returns `Ok`. An
/// untrusted certificate or rejected login ends the loop with that error,
/// since retrying cannot fix either.
pub async fn connect_loop<H, F>(
    options: &ConnectOptions,
    mut handler: F,
    retry: &RetryWait,
    cancel: CancellationToken,
    connected: mpsc::UnboundedSender<Connection>,
) -> Result<()>
where
    H: MessageHandler,
    F: FnMut() -> H,
{
    let mut delays = retry.delays();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect(options, handler()) => result,
        };

        match result {
            Ok(connection) => {
                delays = retry.delays();
                attempt = 0;
                if connected.send(connection.clone()).is_err() {
                    debug!(conn = connection.id(), "No one is watching for new connections");
                }

                let reason = tokio::select! {
                    _ = cancel.cancelled() => {
                        connection.disconnect();
                        connection.closed().await;
                        return Ok(());
                    }
                    reason = connection.closed() => reason,
                };
                info!(conn = connection.id(), reason = %reason, "Connection lost, reconnecting");
            }
            Err(e @ (Error::Certificate { .. } | Error::LoginFailed(_))) => {
                warn!(error = %e, "Giving up on hub");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    address = %options.address,
                    port = options.port,
                    attempt,
                    error = %e,
                    "Connection attempt failed"
                );
            }
        }

        let wait = delays.next().unwrap_or(Duration::ZERO);
        debug!(?wait, "Waiting before next connection attempt");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Run the CVID exchange and login on an attached connection, then mark it
/// established. The connection is closed if any step fails.
pub async fn establish(connection: &Connection, options: &ConnectOptions) -> Result<()> {
    match handshake_steps(connection, options).await {
        Ok(()) => {
            connection.mark_established();
            info!(
                conn = connection.id(),
                cvid = connection.local_cvid(),
                instance = %options.instance,
                "Connection established"
            );
            Ok(())
        }
        Err(e) => {
            warn!(conn = connection.id(), error = %e, "Handshake failed");
            connection.close_with(CloseReason::Handshake(e.to_string()));
            Err(e)
        }
    }
}

async fn handshake_steps(connection: &Connection, options: &ConnectOptions) -> Result<()> {
    let uuid = options
        .uuid
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    handshake::request_cvid(
        connection,
        options.instance,
        options.flavor,
        &uuid,
        options.request_timeout,
    )
    .await?;

    match &options.credentials {
        Some(credentials) => {
            handshake::login(
                connection,
                &credentials.username,
                &credentials.password,
                options.request_timeout,
            )
            .await
        }
        None if options.instance.requires_login() => Err(Error::LoginFailed(format!(
            "{} instances must log in",
            options.instance
        ))),
        None => Ok(()),
    }
}
