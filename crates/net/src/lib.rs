//! # Tether Connection Layer
//!
//! Everything above the wire format and below application payloads:
//!
//! - [`correlator`]: pending request/response calls with timeouts
//! - [`multiplexer`]: ordered long-lived streams keyed by odd ids
//! - [`connection`]: one socket, its driver task and dispatch
//! - [`transport`]: TCP and TLS setup
//! - [`handshake`] and [`client`]: joining a hub as an agent or viewer, and
//!   staying joined across hub restarts
//!
//! ```no_run
//! use net::{client, ConnectOptions, Connection, Timeout};
//! use protocol::{Envelope, InstanceType};
//!
//! # async fn run() -> net::Result<()> {
//! let options = ConnectOptions::new("hub.example.com", client::DEFAULT_PORT, InstanceType::Viewer)
//!     .credentials("admin", "secret");
//! let connection = client::connect(&options, |_: &Connection, envelope: Envelope| {
//!     println!("unsolicited: {} bytes", envelope.payload.len());
//! })
//! .await?;
//!
//! let reply = connection.request(0x1234_5673, b"ping".to_vec(), Timeout::Default).await?;
//! println!("reply: {:?}", reply.payload);
//! connection.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod handshake;
pub mod multiplexer;
pub mod transport;

pub use client::{connect, connect_loop, ConnectOptions, Credentials, RetryDelays, RetryWait};
pub use connection::{
    ChannelHandler, Connection, ConnectionConfig, ConnectionState, Dispatch, MessageHandler,
    StreamHandle, Timeout, DEFAULT_DRAIN_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use correlator::ResponseFuture;
pub use error::{CloseReason, Error, Result};
pub use multiplexer::{ChannelConsumer, StreamClosed, StreamConsumer, StreamEvent, StreamReceiver};
pub use transport::CertPolicy;
