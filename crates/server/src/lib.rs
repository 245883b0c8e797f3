//! # Tether Hub
//!
//! The hub every agent and viewer connects to. It assigns CVIDs, checks
//! viewer logins and forwards envelopes between instances by recipient CVID.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Hub                               │
//! │   listener ─▶ accept loop ─▶ Connection + HubHandler       │
//! │                                   │                        │
//! │              ┌────────────────────┼──────────────────┐     │
//! │              ▼                    ▼                  ▼     │
//! │        Authenticator        HubContext           Registry  │
//! │        (viewer login)    (CVID assignment)    (CVID → conn)│
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, Hub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut hub = Hub::new(config);
//!     hub.start().await?;
//!
//!     // Accepting connections until stopped
//!     hub.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: configuration loading, defaults and validation
//! - [`auth`]: viewer login checks
//! - [`registry`]: CVID to connection map
//! - [`router`]: per-connection control handling and forwarding
//! - [`hub`]: listener and connection lifecycle
//! - [`logging`]: tracing subscriber setup

pub mod auth;
pub mod config;
pub mod hub;
pub mod logging;
pub mod registry;
pub mod router;

// Re-export protocol and net for convenience
pub use net;
pub use protocol;

pub use auth::Authenticator;
pub use config::{Config, ConfigError};
pub use hub::{Hub, HubEvent, HubState};
pub use registry::{Registry, RegistryEvent, RouteOutcome};
pub use router::{HubContext, HubHandler};
