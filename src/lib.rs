//! Broker Relay
//!
//! A reverse-tunnel HTTP relay. A client inside a private network holds one
//! WebSocket tunnel open to a public server; public callers reach the private
//! target through it, and local webhooks reach the public upstream the other
//! way. Rule sets filter both directions and large response bodies travel
//! over a separate streaming side channel.

pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod pending;
pub mod protocol;
pub mod rules;
pub mod serve;
pub mod server;
pub mod stream;
pub mod streaming;
pub mod substitution;
pub mod tls;
pub mod transport;
pub mod tunnel;

// Re-export commonly used types and functions
pub use client::Client;
pub use config::{ClientConfig, ListenConfig, ServerConfig, TlsConfig, load_config, load_rules};
pub use error::{DispatchError, RuleError, StreamError, TransportError, TunnelError};
pub use protocol::{RequestPayload, ResponsePayload, TunnelMessage};
pub use rules::{Direction, Rule, RuleSet};
pub use serve::serve;
pub use server::Server;
pub use stream::StreamType;
pub use tls::{load_client_tls_config, load_tls_config};
pub use tunnel::TunnelConnection;
