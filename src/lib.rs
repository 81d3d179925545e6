//! Multi-channel WebSocket Chat Relay Library
//!
//! A WebSocket chat relay built with tokio-tungstenite where every channel
//! is an actor and every connection is a read/write loop pair.
//!
//! # Features
//! - Named (multi) channels created on first use
//! - Direct channels between two users, provisioned lazily
//! - Batched outbound frames, one envelope per write-loop wake-up
//! - Slow-consumer disconnection instead of sender backpressure
//! - Keep-alive pings and read/write deadlines
//!
//! # Architecture
//! - `Channel` actors own their subscriber sets; no locks on the hot path
//! - `Registry` maps channel names and usernames, passed as `Arc<Registry>`
//! - `Multiplexer` bridges one socket to the channels through a bounded queue
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chat_relay::{serve, Registry, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     serve(listener, Registry::new(config)).await;
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod multiplexer;
pub mod registry;
pub mod types;
pub mod validation;

// Re-export main types for convenience
pub use channel::{Channel, ChannelKind, Participant};
pub use client::ClientHandle;
pub use config::ServerConfig;
pub use error::ChatError;
pub use handler::{handle_connection, serve};
pub use message::{ClientCommand, ServerMessage, ServerMessages};
pub use multiplexer::Multiplexer;
pub use registry::Registry;
pub use types::{ChannelId, ClientId};
