//! Server configuration
//!
//! Defaults match a local development setup. Every setting can be given
//! as a command line flag or a `CHAT_*` environment variable; the bind
//! address may also be the first positional argument.

use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::Parser;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Runtime settings shared by the registry and every connection
#[derive(Parser, Debug, Clone)]
#[command(name = "chat_relay", version, about = "Multi-channel WebSocket chat relay")]
pub struct ServerConfig {
    /// Listen address
    #[arg(env = "CHAT_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Channel every client joins on connect
    #[arg(long, env = "CHAT_WELCOME_CHANNEL", default_value = "welcome")]
    pub welcome_channel: String,

    /// Capacity of each client's outbound queue
    #[arg(
        long,
        env = "CHAT_OUTBOUND_CAPACITY",
        default_value = "256",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub outbound_capacity: usize,

    /// Seconds allowed to write a frame to the peer
    #[arg(
        long = "write-wait-secs",
        env = "CHAT_WRITE_WAIT_SECS",
        default_value = "10",
        value_parser = parse_secs
    )]
    pub write_wait: Duration,

    /// Seconds allowed between two inbound frames (pongs included)
    #[arg(
        long = "pong-wait-secs",
        env = "CHAT_PONG_WAIT_SECS",
        default_value = "60",
        value_parser = parse_secs
    )]
    pub pong_wait: Duration,

    /// Maximum inbound message size in bytes
    #[arg(long, env = "CHAT_MAX_MESSAGE_SIZE", default_value = "512")]
    pub max_message_size: usize,

    /// Accepted `Origin` headers, comma separated; empty accepts any
    #[arg(long, env = "CHAT_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            welcome_channel: "welcome".to_string(),
            outbound_capacity: 256,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            max_message_size: 512,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Keep-alive ping period, 9/10 of `pong_wait`
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Whether a handshake with this `Origin` header may proceed
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            Some(origin) if !self.allowed_origins.is_empty() => {
                self.allowed_origins.iter().any(|allowed| allowed == origin)
            }
            _ => true,
        }
    }
}

/// Whole seconds, at least one
fn parse_secs(value: &str) -> Result<Duration, String> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err("must be at least 1 second".to_string()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(e.to_string()),
    }
}
