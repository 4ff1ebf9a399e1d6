//! Gateway shard client.
//!
//! A [`Shard`] is one persistent, duplex `WebSocket` connection to a
//! real-time gateway. It identifies with credentials, keeps the link
//! alive through the negotiated heartbeat protocol, preserves sequence
//! continuity across transient disconnects (resume), re-authenticates
//! when the session becomes irrecoverable, and exposes a narrow send
//! interface with priority queueing and leaky-bucket admission
//! control.
//!
//! # Architecture
//!
//! ```text
//! Shard (state machine)
//! ├── Transport        abstract duplex socket (tokio-tungstenite)
//! ├── Heart            jittered first beat, steady interval, zombie check
//! ├── LeakyBucket      admission tokens with priority waiters
//! ├── OfflineQueue     parks senders while the socket is down
//! ├── CloseBehavior    close code → {testing, graceful, re-identify, fatal, resume}
//! └── ShardEvents      named lifecycle callbacks
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use murmur_gateway::{Shard, ShardConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shard = Shard::new(0, ShardConfig {
//!         token: std::env::var("BOT_TOKEN")?,
//!         intents: 513,
//!         ..ShardConfig::default()
//!     });
//!
//!     // Connects, identifies and resolves on READY.
//!     shard.identify().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bucket;
mod commands;
pub mod compress;
pub mod config;
pub mod error;
pub mod events;
mod heart;
pub mod protocol;
pub mod queue;
mod shard;
pub mod transport;

pub use commands::{JoinVoiceOptions, RequestMembersOptions};
pub use config::{IdentifyProperties, PRIMARY_GATEWAY, ShardConfig};
pub use error::ShardError;
pub use events::{NoopEvents, ShardEvents};
pub use protocol::{CloseBehavior, CloseCode, GatewayPacket, OpCode, StatusUpdate, intents};
pub use shard::{
    IdentifyQueue, MessageTransform, PresenceFn, Shard, ShardHooks, ShardState, UnlimitedIdentify,
};
pub use transport::{Transport, TransportConnection, TransportEvent, TransportSink};
