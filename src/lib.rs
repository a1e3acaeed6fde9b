//! # liveboard — real-time posting core for a threaded discussion board
//!
//! Clients compose posts character-by-character; every mutation is
//! validated, persisted, and fanned out to everyone watching the same
//! thread, in one consistent order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frames   ┌──────────────┐  ops   ┌────────────┐
//! │ websocket│ ◄───────► │ Subscription │ ─────► │ PostWriter │
//! │ client   │           │ (per conn)   │        │ (open post)│
//! └──────────┘           └──────┬───────┘        └─────┬──────┘
//!                               │ subscribe            │ commit + msg
//!                               ▼                      ▼
//!                        ┌──────────────┐       ┌────────────┐
//!                        │ Feed (per    │ ◄──── │   Store    │
//!                        │ thread) +    │       │ (RocksDB + │
//!                        │ Backlog      │       │  pub/sub)  │
//!                        └──────┬───────┘       └─────┬──────┘
//!                               │ fan-out              │ thread:* tail
//!                               ▼                      ▼
//!                         all subscribers        ┌────────────┐
//!                                                │  Registry  │
//!                                                │ post → op  │
//!                                                └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire frames: two-digit kind + JSON payload
//! - [`parser`] — printability rules, links, hash commands, filters
//! - [`store`] — RocksDB engine, atomic multi-commits, pub/sub
//! - [`registry`] — process-wide post-id → thread-id mapping
//! - [`backlog`] — per-thread replayable message history
//! - [`feed`] — per-thread broadcast hub, one serializer task each
//! - [`writer`] — open-post mutation operations
//! - [`subscription`] — per-connection sessions
//! - [`throttle`] — spam scoring and thread-creation throttling
//! - [`server`] — accept loop and wiring

pub mod backlog;
pub mod config;
pub mod error;
pub mod feed;
pub mod parser;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod subscription;
pub mod throttle;
pub mod writer;

pub use config::{BoardConfig, Config};
pub use error::{ErrorKind, PostError};
pub use feed::{FeedHandle, FeedHub, Frame};
pub use protocol::{ClientMessage, Image, Link, MessageType, PostView};
pub use registry::Registry;
pub use server::{App, Server, ServerConfig};
pub use store::{Store, StoreConfig, StoreError};
pub use subscription::Client;
pub use throttle::Throttle;
pub use writer::OpenPost;
