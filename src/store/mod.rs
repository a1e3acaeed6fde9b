//! Durable storage: engine primitives, pub/sub, and the domain
//! queries built on them.

pub mod engine;
pub mod pubsub;
pub mod queries;

pub use engine::{Multi, Store, StoreConfig, StoreError};
pub use pubsub::{PubSub, Published};
