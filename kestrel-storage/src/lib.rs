//! Tiered, pluggable message storage for the kestrel broker.
//!
//! Every engine implements the one [`Storage`] trait, and complex engines
//! wrap simpler ones. The stock deployment nests them as
//!
//! ```text
//! Complex( front = MemoryStore,
//!          back  = Throttle( BodyStore( SqliteMetaStore ) ) )
//! ```
//!
//! New messages are acknowledged out of the volatile front tier and drain to
//! the durable back tier after a timeout; message bodies live in one file
//! each next to a SQLite index of everything else. See [`StorageConfig`] for
//! assembly.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod claim;
pub mod config;
pub mod engines;
pub mod error;
pub mod message;
pub mod storage;

pub use claim::DestinationGate;
pub use config::{DefaultStorage, FrontStoreConfig, StorageConfig};
pub use engines::{
    BigMemoryStore, BodyStore, Complex, MemoryStore, ProbeHandle, ProbeStore, SqliteMetaStore,
    Throttle,
};
pub use error::{Result, StorageError};
pub use message::{BuilderError, ClientId, Message, MessageBuilder, MessageId};
pub use storage::Storage;
