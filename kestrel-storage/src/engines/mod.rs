//! The storage engines and the decorators over them.

pub mod big_memory;
pub mod body;
pub mod complex;
pub mod memory;
pub mod probe;
pub mod sqlite;
pub mod throttle;

pub use big_memory::BigMemoryStore;
pub use body::BodyStore;
pub use complex::Complex;
pub use memory::MemoryStore;
pub use probe::{ProbeHandle, ProbeStore};
pub use sqlite::SqliteMetaStore;
pub use throttle::Throttle;
