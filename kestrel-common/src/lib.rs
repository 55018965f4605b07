#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod clock;
pub mod log;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use log::{LogName, Severity};
pub use logging::EngineFilter;

pub use tracing;
