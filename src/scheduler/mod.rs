//! Cyclic polling: merged-read planning and the poll engine

pub mod engine;
pub mod merge;

pub use engine::{PollEngine, PollStats, PollingConfig};
pub use merge::{build_read_plan, MergeOptions, ReadRequest, ReadSpan};
