pub mod backoff;
pub mod time_source;

pub use time_source::{InstantTimeSrc, MockTimeSource, TimeSource};
