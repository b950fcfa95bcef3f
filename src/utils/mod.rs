//! Small ambient helpers shared across the crate.

pub mod logger;

pub use logger::setup_logging;
