//! Observability utilities shared by the tally binaries.

pub mod logging;

pub use logging::error_source;
