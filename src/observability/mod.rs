//! Observability for the device connector
//!
//! Structured logging through `tracing`, with span macros for broker
//! operations and publishes.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, publish_span};
