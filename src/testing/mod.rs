//! Testing utilities and mock implementations
//!
//! Mocks for exercising the connector without a broker, key files or the
//! device directory service.

pub mod mocks;

pub use mocks::*;
