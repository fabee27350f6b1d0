//! Core types for the RAET secure datagram transport.
//!
//! This crate defines the data shared by the wire codec, the road stack and
//! the binary: the error type, the protocol kind enums and the configuration
//! structs. It contains no protocol logic.

pub mod config;
pub mod error;
pub mod kinds;

pub use error::{RaetError, RaetResult};
