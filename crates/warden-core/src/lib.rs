//! warden-core: Shared protocol layer for the warden session broker.
//!
//! This crate provides:
//! - Error types and result alias
//! - Protocol and timing constants
//! - Client transport abstraction
//! - Guacamole wire codec, guacd tunnel and the file-transfer sub-protocol
//! - Logging setup

pub mod constants;
pub mod error;
pub mod guacd;
pub mod logging;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
