//! Guacamole protocol client.
//!
//! This module provides:
//! - Wire instruction framing and codec
//! - The guacd tunnel with its connect handshake
//! - Role-tagged handshake parameter sets
//! - The file-transfer sub-protocol and its transfer manager

mod instruction;
mod params;
mod transfer;
mod tunnel;

pub use instruction::{DELIMITER, Instruction, is_active, opcodes};
pub use params::{ObserverParams, PrimaryParams, TunnelParams};
pub use transfer::{FileTransfer, FileTransferManager, TransferStatus};
pub use tunnel::GuacdTunnel;
