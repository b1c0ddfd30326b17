//! Test utilities for warden.
//!
//! In-memory client transports and a scriptable guacd daemon, so protocol
//! and engine logic can be exercised without browsers or a real guacd.

mod mock_client;
mod mock_guacd;

pub use mock_client::{MockClientTransport, MockPeer, mock_transport_pair};
pub use mock_guacd::{MockGuacd, MockGuacdBehavior};
