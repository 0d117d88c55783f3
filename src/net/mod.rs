//! Networking module
//!
//! This module handles all network-related functionality for the char server:
//! - Little-endian frame reading and writing
//! - Frame extraction from the inbound byte stream
//! - Session management
//! - Opcode dispatch per connection kind
//! - Connection tasks and the event loop

pub mod buffer;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod session;
