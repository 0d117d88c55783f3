//! Charserver Library
//!
//! The character-server tier of a three-tier game cluster. It sits between
//! the login server and the map servers: it relays client authentication to
//! login, tracks which accounts are online and where, fans account notices
//! and operator broadcasts out to every map server, and keeps the guild
//! castle registry on disk.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Auth correlation, online presence, broadcast relay, content hooks
//! - `net` - Framing, dispatch, sessions and the event loop
//! - `protocol` - Wire formats of the login, map-server and client links
//! - `state` - The char server context
//! - `storage` - Entity stores and the text castle backend

pub mod config;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{CharServerError, Result};
pub use state::CharServer;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
