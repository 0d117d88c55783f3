//! Protocol module
//!
//! Wire formats of every link the char server speaks:
//! - Opcode catalogue and frame size classes
//! - Login-server link
//! - Map-server interface
//! - Char port (game clients and map-server login)

pub mod client;
pub mod login;
pub mod mapif;
pub mod packets;
