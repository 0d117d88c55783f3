//! Error handling module
//!
//! Defines custom error types for the char server.

use std::io;

use thiserror::Error;

/// Main error type for the char server
#[derive(Error, Debug)]
pub enum CharServerError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("No free map-server slot (max: {0})")]
    MapServerSlotsFull(usize),
}

/// Protocol-specific errors
///
/// Every variant is fatal for the connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown opcode: 0x{0:04x}")]
    UnknownOpcode(u16),

    #[error("Read out of bounds: offset {offset} + {len} exceeds frame length {available}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("Invalid frame length {length} for opcode 0x{opcode:04x}")]
    InvalidLength { opcode: u16, length: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(u32),

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Result type alias for char server operations
pub type Result<T> = std::result::Result<T, CharServerError>;

/// Refusal codes sent to a client in the `0x006c` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefuseCode {
    /// Login server rejected (or could not reach) the authentication
    Rejected = 0x42,
}

impl RefuseCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Reason codes sent to a client in the `0x0081` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KickReason {
    /// Someone has already logged in with this id
    DuplicateLogin = 2,
    /// Server still recognizes the last login
    StillRecognized = 8,
}

impl KickReason {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Result codes sent to a map server in the `0x2af9` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MapLoginResult {
    Ok = 0,
    /// Bad credentials or no free slot
    Refused = 3,
}

impl MapLoginResult {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
