//! Packet definitions module
//!
//! Defines frame size classes and the opcode catalogue used between the
//! login server, this char server, game clients and map servers.

/// Frame size class of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSize {
    /// Fixed size frame (total length, opcode included)
    Fixed(usize),
    /// Variable size: 2-byte total length at offset 2
    VariableShort,
    /// Variable size: 4-byte body length at offset 4, body starts at offset 8
    VariableLong,
}

impl PacketSize {
    /// Bytes that must be buffered before the total length is known
    pub fn header_len(&self) -> usize {
        match self {
            PacketSize::Fixed(size) => *size,
            PacketSize::VariableShort => 4,
            PacketSize::VariableLong => 8,
        }
    }
}

/// Frames received from the login server
pub mod from_login {
    pub const HANDSHAKE_RESULT: u16 = 0x2711;
    pub const AUTH_VERDICT: u16 = 0x2713;
    pub const ACCOUNT_UPDATE: u16 = 0x2717;
    pub const KEEPALIVE: u16 = 0x2718;
    pub const SEX_CHANGED: u16 = 0x2723;
    pub const BROADCAST: u16 = 0x2726;
    pub const ACCOUNT_REGISTRY: u16 = 0x2729;
    pub const ACCOUNT_DELETED: u16 = 0x2730;
    pub const ACCOUNT_STATUS: u16 = 0x2731;
    pub const KICK: u16 = 0x2734;
    pub const IP_REBIND: u16 = 0x2735;
}

/// Frames sent to the login server
pub mod to_login {
    pub const HANDSHAKE: u16 = 0x2710;
    pub const AUTH_REQUEST: u16 = 0x2712;
    pub const PING: u16 = 0x2719;
    pub const ACCOUNT_ONLINE: u16 = 0x272b;
    pub const ACCOUNT_OFFLINE: u16 = 0x272c;
    pub const ONLINE_LIST: u16 = 0x272d;
    pub const IP_UPDATE: u16 = 0x2736;
}

/// Frames received on the char port before a connection is promoted
pub mod from_client {
    pub const CONNECT: u16 = 0x0065;
    pub const KEEPALIVE: u16 = 0x0187;
    pub const MAP_LOGIN: u16 = 0x2af8;
}

/// Frames sent to game clients
pub mod to_client {
    pub const CHAR_LIST: u16 = 0x006b;
    pub const REFUSE: u16 = 0x006c;
    pub const KICKED: u16 = 0x0081;
}

/// Frames received from map servers
pub mod from_map {
    pub const CHAR_OFFLINE: u16 = 0x2b17;
    pub const ALL_OFFLINE: u16 = 0x2b18;
    pub const CHAR_ONLINE: u16 = 0x2b19;
    pub const PING: u16 = 0x2b23;
    pub const CASTLE_LOAD: u16 = 0x3040;
    pub const CASTLE_SAVE: u16 = 0x3041;
}

/// Frames sent to map servers
pub mod to_map {
    pub const LOGIN_RESULT: u16 = 0x2af9;
    pub const SEX_CHANGED: u16 = 0x2b0d;
    pub const ACCOUNT_DELETED: u16 = 0x2b13;
    pub const ACCOUNT_STATUS: u16 = 0x2b14;
    pub const IP_REBIND: u16 = 0x2b1e;
    pub const DISCONNECT_PLAYER: u16 = 0x2b1f;
    pub const PONG: u16 = 0x2b24;
    pub const BROADCAST: u16 = 0x3800;
    pub const ACCOUNT_REGISTRY: u16 = 0x3804;
    pub const CASTLE_LOAD_ACK: u16 = 0x3840;
    pub const CASTLE_SAVE_ACK: u16 = 0x3841;
    pub const CASTLE_ALL_DATA: u16 = 0x3842;
}

/// Width of NUL-padded name/credential fields
pub const NAME_LENGTH: usize = 24;

/// Width of the e-mail field in auth frames
pub const EMAIL_LENGTH: usize = 40;

/// Width of the server name field in the login handshake
pub const SERVER_NAME_LENGTH: usize = 20;

/// Marker written at offset 4 of blue broadcasts
pub const BLUE_BROADCAST_MARKER: u32 = 0x6575_6c62;
