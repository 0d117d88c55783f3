//! Opcode dispatch
//!
//! Each connection kind has its own route table mapping an opcode to its
//! frame size class and handler. The drain loop pulls complete frames off a
//! session's inbound buffer and runs their handlers to completion, one by
//! one, until the buffer holds no complete frame.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::error::{CharServerError, Result};
use crate::net::frame::{take_frame, Frame};
use crate::net::session::{ConnId, ConnectionKind};
use crate::protocol::packets::PacketSize;
use crate::protocol::{client, login, mapif};
use crate::state::CharServer;

/// Frame handler; runs synchronously against the server context
pub type Handler = fn(&mut CharServer, ConnId, &Frame) -> Result<()>;

/// Size class and handler of one opcode
#[derive(Clone, Copy)]
pub struct Route {
    pub size: PacketSize,
    pub handler: Handler,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("size", &self.size).finish()
    }
}

/// Opcode to route
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<u16, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; a later registration for the same opcode wins
    pub fn register(&mut self, opcode: u16, size: PacketSize, handler: Handler) {
        if self.routes.insert(opcode, Route { size, handler }).is_some() {
            warn!(opcode = %format!("0x{:04x}", opcode), "Route registered twice");
        }
    }

    pub fn get(&self, opcode: u16) -> Option<Route> {
        self.routes.get(&opcode).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route tables per connection kind
#[derive(Debug)]
pub struct Dispatcher {
    client: RouteTable,
    map: RouteTable,
    login: RouteTable,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Build the tables for every frame the char server understands
    pub fn new() -> Self {
        let mut dispatcher = Self {
            client: RouteTable::new(),
            map: RouteTable::new(),
            login: RouteTable::new(),
        };
        client::register(&mut dispatcher.client);
        mapif::register(&mut dispatcher.map);
        login::register(&mut dispatcher.login);
        dispatcher
    }

    fn table(&self, kind: ConnectionKind) -> &RouteTable {
        match kind {
            ConnectionKind::Client => &self.client,
            ConnectionKind::MapServer(_) => &self.map,
            ConnectionKind::LoginServer => &self.login,
        }
    }

    pub fn route(&self, kind: ConnectionKind, opcode: u16) -> Option<Route> {
        self.table(kind).get(opcode)
    }

    pub fn size_of(&self, kind: ConnectionKind, opcode: u16) -> Option<PacketSize> {
        self.route(kind, opcode).map(|r| r.size)
    }
}

/// Run every complete frame buffered for `conn` through its handler.
///
/// A framing error or a handler protocol error closes the connection.
pub fn drain_frames(server: &mut CharServer, conn: ConnId) {
    let max_frame = server.config.max_frame_size;

    loop {
        let Some(session) = server.sessions.get_mut(conn) else {
            return;
        };
        if session.is_eof() || !session.skip_discarded() {
            return;
        }

        // Re-read per frame: a map login promotes the connection mid-buffer
        let kind = session.kind();
        let dispatcher = &server.dispatcher;
        let frame = match take_frame(
            session.inbound_mut(),
            |opcode| dispatcher.size_of(kind, opcode),
            max_frame,
        ) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id = conn, kind = ?kind, error = %e, "Protocol violation, disconnecting");
                session.set_eof();
                return;
            }
        };
        if frame.discarded() > 0 {
            debug!(
                session_id = conn,
                opcode = %format!("0x{:04x}", frame.opcode),
                discarded = frame.discarded(),
                "Oversize frame truncated"
            );
            session.discard_inbound(frame.discarded());
        }

        let Some(route) = dispatcher.route(kind, frame.opcode) else {
            // take_frame only yields routed opcodes
            session.set_eof();
            return;
        };

        trace!(
            session_id = conn,
            opcode = %format!("0x{:04x}", frame.opcode),
            length = frame.len(),
            "Dispatching frame"
        );

        match (route.handler)(server, conn, &frame) {
            Ok(()) => {}
            Err(CharServerError::Protocol(e)) => {
                warn!(
                    session_id = conn,
                    opcode = %format!("0x{:04x}", frame.opcode),
                    error = %e,
                    "Malformed frame, disconnecting"
                );
                server.sessions.close(conn);
                return;
            }
            Err(e) => {
                debug!(
                    session_id = conn,
                    opcode = %format!("0x{:04x}", frame.opcode),
                    error = %e,
                    "Frame handler failed"
                );
            }
        }
    }
}
