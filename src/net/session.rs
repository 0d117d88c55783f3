//! Session management module
//!
//! Manages one session per live connection:
//! - Connection kind (game client, map server, login server link)
//! - Auth correlation fields and state machine for game clients
//! - Inbound reassembly buffer and outbound frame queue
//! - Registry owned by the event loop, scanned linearly for verdict matching

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::{CharServerError, NetworkError, Result};

/// Unique connection identifier
pub type ConnId = u64;

/// What sits on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Game client (also every fresh connection on the char port)
    Client,
    /// Map server occupying the given slot index
    MapServer(usize),
    /// Outbound link to the login server
    LoginServer,
}

/// Auth state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, no credentials presented yet
    Connecting,
    /// Credentials forwarded to login, waiting for the verdict
    AwaitingAuthVerdict,
    /// Login accepted the credentials
    Authenticated,
    /// Login refused the credentials
    Rejected,
}

impl SessionState {
    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::AwaitingAuthVerdict => "AwaitingAuthVerdict",
            SessionState::Authenticated => "Authenticated",
            SessionState::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A live connection
pub struct Session {
    /// Unique connection identifier
    pub id: ConnId,
    /// Remote address of the peer
    pub address: SocketAddr,
    kind: ConnectionKind,
    state: SessionState,
    /// Account presented by the client
    pub account_id: u32,
    /// First login-issued correlation token
    pub login_id1: u32,
    /// Second login-issued correlation token
    pub login_id2: u32,
    /// Account sex (0 female, 1 male)
    pub sex: u8,
    /// Account e-mail, set by the verdict
    pub email: String,
    /// Account expiration (unix seconds, 0 = unlimited)
    pub expiration_time: u32,
    /// Privilege level
    pub gm_level: u8,
    /// Inbound bytes not yet forming a complete frame
    inbound: BytesMut,
    /// Body bytes of a truncated frame still to be thrown away
    discard: usize,
    outbound: mpsc::Sender<Vec<u8>>,
    eof: bool,
}

impl Session {
    /// Create a new session
    pub fn new(
        id: ConnId,
        address: SocketAddr,
        kind: ConnectionKind,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            address,
            kind,
            state: SessionState::Connecting,
            account_id: 0,
            login_id1: 0,
            login_id2: 0,
            sex: 0,
            email: String::new(),
            expiration_time: 0,
            gm_level: 0,
            inbound: BytesMut::with_capacity(1024),
            discard: 0,
            outbound,
            eof: false,
        }
    }

    /// Peer IPv4 address as a host-order integer (0 for IPv6 peers)
    pub fn ipv4(&self) -> u32 {
        match self.address.ip() {
            std::net::IpAddr::V4(ip) => u32::from(ip),
            std::net::IpAddr::V6(_) => 0,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: ConnectionKind) {
        debug!(session_id = self.id, old = ?self.kind, new = ?kind, "Connection kind changed");
        self.kind = kind;
    }

    /// Get the current auth state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set the auth state
    pub fn set_state(&mut self, new_state: SessionState) {
        let old_state = self.state;
        self.state = new_state;
        debug!(
            session_id = self.id,
            old_state = %old_state,
            new_state = %new_state,
            "Session state changed"
        );
    }

    /// Check the correlation triple of a client waiting for its verdict
    pub fn awaits_verdict(&self, account_id: u32, login_id1: u32, login_id2: u32) -> bool {
        self.kind == ConnectionKind::Client
            && self.state == SessionState::AwaitingAuthVerdict
            && self.account_id == account_id
            && self.login_id1 == login_id1
            && self.login_id2 == login_id2
    }

    /// Buffer holding not-yet-framed inbound bytes
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Throw away `count` more inbound bytes as they arrive
    pub fn discard_inbound(&mut self, count: usize) {
        self.discard += count;
    }

    /// Drop buffered bytes owed to a truncated frame; true once none are owed
    pub fn skip_discarded(&mut self) -> bool {
        let count = self.discard.min(self.inbound.len());
        self.inbound.advance(count);
        self.discard -= count;
        self.discard == 0
    }

    /// Queue a frame for the peer without blocking
    pub fn try_send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => CharServerError::Network(NetworkError::WriteBufferFull),
            TrySendError::Closed(_) => CharServerError::Network(NetworkError::ConnectionClosed),
        })
    }

    /// Mark the connection for closing at the end of the current loop step
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("account_id", &self.account_id)
            .field("eof", &self.eof)
            .field("buffered", &self.inbound.len())
            .finish()
    }
}

/// Registry of live connections, owned by the event loop
#[derive(Default)]
pub struct SessionManager {
    /// Ordered by connection id so scans are deterministic
    sessions: BTreeMap<ConnId, Session>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub fn register(&mut self, session: Session) {
        info!(
            session_id = session.id,
            address = %session.address,
            kind = ?session.kind,
            "Session created"
        );
        self.sessions.insert(session.id, session);
    }

    /// Get a session by ID
    pub fn get(&self, id: ConnId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Get a mutable session by ID
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Remove a session
    pub fn remove(&mut self, id: ConnId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!(
            session_id = id,
            kind = ?session.kind,
            account_id = session.account_id,
            "Session removed"
        );
        Some(session)
    }

    /// Linear scan for the client waiting on this correlation triple
    pub fn find_by_correlation(
        &self,
        account_id: u32,
        login_id1: u32,
        login_id2: u32,
    ) -> Option<ConnId> {
        self.sessions
            .values()
            .find(|s| s.awaits_verdict(account_id, login_id1, login_id2))
            .map(|s| s.id)
    }

    /// Linear scan for a live client connection of this account
    pub fn find_client_by_account(&self, account_id: u32) -> Option<ConnId> {
        if account_id == 0 {
            return None;
        }
        self.sessions
            .values()
            .find(|s| s.kind == ConnectionKind::Client && s.account_id == account_id && !s.eof)
            .map(|s| s.id)
    }

    /// Queue a frame to a connection; false when it could not be delivered
    pub fn send(&self, id: ConnId, frame: Vec<u8>) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            debug!(session_id = id, "Send to unknown session skipped");
            return false;
        };
        if session.eof {
            return false;
        }
        match session.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = id, error = %e, "Failed to queue frame");
                false
            }
        }
    }

    /// Mark a connection for closing
    pub fn close(&mut self, id: ConnId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_eof();
        }
    }

    /// Ids of connections marked for closing
    pub fn closing(&self) -> Vec<ConnId> {
        self.sessions
            .values()
            .filter(|s| s.eof)
            .map(|s| s.id)
            .collect()
    }

    /// Get the count of live sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Iterate over all client sessions of an account
    pub fn clients_of_account_mut(
        &mut self,
        account_id: u32,
    ) -> impl Iterator<Item = &mut Session> + '_ {
        self.sessions
            .values_mut()
            .filter(move |s| s.kind == ConnectionKind::Client && s.account_id == account_id)
    }
}
