//! Char server state module
//!
//! `CharServer` owns every registry of the process: sessions, the online
//! presence directory, map-server slots, the castle store and the login
//! link. The event loop holds the only instance and feeds it connection
//! events and ticks one at a time, so nothing here is shared or locked.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::{KickReason, NetworkError, Result};
use crate::game::broadcast::{self, BroadcastColor};
use crate::game::hooks::GameContent;
use crate::game::presence::{Location, PresenceDirectory};
use crate::net::dispatch::{self, Dispatcher};
use crate::net::session::{ConnId, ConnectionKind, Session, SessionManager};
use crate::protocol::{client, login, mapif};
use crate::storage::CastleStore;

/// A connected map server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapServerInfo {
    pub conn: ConnId,
    /// Address the map server announced for clients
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Fixed set of map-server slots; the slot index is the server's identity
#[derive(Debug)]
pub struct MapServerTable {
    slots: Vec<Option<MapServerInfo>>,
}

impl MapServerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Take the lowest free slot
    pub fn claim(&mut self, info: MapServerInfo) -> std::result::Result<usize, NetworkError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(NetworkError::MapServerSlotsFull(self.slots.len()))?;
        self.slots[index] = Some(info);
        Ok(index)
    }

    pub fn release(&mut self, index: usize) -> Option<MapServerInfo> {
        self.slots.get_mut(index)?.take()
    }

    pub fn get(&self, index: usize) -> Option<&MapServerInfo> {
        self.slots.get(index)?.as_ref()
    }

    /// Connected servers in slot order
    pub fn connections(&self) -> impl Iterator<Item = (usize, ConnId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|info| (index, info.conn)))
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

}

/// Outbound link to the login server
#[derive(Debug, Default)]
pub struct LoginLink {
    conn: Option<ConnId>,
    authenticated: bool,
    connecting: bool,
    last_attempt: Option<Instant>,
    last_ping: Option<Instant>,
}

impl LoginLink {
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn attach(&mut self, conn: ConnId) {
        self.conn = Some(conn);
        self.authenticated = false;
        self.connecting = false;
    }

    fn detach(&mut self) {
        self.conn = None;
        self.authenticated = false;
        self.last_ping = None;
    }

    /// True when a new connection attempt should start now
    fn connect_due(&mut self, now: Instant, interval: Duration) -> bool {
        if self.conn.is_some() || self.connecting {
            return false;
        }
        let due = self
            .last_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        if due {
            self.connecting = true;
            self.last_attempt = Some(now);
        }
        due
    }

    fn ping_due(&mut self, now: Instant, interval: Duration) -> bool {
        if !self.authenticated {
            return false;
        }
        match self.last_ping {
            Some(at) if now.saturating_duration_since(at) < interval => false,
            _ => {
                self.last_ping = Some(now);
                true
            }
        }
    }
}

/// Resolve a host name or dotted address to an IPv4 address
pub fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
}

/// The char server context
pub struct CharServer {
    /// Server configuration
    pub config: ServerConfig,
    /// Live connections
    pub sessions: SessionManager,
    /// Online accounts across the cluster
    pub presence: PresenceDirectory,
    /// Connected map servers
    pub maps: MapServerTable,
    /// Guild castle registry
    pub castles: CastleStore,
    /// Game-content hooks
    pub content: Box<dyn GameContent>,
    pub(crate) dispatcher: Dispatcher,
    login: LoginLink,
    char_ip: Ipv4Addr,
    last_autosave: Instant,
}

impl CharServer {
    /// Create the context around an already loaded castle store
    pub fn new(config: ServerConfig, castles: CastleStore, content: Box<dyn GameContent>) -> Self {
        let char_ip = resolve_ipv4(&config.char_ip).unwrap_or_else(|| {
            warn!(host = %config.char_ip, "Cannot resolve public char ip, reporting 0.0.0.0");
            Ipv4Addr::UNSPECIFIED
        });

        Self {
            maps: MapServerTable::new(config.max_map_servers),
            config,
            sessions: SessionManager::new(),
            presence: PresenceDirectory::new(),
            castles,
            content,
            dispatcher: Dispatcher::new(),
            login: LoginLink::default(),
            char_ip,
            last_autosave: Instant::now(),
        }
    }

    /// Public address reported to the login server
    pub fn char_ip(&self) -> Ipv4Addr {
        self.char_ip
    }

    pub fn login_link(&self) -> &LoginLink {
        &self.login
    }

    // ============ Connection lifecycle ============

    /// A connection was accepted or the login link connected
    pub fn on_open(
        &mut self,
        conn: ConnId,
        kind: ConnectionKind,
        address: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
    ) {
        self.sessions
            .register(Session::new(conn, address, kind, outbound));

        if kind == ConnectionKind::LoginServer {
            self.login.attach(conn);
            info!(session_id = conn, address = %address, "Connected to login-server, sending handshake");
            self.sessions
                .send(conn, login::encode_handshake(&self.config, self.char_ip));
        }
    }

    /// Bytes arrived on a connection
    pub fn on_received(&mut self, conn: ConnId, data: &[u8]) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        session.inbound_mut().extend_from_slice(data);
        dispatch::drain_frames(self, conn);
    }

    /// The peer closed the connection
    pub fn on_closed(&mut self, conn: ConnId) {
        self.sessions.close(conn);
        self.reap_closed();
    }

    /// An outbound login connection attempt failed
    pub fn on_login_connect_failed(&mut self) {
        self.login.connecting = false;
    }

    /// Release every connection marked for closing
    pub fn reap_closed(&mut self) {
        for conn in self.sessions.closing() {
            self.release(conn);
        }
    }

    fn release(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(conn) else {
            return;
        };

        match session.kind() {
            ConnectionKind::Client => {
                let account_id = session.account_id;
                if account_id != 0 && self.presence.location(account_id) == Some(Location::Here(conn))
                {
                    self.set_char_offline(account_id);
                }
            }
            ConnectionKind::MapServer(index) => {
                self.maps.release(index);
                let lost = self.presence.mark_server_lost(index);
                warn!(
                    session_id = conn,
                    index,
                    accounts = lost,
                    "Map-server disconnected"
                );
            }
            ConnectionKind::LoginServer => {
                warn!(session_id = conn, "Connection to login-server lost");
                self.login.detach();
            }
        }
    }

    // ============ Outbound ============

    pub fn send_to(&self, conn: ConnId, frame: Vec<u8>) -> bool {
        self.sessions.send(conn, frame)
    }

    /// Login link connected (handshake possibly still pending)
    pub fn login_connected(&self) -> bool {
        self.login.conn.is_some()
    }

    /// Login link connected and handshake accepted
    pub fn login_ready(&self) -> bool {
        self.login.conn.is_some() && self.login.authenticated
    }

    /// Queue a frame to login; dropped when the link is down
    pub fn send_to_login(&self, frame: Vec<u8>) -> bool {
        match self.login.conn {
            Some(conn) => self.sessions.send(conn, frame),
            None => {
                trace!("Login-server offline, notification skipped");
                false
            }
        }
    }

    pub fn send_to_map(&self, index: usize, frame: Vec<u8>) -> bool {
        match self.maps.get(index) {
            Some(info) => self.sessions.send(info.conn, frame),
            None => false,
        }
    }

    /// Queue a frame to every map server in slot order; returns the count reached
    pub fn send_to_maps(&self, frame: &[u8]) -> usize {
        self.maps
            .connections()
            .filter(|&(_, conn)| self.sessions.send(conn, frame.to_vec()))
            .count()
    }

    // ============ Login link ============

    /// Handshake answer from the login server
    pub fn on_login_handshake(&mut self, accepted: bool) {
        let Some(conn) = self.login.conn else {
            return;
        };

        if !accepted {
            error!("Can not connect to login-server, inter-server user id or password is probably invalid");
            self.sessions.close(conn);
            return;
        }

        self.login.authenticated = true;
        self.login.last_ping = Some(Instant::now());
        info!(session_id = conn, "Login-server accepted the char server");

        self.send_online_list();
        if self.maps.is_empty() {
            info!("Awaiting maps from map-server");
        }
    }

    /// Push every online account to login
    pub fn send_online_list(&self) {
        let accounts = self.presence.online_accounts();
        debug!(count = accounts.len(), "Sending online accounts to login-server");
        match login::encode_online_list(&accounts) {
            Ok(frame) => {
                self.send_to_login(frame);
            }
            Err(e) => error!(error = %e, "Cannot encode online list"),
        }
    }

    /// True when the event loop should start a login connection attempt
    pub fn login_connect_due(&mut self, now: Instant) -> bool {
        let interval = Duration::from_secs(self.config.login_reconnect_secs);
        self.login.connect_due(now, interval)
    }

    /// Re-resolve the public char ip; returns it when it changed
    pub fn refresh_char_ip(&mut self) -> Option<Ipv4Addr> {
        let resolved = resolve_ipv4(&self.config.char_ip)?;
        if resolved == self.char_ip || resolved.is_unspecified() {
            return None;
        }
        info!(host = %self.config.char_ip, ip = %resolved, "Updating char server ip");
        self.char_ip = resolved;
        Some(resolved)
    }

    // ============ Presence ============

    /// Mark an account online and tell login
    pub fn set_char_online(&mut self, account_id: u32, char_id: Option<u32>, location: Location) {
        self.presence.set_online(account_id, char_id, location);
        self.send_to_login(login::encode_account_online(account_id));
    }

    /// Mark an account offline and tell login
    pub fn set_char_offline(&mut self, account_id: u32) {
        self.presence.set_offline(account_id);
        self.send_to_login(login::encode_account_offline(account_id));
    }

    /// Force an account out of the game wherever it is
    pub fn disconnect_player(&mut self, account_id: u32) {
        let Some(entry) = self.presence.get(account_id) else {
            trace!(account_id, "Disconnect for offline account ignored");
            return;
        };
        let (location, char_id) = (entry.location, entry.char_id);

        match location {
            Location::MapServer(index) => {
                let frame = mapif::encode_disconnect_player(
                    account_id,
                    char_id.unwrap_or(0),
                    KickReason::DuplicateLogin,
                );
                if !self.send_to_map(index, frame) {
                    debug!(account_id, index, "Map-server gone, disconnect request skipped");
                }
                let deadline = Instant::now() + self.config.kick_timeout();
                if self.presence.arm_disconnect(account_id, deadline) {
                    info!(account_id, index, "Waiting for map-server to drop account");
                }
            }
            Location::Here(conn) => self.kick_client(conn, KickReason::DuplicateLogin),
            Location::Unknown => match self.sessions.find_client_by_account(account_id) {
                Some(conn) => self.kick_client(conn, KickReason::DuplicateLogin),
                None => self.set_char_offline(account_id),
            },
        }
    }

    fn kick_client(&mut self, conn: ConnId, reason: KickReason) {
        self.send_to(conn, client::encode_kicked(reason));
        self.sessions.close(conn);
    }

    /// A client's credentials were accepted by login
    pub fn char_auth_ok(&mut self, conn: ConnId) {
        let Some(account_id) = self.sessions.get(conn).map(|s| s.account_id) else {
            return;
        };

        match self.presence.location(account_id) {
            Some(Location::MapServer(index)) => {
                info!(account_id, index, "Account still online on a map-server, kicking it");
                self.disconnect_player(account_id);
                self.kick_client(conn, KickReason::StillRecognized);
                return;
            }
            Some(Location::Here(other)) if other != conn => {
                let other_live = self.sessions.get(other).is_some_and(|s| !s.is_eof());
                if other_live {
                    info!(account_id, session_id = conn, "Account already selecting characters");
                    self.kick_client(conn, KickReason::StillRecognized);
                    return;
                }
            }
            _ => {}
        }

        let characters = self.content.character_list(account_id);
        let list = match client::encode_char_list(&characters) {
            Ok(list) => list,
            Err(e) => {
                error!(account_id, session_id = conn, error = %e, "Cannot encode character list");
                self.kick_client(conn, KickReason::StillRecognized);
                return;
            }
        };

        self.set_char_online(account_id, None, Location::Here(conn));
        self.send_to(conn, list);
    }

    // ============ Broadcast ============

    /// Segment an operator message and send it to every map server.
    /// Returns the number of frames produced.
    pub fn relay_broadcast(&mut self, color: BroadcastColor, raw: &[u8]) -> usize {
        let frames = match broadcast::build_frames(raw, color) {
            Ok(frames) => frames,
            Err(e) => {
                error!(error = %e, "Cannot encode broadcast");
                return 0;
            }
        };
        if frames.is_empty() {
            info!("Receiving a message for broadcast, but nothing to broadcast");
            return 0;
        }
        if self.maps.is_empty() {
            info!("Receiving a message for broadcast, but no map-server is online");
            return 0;
        }

        info!(
            color = color.name(),
            message = %String::from_utf8_lossy(&broadcast::sanitize(raw)),
            "Relaying broadcast"
        );
        for frame in &frames {
            self.send_to_maps(frame);
        }
        frames.len()
    }

    // ============ Timers ============

    /// Periodic work: expired kicks, login keepalive, autosave
    pub fn tick(&mut self, now: Instant) {
        for account_id in self.presence.expired(now) {
            info!(account_id, "Map-server did not confirm disconnect in time, forcing offline");
            self.set_char_offline(account_id);
        }

        let ping_interval = Duration::from_secs(self.config.login_ping_secs);
        if self.login.ping_due(now, ping_interval) {
            self.send_to_login(login::encode_ping());
        }

        if self.config.autosave_interval_secs > 0
            && now.saturating_duration_since(self.last_autosave)
                >= Duration::from_secs(self.config.autosave_interval_secs)
        {
            self.last_autosave = now;
            if let Err(e) = self.castles.sync() {
                debug!(error = %e, "Autosave skipped");
            }
        }

        self.reap_closed();
    }

    /// Final store flush
    pub fn shutdown(&mut self) -> Result<()> {
        info!(
            sessions = self.sessions.count(),
            online = self.presence.len(),
            "Char server shutting down"
        );
        self.castles.destroy()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::game::hooks::NoopContent;
    use crate::storage::{CastleRecord, EntityStore, TextStore};
    use tempfile::TempDir;

    /// Server with a 4-castle store in a temp dir
    pub fn test_server(dir: &TempDir) -> CharServer {
        let mut store = TextStore::<CastleRecord>::new(dir.path().join("castle.txt"), 4);
        store.init().unwrap();
        let config = ServerConfig {
            max_map_servers: 4,
            ..ServerConfig::default()
        };
        CharServer::new(config, Box::new(store), Box::new(NoopContent))
    }

    pub fn connect(server: &mut CharServer, conn: ConnId, kind: ConnectionKind) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        server.on_open(conn, kind, addr, tx);
        rx
    }

    /// Connect a map server directly into a slot
    pub fn connect_map(server: &mut CharServer, conn: ConnId) -> (usize, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:5121".parse().unwrap();
        let index = server
            .maps
            .claim(MapServerInfo {
                conn,
                ip: Ipv4Addr::LOCALHOST,
                port: 5121,
            })
            .unwrap();
        server
            .sessions
            .register(Session::new(conn, addr, ConnectionKind::MapServer(index), tx));
        (index, rx)
    }

    pub fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn opcode(frame: &[u8]) -> u16 {
        u16::from_le_bytes([frame[0], frame[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::protocol::packets::{to_client, to_login, to_map};
    use tempfile::TempDir;

    #[test]
    fn test_map_table_lowest_free_slot() {
        let mut table = MapServerTable::new(3);
        let info = |conn| MapServerInfo {
            conn,
            ip: Ipv4Addr::LOCALHOST,
            port: 5121,
        };
        assert_eq!(table.claim(info(1)).unwrap(), 0);
        assert_eq!(table.claim(info(2)).unwrap(), 1);
        assert_eq!(table.release(0).map(|i| i.conn), Some(1));
        assert_eq!(table.claim(info(3)).unwrap(), 0);
        assert_eq!(table.claim(info(4)).unwrap(), 2);
        assert!(matches!(
            table.claim(info(5)),
            Err(NetworkError::MapServerSlotsFull(3))
        ));
        assert_eq!(
            table.connections().collect::<Vec<_>>(),
            vec![(0, 3), (1, 2), (2, 4)]
        );
    }

    #[test]
    fn test_login_connect_schedule() {
        let mut link = LoginLink::default();
        let now = Instant::now();
        let interval = Duration::from_secs(10);

        assert!(link.connect_due(now, interval));
        assert!(!link.connect_due(now, interval), "attempt in flight");

        link.connecting = false;
        assert!(!link.connect_due(now + Duration::from_secs(5), interval));
        assert!(link.connect_due(now + Duration::from_secs(10), interval));

        link.attach(7);
        assert!(!link.connect_due(now + Duration::from_secs(60), interval));
    }

    #[test]
    fn test_resolve_ipv4() {
        assert_eq!(resolve_ipv4("10.0.0.5"), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(resolve_ipv4("localhost"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_kick_on_map_arms_once() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (index, mut map_rx) = connect_map(&mut server, 50);
        server.set_char_online(2_000_000, Some(150_000), Location::MapServer(index));

        server.disconnect_player(2_000_000);
        server.disconnect_player(2_000_000);

        let frames = drain(&mut map_rx);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| opcode(f) == to_map::DISCONNECT_PLAYER));
        assert!(server.presence.is_disconnect_armed(2_000_000));

        let deadline = server
            .presence
            .get(2_000_000)
            .and_then(|e| e.disconnect_deadline())
            .unwrap();
        server.tick(deadline);
        assert!(!server.presence.is_online(2_000_000));
    }

    #[test]
    fn test_kick_on_this_server_closes_connection() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut client_rx = connect(&mut server, 1, ConnectionKind::Client);
        server.sessions.get_mut(1).unwrap().account_id = 77;
        server.set_char_online(77, None, Location::Here(1));

        server.disconnect_player(77);
        let frames = drain(&mut client_rx);
        assert_eq!(frames, vec![vec![0x81, 0x00, 2]]);
        assert_eq!(opcode(&frames[0]), to_client::KICKED);

        server.reap_closed();
        assert!(server.sessions.get(1).is_none());
        assert!(!server.presence.is_online(77));
    }

    #[test]
    fn test_kick_absent_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut login_rx = connect(&mut server, 9, ConnectionKind::LoginServer);
        drain(&mut login_rx);

        server.disconnect_player(5);
        assert!(drain(&mut login_rx).is_empty());
    }

    #[test]
    fn test_map_loss_marks_unknown() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (index, _map_rx) = connect_map(&mut server, 50);
        server.set_char_online(1, Some(10), Location::MapServer(index));

        server.on_closed(50);
        assert_eq!(server.presence.location(1), Some(Location::Unknown));
        assert!(server.maps.is_empty());

        // Unknown with no local session: cleared right away
        server.disconnect_player(1);
        assert!(!server.presence.is_online(1));
    }

    #[test]
    fn test_login_handshake_sends_online_list() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        server.presence.set_online(3, None, Location::Unknown);
        let mut login_rx = connect(&mut server, 9, ConnectionKind::LoginServer);

        let handshake = drain(&mut login_rx);
        assert_eq!(handshake.len(), 1);
        assert_eq!(opcode(&handshake[0]), to_login::HANDSHAKE);
        assert!(!server.login_ready());

        server.on_login_handshake(true);
        assert!(server.login_ready());
        let frames = drain(&mut login_rx);
        assert_eq!(opcode(&frames[0]), to_login::ONLINE_LIST);

        server.on_closed(9);
        assert!(!server.login_connected());
    }

    #[test]
    fn test_tick_pings_login() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut login_rx = connect(&mut server, 9, ConnectionKind::LoginServer);
        server.on_login_handshake(true);
        drain(&mut login_rx);

        let later = Instant::now() + Duration::from_secs(server.config.login_ping_secs);
        server.tick(later);
        let frames = drain(&mut login_rx);
        assert_eq!(frames, vec![vec![0x19, 0x27]]);

        server.tick(later);
        assert!(drain(&mut login_rx).is_empty());
    }

    #[test]
    fn test_failed_autosave_keeps_ticking() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (index, _map_rx) = connect_map(&mut server, 50);
        server.set_char_online(8, Some(80), Location::MapServer(index));
        server.disconnect_player(8);
        let deadline = server.presence.get(8).and_then(|e| e.disconnect_deadline()).unwrap();

        // The snapshot path turns into a directory, so every sync fails
        let path = dir.path().join("castle.txt");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let later = deadline.max(Instant::now() + Duration::from_secs(server.config.autosave_interval_secs));
        server.tick(later);
        assert!(!server.presence.is_online(8));
        assert_eq!(server.castles.len(), 4);
    }

    #[test]
    fn test_broadcast_without_maps() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        assert_eq!(server.relay_broadcast(BroadcastColor::Yellow, b"hello"), 0);

        let (_, mut map_rx) = connect_map(&mut server, 50);
        assert_eq!(server.relay_broadcast(BroadcastColor::Yellow, b"   "), 0);
        assert_eq!(server.relay_broadcast(BroadcastColor::Blue, b"hello"), 1);
        assert_eq!(drain(&mut map_rx).len(), 1);
    }
}
