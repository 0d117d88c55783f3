//! Connection handler module
//!
//! Handles the lifecycle of every socket and the single event loop:
//! - Accepting char port connections (clients and map servers)
//! - Connecting out to the login server
//! - Per-connection tasks that forward received bytes to the loop and write
//!   queued outbound frames back to the socket
//! - The event loop owning the `CharServer`, driving ticks and shutdown
//!
//! Connection tasks never touch server state. The loop is the only owner, so
//! handlers run one at a time and to completion.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::net::session::{ConnId, ConnectionKind};
use crate::state::CharServer;

/// Outbound frames queued per connection before sends start failing
pub const OUTBOUND_QUEUE: usize = 1024;

/// Events queued into the loop
pub const EVENT_QUEUE: usize = 4096;

/// Socket read chunk
const READ_BUFFER_SIZE: usize = 8192;

/// Something happened on a socket
#[derive(Debug)]
pub enum LoopEvent {
    Opened {
        conn: ConnId,
        kind: ConnectionKind,
        address: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    Received {
        conn: ConnId,
        data: Vec<u8>,
    },
    Closed {
        conn: ConnId,
    },
    /// The outbound login connection could not be established
    LoginConnectFailed,
}

/// Process-wide connection id source
#[derive(Debug, Clone)]
pub struct ConnIdGenerator {
    next: Arc<AtomicU64>,
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnIdGenerator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> ConnId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accept char port connections until shutdown
pub async fn accept_connections(
    listener: TcpListener,
    events: mpsc::Sender<LoopEvent>,
    ids: ConnIdGenerator,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let conn = ids.next_id();
                        debug!(session_id = conn, address = %addr, "New connection");
                        tokio::spawn(run_connection(
                            stream,
                            addr,
                            conn,
                            ConnectionKind::Client,
                            events.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Connection acceptor shutting down");
                break;
            }
        }
    }
}

/// One attempt to reach the login server; the host is resolved on every call
pub async fn connect_login(address: String, events: mpsc::Sender<LoopEvent>, ids: ConnIdGenerator) {
    debug!(address = %address, "Connecting to login-server");

    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(address = %address, error = %e, "Cannot connect to login-server");
            let _ = events.send(LoopEvent::LoginConnectFailed).await;
            return;
        }
    };
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            warn!(address = %address, error = %e, "Login-server connection dropped at once");
            let _ = events.send(LoopEvent::LoginConnectFailed).await;
            return;
        }
    };

    run_connection(stream, peer, ids.next_id(), ConnectionKind::LoginServer, events).await;
}

/// Pump one socket until either side closes.
///
/// The loop closes a connection by dropping its outbound sender; frames
/// already queued are written before the socket shuts down.
pub async fn run_connection(
    stream: TcpStream,
    address: SocketAddr,
    conn: ConnId,
    kind: ConnectionKind,
    events: mpsc::Sender<LoopEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(session_id = conn, error = %e, "Cannot set TCP_NODELAY");
    }

    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let opened = LoopEvent::Opened {
        conn,
        kind,
        address,
        outbound,
    };
    if events.send(opened).await.is_err() {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let result = pump(conn, &mut reader, &mut writer, &mut outbound_rx, &events).await;

    if let Err(e) = result {
        debug!(session_id = conn, error = %e, "Connection error");
    }
    if let Err(e) = writer.shutdown().await {
        trace!(session_id = conn, error = %e, "Error during socket shutdown");
    }
    let _ = events.send(LoopEvent::Closed { conn }).await;
}

async fn pump(
    conn: ConnId,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
    events: &mpsc::Sender<LoopEvent>,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!(session_id = conn, "Connection closed by peer");
                    return Ok(());
                }
                let data = buf[..n].to_vec();
                if events.send(LoopEvent::Received { conn, data }).await.is_err() {
                    return Ok(());
                }
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => writer.write_all(&frame).await?,
                None => {
                    debug!(session_id = conn, "Connection closed by server");
                    return Ok(());
                }
            }
        }
    }
}

/// Single owner of the server state
pub struct EventLoop {
    server: CharServer,
    events: mpsc::Receiver<LoopEvent>,
    sender: mpsc::Sender<LoopEvent>,
    ids: ConnIdGenerator,
}

impl EventLoop {
    pub fn new(server: CharServer) -> Self {
        let (sender, events) = mpsc::channel(EVENT_QUEUE);
        Self {
            server,
            events,
            sender,
            ids: ConnIdGenerator::new(),
        }
    }

    /// Handle for connection tasks to feed the loop
    pub fn sender(&self) -> mpsc::Sender<LoopEvent> {
        self.sender.clone()
    }

    pub fn ids(&self) -> ConnIdGenerator {
        self.ids.clone()
    }

    pub fn server(&self) -> &CharServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut CharServer {
        &mut self.server
    }

    /// Apply one event to the server
    pub fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Opened {
                conn,
                kind,
                address,
                outbound,
            } => self.server.on_open(conn, kind, address, outbound),
            LoopEvent::Received { conn, data } => self.server.on_received(conn, &data),
            LoopEvent::Closed { conn } => self.server.on_closed(conn),
            LoopEvent::LoginConnectFailed => self.server.on_login_connect_failed(),
        }
        self.server.reap_closed();
    }

    /// Periodic work plus the login reconnect schedule
    pub fn handle_tick(&mut self, now: Instant) {
        self.server.tick(now);
        if self.server.login_connect_due(now) {
            let address = self.server.config.login_address();
            tokio::spawn(connect_login(address, self.sender.clone(), self.ids.clone()));
        }
    }

    /// Run until shutdown, then flush the castle store
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.server.config.tick_rate_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_rate_ms = self.server.config.tick_rate_ms,
            "Event loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.handle_tick(Instant::now()),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    info!("Event loop shutting down");
                    break;
                }
            }
        }

        self.server.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;
    use tempfile::TempDir;

    #[test]
    fn test_conn_ids_unique() {
        let ids = ConnIdGenerator::new();
        let other = ids.clone();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(other.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_events_drive_server() {
        let dir = TempDir::new().unwrap();
        let mut event_loop = EventLoop::new(test_server(&dir));
        let (outbound, mut rx) = mpsc::channel(8);

        event_loop.handle_event(LoopEvent::Opened {
            conn: 4,
            kind: ConnectionKind::Client,
            address: "127.0.0.1:3000".parse().unwrap(),
            outbound,
        });
        assert_eq!(event_loop.server().sessions.count(), 1);

        // Unknown opcode: the session is reaped and its sender dropped
        event_loop.handle_event(LoopEvent::Received {
            conn: 4,
            data: vec![0xff, 0xff],
        });
        assert_eq!(event_loop.server().sessions.count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_login_connect_failure_rearms() {
        let dir = TempDir::new().unwrap();
        let mut event_loop = EventLoop::new(test_server(&dir));
        let now = Instant::now();

        assert!(event_loop.server_mut().login_connect_due(now));
        event_loop.handle_event(LoopEvent::LoginConnectFailed);
        let retry = now + Duration::from_secs(event_loop.server().config.login_reconnect_secs);
        assert!(event_loop.server_mut().login_connect_due(retry));
    }

    #[tokio::test]
    async fn test_queued_frames_flushed_before_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let (stream, peer) = listener.accept().await.unwrap();
        tokio::spawn(run_connection(stream, peer, 1, ConnectionKind::Client, events_tx));

        let Some(LoopEvent::Opened { outbound, .. }) = events_rx.recv().await else {
            panic!("expected Opened");
        };
        outbound.send(vec![1, 2]).await.unwrap();
        outbound.send(vec![3]).await.unwrap();
        drop(outbound);

        assert_eq!(client.await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            events_rx.recv().await,
            Some(LoopEvent::Closed { conn: 1 })
        ));
    }
}
