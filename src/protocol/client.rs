//! Char port protocol
//!
//! Frames an unpromoted connection may send: the game client connect and
//! keepalive, and the map-server login that promotes the connection into a
//! map-server slot.

use std::net::Ipv4Addr;

use tracing::{debug, error, info, warn};

use crate::error::{KickReason, MapLoginResult, ProtocolError, RefuseCode, Result};
use crate::game::auth::{self, ClientCredentials};
use crate::net::buffer::PacketWriter;
use crate::net::dispatch::RouteTable;
use crate::net::frame::Frame;
use crate::net::session::{ConnId, ConnectionKind, SessionState};
use crate::protocol::packets::{from_client, to_client, PacketSize, NAME_LENGTH};
use crate::protocol::{login, mapif};
use crate::state::{CharServer, MapServerInfo};

/// Zero bytes ahead of the character entries in the char list frame
const CHAR_LIST_PREAMBLE: usize = 20;

/// Register the char port routes
pub fn register(table: &mut RouteTable) {
    table.register(from_client::CONNECT, PacketSize::Fixed(17), handle_connect);
    table.register(from_client::KEEPALIVE, PacketSize::Fixed(6), handle_keepalive);
    table.register(from_client::MAP_LOGIN, PacketSize::Fixed(60), handle_map_login);
}

// ============ Handlers ============

fn handle_connect(server: &mut CharServer, conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let credentials = ClientCredentials {
        account_id: reader.u32_at(2)?,
        login_id1: reader.u32_at(6)?,
        login_id2: reader.u32_at(10)?,
        sex: reader.u8_at(16)?,
    };

    let login_up = server.login_connected();
    let Some(session) = server.sessions.get_mut(conn) else {
        return Ok(());
    };
    if !auth::begin(session, credentials) {
        return Ok(());
    }
    let client_ip = Ipv4Addr::from(session.ipv4());

    debug!(
        session_id = conn,
        account_id = credentials.account_id,
        "Client connect request"
    );
    server.send_to(conn, encode_account_ack(credentials.account_id));

    if !login_up {
        warn!(
            session_id = conn,
            account_id = credentials.account_id,
            "Login-server offline, refusing client"
        );
        if let Some(session) = server.sessions.get_mut(conn) {
            session.set_state(SessionState::Rejected);
        }
        server.send_to(conn, encode_refuse(RefuseCode::Rejected));
        return Ok(());
    }

    server.send_to_login(login::encode_auth_request(
        credentials.account_id,
        credentials.login_id1,
        credentials.login_id2,
        credentials.sex,
        client_ip,
    ));
    Ok(())
}

fn handle_keepalive(_server: &mut CharServer, _conn: ConnId, _frame: &Frame) -> Result<()> {
    Ok(())
}

fn handle_map_login(server: &mut CharServer, conn: ConnId, frame: &Frame) -> Result<()> {
    let mut reader = frame.reader();
    reader.seek(2)?;
    let userid = reader.read_fixed_string(NAME_LENGTH)?;
    let passwd = reader.read_fixed_string(NAME_LENGTH)?;
    let ip = reader.bytes_at(54, 4)?;
    let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
    let port = u16::from_be_bytes([reader.u8_at(58)?, reader.u8_at(59)?]);

    if userid != server.config.server_userid || passwd != server.config.server_passwd {
        warn!(session_id = conn, userid = %userid, "Map-server login refused, bad credentials");
        refuse_map_login(server, conn);
        return Ok(());
    }

    let castles = match mapif::encode_all_castles(server.castles.iter()) {
        Ok(frame) => frame,
        Err(e) => {
            error!(session_id = conn, error = %e, "Castle data does not fit one frame, refusing map-server");
            refuse_map_login(server, conn);
            return Ok(());
        }
    };

    let index = match server.maps.claim(MapServerInfo { conn, ip, port }) {
        Ok(index) => index,
        Err(e) => {
            warn!(session_id = conn, error = %e, "Map-server login refused");
            refuse_map_login(server, conn);
            return Ok(());
        }
    };

    if let Some(session) = server.sessions.get_mut(conn) {
        session.set_kind(ConnectionKind::MapServer(index));
        session.set_state(SessionState::Authenticated);
    }
    info!(
        session_id = conn,
        index,
        ip = %ip,
        port,
        "Map-server connected"
    );

    server.send_to(conn, mapif::encode_login_result(MapLoginResult::Ok.as_u8()));
    server.send_to(conn, castles);
    Ok(())
}

fn refuse_map_login(server: &mut CharServer, conn: ConnId) {
    server.send_to(conn, mapif::encode_login_result(MapLoginResult::Refused.as_u8()));
    server.sessions.close(conn);
}

// ============ Encoding ============

/// Account id echo sent right after a connect request; not a framed packet
pub fn encode_account_ack(account_id: u32) -> Vec<u8> {
    account_id.to_le_bytes().to_vec()
}

pub fn encode_refuse(code: RefuseCode) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_client::REFUSE, 3);
    writer.write_u8(code.as_u8());
    writer.finish()
}

pub fn encode_kicked(reason: KickReason) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_client::KICKED, 3);
    writer.write_u8(reason.as_u8());
    writer.finish()
}

/// Character select list (0x006b) around an opaque entry payload
pub fn encode_char_list(characters: &[u8]) -> std::result::Result<Vec<u8>, ProtocolError> {
    let mut writer =
        PacketWriter::variable_frame(to_client::CHAR_LIST, 4 + CHAR_LIST_PREAMBLE + characters.len());
    writer.write_bytes(&[0; CHAR_LIST_PREAMBLE]);
    writer.write_bytes(characters);
    writer.finish_variable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::presence::Location;
    use crate::net::buffer::PacketReader;
    use crate::protocol::packets::{to_login, to_map};
    use crate::state::test_support::*;
    use crate::storage::CastleRecord;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn connect_frame(account_id: u32, id1: u32, id2: u32, sex: u8) -> Vec<u8> {
        let mut frame = vec![0x65, 0x00];
        frame.extend_from_slice(&account_id.to_le_bytes());
        frame.extend_from_slice(&id1.to_le_bytes());
        frame.extend_from_slice(&id2.to_le_bytes());
        frame.extend_from_slice(&[0, 0, sex]);
        frame
    }

    fn map_login_frame(userid: &str, passwd: &str) -> Vec<u8> {
        let mut writer = PacketWriter::frame(from_client::MAP_LOGIN, 60);
        writer.write_fixed_string(userid, NAME_LENGTH);
        writer.write_fixed_string(passwd, NAME_LENGTH);
        writer.write_u32(0);
        writer.write_bytes(&[192, 168, 0, 10]);
        writer.write_bytes(&5121u16.to_be_bytes());
        writer.finish()
    }

    #[test]
    fn test_encoders() {
        assert_eq!(encode_account_ack(0x0102_0304), vec![4, 3, 2, 1]);
        assert_eq!(encode_refuse(RefuseCode::Rejected), vec![0x6c, 0x00, 0x42]);
        assert_eq!(encode_kicked(KickReason::StillRecognized), vec![0x81, 0x00, 8]);

        let list = encode_char_list(&[9, 9]).unwrap();
        assert_eq!(list.len(), 4 + CHAR_LIST_PREAMBLE + 2);
        let reader = PacketReader::new(&list);
        assert_eq!(reader.u16_at(0).unwrap(), to_client::CHAR_LIST);
        assert_eq!(reader.u16_at(2).unwrap() as usize, list.len());
        assert_eq!(&list[list.len() - 2..], &[9, 9]);
    }

    #[test]
    fn test_connect_forwards_to_login() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut login_rx = connect(&mut server, 9, ConnectionKind::LoginServer);
        drain(&mut login_rx);
        let mut client_rx = connect(&mut server, 1, ConnectionKind::Client);

        server.on_received(1, &connect_frame(2_000_000, 11, 22, 1));

        assert_eq!(drain(&mut client_rx), vec![2_000_000u32.to_le_bytes().to_vec()]);
        let session = server.sessions.get(1).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingAuthVerdict);
        assert!(session.awaits_verdict(2_000_000, 11, 22));

        let frames = drain(&mut login_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(opcode(&frames[0]), to_login::AUTH_REQUEST);
        assert_eq!(&frames[0][14..19], &[1, 127, 0, 0, 1]);
    }

    #[test]
    fn test_connect_refused_without_login() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut client_rx = connect(&mut server, 1, ConnectionKind::Client);

        server.on_received(1, &connect_frame(5, 1, 2, 0));

        let frames = drain(&mut client_rx);
        assert_eq!(frames, vec![vec![5, 0, 0, 0], vec![0x6c, 0x00, 0x42]]);
        assert_eq!(server.sessions.get(1).unwrap().state(), SessionState::Rejected);
    }

    #[test]
    fn test_char_auth_ok_sends_char_list() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut login_rx = connect(&mut server, 9, ConnectionKind::LoginServer);
        let mut client_rx = connect(&mut server, 1, ConnectionKind::Client);
        server.on_received(1, &connect_frame(7, 1, 2, 0));
        drain(&mut client_rx);
        drain(&mut login_rx);

        server.char_auth_ok(1);
        assert_eq!(server.presence.location(7), Some(Location::Here(1)));
        let frames = drain(&mut client_rx);
        assert_eq!(opcode(&frames[0]), to_client::CHAR_LIST);
        assert_eq!(drain(&mut login_rx), vec![vec![0x2b, 0x27, 7, 0, 0, 0]]);
    }

    #[test]
    fn test_char_auth_ok_while_on_map_refuses() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (index, mut map_rx) = connect_map(&mut server, 50);
        server.set_char_online(7, Some(70), Location::MapServer(index));
        let mut client_rx = connect(&mut server, 1, ConnectionKind::Client);
        server.on_received(1, &connect_frame(7, 1, 2, 0));
        drain(&mut client_rx);

        server.char_auth_ok(1);

        assert_eq!(drain(&mut client_rx), vec![vec![0x81, 0x00, 8]]);
        assert_eq!(opcode(&drain(&mut map_rx)[0]), to_map::DISCONNECT_PLAYER);
        assert!(server.presence.is_disconnect_armed(7));
        assert!(server.sessions.get(1).unwrap().is_eof());
    }

    #[test]
    fn test_map_login_promotes_connection() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut rx = connect(&mut server, 3, ConnectionKind::Client);

        // Login frame and a ping in the same read: the ping must route as map traffic
        let mut bytes = map_login_frame("s1", "p1");
        bytes.extend_from_slice(&[0x23, 0x2b]);
        server.on_received(3, &bytes);

        assert_eq!(
            server.sessions.get(3).unwrap().kind(),
            ConnectionKind::MapServer(0)
        );
        let info = server.maps.get(0).unwrap();
        assert_eq!(info.ip, Ipv4Addr::new(192, 168, 0, 10));
        assert_eq!(info.port, 5121);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![0xf9, 0x2a, 0]);
        assert_eq!(opcode(&frames[1]), to_map::CASTLE_ALL_DATA);
        assert_eq!(frames[1].len(), 4 + 4 * mapif::CASTLE_WIRE_LEN);
        assert_eq!(frames[2], vec![0x24, 0x2b]);
    }

    #[test]
    fn test_map_login_bad_credentials() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let mut rx = connect(&mut server, 3, ConnectionKind::Client);

        server.on_received(3, &map_login_frame("s1", "wrong"));

        assert_eq!(drain(&mut rx), vec![vec![0xf9, 0x2a, 3]]);
        assert!(server.maps.is_empty());
        server.reap_closed();
        assert!(server.sessions.get(3).is_none());
    }

    #[test]
    fn test_char_list_too_long_for_frame() {
        let entries = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            encode_char_list(&entries),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_map_login_refused_when_castles_overflow_frame() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        for id in 4..1500 {
            server.castles.create(CastleRecord::new(id)).unwrap();
        }
        let mut rx = connect(&mut server, 3, ConnectionKind::Client);

        server.on_received(3, &map_login_frame("s1", "p1"));

        assert_eq!(drain(&mut rx), vec![vec![0xf9, 0x2a, 3]]);
        assert!(server.maps.is_empty());
        assert!(server.sessions.get(3).unwrap().is_eof());
    }

    #[test]
    fn test_map_login_slots_exhausted() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        for conn in 10..14 {
            connect_map(&mut server, conn);
        }
        let mut rx = connect(&mut server, 3, ConnectionKind::Client);

        server.on_received(3, &map_login_frame("s1", "p1"));
        assert_eq!(drain(&mut rx), vec![vec![0xf9, 0x2a, 3]]);
        assert_eq!(server.maps.count(), 4);
    }
}
