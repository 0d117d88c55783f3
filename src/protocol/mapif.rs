//! Map-server interface
//!
//! Frames exchanged with promoted map-server connections: presence reports,
//! keepalive, castle field load/save, and every notice the char server fans
//! out to all map servers.

use tracing::{debug, info, warn};

use crate::error::{CharServerError, KickReason, ProtocolError, Result};
use crate::game::presence::Location;
use crate::net::buffer::PacketWriter;
use crate::net::dispatch::RouteTable;
use crate::net::frame::Frame;
use crate::net::session::{ConnId, ConnectionKind};
use crate::protocol::packets::{from_map, to_map, PacketSize};
use crate::state::CharServer;
use crate::storage::castle::MAX_GUARDIANS;
use crate::storage::CastleRecord;

/// Bytes per castle in the all-castles frame
pub const CASTLE_WIRE_LEN: usize = 2 + 9 * 4 + MAX_GUARDIANS;

/// Most castles one all-castles frame can carry
pub const MAX_CASTLES_PER_FRAME: usize = (u16::MAX as usize - 4) / CASTLE_WIRE_LEN;

/// Register the map-server routes
pub fn register(table: &mut RouteTable) {
    table.register(from_map::CHAR_OFFLINE, PacketSize::Fixed(10), handle_char_offline);
    table.register(from_map::ALL_OFFLINE, PacketSize::Fixed(2), handle_all_offline);
    table.register(from_map::CHAR_ONLINE, PacketSize::Fixed(10), handle_char_online);
    table.register(from_map::PING, PacketSize::Fixed(2), handle_ping);
    table.register(from_map::CASTLE_LOAD, PacketSize::Fixed(5), handle_castle_load);
    table.register(from_map::CASTLE_SAVE, PacketSize::Fixed(9), handle_castle_save);
}

/// Slot index of the map server behind `conn`
fn map_index(server: &CharServer, conn: ConnId) -> Result<usize> {
    match server.sessions.get(conn).map(|s| s.kind()) {
        Some(ConnectionKind::MapServer(index)) => Ok(index),
        _ => Err(CharServerError::Internal(format!(
            "connection {} is not a map-server",
            conn
        ))),
    }
}

// ============ Handlers ============

fn handle_char_online(server: &mut CharServer, conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let char_id = reader.u32_at(2)?;
    let account_id = reader.u32_at(6)?;
    let index = map_index(server, conn)?;

    debug!(account_id, char_id, index, "Character online on map-server");
    server.set_char_online(account_id, Some(char_id), Location::MapServer(index));
    Ok(())
}

fn handle_char_offline(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let char_id = reader.u32_at(2)?;
    let account_id = reader.u32_at(6)?;

    debug!(account_id, char_id, "Character offline on map-server");
    server.set_char_offline(account_id);
    Ok(())
}

fn handle_all_offline(server: &mut CharServer, conn: ConnId, _frame: &Frame) -> Result<()> {
    let index = map_index(server, conn)?;
    let accounts = server.presence.accounts_on_server(index);
    info!(index, count = accounts.len(), "Map-server reports all characters offline");
    for account_id in accounts {
        server.set_char_offline(account_id);
    }
    Ok(())
}

fn handle_ping(server: &mut CharServer, conn: ConnId, _frame: &Frame) -> Result<()> {
    server.send_to(conn, PacketWriter::frame(to_map::PONG, 2).finish());
    Ok(())
}

fn handle_castle_load(server: &mut CharServer, conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let castle_id = reader.u16_at(2)?;
    let index = reader.u8_at(4)?;

    let castle = match server.castles.load_by_id(u32::from(castle_id)) {
        Ok(castle) => castle,
        Err(e) => {
            warn!(castle_id, error = %e, "Castle load request for unknown castle");
            return Ok(());
        }
    };
    let Some(value) = castle.field(index) else {
        warn!(castle_id, index, "Castle load request for unknown field");
        return Ok(());
    };

    server.send_to(
        conn,
        encode_castle_field(to_map::CASTLE_LOAD_ACK, castle_id, index, value),
    );
    Ok(())
}

fn handle_castle_save(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let castle_id = reader.u16_at(2)?;
    let index = reader.u8_at(4)?;
    let value = reader.u32_at(5)? as i32;

    let mut castle = match server.castles.load_by_id(u32::from(castle_id)) {
        Ok(castle) => castle,
        Err(e) => {
            warn!(castle_id, error = %e, "Castle save request for unknown castle");
            return Ok(());
        }
    };
    if !castle.set_field(index, value) {
        warn!(castle_id, index, "Castle save request for unknown field");
        return Ok(());
    }
    server.castles.save(&castle)?;
    if index == 1 {
        info!(castle_id, guild_id = value, "Castle owner changed");
    }

    server.send_to_maps(&encode_castle_field(
        to_map::CASTLE_SAVE_ACK,
        castle_id,
        index,
        value,
    ));
    Ok(())
}

// ============ Encoding ============

/// Map-server login answer (0x2af9)
pub fn encode_login_result(result: u8) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_map::LOGIN_RESULT, 3);
    writer.write_u8(result);
    writer.finish()
}

/// Ask a map server to drop an account (0x2b1f)
pub fn encode_disconnect_player(account_id: u32, char_id: u32, reason: KickReason) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_map::DISCONNECT_PLAYER, 11);
    writer.write_u32(account_id);
    writer.write_u32(char_id);
    writer.write_u8(reason.as_u8());
    writer.finish()
}

pub fn encode_sex_changed(account_id: u32, sex: u8) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_map::SEX_CHANGED, 7);
    writer.write_u32(account_id);
    writer.write_u8(sex);
    writer.finish()
}

pub fn encode_account_deleted(account_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_map::ACCOUNT_DELETED, 6);
    writer.write_u32(account_id);
    writer.finish()
}

/// Ban or status change (0x2b14); `kind` 0 = status, 1 = ban
pub fn encode_account_status(account_id: u32, kind: u8, value: u32) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_map::ACCOUNT_STATUS, 11);
    writer.write_u32(account_id);
    writer.write_u8(kind);
    writer.write_u32(value);
    writer.finish()
}

pub fn encode_ip_rebind() -> Vec<u8> {
    PacketWriter::frame(to_map::IP_REBIND, 2).finish()
}

/// One castle field value (0x3840 load answer, 0x3841 save notice)
pub fn encode_castle_field(opcode: u16, castle_id: u16, index: u8, value: i32) -> Vec<u8> {
    let mut writer = PacketWriter::frame(opcode, 9);
    writer.write_u16(castle_id);
    writer.write_u8(index);
    writer.write_i32(value);
    writer.finish()
}

/// Every castle (0x3842), sent to a freshly logged-in map server.
///
/// Fails when the castles do not fit one frame.
pub fn encode_all_castles<I>(castles: I) -> std::result::Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = CastleRecord>,
{
    let mut writer = PacketWriter::variable_frame(to_map::CASTLE_ALL_DATA, 4);
    for castle in castles {
        let Ok(castle_id) = u16::try_from(castle.castle_id) else {
            warn!(castle_id = castle.castle_id, "Castle id has no wire form, not sent");
            continue;
        };
        writer.write_u16(castle_id);
        for value in [
            castle.guild_id,
            castle.economy,
            castle.defense,
            castle.trigger_e,
            castle.trigger_d,
            castle.next_time,
            castle.pay_time,
            castle.create_time,
            castle.visible_c,
        ] {
            writer.write_i32(value);
        }
        for visible in castle.guardians {
            writer.write_u8(visible as u8);
        }
    }
    writer.finish_variable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::PacketReader;
    use crate::state::test_support::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_disconnect_layout() {
        let frame = encode_disconnect_player(2_000_000, 150_000, KickReason::DuplicateLogin);
        assert_eq!(frame.len(), 11);
        let reader = PacketReader::new(&frame);
        assert_eq!(reader.u16_at(0).unwrap(), to_map::DISCONNECT_PLAYER);
        assert_eq!(reader.u32_at(2).unwrap(), 2_000_000);
        assert_eq!(reader.u32_at(6).unwrap(), 150_000);
        assert_eq!(reader.u8_at(10).unwrap(), 2);
    }

    #[test]
    fn test_all_castles_layout() {
        let mut castle = CastleRecord::new(1);
        castle.guild_id = 7;
        castle.guardians[7] = true;
        let frame = encode_all_castles([CastleRecord::new(0), castle]).unwrap();

        assert_eq!(frame.len(), 4 + 2 * CASTLE_WIRE_LEN);
        let reader = PacketReader::new(&frame);
        assert_eq!(reader.u16_at(2).unwrap() as usize, frame.len());
        let second = 4 + CASTLE_WIRE_LEN;
        assert_eq!(reader.u16_at(second).unwrap(), 1);
        assert_eq!(reader.u32_at(second + 2).unwrap(), 7);
        assert_eq!(reader.u8_at(second + CASTLE_WIRE_LEN - 1).unwrap(), 1);
    }

    #[test]
    fn test_all_castles_frame_bound() {
        let fits = (0..MAX_CASTLES_PER_FRAME as u32).map(CastleRecord::new);
        let frame = encode_all_castles(fits).unwrap();
        let reader = PacketReader::new(&frame);
        assert_eq!(reader.u16_at(2).unwrap() as usize, frame.len());

        let too_many = (0..1500).map(CastleRecord::new);
        assert!(matches!(
            encode_all_castles(too_many),
            Err(ProtocolError::FrameTooLarge { size: 69004, .. })
        ));
    }

    #[test]
    fn test_all_castles_skips_id_without_wire_form() {
        let frame = encode_all_castles([CastleRecord::new(70_000), CastleRecord::new(3)]).unwrap();
        assert_eq!(frame.len(), 4 + CASTLE_WIRE_LEN);
        assert_eq!(PacketReader::new(&frame).u16_at(4).unwrap(), 3);
    }

    #[test]
    fn test_ping_answered() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (_, mut map_rx) = connect_map(&mut server, 50);

        server.on_received(50, &[0x23, 0x2b]);
        assert_eq!(drain(&mut map_rx), vec![vec![0x24, 0x2b]]);
    }

    #[test]
    fn test_online_offline_reports() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (index, _map_rx) = connect_map(&mut server, 50);

        let mut online = vec![0x19, 0x2b];
        online.extend_from_slice(&150_000u32.to_le_bytes());
        online.extend_from_slice(&2_000_000u32.to_le_bytes());
        server.on_received(50, &online);

        let entry = server.presence.get(2_000_000).unwrap();
        assert_eq!(entry.location, Location::MapServer(index));
        assert_eq!(entry.char_id, Some(150_000));

        server.disconnect_player(2_000_000);
        assert!(server.presence.is_disconnect_armed(2_000_000));

        let mut offline = online.clone();
        offline[0] = 0x17;
        server.on_received(50, &offline);
        assert!(!server.presence.is_online(2_000_000));
    }

    #[test]
    fn test_all_offline_clears_only_that_server() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (first, _rx1) = connect_map(&mut server, 50);
        let (second, _rx2) = connect_map(&mut server, 51);
        server.set_char_online(1, Some(10), Location::MapServer(first));
        server.set_char_online(2, Some(20), Location::MapServer(second));

        server.on_received(50, &[0x18, 0x2b]);
        assert!(!server.presence.is_online(1));
        assert!(server.presence.is_online(2));
    }

    #[test]
    fn test_castle_save_persists_and_fans_out() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (_, mut rx1) = connect_map(&mut server, 50);
        let (_, mut rx2) = connect_map(&mut server, 51);

        let mut save = vec![0x41, 0x30, 2, 0, 1];
        save.extend_from_slice(&42i32.to_le_bytes());
        server.on_received(50, &save);

        assert_eq!(server.castles.load_by_id(2).unwrap().guild_id, 42);
        let expected = encode_castle_field(to_map::CASTLE_SAVE_ACK, 2, 1, 42);
        assert_eq!(drain(&mut rx1), vec![expected.clone()]);
        assert_eq!(drain(&mut rx2), vec![expected]);

        server.on_received(51, &[0x40, 0x30, 2, 0, 1]);
        assert_eq!(
            drain(&mut rx2),
            vec![encode_castle_field(to_map::CASTLE_LOAD_ACK, 2, 1, 42)]
        );
        assert!(drain(&mut rx1).is_empty());
    }

    #[test]
    fn test_castle_unknown_id_ignored() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        let (_, mut rx) = connect_map(&mut server, 50);

        server.on_received(50, &[0x40, 0x30, 99, 0, 1]);
        assert!(drain(&mut rx).is_empty());
        assert!(server.sessions.get(50).is_some_and(|s| !s.is_eof()));
    }
}
