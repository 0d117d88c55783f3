//! Login-server link protocol
//!
//! Frames exchanged with the login server: the server handshake, auth
//! verdicts for waiting clients, account notifications that fan out to the
//! map servers, and presence reports going the other way.

use std::net::Ipv4Addr;

use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::{ProtocolError, RefuseCode, Result};
use crate::game::auth::{self, AccountUpdate, AuthVerdict, VerdictOutcome};
use crate::game::broadcast::BroadcastColor;
use crate::net::buffer::{PacketReader, PacketWriter};
use crate::net::dispatch::RouteTable;
use crate::net::frame::Frame;
use crate::net::session::ConnId;
use crate::protocol::client;
use crate::protocol::mapif;
use crate::protocol::packets::{
    from_login, to_login, to_map, PacketSize, EMAIL_LENGTH, NAME_LENGTH, SERVER_NAME_LENGTH,
};
use crate::state::CharServer;

/// Register the login link routes
pub fn register(table: &mut RouteTable) {
    table.register(from_login::HANDSHAKE_RESULT, PacketSize::Fixed(3), handle_handshake_result);
    table.register(from_login::AUTH_VERDICT, PacketSize::Fixed(60), handle_auth_verdict);
    table.register(from_login::ACCOUNT_UPDATE, PacketSize::Fixed(51), handle_account_update);
    table.register(from_login::KEEPALIVE, PacketSize::Fixed(2), handle_keepalive);
    table.register(from_login::SEX_CHANGED, PacketSize::Fixed(7), handle_sex_changed);
    table.register(from_login::BROADCAST, PacketSize::VariableLong, handle_broadcast);
    table.register(from_login::ACCOUNT_REGISTRY, PacketSize::VariableShort, handle_account_registry);
    table.register(from_login::ACCOUNT_DELETED, PacketSize::Fixed(6), handle_account_deleted);
    table.register(from_login::ACCOUNT_STATUS, PacketSize::Fixed(11), handle_account_status);
    table.register(from_login::KICK, PacketSize::Fixed(6), handle_kick);
    table.register(from_login::IP_REBIND, PacketSize::Fixed(2), handle_ip_rebind);
}

// ============ Decoding ============

fn read_fixed_string_at(reader: &mut PacketReader<'_>, offset: usize, width: usize) -> Result<String> {
    reader.seek(offset)?;
    Ok(reader.read_fixed_string(width)?)
}

/// Decode an auth verdict (0x2713)
pub fn parse_auth_verdict(frame: &Frame) -> Result<AuthVerdict> {
    let mut reader = frame.reader();
    Ok(AuthVerdict {
        account_id: reader.u32_at(2)?,
        login_id1: reader.u32_at(6)?,
        login_id2: reader.u32_at(10)?,
        accepted: reader.u8_at(14)? == 0,
        email: read_fixed_string_at(&mut reader, 15, EMAIL_LENGTH)?,
        expiration_time: reader.u32_at(55)?,
        gm_level: reader.u8_at(59)?,
    })
}

/// Decode an account data refresh (0x2717)
pub fn parse_account_update(frame: &Frame) -> Result<AccountUpdate> {
    let mut reader = frame.reader();
    Ok(AccountUpdate {
        account_id: reader.u32_at(2)?,
        email: read_fixed_string_at(&mut reader, 6, EMAIL_LENGTH)?,
        expiration_time: reader.u32_at(46)?,
        gm_level: reader.u8_at(50)?,
    })
}

// ============ Handlers ============

fn handle_handshake_result(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let result = frame.reader().u8_at(2)?;
    server.on_login_handshake(result == 0);
    Ok(())
}

fn handle_auth_verdict(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let verdict = parse_auth_verdict(frame)?;
    match auth::apply_verdict(&mut server.sessions, &verdict) {
        VerdictOutcome::Accepted(waiting) => server.char_auth_ok(waiting),
        VerdictOutcome::Rejected(waiting) => {
            server.send_to(waiting, client::encode_refuse(RefuseCode::Rejected));
        }
        VerdictOutcome::Unmatched => {}
    }
    Ok(())
}

fn handle_account_update(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let update = parse_account_update(frame)?;
    auth::apply_update(&mut server.sessions, &update);
    Ok(())
}

fn handle_keepalive(_server: &mut CharServer, conn: ConnId, _frame: &Frame) -> Result<()> {
    trace!(session_id = conn, "Login-server keepalive");
    Ok(())
}

fn handle_sex_changed(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let account_id = reader.u32_at(2)?;
    let sex = reader.u8_at(6)?;

    if account_id > 0 {
        info!(account_id, sex, "Account sex changed");
        for session in server.sessions.clients_of_account_mut(account_id) {
            session.sex = sex;
        }
        if let Err(e) = server.content.sex_changed(account_id, sex) {
            warn!(account_id, error = %e, "Sex change hook failed");
        }
        server.disconnect_player(account_id);
    }

    server.send_to_maps(&mapif::encode_sex_changed(account_id, sex));
    Ok(())
}

fn handle_broadcast(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let color = BroadcastColor::from_flag(reader.u16_at(2)?);
    let length = reader.u32_at(4)? as usize;
    if length == 0 {
        info!("Receiving a message for broadcast, but message is void");
        return Ok(());
    }
    if frame.discarded() > 0 {
        warn!(dropped = frame.discarded(), "Broadcast message cut to the frame limit");
    }
    let text = reader.bytes_at(8, length)?;
    server.relay_broadcast(color, text);
    Ok(())
}

fn handle_account_registry(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let mut forwarded = frame.as_bytes().to_vec();
    forwarded[..2].copy_from_slice(&to_map::ACCOUNT_REGISTRY.to_le_bytes());
    let reached = server.send_to_maps(&forwarded);
    debug!(length = forwarded.len(), maps = reached, "Account registry forwarded");
    Ok(())
}

fn handle_account_deleted(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let account_id = frame.reader().u32_at(2)?;
    info!(account_id, "Account deleted by login-server");

    if let Err(e) = server.content.account_deleted(account_id) {
        warn!(account_id, error = %e, "Account deletion hook failed");
    }
    server.send_to_maps(&mapif::encode_account_deleted(account_id));
    server.disconnect_player(account_id);
    Ok(())
}

fn handle_account_status(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let reader = frame.reader();
    let account_id = reader.u32_at(2)?;
    let kind = reader.u8_at(6)?;
    let value = reader.u32_at(7)?;
    info!(account_id, kind, value, "Account status changed");

    server.send_to_maps(&mapif::encode_account_status(account_id, kind, value));
    server.disconnect_player(account_id);
    Ok(())
}

fn handle_kick(server: &mut CharServer, _conn: ConnId, frame: &Frame) -> Result<()> {
    let account_id = frame.reader().u32_at(2)?;
    debug!(account_id, "Kick requested by login-server");
    server.disconnect_player(account_id);
    Ok(())
}

fn handle_ip_rebind(server: &mut CharServer, _conn: ConnId, _frame: &Frame) -> Result<()> {
    server.send_to_maps(&mapif::encode_ip_rebind());
    if let Some(ip) = server.refresh_char_ip() {
        server.send_to_login(encode_ip_update(ip));
    }
    Ok(())
}

// ============ Encoding ============

/// Server handshake (0x2710)
pub fn encode_handshake(config: &ServerConfig, char_ip: Ipv4Addr) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_login::HANDSHAKE, 86);
    writer.write_fixed_string(&config.server_userid, NAME_LENGTH);
    writer.write_fixed_string(&config.server_passwd, NAME_LENGTH);
    writer.write_u32(0);
    writer.write_bytes(&char_ip.octets());
    writer.write_bytes(&config.char_port.to_be_bytes());
    writer.write_fixed_string(&config.server_name, SERVER_NAME_LENGTH);
    writer.write_u16(0);
    writer.write_u16(config.maintenance);
    writer.write_u16(config.new_display);
    writer.finish()
}

/// Forward a client's credentials for verification (0x2712)
pub fn encode_auth_request(
    account_id: u32,
    login_id1: u32,
    login_id2: u32,
    sex: u8,
    client_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_login::AUTH_REQUEST, 19);
    writer.write_u32(account_id);
    writer.write_u32(login_id1);
    writer.write_u32(login_id2);
    writer.write_u8(sex);
    writer.write_bytes(&client_ip.octets());
    writer.finish()
}

/// Keepalive (0x2719)
pub fn encode_ping() -> Vec<u8> {
    PacketWriter::frame(to_login::PING, 2).finish()
}

pub fn encode_account_online(account_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_login::ACCOUNT_ONLINE, 6);
    writer.write_u32(account_id);
    writer.finish()
}

pub fn encode_account_offline(account_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_login::ACCOUNT_OFFLINE, 6);
    writer.write_u32(account_id);
    writer.finish()
}

/// Full online list (0x272d); truncated to what a frame can carry
pub fn encode_online_list(accounts: &[u32]) -> std::result::Result<Vec<u8>, ProtocolError> {
    let max = (u16::MAX as usize - 8) / 4;
    if accounts.len() > max {
        warn!(count = accounts.len(), max, "Online list truncated");
    }
    let accounts = &accounts[..accounts.len().min(max)];

    let mut writer = PacketWriter::variable_frame(to_login::ONLINE_LIST, 8 + 4 * accounts.len());
    writer.write_u32(accounts.len() as u32);
    for &account_id in accounts {
        writer.write_u32(account_id);
    }
    writer.finish_variable()
}

/// Public char ip changed (0x2736)
pub fn encode_ip_update(char_ip: Ipv4Addr) -> Vec<u8> {
    let mut writer = PacketWriter::frame(to_login::IP_UPDATE, 6);
    writer.write_bytes(&char_ip.octets());
    writer.finish()
}
