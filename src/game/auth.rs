//! Auth correlation
//!
//! A client presents `(account_id, login_id1, login_id2)` issued by the login
//! server. The char server forwards the triple to login and parks the session
//! in `AwaitingAuthVerdict`. The verdict comes back asynchronously and is
//! matched to the waiting session by the exact triple.

use tracing::{debug, info};

use crate::net::session::{ConnId, Session, SessionManager, SessionState};

/// Credentials a client presents on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials {
    pub account_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: u8,
}

/// Login server answer to an auth request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerdict {
    pub account_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub accepted: bool,
    pub email: String,
    pub expiration_time: u32,
    pub gm_level: u8,
}

/// Account data refresh pushed by the login server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    pub account_id: u32,
    pub email: String,
    pub expiration_time: u32,
    pub gm_level: u8,
}

/// Result of applying a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictOutcome {
    Accepted(ConnId),
    Rejected(ConnId),
    /// No session waits on this triple
    Unmatched,
}

/// Record presented credentials and park the session for the verdict.
///
/// Returns false for a session that is already authenticated.
pub fn begin(session: &mut Session, credentials: ClientCredentials) -> bool {
    if session.state() == SessionState::Authenticated {
        debug!(session_id = session.id, "Credentials re-sent after auth, ignored");
        return false;
    }
    session.account_id = credentials.account_id;
    session.login_id1 = credentials.login_id1;
    session.login_id2 = credentials.login_id2;
    session.sex = credentials.sex;
    session.set_state(SessionState::AwaitingAuthVerdict);
    true
}

/// Match a verdict to its waiting session and move it to its final state
pub fn apply_verdict(sessions: &mut SessionManager, verdict: &AuthVerdict) -> VerdictOutcome {
    let Some(conn) =
        sessions.find_by_correlation(verdict.account_id, verdict.login_id1, verdict.login_id2)
    else {
        debug!(
            account_id = verdict.account_id,
            "Auth verdict matches no waiting session, dropped"
        );
        return VerdictOutcome::Unmatched;
    };
    let Some(session) = sessions.get_mut(conn) else {
        return VerdictOutcome::Unmatched;
    };

    if verdict.accepted {
        session.email = verdict.email.clone();
        session.expiration_time = verdict.expiration_time;
        session.gm_level = verdict.gm_level;
        session.set_state(SessionState::Authenticated);
        info!(
            session_id = conn,
            account_id = verdict.account_id,
            expires = %format_expiration(verdict.expiration_time),
            "Client authenticated"
        );
        VerdictOutcome::Accepted(conn)
    } else {
        session.set_state(SessionState::Rejected);
        info!(
            session_id = conn,
            account_id = verdict.account_id,
            "Client authentication refused by login server"
        );
        VerdictOutcome::Rejected(conn)
    }
}

/// Refresh account data of every client session of the account; returns
/// the number of sessions touched
pub fn apply_update(sessions: &mut SessionManager, update: &AccountUpdate) -> usize {
    let mut touched = 0;
    for session in sessions.clients_of_account_mut(update.account_id) {
        session.email = update.email.clone();
        session.expiration_time = update.expiration_time;
        session.gm_level = update.gm_level;
        touched += 1;
    }
    if touched == 0 {
        debug!(account_id = update.account_id, "Account update for absent account");
    }
    touched
}

/// Render an expiration timestamp for logs
pub fn format_expiration(expiration_time: u32) -> String {
    if expiration_time == 0 {
        return "unlimited".to_string();
    }
    chrono::DateTime::from_timestamp(i64::from(expiration_time), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| expiration_time.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::session::ConnectionKind;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn add_client(sessions: &mut SessionManager, id: ConnId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        sessions.register(Session::new(id, addr, ConnectionKind::Client, tx));
        rx
    }

    fn credentials(account_id: u32, token: u32) -> ClientCredentials {
        ClientCredentials {
            account_id,
            login_id1: token,
            login_id2: token + 1,
            sex: 1,
        }
    }

    fn verdict(account_id: u32, token: u32, accepted: bool) -> AuthVerdict {
        AuthVerdict {
            account_id,
            login_id1: token,
            login_id2: token + 1,
            accepted,
            email: "a@b.c".to_string(),
            expiration_time: 0,
            gm_level: 5,
        }
    }

    #[test]
    fn test_verdict_matches_exact_triple() {
        let mut sessions = SessionManager::new();
        let _a = add_client(&mut sessions, 1);
        let _b = add_client(&mut sessions, 2);
        assert!(begin(sessions.get_mut(1).unwrap(), credentials(100, 10)));
        assert!(begin(sessions.get_mut(2).unwrap(), credentials(100, 20)));

        assert_eq!(
            apply_verdict(&mut sessions, &verdict(100, 20, true)),
            VerdictOutcome::Accepted(2)
        );
        assert_eq!(sessions.get(2).unwrap().state(), SessionState::Authenticated);
        assert_eq!(sessions.get(2).unwrap().gm_level, 5);
        assert_eq!(
            sessions.get(1).unwrap().state(),
            SessionState::AwaitingAuthVerdict
        );
    }

    #[test]
    fn test_unmatched_verdict_changes_nothing() {
        let mut sessions = SessionManager::new();
        let _a = add_client(&mut sessions, 1);
        begin(sessions.get_mut(1).unwrap(), credentials(100, 10));

        assert_eq!(
            apply_verdict(&mut sessions, &verdict(100, 11, true)),
            VerdictOutcome::Unmatched
        );
        assert_eq!(
            sessions.get(1).unwrap().state(),
            SessionState::AwaitingAuthVerdict
        );
        assert!(sessions.get(1).unwrap().email.is_empty());
    }

    #[test]
    fn test_rejected_verdict() {
        let mut sessions = SessionManager::new();
        let _a = add_client(&mut sessions, 1);
        begin(sessions.get_mut(1).unwrap(), credentials(100, 10));

        assert_eq!(
            apply_verdict(&mut sessions, &verdict(100, 10, false)),
            VerdictOutcome::Rejected(1)
        );
        assert_eq!(sessions.get(1).unwrap().state(), SessionState::Rejected);
        // A second verdict for the same triple no longer matches
        assert_eq!(
            apply_verdict(&mut sessions, &verdict(100, 10, true)),
            VerdictOutcome::Unmatched
        );
    }

    #[test]
    fn test_update_matches_account_only() {
        let mut sessions = SessionManager::new();
        let _a = add_client(&mut sessions, 1);
        begin(sessions.get_mut(1).unwrap(), credentials(100, 10));

        let update = AccountUpdate {
            account_id: 100,
            email: "new@mail".to_string(),
            expiration_time: 1_700_000_000,
            gm_level: 1,
        };
        assert_eq!(apply_update(&mut sessions, &update), 1);

        let session = sessions.get(1).unwrap();
        assert_eq!(session.email, "new@mail");
        assert_eq!(session.state(), SessionState::AwaitingAuthVerdict);
    }

    #[test]
    fn test_begin_ignored_after_auth() {
        let mut sessions = SessionManager::new();
        let _a = add_client(&mut sessions, 1);
        let session = sessions.get_mut(1).unwrap();
        session.set_state(SessionState::Authenticated);
        assert!(!begin(session, credentials(5, 5)));
        assert_eq!(session.account_id, 0);
    }

    #[test]
    fn test_format_expiration() {
        assert_eq!(format_expiration(0), "unlimited");
        assert_eq!(format_expiration(86_400), "1970-01-02 00:00:00 UTC");
    }
}
