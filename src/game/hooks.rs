//! Game content hooks
//!
//! Character data, job tables and guild membership live outside the char
//! server core. Login-driven events that touch them go through `GameContent`.

use crate::error::Result;

/// Game-content side of login events
pub trait GameContent: Send {
    /// The account's sex changed; adjust its characters
    fn sex_changed(&mut self, account_id: u32, sex: u8) -> Result<()>;

    /// The account was deleted; drop its characters and storage
    fn account_deleted(&mut self, account_id: u32) -> Result<()>;

    /// Encoded character blocks for the char-select screen
    fn character_list(&self, account_id: u32) -> Vec<u8>;
}

/// Content that holds no characters
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopContent;

impl GameContent for NoopContent {
    fn sex_changed(&mut self, _account_id: u32, _sex: u8) -> Result<()> {
        Ok(())
    }

    fn account_deleted(&mut self, _account_id: u32) -> Result<()> {
        Ok(())
    }

    fn character_list(&self, _account_id: u32) -> Vec<u8> {
        Vec::new()
    }
}
