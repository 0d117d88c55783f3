//! Guild castle records
//!
//! One record per castle, keyed by a stable 0-based castle id. The text form
//! is one comma-separated line:
//!
//! `id,guild_id,economy,defense,trigger_e,trigger_d,next_time,pay_time,create_time,visible_c,g0..g7`
//!
//! Older files carry 8 more trailing integers (guardian hit points), which
//! are accepted on load and dropped.

use tracing::trace;

use crate::storage::{StoreRecord, TextRecord};

/// Number of castle slots in the world
pub const MAX_GUILD_CASTLES: u32 = 24;

/// Highest castle id; map servers address castles with a 2-byte id
pub const MAX_CASTLE_ID: u32 = u16::MAX as u32;

/// Guardian slots per castle
pub const MAX_GUARDIANS: usize = 8;

/// Fields in the current line layout
const CURRENT_FIELDS: usize = 10 + MAX_GUARDIANS;

/// Fields in the legacy line layout (guardian hit points appended)
const LEGACY_FIELDS: usize = CURRENT_FIELDS + MAX_GUARDIANS;

/// Persistent state of one guild castle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CastleRecord {
    pub castle_id: u32,
    /// Owning guild (0 = unowned)
    pub guild_id: i32,
    pub economy: i32,
    pub defense: i32,
    pub trigger_e: i32,
    pub trigger_d: i32,
    pub next_time: i32,
    pub pay_time: i32,
    pub create_time: i32,
    pub visible_c: i32,
    pub guardians: [bool; MAX_GUARDIANS],
}

impl CastleRecord {
    /// Unowned castle with every field zeroed
    pub fn new(castle_id: u32) -> Self {
        Self {
            castle_id,
            ..Self::default()
        }
    }

    /// Read a field by its map-server index (1 = guild id ... 10..=17 = guardians)
    pub fn field(&self, index: u8) -> Option<i32> {
        let value = match index {
            1 => self.guild_id,
            2 => self.economy,
            3 => self.defense,
            4 => self.trigger_e,
            5 => self.trigger_d,
            6 => self.next_time,
            7 => self.pay_time,
            8 => self.create_time,
            9 => self.visible_c,
            10..=17 => self.guardians[(index - 10) as usize] as i32,
            _ => return None,
        };
        Some(value)
    }

    /// Write a field by its map-server index; false for an unknown index
    pub fn set_field(&mut self, index: u8, value: i32) -> bool {
        match index {
            1 => self.guild_id = value,
            2 => self.economy = value,
            3 => self.defense = value,
            4 => self.trigger_e = value,
            5 => self.trigger_d = value,
            6 => self.next_time = value,
            7 => self.pay_time = value,
            8 => self.create_time = value,
            9 => self.visible_c = value,
            10..=17 => self.guardians[(index - 10) as usize] = value != 0,
            _ => return false,
        }
        true
    }
}

impl StoreRecord for CastleRecord {
    fn id(&self) -> u32 {
        self.castle_id
    }

    fn set_id(&mut self, id: u32) {
        self.castle_id = id;
    }
}

impl TextRecord for CastleRecord {
    const KIND: &'static str = "castle";

    fn from_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != CURRENT_FIELDS && fields.len() != LEGACY_FIELDS {
            trace!(fields = fields.len(), "Castle line has unexpected field count");
            return None;
        }

        let castle_id: u32 = fields[0].parse().ok()?;
        if castle_id > MAX_CASTLE_ID {
            trace!(castle_id, "Castle id out of range");
            return None;
        }

        let mut ints = [0i32; CURRENT_FIELDS - 1];
        for (slot, raw) in ints.iter_mut().zip(&fields[1..CURRENT_FIELDS]) {
            *slot = raw.parse().ok()?;
        }
        // Legacy trailing values must still be integers
        for raw in &fields[CURRENT_FIELDS..] {
            raw.parse::<i32>().ok()?;
        }

        let mut guardians = [false; MAX_GUARDIANS];
        for (flag, value) in guardians.iter_mut().zip(&ints[9..]) {
            *flag = *value != 0;
        }

        Some(Self {
            castle_id,
            guild_id: ints[0],
            economy: ints[1],
            defense: ints[2],
            trigger_e: ints[3],
            trigger_d: ints[4],
            next_time: ints[5],
            pay_time: ints[6],
            create_time: ints[7],
            visible_c: ints[8],
            guardians,
        })
    }

    fn to_line(&self) -> String {
        let mut line = format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.castle_id,
            self.guild_id,
            self.economy,
            self.defense,
            self.trigger_e,
            self.trigger_d,
            self.next_time,
            self.pay_time,
            self.create_time,
            self.visible_c
        );
        for visible in self.guardians {
            line.push(',');
            line.push(if visible { '1' } else { '0' });
        }
        line
    }

    fn bootstrap(id: u32) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> CastleRecord {
        CastleRecord {
            castle_id: 3,
            guild_id: 10,
            economy: 55,
            defense: 20,
            trigger_e: 1,
            trigger_d: 2,
            next_time: 0,
            pay_time: 1_200_000_000,
            create_time: -1,
            visible_c: 4,
            guardians: [true, false, true, false, false, false, false, true],
        }
    }

    #[test]
    fn test_line_round_trip() {
        let castle = sample();
        let line = castle.to_line();
        assert_eq!(line, "3,10,55,20,1,2,0,1200000000,-1,4,1,0,1,0,0,0,0,1");
        assert_eq!(CastleRecord::from_line(&line), Some(castle));

        let zero = CastleRecord::new(0);
        assert_eq!(CastleRecord::from_line(&zero.to_line()), Some(zero));
    }

    #[test]
    fn test_legacy_line_matches_current() {
        let current = "3,10,55,20,1,2,0,1200000000,-1,4,1,0,1,0,0,0,0,1";
        let legacy = format!("{},100,200,300,400,500,600,700,800\n", current);
        assert_eq!(
            CastleRecord::from_line(&legacy),
            CastleRecord::from_line(current)
        );
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert_eq!(CastleRecord::from_line(""), None);
        assert_eq!(CastleRecord::from_line("garbage"), None);
        assert_eq!(CastleRecord::from_line("1,2,3"), None);
        // 19 fields: neither layout
        assert_eq!(
            CastleRecord::from_line("1,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0"),
            None
        );
        // Non-numeric field
        assert_eq!(
            CastleRecord::from_line("1,x,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0"),
            None
        );
        // Negative castle id
        assert_eq!(
            CastleRecord::from_line("-1,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0"),
            None
        );
    }

    #[test]
    fn test_castle_id_must_fit_wire_id() {
        let castle = CastleRecord::from_line("65535,5,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(castle.castle_id, MAX_CASTLE_ID);
        assert_eq!(
            CastleRecord::from_line("70000,5,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0"),
            None
        );
    }

    #[test]
    fn test_nonzero_guardian_value_is_visible() {
        let castle =
            CastleRecord::from_line("0,0,0,0,0,0,0,0,0,0,5,0,0,0,0,0,0,-2").unwrap();
        assert!(castle.guardians[0]);
        assert!(castle.guardians[7]);
        assert!(castle.to_line().ends_with(",1,0,0,0,0,0,0,1"));
    }

    #[test]
    fn test_field_index_access() {
        let mut castle = sample();
        assert_eq!(castle.field(1), Some(10));
        assert_eq!(castle.field(9), Some(4));
        assert_eq!(castle.field(10), Some(1));
        assert_eq!(castle.field(11), Some(0));
        assert_eq!(castle.field(0), None);
        assert_eq!(castle.field(18), None);

        assert!(castle.set_field(2, 99));
        assert!(castle.set_field(17, 0));
        assert!(!castle.set_field(42, 1));
        assert_eq!(castle.economy, 99);
        assert!(!castle.guardians[7]);
    }
}
