//! Persistent entity stores
//!
//! `EntityStore` is the backend-neutral CRUD and iteration surface. The only
//! backend today is `TextStore`, an in-memory index snapshotted to a flat
//! file; `open_castle_store` picks the backend from configuration.

pub mod castle;
pub mod text;

use crate::config::{StorageConfig, StoreBackend};
use crate::error::Result;

pub use castle::CastleRecord;
pub use text::TextStore;

/// A record addressable by a numeric id
pub trait StoreRecord: Clone {
    fn id(&self) -> u32;
    fn set_id(&mut self, id: u32);
}

/// A record with a one-line text form
pub trait TextRecord: StoreRecord {
    /// Record kind used in log lines
    const KIND: &'static str;

    /// Parse one line, accepting every supported layout
    fn from_line(line: &str) -> Option<Self>;

    /// Render the current layout (no trailing newline)
    fn to_line(&self) -> String;

    /// Default record synthesized for an empty store
    fn bootstrap(id: u32) -> Self;
}

/// Backend-neutral persistent store
pub trait EntityStore<R: StoreRecord>: Send {
    /// Load the durable state into memory
    fn init(&mut self) -> Result<()>;

    /// Write the whole in-memory state back
    fn sync(&mut self) -> Result<()>;

    /// Copy of the record with this id
    fn load_by_id(&self, id: u32) -> Result<R>;

    /// Overwrite an existing record
    fn save(&mut self, record: &R) -> Result<()>;

    /// Insert a record under the next free id and return that id
    fn create(&mut self, record: R) -> Result<u32>;

    /// Remove a record, returning it
    fn remove(&mut self, id: u32) -> Result<R>;

    /// Copies of all records in id order
    fn iter(&self) -> Box<dyn Iterator<Item = R> + '_>;

    /// Number of records held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final sync, then release the in-memory state
    fn destroy(&mut self) -> Result<()>;
}

/// Castle store trait object used by the server
pub type CastleStore = Box<dyn EntityStore<CastleRecord>>;

/// Build and load the castle store for the configured backend
pub fn open_castle_store(config: &StorageConfig) -> Result<CastleStore> {
    let mut store: CastleStore = match config.backend {
        StoreBackend::Text => Box::new(TextStore::<CastleRecord>::new(
            &config.castle_file,
            config.castle_count,
        )),
    };
    store.init()?;
    Ok(store)
}
