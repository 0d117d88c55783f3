//! Text file backend
//!
//! Keeps every record in an ordered in-memory index. The file is a snapshot:
//! `init` reads it once, `sync` rewrites it wholesale. A rewrite goes to a
//! fresh `<file>.tmp.<n>` (created exclusively, so two writers never share
//! it), is fsynced, then renamed over the old snapshot and the directory is
//! fsynced. A crash leaves either the old or the new file, never a torn one.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::storage::{EntityStore, TextRecord};

/// First id handed out by an empty store
const START_ID: u32 = 1;

/// In-memory indexed store backed by a text snapshot
pub struct TextStore<R> {
    path: PathBuf,
    bootstrap_count: u32,
    records: BTreeMap<u32, R>,
    next_id: u32,
    initialized: bool,
}

impl<R: TextRecord> TextStore<R> {
    /// Create an unloaded store; `bootstrap_count` default records are
    /// synthesized when the file is missing or holds no valid line
    pub fn new(path: impl AsRef<Path>, bootstrap_count: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            bootstrap_count,
            records: BTreeMap::new(),
            next_id: START_ID,
            initialized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id the next `create` will allocate
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(StoreError::NotInitialized.into())
        }
    }

    fn parse(&mut self, content: &str) -> usize {
        let mut loaded = 0;
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(record) = R::from_line(line) else {
                warn!(
                    kind = R::KIND,
                    file = %self.path.display(),
                    line = number + 1,
                    "Skipping invalid data: {}",
                    line
                );
                continue;
            };

            let id = record.id();
            self.records.insert(id, record);
            if id >= self.next_id {
                self.next_id = id.saturating_add(1);
            }
            loaded += 1;
        }
        loaded
    }

    fn bootstrap(&mut self) {
        info!(
            kind = R::KIND,
            file = %self.path.display(),
            count = self.bootstrap_count,
            "Making default data"
        );
        for id in 0..self.bootstrap_count {
            self.records.insert(id, R::bootstrap(id));
        }
        self.next_id = self.next_id.max(self.bootstrap_count);
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    /// Make a completed rename durable
    #[cfg(unix)]
    fn sync_parent_dir(&self) -> io::Result<()> {
        let dir = self.parent_dir().unwrap_or_else(|| Path::new("."));
        fs::File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> io::Result<()> {
        Ok(())
    }

    // The exclusive temp file stands in for a write lock: a rewrite never
    // touches the live snapshot, and the rename swaps it in atomically.
    fn write_snapshot(&self) -> io::Result<()> {
        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = PathBuf::from(format!(
            "{}.tmp.{}",
            self.path.display(),
            rand::random::<u32>()
        ));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let written = (|| {
            let mut writer = BufWriter::new(file);
            for record in self.records.values() {
                writeln!(writer, "{}", record.to_line())?;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        })();

        if written.is_err() {
            if let Err(remove_err) = fs::remove_file(&temp_path) {
                debug!(
                    file = %temp_path.display(),
                    error = %remove_err,
                    "Could not remove temporary snapshot"
                );
            }
            return written;
        }
        self.sync_parent_dir()
    }
}

impl<R: TextRecord + Send> EntityStore<R> for TextStore<R> {
    fn init(&mut self) -> Result<()> {
        self.records.clear();
        self.next_id = START_ID;

        let loaded = match fs::read(&self.path) {
            Ok(bytes) => self.parse(&String::from_utf8_lossy(&bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(kind = R::KIND, file = %self.path.display(), "No snapshot file yet");
                0
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    source,
                }
                .into())
            }
        };

        if loaded == 0 {
            self.bootstrap();
        }
        self.initialized = true;

        info!(
            kind = R::KIND,
            file = %self.path.display(),
            records = self.records.len(),
            next_id = self.next_id,
            "Store loaded"
        );
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.ensure_initialized()?;

        if let Err(source) = self.write_snapshot() {
            error!(
                kind = R::KIND,
                file = %self.path.display(),
                error = %source,
                "Cannot write snapshot, data is lost"
            );
            return Err(StoreError::Write {
                path: self.path.display().to_string(),
                source,
            }
            .into());
        }

        debug!(
            kind = R::KIND,
            records = self.records.len(),
            "Store synced"
        );
        Ok(())
    }

    fn load_by_id(&self, id: u32) -> Result<R> {
        self.records
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id).into())
    }

    fn save(&mut self, record: &R) -> Result<()> {
        let slot = self
            .records
            .get_mut(&record.id())
            .ok_or(StoreError::NotFound(record.id()))?;
        *slot = record.clone();
        Ok(())
    }

    fn create(&mut self, mut record: R) -> Result<u32> {
        self.ensure_initialized()?;
        let id = self.next_id;
        record.set_id(id);
        self.records.insert(id, record);
        self.next_id = id.saturating_add(1);
        debug!(kind = R::KIND, id, "Record created");
        Ok(id)
    }

    fn remove(&mut self, id: u32) -> Result<R> {
        self.records
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(id).into())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = R> + '_> {
        Box::new(self.records.values().cloned())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn destroy(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        let synced = self.sync();
        self.records.clear();
        self.initialized = false;
        synced
    }
}
