//! Run state
//!
//! The scheduler owns a [`StatusBoard`] behind [`SharedStatus`]; monitors only
//! read it. The board is mirrored to a per-run directory so `av1top` can watch
//! a run from another process:
//!
//! ```text
//! <temp_root>/av1conv-<uuid>/
//!     queue.json      queue counters and slot count
//!     slot-N.json     one file per occupied slot
//!     savings.log     one JSON line per kept or reverted file
//!     jobs/           in-progress encodes
//! ```
//!
//! Every JSON file is written to a temp name and renamed into place. Readers
//! treat missing or unparsable files as "no data yet".

use crate::encode::ProgressSample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Prefix of run state directories inside the temp root
pub const STATE_DIR_PREFIX: &str = "av1conv-";

const QUEUE_FILE: &str = "queue.json";
const SAVINGS_FILE: &str = "savings.log";
const JOBS_DIR: &str = "jobs";

/// Queue counters
///
/// `processed + skipped <= started <= total` holds at every snapshot and
/// `active` equals the number of running jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub total: usize,
    pub started: usize,
    /// Jobs whose output was kept
    pub processed: usize,
    /// Every other terminal outcome
    pub skipped: usize,
    pub active: usize,
    /// Next file to be dispatched
    pub next_hint: Option<String>,
    /// Signed sum over kept outputs
    pub saved_bytes: i64,
}

impl QueueState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Files not yet started
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.started)
    }

    pub fn is_consistent(&self) -> bool {
        self.processed + self.skipped <= self.started && self.started <= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    /// Probing, classifying and planning
    Preparing,
    Encoding,
    /// Size check and install
    Finalizing,
}

/// What one panel slot is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    /// 1-based slot index
    pub slot: usize,
    pub job_id: Uuid,
    pub label: String,
    pub phase: SlotPhase,
    pub progress: Option<ProgressSample>,
}

/// Authoritative view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusBoard {
    pub queue: QueueState,
    pub slots: BTreeMap<usize, SlotStatus>,
    /// Number of panel slots
    pub slot_count: usize,
}

impl StatusBoard {
    pub fn new(total: usize, slot_count: usize) -> Self {
        Self {
            queue: QueueState::new(total),
            slots: BTreeMap::new(),
            slot_count,
        }
    }

    /// True while any slot is still preparing and has no progress yet
    pub fn any_preparing(&self) -> bool {
        self.slots
            .values()
            .any(|s| s.phase == SlotPhase::Preparing && s.progress.is_none())
    }
}

/// Shared status for concurrent access; written by the scheduler only
pub type SharedStatus = Arc<RwLock<StatusBoard>>;

pub fn new_shared_status(total: usize, slot_count: usize) -> SharedStatus {
    Arc::new(RwLock::new(StatusBoard::new(total, slot_count)))
}

/// Contents of `queue.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub queue: QueueState,
    pub slot_count: usize,
    pub updated_unix_ms: i64,
}

/// One line of `savings.log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsEntry {
    pub path: PathBuf,
    pub saved_bytes: i64,
    pub reverted: bool,
}

/// Per-run state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Create `<temp_root>/av1conv-<uuid>/` with its `jobs/` subdirectory
    pub fn create(temp_root: &Path) -> io::Result<Self> {
        let root = temp_root.join(format!("{}{}", STATE_DIR_PREFIX, Uuid::new_v4()));
        fs::create_dir_all(root.join(JOBS_DIR))?;
        Ok(Self { root })
    }

    /// Open an existing directory for reading
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join(JOBS_DIR)
    }

    fn slot_file(&self, slot: usize) -> PathBuf {
        self.root.join(format!("slot-{}.json", slot))
    }

    /// Write the whole board: queue record plus one file per slot.
    ///
    /// Slot files of free slots are removed.
    pub fn mirror(&self, board: &StatusBoard) -> io::Result<()> {
        let record = QueueRecord {
            queue: board.queue.clone(),
            slot_count: board.slot_count,
            updated_unix_ms: unix_ms(),
        };
        write_json_atomic(&self.root.join(QUEUE_FILE), &record)?;

        for slot in 1..=board.slot_count {
            match board.slots.get(&slot) {
                Some(status) => write_json_atomic(&self.slot_file(slot), status)?,
                None => match fs::remove_file(self.slot_file(slot)) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                    _ => {}
                },
            }
        }
        Ok(())
    }

    pub fn append_savings(&self, entry: &SavingsEntry) -> io::Result<()> {
        let mut line = serde_json::to_string(entry).map_err(io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(SAVINGS_FILE))?;
        file.write_all(line.as_bytes())
    }

    pub fn read_queue(&self) -> Option<QueueRecord> {
        read_json(&self.root.join(QUEUE_FILE))
    }

    /// Occupied slots, ordered by slot index
    pub fn read_slots(&self, slot_count: usize) -> Vec<SlotStatus> {
        (1..=slot_count)
            .filter_map(|slot| read_json(&self.slot_file(slot)))
            .collect()
    }

    /// Complete lines of the savings log
    pub fn read_savings(&self) -> Vec<SavingsEntry> {
        fs::read_to_string(self.root.join(SAVINGS_FILE))
            .map(|text| {
                text.lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the directory and everything in it
    pub fn remove(self) -> io::Result<()> {
        fs::remove_dir_all(&self.root)
    }
}

/// Most recently modified run directory in `temp_root`
pub fn latest_state_dir(temp_root: &Path) -> Option<PathBuf> {
    fs::read_dir(temp_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_string_lossy().starts_with(STATE_DIR_PREFIX)
                && entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
