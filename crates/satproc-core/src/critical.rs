//! Durable critical-state store.
//!
//! A process may stash up to 224 bytes of state that must survive reboots
//! and power loss. Every save writes a fresh uniquely-suffixed file in each
//! of two slots (`a` and `b` prefixes), and within each file the record is
//! duplicated four times to ride out single-sector loss. Records carry a
//! monotonically increasing sequence number and an MD5 checksum, so load
//! can always pick the newest copy that verifies.
//!
//! On-disk record layout (256 bytes, repeated [`NUM_COPIES`] times):
//!
//! ```text
//! u32 seq-high (BE) | u32 seq-low (BE) | 8 reserved | 224 payload | 16 md5
//! ```
//!
//! The checksum covers everything before the md5 field.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use md5::{Digest, Md5};
use rand::Rng;
use rand::distr::Alphanumeric;
use thiserror::Error;

/// Maximum payload length.
pub const MAX_STATE_LEN: usize = 224;
/// Default on-target state directory.
pub const DEFAULT_DIRECTORY: &str = "/critical_state";

const FILE_PREFIX: &str = "crit-state";
const NUM_FILE_SLOTS: usize = 2;
const NUM_COPIES: usize = 4;
const CLEANUP_INTERVAL: u32 = 6;
const MD5_LEN: usize = 16;
const RESERVED_LEN: usize = 8;
const RECORD_LEN: usize = 8 + RESERVED_LEN + MAX_STATE_LEN + MD5_LEN;
const SUFFIX_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum CriticalError {
    #[error("payload length {0} out of range (1..={MAX_STATE_LEN})")]
    BadLength(usize),
    #[error("state is dirty and could not be reloaded")]
    Dirty,
    #[error("in-memory state failed checksum verification")]
    ChecksumMismatch,
    #[error("failed to write state file")]
    Write(#[source] io::Error),
}

struct FileSlot {
    prefix: char,
    directory: PathBuf,
    current: Option<PathBuf>,
    generation: u32,
}

impl FileSlot {
    fn file_prefix(&self, name: &str) -> String {
        format!("{FILE_PREFIX}-{name}.{}.", self.prefix)
    }
}

/// Checksum-protected, multi-copy, versioned blob-on-disk.
pub struct CriticalStore {
    name: String,
    version: u64,
    dirty: bool,
    payload: [u8; MAX_STATE_LEN],
    md5: [u8; MD5_LEN],
    slots: Vec<FileSlot>,
}

fn payload_digest(payload: &[u8; MAX_STATE_LEN]) -> [u8; MD5_LEN] {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hasher.finalize().into()
}

struct Record {
    sequence: u64,
    payload: [u8; MAX_STATE_LEN],
}

impl Record {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..4].copy_from_slice(&(((self.sequence >> 32) & 0xFFFF_FFFF) as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&((self.sequence & 0xFFFF_FFFF) as u32).to_be_bytes());
        buf[8 + RESERVED_LEN..8 + RESERVED_LEN + MAX_STATE_LEN].copy_from_slice(&self.payload);

        let mut hasher = Md5::new();
        hasher.update(&buf[..RECORD_LEN - MD5_LEN]);
        let digest: [u8; MD5_LEN] = hasher.finalize().into();
        buf[RECORD_LEN - MD5_LEN..].copy_from_slice(&digest);
        buf
    }

    /// Parse and checksum-verify one on-disk record.
    fn decode(buf: &[u8]) -> Option<Record> {
        if buf.len() != RECORD_LEN {
            return None;
        }

        let mut hasher = Md5::new();
        hasher.update(&buf[..RECORD_LEN - MD5_LEN]);
        let digest: [u8; MD5_LEN] = hasher.finalize().into();
        if digest != buf[RECORD_LEN - MD5_LEN..] {
            return None;
        }

        let hi = u32::from_be_bytes(buf[..4].try_into().unwrap());
        let lo = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mut payload = [0u8; MAX_STATE_LEN];
        payload.copy_from_slice(&buf[8 + RESERVED_LEN..8 + RESERVED_LEN + MAX_STATE_LEN]);

        Some(Record {
            sequence: ((hi as u64) << 32) | lo as u64,
            payload,
        })
    }
}

impl CriticalStore {
    /// Open the store for `name` under `directory`, loading the newest valid
    /// record and pruning stale files.
    pub fn open(name: &str, directory: impl AsRef<Path>) -> CriticalStore {
        let directory = directory.as_ref().to_path_buf();
        if let Err(e) = fs::create_dir_all(&directory) {
            warn!("failed to create critical-state directory {}: {e}", directory.display());
        }

        let mut store = CriticalStore {
            name: name.to_string(),
            version: 0,
            dirty: false,
            payload: [0u8; MAX_STATE_LEN],
            md5: payload_digest(&[0u8; MAX_STATE_LEN]),
            slots: (0..NUM_FILE_SLOTS)
                .map(|i| FileSlot {
                    prefix: (b'a' + i as u8) as char,
                    directory: directory.clone(),
                    current: None,
                    generation: 0,
                })
                .collect(),
        };

        store.load();
        for i in 0..store.slots.len() {
            store.cleanup_slot(i);
        }
        store
    }

    /// Open under the fixed flight directory.
    pub fn open_default(name: &str) -> CriticalStore {
        Self::open(name, DEFAULT_DIRECTORY)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Durably save `payload` (1..=224 bytes) under a fresh sequence number.
    ///
    /// A failure writing the first slot aborts the save before memory state
    /// is touched; a failure in a later slot marks the store dirty but the
    /// save still counts.
    pub fn save(&mut self, payload: &[u8]) -> Result<usize, CriticalError> {
        if payload.is_empty() || payload.len() > MAX_STATE_LEN {
            return Err(CriticalError::BadLength(payload.len()));
        }

        self.version += 1;
        let mut record = Record {
            sequence: self.version,
            payload: [0u8; MAX_STATE_LEN],
        };
        record.payload[..payload.len()].copy_from_slice(payload);
        let encoded = record.encode();

        for i in 0..self.slots.len() {
            if let Err(e) = self.write_slot(i, &encoded) {
                if i == 0 {
                    return Err(CriticalError::Write(e));
                }
                warn!("critical-state slot {} write failed: {e}", self.slots[i].prefix);
                self.dirty = true;
            }
        }

        self.payload = record.payload;
        self.md5 = payload_digest(&self.payload);

        Ok(payload.len())
    }

    /// Copy up to `out.len()` bytes of the newest good payload to `out`.
    ///
    /// A dirty store reloads from disk first; an in-memory checksum mismatch
    /// forces a reload as well.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, CriticalError> {
        if self.dirty {
            self.load();
        }
        if self.dirty {
            return Err(CriticalError::Dirty);
        }

        if payload_digest(&self.payload) != self.md5 {
            self.load();
            if payload_digest(&self.payload) != self.md5 {
                return Err(CriticalError::ChecksumMismatch);
            }
        }

        let n = out.len().min(MAX_STATE_LEN);
        out[..n].copy_from_slice(&self.payload[..n]);
        Ok(n)
    }

    /// Prune every non-current file in every slot.
    pub fn cleanup(&mut self) {
        for i in 0..self.slots.len() {
            self.cleanup_slot(i);
        }
    }

    fn write_slot(&mut self, slot_idx: usize, encoded: &[u8; RECORD_LEN]) -> io::Result<()> {
        let (path, mut file) = {
            let slot = &self.slots[slot_idx];
            create_unique_file(&slot.directory, &slot.file_prefix(&self.name))?
        };

        for _ in 0..NUM_COPIES {
            if let Err(e) = file.write_all(encoded) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }
        file.sync_all()?;
        drop(file);

        let slot = &mut self.slots[slot_idx];
        slot.current = Some(path);
        slot.generation += 1;
        if slot.generation > CLEANUP_INTERVAL {
            self.cleanup_slot(slot_idx);
        }

        Ok(())
    }

    fn cleanup_slot(&mut self, slot_idx: usize) {
        let slot = &mut self.slots[slot_idx];
        if slot.current.is_none() {
            return;
        }

        let prefix = slot.file_prefix(&self.name);
        let entries = match fs::read_dir(&slot.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to scan {}: {e}", slot.directory.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            if slot.current.as_deref() == Some(path.as_path()) {
                continue;
            }
            debug!("pruning stale critical-state file {}", path.display());
            let _ = fs::remove_file(&path);
        }

        slot.generation = 0;
    }

    /// Scan both slots and adopt the record with the largest valid sequence.
    fn load(&mut self) {
        self.version = 0;
        for slot_idx in 0..self.slots.len() {
            self.load_slot(slot_idx);
        }
        self.dirty = false;
    }

    fn load_slot(&mut self, slot_idx: usize) {
        let prefix = self.slots[slot_idx].file_prefix(&self.name);
        let directory = self.slots[slot_idx].directory.clone();

        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to scan {}: {e}", directory.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }

            let path = entry.path();
            if self.load_file(&path) {
                self.slots[slot_idx].current = Some(path);
            }
        }
    }

    /// Process every record in one file. Returns true when the file held at
    /// least one valid record as new as the adopted version.
    fn load_file(&mut self, path: &Path) -> bool {
        let mut data = Vec::new();
        match File::open(path).and_then(|mut f| f.read_to_end(&mut data)) {
            Ok(_) => {}
            Err(e) => {
                warn!("failed to read {}: {e}", path.display());
                return false;
            }
        }

        if data.len() % RECORD_LEN != 0 {
            warn!("short record in {}", path.display());
        }

        let mut contributed = false;
        for chunk in data.chunks_exact(RECORD_LEN) {
            let Some(record) = Record::decode(chunk) else {
                continue;
            };
            if record.sequence < self.version {
                continue;
            }
            contributed = true;
            if record.sequence == self.version {
                continue;
            }
            self.version = record.sequence;
            self.payload = record.payload;
            self.md5 = payload_digest(&self.payload);
        }
        contributed
    }

    #[cfg(test)]
    fn corrupt_in_memory(&mut self) {
        self.payload[0] ^= 0xFF;
    }
}

/// `mkstemp`-style unique file creation under `prefix`.
fn create_unique_file(directory: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
    for _ in 0..16 {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect();
        let path = directory.join(format!("{prefix}{suffix}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "could not create a unique state file",
    ))
}
