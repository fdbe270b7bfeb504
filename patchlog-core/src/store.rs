//! Durable per-source patch storage
//!
//! Stores one source's ordered patch sequence as one file per version plus a
//! head marker, so the log supports O(1) append, range reads by version, and
//! a cheap tail verification pass on startup.
//!
//! Layout on disk:
//! ```text
//! {dir}/
//!   refs/head                 — current head version (text)
//!   patches/{version:020}.bin — one PatchRecord per version (bincode)
//! ```
//!
//! Durability contract: a record file is written and fsynced before it is
//! renamed into place, and the head marker is advanced only after the rename.
//! A crash can therefore leave an orphan record beyond the head marker (a
//! torn, unacknowledged append) but never a head marker pointing at a record
//! that is not durable. `open` removes orphans and re-verifies the tail.

use crate::error::{PatchLogError, Result};
use crate::record::{PatchId, PatchRecord};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable, ordered, integrity-checked storage for one source's patches
pub struct PatchStore {
    dir: PathBuf,
    /// Highest durably appended version (0 when empty)
    head: AtomicU64,
    /// Hash of the record at head (`PatchId::ZERO` when empty).
    /// Guarded by `append_lock` for writes; reads may briefly lag head,
    /// so append re-reads it under the lock.
    tail_hash: Mutex<PatchId>,
    /// Serializes the check-then-write section of `append`
    append_lock: Mutex<()>,
}

impl PatchStore {
    /// Open or create a patch store at the given directory.
    ///
    /// Runs tail recovery: record files beyond the persisted head are torn
    /// appends (durable but never acknowledged) and are removed; the record
    /// at head is decoded and re-verified before any new write is accepted.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join("patches"))?;
        fs::create_dir_all(dir.join("refs"))?;

        let head = Self::load_head(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            head: AtomicU64::new(head),
            tail_hash: Mutex::new(PatchId::ZERO),
            append_lock: Mutex::new(()),
        };

        store.recover_tail()?;
        Ok(store)
    }

    /// Current head version (0 when the log is empty)
    pub fn head_version(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Hash of the record at head, or `PatchId::ZERO` when empty
    pub fn tail_hash(&self) -> PatchId {
        *self.tail_hash.lock().expect("tail_hash lock poisoned")
    }

    /// Append a record at `expected_head + 1`.
    ///
    /// Fails with `VersionConflict` when `expected_head` is stale, and with
    /// `ChainCorruption` when either the stored tail no longer matches its
    /// recorded hash on re-verification or the submitted record does not
    /// chain onto the current tail. On success the record is durable before
    /// the call returns, and the new head version is returned.
    pub fn append(&self, expected_head: u64, record: &PatchRecord) -> Result<u64> {
        let _guard = self.append_lock.lock().expect("append lock poisoned");

        let head = self.head.load(Ordering::Acquire);
        if expected_head != head {
            return Err(PatchLogError::VersionConflict { current_head: head });
        }
        if record.version != head + 1 {
            return Err(PatchLogError::VersionConflict { current_head: head });
        }
        if !record.verify_digest() {
            return Err(PatchLogError::ChainCorruption {
                version: record.version,
            });
        }

        // Re-verify the stored tail before extending the chain: silent
        // corruption of the tail must fail the append, not propagate.
        let tail = if head > 0 {
            let stored = self.read_one(head)?;
            let cached = *self.tail_hash.lock().expect("tail_hash lock poisoned");
            let stored_hash = stored.hash();
            if stored_hash != cached || !stored.verify_digest() {
                return Err(PatchLogError::ChainCorruption { version: head });
            }
            stored_hash
        } else {
            PatchId::ZERO
        };

        if record.previous_hash != tail {
            return Err(PatchLogError::ChainCorruption {
                version: record.version,
            });
        }

        // Durable record write first, head advance strictly after.
        self.write_record(record)?;
        self.save_head(record.version)?;

        self.head.store(record.version, Ordering::Release);
        *self.tail_hash.lock().expect("tail_hash lock poisoned") = record.hash();

        tracing::debug!(version = record.version, "appended patch record");
        Ok(record.version)
    }

    /// Read records in `[from, to]` in ascending version order.
    ///
    /// `to = None` means "to the current head"; a `to` beyond the head is
    /// clamped. Fails with `RangeNotFound` when `from` lies outside the
    /// stored history.
    pub fn read_range(&self, from: u64, to: Option<u64>) -> Result<Vec<PatchRecord>> {
        let head = self.head.load(Ordering::Acquire);
        if from < 1 || from > head {
            return Err(PatchLogError::RangeNotFound { from, head });
        }
        let to = to.unwrap_or(head).min(head);
        if to < from {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity((to - from + 1) as usize);
        for version in from..=to {
            records.push(self.read_one(version)?);
        }
        Ok(records)
    }

    /// Read a single record by version
    pub fn read_one(&self, version: u64) -> Result<PatchRecord> {
        let path = self.record_path(version);
        let data = fs::read(&path).map_err(|e| {
            PatchLogError::Storage(format!("patch v{} not readable at {:?}: {}", version, path, e))
        })?;
        Ok(PatchRecord::from_bytes(&data)?)
    }

    /// Walk the full stored sequence, recomputing digests and chain hashes.
    ///
    /// Reports `ChainCorruption` at the first record that fails contiguity,
    /// its content digest, or its predecessor link.
    pub fn verify_chain(&self) -> Result<()> {
        let head = self.head.load(Ordering::Acquire);
        let mut previous_hash = PatchId::ZERO;

        for version in 1..=head {
            let record = self
                .read_one(version)
                .map_err(|_| PatchLogError::ChainCorruption { version })?;
            if record.version != version
                || !record.verify_digest()
                || record.previous_hash != previous_hash
            {
                return Err(PatchLogError::ChainCorruption { version });
            }
            previous_hash = record.hash();
        }
        Ok(())
    }

    // ==================== Recovery ====================

    /// Remove torn appends beyond the head marker and verify the tail record
    fn recover_tail(&self) -> Result<()> {
        let head = self.head.load(Ordering::Acquire);

        // Orphan record files beyond head were never acknowledged.
        for entry in fs::read_dir(self.dir.join("patches"))? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let version = name
                .strip_suffix(".bin")
                .and_then(|s| s.parse::<u64>().ok());
            match version {
                Some(v) if v > head => {
                    tracing::warn!(version = v, "removing torn append beyond head");
                    fs::remove_file(&path)?;
                }
                Some(_) => {}
                None => {
                    // Leftover temp file from an interrupted write
                    if name.ends_with(".tmp") {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }

        if head == 0 {
            return Ok(());
        }

        // The record at head must decode, carry the right version and digest,
        // and chain onto its predecessor.
        let tail = self
            .read_one(head)
            .map_err(|_| PatchLogError::ChainCorruption { version: head })?;
        if tail.version != head || !tail.verify_digest() {
            return Err(PatchLogError::ChainCorruption { version: head });
        }
        if head > 1 {
            let prev = self
                .read_one(head - 1)
                .map_err(|_| PatchLogError::ChainCorruption { version: head - 1 })?;
            if !tail.chains_onto(&prev) {
                return Err(PatchLogError::ChainCorruption { version: head });
            }
        } else if tail.previous_hash != PatchId::ZERO {
            return Err(PatchLogError::ChainCorruption { version: 1 });
        }

        *self.tail_hash.lock().expect("tail_hash lock poisoned") = tail.hash();
        Ok(())
    }

    // ==================== Disk I/O ====================

    fn record_path(&self, version: u64) -> PathBuf {
        self.dir.join("patches").join(format!("{:020}.bin", version))
    }

    fn head_path(&self) -> PathBuf {
        self.dir.join("refs").join("head")
    }

    fn load_head(dir: &Path) -> Result<u64> {
        let path = dir.join("refs").join("head");
        if !path.exists() {
            return Ok(0);
        }
        let text = fs::read_to_string(&path)?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| PatchLogError::Storage(format!("unparseable head marker: {}", e)))
    }

    /// Write the record file durably: temp file, fsync, rename into place
    fn write_record(&self, record: &PatchRecord) -> Result<()> {
        let path = self.record_path(record.version);
        let tmp_path = path.with_extension("tmp");
        let data = record.to_bytes()?;

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn save_head(&self, version: u64) -> Result<()> {
        let path = self.head_path();
        let tmp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(version.to_string().as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
