//! Persistent Tier Module
//!
//! One file per key under the cache directory. Each file holds a small header
//! (magic bytes and format version) followed by a bincode-encoded record.
//! Writes go through a uniquely named temporary file and an atomic rename, so
//! concurrent writers to the same key resolve to last-write-wins and readers
//! never observe a partially written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::codec;
use crate::cache::CacheEntry;
use crate::error::CacheError;

/// Magic bytes identifying a persisted cache record.
const RECORD_MAGIC: [u8; 4] = *b"PACR";

/// Increment on breaking changes to the record layout.
const RECORD_FORMAT_VERSION: u32 = 1;

const RECORD_EXT: &str = "rec";
const TMP_EXT: &str = "tmp";

/// On-disk representation of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRecord {
    key: String,
    value: Vec<u8>,
    created_at: u64,
    ttl_ms: u64,
    checksum: String,
    compressed: bool,
}

impl From<&CacheEntry> for PersistedRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.data.clone(),
            created_at: entry.created_at,
            ttl_ms: entry.ttl_ms,
            checksum: entry.checksum.clone(),
            compressed: entry.compressed,
        }
    }
}

impl From<PersistedRecord> for CacheEntry {
    fn from(record: PersistedRecord) -> Self {
        Self {
            key: record.key,
            data: record.value,
            created_at: record.created_at,
            ttl_ms: record.ttl_ms,
            access_count: 0,
            last_accessed_at: record.created_at,
            compressed: record.compressed,
            checksum: record.checksum,
            lru_tick: 0,
        }
    }
}

/// Outcome of a persistent-tier sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Keys removed because their TTL elapsed
    pub expired: Vec<String>,
    /// Files removed because they could not be decoded
    pub corrupt: usize,
    /// Records removed to get back under the byte budget
    pub trimmed: usize,
}

// == Disk Tier ==
/// File-backed persistent tier.
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    max_bytes: u64,
    tmp_counter: AtomicU64,
}

impl DiskTier {
    /// Opens (creating if needed) a tier rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            max_bytes,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `key`. Keys are hashed so any string is a
    /// valid key regardless of filesystem rules.
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", codec::checksum(key.as_bytes())))
    }

    // == Write ==
    /// Persists an entry, replacing any previous record for its key.
    pub async fn write(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = encode_record(&PersistedRecord::from(entry))?;
        let path = self.record_path(&entry.key);
        let tmp = self.dir.join(format!(
            "{}.{}.{}.{TMP_EXT}",
            codec::checksum(entry.key.as_bytes()),
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| CacheError::Io {
                path: tmp.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::Io { path, source });
        }
        Ok(())
    }

    // == Read ==
    /// Reads the record for `key`.
    ///
    /// Returns `Ok(None)` when no record exists and `Err(CorruptRecord)` when
    /// the file exists but cannot be decoded or belongs to another key.
    /// Checksum verification is left to the caller.
    pub async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.record_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let record = decode_record(&raw).map_err(|reason| CacheError::CorruptRecord {
            path: path.clone(),
            reason,
        })?;
        if record.key != key {
            return Err(CacheError::CorruptRecord {
                path,
                reason: format!("record belongs to key '{}'", record.key),
            });
        }
        Ok(Some(record.into()))
    }

    // == Remove ==
    /// Deletes the record for `key`. Returns whether a file was removed.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.record_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Deletes the record file for `key` without consulting its contents.
    pub async fn purge(&self, key: &str) {
        if let Err(e) = self.remove(key).await {
            debug!("failed to purge record for {}: {}", key, e);
        }
    }

    /// Removes every record and temporary file. Returns the number removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (path, _) in self.list_files().await? {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // == Sweep ==
    /// Removes expired and undecodable records, then trims the oldest records
    /// until the tier fits its byte budget.
    pub async fn sweep(&self, now: u64) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        let mut live: Vec<(PathBuf, u64, u64)> = Vec::new();

        for (path, len) in self.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Ok(raw) = tokio::fs::read(&path).await else {
                continue;
            };
            match decode_record(&raw) {
                Ok(record) => {
                    let entry = CacheEntry::from(record);
                    if entry.is_valid_at(now) {
                        live.push((path, entry.created_at, len));
                    } else if tokio::fs::remove_file(&path).await.is_ok() {
                        report.expired.push(entry.key);
                    }
                }
                Err(reason) => {
                    debug!("removing undecodable record {}: {}", path.display(), reason);
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        report.corrupt += 1;
                    }
                }
            }
        }

        let mut total: u64 = live.iter().map(|(_, _, len)| len).sum();
        if total > self.max_bytes {
            live.sort_by_key(|(_, created_at, _)| *created_at);
            for (path, _, len) in live {
                if total <= self.max_bytes {
                    break;
                }
                if tokio::fs::remove_file(&path).await.is_ok() {
                    total -= len;
                    report.trimmed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Total size of all files in the tier.
    pub async fn size_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.list_files().await?.iter().map(|(_, len)| len).sum())
    }

    async fn list_files(&self) -> Result<Vec<(PathBuf, u64)>, CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        while let Some(item) = dir.next_entry().await.map_err(io_err)? {
            let path = item.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some(RECORD_EXT) && ext != Some(TMP_EXT) {
                continue;
            }
            let len = item.metadata().await.map(|m| m.len()).unwrap_or(0);
            files.push((path, len));
        }
        Ok(files)
    }
}

// == Record Encoding ==
fn encode_record(record: &PersistedRecord) -> Result<Vec<u8>, CacheError> {
    let body = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&RECORD_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_record(raw: &[u8]) -> Result<PersistedRecord, String> {
    if raw.len() < 8 {
        return Err("record shorter than header".to_string());
    }
    if raw[..4] != RECORD_MAGIC {
        return Err("bad magic bytes".to_string());
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&raw[4..8]);
    let version = u32::from_le_bytes(version);
    if version != RECORD_FORMAT_VERSION {
        return Err(format!(
            "format version {version}, expected {RECORD_FORMAT_VERSION}"
        ));
    }

    let (record, consumed): (PersistedRecord, usize) =
        bincode::serde::decode_from_slice(&raw[8..], bincode::config::standard())
            .map_err(|e| e.to_string())?;
    if consumed != raw.len() - 8 {
        return Err("trailing bytes after record".to_string());
    }
    Ok(record)
}
