//! Persistent key/value cache with time-based expiry.
//!
//! Entries live in memory and as one JSON file each under the cache
//! directory, named by the blake3 of the normalized key. Writes go through a
//! temp file and rename so a crash never leaves a half-written entry behind.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl CacheEntry {
    fn ttl(&self) -> Option<Duration> {
        Duration::try_seconds(self.ttl_secs).filter(|ttl| *ttl > Duration::zero())
    }

    /// An entry with an unusable TTL counts as expired.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl() {
            Some(ttl) => now.signed_duration_since(self.created_at) > ttl,
            None => true,
        }
    }
}

/// Trim, lower-case and replace whitespace runs with `_`.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field("ttl_secs", &self.ttl.num_seconds())
            .finish()
    }
}

impl CacheStore {
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, CacheError> {
        Self::open_with_clock(dir, ttl, Arc::new(SystemClock))
    }

    /// Open the store, loading every readable entry. Corrupt entry files are
    /// removed; expired ones are swept.
    pub fn open_with_clock(
        dir: impl Into<PathBuf>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let mut entries = HashMap::new();
        let listing = fs::read_dir(&dir).map_err(|e| CacheError::io(&dir, e))?;
        for item in listing {
            let path = match item {
                Ok(item) => item.path(),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable cache directory entry");
                    continue;
                }
            };
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            match load_entry(&path) {
                Ok(entry) => {
                    entries.insert(normalize_key(&entry.key), entry);
                }
                Err(reason) => {
                    tracing::warn!(path = %path.display(), reason = %reason, "Removing corrupt cache entry");
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove corrupt cache entry");
                    }
                }
            }
        }

        let store = Self {
            dir,
            ttl,
            clock,
            entries: Mutex::new(entries),
        };
        let evicted = store.evict_expired();
        tracing::debug!(
            dir = %store.dir.display(),
            entries = store.len(),
            evicted,
            "Cache store opened"
        );
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_path(&self, normalized_key: &str) -> PathBuf {
        let name = blake3::hash(normalized_key.as_bytes()).to_hex();
        self.dir.join(format!("{}.json", name))
    }

    /// Value for `key`, or `None` when missing or expired. Expired entries are
    /// dropped from memory and disk.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let normalized = normalize_key(key);
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired = match entries.get(&normalized) {
            None => return None,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            entries.remove(&normalized);
            self.remove_file(&normalized);
            tracing::debug!(key = %normalized, "Cache entry expired");
            return None;
        }
        entries.get(&normalized).map(|entry| entry.value.clone())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(key = %normalize_key(key), error = %e, "Cache value has unexpected shape");
                None
            }
        }
    }

    /// Insert or overwrite. The entry's creation time is the clock's now.
    pub fn put(&self, key: &str, value: serde_json::Value) -> Result<(), CacheError> {
        let normalized = normalize_key(key);
        let entry = CacheEntry {
            key: normalized.clone(),
            value,
            created_at: self.clock.now(),
            ttl_secs: self.ttl.num_seconds(),
        };
        let path = self.entry_path(&normalized);
        let bytes = serde_json::to_vec_pretty(&entry)?;

        // Disk and memory are updated under one lock so they never disagree.
        let mut entries = self.lock();
        write_atomic(&path, &bytes)?;
        entries.insert(normalized, entry);
        Ok(())
    }

    pub fn put_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.put(key, serde_json::to_value(value)?)
    }

    /// Drop every entry from memory and disk.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        let listing = fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        for item in listing.flatten() {
            let path = item.path();
            let is_entry = path.extension().map(|ext| ext == "json" || ext == "tmp").unwrap_or(false);
            if is_entry {
                fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
            }
        }
        tracing::info!(dir = %self.dir.display(), removed = count, "Cache cleared");
        Ok(count)
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            self.remove_file(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn remove_file(&self, normalized_key: &str) {
        let path = self.entry_path(normalized_key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache entry file");
            }
        }
    }
}

fn load_entry(path: &Path) -> Result<CacheEntry, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if entry.ttl().is_none() {
        return Err(format!("ttl_secs out of range: {}", entry.ttl_secs));
    }
    Ok(entry)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| CacheError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CacheError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CacheError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| CacheError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn open(dir: &TempDir, clock: Arc<ManualClock>) -> CacheStore {
        CacheStore::open_with_clock(dir.path(), Duration::days(30), clock).unwrap()
    }

    #[test]
    fn test_entry_present_at_29_days_absent_at_31() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let store = open(&dir, clock.clone());

        store.put("Some Title", json!({"total": 12})).unwrap();

        clock.advance(Duration::days(29));
        assert_eq!(store.get("Some Title"), Some(json!({"total": 12})));

        clock.advance(Duration::days(2));
        assert_eq!(store.get("Some Title"), None);
        assert!(store.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_keys_are_normalized() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(start())));
        store.put("  Đấu Phá  Thương Khung ", json!(1)).unwrap();
        assert_eq!(store.get("đấu phá thương khung"), Some(json!(1)));
        assert_eq!(normalize_key(" A  b\tC "), "a_b_c");
    }

    #[test]
    fn test_persists_across_reopen_and_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        {
            let store = open(&dir, clock.clone());
            store.put("k", json!("first")).unwrap();
            store.put("k", json!("second")).unwrap();
        }
        let store = open(&dir, clock);
        assert_eq!(store.get("k"), Some(json!("second")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_isolated() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        {
            let store = open(&dir, clock.clone());
            store.put("good", json!(true)).unwrap();
        }
        let corrupt = dir.path().join("deadbeef.json");
        std::fs::write(&corrupt, b"{ truncated").unwrap();

        let store = open(&dir, clock);
        assert_eq!(store.get("good"), Some(json!(true)));
        assert!(!corrupt.exists());
    }

    #[test]
    fn test_entry_with_unusable_ttl_is_isolated() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        {
            let store = open(&dir, clock.clone());
            store.put("good", json!(true)).unwrap();
        }
        let huge = dir.path().join("huge.json");
        std::fs::write(
            &huge,
            br#"{"key":"huge","value":1,"created_at":"2024-01-01T00:00:00Z","ttl_secs":9223372036854775807}"#,
        )
        .unwrap();
        let negative = dir.path().join("negative.json");
        std::fs::write(
            &negative,
            br#"{"key":"negative","value":1,"created_at":"2024-01-01T00:00:00Z","ttl_secs":-5}"#,
        )
        .unwrap();

        let store = open(&dir, clock);
        assert_eq!(store.get("good"), Some(json!(true)));
        assert_eq!(store.get("huge"), None);
        assert_eq!(store.len(), 1);
        assert!(!huge.exists());
        assert!(!negative.exists());
    }

    #[test]
    fn test_expired_entries_swept_on_open() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        {
            let store = open(&dir, clock.clone());
            store.put("old", json!(1)).unwrap();
        }
        clock.advance(Duration::days(31));
        let store = open(&dir, clock);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(start())));
        store.put("a", json!(1)).unwrap();
        store.put("b", json!(2)).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.get("a").is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_typed_access() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Hint {
            chapters: u32,
        }
        let dir = TempDir::new().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(start())));
        store.put_as("h", &Hint { chapters: 7 }).unwrap();
        assert_eq!(store.get_as::<Hint>("h"), Some(Hint { chapters: 7 }));
        assert_eq!(store.get_as::<Vec<u8>>("h"), None);
    }
}
