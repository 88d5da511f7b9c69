//! Content-addressed store of compiled shader blobs.
//!
//! Two maps: request fingerprint -> data fingerprint, and data fingerprint
//! -> compressed bytes. Identical outputs from different requests share one
//! blob; the duplicate writes an on-disk *reference* record whose payload is
//! the 16-byte data fingerprint instead of the bytes.
//!
//! Persistence is an append-only log (`Cache.dat`). Writers enqueue fully
//! formed records; the tick worker appends them. On startup the log is
//! replayed and rotated through `Cache.bak`/`Cache.bak2`; a corrupt log
//! falls back to the previous backup.

use std::{
    collections::{BTreeMap, VecDeque},
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::hash::Fingerprint;

const SIGNATURE: &[u8; 4] = b"SHDR";
const HEADER_LEN: usize = 28;
const MAX_DATA_SIZE: u32 = 1024 * 1024;
const FLAG_REFERENCE: u32 = 1 << 0;
const PENDING_WARN_THRESHOLD: usize = 10_000;

pub const CACHE_FILE: &str = "Cache.dat";
pub const BACKUP_FILE: &str = "Cache.bak";
pub const BACKUP_FILE_2: &str = "Cache.bak2";

#[derive(Default)]
struct CacheMaps {
    entries: BTreeMap<Fingerprint, Fingerprint>,
    data: BTreeMap<Fingerprint, Vec<u8>>,
    hits: u64,
    misses: u64,
}

pub struct CompileCache {
    cache_dir: PathBuf,
    enabled: AtomicBool,
    maps: Mutex<CacheMaps>,
    pending: Mutex<VecDeque<Vec<u8>>>,
}

impl CompileCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        CompileCache {
            cache_dir: cache_dir.into(),
            enabled: AtomicBool::new(false),
            maps: Mutex::new(CacheMaps::default()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Looks up a request fingerprint. Misses while the cache is disabled
    /// (before [`CompileCache::finalize`]) so startup loading never races a
    /// lookup.
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        let mut maps = self.maps.lock().unwrap();
        let Some(data_fp) = maps.entries.get(fingerprint).copied() else {
            maps.misses += 1;
            return None;
        };
        match maps.data.get(&data_fp).cloned() {
            Some(bytes) => {
                maps.hits += 1;
                Some(bytes)
            }
            None => {
                maps.misses += 1;
                None
            }
        }
    }

    /// Stores a compiled blob and queues its on-disk record. Silently does
    /// nothing while disabled, or for empty payloads.
    pub fn add(&self, fingerprint: Fingerprint, data: &[u8]) {
        if !self.enabled.load(Ordering::Acquire) || data.is_empty() {
            return;
        }

        let data_fp = Fingerprint::of(data);
        let record = {
            let mut maps = self.maps.lock().unwrap();
            maps.entries.insert(fingerprint, data_fp);
            if maps.data.contains_key(&data_fp) {
                // Blob already stored once; only a reference goes to disk.
                encode_record(&fingerprint, FLAG_REFERENCE, data_fp.as_bytes())
            } else {
                maps.data.insert(data_fp, data.to_vec());
                encode_record(&fingerprint, 0, data)
            }
        };

        let mut pending = self.pending.lock().unwrap();
        pending.push_back(record);
        if pending.len() > PENDING_WARN_THRESHOLD {
            warn!(
                pending = pending.len(),
                "cache append queue is backing up; entries not yet saved to disk"
            );
        }
    }

    /// Replays one log file into the in-memory maps.
    ///
    /// Returns `false` when the file cannot be opened or a record is
    /// malformed; everything accepted up to that point is kept. A clean EOF
    /// or a truncated tail (the crash case) is not an error.
    pub fn load_cache_file(&self, path: &Path) -> bool {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        info!(path = %path.display(), "loading shader cache");
        let mut reader = BufReader::new(file);
        let mut maps = self.maps.lock().unwrap();

        let mut record = 0u64;
        let mut offset = 0u64;
        let mut shared = 0u64;
        loop {
            let mut header = [0u8; HEADER_LEN];
            if !read_full(&mut reader, &mut header) {
                break;
            }

            if &header[0..4] != SIGNATURE {
                warn!(record, offset, "invalid entry: bad signature; dropping the log tail");
                return false;
            }
            let data_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let flags = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let mut hash_bytes = [0u8; 16];
            hash_bytes.copy_from_slice(&header[12..28]);
            let request_fp = Fingerprint::from_bytes(hash_bytes);

            if data_size == 0 || data_size > MAX_DATA_SIZE {
                warn!(record, offset, data_size, "invalid entry: bad data size; dropping the log tail");
                return false;
            }

            let mut payload = vec![0u8; data_size as usize];
            if !read_full(&mut reader, &mut payload) {
                // Truncated tail from an interrupted append; keep what we have.
                break;
            }

            if flags & FLAG_REFERENCE != 0 {
                if data_size as usize != Fingerprint::LEN {
                    warn!(record, offset, data_size, "invalid reference entry size; dropping the log tail");
                    return false;
                }
                let mut target_bytes = [0u8; 16];
                target_bytes.copy_from_slice(&payload);
                let target = Fingerprint::from_bytes(target_bytes);
                if maps.data.contains_key(&target) {
                    maps.entries.insert(request_fp, target);
                    shared += 1;
                } else {
                    // The referenced blob never made it to disk. Skip just
                    // this record; the request recompiles once and re-enters
                    // the cache.
                    warn!(record, offset, "reference entry targets missing data; skipping");
                }
            } else {
                let data_fp = Fingerprint::of(&payload);
                maps.entries.insert(request_fp, data_fp);
                if maps.data.contains_key(&data_fp) {
                    shared += 1;
                } else {
                    maps.data.insert(data_fp, payload);
                }
            }

            record += 1;
            offset += (HEADER_LEN as u64) + data_size as u64;
        }

        info!(
            records = record,
            entries = maps.entries.len(),
            blobs = maps.data.len(),
            shared,
            "shader cache loaded"
        );
        true
    }

    /// Replays `Cache.dat`, rotates the backups, and enables the cache.
    ///
    /// Rotation on success: `Cache.bak2` is dropped, `Cache.bak` becomes
    /// `Cache.bak2`, and `Cache.dat` is copied to `Cache.bak`. On a corrupt
    /// log the backup is promoted and loaded instead; if that fails too the
    /// cache starts empty.
    pub fn startup(&self) {
        let dat = self.cache_dir.join(CACHE_FILE);
        let bak = self.cache_dir.join(BACKUP_FILE);
        let bak2 = self.cache_dir.join(BACKUP_FILE_2);

        if self.load_cache_file(&dat) {
            let _ = std::fs::remove_file(&bak2);
            let _ = std::fs::rename(&bak, &bak2);
            if let Err(error) = std::fs::copy(&dat, &bak) {
                warn!(%error, "could not write cache backup");
            }
        } else {
            if dat.exists() {
                warn!("cache file is corrupt; restoring from backup");
                let _ = std::fs::remove_file(&dat);
            }
            let _ = std::fs::copy(&bak, &dat);
            if !self.load_cache_file(&dat) {
                warn!("cache backup unusable; starting with an empty cache");
                let _ = std::fs::remove_file(&dat);
            }
        }

        self.finalize();
    }

    /// Flips the cache live. Lookups before this return misses and writes
    /// are dropped, which makes the startup load safe against in-flight
    /// requests.
    pub fn finalize(&self) {
        self.enabled.store(true, Ordering::Release);
        info!("caching enabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Drains the pending queue into `Cache.dat`. Driven by the tick worker;
    /// processes the whole queue each call. Append failures are logged and
    /// the record is dropped; the in-memory entry already serves requests.
    pub async fn flush_pending(&self) {
        let path = self.cache_dir.join(CACHE_FILE);
        loop {
            let record = {
                let mut pending = self.pending.lock().unwrap();
                pending.pop_front()
            };
            let Some(record) = record else { break };
            if let Err(error) = append_record(&path, &record).await {
                warn!(path = %path.display(), %error, "failed to append cache record");
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn hits(&self) -> u64 {
        self.maps.lock().unwrap().hits
    }

    pub fn misses(&self) -> u64 {
        self.maps.lock().unwrap().misses
    }

    pub fn entry_count(&self) -> usize {
        self.maps.lock().unwrap().entries.len()
    }

    pub fn blob_count(&self) -> usize {
        self.maps.lock().unwrap().data.len()
    }

    /// Copies of both maps, for diagnostics and persistence tests.
    pub fn snapshot(
        &self,
    ) -> (
        BTreeMap<Fingerprint, Fingerprint>,
        BTreeMap<Fingerprint, Vec<u8>>,
    ) {
        let maps = self.maps.lock().unwrap();
        (maps.entries.clone(), maps.data.clone())
    }
}

fn encode_record(request_fp: &Fingerprint, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(SIGNATURE);
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&flags.to_le_bytes());
    record.extend_from_slice(request_fp.as_bytes());
    record.extend_from_slice(payload);
    record
}

/// Reads the full buffer; `false` on EOF or a short tail.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> bool {
    match reader.read_exact(buf) {
        Ok(()) => true,
        Err(_) => false,
    }
}

async fn append_record(path: &Path, record: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(record).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_cache(dir: &Path) -> CompileCache {
        let cache = CompileCache::new(dir);
        cache.finalize();
        cache
    }

    #[test]
    fn disabled_cache_misses_and_drops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompileCache::new(dir.path());
        let fp = Fingerprint::of(b"request");
        cache.add(fp, b"blob");
        assert_eq!(cache.find(&fp), None);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn find_returns_latest_add() {
        let dir = tempfile::tempdir().unwrap();
        let cache = enabled_cache(dir.path());
        let fp = Fingerprint::of(b"request");
        cache.add(fp, b"first blob");
        cache.add(fp, b"second blob");
        assert_eq!(cache.find(&fp).unwrap(), b"second blob");
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn duplicate_blob_shares_data_and_writes_reference_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = enabled_cache(dir.path());
        cache.add(Fingerprint::of(b"request-a"), b"same output");
        cache.add(Fingerprint::of(b"request-b"), b"same output");

        assert_eq!(cache.entry_count(), 2);
        assert_eq!(cache.blob_count(), 1);
        assert_eq!(cache.pending_len(), 2);

        // The second record must be the 16-byte reference form.
        let second = cache.pending.lock().unwrap().back().unwrap().clone();
        let flags = u32::from_le_bytes([second[8], second[9], second[10], second[11]]);
        assert_eq!(flags & FLAG_REFERENCE, FLAG_REFERENCE);
        assert_eq!(second.len(), HEADER_LEN + Fingerprint::LEN);
    }

    #[test]
    fn blob_count_never_exceeds_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = enabled_cache(dir.path());
        for i in 0..20u8 {
            cache.add(Fingerprint::of(&[i]), &[i % 4]);
        }
        assert!(cache.blob_count() <= cache.entry_count());
    }

    #[test]
    fn empty_payload_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = enabled_cache(dir.path());
        cache.add(Fingerprint::of(b"request"), b"");
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn concurrent_adds_all_reach_the_pending_queue() {
        let dir = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(enabled_cache(dir.path()));

        let mut handles = Vec::new();
        for writer in 0..8u32 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u32 {
                    let key = writer * 1000 + i;
                    cache.add(Fingerprint::of(&key.to_le_bytes()), &key.to_le_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.pending_len(), 8 * 50);
        assert_eq!(cache.entry_count(), 8 * 50);
    }

    #[test]
    fn load_rejects_bad_signature_but_keeps_prior_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);

        let mut bytes = encode_record(&Fingerprint::of(b"good"), 0, b"payload");
        bytes.extend_from_slice(b"GARBAGE-NOT-A-HEADER........");
        std::fs::write(&path, &bytes).unwrap();

        let cache = CompileCache::new(dir.path());
        assert!(!cache.load_cache_file(&path));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn load_tolerates_a_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);

        let mut bytes = encode_record(&Fingerprint::of(b"good"), 0, b"payload");
        let partial = encode_record(&Fingerprint::of(b"cut"), 0, b"lost payload");
        bytes.extend_from_slice(&partial[..HEADER_LEN + 4]);
        std::fs::write(&path, &bytes).unwrap();

        let cache = CompileCache::new(dir.path());
        assert!(cache.load_cache_file(&path));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn reference_to_missing_blob_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);

        let missing = Fingerprint::of(b"never stored");
        let mut bytes = encode_record(&Fingerprint::of(b"orphan"), FLAG_REFERENCE, missing.as_bytes());
        bytes.extend_from_slice(&encode_record(&Fingerprint::of(b"good"), 0, b"payload"));
        std::fs::write(&path, &bytes).unwrap();

        let cache = CompileCache::new(dir.path());
        assert!(cache.load_cache_file(&path));
        // The orphan reference is dropped, the later record loads, and no
        // entry points at a missing blob.
        let (entries, data) = cache.snapshot();
        assert_eq!(entries.len(), 1);
        assert!(entries.values().all(|fp| data.contains_key(fp)));
    }
}
