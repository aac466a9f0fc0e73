use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::wire::{CLASS_IN, ResourceRecord, rtype};

/// 缓存键：(记录类型, 域名)，域名大小写保持原样
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub rtype: u16,
    pub name: String,
}

impl CacheKey {
    pub fn new(rtype: u16, name: impl Into<String>) -> Self {
        Self {
            rtype,
            name: name.into(),
        }
    }

    pub fn of(record: &ResourceRecord) -> Self {
        Self::new(record.rtype, record.name.clone())
    }
}

/// Snapshot form: `"<typeCode>:<name>"`.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rtype, self.name)
    }
}

impl FromStr for CacheKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rtype, name) = s
            .split_once(':')
            .with_context(|| format!("cache key without type prefix: {s}"))?;
        let rtype = rtype
            .parse()
            .with_context(|| format!("cache key type is not a u16: {s}"))?;
        Ok(Self::new(rtype, name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub record: ResourceRecord,
    /// Seconds since the epoch.
    pub inserted_at: f64,
}

impl CacheEntry {
    /// Re-evaluated on every read; never stored.
    #[inline]
    pub fn is_live(&self, now: f64) -> bool {
        now - self.inserted_at < f64::from(self.record.ttl)
    }
}

/// One record as stored in the snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    pub data: String,
    pub ttl: u32,
    pub timestamp: f64,
    #[serde(default = "default_class", skip_serializing_if = "is_class_in")]
    pub class: u16,
}

pub type Snapshot = BTreeMap<String, Vec<SnapshotRecord>>;

impl From<&CacheEntry> for SnapshotRecord {
    fn from(entry: &CacheEntry) -> Self {
        let rr = &entry.record;
        Self {
            name: rr.name.clone(),
            rtype: rr.rtype,
            data: encode_data(rr.rtype, &rr.data),
            ttl: rr.ttl,
            timestamp: entry.inserted_at,
            class: rr.class,
        }
    }
}

impl TryFrom<SnapshotRecord> for CacheEntry {
    type Error = hex::FromHexError;

    fn try_from(rec: SnapshotRecord) -> Result<Self, Self::Error> {
        let data = decode_data(rec.rtype, &rec.data)?;
        Ok(Self {
            record: ResourceRecord {
                name: rec.name,
                rtype: rec.rtype,
                class: rec.class,
                ttl: rec.ttl,
                data,
            },
            inserted_at: rec.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    pub keys: usize,
    pub entries: usize,
    pub evicted: usize,
}

type CacheMap = FxHashMap<CacheKey, Vec<CacheEntry>>;

/// 进程级 TTL 缓存。所有读写共用一把互斥锁，锁内不做任何 I/O。
#[derive(Debug)]
pub struct CacheStore {
    entries: Mutex<CacheMap>,
    path: PathBuf,
    /// Bumped for every snapshot taken for persisting.
    generation: AtomicU64,
    /// Generation of the snapshot file on disk; held for the whole write.
    written: Arc<Mutex<u64>>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_entries(path.into(), CacheMap::default())
    }

    /// Loads the snapshot at `path`. A missing or corrupt file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_at(path, unix_now())
    }

    pub fn load_at(path: impl Into<PathBuf>, now: f64) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) => {
                    let map = live_map(snapshot, now);
                    info!(path = %path.display(), keys = map.len(), "cache snapshot loaded");
                    map
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cache snapshot corrupt, starting empty");
                    CacheMap::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no cache snapshot, starting empty");
                CacheMap::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache snapshot unreadable, starting empty");
                CacheMap::default()
            }
        };
        Self::with_entries(path, entries)
    }

    fn with_entries(path: PathBuf, entries: CacheMap) -> Self {
        Self {
            entries: Mutex::new(entries),
            path,
            generation: AtomicU64::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn lookup(&self, key: &CacheKey) -> Vec<CacheEntry> {
        self.lookup_at(key, unix_now())
    }

    /// Live entries for `key`. A key with no live entry left is removed.
    pub fn lookup_at(&self, key: &CacheKey, now: f64) -> Vec<CacheEntry> {
        let mut entries = self.entries.lock();
        let Some(list) = entries.get(key) else {
            return Vec::new();
        };
        let live: Vec<CacheEntry> = list.iter().filter(|e| e.is_live(now)).cloned().collect();
        if live.is_empty() {
            entries.remove(key);
        }
        live
    }

    #[inline]
    pub fn insert(&self, record: ResourceRecord) {
        self.insert_at(record, unix_now())
    }

    /// Appends; repeated fetches of the same record accumulate until swept.
    pub fn insert_at(&self, record: ResourceRecord, now: f64) {
        let key = CacheKey::of(&record);
        let entry = CacheEntry {
            record,
            inserted_at: now,
        };
        self.entries.lock().entry(key).or_default().push(entry);
    }

    #[inline]
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(unix_now())
    }

    pub fn sweep_at(&self, now: f64) -> SweepStats {
        let mut entries = self.entries.lock();
        let before: usize = entries.values().map(Vec::len).sum();
        entries.retain(|_, list| {
            list.retain(|e| e.is_live(now));
            !list.is_empty()
        });
        let after: usize = entries.values().map(Vec::len).sum();
        SweepStats {
            keys: entries.len(),
            entries: after,
            evicted: before - after,
        }
    }

    /// The whole map in snapshot form, expired entries included.
    pub fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.entries.lock())
    }

    /// Replaces the snapshot file with the current map. The JSON goes to a
    /// sibling temp file that is renamed over the target, one writer at a time;
    /// a write older than the file on disk is skipped.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let (generation, snapshot) = {
            let entries = self.entries.lock();
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            (generation, snapshot_of(&entries))
        };
        let json = serde_json::to_vec(&snapshot).context("serialize cache snapshot")?;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        // the blocking write keeps running even if this future is dropped, so
        // the writer lock lives inside it
        tokio::task::spawn_blocking(move || write_snapshot(&path, &json, generation, &written))
            .await
            .context("cache persist task")?
    }
}

fn snapshot_of(entries: &CacheMap) -> Snapshot {
    entries
        .iter()
        .map(|(key, list)| (key.to_string(), list.iter().map(SnapshotRecord::from).collect()))
        .collect()
}

fn write_snapshot(path: &Path, json: &[u8], generation: u64, written: &Mutex<u64>) -> anyhow::Result<()> {
    let mut on_disk = written.lock();
    if *on_disk > generation {
        return Ok(());
    }
    let tmp = temp_path(path);
    fs::write(&tmp, json).with_context(|| format!("write cache snapshot: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("replace cache snapshot: {}", path.display()))?;
    *on_disk = generation;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// 后台清理任务：按固定间隔淘汰过期记录并落盘
pub fn spawn_sweeper(store: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = store.sweep();
            if let Err(err) = store.persist().await {
                warn!(error = %err, "cache persist after sweep failed");
            }
            info!(
                keys = stats.keys,
                entries = stats.entries,
                evicted = stats.evicted,
                "cache swept"
            );
        }
    })
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn live_map(snapshot: Snapshot, now: f64) -> CacheMap {
    let mut map = CacheMap::default();
    for (raw_key, records) in snapshot {
        let key: CacheKey = match raw_key.parse() {
            Ok(k) => k,
            Err(err) => {
                warn!(key = %raw_key, error = %err, "skipping cache snapshot key");
                continue;
            }
        };
        let mut live = Vec::with_capacity(records.len());
        for rec in records {
            match CacheEntry::try_from(rec) {
                Ok(entry) if entry.is_live(now) => live.push(entry),
                Ok(_) => {}
                Err(err) => warn!(key = %raw_key, error = %err, "skipping undecodable cache record"),
            }
        }
        if !live.is_empty() {
            map.insert(key, live);
        }
    }
    map
}

fn encode_data(rtype: u16, data: &[u8]) -> String {
    match rtype {
        rtype::A => {
            if let Ok(octets) = <[u8; 4]>::try_from(data) {
                return Ipv4Addr::from(octets).to_string();
            }
        }
        rtype::AAAA => {
            if let Ok(octets) = <[u8; 16]>::try_from(data) {
                return Ipv6Addr::from(octets).to_string();
            }
        }
        _ => {}
    }
    hex::encode(data)
}

fn decode_data(rtype: u16, data: &str) -> Result<Vec<u8>, hex::FromHexError> {
    match rtype {
        rtype::A => {
            if let Ok(ip) = data.parse::<Ipv4Addr>() {
                return Ok(ip.octets().to_vec());
            }
        }
        rtype::AAAA => {
            if let Ok(ip) = data.parse::<Ipv6Addr>() {
                return Ok(ip.octets().to_vec());
            }
        }
        _ => {}
    }
    hex::decode(data)
}

fn default_class() -> u16 {
    CLASS_IN
}

fn is_class_in(class: &u16) -> bool {
    *class == CLASS_IN
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::json;

    const T0: f64 = 1_700_000_000.0;

    fn a_record(name: &str, ip: [u8; 4], ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: name.to_string(),
            rtype: rtype::A,
            class: CLASS_IN,
            ttl,
            data: ip.to_vec(),
        }
    }

    fn scratch_store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path().join("cache.json"));
        (dir, store)
    }

    #[test]
    fn cache_key_round_trips_through_snapshot_form() {
        let key = CacheKey::new(1, "example.com");
        assert_eq!(key.to_string(), "1:example.com");
        assert_eq!("1:example.com".parse::<CacheKey>().unwrap(), key);
        assert_eq!("28:".parse::<CacheKey>().unwrap(), CacheKey::new(28, ""));
        assert!("example.com".parse::<CacheKey>().is_err());
        assert!("A:example.com".parse::<CacheKey>().is_err());
    }

    #[test]
    fn lookup_honors_ttl_boundary() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("example.com", [1, 2, 3, 4], 300), T0);
        let key = CacheKey::new(rtype::A, "example.com");

        assert_eq!(store.lookup_at(&key, T0).len(), 1);
        assert_eq!(store.lookup_at(&key, T0 + 10.0).len(), 1);
        assert_eq!(store.lookup_at(&key, T0 + 299.999).len(), 1);
        assert!(store.lookup_at(&key, T0 + 300.0).is_empty());
    }

    #[test]
    fn lookup_evicts_key_without_live_entries() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("example.com", [1, 2, 3, 4], 300), T0);
        let key = CacheKey::new(rtype::A, "example.com");

        assert!(store.lookup_at(&key, T0 + 301.0).is_empty());
        assert!(store.is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn lookup_returns_live_subset_without_rewriting() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("example.com", [1, 1, 1, 1], 10), T0);
        store.insert_at(a_record("example.com", [2, 2, 2, 2], 100), T0);
        let key = CacheKey::new(rtype::A, "example.com");

        let live = store.lookup_at(&key, T0 + 50.0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].record.data, vec![2, 2, 2, 2]);
        // stale entry stays until swept
        assert_eq!(store.snapshot()["1:example.com"].len(), 2);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("Example.com", [1, 2, 3, 4], 300), T0);
        assert!(store.lookup_at(&CacheKey::new(1, "example.com"), T0).is_empty());
        assert_eq!(store.lookup_at(&CacheKey::new(1, "Example.com"), T0).len(), 1);
    }

    #[test]
    fn insert_keeps_duplicates() {
        let (_dir, store) = scratch_store();
        let rr = a_record("dup.example", [10, 0, 0, 1], 60);
        store.insert_at(rr.clone(), T0);
        store.insert_at(rr.clone(), T0 + 1.0);
        store.insert_at(rr, T0 + 2.0);

        let live = store.lookup_at(&CacheKey::new(1, "dup.example"), T0 + 3.0);
        assert_eq!(live.len(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_drops_expired_entries_and_keys() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("gone.example", [1, 1, 1, 1], 5), T0);
        store.insert_at(a_record("mixed.example", [2, 2, 2, 2], 5), T0);
        store.insert_at(a_record("mixed.example", [3, 3, 3, 3], 500), T0);
        store.insert_at(a_record("kept.example", [4, 4, 4, 4], 500), T0);

        let now = T0 + 60.0;
        let stats = store.sweep_at(now);
        assert_eq!(
            stats,
            SweepStats {
                keys: 2,
                entries: 2,
                evicted: 2
            }
        );

        let snapshot = store.snapshot();
        assert!(!snapshot.contains_key("1:gone.example"));
        assert_eq!(snapshot["1:mixed.example"].len(), 1);
        assert_eq!(snapshot["1:mixed.example"][0].data, "3.3.3.3");
        for records in snapshot.values() {
            for rec in records {
                assert!(now < rec.timestamp + f64::from(rec.ttl));
            }
        }
    }

    #[test]
    fn snapshot_uses_documented_shape() {
        let (_dir, store) = scratch_store();
        store.insert_at(a_record("example.com", [1, 2, 3, 4], 300), T0);
        store.insert_at(
            ResourceRecord {
                name: "v6.example".to_string(),
                rtype: rtype::AAAA,
                class: CLASS_IN,
                ttl: 60,
                data: Ipv6Addr::LOCALHOST.octets().to_vec(),
            },
            T0,
        );
        store.insert_at(
            ResourceRecord {
                name: "txt.example".to_string(),
                rtype: 16,
                class: 3,
                ttl: 60,
                data: vec![2, b'h', b'i'],
            },
            T0,
        );

        let value = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(
            value,
            json!({
                "1:example.com": [
                    { "name": "example.com", "type": 1, "data": "1.2.3.4", "ttl": 300, "timestamp": T0 }
                ],
                "28:v6.example": [
                    { "name": "v6.example", "type": 28, "data": "::1", "ttl": 60, "timestamp": T0 }
                ],
                "16:txt.example": [
                    { "name": "txt.example", "type": 16, "data": "026869", "ttl": 60, "timestamp": T0, "class": 3 }
                ]
            })
        );
    }

    #[tokio::test]
    async fn persist_then_load_reproduces_map() {
        let (dir, store) = scratch_store();
        store.insert_at(a_record("example.com", [1, 2, 3, 4], 300), T0);
        store.insert_at(a_record("example.com", [5, 6, 7, 8], 300), T0 + 0.25);
        store.insert_at(
            ResourceRecord {
                name: "alias.example".to_string(),
                rtype: rtype::CNAME,
                class: CLASS_IN,
                ttl: 120,
                data: vec![7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0],
            },
            T0,
        );
        store.insert_at(a_record("zero.example", [9, 9, 9, 9], 0), T0);
        store.persist().await.expect("persist");

        let loaded = CacheStore::load_at(dir.path().join("cache.json"), T0 + 0.5);
        let mut expected = store.snapshot();
        expected.remove("1:zero.example");
        assert_eq!(loaded.snapshot(), expected);

        let cname = loaded.lookup_at(&CacheKey::new(rtype::CNAME, "alias.example"), T0 + 1.0);
        assert_eq!(cname[0].record.data[0], 7);
    }

    #[test]
    fn load_drops_entries_expired_by_embedded_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let raw = json!({
            "1:old.example": [ { "name": "old.example", "type": 1, "data": "1.1.1.1", "ttl": 30, "timestamp": T0 } ],
            "1:new.example": [
                { "name": "new.example", "type": 1, "data": "2.2.2.2", "ttl": 30, "timestamp": T0 },
                { "name": "new.example", "type": 1, "data": "3.3.3.3", "ttl": 300, "timestamp": T0 }
            ]
        });
        fs::write(&path, raw.to_string()).unwrap();

        let store = CacheStore::load_at(&path, T0 + 100.0);
        assert_eq!(store.len(), 1);
        let live = store.lookup_at(&CacheKey::new(1, "new.example"), T0 + 100.0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].record.data, vec![3, 3, 3, 3]);
        assert_eq!(live[0].record.class, CLASS_IN);
    }

    #[test]
    fn load_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CacheStore::load(dir.path().join("absent.json"));
        assert!(missing.is_empty());

        let path = dir.path().join("cache.json");
        fs::write(&path, b"{ not json").unwrap();
        let corrupt = CacheStore::load(&path);
        assert!(corrupt.is_empty());
        assert_eq!(corrupt.path(), path.as_path());
    }

    #[test]
    fn load_skips_bad_keys_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let raw = json!({
            "nonsense": [ { "name": "x", "type": 1, "data": "1.1.1.1", "ttl": 30, "timestamp": T0 } ],
            "16:txt.example": [
                { "name": "txt.example", "type": 16, "data": "zz", "ttl": 30, "timestamp": T0 },
                { "name": "txt.example", "type": 16, "data": "00", "ttl": 30, "timestamp": T0 }
            ]
        });
        fs::write(&path, raw.to_string()).unwrap();

        let store = CacheStore::load_at(&path, T0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup_at(&CacheKey::new(16, "txt.example"), T0).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_are_all_kept() {
        let (_dir, store) = scratch_store();
        let store = Arc::new(store);
        let tasks = (0..64u8).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.insert(a_record("busy.example", [10, 0, 0, i], 300));
                store.lookup(&CacheKey::new(1, "busy.example")).len()
            })
        });
        for seen in join_all(tasks).await {
            assert!(seen.expect("task") >= 1);
        }
        assert_eq!(store.lookup(&CacheKey::new(1, "busy.example")).len(), 64);
    }

    #[tokio::test]
    async fn sweeper_evicts_and_persists() {
        let (dir, store) = scratch_store();
        let store = Arc::new(store);
        store.insert_at(a_record("stale.example", [1, 1, 1, 1], 1), T0);
        store.insert(a_record("fresh.example", [2, 2, 2, 2], 3600));

        let handle = spawn_sweeper(Arc::clone(&store), Duration::from_millis(20));
        let path = dir.path().join("cache.json");
        let mut written = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(raw) = fs::read_to_string(&path) {
                if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&raw) {
                    written = Some(snapshot);
                    break;
                }
            }
        }
        handle.abort();

        let written = written.expect("sweeper wrote a snapshot");
        assert!(written.contains_key("1:fresh.example"));
        assert!(!written.contains_key("1:stale.example"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_persists_leave_newest_complete_snapshot() {
        let (dir, store) = scratch_store();
        let store = Arc::new(store);
        let path = dir.path().join("cache.json");
        // a large snapshot first, so a torn write would leave trailing bytes
        for i in 0..200u8 {
            store.insert(a_record(&format!("host{i}.example"), [10, 0, 0, i], 3600));
        }
        let writers = (0..16).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.persist().await })
        });
        for res in join_all(writers).await {
            res.expect("task").expect("persist");
        }

        store.sweep_at(unix_now() + 7200.0);
        store.insert(a_record("last.example", [1, 1, 1, 1], 3600));
        store.persist().await.expect("persist");

        let raw = fs::read_to_string(&path).unwrap();
        let written: Snapshot = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(written, store.snapshot());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn stale_write_does_not_replace_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let written = Mutex::new(0);
        write_snapshot(&path, b"{\"new\":[]}", 2, &written).unwrap();
        write_snapshot(&path, b"{\"old\":[]}", 1, &written).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"new\":[]}");
        assert_eq!(*written.lock(), 2);
    }
}
