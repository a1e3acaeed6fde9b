//! RocksDB-backed storage engine.
//!
//! Exposes the primitive vocabulary the core is written against:
//! hashes, lists, sorted sets, TTL'd strings, counters, and an atomic
//! multi-command commit with ordered pub/sub side effects.
//!
//! Column families:
//! - `hashes`  — hash fields, keyed `key \0 field`
//! - `lists`   — length record at `key`, entries at `key \0 index`
//! - `zsets`   — member records and a score-ordered index
//! - `strings` — values prefixed with an 8-byte expiry (0 = none)
//! - `meta`    — counters
//!
//! A [`Multi`] accumulates commands and commits them as one
//! `WriteBatch` under the engine's commit lock; read-modify-write
//! commands resolve against the committed state inside the lock, so a
//! `Multi` is atomic and isolated. Publishes queued on a `Multi` are
//! delivered after its batch is written, in queue order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use tokio::sync::broadcast;

use super::pubsub::{PubSub, Published};

const CF_HASHES: &str = "hashes";
const CF_LISTS: &str = "lists";
const CF_ZSETS: &str = "zsets";
const CF_STRINGS: &str = "strings";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_HASHES, CF_LISTS, CF_ZSETS, CF_STRINGS, CF_META];

const SEP: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync every write (batched otherwise)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("liveboard_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing: small caches at a temp path.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// A conditional command's target was missing
    NotFound(String),
    /// A conditional command's target already existed
    Conflict(String),
    /// Value failed to encode
    Serialization(String),
    /// Stored bytes failed to decode
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::NotFound(k) => write!(f, "not found: {k}"),
            Self::Conflict(k) => write!(f, "conflict: {k}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt value: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Database(e.to_string())
    }
}

struct StoreInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes commits so read-modify-write stays isolated
    commit_lock: Mutex<()>,
    pubsub: PubSub,
}

/// Cheap-to-clone handle on the engine.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open the store at the configured path, creating column families
    /// as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                config,
                commit_lock: Mutex::new(()),
                pubsub: PubSub::new(),
            }),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.inner.config.path
    }

    // ─── Hashes ───────────────────────────────────────────────────────

    pub fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_HASHES)?;
        self.inner.db.put_cf(&cf, hash_key(key, field), value)?;
        Ok(())
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_HASHES)?;
        Ok(self.inner.db.get_cf(&cf, hash_key(key, field))?)
    }

    pub fn hash_exists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self.hash_get(key, field)?.is_some())
    }

    pub fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_HASHES)?;
        self.inner.db.delete_cf(&cf, hash_key(key, field))?;
        Ok(())
    }

    /// All fields of a hash in field order.
    pub fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_HASHES)?;
        let mut prefix = key.as_bytes().to_vec();
        prefix.push(SEP);

        let mut out = Vec::new();
        let iter = self
            .inner
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            let field = String::from_utf8(k[prefix.len()..].to_vec())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            out.push((field, v.to_vec()));
        }
        Ok(out)
    }

    // ─── Lists ────────────────────────────────────────────────────────

    pub fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LISTS)?;
        Ok(match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => decode_u64(&raw)?,
            None => 0,
        })
    }

    /// Append to a list, returning the index assigned.
    pub fn list_push(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let index = self.list_len(key)?;
        let cf = self.cf(CF_LISTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, list_entry_key(key, index), value);
        batch.put_cf(&cf, key.as_bytes(), (index + 1).to_be_bytes());
        self.write_batch(batch)?;
        Ok(index)
    }

    /// Entries in `[from, to)`. `u64::MAX` means "to the end".
    pub fn list_range(&self, key: &str, from: u64, to: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let len = self.list_len(key)?;
        let to = to.min(len);
        if from >= to {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_LISTS)?;
        let mut out = Vec::with_capacity((to - from) as usize);
        for i in from..to {
            match self.inner.db.get_cf(&cf, list_entry_key(key, i))? {
                Some(v) => out.push(v),
                None => return Err(StoreError::Corrupt(format!("list {key} gap at {i}"))),
            }
        }
        Ok(out)
    }

    /// List keys (length records) starting with a prefix. Used by
    /// startup scans.
    pub fn scan_list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_LISTS)?;
        let mut out = Vec::new();
        let iter = self.inner.db.iterator_cf(
            &cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            // Entry keys embed a separator; length records do not.
            if k.contains(&SEP) {
                continue;
            }
            out.push(
                String::from_utf8(k.to_vec()).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            );
        }
        Ok(out)
    }

    // ─── Sorted sets ──────────────────────────────────────────────────

    pub fn zset_add(&self, key: &str, member: &str, score: u64) -> Result<(), StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let mut batch = WriteBatch::default();
        self.zset_add_to_batch(&mut batch, key, member, score)?;
        self.write_batch(batch)
    }

    fn zset_add_to_batch(
        &self,
        batch: &mut WriteBatch,
        key: &str,
        member: &str,
        score: u64,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_ZSETS)?;
        let member_key = zset_member_key(key, member);
        if let Some(old) = self.inner.db.get_cf(&cf, &member_key)? {
            let old_score = decode_u64(&old)?;
            batch.delete_cf(&cf, zset_score_key(key, old_score, member));
        }
        batch.put_cf(&cf, &member_key, score.to_be_bytes());
        batch.put_cf(&cf, zset_score_key(key, score, member), member.as_bytes());
        Ok(())
    }

    pub fn zset_rem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let cf = self.cf(CF_ZSETS)?;
        let member_key = zset_member_key(key, member);
        if let Some(old) = self.inner.db.get_cf(&cf, &member_key)? {
            let old_score = decode_u64(&old)?;
            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf, zset_score_key(key, old_score, member));
            batch.delete_cf(&cf, member_key);
            self.write_batch(batch)?;
        }
        Ok(())
    }

    pub fn zset_card(&self, key: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ZSETS)?;
        let mut prefix = key.as_bytes().to_vec();
        prefix.push(SEP);
        prefix.push(b'm');
        prefix.push(SEP);

        let mut count = 0;
        let iter = self
            .inner
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Members ordered by descending score.
    pub fn zset_range_desc(&self, key: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let cf = self.cf(CF_ZSETS)?;
        let mut prefix = key.as_bytes().to_vec();
        prefix.push(SEP);
        prefix.push(b's');
        prefix.push(SEP);

        let mut out = Vec::new();
        let iter = self
            .inner
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            if k.len() < prefix.len() + 8 {
                return Err(StoreError::Corrupt(format!("short zset index key in {key}")));
            }
            let score = decode_u64(&k[prefix.len()..prefix.len() + 8])?;
            let member =
                String::from_utf8(v.to_vec()).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            out.push((member, score));
        }
        out.reverse();
        Ok(out)
    }

    // ─── Strings with TTL ─────────────────────────────────────────────

    pub fn string_set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_STRINGS)?;
        self.inner
            .db
            .put_cf(&cf, key.as_bytes(), encode_string(value, ttl))?;
        Ok(())
    }

    pub fn string_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_STRINGS)?;
        match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => match decode_string(&raw)? {
                Some(v) => Ok(Some(v)),
                None => {
                    // Expired; reap lazily.
                    self.inner.db.delete_cf(&cf, key.as_bytes())?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn string_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.string_get(key)?.is_some())
    }

    pub fn string_del(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_STRINGS)?;
        self.inner.db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    /// Append to a string value, preserving its expiry.
    pub fn string_append(&self, key: &str, suffix: &[u8]) -> Result<(), StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let cf = self.cf(CF_STRINGS)?;
        let (expiry, mut value) = match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => match decode_string(&raw)? {
                Some(v) => (decode_u64(&raw[..8])?, v),
                None => (0, Vec::new()),
            },
            None => (0, Vec::new()),
        };
        value.extend_from_slice(suffix);
        let mut raw = expiry.to_be_bytes().to_vec();
        raw.extend_from_slice(&value);
        self.inner.db.put_cf(&cf, key.as_bytes(), raw)?;
        Ok(())
    }

    /// Increment a numeric string under a TTL window. The window is
    /// set when the value is first created and kept on later bumps.
    pub fn string_incr(&self, key: &str, by: u64, ttl: Duration) -> Result<u64, StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let cf = self.cf(CF_STRINGS)?;
        let (expiry, current) = match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => match decode_string(&raw)? {
                Some(v) => (decode_u64(&raw[..8])?, decode_u64(&v)?),
                None => (0, 0),
            },
            None => (0, 0),
        };
        let expiry = if expiry == 0 {
            now_millis() + ttl.as_millis() as u64
        } else {
            expiry
        };
        let next = current + by;
        let mut raw = expiry.to_be_bytes().to_vec();
        raw.extend_from_slice(&next.to_be_bytes());
        self.inner.db.put_cf(&cf, key.as_bytes(), raw)?;
        Ok(next)
    }

    // ─── Counters ─────────────────────────────────────────────────────

    /// Atomically add to a counter, returning the new value. Negative
    /// deltas saturate at zero.
    pub fn incr(&self, key: &str, by: i64) -> Result<u64, StoreError> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        let next = self.incr_locked(key, by)?;
        Ok(next)
    }

    fn incr_locked(&self, key: &str, by: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        let current = match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => decode_u64(&raw)?,
            None => 0,
        };
        let next = if by >= 0 {
            current + by as u64
        } else {
            current.saturating_sub(by.unsigned_abs())
        };
        self.inner.db.put_cf(&cf, key.as_bytes(), next.to_be_bytes())?;
        Ok(next)
    }

    pub fn counter(&self, key: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(match self.inner.db.get_cf(&cf, key.as_bytes())? {
            Some(raw) => decode_u64(&raw)?,
            None => 0,
        })
    }

    // ─── Pub/sub ──────────────────────────────────────────────────────

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Published> {
        self.inner.pubsub.subscribe(channel)
    }

    pub fn psubscribe(&self, pattern: &str) -> broadcast::Receiver<Published> {
        self.inner.pubsub.psubscribe(pattern)
    }

    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        self.inner.pubsub.publish(channel, payload)
    }

    // ─── Multi ────────────────────────────────────────────────────────

    /// Start accumulating an atomic command group.
    pub fn multi(&self) -> Multi {
        Multi {
            store: self.clone(),
            cmds: Vec::new(),
            publishes: Vec::new(),
        }
    }
}

enum Cmd {
    HashSet {
        key: String,
        field: String,
        value: Vec<u8>,
    },
    /// Fails the whole commit if the field already exists
    HashSetNx {
        key: String,
        field: String,
        value: Vec<u8>,
    },
    HashDel {
        key: String,
        field: String,
    },
    HashDelAll {
        key: String,
    },
    /// Fails the whole commit if the field is missing; deletes it
    HashTake {
        key: String,
        field: String,
    },
    StringSet {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Fails the whole commit if the key is missing or expired;
    /// deletes it
    StringTake {
        key: String,
    },
    StringDel {
        key: String,
    },
    ListPush {
        key: String,
        value: Vec<u8>,
    },
    ListSet {
        key: String,
        index: u64,
        value: Vec<u8>,
    },
    ListRemove {
        key: String,
        value: Vec<u8>,
    },
    ZsetAdd {
        key: String,
        member: String,
        score: u64,
    },
    IncrBy {
        key: String,
        by: i64,
    },
}

/// Accumulated command group, committed atomically.
pub struct Multi {
    store: Store,
    cmds: Vec<Cmd>,
    publishes: Vec<(String, String)>,
}

impl Multi {
    pub fn hash_set(mut self, key: &str, field: &str, value: impl Into<Vec<u8>>) -> Self {
        self.cmds.push(Cmd::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hash_set_nx(mut self, key: &str, field: &str, value: impl Into<Vec<u8>>) -> Self {
        self.cmds.push(Cmd::HashSetNx {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hash_del(mut self, key: &str, field: &str) -> Self {
        self.cmds.push(Cmd::HashDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn hash_del_all(mut self, key: &str) -> Self {
        self.cmds.push(Cmd::HashDelAll { key: key.into() });
        self
    }

    pub fn hash_take(mut self, key: &str, field: &str) -> Self {
        self.cmds.push(Cmd::HashTake {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn string_set(mut self, key: &str, value: impl Into<Vec<u8>>, ttl: Option<Duration>) -> Self {
        self.cmds.push(Cmd::StringSet {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn string_take(mut self, key: &str) -> Self {
        self.cmds.push(Cmd::StringTake { key: key.into() });
        self
    }

    pub fn string_del(mut self, key: &str) -> Self {
        self.cmds.push(Cmd::StringDel { key: key.into() });
        self
    }

    pub fn list_push(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.cmds.push(Cmd::ListPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn list_set(mut self, key: &str, index: u64, value: impl Into<Vec<u8>>) -> Self {
        self.cmds.push(Cmd::ListSet {
            key: key.into(),
            index,
            value: value.into(),
        });
        self
    }

    pub fn list_remove(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.cmds.push(Cmd::ListRemove {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn zset_add(mut self, key: &str, member: &str, score: u64) -> Self {
        self.cmds.push(Cmd::ZsetAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn incr(mut self, key: &str, by: i64) -> Self {
        self.cmds.push(Cmd::IncrBy {
            key: key.into(),
            by,
        });
        self
    }

    /// Queue a publish delivered after the commit, in queue order.
    pub fn publish(mut self, channel: &str, payload: &str) -> Self {
        self.publishes.push((channel.into(), payload.into()));
        self
    }

    /// Commit the group. Conditional commands are checked first; a
    /// failed condition aborts the whole commit with nothing written
    /// and nothing published.
    pub fn commit(self) -> Result<(), StoreError> {
        let store = &self.store;
        let _guard = store.inner.commit_lock.lock().unwrap();

        // Phase 1: conditions.
        for cmd in &self.cmds {
            match cmd {
                Cmd::HashSetNx { key, field, .. } => {
                    if store.hash_get(key, field)?.is_some() {
                        return Err(StoreError::Conflict(format!("{key}/{field}")));
                    }
                }
                Cmd::HashTake { key, field } => {
                    if store.hash_get(key, field)?.is_none() {
                        return Err(StoreError::NotFound(format!("{key}/{field}")));
                    }
                }
                Cmd::StringTake { key } => {
                    let cf = store.cf(CF_STRINGS)?;
                    let live = match store.inner.db.get_cf(&cf, key.as_bytes())? {
                        Some(raw) => decode_string(&raw)?.is_some(),
                        None => false,
                    };
                    if !live {
                        return Err(StoreError::NotFound(key.clone()));
                    }
                }
                _ => {}
            }
        }

        // Phase 2: build and write the batch.
        let mut batch = WriteBatch::default();
        // List lengths mutated within this batch, so consecutive
        // pushes to one list land on consecutive indices.
        let mut list_lens: std::collections::HashMap<String, u64> =
            std::collections::HashMap::new();

        for cmd in &self.cmds {
            match cmd {
                Cmd::HashSet { key, field, value } | Cmd::HashSetNx { key, field, value } => {
                    let cf = store.cf(CF_HASHES)?;
                    batch.put_cf(&cf, hash_key(key, field), value);
                }
                Cmd::HashDel { key, field } | Cmd::HashTake { key, field } => {
                    let cf = store.cf(CF_HASHES)?;
                    batch.delete_cf(&cf, hash_key(key, field));
                }
                Cmd::HashDelAll { key } => {
                    let cf = store.cf(CF_HASHES)?;
                    for (field, _) in store.hash_get_all(key)? {
                        batch.delete_cf(&cf, hash_key(key, &field));
                    }
                }
                Cmd::StringSet { key, value, ttl } => {
                    let cf = store.cf(CF_STRINGS)?;
                    batch.put_cf(&cf, key.as_bytes(), encode_string(value, *ttl));
                }
                Cmd::StringTake { key } | Cmd::StringDel { key } => {
                    let cf = store.cf(CF_STRINGS)?;
                    batch.delete_cf(&cf, key.as_bytes());
                }
                Cmd::ListPush { key, value } => {
                    let cf = store.cf(CF_LISTS)?;
                    let len = match list_lens.get(key) {
                        Some(&l) => l,
                        None => store.list_len(key)?,
                    };
                    batch.put_cf(&cf, list_entry_key(key, len), value);
                    batch.put_cf(&cf, key.as_bytes(), (len + 1).to_be_bytes());
                    list_lens.insert(key.clone(), len + 1);
                }
                Cmd::ListSet { key, index, value } => {
                    let cf = store.cf(CF_LISTS)?;
                    batch.put_cf(&cf, list_entry_key(key, *index), value);
                    let len = match list_lens.get(key) {
                        Some(&l) => l,
                        None => store.list_len(key)?,
                    };
                    if index + 1 > len {
                        batch.put_cf(&cf, key.as_bytes(), (index + 1).to_be_bytes());
                        list_lens.insert(key.clone(), index + 1);
                    }
                }
                Cmd::ListRemove { key, value } => {
                    // Compacting rewrite; lists holding reply ids are
                    // short enough for this to stay cheap.
                    let cf = store.cf(CF_LISTS)?;
                    let entries = store.list_range(key, 0, u64::MAX)?;
                    let kept: Vec<&Vec<u8>> = entries.iter().filter(|e| *e != value).collect();
                    for (i, e) in kept.iter().enumerate() {
                        batch.put_cf(&cf, list_entry_key(key, i as u64), e.as_slice());
                    }
                    for i in kept.len() as u64..entries.len() as u64 {
                        batch.delete_cf(&cf, list_entry_key(key, i));
                    }
                    batch.put_cf(&cf, key.as_bytes(), (kept.len() as u64).to_be_bytes());
                    list_lens.insert(key.clone(), kept.len() as u64);
                }
                Cmd::ZsetAdd { key, member, score } => {
                    store.zset_add_to_batch(&mut batch, key, member, *score)?;
                }
                Cmd::IncrBy { key, by } => {
                    // Resolved immediately so later reads in this
                    // commit see the bumped value.
                    store.incr_locked(key, *by)?;
                }
            }
        }

        store.write_batch(batch)?;

        // Publishes stay ordered relative to the commit while the lock
        // is held.
        for (channel, payload) in &self.publishes {
            store.inner.pubsub.publish(channel, payload);
        }
        Ok(())
    }
}

// ─── Key and value encodings ─────────────────────────────────────────

fn hash_key(key: &str, field: &str) -> Vec<u8> {
    let mut k = key.as_bytes().to_vec();
    k.push(SEP);
    k.extend_from_slice(field.as_bytes());
    k
}

fn list_entry_key(key: &str, index: u64) -> Vec<u8> {
    let mut k = key.as_bytes().to_vec();
    k.push(SEP);
    k.extend_from_slice(&index.to_be_bytes());
    k
}

fn zset_member_key(key: &str, member: &str) -> Vec<u8> {
    let mut k = key.as_bytes().to_vec();
    k.push(SEP);
    k.push(b'm');
    k.push(SEP);
    k.extend_from_slice(member.as_bytes());
    k
}

fn zset_score_key(key: &str, score: u64, member: &str) -> Vec<u8> {
    let mut k = key.as_bytes().to_vec();
    k.push(SEP);
    k.push(b's');
    k.push(SEP);
    k.extend_from_slice(&score.to_be_bytes());
    k.push(SEP);
    k.extend_from_slice(member.as_bytes());
    k
}

fn encode_string(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let expiry = match ttl {
        Some(d) => now_millis() + d.as_millis() as u64,
        None => 0,
    };
    let mut raw = expiry.to_be_bytes().to_vec();
    raw.extend_from_slice(value);
    raw
}

/// `None` means the value has expired.
fn decode_string(raw: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    if raw.len() < 8 {
        return Err(StoreError::Corrupt("string value too short".into()));
    }
    let expiry = decode_u64(&raw[..8])?;
    if expiry != 0 && expiry <= now_millis() {
        return Ok(None);
    }
    Ok(Some(raw[8..].to_vec()))
}

fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Corrupt("expected 8-byte integer".into()))?;
    Ok(u64::from_be_bytes(arr))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (store, dir)
    }

    #[test]
    fn test_hash_ops() {
        let (store, _dir) = open_temp();
        store.hash_set("post:1", "name", b"anon").unwrap();
        store.hash_set("post:1", "board", b"g").unwrap();
        assert_eq!(store.hash_get("post:1", "name").unwrap().unwrap(), b"anon");
        assert!(store.hash_exists("post:1", "board").unwrap());
        assert!(!store.hash_exists("post:1", "image").unwrap());

        let all = store.hash_get_all("post:1").unwrap();
        assert_eq!(all.len(), 2);

        store.hash_del("post:1", "name").unwrap();
        assert!(store.hash_get("post:1", "name").unwrap().is_none());
    }

    #[test]
    fn test_hash_keys_do_not_collide() {
        let (store, _dir) = open_temp();
        store.hash_set("post:1", "x", b"a").unwrap();
        store.hash_set("post:11", "x", b"b").unwrap();
        assert_eq!(store.hash_get_all("post:1").unwrap().len(), 1);
    }

    #[test]
    fn test_list_push_range() {
        let (store, _dir) = open_temp();
        assert_eq!(store.list_push("l", b"a").unwrap(), 0);
        assert_eq!(store.list_push("l", b"b").unwrap(), 1);
        assert_eq!(store.list_push("l", b"c").unwrap(), 2);
        assert_eq!(store.list_len("l").unwrap(), 3);

        let range = store.list_range("l", 1, u64::MAX).unwrap();
        assert_eq!(range, vec![b"b".to_vec(), b"c".to_vec()]);
        assert!(store.list_range("l", 3, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_scan_list_keys() {
        let (store, _dir) = open_temp();
        store.list_push("thread:1:posts", b"x").unwrap();
        store.list_push("thread:2:posts", b"y").unwrap();
        store.list_push("other", b"z").unwrap();
        let keys = store.scan_list_keys("thread:").unwrap();
        assert_eq!(keys, vec!["thread:1:posts", "thread:2:posts"]);
    }

    #[test]
    fn test_zset_ordering() {
        let (store, _dir) = open_temp();
        store.zset_add("tag:g:threads", "1", 10).unwrap();
        store.zset_add("tag:g:threads", "2", 30).unwrap();
        store.zset_add("tag:g:threads", "3", 20).unwrap();
        assert_eq!(store.zset_card("tag:g:threads").unwrap(), 3);

        let desc = store.zset_range_desc("tag:g:threads").unwrap();
        let members: Vec<&str> = desc.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["2", "3", "1"]);

        // Re-score bumps the member without duplicating it
        store.zset_add("tag:g:threads", "1", 40).unwrap();
        let desc = store.zset_range_desc("tag:g:threads").unwrap();
        let members: Vec<&str> = desc.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["1", "2", "3"]);
        assert_eq!(store.zset_card("tag:g:threads").unwrap(), 3);
    }

    #[test]
    fn test_zset_rem() {
        let (store, _dir) = open_temp();
        store.zset_add("z", "a", 1).unwrap();
        store.zset_rem("z", "a").unwrap();
        assert_eq!(store.zset_card("z").unwrap(), 0);
        assert!(store.zset_range_desc("z").unwrap().is_empty());
    }

    #[test]
    fn test_string_ttl() {
        let (store, _dir) = open_temp();
        store.string_set("k", b"v", None).unwrap();
        assert_eq!(store.string_get("k").unwrap().unwrap(), b"v");

        store
            .string_set("short", b"v", Some(Duration::from_millis(20)))
            .unwrap();
        assert!(store.string_exists("short").unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!store.string_exists("short").unwrap());
    }

    #[test]
    fn test_string_append() {
        let (store, _dir) = open_temp();
        store.string_append("k", b"hel").unwrap();
        store.string_append("k", b"lo").unwrap();
        assert_eq!(store.string_get("k").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_string_incr_window() {
        let (store, _dir) = open_temp();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.string_incr("spam:x", 5, ttl).unwrap(), 5);
        assert_eq!(store.string_incr("spam:x", 3, ttl).unwrap(), 8);
    }

    #[test]
    fn test_counter() {
        let (store, _dir) = open_temp();
        assert_eq!(store.incr("postctr", 1).unwrap(), 1);
        assert_eq!(store.incr("postctr", 1).unwrap(), 2);
        assert_eq!(store.counter("postctr").unwrap(), 2);
        assert_eq!(store.incr("postctr", -5).unwrap(), 0);
    }

    #[test]
    fn test_multi_atomic_commit() {
        let (store, _dir) = open_temp();
        store
            .multi()
            .hash_set("post:5", "board", b"g".to_vec())
            .list_push("thread:1:posts", 5u64.to_be_bytes().to_vec())
            .incr("postctr", 1)
            .commit()
            .unwrap();
        assert!(store.hash_exists("post:5", "board").unwrap());
        assert_eq!(store.list_len("thread:1:posts").unwrap(), 1);
        assert_eq!(store.counter("postctr").unwrap(), 1);
    }

    #[test]
    fn test_multi_condition_aborts_everything() {
        let (store, _dir) = open_temp();
        store.hash_set("MD5s", "abc", b"1").unwrap();
        let err = store
            .multi()
            .hash_set("post:9", "board", b"g".to_vec())
            .hash_set_nx("MD5s", "abc", b"9".to_vec())
            .commit()
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // Nothing from the failed commit landed
        assert!(!store.hash_exists("post:9", "board").unwrap());
    }

    #[test]
    fn test_multi_string_take() {
        let (store, _dir) = open_temp();
        store.string_set("tok", b"data", None).unwrap();
        store.multi().string_take("tok").commit().unwrap();
        assert!(!store.string_exists("tok").unwrap());

        let err = store.multi().string_take("tok").commit().unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_multi_list_remove() {
        let (store, _dir) = open_temp();
        for id in [1u64, 2, 3] {
            store.list_push("l", &id.to_be_bytes()).unwrap();
        }
        store
            .multi()
            .list_remove("l", 2u64.to_be_bytes().to_vec())
            .commit()
            .unwrap();
        let range = store.list_range("l", 0, u64::MAX).unwrap();
        assert_eq!(
            range,
            vec![1u64.to_be_bytes().to_vec(), 3u64.to_be_bytes().to_vec()]
        );
    }

    #[test]
    fn test_multi_consecutive_pushes() {
        let (store, _dir) = open_temp();
        store
            .multi()
            .list_push("l", b"a".to_vec())
            .list_push("l", b"b".to_vec())
            .commit()
            .unwrap();
        assert_eq!(store.list_len("l").unwrap(), 2);
        assert_eq!(
            store.list_range("l", 0, u64::MAX).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_publish_after_commit_in_order() {
        let (store, _dir) = open_temp();
        let mut rx = store.subscribe("thread:1");
        store
            .multi()
            .hash_set("post:1", "board", b"g".to_vec())
            .publish("thread:1", "first")
            .publish("thread:1", "second")
            .commit()
            .unwrap();
        assert_eq!(&*rx.recv().await.unwrap().payload, "first");
        assert_eq!(&*rx.recv().await.unwrap().payload, "second");
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let (store, _dir) = open_temp();
        let mut rx = store.subscribe("thread:1");
        store.hash_set("MD5s", "dup", b"1").unwrap();
        let _ = store
            .multi()
            .hash_set_nx("MD5s", "dup", b"2".to_vec())
            .publish("thread:1", "never")
            .commit();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = Store::open(StoreConfig::for_testing(&path)).unwrap();
            store.hash_set("post:1", "body", b"hello").unwrap();
            store.incr("postctr", 7).unwrap();
        }
        let store = Store::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.hash_get("post:1", "body").unwrap().unwrap(), b"hello");
        assert_eq!(store.counter("postctr").unwrap(), 7);
    }
}
