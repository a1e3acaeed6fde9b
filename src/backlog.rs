//! Per-thread append-only message log.
//!
//! Every structural feed message is appended here before fan-out;
//! the counter a subscriber resumes from is the number of messages it
//! has seen, so entry `i` carries counter `i + 1` and replay from
//! cursor `k` yields counters `k+1, k+2, …` with no gaps.
//!
//! Entries are LZ4-compressed at rest in `thread:{op}:history`; the
//! in-memory copy serves replays without touching the store.

use std::sync::Arc;

use crate::store::{queries, Store, StoreError};

pub struct Backlog {
    op: u64,
    store: Store,
    entries: Vec<Arc<str>>,
}

impl Backlog {
    /// Load a thread's history from the store, decompressing entries.
    pub fn load(store: Store, op: u64) -> Result<Self, StoreError> {
        let raw = store.list_range(&queries::history_key(op), 0, u64::MAX)?;
        let mut entries = Vec::with_capacity(raw.len());
        for chunk in raw {
            let bytes = lz4_flex::decompress_size_prepended(&chunk)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let msg =
                String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            entries.push(Arc::from(msg.as_str()));
        }
        Ok(Self { op, store, entries })
    }

    /// Append a message, returning its counter. The store write and
    /// history-counter bump land in one commit before the in-memory
    /// append, so a loaded backlog never runs ahead of the store.
    pub fn append(&mut self, msg: &str) -> Result<u64, StoreError> {
        let index = self.entries.len() as u64;
        let compressed = lz4_flex::compress_prepend_size(msg.as_bytes());
        self.store
            .multi()
            .list_set(&queries::history_key(self.op), index, compressed)
            .incr(&format!("thread:{}:hctr", self.op), 1)
            .commit()?;
        self.entries.push(Arc::from(msg));
        Ok(index + 1)
    }

    /// Entries after the given cursor.
    pub fn replay_from(&self, cursor: u64) -> &[Arc<str>] {
        let from = (cursor as usize).min(self.entries.len());
        &self.entries[from..]
    }

    /// Entries with counters in `(from, to]`.
    pub fn range(&self, from: u64, to: u64) -> &[Arc<str>] {
        let lo = (from as usize).min(self.entries.len());
        let hi = (to as usize).min(self.entries.len());
        &self.entries[lo..hi.max(lo)]
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn op(&self) -> u64 {
        self.op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    fn open_temp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (store, dir)
    }

    #[test]
    fn test_counters_strictly_increment() {
        let (store, _dir) = open_temp();
        let mut log = Backlog::load(store, 1).unwrap();
        assert_eq!(log.append("a").unwrap(), 1);
        assert_eq!(log.append("b").unwrap(), 2);
        assert_eq!(log.append("c").unwrap(), 3);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_replay_from_cursor() {
        let (store, _dir) = open_temp();
        let mut log = Backlog::load(store, 1).unwrap();
        for msg in ["a", "b", "c", "d"] {
            log.append(msg).unwrap();
        }

        let replay: Vec<&str> = log.replay_from(2).iter().map(|m| &**m).collect();
        assert_eq!(replay, vec!["c", "d"]);
        assert!(log.replay_from(4).is_empty());
        assert!(log.replay_from(99).is_empty());

        let mid: Vec<&str> = log.range(1, 3).iter().map(|m| &**m).collect();
        assert_eq!(mid, vec!["b", "c"]);
    }

    #[test]
    fn test_reload_continues_counters() {
        let (store, _dir) = open_temp();
        {
            let mut log = Backlog::load(store.clone(), 7).unwrap();
            log.append("first").unwrap();
            log.append("second").unwrap();
        }
        let mut log = Backlog::load(store.clone(), 7).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(&*log.replay_from(0)[0], "first");
        assert_eq!(log.append("third").unwrap(), 3);
        assert_eq!(store.counter("thread:7:hctr").unwrap(), 3);
    }

    #[test]
    fn test_threads_isolated() {
        let (store, _dir) = open_temp();
        let mut a = Backlog::load(store.clone(), 1).unwrap();
        let mut b = Backlog::load(store, 2).unwrap();
        a.append("a1").unwrap();
        b.append("b1").unwrap();
        b.append("b2").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_multibyte_survives_storage() {
        let (store, _dir) = open_temp();
        {
            let mut log = Backlog::load(store.clone(), 1).unwrap();
            log.append("05{\"text\":\"日本語🙂\"}").unwrap();
        }
        let log = Backlog::load(store, 1).unwrap();
        assert_eq!(&*log.replay_from(0)[0], "05{\"text\":\"日本語🙂\"}");
    }
}
