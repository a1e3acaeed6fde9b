//! Process-wide post-id → thread-id mapping.
//!
//! Populated on startup by scanning thread keys and their reply lists,
//! then kept live by one subscriber tailing every thread channel: each
//! InsertPost records `id → op`, each DeletePost removes the entry.
//! A lookup may miss a very recent insert; [`Registry::lookup_or_fetch`]
//! falls back to the store for that window.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{self, MessageType, PostView};
use crate::store::{queries, Store, StoreError};

#[derive(Clone)]
pub struct Registry {
    map: Arc<RwLock<HashMap<u64, u64>>>,
    store: Store,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    /// Startup scan: every thread maps to itself, every reply to its
    /// thread. Returns the number of entries loaded.
    pub fn populate(&self) -> Result<usize, StoreError> {
        let mut map = self.map.write().unwrap();
        map.clear();
        for op in queries::thread_ids(&self.store)? {
            map.insert(op, op);
            for id in queries::thread_replies(&self.store, op)? {
                map.insert(id, op);
            }
        }
        Ok(map.len())
    }

    /// Spawn the tail task. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut rx = self.store.psubscribe("thread:*");
        let map = self.map.clone();
        tokio::spawn(async move {
            loop {
                let published = match rx.recv().await {
                    Ok(p) => p,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("registry tail lagged by {n} messages");
                        continue;
                    }
                    Err(_) => break,
                };
                let (typ, payload) = match protocol::split(&published.payload) {
                    Ok(split) => split,
                    Err(e) => {
                        log::warn!("registry: undecodable publish: {e}");
                        continue;
                    }
                };
                match typ {
                    MessageType::InsertPost => {
                        if let Ok(view) = protocol::decode::<PostView>(payload) {
                            map.write().unwrap().insert(view.id, view.op);
                        }
                    }
                    MessageType::DeletePost => {
                        if let Ok(id) = protocol::decode::<u64>(payload) {
                            map.write().unwrap().remove(&id);
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    pub fn lookup(&self, id: u64) -> Option<u64> {
        self.map.read().unwrap().get(&id).copied()
    }

    /// Lookup with a store fallback for inserts the tail has not
    /// observed yet. A hit backfills the map.
    pub fn lookup_or_fetch(&self, id: u64) -> Option<u64> {
        if let Some(op) = self.lookup(id) {
            return Some(op);
        }
        match self.store.hash_get(&queries::post_key(id), "op") {
            Ok(Some(raw)) if raw.len() == 8 => {
                let op = u64::from_be_bytes(raw.as_slice().try_into().ok()?);
                self.map.write().unwrap().insert(id, op);
                Some(op)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("registry fallback lookup failed for {id}: {e}");
                None
            }
        }
    }

    pub fn insert(&self, id: u64, op: u64) {
        self.map.write().unwrap().insert(id, op);
    }

    pub fn remove(&self, id: u64) {
        self.map.write().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }
}
