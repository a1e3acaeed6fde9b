//! Per-thread update feeds.
//!
//! One [`Feed`] task per live thread owns that thread's subscriber
//! set, the open-post body mirror, and the backlog. All interaction is
//! message passing over a bounded queue; the task is the sole mutator
//! of its state, so every subscriber observes messages in the one
//! order the feed accepted them.
//!
//! ```text
//! writer ──┐
//! writer ──┼── mpsc ──► Feed task ──► Backlog (structural msgs)
//! hub    ──┘              │
//!                         ├──► subscriber queue (client A)
//!                         ├──► subscriber queue (client B)
//!                         └──► …
//! ```
//!
//! Body mutation messages (append, backspace, splice) fan out live
//! but are not backlogged: a late joiner synchronises open bodies from
//! the mirror via synthetic whole-body splices instead, then follows
//! the live stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backlog::Backlog;
use crate::protocol::{self, MessageType, SpliceMessage, SyncDone};
use crate::store::{Store, StoreError};

/// An encoded wire frame shared between subscribers.
pub type Frame = Arc<str>;

/// Events accepted by a feed task.
pub enum FeedEvent {
    Subscribe {
        client: Uuid,
        queue: mpsc::Sender<Frame>,
        cursor: u64,
    },
    Unsubscribe {
        client: Uuid,
    },
    /// New open post in this thread
    InsertPost {
        id: u64,
        msg: String,
    },
    /// Open-body mirror update plus live broadcast
    SetOpenBody {
        id: u64,
        body: String,
        msg: String,
    },
    InsertImage {
        id: u64,
        msg: String,
    },
    SpoilerImage {
        id: u64,
        msg: String,
    },
    ClosePost {
        id: u64,
        msg: String,
    },
    /// Backlogged broadcast with no mirror side effect
    Send {
        msg: String,
    },
}

/// Capability handle on a feed task.
#[derive(Clone)]
pub struct FeedHandle {
    op: u64,
    tx: mpsc::Sender<FeedEvent>,
}

impl FeedHandle {
    pub fn op(&self) -> u64 {
        self.op
    }

    async fn push(&self, ev: FeedEvent) {
        if self.tx.send(ev).await.is_err() {
            log::error!("feed {} is gone", self.op);
        }
    }

    pub async fn subscribe(&self, client: Uuid, queue: mpsc::Sender<Frame>, cursor: u64) {
        self.push(FeedEvent::Subscribe {
            client,
            queue,
            cursor,
        })
        .await
    }

    pub async fn unsubscribe(&self, client: Uuid) {
        self.push(FeedEvent::Unsubscribe { client }).await
    }

    pub async fn insert_post(&self, id: u64, msg: String) {
        self.push(FeedEvent::InsertPost { id, msg }).await
    }

    pub async fn set_open_body(&self, id: u64, body: String, msg: String) {
        self.push(FeedEvent::SetOpenBody { id, body, msg }).await
    }

    pub async fn insert_image(&self, id: u64, msg: String) {
        self.push(FeedEvent::InsertImage { id, msg }).await
    }

    pub async fn spoiler_image(&self, id: u64, msg: String) {
        self.push(FeedEvent::SpoilerImage { id, msg }).await
    }

    pub async fn close_post(&self, id: u64, msg: String) {
        self.push(FeedEvent::ClosePost { id, msg }).await
    }

    pub async fn send(&self, msg: String) {
        self.push(FeedEvent::Send { msg }).await
    }
}

struct Feed {
    op: u64,
    backlog: Backlog,
    subscribers: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// Authoritative mirror of every open body in this thread
    open_bodies: HashMap<u64, String>,
}

impl Feed {
    async fn run(mut self, mut rx: mpsc::Receiver<FeedEvent>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                FeedEvent::Subscribe {
                    client,
                    queue,
                    cursor,
                } => self.handle_subscribe(client, queue, cursor),
                FeedEvent::Unsubscribe { client } => {
                    self.subscribers.remove(&client);
                }
                FeedEvent::InsertPost { id, msg } => {
                    self.open_bodies.insert(id, String::new());
                    self.backlog_and_broadcast(&msg);
                }
                FeedEvent::SetOpenBody { id, body, msg } => {
                    self.open_bodies.insert(id, body);
                    self.broadcast(Arc::from(msg.as_str()));
                }
                FeedEvent::InsertImage { msg, .. } | FeedEvent::SpoilerImage { msg, .. } => {
                    self.backlog_and_broadcast(&msg);
                }
                FeedEvent::ClosePost { id, msg } => {
                    self.open_bodies.remove(&id);
                    self.backlog_and_broadcast(&msg);
                }
                FeedEvent::Send { msg } => {
                    self.backlog_and_broadcast(&msg);
                }
            }
        }
    }

    /// Replay missed backlog, snapshot open bodies, then ack. The
    /// whole sequence runs before any later event, so replay is closed
    /// strictly before live delivery begins.
    fn handle_subscribe(&mut self, client: Uuid, queue: mpsc::Sender<Frame>, cursor: u64) {
        for msg in self.backlog.replay_from(cursor) {
            if queue.try_send(msg.clone()).is_err() {
                log::warn!("feed {}: client {client} dropped during replay", self.op);
                return;
            }
        }

        let mut open: Vec<(&u64, &String)> = self.open_bodies.iter().collect();
        open.sort_by_key(|(id, _)| **id);
        for (id, body) in open {
            let splice = SpliceMessage {
                id: *id,
                start: 0,
                len: 0,
                text: body.clone(),
            };
            match protocol::encode(MessageType::Splice, &splice) {
                Ok(frame) => {
                    if queue.try_send(Arc::from(frame.as_str())).is_err() {
                        return;
                    }
                }
                Err(e) => log::error!("feed {}: snapshot encode failed: {e}", self.op),
            }
        }

        let done = SyncDone {
            thread: self.op,
            cursor: self.backlog.len(),
        };
        if let Ok(frame) = protocol::encode(MessageType::SyncDone, &done) {
            let _ = queue.try_send(Arc::from(frame.as_str()));
        }
        self.subscribers.insert(client, queue);
    }

    /// Append to the backlog, then fan out. A failed store write means
    /// the message is not delivered at all.
    fn backlog_and_broadcast(&mut self, msg: &str) {
        match self.backlog.append(msg) {
            Ok(_) => self.broadcast(Arc::from(msg)),
            Err(e) => log::error!("feed {}: backlog append failed: {e}", self.op),
        }
    }

    fn broadcast(&mut self, frame: Frame) {
        let op = self.op;
        self.subscribers.retain(|client, queue| {
            match queue.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("feed {op}: client {client} lagging, dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// One feed per live thread, created on first use. An empty feed
/// idles; it is only torn down with its thread.
#[derive(Clone)]
pub struct FeedHub {
    store: Store,
    queue_depth: usize,
    feeds: Arc<Mutex<HashMap<u64, FeedHandle>>>,
}

impl FeedHub {
    pub fn new(store: Store, queue_depth: usize) -> Self {
        Self {
            store,
            queue_depth,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the feed for a thread, spawning its task if this is the
    /// first use since startup.
    pub fn get_or_create(&self, op: u64) -> Result<FeedHandle, StoreError> {
        if let Some(handle) = self.feeds.lock().unwrap().get(&op) {
            return Ok(handle.clone());
        }

        let backlog = Backlog::load(self.store.clone(), op)?;
        let mut feeds = self.feeds.lock().unwrap();
        // Lost a race while loading; use the winner's feed
        if let Some(handle) = feeds.get(&op) {
            return Ok(handle.clone());
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let feed = Feed {
            op,
            backlog,
            subscribers: HashMap::new(),
            open_bodies: HashMap::new(),
        };
        tokio::spawn(feed.run(rx));

        let handle = FeedHandle { op, tx };
        feeds.insert(op, handle.clone());
        Ok(handle)
    }

    /// Drop a thread's feed. Used when the thread itself goes away.
    pub fn remove(&self, op: u64) {
        self.feeds.lock().unwrap().remove(&op);
    }

    pub fn live_count(&self) -> usize {
        self.feeds.lock().unwrap().len()
    }
}
