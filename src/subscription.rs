//! Per-connection sessions.
//!
//! A [`Client`] owns one websocket connection: identity, the set of
//! synced threads, the open post (if any), and the outbound send
//! queue. Inbound frames are parsed into the [`ClientMessage`] union
//! and dispatched serially, so mutations on the client's open post
//! apply in the order received. A separate writer task drains the
//! send queue, serializing all websocket writes.
//!
//! State machine:
//! `connected → handshaking → synced → (writing | idle)* → closed`.
//! Disconnecting mid-write leaves the open body in the store; the
//! session takes no compensating action.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::{ErrorKind, PostError};
use crate::feed::{FeedHandle, Frame};
use crate::protocol::{self, ClientMessage, ErrorMessage, MessageType, SyncRequest};
use crate::server::App;
use crate::store::queries;
use crate::writer::OpenPost;

/// Outbound frames buffered per client before it is dropped as
/// lagging.
const SEND_QUEUE_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing synced yet
    Connected,
    /// At least one thread synced; may open a post
    Synced,
}

pub struct Client {
    pub(crate) id: Uuid,
    pub(crate) ip: IpAddr,
    /// Captcha session the spam counters accumulate under
    pub(crate) captcha_session: Uuid,
    pub(crate) state: SessionState,
    /// Synced threads and their feed capabilities
    pub(crate) feeds: HashMap<u64, FeedHandle>,
    pub(crate) post: Option<OpenPost>,
    /// Set when the spam threshold trips; writes are rejected until a
    /// fresh captcha clears it
    pub(crate) need_captcha: bool,
    pub(crate) queue: mpsc::Sender<Frame>,
    queue_rx: Option<mpsc::Receiver<Frame>>,
    pub(crate) app: App,
}

impl Client {
    pub fn new(app: App, ip: IpAddr) -> Self {
        let (queue, queue_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        Self {
            id: Uuid::new_v4(),
            ip,
            captcha_session: Uuid::new_v4(),
            state: SessionState::Connected,
            feeds: HashMap::new(),
            post: None,
            need_captcha: false,
            queue,
            queue_rx: Some(queue_rx),
            app,
        }
    }

    /// Take the outbound queue receiver. `run` consumes it; tests read
    /// it directly.
    pub fn take_queue_rx(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.queue_rx.take()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self, ws: WebSocketStream<TcpStream>) {
        let (mut sink, mut stream) = ws.split();
        let mut rx = match self.queue_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle(text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("websocket error from {}: {e}", self.ip);
                    break;
                }
            }
        }

        // Unsubscribe everywhere; any in-flight store write completes
        // on its own and the open body stays behind.
        for feed in self.feeds.values() {
            feed.unsubscribe(self.id).await;
        }
        self.feeds.clear();
        drop(self.queue);
        writer.abort();
    }

    /// Handle one inbound frame, surfacing errors per their kind.
    pub async fn handle(&mut self, frame: &str) {
        match self.dispatch(frame).await {
            Ok(()) => {}
            Err(err) => match err.kind() {
                ErrorKind::Validation | ErrorKind::Protocol => self.send_error(&err),
                ErrorKind::Throttle => {
                    self.send_frame(protocol::encode_empty(MessageType::NeedCaptcha));
                    self.send_error(&err);
                }
                ErrorKind::Transient => {
                    log::warn!("transient error for {}: {err}", self.id);
                    self.send_error(&err);
                }
                ErrorKind::Fatal => {
                    log::error!("fatal error for {}: {err}", self.id);
                    self.send_error(&err);
                }
            },
        }
    }

    async fn dispatch(&mut self, frame: &str) -> Result<(), PostError> {
        let msg = protocol::decode_client(frame).map_err(|e| PostError::BadFrame(e.to_string()))?;

        // A tripped spam score blocks every write except closing the
        // post already in progress.
        if self.need_captcha {
            match msg {
                ClientMessage::Synchronise(_) | ClientMessage::ClosePost => {}
                _ => return Err(PostError::Throttled),
            }
        }

        match msg {
            ClientMessage::Synchronise(req) => self.synchronise(req).await,
            ClientMessage::ReservePost(req) => self.reserve_post(req).await,
            ClientMessage::Append(c) => self.append_rune(c).await,
            ClientMessage::Backspace => self.backspace().await,
            ClientMessage::Splice(req) => self.splice_text(req).await,
            ClientMessage::ClosePost => self.close_post().await,
            ClientMessage::InsertImage(req) => self.insert_image(req).await,
            ClientMessage::SpoilerImage => self.spoiler_image().await,
        }
    }

    /// Register with a thread's feed and replay missed history. Each
    /// synchronise adds to the watched set.
    pub(crate) async fn synchronise(&mut self, req: SyncRequest) -> Result<(), PostError> {
        if !queries::thread_exists(&self.app.store, req.thread)? {
            return Err(PostError::UnknownThread(req.thread));
        }
        let feed = self.app.hub.get_or_create(req.thread)?;
        feed.subscribe(self.id, self.queue.clone(), req.cursor).await;
        self.feeds.insert(req.thread, feed);
        self.state = SessionState::Synced;
        Ok(())
    }

    pub(crate) fn feed_for(&self, op: u64) -> Result<FeedHandle, PostError> {
        self.feeds.get(&op).cloned().ok_or(PostError::NotSynced)
    }

    pub(crate) fn send_frame(&self, frame: String) {
        if self.queue.try_send(Arc::from(frame.as_str())).is_err() {
            log::debug!("send queue full for {}", self.id);
        }
    }

    fn send_error(&self, err: &PostError) {
        let payload = ErrorMessage {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        if let Ok(frame) = protocol::encode(MessageType::Error, &payload) {
            self.send_frame(frame);
        }
    }

    /// Bump the spam counters; on crossing the threshold, flag the
    /// session and notify the client once. Scoring failures never
    /// abort the mutation that triggered them.
    pub(crate) fn spam_score(&mut self, delta: u64) {
        match self
            .app
            .throttle
            .increment_spam_score(self.captcha_session, self.ip, delta)
        {
            Ok(true) => {
                if !self.need_captcha {
                    self.need_captcha = true;
                    self.send_frame(protocol::encode_empty(MessageType::NeedCaptcha));
                }
            }
            Ok(false) => {}
            Err(e) => log::warn!("spam score update failed for {}: {e}", self.id),
        }
    }

    /// Called when the captcha service accepts a solution.
    pub fn captcha_solved(&mut self) {
        self.need_captcha = false;
        if let Err(e) = self.app.throttle.reset(self.captcha_session, self.ip) {
            log::warn!("spam score reset failed for {}: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::App;
    use crate::store::{Store, StoreConfig};
    use tokio::time::{timeout, Duration};

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> String {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed")
            .to_string()
    }

    fn setup() -> (App, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let app = App::new(store, Arc::new(crate::config::Config::for_testing()));
        (app, dir)
    }

    fn client_ip() -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn test_synchronise_unknown_thread_is_fatal() {
        let (app, _dir) = setup();
        let mut client = Client::new(app, client_ip());
        let mut rx = client.take_queue_rx().unwrap();

        client.handle("30{\"thread\":42,\"cursor\":0}").await;
        let frame = recv(&mut rx).await;
        assert!(frame.starts_with("40"));
        assert!(frame.contains("unknown_thread"));
        assert_eq!(client.state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_synchronise_acks() {
        let (app, _dir) = setup();
        queries::insert_thread(&app.store, 42, "g", 0).unwrap();

        let mut client = Client::new(app, client_ip());
        let mut rx = client.take_queue_rx().unwrap();
        client.handle("30{\"thread\":42,\"cursor\":0}").await;

        let frame = recv(&mut rx).await;
        assert!(frame.starts_with("42"));
        assert_eq!(client.state, SessionState::Synced);
        assert!(client.feed_for(42).is_ok());
    }

    #[tokio::test]
    async fn test_bad_frame_surfaced_not_fatal() {
        let (app, _dir) = setup();
        let mut client = Client::new(app, client_ip());
        let mut rx = client.take_queue_rx().unwrap();

        client.handle("not a frame").await;
        let frame = recv(&mut rx).await;
        assert!(frame.starts_with("40"));
        assert!(frame.contains("bad_frame"));

        // The connection still works afterwards
        client.handle("34").await;
        let frame = recv(&mut rx).await;
        assert!(frame.contains("no_post_open"));
    }

    #[tokio::test]
    async fn test_write_without_open_post_rejected() {
        let (app, _dir) = setup();
        let mut client = Client::new(app, client_ip());
        let mut rx = client.take_queue_rx().unwrap();

        client.handle("33104").await;
        assert!(recv(&mut rx).await.contains("no_post_open"));
        client.handle("05{\"start\":0,\"len\":0,\"text\":\"x\"}").await;
        assert!(recv(&mut rx).await.contains("no_post_open"));
    }

    #[tokio::test]
    async fn test_captcha_gate_blocks_writes() {
        let (app, _dir) = setup();
        queries::insert_thread(&app.store, 1, "g", 0).unwrap();

        let mut client = Client::new(app, client_ip());
        let mut rx = client.take_queue_rx().unwrap();
        client.need_captcha = true;

        client.handle("31{\"thread\":1}").await;
        let first = recv(&mut rx).await;
        assert!(first.starts_with("41"));
        let second = recv(&mut rx).await;
        assert!(second.contains("throttled"));

        // Synchronise still allowed
        client.handle("30{\"thread\":1,\"cursor\":0}").await;
        assert!(recv(&mut rx).await.starts_with("42"));

        client.captcha_solved();
        assert!(!client.need_captcha);
    }
}
