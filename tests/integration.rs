//! End-to-end websocket tests.
//!
//! These start a real server and connect real clients, driving the
//! full pipeline: synchronise, open a post, type, attach an image,
//! close — while other clients watch the thread feed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use liveboard::store::queries;
use liveboard::{App, Config, Server, ServerConfig, StoreConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const THREAD: u64 = 1;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with one thread pre-created. Returns the url and a
/// handle on the shared state.
async fn start_server() -> (String, App, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        store: StoreConfig::for_testing(dir.path().join("db")),
    };
    let server = Server::new(config, Config::for_testing()).unwrap();
    let app = server.app().clone();

    // The OP post takes id 1, so replies start at 2
    let op_id = queries::reserve_post_id(&app.store).unwrap();
    assert_eq!(op_id, THREAD);
    queries::insert_thread(&app.store, THREAD, "a", 0).unwrap();
    let op_view = liveboard::PostView {
        id: THREAD,
        op: THREAD,
        time: 0,
        board: "a".into(),
        name: None,
        trip: None,
        email: None,
        sage: false,
        body: String::new(),
        image: None,
    };
    let frame = liveboard::protocol::encode(liveboard::MessageType::InsertPost, &op_view).unwrap();
    queries::insert_post(&app.store, &op_view, &frame).unwrap();
    queries::close_post(&app.store, THREAD, "first post", &[], &[]).unwrap();

    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), app, dir)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: &str) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

/// Read frames until one starts with `prefix`, returning it.
async fn recv_until(ws: &mut Ws, prefix: &str) -> String {
    loop {
        let frame = recv(ws).await;
        if frame.starts_with(prefix) {
            return frame;
        }
    }
}

async fn sync(ws: &mut Ws, cursor: u64) -> String {
    send(ws, &format!("30{{\"thread\":{THREAD},\"cursor\":{cursor}}}")).await;
    recv_until(ws, "42").await
}

/// Open a reply and return its id.
async fn open_post(ws: &mut Ws) -> u64 {
    send(ws, &format!("31{{\"thread\":{THREAD}}}")).await;
    let frame = recv_until(ws, "32").await;
    frame[2..].parse().unwrap()
}

async fn type_text(ws: &mut Ws, text: &str) {
    for c in text.chars() {
        send(ws, &format!("33{}", c as u32)).await;
    }
}

#[tokio::test]
async fn test_connect_and_sync() {
    let (url, _app, _dir) = start_server().await;
    let mut ws = connect(&url).await;
    let done = sync(&mut ws, 0).await;
    assert!(done.contains("\"thread\":1"));
    assert!(done.contains("\"cursor\":0"));
}

#[tokio::test]
async fn test_sync_unknown_thread_errors() {
    let (url, _app, _dir) = start_server().await;
    let mut ws = connect(&url).await;
    send(&mut ws, "30{\"thread\":999,\"cursor\":0}").await;
    let frame = recv_until(&mut ws, "40").await;
    assert!(frame.contains("unknown_thread"));
}

#[tokio::test]
async fn test_typing_reaches_other_clients() {
    let (url, _app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    sync(&mut alice, 0).await;
    sync(&mut bob, 0).await;

    let id = open_post(&mut alice).await;
    // Bob sees the new post
    let insert = recv_until(&mut bob, "02").await;
    assert!(insert.contains(&format!("\"id\":{id}")));

    type_text(&mut alice, "hey").await;
    assert_eq!(recv_until(&mut bob, "03").await, format!("03[{id},104]"));
    assert_eq!(recv_until(&mut bob, "03").await, format!("03[{id},101]"));
    assert_eq!(recv_until(&mut bob, "03").await, format!("03[{id},121]"));

    // Backspace, then close
    send(&mut alice, "34").await;
    assert_eq!(recv_until(&mut bob, "04").await, format!("04{id}"));

    send(&mut alice, "35").await;
    let close = recv_until(&mut bob, "06").await;
    assert!(close.contains(&format!("\"id\":{id}")));
}

#[tokio::test]
async fn test_late_joiner_gets_open_body_snapshot() {
    // The literal late-joiner scenario: B syncs after A typed "hi",
    // then sees A's '!' live.
    let (url, _app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    sync(&mut alice, 0).await;
    let id = open_post(&mut alice).await;
    type_text(&mut alice, "hi").await;
    // Wait until the server processed the keystrokes
    recv_until(&mut alice, "03").await;
    recv_until(&mut alice, "03").await;

    let mut bob = connect(&url).await;
    send(&mut bob, &format!("30{{\"thread\":{THREAD},\"cursor\":0}}")).await;

    let first = recv(&mut bob).await;
    assert!(
        first.starts_with("02") && first.contains(&format!("\"id\":{id}")),
        "expected InsertPost first, got {first}"
    );
    let second = recv(&mut bob).await;
    assert_eq!(
        second,
        format!("05{{\"id\":{id},\"start\":0,\"len\":0,\"text\":\"hi\"}}")
    );
    let third = recv(&mut bob).await;
    assert!(third.starts_with("42"));

    type_text(&mut alice, "!").await;
    assert_eq!(recv_until(&mut bob, "03").await, format!("03[{id},33]"));
}

#[tokio::test]
async fn test_splice_over_websocket() {
    let (url, _app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    sync(&mut alice, 0).await;
    sync(&mut bob, 0).await;

    let id = open_post(&mut alice).await;
    type_text(&mut alice, "hello").await;
    send(&mut alice, "05{\"start\":1,\"len\":3,\"text\":\"EY\"}").await;

    let frame = recv_until(&mut bob, "05").await;
    assert_eq!(
        frame,
        format!("05{{\"id\":{id},\"start\":1,\"len\":3,\"text\":\"EY\"}}")
    );
}

#[tokio::test]
async fn test_errors_surface_only_to_offender() {
    let (url, _app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    sync(&mut alice, 0).await;
    sync(&mut bob, 0).await;

    // Appending with no open post is an error for Alice alone
    send(&mut alice, "33104").await;
    let err = recv_until(&mut alice, "40").await;
    assert!(err.contains("no_post_open"));

    // Alice's connection still works
    let id = open_post(&mut alice).await;
    type_text(&mut alice, "ok").await;
    assert_eq!(recv_until(&mut bob, "03").await, format!("03[{id},111]"));
}

#[tokio::test]
async fn test_image_insert_and_spoiler() {
    let (url, app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    sync(&mut alice, 0).await;
    sync(&mut bob, 0).await;

    let id = open_post(&mut alice).await;

    let image = liveboard::Image {
        name: "orig.png".into(),
        file: "555.png".into(),
        thumb: "555s.png".into(),
        md5: "deadbeef".into(),
        dims: [640, 480, 160, 120],
        size: 4096,
        spoiler: false,
    };
    queries::stage_image(&app.store, "tok", &image, Duration::from_secs(60)).unwrap();

    send(
        &mut alice,
        "36{\"token\":\"tok\",\"name\":\"cat.png\",\"spoiler\":false}",
    )
    .await;
    let frame = recv_until(&mut bob, "07").await;
    assert!(frame.contains("\"md5\":\"deadbeef\""));
    assert!(frame.contains("\"name\":\"cat.png\""));

    send(&mut alice, "37").await;
    assert_eq!(recv_until(&mut bob, "08").await, format!("08{id}"));
}

#[tokio::test]
async fn test_steal_transfers_image() {
    let (url, app, _dir) = start_server().await;

    // Victim opens a post with an image and closes it
    let mut victim = connect(&url).await;
    sync(&mut victim, 0).await;
    let victim_id = open_post(&mut victim).await;
    let image = liveboard::Image {
        name: "rare.png".into(),
        file: "777.png".into(),
        thumb: "777s.png".into(),
        md5: "cafebabe".into(),
        dims: [100, 100, 50, 50],
        size: 1000,
        spoiler: false,
    };
    queries::stage_image(&app.store, "tok", &image, Duration::from_secs(60)).unwrap();
    send(
        &mut victim,
        "36{\"token\":\"tok\",\"name\":\"rare.png\",\"spoiler\":false}",
    )
    .await;
    recv_until(&mut victim, "07").await;
    send(&mut victim, "35").await;
    recv_until(&mut victim, "06").await;

    // Thief references the victim and invokes #steal on board "a"
    let mut thief = connect(&url).await;
    sync(&mut thief, 0).await;
    let thief_id = open_post(&mut thief).await;
    type_text(&mut thief, &format!(">>{victim_id} #steal")).await;
    send(&mut thief, "35").await;

    let from = recv_until(&mut victim, "09").await;
    assert_eq!(from, format!("09{victim_id}"));
    let to = recv_until(&mut victim, "10").await;
    assert!(to.contains(&format!("\"id\":{thief_id}")));
    assert!(to.contains("cafebabe"));

    assert!(!queries::has_image(&app.store, victim_id).unwrap());
    let moved = queries::post_image(&app.store, thief_id).unwrap().unwrap();
    assert_eq!(moved.md5, "cafebabe");
}

#[tokio::test]
async fn test_registry_learns_inserts_live() {
    let (url, app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    sync(&mut alice, 0).await;
    let id = open_post(&mut alice).await;

    // The tail subscriber records the mapping without a store round trip
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.registry.lookup(id), Some(THREAD));
}

#[tokio::test]
async fn test_disconnect_leaves_open_body() {
    let (url, app, _dir) = start_server().await;

    let mut alice = connect(&url).await;
    sync(&mut alice, 0).await;
    let id = open_post(&mut alice).await;
    type_text(&mut alice, "unfinished").await;
    recv_until(&mut alice, "03").await;
    drop(alice);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The open body is the evidence of incomplete state
    let body = queries::open_body(&app.store, id).unwrap().unwrap();
    assert_eq!(body, b"unfinished");
    assert!(queries::get_post(&app.store, id).unwrap().unwrap().open);
}

#[tokio::test]
async fn test_spam_threshold_demands_captcha() {
    let (url, app, _dir) = start_server().await;
    // Testing threshold is 200 with char score 8: ~25 chars trip it
    assert_eq!(app.config.spam_threshold, 200);

    let mut alice = connect(&url).await;
    sync(&mut alice, 0).await;
    open_post(&mut alice).await;
    type_text(&mut alice, &"a".repeat(30)).await;

    let frame = recv_until(&mut alice, "41").await;
    assert_eq!(frame, "41");

    // Further writes bounce with a throttle error
    send(&mut alice, "33104").await;
    let err = recv_until(&mut alice, "40").await;
    assert!(err.contains("throttled"));
}

#[tokio::test]
async fn test_two_watchers_observe_identical_order() {
    let (url, _app, _dir) = start_server().await;

    let mut bob = connect(&url).await;
    let mut carol = connect(&url).await;
    sync(&mut bob, 0).await;
    sync(&mut carol, 0).await;

    let mut alice = connect(&url).await;
    sync(&mut alice, 0).await;
    open_post(&mut alice).await;
    type_text(&mut alice, "race me").await;
    send(&mut alice, "35").await;

    let mut bob_seen = Vec::new();
    let mut carol_seen = Vec::new();
    loop {
        let frame = recv(&mut bob).await;
        let done = frame.starts_with("06");
        bob_seen.push(frame);
        if done {
            break;
        }
    }
    loop {
        let frame = recv(&mut carol).await;
        let done = frame.starts_with("06");
        carol_seen.push(frame);
        if done {
            break;
        }
    }
    assert_eq!(bob_seen, carol_seen);
}
