//! Domain operations over the engine primitives.
//!
//! Key namespace:
//! - `post:{n}` hash — author fields, state, image, body once closed
//! - `post:{n}:body` string — present only while the post is open
//! - `post:{n}:links` hash — link id → target thread
//! - `thread:{op}` hash — board, creation time, bump reference
//! - `thread:{op}:posts` list — reply ids in insertion order
//! - `thread:{op}:history` list — backlog messages, index == counter-1
//! - `thread:{op}:imgctr` / `:hctr` counters
//! - `tag:{board}:threads` zset scored by last bump
//! - `tag:{board}:bumpctr` counter
//! - `threads` list — all thread ids, for startup scans
//! - `MD5s` hash — image md5 → owning post
//! - `image_token:{tok}` TTL'd staged image
//! - `postctr` global post id counter

use std::time::Duration;

use crate::error::PostError;
use crate::protocol::{Command, Image, Link, PostView};

use super::{Store, StoreError};

pub fn post_key(id: u64) -> String {
    format!("post:{id}")
}

pub fn open_body_key(id: u64) -> String {
    format!("post:{id}:body")
}

pub fn links_key(id: u64) -> String {
    format!("post:{id}:links")
}

pub fn thread_key(op: u64) -> String {
    format!("thread:{op}")
}

pub fn thread_posts_key(op: u64) -> String {
    format!("thread:{op}:posts")
}

pub fn history_key(op: u64) -> String {
    format!("thread:{op}:history")
}

/// Pub/sub channel carrying a thread's update messages.
pub fn thread_channel(op: u64) -> String {
    format!("thread:{op}")
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, StoreError> {
    let (v, _) = bincode::serde::decode_from_slice(raw, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(v)
}

fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Corrupt("expected 8-byte integer".into()))?;
    Ok(u64::from_be_bytes(arr))
}

// ─── Post lifecycle ──────────────────────────────────────────────────

/// Allocate the next post id. Ids may end up unused if the insert
/// never happens; gaps are fine.
pub fn reserve_post_id(store: &Store) -> Result<u64, StoreError> {
    store.incr("postctr", 1)
}

pub fn thread_exists(store: &Store, op: u64) -> Result<bool, StoreError> {
    store.hash_exists(&thread_key(op), "board")
}

/// Create a thread container. The OP post itself goes in via
/// [`insert_post`] with `id == op`.
pub fn insert_thread(store: &Store, op: u64, board: &str, time: u64) -> Result<u64, StoreError> {
    let bump = store.incr(&format!("tag:{board}:bumpctr"), 1)?;
    store
        .multi()
        .hash_set(&thread_key(op), "board", board.as_bytes().to_vec())
        .hash_set(&thread_key(op), "time", time.to_be_bytes().to_vec())
        .hash_set(&thread_key(op), "bump", bump.to_be_bytes().to_vec())
        .zset_add(&format!("tag:{board}:threads"), &op.to_string(), bump)
        .list_push("threads", op.to_be_bytes().to_vec())
        .commit()?;
    Ok(bump)
}

/// Make a reserved post visible: first store write plus the InsertPost
/// publish on the thread channel. Bumps the thread unless saged.
pub fn insert_post(store: &Store, view: &PostView, frame: &str) -> Result<(), StoreError> {
    if !thread_exists(store, view.op)? {
        return Err(StoreError::NotFound(thread_key(view.op)));
    }

    let key = post_key(view.id);
    let mut m = store
        .multi()
        .hash_set(&key, "board", view.board.as_bytes().to_vec())
        .hash_set(&key, "op", view.op.to_be_bytes().to_vec())
        .hash_set(&key, "time", view.time.to_be_bytes().to_vec())
        .hash_set(&key, "open", vec![1])
        .hash_set(&key, "sage", vec![view.sage as u8]);

    if let Some(name) = &view.name {
        m = m.hash_set(&key, "name", name.as_bytes().to_vec());
    }
    if let Some(trip) = &view.trip {
        m = m.hash_set(&key, "trip", trip.as_bytes().to_vec());
    }
    if let Some(email) = &view.email {
        m = m.hash_set(&key, "email", email.as_bytes().to_vec());
    }
    if let Some(image) = &view.image {
        m = m
            .hash_set(&key, "image", encode(image)?)
            .hash_set_nx("MD5s", &image.md5, view.id.to_be_bytes().to_vec());
    }
    if view.id != view.op {
        m = m.list_push(&thread_posts_key(view.op), view.id.to_be_bytes().to_vec());
    }
    if !view.sage || view.id == view.op {
        let bump = store.incr(&format!("tag:{}:bumpctr", view.board), 1)?;
        m = m
            .zset_add(
                &format!("tag:{}:threads", view.board),
                &view.op.to_string(),
                bump,
            )
            .hash_set(&thread_key(view.op), "bump", bump.to_be_bytes().to_vec());
    }
    m.publish(&thread_channel(view.op), frame).commit()
}

/// Replace the open-body side key. Called on every body mutation.
pub fn set_open_body(store: &Store, id: u64, body: &[u8]) -> Result<(), StoreError> {
    // One retry at the operation boundary; the write is a plain
    // replace, so retrying is safe.
    match store.string_set(&open_body_key(id), body, None) {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!("open body write failed, retrying: {first}");
            store.string_set(&open_body_key(id), body, None)
        }
    }
}

pub fn open_body(store: &Store, id: u64) -> Result<Option<Vec<u8>>, StoreError> {
    store.string_get(&open_body_key(id))
}

/// Persist a close: final body, open-body key dropped, links and
/// commands recorded, state cleared — one commit.
pub fn close_post(
    store: &Store,
    id: u64,
    body: &str,
    links: &[Link],
    commands: &[Command],
) -> Result<(), StoreError> {
    let key = post_key(id);
    let compressed = lz4_flex::compress_prepend_size(body.as_bytes());
    let mut m = store
        .multi()
        .hash_set(&key, "body", compressed)
        .hash_set(&key, "open", vec![0])
        .string_del(&open_body_key(id));
    for link in links {
        m = m.hash_set(&links_key(id), &link.id.to_string(), link.op.to_be_bytes().to_vec());
    }
    if !commands.is_empty() {
        m = m.hash_set(&key, "commands", encode(&commands.to_vec())?);
    }
    m.commit()
}

/// A post assembled back out of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PostData {
    pub view: PostView,
    pub open: bool,
}

pub fn get_post(store: &Store, id: u64) -> Result<Option<PostData>, StoreError> {
    let fields = store.hash_get_all(&post_key(id))?;
    if fields.is_empty() {
        return Ok(None);
    }

    let mut view = PostView {
        id,
        op: 0,
        time: 0,
        board: String::new(),
        name: None,
        trip: None,
        email: None,
        sage: false,
        body: String::new(),
        image: None,
    };
    let mut open = false;

    for (field, raw) in fields {
        match field.as_str() {
            "board" => {
                view.board =
                    String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?
            }
            "op" => view.op = decode_u64(&raw)?,
            "time" => view.time = decode_u64(&raw)?,
            "name" => {
                view.name =
                    Some(String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?)
            }
            "trip" => {
                view.trip =
                    Some(String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?)
            }
            "email" => {
                view.email =
                    Some(String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?)
            }
            "sage" => view.sage = raw == [1],
            "open" => open = raw == [1],
            "image" => view.image = Some(decode(&raw)?),
            "body" => {
                let bytes = lz4_flex::decompress_size_prepended(&raw)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                view.body =
                    String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            }
            _ => {}
        }
    }

    if open {
        if let Some(body) = open_body(store, id)? {
            view.body =
                String::from_utf8(body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }
    }
    Ok(Some(PostData { view, open }))
}

pub fn post_links(store: &Store, id: u64) -> Result<Vec<Link>, StoreError> {
    let mut links = Vec::new();
    for (field, raw) in store.hash_get_all(&links_key(id))? {
        let link_id = field
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad link field: {field}")))?;
        links.push(Link {
            id: link_id,
            op: decode_u64(&raw)?,
        });
    }
    Ok(links)
}

/// Delete a post entirely: record, links, open body, reply-list entry,
/// MD5 claim. Publishes `frame` on the thread channel so the registry
/// forgets the mapping.
pub fn delete_post(store: &Store, id: u64, op: u64, frame: &str) -> Result<(), StoreError> {
    let md5 = match store.hash_get(&post_key(id), "image")? {
        Some(raw) => Some(decode::<Image>(&raw)?.md5),
        None => None,
    };
    let mut m = store
        .multi()
        .hash_del_all(&post_key(id))
        .hash_del_all(&links_key(id))
        .string_del(&open_body_key(id))
        .list_remove(&thread_posts_key(op), id.to_be_bytes().to_vec());
    if let Some(md5) = md5 {
        m = m.hash_del("MD5s", &md5);
    }
    m.publish(&thread_channel(op), frame).commit()
}

// ─── Images ──────────────────────────────────────────────────────────

/// Stage a thumbnailed image under a token the client can claim. The
/// thumbnailer calls this; it is also the test entry point.
pub fn stage_image(
    store: &Store,
    token: &str,
    image: &Image,
    ttl: Duration,
) -> Result<(), StoreError> {
    store.string_set(&format!("image_token:{token}"), &encode(image)?, Some(ttl))
}

pub fn has_image(store: &Store, id: u64) -> Result<bool, StoreError> {
    store.hash_exists(&post_key(id), "image")
}

pub fn post_image(store: &Store, id: u64) -> Result<Option<Image>, StoreError> {
    match store.hash_get(&post_key(id), "image")? {
        Some(raw) => Ok(Some(decode(&raw)?)),
        None => Ok(None),
    }
}

/// Claim a staged image for a post: token consumed, MD5 uniqueness
/// recorded, image bound, thread image counter bumped — one commit.
pub fn insert_image(
    store: &Store,
    id: u64,
    op: u64,
    token: &str,
    name: &str,
    spoiler: bool,
) -> Result<Image, PostError> {
    let token_key = format!("image_token:{token}");
    let raw = store
        .string_get(&token_key)?
        .ok_or(PostError::UnknownToken)?;
    let mut image: Image = decode(&raw)?;
    image.name = name.to_string();
    image.spoiler = spoiler;

    let res = store
        .multi()
        .string_take(&token_key)
        .hash_set_nx("MD5s", &image.md5, id.to_be_bytes().to_vec())
        .hash_set(&post_key(id), "image", encode(&image)?)
        .incr(&format!("thread:{op}:imgctr"), 1)
        .commit();
    match res {
        Ok(()) => Ok(image),
        Err(StoreError::NotFound(_)) => Err(PostError::UnknownToken),
        Err(StoreError::Conflict(_)) => Err(PostError::DuplicateImage),
        Err(e) => Err(e.into()),
    }
}

/// Set the spoiler flag on a post's image.
pub fn spoiler_image(store: &Store, id: u64) -> Result<(), StoreError> {
    let mut image = match post_image(store, id)? {
        Some(img) => img,
        None => return Err(StoreError::NotFound(post_key(id))),
    };
    image.spoiler = true;
    store.hash_set(&post_key(id), "image", &encode(&image)?)
}

/// Move an image between posts atomically. Returns `None` if the
/// source post has no image (it may have been stolen first).
pub fn transfer_image(
    store: &Store,
    from: u64,
    to: u64,
    from_op: u64,
    to_op: u64,
) -> Result<Option<Image>, StoreError> {
    let raw = match store.hash_get(&post_key(from), "image")? {
        Some(r) => r,
        None => return Ok(None),
    };
    let image: Image = decode(&raw)?;

    let res = store
        .multi()
        .hash_take(&post_key(from), "image")
        .hash_set(&post_key(to), "image", raw)
        .hash_set("MD5s", &image.md5, to.to_be_bytes().to_vec())
        .incr(&format!("thread:{from_op}:imgctr"), -1)
        .incr(&format!("thread:{to_op}:imgctr"), 1)
        .commit();
    match res {
        Ok(()) => Ok(Some(image)),
        // Lost the race with another steal
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// ─── Scans ───────────────────────────────────────────────────────────

pub fn thread_ids(store: &Store) -> Result<Vec<u64>, StoreError> {
    store
        .list_range("threads", 0, u64::MAX)?
        .iter()
        .map(|raw| decode_u64(raw))
        .collect()
}

pub fn thread_replies(store: &Store, op: u64) -> Result<Vec<u64>, StoreError> {
    store
        .list_range(&thread_posts_key(op), 0, u64::MAX)?
        .iter()
        .map(|raw| decode_u64(raw))
        .collect()
}

pub fn thread_image_count(store: &Store, op: u64) -> Result<u64, StoreError> {
    store.counter(&format!("thread:{op}:imgctr"))
}
