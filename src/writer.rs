//! Open-post mutation operations.
//!
//! Every operation requires the client to have an open post. The CPU
//! work — validation, buffer edits, message encoding — runs to
//! completion before any store write or feed enqueue, so a mutation is
//! never observable half-done. Length accounting is rune-accurate;
//! buffer offsets are byte-accurate. Splice rebuilds the buffer into a
//! fresh allocation because the previous one may still back a frame in
//! flight; append and backspace only touch the tail, and the feed
//! snapshot is taken at publish time.

use std::time::SystemTime;

use crate::error::PostError;
use crate::parser;
use crate::protocol::{
    self, CloseMessage, ImageRequest, InsertImageMessage, MessageType, PostRequest,
    SpliceMessage, SpliceRequest, StoleImageMessage,
};
use crate::store::queries;
use crate::subscription::{Client, SessionState};

/// The post a client is currently composing.
#[derive(Debug, Clone)]
pub struct OpenPost {
    pub id: u64,
    /// Owning thread
    pub op: u64,
    pub board: String,
    /// UTF-8 body buffer
    pub body: Vec<u8>,
    /// Body length in runes, never bytes
    pub len: usize,
    /// Line count; a body with no newline is one line
    pub lines: usize,
    pub spoilered: bool,
}

impl OpenPost {
    fn new(id: u64, op: u64, board: String) -> Self {
        Self {
            id,
            op,
            board,
            body: Vec::new(),
            len: 0,
            lines: 1,
            spoilered: false,
        }
    }

    fn body_str(&self) -> Result<&str, PostError> {
        std::str::from_utf8(&self.body).map_err(|e| PostError::Encode(e.to_string()))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Strip path components and control characters from an uploaded
/// filename, capping its length.
fn format_image_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);
    base.chars()
        .filter(|c| !c.is_control())
        .take(200)
        .collect()
}

impl Client {
    /// Open a new reply in a synced thread: allocate the id, make the
    /// post visible, hand the client its number.
    pub(crate) async fn reserve_post(&mut self, req: PostRequest) -> Result<(), PostError> {
        if self.state != SessionState::Synced {
            return Err(PostError::NotSynced);
        }
        if self.post.is_some() {
            return Err(PostError::AlreadyOpen);
        }
        let feed = self.feed_for(req.thread)?;

        let board = match self.app.store.hash_get(&queries::thread_key(req.thread), "board")? {
            Some(raw) => String::from_utf8(raw).map_err(|e| PostError::Encode(e.to_string()))?,
            None => return Err(PostError::UnknownThread(req.thread)),
        };

        let id = queries::reserve_post_id(&self.app.store)?;
        let view = protocol::PostView {
            id,
            op: req.thread,
            time: unix_now(),
            board: board.clone(),
            name: req.name.filter(|n| !n.is_empty()),
            trip: None,
            email: req.email.filter(|e| !e.is_empty()),
            sage: req.sage,
            body: String::new(),
            image: None,
        };
        let frame = protocol::encode(MessageType::InsertPost, &view)?;

        // On failure the reserved id is simply never used.
        queries::insert_post(&self.app.store, &view, &frame)?;
        self.app.registry.insert(id, req.thread);
        feed.insert_post(id, frame).await;

        self.post = Some(OpenPost::new(id, req.thread, board));
        self.send_frame(protocol::encode(MessageType::PostId, &id)?);
        Ok(())
    }

    /// Append one rune to the open body.
    pub(crate) async fn append_rune(&mut self, c: char) -> Result<(), PostError> {
        let max_body_len = self.app.config.max_body_len;
        let max_lines = self.app.config.max_lines;

        let post = self.post.as_mut().ok_or(PostError::NoPostOpen)?;
        if post.len + 1 > max_body_len {
            return Err(PostError::BodyTooLong);
        }
        parser::is_printable(c, true)?;
        if c == '\n' && post.lines + 1 > max_lines {
            return Err(PostError::TooManyLines);
        }

        let msg = protocol::encode(MessageType::Append, &(post.id, c as u32))?;

        let mut buf = [0u8; 4];
        post.body.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        post.len += 1;
        if c == '\n' {
            post.lines += 1;
        }

        self.update_body(msg, 1).await
    }

    /// Remove the trailing rune from the open body.
    pub(crate) async fn backspace(&mut self) -> Result<(), PostError> {
        let post = self.post.as_mut().ok_or(PostError::NoPostOpen)?;
        if post.len == 0 {
            return Err(PostError::EmptyPost);
        }

        let msg = protocol::encode(MessageType::Backspace, &post.id)?;

        let last = post
            .body_str()?
            .chars()
            .next_back()
            .ok_or(PostError::EmptyPost)?;
        let new_len = post.body.len() - last.len_utf8();
        post.body.truncate(new_len);
        post.len -= 1;
        if last == '\n' {
            post.lines -= 1;
        }

        self.update_body(msg, 1).await
    }

    /// Replace a rune range of the open body with new text.
    pub(crate) async fn splice_text(&mut self, req: SpliceRequest) -> Result<(), PostError> {
        let max_body_len = self.app.config.max_body_len;
        let max_lines = self.app.config.max_lines;

        parser::check_printable(&req.text, true)?;

        let post = self.post.as_mut().ok_or(PostError::NoPostOpen)?;
        if req.start > max_body_len || req.len > max_body_len || req.start + req.len > post.len {
            return Err(PostError::InvalidSpliceCoords {
                start: req.start,
                len: req.len,
                body_len: post.len,
            });
        }
        if req.len == 0 && req.text.is_empty() {
            return Err(PostError::SpliceNoop);
        }
        if req.text.len() > max_body_len {
            return Err(PostError::SpliceTooLong);
        }

        let old: Vec<char> = post.body_str()?.chars().collect();
        let mut end: Vec<char> = req.text.clone();
        end.extend_from_slice(&old[req.start + req.len..]);
        let mut new_len = post.len - req.len + req.text.len();

        let mut res = SpliceMessage {
            id: post.id,
            start: req.start as u64,
            len: req.len as u64,
            text: req.text.iter().collect(),
        };

        // Over the cap: trim the inserted text from the right and
        // widen the broadcast to cover the whole replaced tail, so
        // clients know everything after `start` changed.
        if new_len > max_body_len {
            let overflow = new_len - max_body_len;
            end = req.text[..req.text.len() - overflow].to_vec();
            end.extend_from_slice(&old[req.start + req.len..]);
            res.len = (old.len() - req.start) as u64;
            res.text = end.iter().collect();
            new_len = max_body_len;
        }

        // Rebuild into a fresh buffer; the old one may back a frame a
        // feed is still reading. Byte offset of `start` comes from the
        // prefix runes' UTF-8 lengths.
        let byte_start: usize = old[..req.start].iter().map(|c| c.len_utf8()).sum();
        let mut body = Vec::with_capacity(byte_start + res.text.len());
        body.extend_from_slice(&post.body[..byte_start]);
        let end_str: String = end.iter().collect();
        body.extend_from_slice(end_str.as_bytes());

        let lines = body.iter().filter(|&&b| b == b'\n').count() + 1;
        if lines > max_lines {
            return Err(PostError::TooManyLines);
        }

        let msg = protocol::encode(MessageType::Splice, &res)?;

        post.body = body;
        post.len = new_len;
        post.lines = lines;

        let scored = res.text.chars().count() as u64 + 1;
        self.update_body(msg, scored).await
    }

    /// Close the open post: run board filters, parse links and
    /// commands, maybe steal an image, then persist the final state.
    pub(crate) async fn close_post(&mut self) -> Result<(), PostError> {
        let (id, op, board, mut body, len) = {
            let post = self.post.as_ref().ok_or(PostError::NoPostOpen)?;
            (
                post.id,
                post.op,
                post.board.clone(),
                post.body_str()?.to_string(),
                post.len,
            )
        };
        let feed = self.feed_for(op)?;

        let mut links = Vec::new();
        let mut commands = Vec::new();

        if len != 0 {
            let policy = self.app.config.policy(&board);
            if !policy.register_filter(op, &body) {
                let old_len = body.chars().count() as u64;
                if policy.apply_filters(op, &mut body) {
                    let splice = SpliceMessage {
                        id,
                        start: 0,
                        len: old_len,
                        text: body.clone(),
                    };
                    let msg = protocol::encode(MessageType::Splice, &splice)?;
                    queries::set_open_body(&self.app.store, id, body.as_bytes())?;
                    feed.set_open_body(id, body.clone(), msg).await;
                }
            }

            let registry = self.app.registry.clone();
            let resolve = |n: u64| registry.lookup_or_fetch(n);
            let parsed = parser::parse_body(&body, id, &resolve, true);
            links = parsed.links;
            commands = parsed.commands;

            if policy.allows_image_theft() && body.contains("#steal") && !links.is_empty() {
                let from = links[links.len() - 1];
                if let Some(image) =
                    queries::transfer_image(&self.app.store, from.id, id, from.op, op)?
                {
                    self.spam_score(self.app.config.image_score);

                    let from_frame = protocol::encode(MessageType::StoleImageFrom, &from.id)?;
                    let to_frame = protocol::encode(
                        MessageType::StoleImageTo,
                        &StoleImageMessage { id, image },
                    )?;
                    // Both feeds hear about the transfer; the two
                    // publishes are not ordered against each other.
                    if from.op == op {
                        feed.send(from_frame).await;
                    } else {
                        match self.app.hub.get_or_create(from.op) {
                            Ok(from_feed) => from_feed.send(from_frame).await,
                            Err(e) => log::error!("steal source feed {}: {e}", from.op),
                        }
                    }
                    feed.send(to_frame).await;
                }
            }
        }

        queries::close_post(&self.app.store, id, &body, &links, &commands)?;
        let close_frame = protocol::encode(
            MessageType::ClosePost,
            &CloseMessage {
                id,
                links,
                commands,
            },
        )?;
        feed.close_post(id, close_frame).await;

        self.post = None;
        Ok(())
    }

    /// Attach a staged image to the open post.
    pub(crate) async fn insert_image(&mut self, req: ImageRequest) -> Result<(), PostError> {
        // Scored up front so the NOP branches cannot be spammed for
        // free.
        self.spam_score(self.app.config.char_score);

        let (id, op, board) = {
            let post = self.post.as_ref().ok_or(PostError::NoPostOpen)?;
            (post.id, post.op, post.board.clone())
        };

        // The store is authoritative: the image may have been stolen
        // since we last looked.
        if queries::has_image(&self.app.store, id)? {
            return Err(PostError::HasImage);
        }
        if self.app.config.board(&board).text_only {
            return Err(PostError::TextOnly);
        }

        let name = format_image_name(&req.name);
        let image =
            queries::insert_image(&self.app.store, id, op, &req.token, &name, req.spoiler)?;

        if let Some(post) = self.post.as_mut() {
            post.spoilered = req.spoiler;
        }
        let frame = protocol::encode(
            MessageType::InsertImage,
            &InsertImageMessage { id, image },
        )?;
        self.feed_for(op)?.insert_image(id, frame).await;
        Ok(())
    }

    /// Spoiler the open post's image. Idempotent.
    pub(crate) async fn spoiler_image(&mut self) -> Result<(), PostError> {
        self.spam_score(self.app.config.char_score);

        let (id, op) = {
            let post = self.post.as_ref().ok_or(PostError::NoPostOpen)?;
            (post.id, post.op)
        };

        let image = queries::post_image(&self.app.store, id)?.ok_or(PostError::NoImage)?;
        if image.spoiler {
            // Network latency can replay the request
            return Ok(());
        }

        queries::spoiler_image(&self.app.store, id)?;
        if let Some(post) = self.post.as_mut() {
            post.spoilered = true;
        }
        let frame = protocol::encode(MessageType::Spoiler, &id)?;
        self.feed_for(op)?.spoiler_image(id, frame).await;
        Ok(())
    }

    /// Persist the open body and broadcast the mutation that produced
    /// it. `chars` is the rune count the spam score charges for.
    async fn update_body(&mut self, msg: String, chars: u64) -> Result<(), PostError> {
        let (id, op, body) = {
            let post = self.post.as_ref().ok_or(PostError::NoPostOpen)?;
            (post.id, post.op, post.body_str()?.to_string())
        };

        queries::set_open_body(&self.app.store, id, body.as_bytes())?;
        self.spam_score(chars * self.app.config.char_score);
        self.feed_for(op)?.set_open_body(id, body, msg).await;
        Ok(())
    }
}
