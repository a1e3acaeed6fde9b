//! Wire protocol for the thread update feed.
//!
//! Every frame is text: a two-digit decimal message kind followed by a
//! JSON payload:
//!
//! ```text
//! ┌───────────┬──────────────────────┐
//! │ kind      │ payload              │
//! │ 2 digits  │ JSON, variable       │
//! └───────────┴──────────────────────┘
//! ```
//!
//! Server-to-client kinds occupy 02–11, client-to-server kinds 30–37,
//! session control 40–42. Splice payloads hold runes as a string on the
//! wire; the internal request form holds `Vec<char>` so splice
//! coordinates stay rune-accurate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message kinds. The numeric value is the wire prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// New post visible in a thread
    InsertPost = 2,
    /// Single rune appended to an open body: `[id, codepoint]`
    Append = 3,
    /// Trailing rune removed from an open body
    Backspace = 4,
    /// Range replacement in an open body
    Splice = 5,
    /// Post closed; body now immutable
    ClosePost = 6,
    /// Image attached to an open post
    InsertImage = 7,
    /// Image spoilered
    Spoiler = 8,
    /// Image transferred away from this post
    StoleImageFrom = 9,
    /// Image transferred onto this post
    StoleImageTo = 10,
    /// Post deleted
    DeletePost = 11,

    /// Client requests synchronisation to a thread from a cursor
    Synchronise = 30,
    /// Client opens a new reply
    ReservePost = 31,
    /// Reply to ReservePost carrying the allocated id
    PostId = 32,
    /// Client appends a rune to its open post
    ClientAppend = 33,
    /// Client removes the trailing rune
    ClientBackspace = 34,
    /// Client closes its open post
    ClientClosePost = 35,
    /// Client attaches a staged image
    ClientInsertImage = 36,
    /// Client spoilers its image
    ClientSpoilerImage = 37,

    /// Error surfaced to one client
    Error = 40,
    /// Client must solve a fresh captcha before its next write
    NeedCaptcha = 41,
    /// Synchronisation complete; carries the backlog cursor
    SyncDone = 42,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        use MessageType::*;
        Ok(match v {
            2 => InsertPost,
            3 => Append,
            4 => Backspace,
            5 => Splice,
            6 => ClosePost,
            7 => InsertImage,
            8 => Spoiler,
            9 => StoleImageFrom,
            10 => StoleImageTo,
            11 => DeletePost,
            30 => Synchronise,
            31 => ReservePost,
            32 => PostId,
            33 => ClientAppend,
            34 => ClientBackspace,
            35 => ClientClosePost,
            36 => ClientInsertImage,
            37 => ClientSpoilerImage,
            40 => Error,
            41 => NeedCaptcha,
            42 => SyncDone,
            _ => return Err(ProtocolError::UnknownType(v)),
        })
    }
}

/// Image attached to a post, as sent to clients and kept in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Original filename as uploaded
    pub name: String,
    /// Server-side filename
    pub file: String,
    /// Thumbnail filename
    pub thumb: String,
    pub md5: String,
    /// Source and thumbnail dimensions: `[src_w, src_h, thumb_w, thumb_h]`
    pub dims: [u16; 4],
    /// File size in bytes
    pub size: u64,
    #[serde(default)]
    pub spoiler: bool,
}

/// A `>>N` reference resolved to its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: u64,
    pub op: u64,
}

/// Result of a hash command embedded in a post body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum Command {
    Flip(bool),
    EightBall(String),
    Dice(Vec<u16>),
}

/// InsertPost payload. Also the shape of a post record handed to feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostView {
    pub id: u64,
    pub op: u64,
    pub time: u64,
    pub board: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub sage: bool,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

/// Splice broadcast: `{id, start, len, text}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceMessage {
    pub id: u64,
    pub start: u64,
    pub len: u64,
    pub text: String,
}

/// Splice request from a client, wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpliceRequestWire {
    pub start: u64,
    pub len: u64,
    pub text: String,
}

/// Splice request with the text expanded to runes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpliceRequest {
    pub start: usize,
    pub len: usize,
    pub text: Vec<char>,
}

impl From<SpliceRequestWire> for SpliceRequest {
    fn from(w: SpliceRequestWire) -> Self {
        Self {
            start: w.start as usize,
            len: w.len as usize,
            text: w.text.chars().collect(),
        }
    }
}

/// ClosePost broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
}

/// InsertImage broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertImageMessage {
    pub id: u64,
    pub image: Image,
}

/// StoleImageTo broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoleImageMessage {
    pub id: u64,
    pub image: Image,
}

/// Synchronise request: watch a thread from a backlog cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub thread: u64,
    #[serde(default)]
    pub cursor: u64,
}

/// Synchronisation acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDone {
    pub thread: u64,
    pub cursor: u64,
}

/// ReservePost request: open a new reply in a synced thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRequest {
    pub thread: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub sage: bool,
}

/// Image attachment request: claim a staged token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub spoiler: bool,
}

/// Error surfaced to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

/// Inbound messages as an explicit tagged union. The dispatch table is
/// a single match on this.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Synchronise(SyncRequest),
    ReservePost(PostRequest),
    Append(char),
    Backspace,
    ClosePost,
    Splice(SpliceRequest),
    InsertImage(ImageRequest),
    SpoilerImage,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame shorter than the two-digit prefix
    TooShort,
    /// Prefix is not two decimal digits
    BadPrefix,
    /// Unassigned message kind
    UnknownType(u8),
    /// This kind is not valid in this direction
    WrongDirection(u8),
    /// Payload failed to parse
    BadPayload(String),
    /// Payload failed to serialize
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame too short"),
            Self::BadPrefix => write!(f, "frame prefix is not two digits"),
            Self::UnknownType(v) => write!(f, "unknown message type: {v}"),
            Self::WrongDirection(v) => write!(f, "message type not valid inbound: {v}"),
            Self::BadPayload(e) => write!(f, "invalid payload: {e}"),
            Self::Encode(e) => write!(f, "payload serialization failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a message into its wire frame.
pub fn encode<T: Serialize>(typ: MessageType, payload: &T) -> Result<String, ProtocolError> {
    let json =
        serde_json::to_string(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(format!("{:02}{}", typ as u8, json))
}

/// Encode a payload-less frame.
pub fn encode_empty(typ: MessageType) -> String {
    format!("{:02}", typ as u8)
}

/// Split a frame into its kind and raw JSON payload.
pub fn split(frame: &str) -> Result<(MessageType, &str), ProtocolError> {
    let bytes = frame.as_bytes();
    if bytes.len() < 2 {
        return Err(ProtocolError::TooShort);
    }
    // Checked on raw bytes so a multi-byte rune at the front cannot
    // land us off a char boundary.
    if !bytes[0].is_ascii_digit() || !bytes[1].is_ascii_digit() {
        return Err(ProtocolError::BadPrefix);
    }
    let code = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
    Ok((MessageType::try_from(code)?, &frame[2..]))
}

/// Decode a JSON payload.
pub fn decode<T: DeserializeOwned>(json: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(json).map_err(|e| ProtocolError::BadPayload(e.to_string()))
}

/// Parse an inbound frame into the tagged union.
pub fn decode_client(frame: &str) -> Result<ClientMessage, ProtocolError> {
    let (typ, payload) = split(frame)?;
    Ok(match typ {
        MessageType::Synchronise => ClientMessage::Synchronise(decode(payload)?),
        MessageType::ReservePost => ClientMessage::ReservePost(decode(payload)?),
        MessageType::ClientAppend => {
            let code: u32 = decode(payload)?;
            let c = char::from_u32(code)
                .ok_or_else(|| ProtocolError::BadPayload(format!("bad codepoint: {code}")))?;
            ClientMessage::Append(c)
        }
        MessageType::ClientBackspace => ClientMessage::Backspace,
        MessageType::ClientClosePost => ClientMessage::ClosePost,
        MessageType::Splice => {
            let wire: SpliceRequestWire = decode(payload)?;
            ClientMessage::Splice(wire.into())
        }
        MessageType::ClientInsertImage => ClientMessage::InsertImage(decode(payload)?),
        MessageType::ClientSpoilerImage => ClientMessage::SpoilerImage,
        other => return Err(ProtocolError::WrongDirection(other as u8)),
    })
}
