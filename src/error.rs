//! Error taxonomy for post mutation and session handling.
//!
//! Every error carries a [`ErrorKind`] deciding how it propagates:
//! validation and protocol errors go back to the offending client only,
//! transient errors are retried once at the operation boundary, fatal
//! errors abort the operation and are logged, throttle errors carry a
//! captcha requirement.

use crate::store::StoreError;

/// How an error propagates through the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client-supplied data breaks a content rule. Surfaced to the
    /// offending client; the connection stays open.
    Validation,
    /// Malformed frame or impossible state transition. May escalate
    /// captcha via the throttle.
    Protocol,
    /// Store transport failure or timeout. Retried once, then surfaced
    /// as a generic error. The open post is left intact.
    Transient,
    /// Invariant violation. Logged; the operation is aborted.
    Fatal,
    /// Spam score or IP throttle hit. Soft error carrying a captcha
    /// challenge requirement.
    Throttle,
}

/// Errors produced by post mutation operations and session dispatch.
#[derive(Debug, Clone)]
pub enum PostError {
    NoPostOpen,
    AlreadyOpen,
    EmptyPost,
    BodyTooLong,
    TooManyLines,
    SpliceTooLong,
    SpliceNoop,
    InvalidSpliceCoords {
        start: usize,
        len: usize,
        body_len: usize,
    },
    ContainsNull,
    NotPrintable(u32),
    TextOnly,
    HasImage,
    NoImage,
    UnknownToken,
    DuplicateImage,
    NotSynced,
    UnknownThread(u64),
    Throttled,
    BadFrame(String),
    Encode(String),
    Store(StoreError),
}

impl PostError {
    /// Stable error code sent to clients in `Error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPostOpen => "no_post_open",
            Self::AlreadyOpen => "already_open",
            Self::EmptyPost => "empty_post",
            Self::BodyTooLong => "body_too_long",
            Self::TooManyLines => "too_many_lines",
            Self::SpliceTooLong => "splice_too_long",
            Self::SpliceNoop => "splice_noop",
            Self::InvalidSpliceCoords { .. } => "invalid_splice_coords",
            Self::ContainsNull => "contains_null",
            Self::NotPrintable(_) => "not_printable",
            Self::TextOnly => "text_only",
            Self::HasImage => "has_image",
            Self::NoImage => "no_image",
            Self::UnknownToken => "unknown_token",
            Self::DuplicateImage => "duplicate_image",
            Self::NotSynced => "not_synced",
            Self::UnknownThread(_) => "unknown_thread",
            Self::Throttled => "throttled",
            Self::BadFrame(_) => "bad_frame",
            Self::Encode(_) => "internal",
            Self::Store(_) => "internal",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyPost
            | Self::BodyTooLong
            | Self::TooManyLines
            | Self::SpliceTooLong
            | Self::SpliceNoop
            | Self::InvalidSpliceCoords { .. }
            | Self::ContainsNull
            | Self::NotPrintable(_)
            | Self::DuplicateImage => ErrorKind::Validation,
            Self::NoPostOpen
            | Self::AlreadyOpen
            | Self::TextOnly
            | Self::HasImage
            | Self::NoImage
            | Self::UnknownToken
            | Self::NotSynced
            | Self::BadFrame(_) => ErrorKind::Protocol,
            Self::UnknownThread(_) | Self::Encode(_) => ErrorKind::Fatal,
            Self::Throttled => ErrorKind::Throttle,
            Self::Store(e) => match e {
                StoreError::Conflict(_) | StoreError::NotFound(_) => ErrorKind::Fatal,
                _ => ErrorKind::Transient,
            },
        }
    }
}

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPostOpen => write!(f, "no post open"),
            Self::AlreadyOpen => write!(f, "a post is already open"),
            Self::EmptyPost => write!(f, "post body empty"),
            Self::BodyTooLong => write!(f, "post body too long"),
            Self::TooManyLines => write!(f, "too many lines in post body"),
            Self::SpliceTooLong => write!(f, "splice text too long"),
            Self::SpliceNoop => write!(f, "splice NOOP"),
            Self::InvalidSpliceCoords {
                start,
                len,
                body_len,
            } => write!(
                f,
                "invalid splice coordinates: start={start} len={len} body_len={body_len}"
            ),
            Self::ContainsNull => write!(f, "text contains null character"),
            Self::NotPrintable(c) => write!(f, "contains non-printable character: {c}"),
            Self::TextOnly => write!(f, "text only board"),
            Self::HasImage => write!(f, "post already has image"),
            Self::NoImage => write!(f, "post does not have an image"),
            Self::UnknownToken => write!(f, "unknown image token"),
            Self::DuplicateImage => write!(f, "image already posted"),
            Self::NotSynced => write!(f, "not synchronised to any thread"),
            Self::UnknownThread(op) => write!(f, "no such thread: {op}"),
            Self::Throttled => write!(f, "spam score exceeded, solve a captcha"),
            Self::BadFrame(s) => write!(f, "malformed frame: {s}"),
            Self::Encode(s) => write!(f, "message encoding failed: {s}"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for PostError {}

impl From<StoreError> for PostError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<crate::protocol::ProtocolError> for PostError {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        Self::Encode(e.to_string())
    }
}
