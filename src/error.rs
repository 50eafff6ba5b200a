// Copyright 2020 Joyent, Inc.

//! Error types and the mapping from response status codes to errors.

use std::convert::TryFrom;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::{Response, ResponseStatus};

/// Canonical failure categories. Errors are matched against these instead of
/// against their message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InternalServerError,
    Invalid,
    Unknown,
    NoResponse,
    SessionClosed,
    HashCollision,
    DuplicateRequestId,
    Incomplete,
    Malformed,
    Decode,
    Transport,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "does not exist",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InternalServerError => "internal server error",
            ErrorKind::Invalid => "invalid argument",
            ErrorKind::Unknown => "unknown error",
            ErrorKind::NoResponse => "no response",
            ErrorKind::SessionClosed => "session closed",
            ErrorKind::HashCollision => "hash collision detected",
            ErrorKind::DuplicateRequestId => "duplicate request id",
            ErrorKind::Incomplete => "incomplete frame",
            ErrorKind::Malformed => "malformed frame",
            ErrorKind::Decode => "decode error",
            ErrorKind::Transport => "transport error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-OK status reported by the remote end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("nanorpc: {}", describe(.status, .msg))]
pub struct ResponseError {
    /// Raw status value as received, possibly outside of [`ResponseStatus`].
    pub status: i32,
    pub msg: String,
    pub kind: ErrorKind,
}

impl ResponseError {
    pub fn new(status: i32, msg: impl Into<String>) -> ResponseError {
        ResponseError {
            status,
            msg: msg.into(),
            kind: status_kind(status),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// The status this error represents, when it is a known one.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        ResponseStatus::try_from(self.status).ok()
    }
}

/// `not found: <msg>`, `unspecified: invalid status` or `unknown status 9`.
fn describe(status: &i32, msg: &str) -> String {
    let mut text = match ResponseStatus::try_from(*status) {
        // OK never becomes an error
        Ok(ResponseStatus::Ok) | Err(_) => format!("unknown status {}", status),
        Ok(ResponseStatus::Unspecified) => {
            format!("{}: invalid status", status_label(ResponseStatus::Unspecified))
        }
        Ok(known) => status_label(known),
    };

    if !msg.is_empty() {
        text.push_str(": ");
        text.push_str(msg);
    }
    text
}

/// `STATUS_NOT_FOUND` renders as `not found`.
fn status_label(status: ResponseStatus) -> String {
    let name = status.as_str_name();
    name.strip_prefix("STATUS_")
        .unwrap_or(name)
        .to_ascii_lowercase()
        .replace('_', " ")
}

fn status_kind(status: i32) -> ErrorKind {
    match ResponseStatus::try_from(status) {
        Ok(ResponseStatus::Ok) => ErrorKind::Unknown,
        Ok(ResponseStatus::NotFound) => ErrorKind::NotFound,
        Ok(ResponseStatus::NotAuthorized) => ErrorKind::PermissionDenied,
        Ok(ResponseStatus::InternalError) => ErrorKind::InternalServerError,
        Ok(ResponseStatus::Unspecified) => ErrorKind::Invalid,
        Err(_) => ErrorKind::Unknown,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// No reply arrived: the wait timed out or was abandoned.
    #[error("nanorpc: no response")]
    NoResponse,

    /// The session was torn down, either before a reply arrived or before
    /// the call was made.
    #[error("nanorpc: session closed")]
    SessionClosed,

    #[error(
        "nanorpc: hash collision detected: {path:?} and {existing:?} \
         both hash to {hash:#010x}"
    )]
    HashCollision {
        hash: u32,
        path: String,
        existing: String,
    },

    #[error("nanorpc: request id {0} is already in flight")]
    DuplicateRequestId(i32),

    #[error("nanorpc: invalid request: {0}")]
    InvalidRequest(&'static str),

    /// More bytes are needed before a frame can be decoded.
    #[error("nanorpc: incomplete frame")]
    Incomplete,

    #[error("nanorpc: malformed frame: {0}")]
    Malformed(String),

    #[error("nanorpc: failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("nanorpc: transport error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// An error carrying a response status, as request handlers report one.
    pub fn status(status: ResponseStatus, msg: impl Into<String>) -> Error {
        ResponseError::new(status as i32, msg).into()
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Response(e) => e.kind,
            Error::NoResponse => ErrorKind::NoResponse,
            Error::SessionClosed => ErrorKind::SessionClosed,
            Error::HashCollision { .. } => ErrorKind::HashCollision,
            Error::DuplicateRequestId(_) => ErrorKind::DuplicateRequestId,
            Error::InvalidRequest(_) => ErrorKind::Invalid,
            Error::Incomplete => ErrorKind::Incomplete,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Io(_) => ErrorKind::Transport,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }
}

/// Extracts an error from the status of a response. A missing response is
/// reported as [`Error::NoResponse`].
pub fn response_as_error(res: Option<&Response>) -> Result<(), Error> {
    let res = match res {
        Some(res) => res,
        None => return Err(Error::NoResponse),
    };

    if res.response_status == ResponseStatus::Ok as i32 {
        return Ok(());
    }

    Err(ResponseError::new(
        res.response_status,
        res.response_message.clone(),
    )
    .into())
}

pub fn is_not_found(err: &Error) -> bool {
    err.is(ErrorKind::NotFound)
}

pub fn is_not_authorized(err: &Error) -> bool {
    err.is(ErrorKind::PermissionDenied)
}

/// True when no response was received, including when the session was
/// closed before one could arrive.
pub fn is_no_response(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::NoResponse | ErrorKind::SessionClosed)
}
