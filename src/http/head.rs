//! Message heads and the messages that travel through a pipeline.

use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;

use crate::http::content::ContentFrame;
use crate::http::cookie::Cookie;
use crate::http::headers::Headers;

pub const SWITCHING_PROTOCOLS: u16 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn from_minor(minor: u8) -> Self {
        if minor == 0 {
            Version::Http10
        } else {
            Version::Http11
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, target: String },
    Response { status: u16, reason: String },
}

/// Image of a request or response head at the moment it is sent or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    pub start: StartLine,
    pub version: Version,
    pub headers: Headers,
    /// Written as `Set-Cookie` (responses) or folded into `Cookie` (requests).
    pub cookies: Vec<Cookie>,
    /// No body follows this head.
    pub complete: bool,
}

impl HttpHead {
    pub fn request(method: impl Into<String>, target: impl Into<String>, version: Version) -> Self {
        Self {
            start: StartLine::Request {
                method: method.into(),
                target: target.into(),
            },
            version,
            headers: Headers::new(),
            cookies: Vec::new(),
            complete: false,
        }
    }

    pub fn response(status: u16, reason: impl Into<String>, version: Version) -> Self {
        Self {
            start: StartLine::Response {
                status,
                reason: reason.into(),
            },
            version,
            headers: Headers::new(),
            cookies: Vec::new(),
            complete: false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status() == Some(SWITCHING_PROTOCOLS)
    }
}

/// Unit of data flowing through a transport pipeline.
#[derive(Debug, Clone)]
pub enum Message {
    Head(HttpHead),
    Content(Arc<ContentFrame>),
    /// Bytes already in wire form.
    Raw(Bytes),
}

impl Message {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Head(_) => "head",
            Message::Content(_) => "content",
            Message::Raw(_) => "raw",
        }
    }
}

/// Default reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

/// 1xx, 204 and 304 responses never carry a body.
pub fn is_bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_phrases_cover_registered_codes() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(401), "Unauthorized");
        assert_eq!(reason_phrase(403), "Forbidden");
        assert_eq!(reason_phrase(429), "Too Many Requests");
        assert_eq!(reason_phrase(504), "Gateway Timeout");
        assert_eq!(reason_phrase(599), "Unknown");
    }
}
