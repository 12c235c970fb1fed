//! Incremental HTTP/1.x decoder.
//!
//! # Design Decisions
//! - Heads are parsed with `httparse`; bodies are framed by Content-Length,
//!   chunked coding, or (responses only) the end of the connection
//! - Every body delimited by length or chunking ends with a zero-length
//!   content frame; read-until-close bodies end with the transport
//! - After a protocol switch the decoder stops parsing and emits raw bytes

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::BridgeError;
use crate::http::head::{is_bodyless_status, HttpHead, Message, Version};
use crate::http::headers::{self, Headers};
use crate::http::{ContentFrame, Cookie};

const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: usize = 1024;

/// What the decoder expects to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Passthrough,
}

#[derive(Debug)]
pub struct Decoder {
    mode: DecodeMode,
    max_header_bytes: usize,
    buf: BytesMut,
    state: State,
}

fn content(data: Bytes) -> Message {
    Message::Content(Arc::new(ContentFrame::new(data, false, false)))
}

fn terminal() -> Message {
    Message::Content(Arc::new(ContentFrame::terminal(false, false)))
}

fn parse_error(err: httparse::Error) -> BridgeError {
    match err {
        httparse::Error::TooManyHeaders => BridgeError::decode(431, "too many headers"),
        other => BridgeError::decode(400, other.to_string()),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::new();
    for header in parsed {
        headers.add(header.name, String::from_utf8_lossy(header.value).into_owned());
    }
    headers
}

fn is_upgrade_request(head: &HttpHead) -> bool {
    head.headers.contains(headers::UPGRADE) && head.headers.has_token(headers::CONNECTION, "upgrade")
}

impl Decoder {
    pub fn new(mode: DecodeMode, max_header_bytes: usize) -> Self {
        Self {
            mode,
            max_header_bytes,
            buf: BytesMut::new(),
            state: State::Head,
        }
    }

    /// Stop parsing; everything from now on is delivered raw.
    pub fn switch_to_passthrough(&mut self) {
        self.state = State::Passthrough;
    }

    pub fn is_passthrough(&self) -> bool {
        self.state == State::Passthrough
    }

    /// Feed bytes, returning every message they complete.
    ///
    /// `next_method` yields the method of the request a response answers,
    /// so responses to HEAD are known to be bodyless.
    pub fn decode(
        &mut self,
        input: &[u8],
        mut next_method: impl FnMut() -> Option<String>,
    ) -> Result<Vec<Message>, BridgeError> {
        self.buf.extend_from_slice(input);
        let mut out = Vec::new();
        loop {
            match self.state {
                State::Head => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let parsed = match self.mode {
                        DecodeMode::Request => self.parse_request()?,
                        DecodeMode::Response => self.parse_response()?,
                    };
                    let (mut head, consumed) = match parsed {
                        Some(parsed) => parsed,
                        None => {
                            if self.buf.len() > self.max_header_bytes {
                                return Err(BridgeError::decode(431, "header block too large"));
                            }
                            break;
                        }
                    };
                    self.buf.advance(consumed);
                    let next = self.body_state(&head, &mut next_method)?;
                    head.complete = next == State::Head || next == State::Passthrough;
                    self.state = next;
                    out.push(Message::Head(head));
                }
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64);
                    out.push(content(self.buf.split_to(take as usize).freeze()));
                    if take == remaining {
                        out.push(terminal());
                        self.state = State::Head;
                    } else {
                        self.state = State::Length(remaining - take);
                    }
                }
                State::Chunked(Chunk::Size) => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => break,
                    };
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16)
                        .map_err(|_| BridgeError::decode(400, "invalid chunk size"))?;
                    self.state = if size == 0 {
                        State::Chunked(Chunk::Trailer)
                    } else {
                        State::Chunked(Chunk::Data(size))
                    };
                }
                State::Chunked(Chunk::Data(remaining)) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64);
                    out.push(content(self.buf.split_to(take as usize).freeze()));
                    self.state = if take == remaining {
                        State::Chunked(Chunk::DataEnd)
                    } else {
                        State::Chunked(Chunk::Data(remaining - take))
                    };
                }
                State::Chunked(Chunk::DataEnd) => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(BridgeError::decode(400, "missing chunk terminator"));
                    }
                    self.buf.advance(2);
                    self.state = State::Chunked(Chunk::Size);
                }
                State::Chunked(Chunk::Trailer) => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => break,
                    };
                    if line.is_empty() {
                        out.push(terminal());
                        self.state = State::Head;
                    }
                }
                State::UntilClose => {
                    if self.buf.is_empty() {
                        break;
                    }
                    out.push(content(self.buf.split().freeze()));
                }
                State::Passthrough => {
                    if self.buf.is_empty() {
                        break;
                    }
                    out.push(Message::Raw(self.buf.split().freeze()));
                }
            }
        }
        Ok(out)
    }

    fn take_line(&mut self) -> Result<Option<String>, BridgeError> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.advance(end + 2);
                Ok(Some(line))
            }
            None if self.buf.len() > MAX_CHUNK_LINE => {
                Err(BridgeError::decode(400, "chunk line too long"))
            }
            None => Ok(None),
        }
    }

    fn parse_request(&self) -> Result<Option<(HttpHead, usize)>, BridgeError> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut parsed);
        let consumed = match request.parse(&self.buf).map_err(parse_error)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(None),
        };
        let mut head = HttpHead::request(
            request.method.unwrap_or("GET"),
            request.path.unwrap_or("/"),
            Version::from_minor(request.version.unwrap_or(1)),
        );
        head.headers = collect_headers(&*request.headers);
        if let Some(values) = head.headers.get(headers::COOKIE) {
            head.cookies = values.iter().flat_map(|v| Cookie::parse_request(v)).collect();
        }
        Ok(Some((head, consumed)))
    }

    fn parse_response(&self) -> Result<Option<(HttpHead, usize)>, BridgeError> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut parsed);
        let consumed = match response.parse(&self.buf).map_err(parse_error)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(None),
        };
        let mut head = HttpHead::response(
            response.code.unwrap_or(200),
            response.reason.unwrap_or(""),
            Version::from_minor(response.version.unwrap_or(1)),
        );
        head.headers = collect_headers(&*response.headers);
        if let Some(values) = head.headers.get(headers::SET_COOKIE) {
            head.cookies = values.iter().filter_map(|v| Cookie::parse_set_cookie(v)).collect();
        }
        Ok(Some((head, consumed)))
    }

    fn body_state(
        &self,
        head: &HttpHead,
        next_method: &mut impl FnMut() -> Option<String>,
    ) -> Result<State, BridgeError> {
        let chunked = head.headers.is_chunked();
        let length = match head.headers.first(headers::CONTENT_LENGTH) {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| BridgeError::decode(400, "invalid Content-Length"))?,
            ),
            None => None,
        };
        match head.status() {
            None => {
                if chunked {
                    Ok(State::Chunked(Chunk::Size))
                } else if let Some(n) = length.filter(|n| *n > 0) {
                    Ok(State::Length(n))
                } else if is_upgrade_request(head) {
                    Ok(State::Passthrough)
                } else {
                    Ok(State::Head)
                }
            }
            Some(101) => Ok(State::Passthrough),
            Some(status) if (100..200).contains(&status) => Ok(State::Head),
            Some(status) => {
                let method = next_method();
                if is_bodyless_status(status) || method.as_deref() == Some("HEAD") {
                    Ok(State::Head)
                } else if chunked {
                    Ok(State::Chunked(Chunk::Size))
                } else {
                    match length {
                        Some(0) => Ok(State::Head),
                        Some(n) => Ok(State::Length(n)),
                        None => Ok(State::UntilClose),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heads(messages: &[Message]) -> Vec<&HttpHead> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Head(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    fn body(messages: &[Message]) -> (String, bool) {
        let mut text = String::new();
        let mut ended = false;
        for m in messages {
            if let Message::Content(frame) = m {
                if frame.is_terminal() {
                    ended = true;
                } else {
                    text.push_str(&String::from_utf8_lossy(frame.data()));
                }
            }
        }
        (text, ended)
    }

    #[test]
    fn request_without_body() {
        let mut decoder = Decoder::new(DecodeMode::Request, 8192);
        let out = decoder
            .decode(b"GET /a/b HTTP/1.1\r\nHost: x\r\nCookie: a=1\r\n\r\n", || None)
            .unwrap();
        let head = heads(&out)[0];
        assert_eq!(head.method(), Some("GET"));
        assert_eq!(head.target(), Some("/a/b"));
        assert!(head.complete);
        assert_eq!(head.cookies[0].name, "a");
    }

    #[test]
    fn partial_head_then_length_body() {
        let mut decoder = Decoder::new(DecodeMode::Request, 8192);
        assert!(decoder.decode(b"POST / HTTP/1.1\r\nContent-Le", || None).unwrap().is_empty());
        let out = decoder.decode(b"ngth: 5\r\n\r\nhel", || None).unwrap();
        assert!(!heads(&out)[0].complete);
        assert_eq!(body(&out), ("hel".to_string(), false));
        let out = decoder.decode(b"lo", || None).unwrap();
        assert_eq!(body(&out), ("lo".to_string(), true));
    }

    #[test]
    fn chunked_response() {
        let mut decoder = Decoder::new(DecodeMode::Response, 8192);
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let out = decoder.decode(wire, || Some("GET".into())).unwrap();
        assert_eq!(body(&out), ("hello world".to_string(), true));
    }

    #[test]
    fn head_response_is_bodyless() {
        let mut decoder = Decoder::new(DecodeMode::Response, 8192);
        let out = decoder
            .decode(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", || Some("HEAD".into()))
            .unwrap();
        assert!(heads(&out)[0].complete);
    }

    #[test]
    fn switching_protocols_passes_rest_through() {
        let mut decoder = Decoder::new(DecodeMode::Response, 8192);
        let out = decoder
            .decode(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x00", || None)
            .unwrap();
        assert!(heads(&out)[0].is_switching_protocols());
        assert!(matches!(out.last(), Some(Message::Raw(b)) if &b[..] == b"\x81\x00"));
        assert!(decoder.is_passthrough());
    }

    #[test]
    fn read_until_close() {
        let mut decoder = Decoder::new(DecodeMode::Response, 8192);
        let out = decoder.decode(b"HTTP/1.0 200 OK\r\n\r\nabc", || None).unwrap();
        assert_eq!(body(&out), ("abc".to_string(), false));
    }

    #[test]
    fn malformed_head_is_400() {
        let mut decoder = Decoder::new(DecodeMode::Request, 8192);
        let err = decoder.decode(b"GET / HTTP/9.9\r\n\r\n", || None).unwrap_err();
        assert_eq!(err.response_status(), 400);
    }

    #[test]
    fn oversized_head_is_431() {
        let mut decoder = Decoder::new(DecodeMode::Request, 32);
        let err = decoder
            .decode(b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", || None)
            .unwrap_err();
        assert_eq!(err.response_status(), 431);
    }
}
