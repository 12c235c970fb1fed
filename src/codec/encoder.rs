//! Head serialization.

use std::fmt::Write as _;

use bytes::Bytes;

use crate::error::BridgeError;
use crate::http::head::{HttpHead, StartLine};

fn invalid(value: &str) -> bool {
    value.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// Render a head, including its cookies, in HTTP/1.x wire form.
pub fn encode_head(head: &HttpHead) -> Result<Bytes, BridgeError> {
    let mut out = String::with_capacity(256);
    match &head.start {
        StartLine::Request { method, target } => {
            let _ = write!(out, "{} {} {}\r\n", method, target, head.version);
        }
        StartLine::Response { status, reason } => {
            let _ = write!(out, "{} {} {}\r\n", head.version, status, reason);
        }
    }
    for (name, values) in head.headers.iter() {
        if invalid(name) || name.contains(':') {
            return Err(BridgeError::illegal_state(0, format!("invalid header name {:?}", name)));
        }
        for value in values {
            if invalid(value) {
                return Err(BridgeError::illegal_state(0, format!("invalid value for header {}", name)));
            }
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
    }
    if !head.cookies.is_empty() {
        match head.start {
            StartLine::Response { .. } => {
                for cookie in &head.cookies {
                    let _ = write!(out, "Set-Cookie: {}\r\n", cookie);
                }
            }
            StartLine::Request { .. } => {
                let pairs: Vec<String> = head.cookies.iter().map(|c| c.pair()).collect();
                let _ = write!(out, "Cookie: {}\r\n", pairs.join("; "));
            }
        }
    }
    out.push_str("\r\n");
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Cookie, Version};

    #[test]
    fn response_head() {
        let mut head = HttpHead::response(200, "OK", Version::Http11);
        head.headers.set("Content-Length", "5");
        head.cookies.push(Cookie::new("sid", "1"));
        let bytes = encode_head(&head).unwrap();
        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nSet-Cookie: sid=1\r\n\r\n"
        );
    }

    #[test]
    fn request_cookies_fold() {
        let mut head = HttpHead::request("GET", "/a", Version::Http10);
        head.cookies.push(Cookie::new("a", "1"));
        head.cookies.push(Cookie::new("b", "2"));
        let bytes = encode_head(&head).unwrap();
        assert_eq!(&bytes[..], b"GET /a HTTP/1.0\r\nCookie: a=1; b=2\r\n\r\n");
    }

    #[test]
    fn rejects_header_injection() {
        let mut head = HttpHead::response(200, "OK", Version::Http11);
        head.headers.set("X-Evil", "a\r\nb: c");
        assert!(encode_head(&head).is_err());
    }
}
