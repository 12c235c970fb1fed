//! Content frames and shared outbound buffers.
//!
//! # Design Decisions
//! - A frame carries the session's `chunked`/`gzipped` flags; the codec
//!   turns it into wire bytes once and memoises the result on the frame
//! - A `SharedBuffer` (e.g. a cached static resource) keeps one frame per
//!   encoding variant, so sessions asking for the same variant reuse the
//!   same encoded bytes
//! - A zero-length frame terminates the body

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const VARIANT_PLAIN: &str = "plain";
pub const VARIANT_PLAIN_CHUNKED: &str = "plain/chunked";
pub const VARIANT_GZIP: &str = "gzip";
pub const VARIANT_GZIP_CHUNKED: &str = "gzip/chunked";

/// Encoding variant key for a flag pair.
pub fn variant(chunked: bool, gzipped: bool) -> &'static str {
    match (gzipped, chunked) {
        (false, false) => VARIANT_PLAIN,
        (false, true) => VARIANT_PLAIN_CHUNKED,
        (true, false) => VARIANT_GZIP,
        (true, true) => VARIANT_GZIP_CHUNKED,
    }
}

/// A piece of body tagged with how it must be framed on the wire.
#[derive(Debug)]
pub struct ContentFrame {
    data: Bytes,
    chunked: bool,
    gzipped: bool,
    encoded: OnceLock<Bytes>,
}

impl ContentFrame {
    pub fn new(data: Bytes, chunked: bool, gzipped: bool) -> Self {
        Self {
            data,
            chunked,
            gzipped,
            encoded: OnceLock::new(),
        }
    }

    /// Zero-length frame marking the end of a body.
    pub fn terminal(chunked: bool, gzipped: bool) -> Self {
        Self::new(Bytes::new(), chunked, gzipped)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_gzipped(&self) -> bool {
        self.gzipped
    }

    pub fn is_terminal(&self) -> bool {
        self.data.is_empty()
    }

    pub fn variant(&self) -> &'static str {
        variant(self.chunked, self.gzipped)
    }

    /// Wire bytes for this frame, computed on first use.
    pub fn encoded(&self) -> Bytes {
        self.encoded
            .get_or_init(|| encode_frame(&self.data, self.chunked, self.gzipped))
            .clone()
    }

    pub(crate) fn is_encoded(&self) -> bool {
        self.encoded.get().is_some()
    }
}

fn encode_frame(data: &Bytes, chunked: bool, gzipped: bool) -> Bytes {
    let payload = if gzipped && !data.is_empty() {
        gzip(data)
    } else {
        data.clone()
    };
    if !chunked {
        return payload;
    }
    if payload.is_empty() {
        return Bytes::from_static(b"0\r\n\r\n");
    }
    let mut out = BytesMut::with_capacity(payload.len() + 12);
    out.put_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    out.put_slice(&payload);
    out.put_slice(b"\r\n");
    out.freeze()
}

// Each frame becomes one gzip member; concatenated members form a valid stream.
fn gzip(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    if encoder.write_all(data).is_err() {
        return Bytes::copy_from_slice(data);
    }
    match encoder.finish() {
        Ok(compressed) => Bytes::from(compressed),
        Err(_) => Bytes::copy_from_slice(data),
    }
}

/// Outbound body buffer that may be shared between sessions.
#[derive(Debug)]
pub struct SharedBuffer {
    data: Bytes,
    frames: Mutex<HashMap<&'static str, Arc<ContentFrame>>>,
}

impl SharedBuffer {
    pub fn new(data: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            data: data.into(),
            frames: Mutex::new(HashMap::new()),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The frame for this variant, created once and reused afterwards.
    pub fn frame(&self, chunked: bool, gzipped: bool) -> Arc<ContentFrame> {
        let key = variant(chunked, gzipped);
        let mut frames = self.frames.lock().expect("shared buffer mutex poisoned");
        frames
            .entry(key)
            .or_insert_with(|| Arc::new(ContentFrame::new(self.data.clone(), chunked, gzipped)))
            .clone()
    }
}
