//! HTTP message model shared by the codec and the bridge.
//!
//! # Data Flow
//! ```text
//! accept side:  Raw bytes → codec → Head(request) + Content… → bridge session
//!               bridge session → Head(response) + Content… → codec → Raw bytes
//! connect side: the same with request and response swapped
//! ```

pub mod content;
pub mod cookie;
pub mod head;
pub mod headers;

pub use content::{ContentFrame, SharedBuffer};
pub use cookie::Cookie;
pub use head::{HttpHead, Message, StartLine, Version};
pub use headers::Headers;
