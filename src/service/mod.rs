//! Services bound into the gateway's binding table.
//!
//! # Data Flow
//! ```text
//! accept session → ProxyHandler → connect session → backend
//!     ← response head, body ← Upstream handler ←
//!
//! status 101: both transports → PipeHandler pair (raw relay)
//! ```

pub mod pipe;
pub mod proxy;

pub use pipe::{PipeHandler, PipeLink, Side};
pub use proxy::ProxyHandler;
