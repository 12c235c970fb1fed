//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Bridge, pool, upgrade and transport code produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Session and connection ids are structured fields on every event
//! - Metric names live in one place (`metrics.rs`)

pub mod logging;
pub mod metrics;
