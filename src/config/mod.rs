//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → Gateway (held in an ArcSwap)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads + validates
//!     → Gateway::apply diffs services and swaps the live config
//! ```
//!
//! # Design Decisions
//! - A loaded config is never mutated; reloads replace it whole
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{AdminConfig, GatewayConfig, HttpConfig, ListenerConfig, ObservabilityConfig, ServiceConfig};
