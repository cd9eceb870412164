//! KDL configuration parsing for the depot build queue.
//!
//! This crate handles:
//! - System configuration (`depot.kdl`) with environment overrides
//! - Duration literals such as `"30m"` or `"250ms"`
//! - Variable interpolation for image references

pub mod duration;
pub mod error;
pub mod system;
pub mod variables;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    BuildSettings, CallbackConfig, ServerConfig, StoreBackend, StoreConfig, SystemConfig,
    WorkerConfig,
};
pub use variables::{VariableContext, VariableContextBuilder};
