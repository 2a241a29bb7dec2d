//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (structural checks)
//!     → RouterConfig (validated, immutable)
//!     → flow_control.rs (per-biz clamped FlowControlPolicy)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → ConfigReload (sections that differ from the last accepted config)
//!     → Router::apply_reload touches only those sections
//! ```
//!
//! # Design Decisions
//! - Structural errors reject the file; tunable values are clamped with a warning
//! - All fields have defaults to allow minimal configs
//! - Policies are passed by reference, there is no global mutable knob

pub mod flow_control;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use flow_control::{FlowControlPolicy, FlowControlRegistry};
pub use loader::{load_config, ConfigError};
pub use schema::{FlowControlConfig, HashPolicyKind, MiscConfig, ObservabilityConfig, RouterConfig};
pub use watcher::{ConfigReload, ConfigWatcher};
