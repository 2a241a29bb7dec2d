//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (per-biz gauges, miss and call counters)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Whatever `metrics` recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event, no string formatting of values
//! - Metrics are cheap (atomic increments in the recorder)

pub mod logging;
pub mod metrics;
