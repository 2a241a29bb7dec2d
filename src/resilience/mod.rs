//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call in flight (CallContext):
//!     → retry.rs polls on an interval
//!         - caller satisfied → Done
//!         - enough answered and stragglers late → EarlyTerminated
//!         - late partition → Replica::backup_provider
//!             → rate_limit.rs (per-biz token bucket)
//!             → CallContext::dispatch_retry → Retrying
//! ```
//!
//! # Design Decisions
//! - The coordinator decides whether and where to retry; transport does the I/O
//! - A wait factor of 0 disables early termination or retry
//! - Retry budgets are per biz so one noisy biz cannot starve another

pub mod rate_limit;
pub mod retry;

pub use rate_limit::RetryRateLimiter;
pub use retry::{CallContext, CoordinatorState, PendingPartition, ReplySummary, RetryCoordinator};
