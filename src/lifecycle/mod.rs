//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build policies and topology → Spawn loops
//!
//! Shutdown (shutdown.rs):
//!     Ctrl-C or command finished → Broadcast → Loops exit → Await tasks
//! ```
//!
//! # Design Decisions
//! - Every background loop selects on the shutdown broadcast
//! - Shutdown has a timeout: stragglers are reported, not awaited forever

pub mod shutdown;

pub use shutdown::Shutdown;
