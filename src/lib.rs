//! Adaptive client-side traffic core for multi-destination RPC.

// Core subsystems
pub mod config;
pub mod hashing;
pub mod topology;

// Traffic management
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub mod router;

pub use config::schema::RouterConfig;
pub use lifecycle::Shutdown;
pub use router::Router;
