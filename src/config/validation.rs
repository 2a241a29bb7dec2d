//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Reject structural values the router cannot run with
//! - Check topology entries for obviously broken descriptors
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouterConfig → Result<(), Vec<ValidationError>>
//! - Tunable flow control values are clamped later, never rejected here

use thiserror::Error;

use crate::config::schema::RouterConfig;

/// A single structural problem found in a config file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("misc.max_weight must be within 1..=255, got {0}")]
    MaxWeight(u32),

    #[error("misc.virtual_node_count must be positive")]
    VirtualNodeCount,

    #[error("misc.best_chain_queue_size must be positive")]
    BestChainQueueSize,

    #[error("misc.filter_alpha must be within (0, 1], got {0}")]
    FilterAlpha(f64),

    #[error("misc.degrade_slice_width must be positive")]
    DegradeSliceWidth,

    #[error("topology node {index} has an empty {field}")]
    EmptyField { index: usize, field: &'static str },
}

/// Validate the parts of a config that have no sensible clamped fallback.
pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let misc = &config.misc;

    if misc.max_weight == 0 || misc.max_weight > u8::MAX as u32 {
        errors.push(ValidationError::MaxWeight(misc.max_weight));
    }
    if misc.virtual_node_count == 0 {
        errors.push(ValidationError::VirtualNodeCount);
    }
    if misc.best_chain_queue_size == 0 {
        errors.push(ValidationError::BestChainQueueSize);
    }
    if !(misc.filter_alpha > 0.0 && misc.filter_alpha <= 1.0) {
        errors.push(ValidationError::FilterAlpha(misc.filter_alpha));
    }
    if misc.degrade_slice_width == 0 {
        errors.push(ValidationError::DegradeSliceWidth);
    }

    for (index, node) in config.topology.iter().enumerate() {
        if node.biz_name.is_empty() {
            errors.push(ValidationError::EmptyField { index, field: "biz_name" });
        }
        if node.spec.is_empty() {
            errors.push(ValidationError::EmptyField { index, field: "spec" });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
