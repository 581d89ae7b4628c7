//! Partition parameters.

use crate::error::PlanError;
use serde::{Deserialize, Serialize};

/// Parameters controlling fragment sizes and execution lanes
///
/// `None` means unbounded for both `max_fragment_size` and
/// `concurrency_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Fragments smaller than this look for siblings to merge with
    pub min_fragment_size: usize,
    /// No merge may produce a fragment larger than this
    pub max_fragment_size: Option<usize>,
    /// Tail fragments pipelined onto one execution lane
    pub concurrency_limit: Option<usize>,
}

impl PartitionConfig {
    /// Create a config with unbounded concurrency
    #[must_use]
    pub fn new(min_fragment_size: usize, max_fragment_size: Option<usize>) -> Self {
        Self {
            min_fragment_size,
            max_fragment_size,
            concurrency_limit: None,
        }
    }

    /// One fragment per node, no colouring
    #[must_use]
    pub fn identity() -> Self {
        Self::new(1, Some(1))
    }

    /// Set the concurrency limit
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Effective maximum size
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_fragment_size.unwrap_or(usize::MAX)
    }

    /// Check parameter consistency
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `min < 1`, `max < min`, or the
    /// concurrency limit is zero.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.min_fragment_size < 1 {
            return Err(PlanError::InvalidConfig {
                field: "min_fragment_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(max) = self.max_fragment_size {
            if max < self.min_fragment_size {
                return Err(PlanError::InvalidConfig {
                    field: "max_fragment_size",
                    reason: format!("{max} is below min_fragment_size {}", self.min_fragment_size),
                });
            }
        }
        if self.concurrency_limit == Some(0) {
            return Err(PlanError::InvalidConfig {
                field: "concurrency_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::new(1, None)
    }
}
