//! Planning errors.

use crate::fragment::FragmentId;
use thiserror::Error;

/// Errors raised while planning an execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Partition parameters are inconsistent
    #[error("invalid partition config: {field} {reason}")]
    InvalidConfig {
        /// Offending parameter
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The fragment graph contains a cycle
    #[error("fragment graph is cyclic; unordered fragments {fragments:?}")]
    Cycle {
        /// Fragments that could not be ordered
        fragments: Vec<FragmentId>,
    },

    /// A fragment id does not name a live fragment
    #[error("unknown fragment {0}")]
    UnknownFragment(FragmentId),
}
