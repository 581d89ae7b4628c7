//! Compiled function entries.

use crate::function::{CompileError, CompiledFunction, FunctionInvoker};
use calcgrid_core::{FunctionId, Timestamp};
use std::sync::Arc;

/// A function compiled for one instant, with its validity window
#[derive(Clone)]
pub struct CompiledFunctionEntry {
    function: FunctionId,
    invoker: Arc<dyn FunctionInvoker>,
    compiled_at: Timestamp,
    earliest: Option<Timestamp>,
    latest: Option<Timestamp>,
}

impl CompiledFunctionEntry {
    /// Wrap a compilation result
    ///
    /// # Errors
    ///
    /// Returns `InvalidWindow` unless `earliest <= compiled_at <= latest`.
    pub fn new(
        function: FunctionId,
        compiled_at: Timestamp,
        compiled: CompiledFunction,
    ) -> Result<Self, CompileError> {
        let after_start = compiled.earliest.is_none_or(|e| e <= compiled_at);
        let before_end = compiled.latest.is_none_or(|l| compiled_at <= l);
        if !(after_start && before_end) {
            return Err(CompileError::InvalidWindow {
                function,
                at: compiled_at,
            });
        }

        Ok(Self {
            function,
            invoker: compiled.invoker,
            compiled_at,
            earliest: compiled.earliest,
            latest: compiled.latest,
        })
    }

    /// Check whether this entry may be used at `at`
    #[must_use]
    pub fn is_valid_at(&self, at: Timestamp) -> bool {
        self.earliest.is_none_or(|e| e <= at) && self.latest.is_none_or(|l| at <= l)
    }

    /// Function id
    #[must_use]
    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    /// Invocable form
    #[must_use]
    pub fn invoker(&self) -> &Arc<dyn FunctionInvoker> {
        &self.invoker
    }

    /// Instant the entry was compiled for
    #[must_use]
    pub fn compiled_at(&self) -> Timestamp {
        self.compiled_at
    }

    /// Start of the validity window
    #[must_use]
    pub fn earliest(&self) -> Option<Timestamp> {
        self.earliest
    }

    /// End of the validity window
    #[must_use]
    pub fn latest(&self) -> Option<Timestamp> {
        self.latest
    }
}

impl std::fmt::Debug for CompiledFunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunctionEntry")
            .field("function", &self.function)
            .field("compiled_at", &self.compiled_at)
            .field("earliest", &self.earliest)
            .field("latest", &self.latest)
            .finish_non_exhaustive()
    }
}
