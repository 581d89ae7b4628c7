//! Function definitions, compiled forms, and invocation.

use calcgrid_core::{ComputedValue, FunctionId, NodeId, Timestamp, ValueId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// No definition registered under the function id
    #[error("unknown function: {function}")]
    UnknownFunction {
        /// Requested function
        function: FunctionId,
    },

    /// The definition refused to compile
    #[error("compiling {function} failed: {reason}")]
    Failed {
        /// Function being compiled
        function: FunctionId,
        /// Reason given by the definition
        reason: String,
    },

    /// The compiled validity window does not contain the compilation instant
    #[error("{function} compiled at {at} reports a window that excludes it")]
    InvalidWindow {
        /// Function being compiled
        function: FunctionId,
        /// Compilation instant
        at: Timestamp,
    },
}

/// Errors raised while invoking a compiled function
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// A required input was not supplied
    #[error("missing input {value}")]
    MissingInput {
        /// Absent value
        value: ValueId,
    },

    /// An input had an unusable payload
    #[error("invalid input {value}: {reason}")]
    InvalidInput {
        /// Offending value
        value: ValueId,
        /// What was wrong with it
        reason: String,
    },

    /// The function itself failed
    #[error("{0}")]
    Failed(String),
}

/// Everything a function sees when it is invoked
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInputs {
    /// Node being evaluated
    pub node: NodeId,
    /// Valuation instant
    pub at: Timestamp,
    values: BTreeMap<ValueId, serde_json::Value>,
    outputs: Vec<ValueId>,
}

impl FunctionInputs {
    /// Create a new input set
    #[must_use]
    pub fn new(node: NodeId, at: Timestamp, outputs: Vec<ValueId>) -> Self {
        Self {
            node,
            at,
            values: BTreeMap::new(),
            outputs,
        }
    }

    /// Add an input value
    #[must_use]
    pub fn with_value(mut self, value: ValueId, payload: serde_json::Value) -> Self {
        self.values.insert(value, payload);
        self
    }

    /// Insert an input value
    pub fn insert(&mut self, value: ValueId, payload: serde_json::Value) {
        self.values.insert(value, payload);
    }

    /// Look up an input payload
    ///
    /// # Errors
    ///
    /// Returns `MissingInput` if the value was not supplied.
    pub fn get(&self, value: &ValueId) -> Result<&serde_json::Value, InvocationError> {
        self.values
            .get(value)
            .ok_or_else(|| InvocationError::MissingInput {
                value: value.clone(),
            })
    }

    /// All input values, ordered by id
    pub fn values(&self) -> impl Iterator<Item = (&ValueId, &serde_json::Value)> {
        self.values.iter()
    }

    /// Values the function is expected to produce
    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }
}

/// Invocable compiled form of a function
pub trait FunctionInvoker: Send + Sync {
    /// Evaluate the function
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails.
    fn invoke(&self, inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError>;
}

impl<F> FunctionInvoker for F
where
    F: Fn(&FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> + Send + Sync,
{
    fn invoke(&self, inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
        self(inputs)
    }
}

/// Result of compiling a function for an instant
#[derive(Clone)]
pub struct CompiledFunction {
    /// Invocable form
    pub invoker: Arc<dyn FunctionInvoker>,
    /// First instant the compiled form is valid for (`None` = unbounded)
    pub earliest: Option<Timestamp>,
    /// Last instant the compiled form is valid for (`None` = unbounded)
    pub latest: Option<Timestamp>,
}

impl CompiledFunction {
    /// Compiled form that is valid at every instant
    #[must_use]
    pub fn unbounded(invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            invoker,
            earliest: None,
            latest: None,
        }
    }

    /// Compiled form valid within `[earliest, latest]`
    #[must_use]
    pub fn valid_between(
        invoker: Arc<dyn FunctionInvoker>,
        earliest: Timestamp,
        latest: Timestamp,
    ) -> Self {
        Self {
            invoker,
            earliest: Some(earliest),
            latest: Some(latest),
        }
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("earliest", &self.earliest)
            .field("latest", &self.latest)
            .finish_non_exhaustive()
    }
}

/// Something that can be compiled into a [`CompiledFunction`]
pub trait FunctionDefinition: Send + Sync {
    /// Compile for the given instant
    ///
    /// # Errors
    ///
    /// Returns an error if the function cannot be compiled at `at`.
    fn compile(&self, at: Timestamp) -> Result<CompiledFunction, CompileError>;
}

impl<F> FunctionDefinition for F
where
    F: Fn(Timestamp) -> Result<CompiledFunction, CompileError> + Send + Sync,
{
    fn compile(&self, at: Timestamp) -> Result<CompiledFunction, CompileError> {
        self(at)
    }
}

/// Registry of function definitions by id
#[derive(Clone, Default)]
pub struct FunctionRepository {
    definitions: BTreeMap<FunctionId, Arc<dyn FunctionDefinition>>,
}

impl FunctionRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any earlier one with the same id
    pub fn register(
        &mut self,
        function: impl Into<FunctionId>,
        definition: Arc<dyn FunctionDefinition>,
    ) -> &mut Self {
        self.definitions.insert(function.into(), definition);
        self
    }

    /// Look up a definition
    #[must_use]
    pub fn get(&self, function: &FunctionId) -> Option<Arc<dyn FunctionDefinition>> {
        self.definitions.get(function).cloned()
    }

    /// Registered ids
    pub fn ids(&self) -> impl Iterator<Item = &FunctionId> {
        self.definitions.keys()
    }

    /// Number of registered definitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.definitions.keys()).finish()
    }
}
