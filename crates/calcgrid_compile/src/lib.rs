//! calcgrid function compilation
//!
//! A node's executable behaviour is compiled for a valuation instant and
//! stays usable for as long as its validity window covers the query
//! instant. [`CompilationCache`] keeps a bounded, ordered set of immutable
//! generations and reuses still-valid entries from neighbouring
//! generations instead of recompiling them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod entry;
pub mod function;
pub mod generation;

pub use cache::{CacheConfig, CacheStats, CompilationCache};
pub use entry::CompiledFunctionEntry;
pub use function::{
    CompileError, CompiledFunction, FunctionDefinition, FunctionInputs, FunctionInvoker,
    FunctionRepository, InvocationError,
};
pub use generation::{CompilationGeneration, CompiledRepository};
