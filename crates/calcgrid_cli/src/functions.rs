//! Built-in functions available to graphs run from the command line.
//!
//! `seed` sets every output to `1.0`; `sum` sets every output to the sum
//! of its numeric inputs. Both compile to the same invoker at any instant.

use calcgrid_compile::{
    CompileError, CompiledFunction, FunctionInputs, FunctionRepository, InvocationError,
};
use calcgrid_core::{ComputedValue, Timestamp};
use serde_json::json;
use std::sync::Arc;

/// Ids of the built-in functions
pub const BUILTINS: [&str; 2] = ["seed", "sum"];

fn seed(inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
    Ok(inputs
        .outputs()
        .iter()
        .map(|out| ComputedValue::new(out.clone(), json!(1.0)))
        .collect())
}

fn sum(inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
    let mut total = 0.0;
    for (value, payload) in inputs.values() {
        total += payload.as_f64().ok_or_else(|| InvocationError::InvalidInput {
            value: value.clone(),
            reason: format!("expected a number, got {payload}"),
        })?;
    }
    Ok(inputs
        .outputs()
        .iter()
        .map(|out| ComputedValue::new(out.clone(), json!(total)))
        .collect())
}

/// Repository holding every built-in function
#[must_use]
pub fn builtin_repository() -> FunctionRepository {
    let mut repo = FunctionRepository::new();
    repo.register(
        "seed",
        Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
            Ok(CompiledFunction::unbounded(Arc::new(seed)))
        }),
    );
    repo.register(
        "sum",
        Arc::new(|_at: Timestamp| -> Result<CompiledFunction, CompileError> {
            Ok(CompiledFunction::unbounded(Arc::new(sum)))
        }),
    );
    repo
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcgrid_core::{FunctionId, NodeId, ValueId};

    fn invoke(function: &str, inputs: &FunctionInputs) -> Result<Vec<ComputedValue>, InvocationError> {
        let compiled = builtin_repository()
            .get(&FunctionId::from(function))
            .unwrap()
            .compile(Timestamp::EPOCH)
            .unwrap();
        compiled.invoker.invoke(inputs)
    }

    #[test]
    fn test_registry_holds_builtins() {
        let repo = builtin_repository();
        let ids: Vec<&str> = repo.ids().map(FunctionId::as_str).collect();
        assert_eq!(ids, BUILTINS.to_vec());
    }

    #[test]
    fn test_sum_adds_inputs() {
        let inputs = FunctionInputs::new(NodeId::from_raw(0), Timestamp::EPOCH, vec!["total".into()])
            .with_value("a".into(), json!(1.5))
            .with_value("b".into(), json!(2));
        let out = invoke("sum", &inputs).unwrap();
        assert_eq!(out, vec![ComputedValue::new("total", json!(3.5))]);
    }

    #[test]
    fn test_sum_rejects_text() {
        let inputs = FunctionInputs::new(NodeId::from_raw(0), Timestamp::EPOCH, vec!["total".into()])
            .with_value("a".into(), json!("spot"));
        let err = invoke("sum", &inputs).unwrap_err();
        assert!(matches!(err, InvocationError::InvalidInput { value, .. } if value == ValueId::from("a")));
    }

    #[test]
    fn test_seed_fills_every_output() {
        let inputs = FunctionInputs::new(
            NodeId::from_raw(2),
            Timestamp::EPOCH,
            vec!["x".into(), "y".into()],
        );
        let out = invoke("seed", &inputs).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.payload == json!(1.0)));
    }
}
