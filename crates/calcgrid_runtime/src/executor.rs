//! Job executor.
//!
//! Runs the items of one job in order. Inputs are read from the job's
//! private cache first and then from the shared cache of the request.
//! Outputs go to the cache their visibility names.

use crate::cache::PrivateValueCache;
use crate::job::{Job, JobFailure, JobItem, JobOutput};
use calcgrid_compile::{FunctionInputs, InvocationError};
use calcgrid_core::ComputedValue;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Executes jobs on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct JobExecutor;

impl JobExecutor {
    /// Create a new executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run every item of `job`
    ///
    /// Cancellation is observed between items.
    ///
    /// # Errors
    ///
    /// Returns the first item failure, or `Cancelled` if `cancel` fired.
    pub fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutput, JobFailure> {
        let mut private = PrivateValueCache::new();
        let mut shared_values = Vec::new();

        for item in &job.items {
            if cancel.is_cancelled() {
                tracing::debug!(job = %job.id(), node = %item.node, "job cancelled between items");
                return Err(JobFailure::Cancelled);
            }

            let inputs = self.gather(job, item, &private)?;
            let produced = item
                .invoker
                .invoke(&inputs)
                .map_err(|error| JobFailure::Invocation {
                    node: item.node,
                    error,
                })?;

            let mut produced: BTreeMap<_, _> = produced
                .into_iter()
                .map(|v| (v.value, v.payload))
                .collect();

            for value in &item.outputs {
                let payload = produced
                    .remove(value)
                    .ok_or_else(|| JobFailure::MissingOutput {
                        node: item.node,
                        value: value.clone(),
                    })?;
                if job.visibility.is_private(value) {
                    private.insert(value.clone(), payload);
                } else {
                    job.values.insert(value.clone(), payload.clone());
                    shared_values.push(ComputedValue::new(value.clone(), payload));
                }
            }

            if !produced.is_empty() {
                tracing::debug!(node = %item.node, extra = produced.len(), "ignoring undeclared outputs");
            }
        }

        Ok(JobOutput {
            job_id: job.id(),
            fragment: job.fragment,
            shared_values,
            items_executed: job.items.len(),
        })
    }

    fn gather(
        &self,
        job: &Job,
        item: &JobItem,
        private: &PrivateValueCache,
    ) -> Result<FunctionInputs, JobFailure> {
        let mut inputs = FunctionInputs::new(item.node, job.at, item.outputs.clone());
        for value in &item.inputs {
            let payload = match private.get(value) {
                Some(payload) => payload.clone(),
                None => job.values.get(value).ok_or_else(|| JobFailure::Invocation {
                    node: item.node,
                    error: InvocationError::MissingInput {
                        value: value.clone(),
                    },
                })?,
            };
            inputs.insert(value.clone(), payload);
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SharedValueCache;
    use crate::job::JobSpecificationFactory;
    use calcgrid_compile::FunctionInvoker;
    use calcgrid_core::{NodeId, ProcessId, Timestamp, ValueId};
    use calcgrid_graph::sample;
    use calcgrid_plan::{ExecutionPlan, FragmentId, PartitionConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn sum() -> Arc<dyn FunctionInvoker> {
        Arc::new(
            |inputs: &FunctionInputs| -> Result<Vec<ComputedValue>, InvocationError> {
                let total: f64 = inputs.values().filter_map(|(_, v)| v.as_f64()).sum();
                Ok(inputs
                    .outputs()
                    .iter()
                    .map(|out| ComputedValue::new(out.clone(), json!(total)))
                    .collect())
            },
        )
    }

    fn seed() -> Arc<dyn FunctionInvoker> {
        Arc::new(
            |inputs: &FunctionInputs| -> Result<Vec<ComputedValue>, InvocationError> {
                Ok(inputs
                    .outputs()
                    .iter()
                    .map(|out| ComputedValue::new(out.clone(), json!(1)))
                    .collect())
            },
        )
    }

    fn job_for(plan: &ExecutionPlan, fragment: FragmentId, values: Arc<SharedValueCache>) -> Job {
        let graph = plan.graph();
        let members = plan.tree().get(fragment).unwrap();
        let items = members
            .nodes()
            .iter()
            .map(|id| {
                let node = graph.node(*id).unwrap();
                JobItem {
                    node: *id,
                    function: node.function().clone(),
                    invoker: if node.inputs().is_empty() { seed() } else { sum() },
                    inputs: node.inputs().iter().cloned().collect(),
                    outputs: node.outputs().iter().cloned().collect(),
                }
            })
            .collect();
        let factory = JobSpecificationFactory::new(ProcessId::from_name("test"), "default");
        Job {
            spec: factory.create(members),
            fragment,
            colour: members.colour(),
            items,
            visibility: plan.visibility(fragment).unwrap().clone(),
            tails: members.tails().to_vec(),
            at: Timestamp::new(100, 0),
            values,
        }
    }

    #[test]
    fn test_private_values_stay_in_job() {
        let plan = ExecutionPlan::build(
            Arc::new(sample::fan_out_graph()),
            PartitionConfig::new(5, None),
        )
        .unwrap();
        let values = Arc::new(SharedValueCache::new());
        let job = job_for(&plan, FragmentId::from_raw(0), Arc::clone(&values));

        let output = JobExecutor::new().run(&job, &CancellationToken::new()).unwrap();
        assert_eq!(output.items_executed, 5);

        let published: Vec<&ValueId> = output.shared_values.iter().map(|v| &v.value).collect();
        assert_eq!(
            published,
            vec![&ValueId::from("N0.out"), &ValueId::from("N1.out"), &ValueId::from("N4.out")]
        );
        assert_eq!(values.get(&ValueId::from("N4.out")), Some(json!(2.0)));
        assert!(!values.contains(&ValueId::from("N2.a")));
    }

    #[test]
    fn test_missing_shared_input() {
        let plan = ExecutionPlan::build(
            Arc::new(sample::fan_out_graph()),
            PartitionConfig::identity(),
        )
        .unwrap();
        let job = job_for(&plan, FragmentId::from_raw(4), Arc::new(SharedValueCache::new()));
        let err = JobExecutor::new().run(&job, &CancellationToken::new()).unwrap_err();
        assert!(matches!(
            err,
            JobFailure::Invocation {
                error: InvocationError::MissingInput { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_missing_declared_output() {
        let plan = ExecutionPlan::build(
            Arc::new(sample::fan_out_graph()),
            PartitionConfig::identity(),
        )
        .unwrap();
        let mut job = job_for(&plan, FragmentId::from_raw(3), Arc::new(SharedValueCache::new()));
        job.items[0].invoker = Arc::new(
            |_: &FunctionInputs| -> Result<Vec<ComputedValue>, InvocationError> { Ok(Vec::new()) },
        );
        let err = JobExecutor::new().run(&job, &CancellationToken::new()).unwrap_err();
        assert_eq!(
            err,
            JobFailure::MissingOutput {
                node: NodeId::from_raw(3),
                value: ValueId::from("N3.out"),
            }
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let plan = ExecutionPlan::build(
            Arc::new(sample::fan_out_graph()),
            PartitionConfig::identity(),
        )
        .unwrap();
        let job = job_for(&plan, FragmentId::from_raw(2), Arc::new(SharedValueCache::new()));
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(JobExecutor::new().run(&job, &token), Err(JobFailure::Cancelled));
    }
}
