//! Result aggregation and the root future.
//!
//! Every fragment of a plan gets a slot holding its state, a countdown of
//! unfinished input fragments, and the handle of its dispatched job. Jobs
//! are dispatched when their countdown reaches zero; a completed fragment
//! releases its tails first. All bookkeeping happens under one mutex and
//! backends are always called with the mutex released, since they may
//! complete a job synchronously from inside `dispatch`.
//!
//! With a bounded concurrency limit, at most `concurrency_limit` of the
//! consumers released by one producer are in flight at a time. The rest
//! wait in that producer's backlog and are admitted as earlier ones settle.

use crate::backend::{Cancelable, DispatchBackend, JobResultReceiver};
use crate::cache::SharedValueCache;
use crate::job::{Job, JobFailure, JobItem, JobOutput, JobSpecificationFactory};
use crate::monitor::ExecutionMetrics;
use calcgrid_compile::CompiledRepository;
use calcgrid_core::{Timestamp, ValueId, ValueRequirement};
use calcgrid_plan::{ExecutionPlan, FragmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Lifecycle of one fragment within an execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentState {
    /// Created, request not started
    Pending,
    /// Waiting for input fragments to complete
    WaitingForInputs,
    /// Handed to the backend
    Dispatched,
    /// Job reported output
    Completed,
    /// Job reported a failure
    Failed,
    /// Will never run, or was stopped
    Cancelled,
}

impl FragmentState {
    /// True for states a fragment never leaves
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of an execution request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResults {
    /// Terminal values by requirement
    pub values: BTreeMap<ValueRequirement, serde_json::Value>,
    /// Final state of every fragment
    pub states: BTreeMap<FragmentId, FragmentState>,
    /// Output of every completed job
    pub outputs: BTreeMap<FragmentId, JobOutput>,
}

impl ExecutionResults {
    /// Terminal value for a requirement
    #[must_use]
    pub fn value(&self, requirement: &ValueRequirement) -> Option<&serde_json::Value> {
        self.values.get(requirement)
    }
}

/// Why an execution request did not produce results
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The request was cancelled
    #[error("execution cancelled")]
    Cancelled,

    /// One or more fragments failed
    #[error("{} fragment(s) failed", .failures.len())]
    FragmentsFailed {
        /// Failure of each failed fragment
        failures: BTreeMap<FragmentId, JobFailure>,
        /// Whatever completed anyway
        partial: ExecutionResults,
    },

    /// Root inputs were not supplied with the request
    #[error("missing root inputs: {values:?}")]
    MissingRootInputs {
        /// Absent values
        values: Vec<ValueId>,
    },

    /// Scheduler state was inconsistent
    #[error("internal error: {0}")]
    Internal(String),
}

type Resolution = Result<ExecutionResults, ExecutionError>;

struct Slot {
    state: FragmentState,
    waiting_on: usize,
    handle: Option<Box<dyn Cancelable>>,
    /// Producer whose completion admitted this fragment
    released_by: Option<FragmentId>,
}

/// Consumers of one producer admitted or held back
#[derive(Default)]
struct Budget {
    in_flight: usize,
    backlog: VecDeque<FragmentId>,
}

struct State {
    slots: BTreeMap<FragmentId, Slot>,
    failures: BTreeMap<FragmentId, JobFailure>,
    outputs: BTreeMap<FragmentId, JobOutput>,
    unsettled: usize,
    cancelled: bool,
    queue: VecDeque<FragmentId>,
    draining: bool,
    budgets: BTreeMap<FragmentId, Budget>,
    resolver: Option<oneshot::Sender<Resolution>>,
}

/// Everything the aggregator needs to run one request
pub(crate) struct Launch {
    pub plan: Arc<ExecutionPlan>,
    pub backend: Arc<dyn DispatchBackend>,
    pub factory: Arc<JobSpecificationFactory>,
    pub compiled: CompiledRepository,
    pub values: Arc<SharedValueCache>,
    pub at: Timestamp,
    pub metrics: Arc<ExecutionMetrics>,
}

struct Inner {
    plan: Arc<ExecutionPlan>,
    backend: Arc<dyn DispatchBackend>,
    factory: Arc<JobSpecificationFactory>,
    compiled: CompiledRepository,
    values: Arc<SharedValueCache>,
    at: Timestamp,
    metrics: Arc<ExecutionMetrics>,
    limit: Option<usize>,
    state: Mutex<State>,
}

/// Start executing a plan and return its root future
pub(crate) fn start(launch: Launch) -> RootFuture {
    let (sender, receiver) = oneshot::channel();
    let tree = launch.plan.tree();

    let slots: BTreeMap<FragmentId, Slot> = tree
        .fragments()
        .map(|fragment| {
            (
                fragment.id(),
                Slot {
                    state: FragmentState::Pending,
                    waiting_on: fragment.inputs().len(),
                    handle: None,
                    released_by: None,
                },
            )
        })
        .collect();

    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            unsettled: slots.len(),
            slots,
            failures: BTreeMap::new(),
            outputs: BTreeMap::new(),
            cancelled: false,
            queue: VecDeque::new(),
            draining: false,
            budgets: BTreeMap::new(),
            resolver: Some(sender),
        }),
        limit: launch.plan.config().concurrency_limit,
        plan: launch.plan,
        backend: launch.backend,
        factory: launch.factory,
        compiled: launch.compiled,
        values: launch.values,
        at: launch.at,
        metrics: launch.metrics,
    });

    let ready = inner.begin();
    inner.schedule(ready);

    RootFuture {
        receiver,
        handle: RootHandle {
            inner: Some(inner),
        },
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move every slot to `WaitingForInputs`, fail fragments that did not
    /// compile, and return the fragments ready to run.
    fn begin(&self) -> Vec<FragmentId> {
        let tree = self.plan.tree();
        let mut guard = self.lock();
        let state = &mut *guard;

        for slot in state.slots.values_mut() {
            slot.state = FragmentState::WaitingForInputs;
        }

        for (node, error) in self.compiled.failures() {
            let Some(fragment) = tree.fragment_of(*node) else {
                continue;
            };
            tracing::warn!(%node, %fragment, %error, "fragment will not run: compilation failed");
            self.fail(
                state,
                fragment,
                JobFailure::Compilation {
                    node: *node,
                    error: error.clone(),
                },
            );
        }

        tree.topological_order()
            .iter()
            .copied()
            .filter(|id| {
                state.slots.get(id).is_some_and(|slot| {
                    slot.state == FragmentState::WaitingForInputs && slot.waiting_on == 0
                })
            })
            .collect()
    }

    /// Mark a fragment failed and cancel everything downstream of it
    fn fail(&self, state: &mut State, fragment: FragmentId, failure: JobFailure) {
        let Some(slot) = state.slots.get_mut(&fragment) else {
            return;
        };
        if slot.state.is_terminal() {
            return;
        }
        slot.state = FragmentState::Failed;
        slot.handle = None;
        state.unsettled = state.unsettled.saturating_sub(1);
        state.failures.insert(fragment, failure);
        self.metrics.record_failure();

        let tree = self.plan.tree();
        let mut pending: Vec<FragmentId> = tree
            .fragment(fragment)
            .map(|f| f.outputs().iter().copied().collect())
            .unwrap_or_default();

        while let Some(next) = pending.pop() {
            let Some(slot) = state.slots.get_mut(&next) else {
                continue;
            };
            if slot.state.is_terminal() {
                continue;
            }
            tracing::debug!(fragment = %next, cause = %fragment, "cancelling dependent of failed fragment");
            slot.state = FragmentState::Cancelled;
            if let Some(handle) = slot.handle.take() {
                handle.cancel();
            }
            state.unsettled = state.unsettled.saturating_sub(1);
            self.metrics.record_cancellation();
            if let Some(f) = tree.fragment(next) {
                pending.extend(f.outputs().iter().copied());
            }
        }
    }

    /// Build the job for a fragment
    fn build_job(&self, fragment: FragmentId) -> Result<Job, JobFailure> {
        let plan = &self.plan;
        let members = plan
            .tree()
            .get(fragment)
            .map_err(|e| JobFailure::Internal(e.to_string()))?;
        let graph = plan.graph();

        let items = members
            .nodes()
            .iter()
            .map(|id| {
                let node = graph
                    .node(*id)
                    .ok_or_else(|| JobFailure::Internal(format!("{id} is not in the graph")))?;
                let entry = self
                    .compiled
                    .entry(*id)
                    .map_err(|error| JobFailure::Compilation { node: *id, error })?;
                Ok(JobItem {
                    node: *id,
                    function: node.function().clone(),
                    invoker: Arc::clone(entry.invoker()),
                    inputs: node.inputs().iter().cloned().collect(),
                    outputs: node.outputs().iter().cloned().collect(),
                })
            })
            .collect::<Result<Vec<_>, JobFailure>>()?;

        let visibility = plan
            .visibility(fragment)
            .map_err(|e| JobFailure::Internal(e.to_string()))?
            .clone();

        Ok(Job {
            spec: self.factory.create(members),
            fragment,
            colour: members.colour(),
            items,
            visibility,
            tails: members.tails().to_vec(),
            at: self.at,
            values: Arc::clone(&self.values),
        })
    }

    /// Queue fragments for dispatch and drain the queue unless another
    /// caller is already draining it.
    fn schedule(self: &Arc<Self>, ready: Vec<FragmentId>) {
        {
            let mut state = self.lock();
            // released fragments run ahead of anything already queued
            for fragment in ready.into_iter().rev() {
                state.queue.push_front(fragment);
            }
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let job = {
                let mut guard = self.lock();
                let state = &mut *guard;
                let Some(fragment) = state.queue.pop_front() else {
                    state.draining = false;
                    break;
                };
                let runnable = !state.cancelled
                    && state
                        .slots
                        .get(&fragment)
                        .is_some_and(|slot| slot.state == FragmentState::WaitingForInputs);
                if !runnable {
                    continue;
                }
                match self.build_job(fragment) {
                    Ok(job) => {
                        if let Some(slot) = state.slots.get_mut(&fragment) {
                            slot.state = FragmentState::Dispatched;
                        }
                        job
                    }
                    Err(failure) => {
                        tracing::warn!(%fragment, %failure, "could not build job");
                        self.fail(state, fragment, failure);
                        let admitted = self.settle(state, fragment);
                        for next in admitted.into_iter().rev() {
                            state.queue.push_front(next);
                        }
                        continue;
                    }
                }
            };

            let fragment = job.fragment;
            tracing::debug!(%fragment, job = %job.id(), colour = ?job.colour, items = job.items.len(), "dispatching");
            self.metrics.record_dispatch();

            let inner = Arc::clone(self);
            let receiver = JobResultReceiver::new(move |result| inner.on_result(fragment, result));
            let handle = self.backend.dispatch(job, receiver);

            let orphaned = {
                let mut state = self.lock();
                match state.slots.get_mut(&fragment) {
                    Some(slot) if slot.state == FragmentState::Dispatched => {
                        slot.handle = Some(handle);
                        None
                    }
                    Some(slot) if slot.state == FragmentState::Cancelled => Some(handle),
                    _ => None,
                }
            };
            if let Some(handle) = orphaned {
                handle.cancel();
            }
        }

        self.try_resolve();
    }

    fn on_result(self: &Arc<Self>, fragment: FragmentId, result: Result<JobOutput, JobFailure>) {
        let ready = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let dispatched = state
                .slots
                .get(&fragment)
                .is_some_and(|slot| slot.state == FragmentState::Dispatched);
            if !dispatched {
                tracing::trace!(%fragment, "ignoring result of settled fragment");
                return;
            }

            match result {
                Ok(output) => {
                    self.metrics.record_completion(output.items_executed);
                    if let Some(slot) = state.slots.get_mut(&fragment) {
                        slot.state = FragmentState::Completed;
                        slot.handle = None;
                    }
                    state.unsettled = state.unsettled.saturating_sub(1);
                    state.outputs.insert(fragment, output);
                    let mut ready = self.release(state, fragment);
                    ready.extend(self.settle(state, fragment));
                    ready
                }
                Err(failure) => {
                    tracing::warn!(%fragment, %failure, "fragment failed");
                    self.fail(state, fragment, failure);
                    self.settle(state, fragment)
                }
            }
        };

        self.schedule(ready);
    }

    /// Count down the consumers of a completed fragment, tails first, and
    /// admit the ready ones within the producer's budget
    fn release(&self, state: &mut State, fragment: FragmentId) -> Vec<FragmentId> {
        let Some(members) = self.plan.tree().fragment(fragment) else {
            return Vec::new();
        };
        let tails = members.tails().iter().copied();
        let others = members
            .outputs()
            .iter()
            .copied()
            .filter(|id| !members.tails().contains(id));

        let mut ready = Vec::new();
        for consumer in tails.chain(others) {
            let Some(slot) = state.slots.get_mut(&consumer) else {
                continue;
            };
            slot.waiting_on = slot.waiting_on.saturating_sub(1);
            if slot.waiting_on != 0 || slot.state != FragmentState::WaitingForInputs {
                continue;
            }
            let Some(limit) = self.limit else {
                ready.push(consumer);
                continue;
            };
            let budget = state.budgets.entry(fragment).or_default();
            if budget.in_flight < limit {
                budget.in_flight += 1;
                slot.released_by = Some(fragment);
                ready.push(consumer);
            } else {
                tracing::debug!(%consumer, producer = %fragment, limit, "holding consumer until producer has capacity");
                budget.backlog.push_back(consumer);
            }
        }
        ready
    }

    /// Return a settled fragment's place in its producer's budget and
    /// admit held-back consumers into the freed capacity
    fn settle(&self, state: &mut State, fragment: FragmentId) -> Vec<FragmentId> {
        let (Some(limit), Some(producer)) = (
            self.limit,
            state.slots.get_mut(&fragment).and_then(|slot| slot.released_by.take()),
        ) else {
            return Vec::new();
        };
        let Some(budget) = state.budgets.get_mut(&producer) else {
            return Vec::new();
        };
        budget.in_flight = budget.in_flight.saturating_sub(1);

        let mut admitted = Vec::new();
        while budget.in_flight < limit {
            let Some(next) = budget.backlog.pop_front() else {
                break;
            };
            let Some(slot) = state.slots.get_mut(&next) else {
                continue;
            };
            if slot.state != FragmentState::WaitingForInputs {
                continue;
            }
            budget.in_flight += 1;
            slot.released_by = Some(producer);
            admitted.push(next);
        }
        admitted
    }

    fn try_resolve(&self) {
        let (resolver, resolution) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.unsettled > 0 || state.resolver.is_none() {
                return;
            }
            let Some(resolver) = state.resolver.take() else {
                return;
            };
            let results = self.results(state);
            let resolution = if state.cancelled {
                Err(ExecutionError::Cancelled)
            } else if state.failures.is_empty() {
                Ok(results)
            } else {
                Err(ExecutionError::FragmentsFailed {
                    failures: state.failures.clone(),
                    partial: results,
                })
            };
            (resolver, resolution)
        };

        match &resolution {
            Ok(results) => tracing::info!(
                graph = self.plan.graph().name(),
                fragments = results.states.len(),
                values = results.values.len(),
                "execution complete"
            ),
            Err(error) => tracing::warn!(graph = self.plan.graph().name(), %error, "execution did not complete"),
        }
        // the receiver may already be gone
        let _ = resolver.send(resolution);
    }

    fn results(&self, state: &State) -> ExecutionResults {
        let values = self
            .plan
            .graph()
            .terminal_outputs()
            .iter()
            .filter_map(|(requirement, value)| {
                self.values.get(value).map(|payload| (requirement.clone(), payload))
            })
            .collect();
        ExecutionResults {
            values,
            states: state.slots.iter().map(|(id, slot)| (*id, slot.state)).collect(),
            outputs: state.outputs.clone(),
        }
    }

    fn cancel(&self) -> bool {
        let (handles, resolver) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.cancelled || state.resolver.is_none() {
                return false;
            }
            state.cancelled = true;
            state.queue.clear();
            state.budgets.clear();

            let mut handles = Vec::new();
            for slot in state.slots.values_mut() {
                if slot.state.is_terminal() {
                    continue;
                }
                slot.state = FragmentState::Cancelled;
                handles.extend(slot.handle.take());
                self.metrics.record_cancellation();
            }
            state.unsettled = 0;
            (handles, state.resolver.take())
        };

        tracing::warn!(graph = self.plan.graph().name(), in_flight = handles.len(), "cancelling execution");
        for handle in handles {
            handle.cancel();
        }
        if let Some(resolver) = resolver {
            let _ = resolver.send(Err(ExecutionError::Cancelled));
        }
        true
    }

    fn fragment_states(&self) -> BTreeMap<FragmentId, FragmentState> {
        self.lock()
            .slots
            .iter()
            .map(|(id, slot)| (*id, slot.state))
            .collect()
    }
}

/// Cloneable control handle for a running request
#[derive(Clone, Default)]
pub struct RootHandle {
    inner: Option<Arc<Inner>>,
}

impl RootHandle {
    /// Cancel the request
    ///
    /// Returns `false` if the request already resolved or was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.cancel())
    }

    /// Current state of every fragment
    #[must_use]
    pub fn fragment_states(&self) -> BTreeMap<FragmentId, FragmentState> {
        self.inner
            .as_ref()
            .map(|inner| inner.fragment_states())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RootHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootHandle")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Top-level future of one execution request
#[derive(Debug)]
pub struct RootFuture {
    receiver: oneshot::Receiver<Resolution>,
    handle: RootHandle,
}

impl RootFuture {
    /// A future that resolves immediately with `error`
    #[must_use]
    pub fn failed(error: ExecutionError) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Self {
            receiver,
            handle: RootHandle::default(),
        }
    }

    /// Cancel the request; see [`RootHandle::cancel`]
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Handle usable after the future is moved into a task
    #[must_use]
    pub fn handle(&self) -> RootHandle {
        self.handle.clone()
    }
}

impl Future for RootFuture {
    type Output = Resolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ExecutionError::Internal("aggregator dropped without resolving".to_string()))
            })
        })
    }
}
