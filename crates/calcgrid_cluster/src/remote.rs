//! Remote job delivery.
//!
//! A [`RemoteRequest`] is the wire envelope of a job: the JSON-encoded
//! [`JobSpecification`] plus the fragment it executes. The [`Job`] itself
//! travels alongside it because compiled invokers cannot be serialized; a
//! worker checks the envelope against the job before running it.

use crate::worker::{Worker, WorkerError};
use async_trait::async_trait;
use calcgrid_core::{ComputedValue, JobId, WorkerId};
use calcgrid_plan::FragmentId;
use calcgrid_runtime::{Job, JobFailure, JobOutput, JobSpecification};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The worker refused the request
    #[error("worker rejected request: {0}")]
    Rejected(String),

    /// No response within the deadline
    #[error("request timeout after {0}ms")]
    Timeout(u64),

    /// Encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The response does not belong to the request
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<WorkerError> for TransportError {
    fn from(err: WorkerError) -> Self {
        Self::Rejected(err.to_string())
    }
}

/// Wire envelope of a dispatched job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Request ID
    pub request_id: String,
    /// JSON-encoded job specification
    pub specification: String,
    /// Fragment being executed
    pub fragment: FragmentId,
    /// Number of items in the job
    pub items: usize,
}

impl RemoteRequest {
    /// Encode the envelope for `job`
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the specification cannot be encoded.
    pub fn for_job(job: &Job) -> Result<Self, TransportError> {
        let specification = serde_json::to_string(&job.spec)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        Ok(Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            specification,
            fragment: job.fragment,
            items: job.items.len(),
        })
    }

    /// Decode the job specification
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload is not a specification.
    pub fn specification(&self) -> Result<JobSpecification, TransportError> {
        serde_json::from_str(&self.specification)
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

/// Worker reply to a [`RemoteRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Request ID this responds to
    pub request_id: String,
    /// Responding worker
    pub worker: WorkerId,
    /// Whether execution succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// Values published to the shared cache
    pub shared_values: Vec<ComputedValue>,
    /// Items evaluated
    pub items_executed: usize,
}

impl RemoteResponse {
    /// Successful response carrying a job's output
    #[must_use]
    pub fn success(request_id: String, worker: WorkerId, output: JobOutput) -> Self {
        Self {
            request_id,
            worker,
            success: true,
            error: None,
            shared_values: output.shared_values,
            items_executed: output.items_executed,
        }
    }

    /// Failed response
    #[must_use]
    pub fn failure(request_id: String, worker: WorkerId, error: String) -> Self {
        Self {
            request_id,
            worker,
            success: false,
            error: Some(error),
            shared_values: Vec::new(),
            items_executed: 0,
        }
    }

    /// Convert back into the runtime's job result
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the worker reported a failure.
    pub fn into_output(self, job_id: JobId, fragment: FragmentId) -> Result<JobOutput, JobFailure> {
        if !self.success {
            return Err(JobFailure::Remote {
                worker: self.worker,
                reason: self.error.unwrap_or_default(),
            });
        }
        Ok(JobOutput {
            job_id,
            fragment,
            shared_values: self.shared_values,
            items_executed: self.items_executed,
        })
    }
}

/// Delivers requests to one worker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Worker on the far side
    fn worker(&self) -> WorkerId;

    /// Deliver a request and wait for the reply
    async fn send(
        &self,
        request: RemoteRequest,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<RemoteResponse, TransportError>;
}

/// Transport to a worker in the same process
///
/// Requests and responses still go through their JSON encoding, with an
/// optional simulated network delay.
#[derive(Clone)]
pub struct LoopbackTransport {
    worker: Arc<Worker>,
    latency: Duration,
}

impl LoopbackTransport {
    /// Create a transport to `worker`
    #[must_use]
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            worker,
            latency: Duration::ZERO,
        }
    }

    /// Add a simulated one-way delay
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn worker(&self) -> WorkerId {
        self.worker.id()
    }

    async fn send(
        &self,
        request: RemoteRequest,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<RemoteResponse, TransportError> {
        let encoded = serde_json::to_string(&request)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let received: RemoteRequest = serde_json::from_str(&encoded)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        let response = self.worker.execute(received, job, cancel).await?;

        let encoded = serde_json::to_string(&response)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        serde_json::from_str(&encoded).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

/// Client side of one worker connection
#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn Transport>,
    timeout_ms: u64,
}

impl RemoteClient {
    /// Create a new remote client
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout_ms: 30_000,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Target worker
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.transport.worker()
    }

    /// Request timeout in milliseconds
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrives in time, `InvalidResponse`
    /// if the response answers a different request, or any transport
    /// error.
    pub async fn send(
        &self,
        request: RemoteRequest,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<RemoteResponse, TransportError> {
        let request_id = request.request_id.clone();
        let deadline = Duration::from_millis(self.timeout_ms);
        let response = tokio::time::timeout(deadline, self.transport.send(request, job, cancel))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout_ms))??;

        if response.request_id != request_id {
            return Err(TransportError::InvalidResponse(format!(
                "expected {request_id}, got {}",
                response.request_id
            )));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("worker", &self.worker())
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcgrid_core::ValueId;
    use serde_json::json;

    #[test]
    fn test_failed_response_maps_to_remote_failure() {
        let worker = WorkerId::new();
        let response = RemoteResponse::failure("r1".to_string(), worker, "no curve".to_string());
        let err = response
            .into_output(JobId::from_raw(4), FragmentId::from_raw(2))
            .unwrap_err();
        assert_eq!(
            err,
            JobFailure::Remote {
                worker,
                reason: "no curve".to_string()
            }
        );
    }

    #[test]
    fn test_successful_response_keeps_values() {
        let output = JobOutput {
            job_id: JobId::from_raw(1),
            fragment: FragmentId::from_raw(0),
            shared_values: vec![ComputedValue::new("pv", json!(3.5))],
            items_executed: 2,
        };
        let response = RemoteResponse::success("r2".to_string(), WorkerId::new(), output.clone());
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: RemoteResponse = serde_json::from_str(&encoded).unwrap();
        let back = decoded
            .into_output(JobId::from_raw(1), FragmentId::from_raw(0))
            .unwrap();
        assert_eq!(back, output);
        assert_eq!(back.shared_values[0].value, ValueId::from("pv"));
    }

    #[test]
    fn test_bad_specification_payload() {
        let request = RemoteRequest {
            request_id: "r3".to_string(),
            specification: "{not json".to_string(),
            fragment: FragmentId::from_raw(0),
            items: 0,
        };
        assert!(matches!(
            request.specification(),
            Err(TransportError::Serialization(_))
        ));
    }
}
