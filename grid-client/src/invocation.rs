use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use grid_core::config::retry::InvocationConfig;
use grid_core::error::ClientError;
use grid_core::message::error::ErrorResponse;
use grid_core::message::{ClientMessage, CorrelationIds, OpCode};
use grid_remote::connection::Connection;
use grid_remote::registry::ConnectionRegistry;

use crate::membership::{ClientState, MembershipTracker};
use crate::routing::{InvocationTarget, Router, TRouter};
use crate::statistics::Statistics;

/// A request plus where it goes. `idempotent` allows resending after the
/// connection carrying it broke, when the request may already be applied.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub message: ClientMessage,
    pub target: InvocationTarget,
    pub idempotent: bool,
}

impl Invocation {
    pub fn new(message: ClientMessage, target: InvocationTarget) -> Self {
        let idempotent = message.op.is_retryable();
        Self {
            message,
            target,
            idempotent,
        }
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// Removes the in-flight entry when the caller stops waiting early.
struct InFlight {
    connection: Connection,
    correlation_id: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.connection.deregister(self.correlation_id);
    }
}

pub struct InvocationService {
    config: InvocationConfig,
    redo_operation: bool,
    correlation_ids: Arc<CorrelationIds>,
    registry: ConnectionRegistry,
    router: Router,
    tracker: Arc<MembershipTracker>,
    statistics: Arc<Statistics>,
}

impl InvocationService {
    pub fn new(
        config: InvocationConfig,
        redo_operation: bool,
        correlation_ids: Arc<CorrelationIds>,
        registry: ConnectionRegistry,
        router: Router,
        tracker: Arc<MembershipTracker>,
        statistics: Arc<Statistics>,
    ) -> Self {
        Self {
            config,
            redo_operation,
            correlation_ids,
            registry,
            router,
            tracker,
            statistics,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Runs `invocation` to exactly one outcome: the response, a non
    /// retryable error, or a timeout once the deadline passed.
    pub async fn invoke(&self, invocation: Invocation) -> Result<ClientMessage, ClientError> {
        self.invoke_with_timeout(invocation, self.config.timeout()).await
    }

    pub async fn invoke_with_timeout(
        &self,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<ClientMessage, ClientError> {
        self.statistics.invocation_started();
        let result = self.run(&invocation, timeout).await;
        match &result {
            Ok(_) => self.statistics.invocation_completed(),
            Err(ClientError::InvocationTimeout { .. }) => self.statistics.invocation_timed_out(),
            Err(_) => self.statistics.invocation_failed(),
        }
        result
    }

    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ClientMessage, ClientError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + timeout);
        let mut attempt = 0u32;
        let mut last_error: Option<ClientError> = None;
        loop {
            if self.tracker.is_shutdown() {
                return Err(ClientError::ClientNotActive);
            }
            let error = match tokio::time::timeout_at(deadline, self.attempt(invocation)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error,
                Err(_) => return Err(Self::timed_out(started, last_error)),
            };
            if self.tracker.is_shutdown() {
                return Err(ClientError::ClientNotActive);
            }
            if !self.should_retry(invocation, &error) {
                return Err(error);
            }
            if self.tracker.state() == ClientState::Disconnected {
                return Err(ClientError::ClusterUnavailable(format!(
                    "no connection to the cluster, last error: {}",
                    error
                )));
            }
            attempt += 1;
            if attempt > self.config.max_retries {
                warn!("{:?} gave up after {} retries, last error {}", invocation.message.op, attempt - 1, error);
                return Err(error);
            }
            let delay = self.config.retry_delay(attempt);
            if tokio::time::Instant::now() + delay >= deadline {
                return Err(Self::timed_out(started, Some(error)));
            }
            debug!(
                "retry {:?} attempt {} in {:?} after {}",
                invocation.message.op, attempt, delay, error
            );
            self.statistics.invocation_retried();
            last_error = Some(error);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn attempt(&self, invocation: &Invocation) -> Result<ClientMessage, ClientError> {
        let view = self.tracker.view();
        let connection = self
            .router
            .route(&invocation.target, &view, &self.registry)
            .ok_or(ClientError::ConnectionUnavailable(format!(
                "no live connection for {:?}",
                invocation.target
            )))?;
        let mut request = invocation.message.clone();
        request.correlation_id = self.correlation_ids.next_id();
        let correlation_id = request.correlation_id;
        let rx = connection.send(request).await?;
        let _in_flight = InFlight {
            connection: connection.clone(),
            correlation_id,
        };
        let response = rx
            .await
            .map_err(|_| ClientError::TargetDisconnected(format!("{} dropped the invocation", connection)))??;
        if response.op == OpCode::Error {
            let error: ErrorResponse = response.decode_payload()?;
            return Err(error.into());
        }
        Ok(response)
    }

    fn should_retry(&self, invocation: &Invocation, error: &ClientError) -> bool {
        if let InvocationTarget::Connection(_) = invocation.target {
            return false;
        }
        match error {
            ClientError::TargetDisconnected(_) => invocation.idempotent || self.redo_operation,
            error => error.is_retryable(),
        }
    }

    fn timed_out(started: Instant, last_error: Option<ClientError>) -> ClientError {
        ClientError::InvocationTimeout {
            elapsed: started.elapsed(),
            last_error: last_error.map(|e| e.to_string()).unwrap_or_else(|| "none".to_string()),
        }
    }
}
