//! Model readiness tracking
//!
//! Readiness is an explicit state machine advanced by [`ReadinessTracker::tick`].
//! Each tick performs at most one server round trip, so the same machine can
//! be driven by [`wait_for_model`], a manual loop, or a blocking thread.
//!
//! ```text
//! CheckingLive -> CheckingReady -> CheckingModelIndex -> CheckingModelState -> Ready
//!      ^              |                                     |        |
//!      +---- backoff -+-------------- backoff --------------+        +--> Failed
//! ```
//!
//! A model that is absent from the repository index, or that reports a
//! terminal state, fails immediately. Servers that are not live or ready
//! yet, loading models and transport errors are retried until the budget
//! runs out.

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::model::{ModelConfig, ModelIdentity, ModelState, RepositoryEntry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pause between polling rounds
pub const POLL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessState {
    CheckingLive,
    CheckingReady,
    CheckingModelIndex,
    CheckingModelState(RepositoryEntry),
    Ready(Arc<ModelConfig>),
    Failed(String),
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckingLive => write!(f, "checking server liveness"),
            Self::CheckingReady => write!(f, "checking server readiness"),
            Self::CheckingModelIndex => write!(f, "checking model repository index"),
            Self::CheckingModelState(entry) => write!(f, "checking model state ({})", entry.state),
            Self::Ready(_) => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of a single tick
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Moved to the next check; tick again right away
    Advanced,
    /// Condition not met yet; restart from liveness after a pause
    Backoff,
    Ready(Arc<ModelConfig>),
}

pub struct ReadinessTracker {
    connection: Connection,
    model: ModelIdentity,
    state: ReadinessState,
    /// Why the last round backed off, reported on timeout
    last_status: String,
}

impl ReadinessTracker {
    pub fn new(connection: Connection, model: ModelIdentity) -> Self {
        Self {
            connection,
            model,
            state: ReadinessState::CheckingLive,
            last_status: "not checked yet".to_string(),
        }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    pub fn model(&self) -> &ModelIdentity {
        &self.model
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// Advance the machine by one check.
    ///
    /// Ticking a finished machine is a no-op that repeats its result.
    pub async fn tick(&mut self) -> ClientResult<Step> {
        match self.state.clone() {
            ReadinessState::CheckingLive => {
                let live = self.connection.is_server_live().await;
                self.gate(live, "server is not live", ReadinessState::CheckingReady)
            }
            ReadinessState::CheckingReady => {
                let ready = self.connection.is_server_ready().await;
                self.gate(ready, "server is not ready", ReadinessState::CheckingModelIndex)
            }
            ReadinessState::CheckingModelIndex => {
                let index = self
                    .connection
                    .call("repository index", &self.model, |transport| async move {
                        transport.repository_index().await
                    })
                    .await;
                match index {
                    Ok(entries) => match self.select_entry(entries) {
                        Some(entry) => {
                            self.state = ReadinessState::CheckingModelState(entry);
                            Ok(Step::Advanced)
                        }
                        None => self.fail("Model not found"),
                    },
                    Err(e) => self.transient(e),
                }
            }
            ReadinessState::CheckingModelState(entry) => self.check_state(entry).await,
            ReadinessState::Ready(config) => Ok(Step::Ready(config)),
            ReadinessState::Failed(reason) => Err(ClientError::unavailable(&self.model, reason)),
        }
    }

    fn gate(
        &mut self,
        result: ClientResult<bool>,
        not_met: &str,
        next: ReadinessState,
    ) -> ClientResult<Step> {
        match result {
            Ok(true) => {
                self.state = next;
                Ok(Step::Advanced)
            }
            Ok(false) => Ok(self.backoff(not_met.to_string())),
            Err(e) => self.transient(e),
        }
    }

    /// Pick the index row for the requested model; with no version requested
    /// the most advanced state among all versions wins.
    fn select_entry(&self, entries: Vec<RepositoryEntry>) -> Option<RepositoryEntry> {
        let rank = |state: &ModelState| match state {
            ModelState::Ready => 0,
            ModelState::Loading => 1,
            _ => 2,
        };
        entries
            .into_iter()
            .filter(|entry| self.model.matches(entry))
            .min_by_key(|entry| rank(&entry.state))
    }

    async fn check_state(&mut self, entry: RepositoryEntry) -> ClientResult<Step> {
        match entry.state {
            ModelState::Loading => Ok(self.backoff("model is loading".to_string())),
            ModelState::Ready => {
                let ready = self
                    .connection
                    .call("model ready", &self.model, |transport| {
                        let model = self.model.clone();
                        async move { transport.model_ready(&model).await }
                    })
                    .await;
                match ready {
                    Ok(true) => {}
                    Ok(false) => return Ok(self.backoff("model is not ready".to_string())),
                    Err(e) => return self.transient(e),
                }

                let config = self
                    .connection
                    .call("model config", &self.model, |transport| {
                        let model = self.model.clone();
                        async move { transport.model_config(&model).await }
                    })
                    .await;
                match config {
                    Ok(config) => {
                        let config = Arc::new(config);
                        self.state = ReadinessState::Ready(config.clone());
                        Ok(Step::Ready(config))
                    }
                    // A config the client cannot decode will not improve by waiting
                    Err(ClientError::Transport {
                        source: TransportError::Protocol(message),
                        ..
                    }) => self.fail(&format!("Cannot use model config: {}", message)),
                    Err(e) => self.transient(e),
                }
            }
            state => {
                let reason = if entry.reason.is_empty() {
                    format!("Model state is {}", state)
                } else {
                    format!("Model state is {}: {}", state, entry.reason)
                };
                self.fail(&reason)
            }
        }
    }

    fn backoff(&mut self, status: String) -> Step {
        tracing::debug!(model = %self.model, status = %status, "Model not ready yet");
        self.last_status = status;
        self.state = ReadinessState::CheckingLive;
        Step::Backoff
    }

    /// Transport failures are retried; a closed connection is not
    fn transient(&mut self, error: ClientError) -> ClientResult<Step> {
        match error {
            ClientError::Transport { .. } | ClientError::Timeout { .. } => {
                Ok(self.backoff(error.to_string()))
            }
            error => Err(error),
        }
    }

    fn fail(&mut self, reason: &str) -> ClientResult<Step> {
        tracing::warn!(model = %self.model, reason = %reason, "Model is unavailable");
        self.state = ReadinessState::Failed(reason.to_string());
        Err(ClientError::unavailable(&self.model, reason))
    }
}

/// Poll until `model` is servable and return its configuration.
///
/// The budget is wall-clock from entry; every round trip and backoff is
/// capped by whatever remains of it.
pub async fn wait_for_model(
    connection: &Connection,
    model: &ModelIdentity,
    timeout: Duration,
) -> ClientResult<Arc<ModelConfig>> {
    let started = Instant::now();
    let deadline = deadline_after(started, timeout);
    let mut tracker = ReadinessTracker::new(connection.clone(), model.clone());

    tracing::debug!(
        model = %model,
        url = %connection.endpoint(),
        timeout_secs = timeout.as_secs_f64(),
        "Waiting for model"
    );

    let result = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Err(timed_out(&tracker, started));
        }

        match tokio::time::timeout(remaining, tracker.tick()).await {
            Err(_) => break Err(timed_out(&tracker, started)),
            Ok(Err(e)) => break Err(e),
            Ok(Ok(Step::Advanced)) => {}
            Ok(Ok(Step::Ready(config))) => break Ok(config),
            Ok(Ok(Step::Backoff)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break Err(timed_out(&tracker, started));
                }
                tokio::time::sleep(POLL_BACKOFF.min(remaining)).await;
            }
        }
    };

    crate::metrics::record_readiness(&model.name, crate::metrics::outcome(&result), started.elapsed());
    match &result {
        Ok(_) => tracing::info!(
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model is ready"
        ),
        Err(e) => tracing::warn!(model = %model, error = %e, "Model did not become ready"),
    }
    result
}

/// `started + timeout`, saturating at roughly thirty years out
fn deadline_after(started: Instant, timeout: Duration) -> Instant {
    started
        .checked_add(timeout)
        .unwrap_or_else(|| started + Duration::from_secs(86_400 * 365 * 30))
}

fn timed_out(tracker: &ReadinessTracker, started: Instant) -> ClientError {
    ClientError::timeout(
        format!(
            "waiting for model {} to be ready (last status: {})",
            tracker.model(),
            tracker.last_status()
        ),
        started.elapsed(),
    )
}
