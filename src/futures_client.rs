//! Thread-pool client returning handles to pending requests
//!
//! [`FuturesModelClient`] owns a multi-threaded tokio runtime and submits each
//! call as a task. At most `max_workers` transport calls run at once; further
//! submissions are accepted and wait for a free slot. Limiting the number of
//! outstanding requests is up to the caller, typically by waiting on
//! [`FuturesModelClient::wait_any`] once [`FuturesModelClient::in_flight`]
//! exceeds its budget.
//!
//! Must be created and used from synchronous code.

use crate::client::{InferInputs, ModelClient};
use crate::config::{ClientConfig, ClientOptions};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::model::{ModelConfig, ModelIdentity};
use crate::tensor::TensorSet;
use crate::transport::InferOptions;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Handle to a submitted call.
///
/// Await it from async code or block on [`PendingRequest::wait`]. Dropping the
/// handle detaches the call; [`PendingRequest::cancel`] aborts it and frees
/// its worker slot.
#[derive(Debug)]
pub struct PendingRequest<T> {
    handle: JoinHandle<ClientResult<T>>,
    runtime: Handle,
}

impl<T> PendingRequest<T> {
    /// Block the current thread until the call resolves
    pub fn wait(self) -> ClientResult<T> {
        let runtime = self.runtime.clone();
        runtime.block_on(self)
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PendingRequest<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ClientError::Cancelled),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        })
    }
}

/// Decrements the in-flight counter when a task ends, including on abort
struct InFlightGuard {
    counter: Arc<InFlight>,
}

struct InFlight {
    count: AtomicUsize,
    idle: Notify,
    model: String,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::update_in_flight(&self.model, count);
        InFlightGuard {
            counter: self.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.counter.count.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::update_in_flight(&self.counter.model, count);
        if count == 0 {
            self.counter.idle.notify_waiters();
        }
    }
}

pub struct FuturesModelClient {
    runtime: Option<Runtime>,
    handle: Handle,
    client: Arc<ModelClient>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    in_flight: Arc<InFlight>,
}

impl FuturesModelClient {
    /// Build the worker runtime and a client that owns its connection.
    ///
    /// With `lazy_init` disabled this blocks until the model is ready.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let runtime = worker_runtime()?;
        let client = runtime.block_on(ModelClient::from_config(config))?;
        Ok(Self::build(runtime, client, config.max_workers))
    }

    pub fn connect(url: &str, model_name: &str) -> ClientResult<Self> {
        Self::from_config(&ClientConfig::new(url, model_name))
    }

    /// Build over an existing connection, which stays open on close
    pub fn with_connection(
        connection: Connection,
        model: ModelIdentity,
        options: ClientOptions,
        max_workers: usize,
    ) -> ClientResult<Self> {
        let runtime = worker_runtime()?;
        let client = runtime.block_on(ModelClient::with_connection(connection, model, options))?;
        Ok(Self::build(runtime, client, max_workers))
    }

    fn build(runtime: Runtime, client: ModelClient, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let model = client.model().name.clone();
        Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            client: Arc::new(client),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
                model,
            }),
        }
    }

    pub fn model(&self) -> &ModelIdentity {
        self.client.model()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submitted calls that have not resolved yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    pub fn infer_sample(&self, inputs: impl Into<InferInputs>) -> PendingRequest<TensorSet> {
        self.infer_sample_with(inputs, InferOptions::default())
    }

    pub fn infer_sample_with(
        &self,
        inputs: impl Into<InferInputs>,
        options: InferOptions,
    ) -> PendingRequest<TensorSet> {
        let inputs = inputs.into();
        self.submit(move |client| async move { client.infer_sample_with(inputs, options).await })
    }

    pub fn infer_batch(&self, inputs: impl Into<InferInputs>) -> PendingRequest<TensorSet> {
        self.infer_batch_with(inputs, InferOptions::default())
    }

    pub fn infer_batch_with(
        &self,
        inputs: impl Into<InferInputs>,
        options: InferOptions,
    ) -> PendingRequest<TensorSet> {
        let inputs = inputs.into();
        self.submit(move |client| async move { client.infer_batch_with(inputs, options).await })
    }

    pub fn wait_for_model(&self, timeout: Duration) -> PendingRequest<Arc<ModelConfig>> {
        self.submit(move |client| async move { client.wait_for_model(timeout).await })
    }

    pub fn model_config(&self) -> PendingRequest<Arc<ModelConfig>> {
        self.submit(|client| async move { client.model_config().await })
    }

    /// Block until the first of `pending` resolves.
    ///
    /// Returns its result, its index and the still pending rest.
    pub fn wait_any<T>(
        &self,
        pending: Vec<PendingRequest<T>>,
    ) -> (ClientResult<T>, usize, Vec<PendingRequest<T>>) {
        if pending.is_empty() {
            return (
                Err(ClientError::Value("No pending requests to wait for".to_string())),
                0,
                pending,
            );
        }
        self.handle.block_on(futures::future::select_all(pending))
    }

    fn submit<T, F, Fut>(&self, call: F) -> PendingRequest<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ModelClient>) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let guard = self.in_flight.enter();
        let client = self.client.clone();
        let workers = self.workers.clone();

        let handle = self.handle.spawn(async move {
            let _guard = guard;
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| ClientError::Closed(client.connection().endpoint().to_string()))?;
            call(client).await
        });

        PendingRequest {
            handle,
            runtime: self.handle.clone(),
        }
    }

    /// Wait for every submitted call to finish, then release the connection
    /// and stop the worker runtime.
    pub fn close(mut self) {
        let in_flight = self.in_flight.clone();
        self.handle.block_on(async move {
            loop {
                let idle = in_flight.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if in_flight.count.load(Ordering::SeqCst) == 0 {
                    break;
                }
                idle.await;
            }
        });

        self.client.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        tracing::debug!(model = %self.client.model(), "Closed futures client");
    }
}

impl Drop for FuturesModelClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.workers.close();
            self.client.close();
            runtime.shutdown_background();
        }
    }
}

fn worker_runtime() -> ClientResult<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .thread_name("infer-client-worker")
        .enable_all()
        .build()?)
}
