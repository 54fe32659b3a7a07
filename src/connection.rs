//! Connection to an inference server endpoint
//!
//! A [`Connection`] owns exactly one transport handle. Clones share it, so
//! any number of callers can issue requests concurrently. Closing is
//! idempotent: the handle is released and every in-flight call resolves with
//! [`ClientError::Closed`].

use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::transport::{self, Transport};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: Endpoint,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    closed: watch::Sender<bool>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        tracing::debug!(url = %self.endpoint, "Connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Validate `url` and create the transport for its scheme.
    ///
    /// URL validation happens before any network I/O; the transport itself
    /// connects lazily on the first call. gRPC endpoints must be opened from
    /// within a tokio runtime.
    pub fn open(url: &str, connection_timeout: Duration) -> ClientResult<Self> {
        let endpoint = Endpoint::parse(url)?;
        let transport = transport::connect(&endpoint, connection_timeout)
            .map_err(|e| ClientError::transport("connect", &endpoint, e))?;

        tracing::debug!(
            url = %endpoint,
            timeout_secs = connection_timeout.as_secs_f64(),
            "Opened connection"
        );

        Ok(Self::from_transport(endpoint, transport))
    }

    /// Wrap an existing transport
    pub fn from_transport(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                transport: Mutex::new(Some(transport)),
                closed,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Single liveness round trip; errors are reported, not retried
    pub async fn is_server_live(&self) -> ClientResult<bool> {
        self.call("server live", "-", |transport| async move {
            transport.server_live().await
        })
        .await
    }

    /// Single readiness round trip; errors are reported, not retried
    pub async fn is_server_ready(&self) -> ClientResult<bool> {
        self.call("server ready", "-", |transport| async move {
            transport.server_ready().await
        })
        .await
    }

    /// Release the transport handle and fail in-flight calls
    pub fn close(&self) {
        let released = self
            .inner
            .transport
            .lock()
            .map(|mut transport| transport.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());

        self.inner.closed.send_replace(true);

        if released.is_some() {
            tracing::debug!(url = %self.inner.endpoint, "Closed connection");
        }
    }

    fn transport(&self) -> ClientResult<Arc<dyn Transport>> {
        let guard = self
            .inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .clone()
            .ok_or_else(|| ClientError::Closed(self.inner.endpoint.to_string()))
    }

    /// Run one transport call, racing it against connection close.
    ///
    /// Transport failures are wrapped with `operation` and `model` context.
    pub(crate) async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        model: impl ToString,
        f: F,
    ) -> ClientResult<T>
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let transport = self.transport()?;
        let mut closed = self.inner.closed.subscribe();

        tokio::select! {
            result = f(transport) => result.map_err(|e| ClientError::transport(operation, model, e)),
            _ = closed.wait_for(|closed| *closed) => {
                Err(ClientError::Closed(self.inner.endpoint.to_string()))
            }
        }
    }
}
