//! Caller-owned pool of connections keyed by endpoint
//!
//! Clients built from the same pool share one [`Connection`] per endpoint.
//! Dropping the last handle to the pool closes every pooled connection.

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::ClientResult;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    // endpoint -> shared connection
    connections: DashMap<Endpoint, Connection>,
    connection_timeout: Duration,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        tracing::debug!(
            connections = self.connections.len(),
            "ConnectionPool dropped, closing all connections"
        );
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}

impl ConnectionPool {
    pub fn new(connection_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: DashMap::new(),
                connection_timeout,
            }),
        }
    }

    /// Get the pooled connection for `url`, opening one if needed.
    ///
    /// Connections closed by a previous owner are replaced.
    pub fn get_or_open(&self, url: &str) -> ClientResult<Connection> {
        let endpoint = Endpoint::parse(url)?;

        if let Some(connection) = self.inner.connections.get(&endpoint)
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        // Entry API keeps concurrent callers from opening duplicates
        match self.inner.connections.entry(endpoint) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let connection = self.open(entry.key())?;
                    entry.insert(connection.clone());
                    tracing::debug!(url = %entry.key(), "Replaced closed pooled connection");
                    return Ok(connection);
                }
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let connection = self.open(entry.key())?;
                tracing::debug!(url = %entry.key(), "Added connection to pool");
                entry.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    fn open(&self, endpoint: &Endpoint) -> ClientResult<Connection> {
        Connection::open(&endpoint.to_string(), self.inner.connection_timeout)
    }

    /// Insert a pre-built connection, returning the one it replaced
    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        self.inner
            .connections
            .insert(connection.endpoint().clone(), connection)
    }

    /// Close and forget the connection for `url`
    pub fn remove(&self, url: &str) -> bool {
        let Ok(endpoint) = Endpoint::parse(url) else {
            return false;
        };
        match self.inner.connections.remove(&endpoint) {
            Some((endpoint, connection)) => {
                connection.close();
                tracing::debug!(url = %endpoint, "Removed connection from pool");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.inner.connections.len();
        let closed = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.value().is_closed())
            .count();
        PoolStats {
            active_connections: total - closed,
            closed_connections: closed,
        }
    }

    /// Close every pooled connection
    pub fn close_all(&self) {
        for entry in self.inner.connections.iter() {
            entry.value().close();
        }
        self.inner.connections.clear();
        tracing::debug!("Closed all pooled connections");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: usize,
    pub closed_connections: usize,
}
