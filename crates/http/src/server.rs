//! Per-process server state consumed by connections.
//!
//! [`Server`] owns the handler-factory registry and the connection counters.
//! It never owns connections: each connection keeps an `Arc<Server>` and
//! updates the counters as it opens, attaches handlers and goes away.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::connection::Connection;
use crate::handler::HandlerFactory;

/// Default capacity of a connection's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Settings applied to every connection of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { read_buffer_size: DEFAULT_READ_BUFFER_SIZE }
    }
}

impl ConnectionConfig {
    /// Sets how many bytes a single socket read may deliver, at least 1.
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}

/// Process-wide connection counters.
#[derive(Debug, Default)]
pub struct ServerCounters {
    connections_total: AtomicUsize,
    connections_active: AtomicUsize,
}

impl ServerCounters {
    /// Number of connections currently alive.
    pub fn connections_total(&self) -> usize {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Number of connections currently serving a request through a handler.
    pub fn connections_active(&self) -> usize {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_total.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_attached(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_detached(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

type FactoryRouter = matchit::Router<Arc<dyn HandlerFactory>>;

pub struct Server {
    router: FactoryRouter,
    counters: ServerCounters,
    config: ConnectionConfig,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("counters", &self.counters).field("config", &self.config).finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("invalid route '{route}': {source}")]
    InvalidRoute {
        route: String,
        #[source]
        source: matchit::InsertError,
    },
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Looks up the handler factory for a request path.
    pub fn handler_factory(&self, path: &str) -> Option<Arc<dyn HandlerFactory>> {
        match self.router.at(path) {
            Ok(matched) => Some(Arc::clone(matched.value)),
            Err(e) => {
                trace!(path, cause = %e, "no handler factory");
                None
            }
        }
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Creates a connection bound to this server for an accepted socket.
    pub fn connection<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Connection<R, W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Connection::new(reader, writer, Arc::clone(self))
    }

    /// Serves an accepted socket until the connection ends.
    pub async fn serve_connection<R, W>(self: Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.connection(reader, writer).run().await;
    }
}

pub struct ServerBuilder {
    routes: Vec<(String, Arc<dyn HandlerFactory>)>,
    config: ConnectionConfig,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes: Vec<&str> = self.routes.iter().map(|(route, _)| route.as_str()).collect();
        f.debug_struct("ServerBuilder").field("routes", &routes).field("config", &self.config).finish()
    }
}

impl ServerBuilder {
    fn new() -> Self {
        Self { routes: Vec::new(), config: ConnectionConfig::default() }
    }

    /// Registers `factory` for `route`, using `matchit` route syntax (`/files/{*path}`).
    pub fn route(self, route: impl Into<String>, factory: impl HandlerFactory + 'static) -> Self {
        let factory: Arc<dyn HandlerFactory> = Arc::new(factory);
        self.route_shared(route, factory)
    }

    /// Registers an already shared factory.
    pub fn route_shared(mut self, route: impl Into<String>, factory: Arc<dyn HandlerFactory>) -> Self {
        self.routes.push((route.into(), factory));
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.config = self.config.with_read_buffer_size(read_buffer_size);
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let mut router = FactoryRouter::new();
        for (route, factory) in self.routes {
            router.insert(route.as_str(), factory).map_err(|source| ServerBuildError::InvalidRoute { route, source })?;
        }
        Ok(Server { router, counters: ServerCounters::default(), config: self.config })
    }
}
