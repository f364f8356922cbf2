// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use slog::Logger;

use crate::backend::{BackendKey, BackendLocation};
use crate::connection::Connection;
use crate::connection_pool::ConnectionPool;
use crate::connection_set::ConnectionSet;
use crate::context::ContextId;
use crate::error::Error;

/// Receives one observation per completed request.
pub trait MetricsCollector {
    fn request_completed(
        &self,
        method: &str,
        latency: Duration,
        error: Option<&Error>,
    );
}

/// The configuration options for a client. Everything but `backend` is
/// optional. Options can be loaded from JSON; `log` and `metrics` must be
/// filled in by the caller.
#[derive(Deserialize)]
pub struct ClientOptions {
    /// Where the connection set should look for backends.
    pub backend: BackendLocation,
    /// The number of connections the connection set should keep open. If not
    /// specified the default is 6.
    pub target_connections: Option<u32>,
    /// The maximum number of connections the connection set may open. If not
    /// specified the default is 15.
    pub max_connections: Option<u32>,
    /// If true, an error reported by the connection set before the first
    /// connection is established closes the client. The default is false.
    pub fail_fast: Option<bool>,
    /// If true, transport errors are reported as the innermost error of their
    /// cause chain. The default is false.
    pub unwrap_errors: Option<bool>,
    /// How many recent requests to remember for diagnostics. The default is 5.
    pub recent_request_count: Option<usize>,
    /// TCP keep-alive idle time in milliseconds passed to the connection set.
    /// The default is 10000.
    pub tcp_keepalive_idle: Option<u64>,
    #[serde(skip)]
    pub metrics: Option<Rc<dyn MetricsCollector>>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain.
    #[serde(skip)]
    pub log: Option<Logger>,
}

impl ClientOptions {
    pub fn new(backend: BackendLocation) -> Self {
        ClientOptions {
            backend,
            target_connections: None,
            max_connections: None,
            fail_fast: None,
            unwrap_errors: None,
            recent_request_count: None,
            tcp_keepalive_idle: None,
            metrics: None,
            log: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("backend", &self.backend)
            .field("target_connections", &self.target_connections)
            .field("max_connections", &self.max_connections)
            .field("fail_fast", &self.fail_fast)
            .field("unwrap_errors", &self.unwrap_errors)
            .field("recent_request_count", &self.recent_request_count)
            .field("tcp_keepalive_idle", &self.tcp_keepalive_idle)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// Lifecycle notifications published by a client.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The first connection became available.
    Connect,
    /// The connection set reported an error.
    Error(Arc<Error>),
    /// Shutdown has completed.
    Closed,
}

/// Sum type representing the current state of the client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    /// The client accepts new requests.
    Running,
    /// `close` was called; outstanding requests are being aborted.
    Closing,
    /// The client and its connection set have shut down.
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientState::Running => fmt.write_str("running"),
            ClientState::Closing => fmt.write_str("closing"),
            ClientState::Closed => fmt.write_str("closed"),
        }
    }
}

/// A request recently started by the client.
#[derive(Clone, Debug, PartialEq)]
pub struct RecentRequest {
    pub id: ContextId,
    pub method: String,
    pub backend: BackendKey,
    pub started: DateTime<Utc>,
}

// The mutable state behind a client.
pub(crate) struct ClientData<C: Connection> {
    pub pool: ConnectionPool<C>,
    // Active request contexts and the connection each is using.
    pub contexts: HashMap<ContextId, Rc<C>>,
    pub next_context_id: u64,
    pub state: ClientState,
    pub ever_connected: bool,
    pub finalizing: bool,
    pub fail_fast: bool,
    pub recent: VecDeque<RecentRequest>,
    pub recent_max: usize,
    pub set: Option<Box<dyn ConnectionSet<C>>>,
}

impl<C> ClientData<C>
where
    C: Connection,
{
    pub fn remember(&mut self, request: RecentRequest) {
        if self.recent_max == 0 {
            return;
        }
        while self.recent.len() >= self.recent_max {
            self.recent.pop_front();
        }
        self.recent.push_back(request);
    }
}
