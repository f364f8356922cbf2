// Copyright 2020 Joyent, Inc.

pub mod types;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task;

use crate::client::types::{
    ClientData, ClientEvent, ClientOptions, ClientState, MetricsCollector,
    RecentRequest,
};
use crate::connection::Connection;
use crate::connection_pool::types::ConnectionPoolStats;
use crate::connection_pool::ConnectionPool;
use crate::connection_set::{
    ConnectionRemovedMsg, ConnectionSet, SetMsg, SetParameters,
};
use crate::context::{ContextId, RequestContext};
use crate::error::{Error, TransportError};
use crate::stream::{RpcEvent, RpcStream};

// Default number of connections the connection set should maintain
const DEFAULT_TARGET_CONNECTIONS: u32 = 6;
// Default maximum number of connections the connection set may open
const DEFAULT_MAX_CONNECTIONS: u32 = 15;
// Default number of recent requests remembered for diagnostics
const DEFAULT_RECENT_REQUEST_COUNT: usize = 5;
// Default TCP keep-alive idle time in milliseconds
const DEFAULT_TCP_KEEPALIVE_IDLE: u64 = 10_000;
// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

struct ClientShared<C: Connection> {
    data: RefCell<ClientData<C>>,
    events: broadcast::Sender<ClientEvent>,
    log: Logger,
    unwrap_errors: bool,
    metrics: Option<Rc<dyn MetricsCollector>>,
}

/// An RPC client issuing requests over a pool of multiplexed connections.
///
/// The client runs on a single thread: it must be created from within a
/// `tokio::task::LocalSet`, and every clone of it shares the same state.
/// Connections arrive from the [`ConnectionSet`](../connection_set/trait.ConnectionSet.html)
/// passed to `new`; each request allocates one of them for its duration
/// through a [`RequestContext`](../context/struct.RequestContext.html).
///
/// Requests can be issued in two styles. `rpc_callback` (built on
/// `ctx_create_for_callback`) delivers a single result to a completion
/// function. `rpc_stream` (built on `ctx_create_for_emitter`) yields each
/// response message followed by exactly one `End` or `Error` event. In both
/// styles the request's connection is released before the caller is told
/// the request finished.
pub struct Client<C: Connection> {
    shared: Rc<ClientShared<C>>,
}

impl<C> Clone for Client<C>
where
    C: Connection,
{
    fn clone(&self) -> Client<C> {
        Client {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<C> Client<C>
where
    C: Connection,
{
    /// Create a client and start its connection set.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a `tokio::task::LocalSet`.
    pub fn new<S>(options: ClientOptions, mut set: S) -> Self
    where
        S: ConnectionSet<C> + 'static,
    {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let params = SetParameters {
            backend: options.backend.clone(),
            target: options
                .target_connections
                .unwrap_or(DEFAULT_TARGET_CONNECTIONS),
            maximum: options.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            keepalive_idle: Duration::from_millis(
                options
                    .tcp_keepalive_idle
                    .unwrap_or(DEFAULT_TCP_KEEPALIVE_IDLE),
            ),
            log: log.new(o!("component" => "ConnectionSet")),
        };

        // The connection set announces connections on tx. Messages are
        // queued until the event loop below starts processing them, so it is
        // fine for the set to send from within run().
        let (tx, rx) = unbounded_channel();
        set.run(params, tx);

        let data = ClientData {
            pool: ConnectionPool::new(
                log.new(o!("component" => "ConnectionPool")),
            ),
            contexts: HashMap::new(),
            next_context_id: 1,
            state: ClientState::Running,
            ever_connected: false,
            finalizing: false,
            fail_fast: options.fail_fast.unwrap_or(false),
            recent: VecDeque::new(),
            recent_max: options
                .recent_request_count
                .unwrap_or(DEFAULT_RECENT_REQUEST_COUNT),
            set: Some(Box::new(set)),
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(log, "client created"; "backend" => format!("{:?}", options.backend));

        let client = Client {
            shared: Rc::new(ClientShared {
                data: RefCell::new(data),
                events,
                log,
                unwrap_errors: options.unwrap_errors.unwrap_or(false),
                metrics: options.metrics,
            }),
        };

        task::spawn_local(set_event_loop(Rc::downgrade(&client.shared), rx));

        client
    }

    /// Whether the client has ever had a connection and has not been closed.
    pub fn is_connected(&self) -> bool {
        let data = self.shared.data.borrow();
        data.ever_connected && data.state == ClientState::Running
    }

    pub fn state(&self) -> ClientState {
        self.shared.data.borrow().state
    }

    pub fn get_state(&self) -> String {
        self.state().to_string()
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.shared.data.borrow().pool.stats()
    }

    /// The number of requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.shared.data.borrow().contexts.len()
    }

    pub fn recent_requests(&self) -> Vec<RecentRequest> {
        self.shared.data.borrow().recent.iter().cloned().collect()
    }

    /// Subscribe to `Connect`, `Error` and `Closed` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn log(&self) -> &Logger {
        &self.shared.log
    }

    /// Allocate a context for a request whose result is delivered to
    /// `completion`.
    ///
    /// If no connection can be allocated, `completion` is invoked with the
    /// error from a separate task (never from within this call) and `None`
    /// is returned. Otherwise the returned context invokes `completion` from
    /// [`CallbackContext::complete`](struct.CallbackContext.html#method.complete),
    /// after the context has been released.
    pub fn ctx_create_for_callback<T, F>(
        &self,
        method: &str,
        completion: F,
    ) -> Option<CallbackContext<C, T>>
    where
        T: 'static,
        F: FnOnce(Result<T, Error>) + 'static,
    {
        match self.ctx_create(method) {
            Ok(ctx) => Some(CallbackContext {
                client: self.clone(),
                ctx,
                completion: Some(Box::new(completion)),
            }),
            Err(err) => {
                debug!(self.shared.log, "request allocation failed";
                    "method" => method, "error" => %err);
                task::spawn_local(async move { completion(Err(err)) });
                None
            }
        }
    }

    /// Allocate a context for a request whose responses are streamed. The
    /// caller must hand the context back through `ctx_release` exactly once,
    /// when the response stream has finished. On failure the caller is
    /// responsible for reporting the error on its own stream.
    pub fn ctx_create_for_emitter(
        &self,
        method: &str,
    ) -> Result<RequestContext<C>, Error> {
        self.ctx_create(method).map_err(|err| {
            debug!(self.shared.log, "request allocation failed";
                "method" => method, "error" => %err);
            err
        })
    }

    /// Release a request context and the connection it holds.
    ///
    /// # Panics
    ///
    /// Panics if the context was already released.
    pub fn ctx_release(&self, ctx: &mut RequestContext<C>) {
        let finalize = {
            let mut data = self.shared.data.borrow_mut();
            if ctx.is_released() || data.contexts.remove(&ctx.id).is_none() {
                panic!("request context {} released twice", ctx.id);
            }
            data.pool.release(&mut ctx.handle);
            trace!(ctx.log, "request context released";
                "active" => data.contexts.len());

            data.state == ClientState::Closing && data.contexts.is_empty()
        };

        if finalize {
            self.finalize();
        }
    }

    /// Issue an RPC and deliver every response message to `completion` once
    /// the RPC has finished.
    pub fn rpc_callback<F>(&self, method: &str, args: Vec<Value>, completion: F)
    where
        F: FnOnce(Result<Vec<Value>, Error>) + 'static,
    {
        let cb = match self.ctx_create_for_callback(method, completion) {
            Some(cb) => cb,
            None => return,
        };

        let mut responses =
            cb.context().connection().rpc(method, args, cb.context().log());
        let client = self.clone();
        let method = method.to_string();

        task::spawn_local(async move {
            let mut messages = Vec::new();
            let result = loop {
                match responses.next().await {
                    Some(Ok(message)) => messages.push(message),
                    Some(Err(err)) => break Err(client.transport_error(err)),
                    None => break Ok(messages),
                }
            };
            drop(responses);

            client.observe(&method, cb.context(), result.as_ref().err());
            cb.complete(result);
        });
    }

    /// Issue an RPC and stream its response messages. The stream ends with
    /// exactly one `RpcEvent::End` or `RpcEvent::Error`.
    pub fn rpc_stream(&self, method: &str, args: Vec<Value>) -> RpcStream<C> {
        match self.ctx_create_for_emitter(method) {
            Ok(ctx) => {
                let responses = ctx.connection().rpc(method, args, ctx.log());
                RpcStream::new(self.clone(), method, ctx, responses)
            }
            Err(err) => RpcStream::failed(self.clone(), method, err),
        }
    }

    /// Issue an RPC and collect all of its response messages.
    pub async fn rpc(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Error> {
        let mut stream = self.rpc_stream(method, args);
        let mut messages = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                RpcEvent::Data(message) => messages.push(message),
                RpcEvent::End => break,
                RpcEvent::Error(err) => return Err(err),
            }
        }
        Ok(messages)
    }

    /// Shut the client down.
    ///
    /// New requests fail with `Error::ClientClosed` from now on. Every
    /// connection with a request in flight is destroyed, which fails those
    /// requests; once the last one is released the connection set is stopped
    /// and `ClientEvent::Closed` is published. Calling `close` again only logs
    /// a warning.
    pub fn close(&self) {
        let (idle, connections) = {
            let mut data = self.shared.data.borrow_mut();
            if data.state != ClientState::Running {
                warn!(self.shared.log, "close called more than once");
                return;
            }
            info!(self.shared.log, "closing client";
                "active" => data.contexts.len());
            data.state = ClientState::Closing;
            data.pool.disable_fallback();

            let mut connections: Vec<Rc<C>> = Vec::new();
            for conn in data.contexts.values() {
                if !connections.iter().any(|c| Rc::ptr_eq(c, conn)) {
                    connections.push(Rc::clone(conn));
                }
            }
            (data.contexts.is_empty(), connections)
        };

        if idle {
            self.finalize();
        } else {
            for conn in connections {
                conn.destroy();
            }
        }
    }

    /// Wait until the client has finished closing.
    pub async fn wait_closed(&self) {
        let mut events = self.subscribe();
        if self.state() == ClientState::Closed {
            return;
        }
        loop {
            match events.recv().await {
                Ok(ClientEvent::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == ClientState::Closed {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn ctx_create(&self, method: &str) -> Result<RequestContext<C>, Error> {
        let mut data = self.shared.data.borrow_mut();
        if data.state != ClientState::Running {
            return Err(Error::ClientClosed);
        }

        let handle = data.pool.allocate()?;
        let id = ContextId::from(data.next_context_id);
        data.next_context_id += 1;
        data.contexts.insert(id, Rc::clone(handle.connection()));
        data.remember(RecentRequest {
            id,
            method: method.to_string(),
            backend: handle.key().clone(),
            started: Utc::now(),
        });

        let log = self.shared.log.new(o!(
            "req_id" => id.to_string(),
            "method" => method.to_string(),
            "backend" => handle.key().to_string(),
        ));
        trace!(log, "request context created";
            "active" => data.contexts.len());

        Ok(RequestContext {
            id,
            handle,
            started: std::time::Instant::now(),
            log,
        })
    }

    // Stop the connection set and announce that the client is closed. Runs
    // at most once, always from a separate task.
    fn finalize(&self) {
        let m_set = {
            let mut data = self.shared.data.borrow_mut();
            if data.finalizing {
                return;
            }
            data.finalizing = true;
            data.set.take()
        };

        let client = self.clone();
        task::spawn_local(async move {
            if let Some(mut set) = m_set {
                set.stop().await;
            }
            client.shared.data.borrow_mut().state = ClientState::Closed;
            info!(client.shared.log, "client closed");
            let _ = client.shared.events.send(ClientEvent::Closed);
        });
    }

    pub(crate) fn transport_error(&self, err: TransportError) -> Error {
        if self.shared.unwrap_errors {
            Error::Transport(err.root_cause().clone())
        } else {
            Error::Transport(err)
        }
    }

    pub(crate) fn observe(
        &self,
        method: &str,
        ctx: &RequestContext<C>,
        error: Option<&Error>,
    ) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.request_completed(method, ctx.started.elapsed(), error);
        }
    }

    fn handle_set_msg(&self, msg: SetMsg<C>) {
        match msg {
            SetMsg::AddedMsg(added) => {
                let first_connect = {
                    let mut data = self.shared.data.borrow_mut();
                    data.pool.on_connection_added(
                        added.key,
                        added.connection,
                        added.handle,
                    );
                    let first = !data.ever_connected
                        && data.state == ClientState::Running;
                    if first {
                        data.ever_connected = true;
                    }
                    first
                };
                if first_connect {
                    info!(self.shared.log, "client connected");
                    let _ = self.shared.events.send(ClientEvent::Connect);
                }
            }
            SetMsg::RemovedMsg(ConnectionRemovedMsg(key)) => {
                self.shared
                    .data
                    .borrow_mut()
                    .pool
                    .on_connection_removed(&key);
            }
            SetMsg::ErrorMsg(msg) => {
                error!(self.shared.log, "connection set error: {}", msg);
                let give_up = {
                    let data = self.shared.data.borrow();
                    data.fail_fast
                        && !data.ever_connected
                        && data.state == ClientState::Running
                };
                let _ = self
                    .shared
                    .events
                    .send(ClientEvent::Error(Arc::new(Error::ConnectionSet(msg))));
                if give_up {
                    info!(self.shared.log, "failing fast on connection error");
                    self.close();
                }
            }
        }
    }
}

// Apply connection set messages to the pool, in order, until the set drops
// its sender or the client goes away.
async fn set_event_loop<C>(
    shared: Weak<ClientShared<C>>,
    mut rx: UnboundedReceiver<SetMsg<C>>,
) where
    C: Connection,
{
    while let Some(msg) = rx.recv().await {
        match shared.upgrade() {
            Some(shared) => Client { shared }.handle_set_msg(msg),
            None => break,
        }
    }
}

type Completion<T> = Box<dyn FnOnce(Result<T, Error>)>;

/// A request context paired with the function that receives the request's
/// result.
pub struct CallbackContext<C: Connection, T> {
    client: Client<C>,
    ctx: RequestContext<C>,
    completion: Option<Completion<T>>,
}

impl<C, T> CallbackContext<C, T>
where
    C: Connection,
{
    pub fn context(&self) -> &RequestContext<C> {
        &self.ctx
    }

    /// Release the context, then deliver `result` to the completion
    /// function.
    pub fn complete(mut self, result: Result<T, Error>) {
        self.client.ctx_release(&mut self.ctx);
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl<C, T> Drop for CallbackContext<C, T>
where
    C: Connection,
{
    fn drop(&mut self) {
        if !self.ctx.is_released() {
            warn!(self.ctx.log, "request context dropped without completing");
            self.client.ctx_release(&mut self.ctx);
        }
    }
}
