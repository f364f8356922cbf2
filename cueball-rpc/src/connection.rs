// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;

use futures::stream::LocalBoxStream;
use serde_json::Value;
use slog::Logger;

use crate::error::TransportError;

/// The response messages of a single RPC. The stream ends once the remote
/// side has finished the request; an `Err` item is always the last item.
pub type ResponseStream = LocalBoxStream<'static, Result<Value, TransportError>>;

/// A multiplexed RPC connection to one backend.
///
/// The `Connection` trait is the minimal capability set the pool and client
/// need from a connection announced by a
/// [`ConnectionSet`](../connection_set/trait.ConnectionSet.html). Many
/// requests may be in flight on one connection at a time; the pool only
/// counts them.
pub trait Connection: 'static {
    /// Issue an RPC. `args` are the ordered request arguments and `log` is the
    /// per-request logger.
    fn rpc(&self, method: &str, args: Vec<Value>, log: &Logger)
        -> ResponseStream;
    /// Whether the connection has already been torn down.
    fn is_destroyed(&self) -> bool;
    /// Forcibly sever the connection. Every in-flight RPC on it fails.
    fn destroy(&self);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// The handle a connection set hands out along with each connection it
/// announces. The pool calls `release` exactly once, when it discards the
/// connection for good.
pub trait ConnectionHandle {
    fn release(&mut self);
}

impl<F> ConnectionHandle for Option<F>
where
    F: FnOnce(),
{
    fn release(&mut self) {
        if let Some(f) = self.take() {
            f()
        }
    }
}
