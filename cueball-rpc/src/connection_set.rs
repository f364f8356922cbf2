// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use slog::Logger;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{BackendKey, BackendLocation};
use crate::connection::{Connection, ConnectionHandle};

/// Sent by a connection set when a new connection is ready for use.
pub struct ConnectionAddedMsg<C> {
    pub key: BackendKey,
    pub connection: Rc<C>,
    pub handle: Box<dyn ConnectionHandle>,
}

impl<C> fmt::Debug for ConnectionAddedMsg<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionAddedMsg")
            .field("key", &self.key)
            .finish()
    }
}

/// Sent by a connection set when a previously announced connection should no
/// longer receive new requests.
#[derive(Clone, Debug)]
pub struct ConnectionRemovedMsg(pub BackendKey);

/// The messages a connection set delivers to the client. Messages are
/// processed strictly in the order they are sent.
#[derive(Debug)]
pub enum SetMsg<C> {
    AddedMsg(ConnectionAddedMsg<C>),
    RemovedMsg(ConnectionRemovedMsg),
    /// The set failed to locate or connect to backends.
    ErrorMsg(String),
}

/// Parameters the client hands to its connection set when starting it.
#[derive(Clone, Debug)]
pub struct SetParameters {
    pub backend: BackendLocation,
    /// The number of connections the set should try to keep open.
    pub target: u32,
    /// The number of connections the set must never exceed.
    pub maximum: u32,
    pub keepalive_idle: Duration,
    pub log: Logger,
}

/// The discovery side of the client.
///
/// A connection set locates backends (for example via DNS), establishes
/// connections to them and announces each one with an
/// [`AddedMsg`](enum.SetMsg.html). It sends a `RemovedMsg` for a key when that
/// connection should be retired. Connections are torn down only when the
/// pool invokes the `ConnectionHandle` sent with them.
pub trait ConnectionSet<C>
where
    C: Connection,
{
    /// Start announcing connections on `tx`. Called once by the client.
    fn run(&mut self, params: SetParameters, tx: UnboundedSender<SetMsg<C>>);
    /// Stop the set and its resolver. The returned future completes once both
    /// have fully stopped.
    fn stop(&mut self) -> LocalBoxFuture<'static, ()>;
}
