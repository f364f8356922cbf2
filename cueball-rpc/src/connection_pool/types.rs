// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};

use crate::backend::BackendKey;
use crate::connection::{Connection, ConnectionHandle};

/// How long the last remaining connection may keep serving requests after
/// the connection set has removed it.
pub const FALLBACK_STALENESS: Duration = Duration::from_millis(15_000);

/// A newtype wrapper around u32 used for counts of requests and connections
/// maintained by the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// Sum type representing the lifecycle state of a pooled connection.
///
/// ```text
/// Available --removed, others available--> Draining --idle--> Deleted
/// Available --removed, last one--> Fallback --stale/superseded--> Draining
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Eligible for new requests.
    Available,
    /// Removed by the connection set, but kept as a last resort because no
    /// other connection is available.
    Fallback,
    /// No longer eligible for new requests, waiting for outstanding requests
    /// to finish.
    Draining,
    /// Discarded. Terminal.
    Deleted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Available => fmt.write_str("available"),
            ConnectionState::Fallback => fmt.write_str("fallback"),
            ConnectionState::Draining => fmt.write_str("draining"),
            ConnectionState::Deleted => fmt.write_str("deleted"),
        }
    }
}

// A unique serial number for each record, so a handle can never be matched
// against a later record that reuses its key.
#[doc(hidden)]
#[derive(Copy, Clone, Debug, Display, Eq, From, Hash, PartialEq)]
pub struct RecordId(u64);

// One connection known to the pool plus its bookkeeping.
pub(crate) struct ConnectionRecord<C> {
    pub id: RecordId,
    pub key: BackendKey,
    pub connection: Rc<C>,
    pub handle: Box<dyn ConnectionHandle>,
    pub outstanding: ConnectionCount,
    pub state: ConnectionState,
}

impl<C> ConnectionRecord<C>
where
    C: Connection,
{
    pub fn new(
        id: RecordId,
        key: BackendKey,
        connection: Rc<C>,
        handle: Box<dyn ConnectionHandle>,
    ) -> Self {
        ConnectionRecord {
            id,
            key,
            connection,
            handle,
            outstanding: ConnectionCount::from(0),
            state: ConnectionState::Available,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum HandleState {
    Allocated,
    Released,
}

/// A claim on one pooled connection for the duration of one request. Must be
/// handed back to the pool it came from exactly once via
/// [`ConnectionPool::release`](../struct.ConnectionPool.html#method.release).
pub struct AllocationHandle<C> {
    pub(crate) key: BackendKey,
    pub(crate) record: RecordId,
    pub(crate) connection: Rc<C>,
    pub(crate) state: HandleState,
}

impl<C> AllocationHandle<C> {
    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn connection(&self) -> &Rc<C> {
        &self.connection
    }

    pub fn is_released(&self) -> bool {
        self.state == HandleState::Released
    }
}

impl<C> fmt::Debug for AllocationHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AllocationHandle")
            .field("key", &self.key)
            .field("record", &self.record)
            .field("state", &self.state)
            .finish()
    }
}

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// Connections eligible for new requests
    pub available_connections: ConnectionCount,
    /// Connections waiting for their outstanding requests to finish
    pub draining_connections: ConnectionCount,
    /// Whether a fallback connection is being held
    pub fallback: bool,
    /// Requests currently allocated across all connections
    pub outstanding_requests: ConnectionCount,
}
