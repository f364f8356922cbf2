// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use rand::seq::IteratorRandom;
use slog::{debug, info, trace, Logger};

use crate::backend::BackendKey;
use crate::connection::{Connection, ConnectionHandle};
use crate::connection_pool::types::{
    AllocationHandle, ConnectionCount, ConnectionPoolStats, ConnectionRecord,
    ConnectionState, HandleState, RecordId, FALLBACK_STALENESS,
};
use crate::error::Error;

/// The set of connections a client may issue requests on.
///
/// The pool is driven from two directions. The connection set announces
/// connections coming and going (`on_connection_added` and
/// `on_connection_removed`), and the client allocates and releases
/// connections for individual requests. Removed connections stop receiving
/// new requests but are only discarded, and their `ConnectionHandle`
/// released, once their outstanding request count reaches zero.
///
/// When the last available connection is removed it becomes the *fallback*
/// connection and keeps serving requests for up to `FALLBACK_STALENESS`. This
/// absorbs brief flaps in service discovery where every backend disappears
/// and reappears. Any newly added connection retires the fallback.
///
/// All operations are synchronous and never block.
pub struct ConnectionPool<C> {
    records: HashMap<BackendKey, ConnectionRecord<C>>,
    available: HashSet<BackendKey>,
    fallback: Option<(BackendKey, Instant)>,
    fallback_disabled: bool,
    next_record_id: u64,
    log: Logger,
}

impl<C> ConnectionPool<C>
where
    C: Connection,
{
    pub fn new(log: Logger) -> Self {
        ConnectionPool {
            records: HashMap::new(),
            available: HashSet::new(),
            fallback: None,
            fallback_disabled: false,
            next_record_id: 0,
            log,
        }
    }

    /// Pick a connection for a new request. Available connections are chosen
    /// uniformly at random; the fallback connection is used only when none
    /// are available.
    pub fn allocate(&mut self) -> Result<AllocationHandle<C>, Error> {
        self.allocate_at(Instant::now())
    }

    #[doc(hidden)]
    pub fn allocate_at(
        &mut self,
        now: Instant,
    ) -> Result<AllocationHandle<C>, Error> {
        let m_key = self
            .available
            .iter()
            .choose(&mut rand::thread_rng())
            .cloned();

        let key = match m_key {
            Some(key) => key,
            None => match self.fallback.clone() {
                Some((key, since)) => {
                    let age = now.saturating_duration_since(since);
                    if age >= FALLBACK_STALENESS {
                        info!(
                            self.log,
                            "fallback connection {} is stale ({} ms), \
                             retiring it",
                            &key,
                            age.as_millis()
                        );
                        self.remove_fallback();
                        return Err(Error::NoBackendsAvailable);
                    }
                    debug!(self.log, "allocating fallback connection {}", &key);
                    key
                }
                None => return Err(Error::NoBackendsAvailable),
            },
        };

        let record = match self.records.get_mut(&key) {
            Some(record) => record,
            None => panic!("allocatable key {} has no connection record", key),
        };
        record.outstanding += ConnectionCount::from(1);
        trace!(
            self.log,
            "allocated connection {} (outstanding {})",
            &key,
            record.outstanding
        );

        Ok(AllocationHandle {
            key,
            record: record.id,
            connection: Rc::clone(&record.connection),
            state: HandleState::Allocated,
        })
    }

    /// Hand a connection back after its request has finished. Releasing the
    /// same handle twice is a programming error and panics.
    pub fn release(&mut self, handle: &mut AllocationHandle<C>) {
        if handle.state == HandleState::Released {
            panic!("allocation handle for {} released twice", handle.key);
        }
        handle.state = HandleState::Released;

        let record = match self.records.get_mut(&handle.key) {
            Some(record) if record.id == handle.record => record,
            _ => panic!(
                "released connection {} is not known to the pool",
                handle.key
            ),
        };
        assert!(
            record.outstanding > ConnectionCount::from(0),
            "connection {} released with no outstanding requests",
            handle.key
        );
        record.outstanding -= ConnectionCount::from(1);
        trace!(
            self.log,
            "released connection {} (outstanding {})",
            &handle.key,
            record.outstanding
        );

        if record.state == ConnectionState::Draining
            && record.outstanding == ConnectionCount::from(0)
        {
            self.delete(&handle.key);
        }
    }

    /// Add a connection announced by the connection set. A new connection
    /// always retires the fallback connection, whatever its age.
    pub fn on_connection_added(
        &mut self,
        key: BackendKey,
        connection: Rc<C>,
        handle: Box<dyn ConnectionHandle>,
    ) {
        if self.records.contains_key(&key) {
            panic!("connection set added duplicate key {}", key);
        }

        let id = RecordId::from(self.next_record_id);
        self.next_record_id += 1;

        info!(self.log, "connection {} added", &key);
        self.records.insert(
            key.clone(),
            ConnectionRecord::new(id, key.clone(), connection, handle),
        );
        self.available.insert(key);

        if self.fallback.is_some() {
            self.remove_fallback();
        }
    }

    /// Retire a connection at the request of the connection set.
    pub fn on_connection_removed(&mut self, key: &BackendKey) {
        self.on_connection_removed_at(key, Instant::now())
    }

    #[doc(hidden)]
    pub fn on_connection_removed_at(&mut self, key: &BackendKey, now: Instant) {
        let destroyed = match self.records.get(key) {
            Some(record) => {
                assert_eq!(
                    record.state,
                    ConnectionState::Available,
                    "connection set removed connection {} twice",
                    key
                );
                record.connection.is_destroyed()
            }
            None => panic!("connection set removed unknown key {}", key),
        };

        self.available.remove(key);

        if !self.available.is_empty() || self.fallback_disabled || destroyed {
            info!(self.log, "connection {} removed, draining", key);
            self.drain(key);
            return;
        }

        assert!(
            self.fallback.is_none(),
            "connection {} cannot become fallback, {} already is",
            key,
            self.fallback
                .as_ref()
                .map(|(k, _)| k.to_string())
                .unwrap_or_default()
        );
        info!(
            self.log,
            "last available connection {} removed, keeping as fallback", key
        );
        if let Some(record) = self.records.get_mut(key) {
            record.state = ConnectionState::Fallback;
        }
        self.fallback = Some((key.clone(), now));
    }

    /// Permanently turn off the fallback mechanism and retire any current
    /// fallback connection.
    pub fn disable_fallback(&mut self) {
        debug!(self.log, "disabling fallback connection");
        self.fallback_disabled = true;
        self.remove_fallback();
    }

    pub fn is_fallback_disabled(&self) -> bool {
        self.fallback_disabled
    }

    pub fn state_of(&self, key: &BackendKey) -> Option<ConnectionState> {
        self.records.get(key).map(|r| r.state)
    }

    pub fn outstanding(&self, key: &BackendKey) -> Option<ConnectionCount> {
        self.records.get(key).map(|r| r.outstanding)
    }

    pub fn fallback_key(&self) -> Option<&BackendKey> {
        self.fallback.as_ref().map(|(key, _)| key)
    }

    /// Keys of every connection the pool still knows about, including
    /// draining and fallback connections.
    pub fn keys(&self) -> Vec<BackendKey> {
        self.records.keys().cloned().collect()
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.records.values().fold(
            ConnectionPoolStats::default(),
            |mut stats, record| {
                match record.state {
                    ConnectionState::Available => {
                        stats.available_connections += ConnectionCount::from(1)
                    }
                    ConnectionState::Draining => {
                        stats.draining_connections += ConnectionCount::from(1)
                    }
                    ConnectionState::Fallback => stats.fallback = true,
                    ConnectionState::Deleted => (),
                }
                stats.outstanding_requests += record.outstanding;
                stats
            },
        )
    }

    fn remove_fallback(&mut self) {
        if let Some((key, since)) = self.fallback.take() {
            debug!(
                self.log,
                "retiring fallback connection {} (held {} ms)",
                &key,
                since.elapsed().as_millis()
            );
            self.drain(&key);
        }
    }

    fn drain(&mut self, key: &BackendKey) {
        let idle = match self.records.get_mut(key) {
            Some(record) => {
                record.state = ConnectionState::Draining;
                record.outstanding == ConnectionCount::from(0)
            }
            None => panic!("cannot drain unknown connection {}", key),
        };

        if idle {
            self.delete(key);
        } else {
            debug!(self.log, "connection {} draining", key);
        }
    }

    fn delete(&mut self, key: &BackendKey) {
        if let Some(mut record) = self.records.remove(key) {
            assert_eq!(record.outstanding, ConnectionCount::from(0));
            record.state = ConnectionState::Deleted;
            info!(self.log, "connection {} deleted", record.key);
            record.handle.release();
        }
    }
}
