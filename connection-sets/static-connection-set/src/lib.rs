// Copyright 2020 Joyent, Inc.

//! A connection set for a fixed list of backends.
//!
//! `StaticConnectionSet` opens one connection to each configured backend when
//! the client starts it. If no backends are configured it falls back to the
//! host named by the client's `BackendLocation`. Operators (and tests) can
//! keep a clone of the set to add or remove backends later on.
//!
//! Every connection is announced under its own key, the backend's `srv_key`
//! plus a serial number. A backend that is removed and then added again gets
//! a fresh connection even while the client still holds the old one.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use slog::{debug, info, warn, Logger};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use cueball_rpc::backend::{srv_key, Backend, BackendKey};
use cueball_rpc::connection::Connection;
use cueball_rpc::connection_set::{
    ConnectionAddedMsg, ConnectionRemovedMsg, ConnectionSet, SetMsg,
    SetParameters,
};

struct Announced<C> {
    // srv_key of the backend the connection points at
    backend: BackendKey,
    connection: Rc<C>,
}

struct SetData<C> {
    pool_tx: Option<UnboundedSender<SetMsg<C>>>,
    params: Option<SetParameters>,
    next_serial: u64,
    // Connections announced to the client whose handles are not yet released
    announced: HashMap<BackendKey, Announced<C>>,
    // Announced connections for which a removal has been sent
    removed: HashSet<BackendKey>,
    stopping: bool,
    stopped_tx: Option<oneshot::Sender<()>>,
    log: Option<Logger>,
}

struct SetInner<C, F> {
    backends: Vec<Backend>,
    connect: RefCell<F>,
    data: Rc<RefCell<SetData<C>>>,
}

pub struct StaticConnectionSet<C, F> {
    inner: Rc<SetInner<C, F>>,
}

impl<C, F> Clone for StaticConnectionSet<C, F> {
    fn clone(&self) -> Self {
        StaticConnectionSet {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C, F, E> StaticConnectionSet<C, F>
where
    C: Connection,
    F: FnMut(&Backend, &SetParameters) -> Result<C, E> + 'static,
    E: Display,
{
    pub fn new(backends: Vec<Backend>, connect: F) -> Self {
        StaticConnectionSet {
            inner: Rc::new(SetInner {
                backends,
                connect: RefCell::new(connect),
                data: Rc::new(RefCell::new(SetData {
                    pool_tx: None,
                    params: None,
                    next_serial: 0,
                    announced: HashMap::new(),
                    removed: HashSet::new(),
                    stopping: false,
                    stopped_tx: None,
                    log: None,
                })),
            }),
        }
    }

    /// Connect to `backend` and announce the connection. Returns the key the
    /// connection was announced under, or `None` if the set is not running or
    /// the connection attempt failed.
    pub fn add(&self, backend: &Backend) -> Option<BackendKey> {
        let (tx, params) = {
            let data = self.inner.data.borrow();
            match (&data.pool_tx, &data.params) {
                (Some(tx), Some(params)) if !data.stopping => {
                    (tx.clone(), params.clone())
                }
                _ => return None,
            }
        };

        if self.key_of(backend).is_some() {
            warn!(params.log, "backend {} already announced", backend.name);
            return None;
        }

        let result = (&mut *self.inner.connect.borrow_mut())(backend, &params);
        match result {
            Ok(conn) => {
                let conn = Rc::new(conn);
                let key = {
                    let mut data = self.inner.data.borrow_mut();
                    let key = BackendKey::from(format!(
                        "{}-{}",
                        srv_key(backend),
                        data.next_serial
                    ));
                    data.next_serial += 1;
                    data.announced.insert(
                        key.clone(),
                        Announced {
                            backend: srv_key(backend),
                            connection: Rc::clone(&conn),
                        },
                    );
                    key
                };

                let data = Rc::clone(&self.inner.data);
                let handle_key = key.clone();
                let release = move || release_connection(&data, &handle_key);

                info!(params.log, "adding backend {}", backend.name);
                let msg = SetMsg::AddedMsg(ConnectionAddedMsg {
                    key: key.clone(),
                    connection: conn,
                    handle: Box::new(Some(release)),
                });
                if tx.send(msg).is_err() {
                    warn!(params.log, "client is gone, dropping connection");
                }
                Some(key)
            }
            Err(e) => {
                let msg = format!("failed to connect to {}: {}", backend.name, e);
                warn!(params.log, "{}", msg);
                let _ = tx.send(SetMsg::ErrorMsg(msg));
                None
            }
        }
    }

    /// Ask the client to retire the connection announced under `key`.
    pub fn remove(&self, key: &BackendKey) -> bool {
        let mut data = self.inner.data.borrow_mut();
        if !data.announced.contains_key(key) || data.removed.contains(key) {
            return false;
        }
        let sent = match &data.pool_tx {
            Some(tx) => tx
                .send(SetMsg::RemovedMsg(ConnectionRemovedMsg(key.clone())))
                .is_ok(),
            None => false,
        };
        if sent {
            if let Some(log) = &data.log {
                info!(log, "removing backend {}", key);
            }
            data.removed.insert(key.clone());
        }
        sent
    }

    /// Keys of connections the client has not yet released.
    pub fn connections(&self) -> Vec<BackendKey> {
        self.inner.data.borrow().announced.keys().cloned().collect()
    }

    /// The key of the connection to `backend` that has not been removed, if
    /// any.
    pub fn key_of(&self, backend: &Backend) -> Option<BackendKey> {
        let backend = srv_key(backend);
        let data = self.inner.data.borrow();
        data.announced
            .iter()
            .find(|(key, a)| a.backend == backend && !data.removed.contains(*key))
            .map(|(key, _)| key.clone())
    }
}

fn release_connection<C>(data: &Rc<RefCell<SetData<C>>>, key: &BackendKey)
where
    C: Connection,
{
    let mut data = data.borrow_mut();
    data.removed.remove(key);
    if let Some(announced) = data.announced.remove(key) {
        if let Some(log) = &data.log {
            debug!(log, "connection {} released, closing", key);
        }
        announced.connection.destroy();
    }
    if data.stopping && data.announced.is_empty() {
        if let Some(stopped_tx) = data.stopped_tx.take() {
            let _ = stopped_tx.send(());
        }
    }
}

impl<C, F, E> ConnectionSet<C> for StaticConnectionSet<C, F>
where
    C: Connection,
    F: FnMut(&Backend, &SetParameters) -> Result<C, E> + 'static,
    E: Display,
{
    fn run(&mut self, params: SetParameters, s: UnboundedSender<SetMsg<C>>) {
        {
            let mut data = self.inner.data.borrow_mut();
            if data.pool_tx.is_some() {
                return;
            }
            data.log = Some(params.log.clone());
            data.params = Some(params.clone());
            data.pool_tx = Some(s);
        }

        let mut backends = self.inner.backends.clone();
        if backends.is_empty() {
            backends.extend(params.backend.backend());
        }
        backends.truncate(params.maximum as usize);

        backends.iter().for_each(|b| {
            let _ = self.add(b);
        });
    }

    fn stop(&mut self) -> LocalBoxFuture<'static, ()> {
        let m_stopped_rx = {
            let mut data = self.inner.data.borrow_mut();
            data.stopping = true;

            let pending: Vec<BackendKey> = data
                .announced
                .keys()
                .filter(|k| !data.removed.contains(*k))
                .cloned()
                .collect();
            if let Some(tx) = data.pool_tx.take() {
                for key in pending {
                    let _ = tx.send(SetMsg::RemovedMsg(ConnectionRemovedMsg(
                        key.clone(),
                    )));
                    data.removed.insert(key);
                }
            }

            if data.announced.is_empty() {
                None
            } else {
                let (stopped_tx, stopped_rx) = oneshot::channel();
                data.stopped_tx = Some(stopped_tx);
                Some(stopped_rx)
            }
        };

        Box::pin(async move {
            if let Some(stopped_rx) = m_stopped_rx {
                let _ = stopped_rx.await;
            }
        })
    }
}
