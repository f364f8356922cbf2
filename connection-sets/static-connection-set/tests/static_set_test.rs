// Copyright 2020 Joyent, Inc.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Mutex;

use futures::stream;
use serde_json::{json, Value};
use slog::{o, Drain, Logger};
use tokio::task::{self, LocalSet};

use cueball_rpc::backend::{srv_key, Backend, BackendLocation};
use cueball_rpc::client::types::{ClientEvent, ClientOptions};
use cueball_rpc::client::Client;
use cueball_rpc::connection::{Connection, ResponseStream};
use cueball_rpc::connection_set::SetParameters;
use cueball_rpc::error::Error;
use cueball_rpc_static_connection_set::StaticConnectionSet;

// A connection that answers every RPC by echoing its arguments.
#[derive(Debug)]
pub struct MemoryConnection {
    remote: SocketAddr,
    destroyed: Rc<Cell<bool>>,
}

impl Connection for MemoryConnection {
    fn rpc(&self, _: &str, args: Vec<Value>, _: &Logger) -> ResponseStream {
        Box::pin(stream::iter(args.into_iter().map(Ok)))
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn destroy(&self) {
        self.destroyed.set(true);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

type Opened = Rc<RefCell<Vec<(Backend, Rc<Cell<bool>>)>>>;

// Connects to any backend except those listening on port 1.
fn memory_connector(
    opened: Opened,
) -> impl FnMut(&Backend, &SetParameters) -> Result<MemoryConnection, String>
{
    move |backend: &Backend, _: &SetParameters| {
        if backend.port == 1 {
            return Err(String::from("connection refused"));
        }
        let destroyed = Rc::new(Cell::new(false));
        opened
            .borrow_mut()
            .push((backend.clone(), Rc::clone(&destroyed)));
        Ok(MemoryConnection {
            remote: backend.socket_addr(),
            destroyed,
        })
    }
}

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn options() -> ClientOptions {
    let mut opts = ClientOptions::new(BackendLocation::Host {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 2020,
    });
    opts.log = Some(test_log());
    opts
}

fn backends(ports: &[u16]) -> Vec<Backend> {
    ports
        .iter()
        .map(|port| Backend::new(&IpAddr::V4(Ipv4Addr::LOCALHOST), *port))
        .collect()
}

async fn settle() {
    for _ in 0..16 {
        task::yield_now().await;
    }
}

async fn local<F: Future<Output = ()>>(f: F) {
    LocalSet::new().run_until(f).await
}

#[tokio::test]
async fn connects_to_each_backend_and_closes() {
    local(async {
        let opened = Opened::default();
        let set = StaticConnectionSet::new(
            backends(&[3000, 3001, 3002]),
            memory_connector(opened.clone()),
        );
        let client = Client::new(options(), set.clone());
        settle().await;

        assert!(client.is_connected());
        assert_eq!(set.connections().len(), 3);
        assert_eq!(opened.borrow().len(), 3);

        let messages = client.rpc("echo", vec![json!("hi")]).await.unwrap();
        assert_eq!(messages, vec![json!("hi")]);

        client.close();
        client.wait_closed().await;

        assert!(set.connections().is_empty());
        assert!(opened.borrow().iter().all(|(_, destroyed)| destroyed.get()));
        assert!(matches!(
            client.rpc("echo", vec![]).await,
            Err(Error::ClientClosed)
        ));
    })
    .await
}

#[tokio::test]
async fn uses_host_location_without_backends() {
    local(async {
        let opened = Opened::default();
        let set =
            StaticConnectionSet::new(vec![], memory_connector(opened.clone()));
        let client = Client::new(options(), set.clone());
        settle().await;

        assert!(client.is_connected());
        let opened = opened.borrow();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0.name, "127.0.0.1:2020");
    })
    .await
}

#[tokio::test]
async fn respects_max_connections() {
    local(async {
        let opened = Opened::default();
        let set = StaticConnectionSet::new(
            backends(&[3000, 3001, 3002]),
            memory_connector(opened.clone()),
        );
        let mut opts = options();
        opts.max_connections = Some(2);
        let client = Client::new(opts, set.clone());
        settle().await;

        assert_eq!(set.connections().len(), 2);
        assert_eq!(
            client.stats().available_connections,
            cueball_rpc::connection_pool::types::ConnectionCount::from(2)
        );
    })
    .await
}

#[tokio::test]
async fn removed_backend_is_released() {
    local(async {
        let opened = Opened::default();
        let set = StaticConnectionSet::new(
            backends(&[3000, 3001]),
            memory_connector(opened.clone()),
        );
        let client = Client::new(options(), set.clone());
        settle().await;

        let first = set.key_of(&backends(&[3000])[0]).unwrap();
        let second = set.key_of(&backends(&[3001])[0]).unwrap();
        assert!(set.remove(&first));
        assert!(!set.remove(&first));
        assert_eq!(set.key_of(&backends(&[3000])[0]), None);
        settle().await;

        assert_eq!(set.connections(), vec![second.clone()]);
        let destroyed: Vec<u16> = opened
            .borrow()
            .iter()
            .filter(|(_, destroyed)| destroyed.get())
            .map(|(backend, _)| backend.port)
            .collect();
        assert_eq!(destroyed, vec![3000]);

        // The last connection is kept as a fallback rather than released.
        assert!(set.remove(&second));
        settle().await;
        assert_eq!(set.connections(), vec![second.clone()]);
        assert!(client.stats().fallback);
        assert!(client.rpc("echo", vec![json!(1)]).await.is_ok());

        // Re-adding a backend retires the fallback.
        let readded = set.add(&backends(&[3000])[0]).unwrap();
        assert_ne!(readded, first);
        settle().await;
        assert!(!client.stats().fallback);
        assert_eq!(set.connections(), vec![readded]);
    })
    .await
}

#[tokio::test]
async fn backend_returning_while_fallback_gets_new_connection() {
    local(async {
        let opened = Opened::default();
        let backend = backends(&[3000]).remove(0);
        let set = StaticConnectionSet::new(
            vec![backend.clone()],
            memory_connector(opened.clone()),
        );
        let client = Client::new(options(), set.clone());
        settle().await;

        let old = set.key_of(&backend).unwrap();
        assert!(old.to_string().starts_with(&srv_key(&backend).to_string()));
        assert!(set.remove(&old));
        settle().await;
        assert!(client.stats().fallback);

        let new = set.add(&backend).unwrap();
        assert_ne!(new, old);
        assert_eq!(set.key_of(&backend), Some(new.clone()));
        settle().await;

        assert!(!client.stats().fallback);
        assert_eq!(
            client.stats().available_connections,
            cueball_rpc::connection_pool::types::ConnectionCount::from(1)
        );
        assert_eq!(set.connections(), vec![new]);

        let opened = opened.borrow();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].1.get());
        assert!(!opened[1].1.get());
        drop(opened);

        let messages = client.rpc("echo", vec![json!("back")]).await.unwrap();
        assert_eq!(messages, vec![json!("back")]);
        assert_eq!(
            client.recent_requests()[0].backend,
            set.key_of(&backend).unwrap()
        );
    })
    .await
}

#[tokio::test]
async fn adding_a_live_backend_twice_is_refused() {
    local(async {
        let opened = Opened::default();
        let backend = backends(&[3000]).remove(0);
        let set = StaticConnectionSet::new(
            vec![backend.clone()],
            memory_connector(opened.clone()),
        );
        let _client = Client::new(options(), set.clone());
        settle().await;

        assert!(set.add(&backend).is_none());
        assert_eq!(opened.borrow().len(), 1);
    })
    .await
}

#[tokio::test]
async fn connect_failure_is_reported() {
    local(async {
        let opened = Opened::default();
        let set = StaticConnectionSet::new(
            backends(&[1, 3000]),
            memory_connector(opened.clone()),
        );
        let client = Client::new(options(), set.clone());
        let mut events = client.subscribe();
        settle().await;

        let mut saw_error = false;
        let mut saw_connect = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Error(e) => {
                    saw_error = true;
                    assert!(e.to_string().contains("connection refused"));
                }
                ClientEvent::Connect => saw_connect = true,
                ClientEvent::Closed => panic!("client closed unexpectedly"),
            }
        }
        assert!(saw_error);
        assert!(saw_connect);
        assert_eq!(set.connections().len(), 1);
    })
    .await
}

#[tokio::test]
async fn add_after_stop_is_ignored() {
    local(async {
        let opened = Opened::default();
        let set = StaticConnectionSet::new(
            backends(&[3000]),
            memory_connector(opened.clone()),
        );
        let client = Client::new(options(), set.clone());
        settle().await;

        client.close();
        client.wait_closed().await;

        assert!(set.add(&backends(&[3001])[0]).is_none());
        assert_eq!(opened.borrow().len(), 1);
    })
    .await
}
