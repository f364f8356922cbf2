// Copyright 2020 Joyent, Inc.

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use futures::stream;
use serde_json::Value;
use slog::{info, o, Drain, Logger};

use cueball_rpc::backend::{Backend, BackendLocation};
use cueball_rpc::client::types::ClientOptions;
use cueball_rpc::client::Client;
use cueball_rpc::connection::{Connection, ResponseStream};
use cueball_rpc::connection_set::SetParameters;
use cueball_rpc::rpc::RequestOptions;
use cueball_rpc_static_connection_set::StaticConnectionSet;

#[derive(Debug)]
pub struct DummyConnection {
    addr: SocketAddr,
    destroyed: Cell<bool>,
}

impl DummyConnection {
    fn connect(b: &Backend, _: &SetParameters) -> Result<Self, String> {
        Ok(DummyConnection {
            addr: b.socket_addr(),
            destroyed: Cell::new(false),
        })
    }
}

impl Connection for DummyConnection {
    fn rpc(&self, method: &str, args: Vec<Value>, log: &Logger) -> ResponseStream {
        info!(log, "rpc {} on {}", method, self.addr);
        match method {
            "ping" => Box::pin(stream::empty()),
            _ => Box::pin(stream::iter(args.into_iter().take(1).map(Ok))),
        }
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
        Some(self.addr)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let be1 = Backend::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 55555);
    let be2 = Backend::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 55556);
    let be3 = Backend::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)), 55557);

    let mut opts = ClientOptions::new(BackendLocation::Srv {
        domain: String::from("rpc.example.com"),
    });
    opts.log = Some(log.clone());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let set = StaticConnectionSet::new(
            vec![be1, be2, be3],
            DummyConnection::connect,
        );
        let client = Client::new(opts, set);

        let req = RequestOptions::default();
        for i in 0..6 {
            match client.get_object("bucket", &format!("key{}", i), &req).await {
                Ok(obj) => info!(log, "got object {}: {}", i, obj),
                Err(e) => info!(log, "request {} failed: {}", i, e),
            }
        }
        if let Err(e) = client.ping(&req).await {
            info!(log, "ping failed: {}", e);
        }

        client.close();
        client.wait_closed().await;
        info!(log, "client closed"; "state" => client.get_state());
    });

    Ok(())
}
