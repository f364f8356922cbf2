// Copyright 2020 Joyent, Inc.

//! An RPC client built on a pool of multiplexed connections
//!
//! `cueball-rpc` issues requests to a multi-node service over persistent
//! connections that each carry many concurrent requests. It relies on two
//! traits supplied by the user: the
//! [`ConnectionSet`](connection_set/trait.ConnectionSet.html) trait, which
//! locates backends and announces connections to them, and the
//! [`Connection`](connection/trait.Connection.html) trait, which issues an RPC
//! on one connection and streams back its response messages.
//!
//! ## Connection sets
//!
//! A *connection set* is responsible for service discovery (for example via
//! DNS SRV records) and for establishing connections. It tells the client
//! about each usable connection with an `AddedMsg` and retires connections
//! with a `RemovedMsg`. Each announced connection comes with a
//! [`ConnectionHandle`](connection/trait.ConnectionHandle.html); the client
//! invokes it exactly once, when it no longer needs the connection, and only
//! then may the set tear the connection down.
//!
//! ## The pool
//!
//! Every request is assigned one connection for its duration. Connections
//! move through four states:
//!
//! | State       | Meaning                                                    |
//! |-------------|------------------------------------------------------------|
//! | `Available` | eligible for new requests, picked uniformly at random      |
//! | `Fallback`  | removed, but kept because it was the last one available    |
//! | `Draining`  | removed, waiting for its outstanding requests to finish    |
//! | `Deleted`   | discarded and its handle released                          |
//!
//! The fallback connection absorbs short flaps in service discovery where
//! every backend briefly vanishes. It keeps serving requests for 15 seconds
//! after removal, or until any new connection is added, whichever comes
//! first. There is never more than one fallback connection.
//!
//! ## Requests
//!
//! The client is single threaded and must be used from within a
//! `tokio::task::LocalSet`. Requests can be issued in two styles:
//!
//! * `Client::rpc_callback` delivers all response messages (or an error) to a
//!   completion function.
//! * `Client::rpc_stream` returns a stream of
//!   [`RpcEvent`](stream/enum.RpcEvent.html)s: response messages followed by
//!   exactly one `End` or `Error`.
//!
//! In both cases the connection is released back to the pool before the
//! caller learns that the request is over, so the caller may immediately
//! issue another request. `Client::rpc` and the helpers in the
//! [`rpc`](rpc/index.html) module build on these.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use cueball_rpc::backend::BackendLocation;
//! use cueball_rpc::client::types::ClientOptions;
//! use cueball_rpc::client::Client;
//! use cueball_rpc::rpc::RequestOptions;
//!
//! let local = tokio::task::LocalSet::new();
//! local.block_on(&runtime, async {
//!     let location = BackendLocation::Host {
//!         address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
//!         port: 2020,
//!     };
//!     let set = StaticConnectionSet::new(vec![], TcpConnection::connect);
//!     let client = Client::new(ClientOptions::new(location), set);
//!
//!     let obj = client
//!         .get_object("bucket", "key", &RequestOptions::default())
//!         .await?;
//!
//!     client.close();
//!     client.wait_closed().await;
//! });
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod client;
pub mod connection;
pub mod connection_pool;
pub mod connection_set;
pub mod context;
pub mod error;
pub mod rpc;
pub mod stream;
