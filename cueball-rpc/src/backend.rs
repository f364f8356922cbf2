// Copyright 2020 Joyent, Inc.

use std::net::{IpAddr, SocketAddr};

use base64;
use serde::Deserialize;
use sha1::Sha1;

use derive_more::{Display, From, Into};

/// An opaque identifier assigned by the connection set to each connection it
/// announces. Keys are unique among the connections the pool currently knows
/// about.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct BackendKey(String);
/// The port number for a backend. This is a type alias for u16.
pub type BackendPort = u16;
/// The concatenation of the backend address and port with a colon
/// delimiter. This is a type alias for String.
pub type BackendName = String;
/// The IP address of the backend. This is a type alias for std::net::IpAddr.
pub type BackendAddress = IpAddr;

impl From<&str> for BackendKey {
    fn from(s: &str) -> Self {
        BackendKey(s.to_string())
    }
}

/// A single backend server reachable by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    /// The concatenation of the backend address and port with a colon delimiter.
    pub name: BackendName,
    /// The address of the backend.
    pub address: BackendAddress,
    /// The port of the backend.
    pub port: BackendPort,
}

impl Backend {
    /// Return a new instance of `Backend` given a `BackendAddress` and `BackendPort`.
    pub fn new(address: &BackendAddress, port: BackendPort) -> Self {
        Backend {
            name: backend_name(address, port),
            address: *address,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.address, self.port))
    }
}

impl From<SocketAddr> for Backend {
    fn from(addr: SocketAddr) -> Self {
        Backend::new(&addr.ip(), addr.port())
    }
}

/// Where the client should look for backends: a single explicit host, or a
/// service discovery domain handed to the connection set.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendLocation {
    Host {
        address: BackendAddress,
        port: BackendPort,
    },
    Srv {
        domain: String,
    },
}

impl BackendLocation {
    /// The backend described by an explicit host location. Discovery domains
    /// have no fixed backend.
    pub fn backend(&self) -> Option<Backend> {
        match self {
            BackendLocation::Host { address, port } => {
                Some(Backend::new(address, *port))
            }
            BackendLocation::Srv { .. } => None,
        }
    }
}

// Concatentate the backend address and port with a colon delimiter.
fn backend_name(address: &BackendAddress, port: BackendPort) -> BackendName {
    let address_str = format!("{}", address);
    [address_str, String::from(":"), port.to_string()].concat()
}

/// Return a base64 encoded identifier based on the fields of the backend.
pub fn srv_key(backend: &Backend) -> BackendKey {
    let mut sha1 = Sha1::new();
    sha1.update(backend.name.as_bytes());
    sha1.update(b"||");
    sha1.update(backend.port.to_string().as_bytes());
    sha1.update(b"||");
    sha1.update(backend.address.to_string().as_bytes());

    base64::encode(&sha1.digest().bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn srv_key_is_stable_per_backend() {
        let a = Backend::new(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2020);
        let b = Backend::new(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2021);

        assert_eq!(a.name, "10.0.0.1:2020");
        assert_eq!(Backend::from(a.socket_addr()), a);
        assert_eq!(srv_key(&a), srv_key(&a.clone()));
        assert_ne!(srv_key(&a), srv_key(&b));
    }

    #[test]
    fn backend_location_from_json() {
        let host: BackendLocation = serde_json::from_str(
            r#"{"host": {"address": "127.0.0.1", "port": 2020}}"#,
        )
        .unwrap();
        assert_eq!(
            host.backend().map(|b| b.socket_addr()),
            Some("127.0.0.1:2020".parse().unwrap())
        );

        let srv: BackendLocation =
            serde_json::from_str(r#"{"srv": {"domain": "rpc.example.com"}}"#)
                .unwrap();
        assert!(srv.backend().is_none());
    }
}
