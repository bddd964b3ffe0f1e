//! The interface for identifying backend services.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvalidBackend {
    #[error("backend address {address:?} is not an IPv4 or IPv6 literal")]
    Address {
        address: String,
        #[source]
        source: AddrParseError,
    },

    #[error("backend {0:?} has no port, and no default port applies")]
    MissingPort(String),

    #[error("port 0 is outside the valid TCP port range")]
    PortZero,
}

/// Describes the name of a backend.
///
/// Names take the form `"<address>:<port>"`, with IPv6 addresses
/// bracketed the way [std::net::SocketAddr] renders them.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identity of a backend, used for set membership.
///
/// Derived by hashing the backend's name, port, and canonicalized
/// address with SHA-256, encoded as unpadded URL-safe base64. Every
/// textual spelling of the same (address, port) pair produces the same
/// key; distinct pairs produce distinct keys.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Key(pub Arc<str>);

impl Key {
    /// Computes the identity key for a backend descriptor.
    pub fn derive(name: &Name, port: u16, canonical_address: IpAddr) -> Self {
        let mut digest = Sha256::new();
        digest.update(name.0.as_bytes());
        digest.update(b"||");
        digest.update(port.to_string().as_bytes());
        digest.update(b"||");
        digest.update(canonical_address.to_string().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(digest.finalize()).into())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Key {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Raw input describing a backend: an address literal, an optional port,
/// and optionally an already-computed identity key.
///
/// Specs are what callers hand to the resolver; [Backend::from_spec]
/// turns them into canonical [Backend] values. A spec carrying a key is
/// assumed to have been produced from an existing backend, and the key
/// is reused verbatim rather than recomputed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackendSpec {
    pub address: String,
    pub port: Option<u16>,
    pub key: Option<Key>,
}

impl BackendSpec {
    pub fn new(address: impl ToString, port: Option<u16>) -> Self {
        Self {
            address: address.to_string(),
            port,
            key: None,
        }
    }
}

impl From<SocketAddr> for BackendSpec {
    fn from(address: SocketAddr) -> Self {
        Self {
            address: address.ip().to_string(),
            port: Some(address.port()),
            key: None,
        }
    }
}

impl From<&'_ str> for BackendSpec {
    fn from(address: &'_ str) -> Self {
        Self::new(address, None)
    }
}

impl From<&'_ Backend> for BackendSpec {
    fn from(backend: &'_ Backend) -> Self {
        Self {
            address: backend.address.ip().to_string(),
            port: Some(backend.address.port()),
            key: Some(backend.key.clone()),
        }
    }
}

impl From<Backend> for BackendSpec {
    fn from(backend: Backend) -> Self {
        Self::from(&backend)
    }
}

/// A single instance of a service.
///
/// Immutable once constructed; the name and key are derived from the
/// address at construction time.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Backend {
    pub name: Name,
    pub address: SocketAddr,
    pub key: Key,
}

impl Backend {
    /// Constructs a backend from an already-resolved socket address.
    pub fn new(address: SocketAddr) -> Self {
        let name = Name::new(address);
        let key = Key::derive(&name, address.port(), address.ip());
        Self { name, address, key }
    }

    /// Validates a [BackendSpec] and constructs the canonical backend it
    /// describes.
    ///
    /// The address must parse as an IP literal; the port comes from the
    /// spec or, failing that, `default_port`. The name is rendered from
    /// the canonical address, so equivalent spellings of one address
    /// construct equal backends.
    pub fn from_spec(
        spec: &BackendSpec,
        default_port: Option<u16>,
    ) -> Result<Self, InvalidBackend> {
        let ip: IpAddr = spec.address.parse().map_err(|source| InvalidBackend::Address {
            address: spec.address.clone(),
            source,
        })?;
        let Some(port) = spec.port.or(default_port) else {
            return Err(InvalidBackend::MissingPort(spec.address.clone()));
        };
        if port == 0 {
            return Err(InvalidBackend::PortZero);
        }
        let address = SocketAddr::new(ip, port);
        let name = Name::new(address);
        let key = match &spec.key {
            Some(key) => key.clone(),
            None => Key::derive(&name, port, ip),
        };
        Ok(Self { name, address, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn equal_pairs_share_a_key() {
        let a = Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444));
        let b = Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444));
        assert_eq!(a.key, b.key);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_pairs_get_distinct_keys() {
        let backends = [
            Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444)),
            Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4445)),
            Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4444)),
            Backend::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4444)),
            Backend::new("[ff:dd:ee::3]:4445".parse().unwrap()),
        ];
        for (i, left) in backends.iter().enumerate() {
            for right in &backends[i + 1..] {
                assert_ne!(left.key, right.key, "{} vs {}", left.name, right.name);
            }
        }
    }

    #[test]
    fn key_is_stable_across_ipv6_spellings() {
        let spellings = [
            "::1",
            "0:0:0:0:0:0:0:1",
            "0000:0000:0000:0000:0000:0000:0000:0001",
        ];
        let backends = spellings
            .iter()
            .map(|address| {
                Backend::from_spec(&BackendSpec::new(address, Some(443)), None).unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(backends[0].key, backends[1].key);
        assert_eq!(backends[1].key, backends[2].key);
        assert_eq!(backends[0].name, Name::new("[::1]:443"));
    }

    #[test]
    fn names_render_like_socket_addrs() {
        let v4 = Backend::from_spec(&BackendSpec::new("127.0.0.1", Some(80)), None).unwrap();
        assert_eq!(v4.name, Name::new("127.0.0.1:80"));
        let v6 = Backend::from_spec(&BackendSpec::new("ff:dd:ee::3", Some(4445)), None).unwrap();
        assert_eq!(v6.name, Name::new("[ff:dd:ee::3]:4445"));
    }

    #[test]
    fn default_port_fills_missing_port() {
        let backend =
            Backend::from_spec(&BackendSpec::new("192.168.0.4", None), Some(8080)).unwrap();
        assert_eq!(backend.address.port(), 8080);

        let explicit =
            Backend::from_spec(&BackendSpec::new("192.168.0.4", Some(80)), Some(8080)).unwrap();
        assert_eq!(explicit.address.port(), 80);
    }

    #[test]
    fn rejects_malformed_specs() {
        let err = Backend::from_spec(&BackendSpec::new("db.example.com", Some(80)), None)
            .expect_err("hostnames are not IP literals");
        assert!(matches!(err, InvalidBackend::Address { .. }));

        let err = Backend::from_spec(&BackendSpec::new("127.0.0.1", None), None)
            .expect_err("no port anywhere");
        assert!(matches!(err, InvalidBackend::MissingPort(_)));

        let err = Backend::from_spec(&BackendSpec::new("127.0.0.1", Some(0)), None)
            .expect_err("port zero");
        assert!(matches!(err, InvalidBackend::PortZero));
    }

    #[test]
    fn preexisting_key_is_reused_verbatim() {
        let mut spec = BackendSpec::new("127.0.0.1", Some(80));
        spec.key = Some(Key::from("carried-over"));
        let backend = Backend::from_spec(&spec, None).unwrap();
        assert_eq!(backend.key, Key::from("carried-over"));
    }

    #[test]
    fn construction_is_idempotent_through_specs() {
        let original = Backend::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5432));
        let round_tripped =
            Backend::from_spec(&BackendSpec::from(&original), None).unwrap();
        assert_eq!(original, round_tripped);
    }
}
