//! Interface for service descriptors

use crate::backend::{Backend, Name};
use std::net::IpAddr;

/// Describes one service instance to event subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Descriptor {
    pub name: Name,
    pub address: IpAddr,
    pub port: u16,
}

impl From<&'_ Backend> for Descriptor {
    fn from(backend: &'_ Backend) -> Self {
        Self {
            name: backend.name.clone(),
            address: backend.address.ip(),
            port: backend.address.port(),
        }
    }
}

impl From<Backend> for Descriptor {
    fn from(backend: Backend) -> Self {
        Self::from(&backend)
    }
}
