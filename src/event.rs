//! Typed notifications delivered to resolver subscribers.

use crate::backend::Key;
use crate::resolver::State;
use crate::service::Descriptor;
use std::sync::Arc;

/// One notification from a resolver.
///
/// Membership events carry the backend's identity key and its service
/// descriptor. The set of backends a resolver reports through
/// [crate::resolver::Resolver::monitor] is, at every point, exactly the
/// result of folding the `Added`/`Removed` events delivered so far.
#[derive(Clone, Debug)]
pub enum Event {
    /// A backend joined the set.
    Added { key: Key, descriptor: Descriptor },

    /// A backend left the set.
    Removed { key: Key, descriptor: Descriptor },

    /// The resolver's lifecycle state changed.
    StateChanged(State),

    /// A runtime failure was observed; also retrievable afterwards via
    /// [crate::resolvers::set::SetResolver::last_error].
    Error(Arc<anyhow::Error>),
}
