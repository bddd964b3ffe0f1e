//! The interface for the resolver, which finds backends.

use crate::backend::Backend;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// A point-in-time snapshot of every known backend, in insertion order.
pub type AllBackends = Arc<Vec<Backend>>;

/// Lifecycle states of a resolver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the set of backends providing a service.
///
/// The resolver is responsible for reporting the set of all possible
/// backends, but not for reporting nor tracking their health. A
/// connection-pooling consumer attaches here to learn which backends
/// exist right now.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns a receiver tracking the current backend set.
    fn monitor(&mut self) -> watch::Receiver<AllBackends>;

    /// Cleanly terminates the resolver.
    ///
    /// This ensures that background tasks, if they exist, have stopped.
    async fn terminate(&mut self) {}
}

/// Helper type for anything that implements the Resolver interface.
pub type BoxedResolver = Box<dyn Resolver>;
