//! backset is a backend-set resolution crate.
//!
//! backset tracks a mutable collection of network endpoints and announces
//! membership changes to a consumer which maintains a connection pool
//! against those endpoints. It does not perform health checking, load
//! balancing, or any network I/O of its own: it is a membership registry
//! with lifecycle semantics, acting as the pool's source of truth for
//! "which backends exist right now".
//!
//! It uses the following terminology:
//! * Services are named entities providing the same interface.
//! * Backends are specific instantiations of a program, providing
//!   a service. In the case of, e.g., a distributed database, a single
//!   service would be provided by multiple backends.
//!
//! # Usage
//!
//! * The main interface for this crate is [resolvers::set::SetResolver].
//! * Construct one from an initial list of backends and a
//!   [policy::Policy], then call [resolvers::set::SetResolver::start] to
//!   bring it into the running state.
//! * Consumers observe membership either through the
//!   [resolver::Resolver::monitor] snapshot channel (the interface a
//!   connection pool attaches to) or through
//!   [resolvers::set::SetResolver::subscribe], which delivers each
//!   [event::Event] individually.
//! * Mutations issued while the resolver is not running are queued, and
//!   applied in FIFO order when it next enters the running state.

// Public API
pub mod backend;
pub mod event;
pub mod policy;
pub mod resolver;
pub mod service;

// Default implementations of generic interfaces
pub mod resolvers;
