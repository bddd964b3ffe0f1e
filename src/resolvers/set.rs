//! Implementation of [Resolver] for a mutable backend set.
//!
//! [SetResolver] owns an ordered set of backends and a lifecycle state
//! machine. Mutations issued while the machine is running apply
//! immediately; anything issued in another state lands in a FIFO pending
//! queue and is drained when the machine next enters the running state.
//! A single worker task owns all mutable state, so operations are
//! applied atomically with respect to each other, in the order they
//! arrive.
//!
//! Work the machine must not perform synchronously with a caller (the
//! initial flush after [SetResolver::start], the clear-then-reload pass
//! of [SetResolver::reset_backends], recovery out of the failed state)
//! goes onto an internal deferred-job queue, which the worker drains
//! only after the triggering command has been answered.

use crate::backend::{Backend, BackendSpec, InvalidBackend, Key};
use crate::event::Event;
use crate::policy::Policy;
use crate::resolver::{AllBackends, Resolver, State};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{method} is not allowed while the resolver is {state}")]
    InvalidState { method: &'static str, state: State },

    #[error(transparent)]
    InvalidBackend(#[from] InvalidBackend),

    #[error("Resolver terminated")]
    Terminated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Op {
    Add,
    Remove,
}

#[derive(Debug)]
struct QueuedOp {
    op: Op,
    backend: Backend,
}

// Work deferred past the currently-executing command. Each job checks
// the state it expects before acting, so a job scheduled under one
// state is harmless if a later command moved the machine elsewhere.
#[derive(Debug)]
enum Deferred {
    FinishStart,
    FinishStop,
    Recover,
    Reset { target: Vec<Backend> },
}

type SharedError = Arc<Mutex<Option<Arc<anyhow::Error>>>>;

/// The synchronous state-machine core.
///
/// Every transition returns the notifications it produced; the worker
/// publishes them. Keeping this free of channels makes the lifecycle
/// invariants testable without a runtime.
struct Machine {
    state: State,
    backends: Vec<Backend>,
    pending: VecDeque<QueuedOp>,
    deferred: VecDeque<Deferred>,
    recovery_scheduled: bool,
    last_error: SharedError,
}

impl Machine {
    fn new(initial: Vec<Backend>, last_error: SharedError) -> Self {
        let mut machine = Self {
            state: State::Stopped,
            backends: Vec::new(),
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            recovery_scheduled: false,
            last_error,
        };
        // Initial backends load exactly like adds issued before start:
        // queued until the machine first enters the running state.
        for backend in initial {
            machine.queue(Op::Add, backend);
        }
        machine
    }

    fn set_state(&mut self, state: State, out: &mut Vec<Event>) {
        self.state = state;
        out.push(Event::StateChanged(state));
    }

    fn start(&mut self) -> Result<Vec<Event>, Error> {
        if self.state != State::Stopped {
            return Err(Error::InvalidState {
                method: "start",
                state: self.state,
            });
        }
        let mut out = Vec::new();
        self.set_state(State::Starting, &mut out);
        self.deferred.push_back(Deferred::FinishStart);
        Ok(out)
    }

    fn stop(&mut self) -> Result<Vec<Event>, Error> {
        if self.state == State::Stopped {
            return Err(Error::InvalidState {
                method: "stop",
                state: self.state,
            });
        }
        let mut out = Vec::new();
        self.set_state(State::Stopping, &mut out);
        self.deferred.push_back(Deferred::FinishStop);
        Ok(out)
    }

    fn mutate(&mut self, op: Op, backend: Backend) -> Vec<Event> {
        let mut out = Vec::new();
        if self.state == State::Running {
            self.apply(op, backend, &mut out);
        } else {
            self.queue(op, backend);
            // An accepted mutation is the signal that lets a failed
            // machine resume; the drain after recovery produces the
            // corresponding membership event.
            if self.state == State::Failed && !self.recovery_scheduled {
                self.recovery_scheduled = true;
                self.deferred.push_back(Deferred::Recover);
            }
        }
        out
    }

    fn reset(&mut self, target: Vec<Backend>) {
        self.pending.clear();
        self.deferred.push_back(Deferred::Reset { target });
    }

    fn observe_error(&mut self, error: anyhow::Error) -> Vec<Event> {
        let error = Arc::new(error);
        *self.last_error.lock().unwrap() = Some(error.clone());
        let mut out = vec![Event::Error(error)];
        if matches!(self.state, State::Running | State::Starting) {
            self.set_state(State::Failed, &mut out);
        }
        out
    }

    // Applies an operation to the live set. Membership is keyed: adding
    // a present key or removing an absent one is a no-op, which keeps
    // the set equal to the fold of the events emitted so far.
    fn apply(&mut self, op: Op, backend: Backend, out: &mut Vec<Event>) {
        match op {
            Op::Add => {
                if self.contains(&backend.key) {
                    return;
                }
                out.push(Event::Added {
                    key: backend.key.clone(),
                    descriptor: (&backend).into(),
                });
                self.backends.push(backend);
            }
            Op::Remove => {
                let Some(index) =
                    self.backends.iter().position(|b| b.key == backend.key)
                else {
                    return;
                };
                let removed = self.backends.remove(index);
                out.push(Event::Removed {
                    key: removed.key.clone(),
                    descriptor: (&removed).into(),
                });
            }
        }
    }

    // Queues an operation, unless draining it would be a no-op against
    // the effective membership once everything ahead of it has applied.
    // This keeps the queue and the live set disjoint: a key in the set
    // is never simultaneously queued for add.
    fn queue(&mut self, op: Op, backend: Backend) {
        let mut present = self.contains(&backend.key);
        for entry in &self.pending {
            if entry.backend.key == backend.key {
                present = entry.op == Op::Add;
            }
        }
        if present != (op == Op::Add) {
            self.pending.push_back(QueuedOp { op, backend });
        }
    }

    fn drain(&mut self, out: &mut Vec<Event>) {
        while let Some(entry) = self.pending.pop_front() {
            self.apply(entry.op, entry.backend, out);
        }
    }

    fn contains(&self, key: &Key) -> bool {
        self.backends.iter().any(|b| &b.key == key)
    }

    // Deferred jobs run guarded: the worker routes an error returned
    // here into `observe_error`, which records it and forces the failed
    // state.
    fn run_deferred(&mut self, job: Deferred) -> Result<Vec<Event>, anyhow::Error> {
        let mut out = Vec::new();
        match job {
            Deferred::FinishStart => {
                if self.state == State::Starting {
                    self.set_state(State::Running, &mut out);
                    self.drain(&mut out);
                }
            }
            Deferred::FinishStop => {
                if self.state == State::Stopping {
                    self.set_state(State::Stopped, &mut out);
                }
            }
            Deferred::Recover => {
                self.recovery_scheduled = false;
                if self.state == State::Failed {
                    self.set_state(State::Running, &mut out);
                    self.drain(&mut out);
                }
            }
            Deferred::Reset { target } => {
                // Remove everything we hold, then load the new list;
                // both passes route through the running/queued rules.
                for backend in self.backends.clone() {
                    out.extend(self.mutate(Op::Remove, backend));
                }
                for backend in target {
                    out.extend(self.mutate(Op::Add, backend));
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
enum Command {
    Start {
        tx: oneshot::Sender<Result<(), Error>>,
    },
    Stop {
        tx: oneshot::Sender<Result<(), Error>>,
    },
    Mutate {
        op: Op,
        backend: Backend,
        tx: oneshot::Sender<()>,
    },
    Reset {
        target: Vec<Backend>,
        tx: oneshot::Sender<()>,
    },
    Fault {
        error: anyhow::Error,
        tx: oneshot::Sender<()>,
    },
}

struct Worker {
    machine: Machine,
    rx: mpsc::UnboundedReceiver<Command>,
    watch_tx: watch::Sender<AllBackends>,
    state_tx: watch::Sender<State>,
    events_tx: broadcast::Sender<Event>,
}

impl Worker {
    async fn run(mut self, mut terminate_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut terminate_rx => return,
                command = self.rx.recv() => {
                    let Some(command) = command else { return };
                    self.handle_command(command);
                    self.run_deferred();
                }
            }
        }
    }

    #[instrument(skip(self), name = "Worker::handle_command")]
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { tx } => {
                let reply = self.machine.start().map(|events| self.publish(events));
                let _ = tx.send(reply);
            }
            Command::Stop { tx } => {
                let reply = self.machine.stop().map(|events| self.publish(events));
                let _ = tx.send(reply);
            }
            Command::Mutate { op, backend, tx } => {
                event!(
                    Level::DEBUG,
                    ?op,
                    backend = %backend.name,
                    state = %self.machine.state,
                    "applying mutation"
                );
                let events = self.machine.mutate(op, backend);
                self.publish(events);
                let _ = tx.send(());
            }
            Command::Reset { target, tx } => {
                event!(
                    Level::DEBUG,
                    target_len = target.len(),
                    "resetting backend set"
                );
                self.machine.reset(target);
                let _ = tx.send(());
            }
            Command::Fault { error, tx } => {
                event!(Level::WARN, %error, "runtime failure reported");
                let events = self.machine.observe_error(error);
                self.publish(events);
                let _ = tx.send(());
            }
        }
    }

    // Drains the deferred-job queue. Jobs scheduled by other jobs (e.g.
    // recovery scheduled by a reset while failed) run in the same pass.
    fn run_deferred(&mut self) {
        while let Some(job) = self.machine.deferred.pop_front() {
            match self.machine.run_deferred(job) {
                Ok(events) => self.publish(events),
                Err(error) => {
                    let events = self.machine.observe_error(error);
                    self.publish(events);
                }
            }
        }
    }

    fn publish(&mut self, events: Vec<Event>) {
        let mut membership_changed = false;
        for event in events {
            event!(Level::TRACE, ?event, "notifying subscribers");
            let _ = self.events_tx.send(event.clone());
            match event {
                Event::Added { .. } | Event::Removed { .. } => membership_changed = true,
                Event::StateChanged(state) => {
                    self.state_tx.send_replace(state);
                }
                Event::Error(_) => {}
            }
        }
        if membership_changed {
            self.watch_tx
                .send_replace(Arc::new(self.machine.backends.clone()));
        }
    }
}

/// A [Resolver] over an explicitly managed set of backends.
///
/// Reads (`list`, `count`, `state`, `last_error`) are synchronous;
/// lifecycle and mutation methods are async and complete once the
/// worker has accepted the operation. Events fan out through
/// [SetResolver::subscribe]; a connection pool attaches through
/// [Resolver::monitor]. Subscribe before calling `start` to observe the
/// initial flush.
pub struct SetResolver {
    policy: Policy,
    cmd_tx: mpsc::UnboundedSender<Command>,
    watch_rx: watch::Receiver<AllBackends>,
    state_rx: watch::Receiver<State>,
    events_tx: broadcast::Sender<Event>,
    last_error: SharedError,
    handle: Option<tokio::task::JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl SetResolver {
    /// Creates a resolver holding `initial` backends, validated eagerly.
    ///
    /// The machine starts out stopped; the initial backends are queued
    /// and flush once [SetResolver::start] brings it to running.
    pub fn new(
        initial: impl IntoIterator<Item = BackendSpec>,
        policy: Policy,
    ) -> Result<Self, InvalidBackend> {
        let backends = initial
            .into_iter()
            .map(|spec| Backend::from_spec(&spec, Some(policy.default_port)))
            .collect::<Result<Vec<_>, _>>()?;
        let last_error: SharedError = Arc::new(Mutex::new(None));
        let machine = Machine::new(backends, last_error.clone());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = watch::channel(Arc::new(Vec::new()));
        let (state_tx, state_rx) = watch::channel(State::Stopped);
        let (events_tx, _) = broadcast::channel(policy.event_buffer);

        let worker = Worker {
            machine,
            rx: cmd_rx,
            watch_tx,
            state_tx,
            events_tx: events_tx.clone(),
        };
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = Some(tokio::task::spawn(worker.run(terminate_rx)));

        Ok(Self {
            policy,
            cmd_tx,
            watch_rx,
            state_rx,
            events_tx,
            last_error,
            handle,
            terminate_tx: Some(terminate_tx),
        })
    }

    /// Moves the resolver from stopped to running.
    ///
    /// The transition to running, and the flush of any queued
    /// operations, happen on the next scheduling turn of the worker;
    /// await the state via [SetResolver::watch_state] to observe them.
    pub async fn start(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start { tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Winds the resolver back to stopped, from any state but stopped.
    ///
    /// Applied membership and still-queued operations survive; stopping
    /// only prevents future queue draining.
    pub async fn stop(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Adds a backend to the set, returning the resolved value.
    ///
    /// While running this applies (and notifies) immediately; in every
    /// other state the operation is queued.
    pub async fn add_backend(
        &self,
        spec: impl Into<BackendSpec>,
    ) -> Result<Backend, Error> {
        self.mutate(Op::Add, spec.into()).await
    }

    /// Removes a backend from the set, returning the resolved value.
    pub async fn remove_backend(
        &self,
        spec: impl Into<BackendSpec>,
    ) -> Result<Backend, Error> {
        self.mutate(Op::Remove, spec.into()).await
    }

    async fn mutate(&self, op: Op, spec: BackendSpec) -> Result<Backend, Error> {
        let backend = Backend::from_spec(&spec, Some(self.policy.default_port))?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Mutate {
                op,
                backend: backend.clone(),
                tx,
            })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?;
        Ok(backend)
    }

    /// Replaces the entire backend set with `target`.
    ///
    /// Any queued-but-unapplied operations are discarded immediately.
    /// The removal of every held backend and the load of the new list
    /// run as one deferred unit, each step following the same
    /// running/queued rules as [SetResolver::add_backend].
    pub async fn reset_backends(
        &self,
        target: impl IntoIterator<Item = BackendSpec>,
    ) -> Result<(), Error> {
        let target = target
            .into_iter()
            .map(|spec| Backend::from_spec(&spec, Some(self.policy.default_port)))
            .collect::<Result<Vec<_>, _>>()?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reset { target, tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Reports a runtime failure to the resolver.
    ///
    /// The error is recorded for [SetResolver::last_error], republished
    /// to subscribers, and moves a running machine into the failed
    /// state. The next accepted mutation recovers it.
    pub async fn report_error(&self, error: impl Into<anyhow::Error>) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Fault {
                error: error.into(),
                tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// The current backends, in insertion order. Queued-but-undrained
    /// operations are not reflected.
    pub fn list(&self) -> Vec<Backend> {
        self.watch_rx.borrow().as_ref().clone()
    }

    /// The number of current backends.
    pub fn count(&self) -> usize {
        self.watch_rx.borrow().len()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    /// Returns a receiver tracking lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// The most recently observed runtime failure, if any. Reading does
    /// not clear it.
    pub fn last_error(&self) -> Option<Arc<anyhow::Error>> {
        self.last_error.lock().unwrap().clone()
    }

    /// Subscribes to the resolver's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }
}

impl Drop for SetResolver {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}

#[async_trait::async_trait]
impl Resolver for SetResolver {
    fn monitor(&mut self) -> watch::Receiver<AllBackends> {
        self.watch_rx.clone()
    }

    async fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Some(terminate_tx) = self.terminate_tx.take() else {
            return;
        };

        let _send_result = terminate_tx.send(());
        match handle.await {
            // Success or cancellation: quietly return
            Ok(()) => (),
            Err(err) if err.is_cancelled() => (),
            // Propagate panics from the worker
            Err(err) if err.is_panic() => {
                std::panic::panic_any(err.into_panic());
            }
            Err(err) => {
                panic!("Unexpected join error (other than panic or cancellation): {err}");
            }
        }
    }
}
