// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod completion;
mod id;
mod join_handle;
mod state;

use crate::error::Error;
use crate::loom::lock;
use crate::loom::sync::{Arc, Mutex};
use crate::scheduler::{Scheduler, Strand};
use crate::task::state::{CompleteAction, StartAction, State, SubmitAction};
use core::fmt;
use std::sync::mpsc;

pub use builder::TaskBuilder;
pub use completion::Completion;
pub use id::Id;
pub use join_handle::JoinHandle;
pub use state::Lifecycle;

/// The result a task resolves to.
pub type TaskResult<T> = Result<T, Error>;

/// A unit of deferred work that can be wrapped into a [`Task`].
///
/// This is the only interface through which the engine talks to the outside world: network
/// clients, decoders, file operations etc. all plug in by implementing this trait.
pub trait Work<T: Send + 'static>: Send + Sync + 'static {
    /// Starts the work.
    ///
    /// Implementations must report exactly one result through `done`, either right away or
    /// later from any thread. Dropping `done` without reporting resolves the task with
    /// [`Error::NoResult`]. Long running work should check [`Completion::is_cancelled`] and stop
    /// early once it returns `true`.
    fn execute(&self, done: Completion<T>) {
        done.complete(Err(Error::NotImplemented));
    }

    /// Invoked when the task is cancelled, gives the work a chance to abort whatever underlying
    /// resource it holds (close a socket, abort a request...).
    fn cancel(&self) {}
}

/// A cancellable unit of deferred work producing a [`TaskResult`].
///
/// `Task`s are cheap reference-counted handles: cloning one yields another handle to the *same*
/// task, which is handy to keep a way of cancelling a task around while it is executing.
///
/// A task is driven by exactly one call to [`execute`][Task::execute] (or [`wait`][Task::wait],
/// [`join`][Task::join], [`Scheduler::block_on`]) and reports exactly one terminal event: either
/// its result, or nothing at all because it was [cancelled][Task::cancel].
pub struct Task<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Send + 'static> {
    id: Id,
    /// The task's state.
    ///
    /// This field is accessed with atomic instructions, so it's always safe to access it.
    state: State,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,
    body: Body<T>,
    /// Queue the unit of work runs on, `None` means the default scheduler.
    queue: Mutex<Option<Scheduler>>,
    /// The serial strand shared by every link of the chain this task belongs to.
    strand: Arc<Strand>,
    on_begin: Mutex<Option<BeginFn<T>>>,
    on_signal: Mutex<Option<SignalFn<T>>>,
}

pub(crate) enum Body<T: Send + 'static> {
    /// Already resolved, executing it just hands out the stored result.
    Resolved(Mutex<Option<TaskResult<T>>>),
    /// A unit of work that is dispatched onto the task's queue.
    Work(Box<dyn Work<T>>),
    /// A chain link. Links only wire up their upstream so they start inline.
    Link(Box<dyn Work<T>>),
}

/// A settled result travelling along a chain.
pub(crate) struct Outcome<T> {
    pub(crate) result: TaskResult<T>,
    /// Set once a `catch` step observed the error so that catches further down stay silent.
    pub(crate) caught: bool,
}

/// The terminal event a subscriber receives.
pub(crate) enum Signal<T> {
    Settled(Outcome<T>),
    Cancelled,
}

/// What [`Task::attach`] did with the subscriber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Attach {
    /// The subscriber is installed, the task is ready to be started.
    Start,
    /// The task was cancelled, the subscriber has been notified.
    Cancelled,
    /// The task has been submitted before, the subscriber was dropped.
    AlreadySubmitted,
}

pub(crate) type BeginFn<T> = Box<dyn FnOnce(&Task<T>) + Send>;
pub(crate) type SignalFn<T> = Box<dyn FnOnce(&Task<T>, Signal<T>) + Send>;

static_assertions::assert_impl_all!(Task<()>: Send, Sync, Clone);

// === impl Task ===

impl<T: Send + 'static> Task<T> {
    /// Wraps a unit of work into a new task.
    #[track_caller]
    pub fn new<W>(work: W) -> Self
    where
        W: Work<T>,
    {
        TaskBuilder::new().build(work)
    }

    /// Creates a task from a closure that receives the [`Completion`] handle.
    ///
    /// The closure runs on the task's queue once the task is executed.
    #[track_caller]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(Completion<T>) + Send + 'static,
    {
        TaskBuilder::new().from_fn(f)
    }

    /// Creates an already-resolved successful task. Executing it does not schedule any work.
    #[track_caller]
    pub fn success(value: T) -> Self {
        TaskBuilder::new().kind("success").resolved(Ok(value))
    }

    /// Creates an already-resolved failed task. Executing it does not schedule any work.
    #[track_caller]
    pub fn failure<E>(err: E) -> Self
    where
        E: Into<Error>,
    {
        TaskBuilder::new().kind("failure").resolved(Err(err.into()))
    }

    pub(crate) fn from_parts(
        id: Id,
        span: tracing::Span,
        body: Body<T>,
        queue: Option<Scheduler>,
        strand: Arc<Strand>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state: State::new(),
                span,
                body,
                queue: Mutex::new(queue),
                strand,
                on_begin: Mutex::new(None),
                on_signal: Mutex::new(None),
            }),
        }
    }

    /// Returns the task's unique identifier.
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Returns the current [`Lifecycle`] stage of this task.
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lifecycle()
    }

    pub fn is_pending(&self) -> bool {
        self.lifecycle() == Lifecycle::Pending
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle() == Lifecycle::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle() == Lifecycle::Cancelled
    }

    /// Assigns the queue this task's unit of work will run on.
    ///
    /// Has no effect on already-resolved tasks and chain links, which never occupy a queue
    /// themselves, and no effect once the task has been executed.
    #[must_use]
    pub fn on(self, queue: &Scheduler) -> Self {
        *lock(&self.inner.queue) = Some(queue.clone());
        self
    }

    /// Assigns `queue` unless the task already has a queue.
    pub(crate) fn set_default_queue(&self, queue: &Scheduler) {
        lock(&self.inner.queue).get_or_insert_with(|| queue.clone());
    }

    /// Runs the task, invoking `completion` with its result.
    ///
    /// Returns immediately: the unit of work runs on the task's queue (see [`Task::on`]) or the
    /// [default scheduler][Scheduler::global]. `completion` is invoked exactly once, unless the
    /// task is cancelled first in which case it is dropped without ever being called.
    ///
    /// A task may only be executed once, further calls are ignored.
    pub fn execute<F>(&self, completion: F)
    where
        F: FnOnce(TaskResult<T>) + Send + 'static,
    {
        self.subscribe(
            None,
            Box::new(move |_, signal| {
                if let Signal::Settled(outcome) = signal {
                    completion(outcome.result);
                }
            }),
        );
    }

    /// Runs the task and blocks the calling thread until it resolves.
    ///
    /// This is meant to bridge synchronous call sites. It returns [`Error::Cancelled`] if the
    /// task is cancelled while the caller waits.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when called from a worker of the serial queue the task would run
    /// on, as that would deadlock. Tasks assigned to a `current_thread` queue must be driven with
    /// [`Scheduler::block_on`] instead.
    pub fn wait(self) -> TaskResult<T> {
        if let Some(queue) = lock(&self.inner.queue).as_ref() {
            debug_assert!(
                !(queue.is_current() && queue.num_workers() <= 1),
                "Task::wait called from the serial queue {:?} it would run on",
                queue.name()
            );
        }

        let (tx, rx) = mpsc::channel();
        self.subscribe(
            None,
            Box::new(move |_, signal| {
                let result = match signal {
                    Signal::Settled(outcome) => outcome.result,
                    Signal::Cancelled => Err(Error::Cancelled),
                };
                // the receiver outlives the task unless the caller panicked
                let _ = tx.send(result);
            }),
        );

        rx.recv().unwrap_or(Err(Error::Cancelled))
    }

    /// Runs the task and returns a [`JoinHandle`] future that resolves to its result.
    pub fn join(self) -> JoinHandle<T> {
        JoinHandle::new(self)
    }

    /// Cancels the task.
    ///
    /// Cancelling is idempotent. Returns `true` if this call cancelled the task and `false` if it
    /// had already finished or was cancelled before. A successful cancel invokes the unit of
    /// work's [cancellation hook][Work::cancel] (which, for chains, cancels every upstream link)
    /// and guarantees the completion callback never fires, even if the work reports a result
    /// concurrently.
    pub fn cancel(&self) -> bool {
        if !self.inner.state.cancel() {
            return false;
        }

        let _span = self.inner.span.enter();
        tracing::trace!(task.id = %self.inner.id, "task cancelled");

        // notify before running the hook, the hook may resubmit work waiting on this task
        lock(&self.inner.on_begin).take();
        let subscriber = lock(&self.inner.on_signal).take();
        if let Some(subscriber) = subscriber {
            subscriber(self, Signal::Cancelled);
        }

        match &self.inner.body {
            Body::Work(work) | Body::Link(work) => work.cancel(),
            Body::Resolved(_) => {}
        }

        true
    }

    /// Installs the subscriber for this task's terminal event and submits it.
    pub(crate) fn subscribe(&self, on_begin: Option<BeginFn<T>>, on_signal: SignalFn<T>) {
        if self.attach(on_begin, on_signal) == Attach::Start {
            self.start();
        }
    }

    /// Marks the task as submitted and installs its subscriber, without starting it.
    ///
    /// Once this returns, a concurrent [`cancel`][Task::cancel] is guaranteed to reach the
    /// subscriber. Unless it returns [`Attach::Start`] the subscriber has either been notified
    /// already or dropped.
    pub(crate) fn attach(
        &self,
        on_begin: Option<BeginFn<T>>,
        on_signal: SignalFn<T>,
    ) -> Attach {
        match self.inner.state.submit() {
            SubmitAction::Submit => {}
            SubmitAction::Cancelled => {
                tracing::trace!(task.id = %self.inner.id, "executed a cancelled task");
                on_signal(self, Signal::Cancelled);
                return Attach::Cancelled;
            }
            SubmitAction::AlreadySubmitted => {
                tracing::warn!(
                    task.id = %self.inner.id,
                    "task executed more than once, ignoring; create a new task per attempt"
                );
                return Attach::AlreadySubmitted;
            }
        }

        *lock(&self.inner.on_begin) = on_begin;
        *lock(&self.inner.on_signal) = Some(on_signal);

        // `cancel` may have run between the submit transition and installing the subscriber,
        // in which case it found no subscriber to notify.
        if self.is_cancelled() {
            lock(&self.inner.on_begin).take();
            let subscriber = lock(&self.inner.on_signal).take();
            if let Some(subscriber) = subscriber {
                subscriber(self, Signal::Cancelled);
            }
            return Attach::Cancelled;
        }

        Attach::Start
    }

    /// Starts an [attached][Task::attach] task: resolved tasks and chain links run inline, units
    /// of work are handed to the task's queue.
    pub(crate) fn start(&self) {
        if self.is_cancelled() {
            return;
        }

        match &self.inner.body {
            Body::Resolved(_) | Body::Link(_) => self.run(),
            Body::Work(_) => {
                let queue = lock(&self.inner.queue)
                    .clone()
                    .unwrap_or_else(|| Scheduler::global().clone());

                let task = self.clone();
                if queue.spawn(move || task.run()).is_err() {
                    tracing::debug!(task.id = %self.inner.id, queue = queue.name(), "queue closed");
                    self.reject(Error::Closed);
                }
            }
        }
    }

    fn run(&self) {
        match self.inner.state.start() {
            StartAction::Run => {}
            StartAction::Cancelled => {
                tracing::trace!(task.id = %self.inner.id, "task was cancelled before it started");
                return;
            }
            StartAction::DontRun => {
                tracing::warn!(task.id = %self.inner.id, "failed to transition to running");
                return;
            }
        }

        let _span = self.inner.span.enter();

        let on_begin = lock(&self.inner.on_begin).take();
        if let Some(on_begin) = on_begin {
            on_begin(self);
        }

        match &self.inner.body {
            Body::Resolved(result) => {
                let result = lock(result).take().unwrap_or(Err(Error::NoResult));
                self.settle(Outcome::new(result));
            }
            Body::Work(work) | Body::Link(work) => work.execute(Completion::new(self.clone())),
        }
    }

    /// Resolves a task that could not be scheduled.
    fn reject(&self, err: Error) {
        if self.inner.state.start() == StartAction::Run {
            self.settle(Outcome::new(Err(err)));
        }
    }

    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        match self.inner.state.complete() {
            CompleteAction::Deliver => {
                tracing::trace!(
                    task.id = %self.inner.id,
                    task.ok = outcome.result.is_ok(),
                    "task finished"
                );
                let subscriber = lock(&self.inner.on_signal).take();
                if let Some(subscriber) = subscriber {
                    subscriber(self, Signal::Settled(outcome));
                }
            }
            CompleteAction::Discard => {
                tracing::trace!(task.id = %self.inner.id, "dropping result of cancelled task");
            }
        }
    }

    pub(crate) fn strand(&self) -> &Arc<Strand> {
        &self.inner.strand
    }
}

impl<T: Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state)
            .finish_non_exhaustive()
    }
}

// === impl Outcome ===

impl<T> Outcome<T> {
    pub(crate) fn new(result: TaskResult<T>) -> Self {
        Self {
            result,
            caught: false,
        }
    }
}
