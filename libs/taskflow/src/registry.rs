// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Keyed task deduplication with observer fan-out.
//!
//! A [`Registry`] keeps at most one active [`Task`] per key. Submitting a task under a key that
//! already has an active task cancels the old one first, so the latest request always wins.
//! [`Observer`]s registered for a key are told when the key's task begins, completes or is
//! cancelled.
//!
//! # Notifications
//!
//! Notifications are queued in the order the events happen and delivered one at a time, by
//! whichever thread is first to find the queue idle. Each notification reaches the observers in
//! registration order. Per key, a task's `will_begin` comes before its terminal event, and a
//! superseded task's terminal event comes before anything its successor reports.
//!
//! No registry lock is held while observers run, so observers may call back into the registry,
//! including [`Registry::execute`]. Whatever they trigger is delivered after they return.
//!
//! A unit of work's [cancellation hook][crate::Work::cancel] may run while the registry is
//! superseding its task, it must not submit to the same registry.
//!
//! Once the registry is dropped no further observer is called. An observer that is already
//! running when the registry is dropped on another thread finishes its call.

use crate::error::ExecuteError;
use crate::loom::lock;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use crate::scheduler::{Scheduler, Strand};
use crate::task::{Attach, BeginFn, Id, Signal, SignalFn, Task, TaskResult};
use core::cell::Cell;
use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

/// Receives lifecycle notifications for the tasks executed under a key.
///
/// Observers are held weakly: dropping the last `Arc` to an observer unregisters it.
pub trait Observer<T: Send + Sync + 'static>: Send + Sync + 'static {
    /// Called once, right before the task's unit of work starts.
    fn will_begin(&self, _key: &str, _task: &Task<T>) {}

    /// Called once when the task reported its result.
    fn did_complete(&self, key: &str, task: &Task<T>, result: &TaskResult<T>);

    /// Called once, instead of [`did_complete`][Self::did_complete], if the task was cancelled.
    fn did_cancel(&self, _key: &str, _task: &Task<T>) {}
}

/// A [`Task`] paired with the key it is deduplicated under.
pub struct KeyedTask<T: Send + Sync + 'static> {
    key: String,
    task: Task<T>,
    update: Option<Arc<T>>,
}

/// Deduplicates tasks by key and fans their lifecycle events out to observers.
///
/// Dropping the registry cancels every active task and unregisters every observer, no
/// notification is delivered afterwards.
pub struct Registry<T: Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
}

/// Configures and builds a [`Registry`].
#[derive(Debug, Default)]
pub struct Builder {
    scheduler: Option<Scheduler>,
    retain_results: bool,
}

struct Shared<T: Send + Sync + 'static> {
    scheduler: Option<Scheduler>,
    retain_results: bool,
    closed: AtomicBool,
    /// Serializes `execute` calls.
    submit: Mutex<()>,
    state: Mutex<Entries<T>>,
    /// Signalled whenever a task's terminal event has been recorded.
    settled: Condvar,
    /// Pending observer notifications, in the order the events happened.
    events: Strand,
}

struct Entries<T: Send + Sync + 'static> {
    tasks: HashMap<String, Entry<T>>,
    observers: HashMap<String, Vec<Registration<T>>>,
}

struct Entry<T: Send + Sync + 'static> {
    task: Task<T>,
    update: Option<Arc<T>>,
    /// Only populated in retain mode.
    result: Option<Arc<TaskResult<T>>>,
}

struct Registration<T: Send + Sync + 'static> {
    id: usize,
    observer: Weak<dyn Observer<T>>,
}

enum Notification<T> {
    WillBegin,
    DidComplete(Arc<TaskResult<T>>),
    DidCancel,
}

std::thread_local! {
    /// Address of the registry whose submissions the current thread is serializing, `0` if none.
    static SUBMITTING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as submitting to a registry for as long as it lives.
struct Submitting {
    prev: usize,
}

static_assertions::assert_impl_all!(Registry<()>: Send, Sync);

fn observer_id<O: ?Sized>(observer: &Arc<O>) -> usize {
    Arc::as_ptr(observer).cast::<()>().addr()
}

// === impl KeyedTask ===

impl<T: Send + Sync + 'static> KeyedTask<T> {
    pub fn new(key: impl Into<String>, task: Task<T>) -> Self {
        Self {
            key: key.into(),
            task,
            update: None,
        }
    }

    /// Attaches the value this task is going to deliver, see [`Registry::pending_update`].
    #[must_use]
    pub fn with_update(mut self, update: T) -> Self {
        self.update = Some(Arc::new(update));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn task(&self) -> &Task<T> {
        &self.task
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for KeyedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedTask")
            .field("key", &self.key)
            .field("task", &self.task)
            .field("has_update", &self.update.is_some())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Pairs this task with a dedup key for [`Registry::execute`].
    pub fn keyed(self, key: impl Into<String>) -> KeyedTask<T> {
        KeyedTask::new(key, self)
    }
}

// === impl Builder ===

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the queue used for tasks that have none assigned.
    ///
    /// By default such tasks run on the [global scheduler][Scheduler::global].
    #[must_use]
    pub fn scheduler(mut self, scheduler: &Scheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    /// Keep finished tasks and their results around until they are replaced or
    /// [removed][Registry::remove].
    #[must_use]
    pub fn retain_results(mut self, retain: bool) -> Self {
        self.retain_results = retain;
        self
    }

    pub fn build<T: Send + Sync + 'static>(self) -> Registry<T> {
        Registry {
            shared: Arc::new(Shared {
                scheduler: self.scheduler,
                retain_results: self.retain_results,
                closed: AtomicBool::new(false),
                submit: Mutex::new(()),
                state: Mutex::new(Entries {
                    tasks: HashMap::new(),
                    observers: HashMap::new(),
                }),
                settled: Condvar::new(),
                events: Strand::new(),
            }),
        }
    }
}

// === impl Registry ===

impl<T: Send + Sync + 'static> Registry<T> {
    /// Creates a registry running unassigned tasks on `scheduler`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Builder::new().scheduler(scheduler).build()
    }

    /// Executes a keyed task.
    ///
    /// An active task under the same key is cancelled first. Its observers receive
    /// [`did_cancel`][Observer::did_cancel] (or [`did_complete`][Observer::did_complete] if it
    /// finished in the meantime) before the new task is installed and submitted.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::EmptyKey`] if the key is empty and [`ExecuteError::Closed`] if the
    /// registry is being torn down.
    pub fn execute(&self, keyed: KeyedTask<T>) -> Result<(), ExecuteError> {
        let KeyedTask { key, task, update } = keyed;
        if key.is_empty() {
            tracing::warn!(task.id = %task.id(), "rejecting keyed task without key");
            return Err(ExecuteError::EmptyKey);
        }

        let shared = &self.shared;
        let attach = {
            let _submit = lock(&shared.submit);
            if shared.closed.load(Ordering::Acquire) {
                return Err(ExecuteError::Closed);
            }
            let _submitting = Submitting::enter(shared);

            let previous = lock(&shared.state)
                .tasks
                .get(&key)
                .map(|entry| entry.task.clone());
            if let Some(previous) = previous {
                tracing::debug!(
                    key = %key,
                    previous = %previous.id(),
                    next = %task.id(),
                    "superseding task"
                );
                previous.cancel();
                shared.await_settled(&key, previous.id());
            }

            if let Some(scheduler) = &shared.scheduler {
                task.set_default_queue(scheduler);
            }

            lock(&shared.state).tasks.insert(
                key.clone(),
                Entry {
                    task: task.clone(),
                    update,
                    result: None,
                },
            );

            let on_begin: BeginFn<T> = {
                let shared = Arc::downgrade(shared);
                let key = key.clone();
                Box::new(move |task: &Task<T>| Shared::will_begin(&shared, &key, task))
            };
            let on_signal: SignalFn<T> = {
                let shared = Arc::downgrade(shared);
                let key = key.clone();
                Box::new(move |task: &Task<T>, signal| {
                    Shared::on_signal(&shared, &key, task, signal);
                })
            };

            // attached while submissions are still serialized, so the next supersede is
            // guaranteed to find a subscriber to notify
            let attach = task.attach(Some(on_begin), on_signal);
            if attach == Attach::AlreadySubmitted {
                shared.forget(&key, task.id());
            }
            attach
        };

        shared.events.drain();
        if attach == Attach::Start {
            task.start();
        }

        Ok(())
    }

    /// Executes several keyed tasks, in order.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first error. Tasks before it have been submitted.
    pub fn execute_all<I>(&self, tasks: I) -> Result<(), ExecuteError>
    where
        I: IntoIterator<Item = KeyedTask<T>>,
    {
        tasks.into_iter().try_for_each(|task| self.execute(task))
    }

    /// Registers `observer` for `key`. Registering the same observer twice has no effect.
    pub fn add_observer<O>(&self, observer: &Arc<O>, key: &str)
    where
        O: Observer<T>,
    {
        let id = observer_id(observer);
        let observer: Arc<dyn Observer<T>> = observer.clone();

        let mut state = lock(&self.shared.state);
        let registrations = state.observers.entry(key.to_owned()).or_default();
        if registrations.iter().all(|registration| registration.id != id) {
            registrations.push(Registration {
                id,
                observer: Arc::downgrade(&observer),
            });
        }
    }

    /// Unregisters `observer` from `key`. Does nothing if it was not registered.
    pub fn remove_observer<O>(&self, observer: &Arc<O>, key: &str)
    where
        O: ?Sized,
    {
        let id = observer_id(observer);

        let mut state = lock(&self.shared.state);
        if let Some(registrations) = state.observers.get_mut(key) {
            registrations.retain(|registration| registration.id != id);
            if registrations.is_empty() {
                state.observers.remove(key);
            }
        }
    }

    /// Unregisters every observer of `key`.
    pub fn remove_all_observers(&self, key: &str) {
        lock(&self.shared.state).observers.remove(key);
    }

    /// Returns the number of live observers registered for `key`.
    pub fn observer_count(&self, key: &str) -> usize {
        lock(&self.shared.state).observers.get(key).map_or(0, |registrations| {
            registrations
                .iter()
                .filter(|registration| registration.observer.strong_count() > 0)
                .count()
        })
    }

    /// Returns the update payload of the task currently registered under `key`.
    pub fn pending_update(&self, key: &str) -> Option<Arc<T>> {
        lock(&self.shared.state)
            .tasks
            .get(key)
            .and_then(|entry| entry.update.clone())
    }

    /// Returns `true` if the task registered under `key` is still pending or running.
    pub fn is_executing(&self, key: &str) -> bool {
        lock(&self.shared.state)
            .tasks
            .get(key)
            .is_some_and(|entry| !entry.task.lifecycle().is_terminal())
    }

    /// Returns `true` if the task registered under `key` has finished. Only ever `true` in retain
    /// mode, otherwise finished tasks are removed right away.
    pub fn did_finish(&self, key: &str) -> bool {
        lock(&self.shared.state)
            .tasks
            .get(key)
            .is_some_and(|entry| entry.task.is_finished())
    }

    /// Returns the [`Id`] of the task registered under `key`.
    pub fn task_id(&self, key: &str) -> Option<Id> {
        lock(&self.shared.state)
            .tasks
            .get(key)
            .map(|entry| entry.task.id())
    }

    /// Cancels the task registered under `key`.
    ///
    /// Returns `true` if a task was cancelled by this call.
    pub fn cancel(&self, key: &str) -> bool {
        let task = lock(&self.shared.state)
            .tasks
            .get(key)
            .map(|entry| entry.task.clone());
        task.is_some_and(|task| task.cancel())
    }

    /// Returns the retained result of the last task that finished under `key`.
    pub fn result(&self, key: &str) -> Option<Arc<TaskResult<T>>> {
        lock(&self.shared.state)
            .tasks
            .get(key)
            .and_then(|entry| entry.result.clone())
    }

    /// Removes the entry for `key`, cancelling its task if it is still active.
    ///
    /// Returns `true` if there was an entry.
    pub fn remove(&self, key: &str) -> bool {
        let entry = lock(&self.shared.state).tasks.remove(key);
        match entry {
            Some(entry) => {
                entry.task.cancel();
                true
            }
            None => false,
        }
    }
}

impl<T: Send + Sync + 'static> Default for Registry<T> {
    fn default() -> Self {
        Builder::new().build()
    }
}

impl<T: Send + Sync + 'static> Drop for Registry<T> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Registry")
            .field("scheduler", &self.shared.scheduler)
            .field("retain_results", &self.shared.retain_results)
            .field("keys", &state.tasks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// === impl Shared ===

impl<T: Send + Sync + 'static> Shared<T> {
    fn shutdown(&self) {
        let tasks = {
            let _submit = lock(&self.submit);
            self.closed.store(true, Ordering::Release);

            let mut state = lock(&self.state);
            state.observers.clear();
            core::mem::take(&mut state.tasks)
        };

        tracing::debug!(active = tasks.len(), "tearing down registry");
        for entry in tasks.into_values() {
            entry.task.cancel();
        }
    }

    /// Collects the live observers of `key`, dropping registrations of observers that are gone.
    fn observers(state: &mut Entries<T>, key: &str) -> Vec<Arc<dyn Observer<T>>> {
        let Some(registrations) = state.observers.get_mut(key) else {
            return Vec::new();
        };

        let mut live = Vec::with_capacity(registrations.len());
        registrations.retain(|registration| match registration.observer.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        if registrations.is_empty() {
            state.observers.remove(key);
        }
        live
    }

    /// Blocks until the task `id` registered under `key` has recorded its terminal event.
    ///
    /// Only called after the task has been cancelled, so it either settles right away or
    /// finished already and its result is on the way.
    fn await_settled(&self, key: &str, id: Id) {
        let mut state = lock(&self.state);
        while state
            .tasks
            .get(key)
            .is_some_and(|entry| entry.task.id() == id && entry.result.is_none())
        {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drops the entry for `key` if it still belongs to task `id`.
    fn forget(&self, key: &str, id: Id) {
        let mut state = lock(&self.state);
        if state.tasks.get(key).is_some_and(|entry| entry.task.id() == id) {
            state.tasks.remove(key);
        }
    }

    /// Queues `notification` for the current observers of `key`.
    ///
    /// Must be called with the state lock held, that is what orders notifications with the
    /// bookkeeping they describe.
    fn notify(
        &self,
        this: &Weak<Self>,
        state: &mut Entries<T>,
        key: &str,
        task: &Task<T>,
        notification: Notification<T>,
    ) {
        let observers = Self::observers(state, key);
        if observers.is_empty() {
            return;
        }

        let this = this.clone();
        let key = key.to_owned();
        let task = task.clone();
        self.events.push(move || {
            for observer in observers {
                // teardown may race with delivery, check before every call
                if this
                    .upgrade()
                    .is_none_or(|shared| shared.closed.load(Ordering::Acquire))
                {
                    return;
                }

                match &notification {
                    Notification::WillBegin => observer.will_begin(&key, &task),
                    Notification::DidComplete(result) => observer.did_complete(&key, &task, result),
                    Notification::DidCancel => observer.did_cancel(&key, &task),
                }
            }
        });
    }

    /// Delivers queued notifications, unless this thread is in the middle of a submission to
    /// this registry, which delivers them once it is done.
    fn flush(&self) {
        if SUBMITTING.get() == core::ptr::from_ref(self).addr() {
            return;
        }
        self.events.drain();
    }

    fn will_begin(this: &Weak<Self>, key: &str, task: &Task<T>) {
        let Some(shared) = this.upgrade() else {
            return;
        };

        {
            let mut state = lock(&shared.state);
            if shared.closed.load(Ordering::Acquire) {
                return;
            }

            // superseded or removed before it got to start, its terminal event is all there is
            let current = state
                .tasks
                .get(key)
                .is_some_and(|entry| entry.task.id() == task.id());
            if !current {
                return;
            }

            tracing::trace!(key, task.id = %task.id(), "will begin");
            shared.notify(this, &mut state, key, task, Notification::WillBegin);
        }

        shared.flush();
    }

    fn on_signal(this: &Weak<Self>, key: &str, task: &Task<T>, signal: Signal<T>) {
        let Some(shared) = this.upgrade() else {
            return;
        };

        let result = match signal {
            Signal::Settled(outcome) => Some(Arc::new(outcome.result)),
            Signal::Cancelled => None,
        };

        {
            let mut state = lock(&shared.state);
            if shared.closed.load(Ordering::Acquire) {
                return;
            }

            // a removed task has no entry to update
            let current = state
                .tasks
                .get(key)
                .is_some_and(|entry| entry.task.id() == task.id());
            if current {
                match &result {
                    Some(result) if shared.retain_results => {
                        if let Some(entry) = state.tasks.get_mut(key) {
                            entry.result = Some(result.clone());
                            entry.update = None;
                        }
                    }
                    _ => {
                        state.tasks.remove(key);
                    }
                }
            }
            shared.settled.notify_all();

            let notification = match result {
                Some(result) => {
                    tracing::trace!(key, task.id = %task.id(), ok = result.is_ok(), "did complete");
                    Notification::DidComplete(result)
                }
                None => {
                    tracing::trace!(key, task.id = %task.id(), "did cancel");
                    Notification::DidCancel
                }
            };
            shared.notify(this, &mut state, key, task, notification);
        }

        shared.flush();
    }
}

// === impl Submitting ===

impl Submitting {
    fn enter<T: Send + Sync + 'static>(shared: &Shared<T>) -> Self {
        Self {
            prev: SUBMITTING.replace(core::ptr::from_ref(shared).addr()),
        }
    }
}

impl Drop for Submitting {
    fn drop(&mut self) {
        SUBMITTING.set(self.prev);
    }
}
