// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::error::Error;
use crate::loom::lock;
use crate::loom::sync::Mutex;
use crate::task::{Id, Outcome, Task, TaskResult, Work};

/// The handle a unit of work reports its result through.
///
/// A `Completion` is handed to [`Work::execute`] and may be moved to any thread. Reporting
/// consumes it, so a unit of work can report at most once. Dropping it without reporting
/// resolves the task with [`Error::NoResult`] (or [`Error::Panicked`] if the drop happens during
/// a panic).
///
/// Reporting a result on a task that has been cancelled in the meantime is harmless: the result
/// is silently discarded.
pub struct Completion<T: Send + 'static> {
    task: Option<Task<T>>,
}

static_assertions::assert_impl_all!(Completion<()>: Send);

impl<T: Send + 'static> Completion<T> {
    pub(crate) fn new(task: Task<T>) -> Self {
        Self { task: Some(task) }
    }

    /// Reports the result of the unit of work.
    pub fn complete(self, result: TaskResult<T>) {
        self.settle(Outcome::new(result));
    }

    /// Reports a successful result.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Reports a failure.
    pub fn fail<E>(self, err: E)
    where
        E: Into<Error>,
    {
        self.complete(Err(err.into()));
    }

    /// Returns `true` if the task has been cancelled. Long running work should poll this and
    /// bail out early, whatever it reports afterwards is discarded anyway.
    pub fn is_cancelled(&self) -> bool {
        self.task.as_ref().is_none_or(Task::is_cancelled)
    }

    /// Returns the [`Id`] of the task this completion belongs to.
    pub fn task_id(&self) -> Option<Id> {
        self.task.as_ref().map(Task::id)
    }

    pub(crate) fn settle(mut self, outcome: Outcome<T>) {
        if let Some(task) = self.task.take() {
            task.settle(outcome);
        }
    }

    /// Cancels the task this completion belongs to without reporting anything.
    pub(crate) fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let err = if std::thread::panicking() {
                tracing::error!(task.id = %task.id(), "unit of work panicked");
                Error::Panicked
            } else {
                tracing::debug!(task.id = %task.id(), "completion dropped without a result");
                Error::NoResult
            };
            task.settle(Outcome::new(Err(err)));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.task)
            .finish()
    }
}

/// Adapts a closure into a [`Work`] implementation.
pub(crate) struct FnWork<F> {
    f: Mutex<Option<F>>,
}

impl<F> FnWork<F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f: Mutex::new(Some(f)),
        }
    }
}

impl<T, F> Work<T> for FnWork<F>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>) + Send + 'static,
{
    fn execute(&self, done: Completion<T>) {
        let f = lock(&self.f).take();
        match f {
            Some(f) => f(done),
            None => done.fail(Error::NoResult),
        }
    }
}
