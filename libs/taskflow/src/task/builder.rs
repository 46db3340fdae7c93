// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::type_name;
use core::panic::Location;

use crate::loom::sync::{Arc, Mutex};
use crate::scheduler::{Scheduler, Strand};
use crate::task::completion::FnWork;
use crate::task::id::Id;
use crate::task::{Body, Completion, Task, TaskResult, Work};

pub struct TaskBuilder<'a> {
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    kind: &'a str,
    queue: Option<Scheduler>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new() -> Self {
        Self {
            location: None,
            name: None,
            kind: "task",
            queue: None,
        }
    }

    /// Override the name of tasks built by this builder.
    ///
    /// By default, tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the kind string of tasks built by this builder, this will only show up
    /// in debug messages and spans.
    ///
    /// By default, tasks are of kind `"task"`.
    #[must_use]
    pub fn kind(mut self, kind: &'a str) -> Self {
        self.kind = kind;
        self
    }

    /// Override the source code location that will be associated with tasks built by this builder.
    ///
    /// By default, tasks will inherit the source code location of where they have been first built.
    #[must_use]
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Assign the queue the unit of work will run on, see [`Task::on`].
    #[must_use]
    pub fn on(mut self, queue: &Scheduler) -> Self {
        self.queue = Some(queue.clone());
        self
    }

    #[inline]
    #[track_caller]
    fn span<T>(&self, id: Id) -> tracing::Span {
        let loc = self.location.as_ref().unwrap_or(Location::caller());
        tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            task.kind = self.kind,
            task.output = %type_name::<T>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        )
    }

    /// Wraps `work` into a new [`Task`].
    #[inline]
    #[track_caller]
    pub fn build<T, W>(self, work: W) -> Task<T>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        let id = Id::next();
        let span = self.span::<T>(id);
        Task::from_parts(
            id,
            span,
            Body::Work(Box::new(work)),
            self.queue,
            Arc::new(Strand::new()),
        )
    }

    /// Builds a [`Task`] from a closure receiving the [`Completion`] handle.
    #[inline]
    #[track_caller]
    pub fn from_fn<T, F>(self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>) + Send + 'static,
    {
        self.build(FnWork::new(f))
    }

    #[track_caller]
    pub(crate) fn resolved<T>(self, result: TaskResult<T>) -> Task<T>
    where
        T: Send + 'static,
    {
        let id = Id::next();
        let span = self.span::<T>(id);
        Task::from_parts(
            id,
            span,
            Body::Resolved(Mutex::new(Some(result))),
            None,
            Arc::new(Strand::new()),
        )
    }

    /// Builds a chain link. Links share the serial strand of the chain they extend.
    #[track_caller]
    pub(crate) fn link<T, W>(self, work: W, strand: Arc<Strand>) -> Task<T>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        let id = Id::next();
        let span = self.span::<T>(id);
        Task::from_parts(id, span, Body::Link(Box::new(work)), None, strand)
    }
}

impl Default for TaskBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}
