// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::Error;
use crate::task::{Id, Signal, Task, TaskResult};

/// A [`Future`] resolving to the result of an executed [`Task`].
///
/// Returned by [`Task::join`]. Resolves to [`Error::Cancelled`] if the task is cancelled before
/// producing a result. Dropping the handle does *not* cancel the task, use
/// [`JoinHandle::cancel`] for that.
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct JoinHandle<T: Send + 'static> {
    task: Task<T>,
    rx: oneshot::Receiver<TaskResult<T>>,
}

static_assertions::assert_impl_all!(JoinHandle<()>: Send, Unpin);

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn new(task: Task<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        task.subscribe(
            None,
            Box::new(move |_, signal| {
                let result = match signal {
                    Signal::Settled(outcome) => outcome.result,
                    Signal::Cancelled => Err(Error::Cancelled),
                };
                // the handle may have been dropped, that's fine
                let _ = tx.send(result);
            }),
        );

        Self { task, rx }
    }

    /// Cancels the underlying task. See [`Task::cancel`].
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Returns the [`Id`] of the underlying task.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Returns `true` once the underlying task reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.task.lifecycle().is_terminal()
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = TaskResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // the subscriber was dropped without firing, the task can never resolve
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}
