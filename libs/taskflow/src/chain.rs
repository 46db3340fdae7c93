// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Chain combinators.
//!
//! Every combinator wraps its upstream task into a new *link* task. Executing a link executes
//! its upstream and, once that settled, runs the link's step on the chain's serial
//! [`Strand`]. Cancelling a link cancels its upstream (and thereby every link above it), as well
//! as the inner task a [`then`][Task::then] step may have produced.
//!
//! Subscribing to the upstream, forwarding cancellation and tearing links down all go through
//! the strand as well, so the depth of a chain never shows up on the stack.

use crate::error::Error;
use crate::loom::lock;
use crate::loom::sync::{Arc, Mutex};
use crate::scheduler::{Scheduler, Strand};
use crate::task::{Completion, Outcome, Signal, Task, TaskBuilder, Work};

type Nested<B> = Arc<Mutex<Option<Task<B>>>>;
type Step<A, B> = Box<dyn FnOnce(Outcome<A>, Completion<B>, &Nested<B>) + Send>;

struct Link<A: Send + 'static, B: Send + 'static> {
    /// Owned until it settles, then released.
    upstream: Arc<Mutex<Option<Task<A>>>>,
    step: Mutex<Option<Step<A, B>>>,
    /// The inner task spawned by a `then` step, kept around so it can be cancelled.
    nested: Nested<B>,
    strand: Arc<Strand>,
}

impl<A: Send + 'static, B: Send + 'static> Work<B> for Link<A, B> {
    fn execute(&self, done: Completion<B>) {
        let step = lock(&self.step).take();
        let Some(step) = step else {
            tracing::warn!("chain link executed twice");
            return;
        };

        let slot = self.upstream.clone();
        let nested = self.nested.clone();
        let strand = self.strand.clone();
        // Subscribing from the strand keeps the stack flat: the upstream link's own subscription
        // is queued behind this job instead of nesting inside it.
        self.strand.dispatch(move || {
            let upstream = lock(&slot).clone();
            let Some(upstream) = upstream else {
                // cancelled before the upstream was subscribed
                return done.cancel();
            };

            upstream.subscribe(
                None,
                Box::new(move |_, signal| match signal {
                    Signal::Settled(outcome) => {
                        lock(&slot).take();
                        strand.dispatch(move || {
                            if done.is_cancelled() {
                                return;
                            }
                            step(outcome, done, &nested);
                        });
                    }
                    Signal::Cancelled => strand.dispatch(move || done.cancel()),
                }),
            );
        });
    }

    fn cancel(&self) {
        let upstream = lock(&self.upstream).take();
        if let Some(upstream) = upstream {
            self.strand.dispatch(move || {
                upstream.cancel();
            });
        }

        let nested = lock(&self.nested).take();
        if let Some(nested) = nested {
            nested.cancel();
        }
    }
}

impl<A: Send + 'static, B: Send + 'static> Drop for Link<A, B> {
    fn drop(&mut self) {
        // dropping the upstream drops its link in turn, unwind the chain on the strand
        let upstream = lock(&self.upstream).take();
        if let Some(upstream) = upstream {
            self.strand.dispatch(move || drop(upstream));
        }
    }
}

/// Runs `job` on `queue`, failing `done` with [`Error::Closed`] if the queue rejects it.
fn run_on<B, F>(queue: &Scheduler, done: Completion<B>, job: F)
where
    B: Send + 'static,
    F: FnOnce(Completion<B>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(done)));
    let spawned = queue.spawn({
        let slot = slot.clone();
        move || {
            let done = lock(&slot).take();
            if let Some(done) = done {
                job(done);
            }
        }
    });

    if spawned.is_err() {
        tracing::debug!(queue = queue.name(), "step queue closed");
        let done = lock(&slot).take();
        if let Some(done) = done {
            done.fail(Error::Closed);
        }
    }
}

fn inspect_step<A, F>(outcome: Outcome<A>, done: Completion<A>, f: F)
where
    A: Send + 'static,
    F: FnOnce(&A) -> anyhow::Result<()>,
{
    match outcome.result {
        Ok(value) => match f(&value) {
            Ok(()) => done.settle(Outcome {
                result: Ok(value),
                caught: outcome.caught,
            }),
            Err(err) => done.fail(err),
        },
        Err(err) => done.settle(Outcome {
            result: Err(err),
            caught: outcome.caught,
        }),
    }
}

fn catch_step<A, F>(outcome: Outcome<A>, done: Completion<A>, handler: F)
where
    A: Send + 'static,
    F: FnOnce(&Error),
{
    match outcome {
        Outcome {
            result: Err(err),
            caught: false,
        } => {
            handler(&err);
            done.settle(Outcome {
                result: Err(err),
                caught: true,
            });
        }
        outcome => done.settle(outcome),
    }
}

// === impl Task ===

impl<A: Send + 'static> Task<A> {
    #[track_caller]
    fn link<B, F>(self, kind: &'static str, step: F) -> Task<B>
    where
        B: Send + 'static,
        F: FnOnce(Outcome<A>, Completion<B>, &Nested<B>) + Send + 'static,
    {
        let strand = self.strand().clone();
        let link = Link {
            upstream: Arc::new(Mutex::new(Some(self))),
            step: Mutex::new(Some(Box::new(step))),
            nested: Arc::new(Mutex::new(None)),
            strand: strand.clone(),
        };
        TaskBuilder::new().kind(kind).link(link, strand)
    }

    /// Continues with the task returned by `f` once this task succeeded.
    ///
    /// The resulting task resolves to the result of the inner task. If this task fails, `f` is
    /// never invoked and the failure is passed on.
    #[track_caller]
    pub fn then<B, F>(self, f: F) -> Task<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Task<B> + Send + 'static,
    {
        self.link("then", move |outcome, done: Completion<B>, nested: &Nested<B>| {
            let value = match outcome.result {
                Ok(value) => value,
                Err(err) => {
                    return done.settle(Outcome {
                        result: Err(err),
                        caught: outcome.caught,
                    });
                }
            };

            let inner = f(value);
            *lock(nested) = Some(inner.clone());
            // the link may have been cancelled while `f` ran, before the inner task was stored
            if done.is_cancelled() {
                lock(nested).take();
                inner.cancel();
                return;
            }

            let nested = nested.clone();
            inner.subscribe(
                None,
                Box::new(move |_, signal| {
                    lock(&nested).take();
                    match signal {
                        Signal::Settled(outcome) => done.settle(outcome),
                        Signal::Cancelled => done.cancel(),
                    }
                }),
            );
        })
    }

    /// Like [`then`][Self::then], but `f` does not receive this task's value.
    #[track_caller]
    pub fn then_run<B, F>(self, f: F) -> Task<B>
    where
        B: Send + 'static,
        F: FnOnce() -> Task<B> + Send + 'static,
    {
        self.then(move |_| f())
    }

    /// Transforms the value of this task.
    #[track_caller]
    pub fn map<B, F>(self, f: F) -> Task<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.link("map", move |outcome, done: Completion<B>, _: &Nested<B>| {
            done.settle(Outcome {
                result: outcome.result.map(f),
                caught: outcome.caught,
            });
        })
    }

    /// Transforms the value of this task with a conversion that may fail.
    ///
    /// Errors raised by `f` resolve the chain with [`Error::Decoding`], unless they wrap an
    /// [`Error`] already in which case that error is passed on as is.
    #[track_caller]
    pub fn try_map<B, F>(self, f: F) -> Task<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> anyhow::Result<B> + Send + 'static,
    {
        self.link("try_map", move |outcome, done: Completion<B>, _: &Nested<B>| {
            match outcome.result {
                Ok(value) => match f(value) {
                    Ok(value) => done.succeed(value),
                    Err(err) => done.fail(err.downcast::<Error>().unwrap_or_else(Error::Decoding)),
                },
                Err(err) => done.settle(Outcome {
                    result: Err(err),
                    caught: outcome.caught,
                }),
            }
        })
    }

    /// Runs a side effect with a reference to this task's value, keeping the value.
    ///
    /// An error returned by `f` becomes the chain's failure.
    #[track_caller]
    pub fn inspect<F>(self, f: F) -> Task<A>
    where
        F: FnOnce(&A) -> anyhow::Result<()> + Send + 'static,
    {
        self.link("inspect", move |outcome, done: Completion<A>, _: &Nested<A>| {
            inspect_step(outcome, done, f);
        })
    }

    /// Like [`inspect`][Self::inspect], but the side effect runs on `queue`.
    ///
    /// If `queue` has been stopped the chain fails with [`Error::Closed`].
    #[track_caller]
    pub fn inspect_on<F>(self, queue: &Scheduler, f: F) -> Task<A>
    where
        F: FnOnce(&A) -> anyhow::Result<()> + Send + 'static,
    {
        let queue = queue.clone();
        self.link("inspect_on", move |outcome, done: Completion<A>, _: &Nested<A>| {
            if outcome.result.is_err() {
                return inspect_step(outcome, done, f);
            }
            run_on(&queue, done, move |done| inspect_step(outcome, done, f));
        })
    }

    /// Observes the chain's failure.
    ///
    /// `handler` runs once if the chain fails, unless a `catch` further up already observed the
    /// error. The chain still resolves to that error: catching observes, it never recovers.
    #[track_caller]
    pub fn catch<F>(self, handler: F) -> Task<A>
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.link("catch", move |outcome, done: Completion<A>, _: &Nested<A>| {
            catch_step(outcome, done, handler);
        })
    }

    /// Like [`catch`][Self::catch], but `handler` runs on `queue`.
    #[track_caller]
    pub fn catch_on<F>(self, queue: &Scheduler, handler: F) -> Task<A>
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        let queue = queue.clone();
        self.link("catch_on", move |outcome, done: Completion<A>, _: &Nested<A>| {
            if outcome.caught || outcome.result.is_ok() {
                return done.settle(outcome);
            }
            run_on(&queue, done, move |done| catch_step(outcome, done, handler));
        })
    }
}
