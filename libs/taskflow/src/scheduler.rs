// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution queues.
//!
//! A [`Scheduler`] is a FIFO run queue drained by a fixed number of worker threads. A serial
//! queue has exactly one worker so its jobs never overlap, a `current_thread` queue has none and
//! only makes progress while some thread drives it through [`Scheduler::tick`],
//! [`Scheduler::run_until_idle`] or [`Scheduler::block_on`].

mod strand;

use crate::error::{Closed, Error};
use crate::loom::lock;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Arc, Condvar, Mutex, MutexGuard};
use crate::task::{Signal, Task, TaskResult};
use core::cell::Cell;
use core::fmt;
use core::num::NonZeroUsize;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::PoisonError;
use std::thread;

pub(crate) use strand::Strand;

/// Environment variable overriding the default number of worker threads.
pub const WORKERS_ENV: &str = "TASKFLOW_WORKERS";

const DEFAULT_TICK_SIZE: usize = 256;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

lazy_static::lazy_static! {
    static ref GLOBAL: Scheduler = Scheduler::builder().name("taskflow-global").build();
}

std::thread_local! {
    /// The id of the scheduler whose jobs the current thread is running, `0` if none.
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// A handle to an execution queue.
///
/// Cloning a `Scheduler` yields another handle to the same queue. The worker threads are
/// stopped once the last handle is dropped, jobs still sitting in the queue at that point are
/// drained first.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<Handle>,
}

struct Handle {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct Shared {
    id: usize,
    name: String,
    run_queue: Mutex<VecDeque<Job>>,
    /// Workers park here while the run queue is empty.
    work: Condvar,
    /// Threads blocked in [`Scheduler::block_on`] park here.
    idle: Condvar,
    stop: AtomicBool,
    num_workers: usize,
    tick_size: usize,
}

/// The result of a single scheduler tick.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Tick {
    /// The number of jobs that ran during this tick.
    pub ran: usize,
    /// Whether the run queue still holds jobs after this tick.
    pub has_remaining: bool,
}

/// Configures and builds a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Builder {
    name: String,
    workers: Option<usize>,
    tick_size: usize,
}

static_assertions::assert_impl_all!(Scheduler: Send, Sync, Clone);

// === impl Scheduler ===

impl Scheduler {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Returns the default scheduler, a concurrent queue shared by the whole process.
    ///
    /// Tasks that never had a queue assigned through [`Task::on`] run here.
    ///
    /// # Panics
    ///
    /// Panics the first time it is called if the worker threads cannot be spawned.
    pub fn global() -> &'static Scheduler {
        &GLOBAL
    }

    /// Creates a serial queue: jobs run one at a time, in submission order, on a single
    /// dedicated worker thread.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn serial(name: impl Into<String>) -> Self {
        Builder::new().name(name).workers(1).build()
    }

    /// Creates a queue without any worker threads. Jobs run on whichever thread drives the
    /// queue through [`tick`][Self::tick], [`run_until_idle`][Self::run_until_idle] or
    /// [`block_on`][Self::block_on].
    pub fn current_thread(name: impl Into<String>) -> Self {
        Self::from_shared(Shared::new(name.into(), 0, DEFAULT_TICK_SIZE), Vec::new())
    }

    fn from_shared(shared: Arc<Shared>, workers: Vec<thread::JoinHandle<()>>) -> Self {
        Self {
            handle: Arc::new(Handle {
                shared,
                workers: Mutex::new(workers),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.shared.name
    }

    pub fn num_workers(&self) -> usize {
        self.handle.shared.num_workers
    }

    /// Returns `true` if the calling thread is currently running a job of this queue.
    pub fn is_current(&self) -> bool {
        CURRENT.get() == self.handle.shared.id
    }

    /// Returns `true` once [`stop`][Self::stop] has been called.
    pub fn is_closed(&self) -> bool {
        self.handle.shared.stop.load(Ordering::Acquire)
    }

    /// Submits a job to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the queue has been stopped.
    pub fn spawn<F>(&self, job: F) -> Result<(), Closed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.shared.push(Box::new(job))
    }

    /// Stops the queue.
    ///
    /// Subsequent submissions fail with [`Closed`], tasks assigned to this queue resolve with
    /// [`Error::Closed`] when executed. Jobs already in the queue still run.
    pub fn stop(&self) {
        self.handle.shared.stop();
    }

    /// Runs at most one batch of queued jobs on the calling thread.
    pub fn tick(&self) -> Tick {
        let shared = &self.handle.shared;
        let _enter = Enter::new(shared.id);
        let tick = shared.tick();
        tracing::trace!(queue = %shared.name, ?tick, "scheduler tick");
        tick
    }

    /// Runs queued jobs on the calling thread until the queue is empty.
    ///
    /// Returns the number of jobs that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let tick = self.tick();
            ran += tick.ran;
            if !tick.has_remaining {
                break ran;
            }
        }
    }

    /// Executes `task` and blocks the calling thread until it resolves.
    ///
    /// On a queue without worker threads the calling thread drives the queue while it waits,
    /// which makes this the way to run tasks assigned to a `current_thread` queue. Returns
    /// [`Error::Cancelled`] if the task is cancelled while waiting.
    #[track_caller]
    pub fn block_on<T>(&self, task: Task<T>) -> TaskResult<T>
    where
        T: Send + 'static,
    {
        let shared = &self.handle.shared;
        let _span = tracing::debug_span!("scheduler block_on", queue = %shared.name).entered();

        let slot = Arc::new(Mutex::new(None));
        task.subscribe(None, {
            let slot = slot.clone();
            let shared = shared.clone();
            Box::new(move |_, signal| {
                let result = match signal {
                    Signal::Settled(outcome) => outcome.result,
                    Signal::Cancelled => Err(Error::Cancelled),
                };
                *lock(&slot) = Some(result);
                shared.notify_idle();
            })
        });

        loop {
            if let Some(result) = lock(&slot).take() {
                return result;
            }

            // only drive queues nobody else drives, stealing jobs from a serial queue's
            // worker would break its ordering guarantee
            if shared.num_workers == 0 && self.tick().ran > 0 {
                continue;
            }

            let run_queue = lock(&shared.run_queue);
            if lock(&slot).is_some() || (shared.num_workers == 0 && !run_queue.is_empty()) {
                continue;
            }
            tracing::trace!("going to sleep");
            drop(wait(&shared.idle, run_queue));
            tracing::trace!("woke up");
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.handle.shared;
        f.debug_struct("Scheduler")
            .field("name", &shared.name)
            .field("num_workers", &shared.num_workers)
            .field("stopped", &shared.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Handle ===

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.stop();

        // a worker dropping the last handle to its own queue cannot join itself
        if CURRENT.get() == self.shared.id {
            return;
        }

        let workers = core::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(queue = %self.shared.name, "worker thread panicked");
            }
        }
    }
}

// === impl Shared ===

impl Shared {
    fn new(name: String, num_workers: usize, tick_size: usize) -> Arc<Self> {
        static NEXT_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            run_queue: Mutex::new(VecDeque::new()),
            work: Condvar::new(),
            idle: Condvar::new(),
            stop: AtomicBool::new(false),
            num_workers,
            tick_size,
        })
    }

    fn push(&self, job: Job) -> Result<(), Closed> {
        let mut run_queue = lock(&self.run_queue);
        // checked under the lock so no job slips in after `stop` returned
        if self.stop.load(Ordering::Acquire) {
            return Err(Closed(()));
        }
        run_queue.push_back(job);
        drop(run_queue);

        if self.num_workers == 0 {
            self.idle.notify_all();
        } else {
            self.work.notify_one();
        }
        Ok(())
    }

    fn stop(&self) {
        let run_queue = lock(&self.run_queue);
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!(queue = %self.name, "stopping scheduler");
        }
        drop(run_queue);
        self.work.notify_all();
        self.idle.notify_all();
    }

    fn notify_idle(&self) {
        let _run_queue = lock(&self.run_queue);
        self.idle.notify_all();
    }

    fn tick(&self) -> Tick {
        let mut ran = 0;
        while ran < self.tick_size {
            let job = lock(&self.run_queue).pop_front();
            let Some(job) = job else {
                return Tick {
                    ran,
                    has_remaining: false,
                };
            };

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(queue = %self.name, "job panicked");
            }
            ran += 1;
        }

        Tick {
            ran,
            has_remaining: !lock(&self.run_queue).is_empty(),
        }
    }

    fn run_worker(&self, worker: usize) {
        let _span =
            tracing::debug_span!("worker main loop", queue = %self.name, worker).entered();
        CURRENT.set(self.id);

        loop {
            // drive the scheduling loop until we're out of work
            let tick = self.tick();
            tracing::trace!(worker, ?tick, "worker tick");
            if tick.ran > 0 || tick.has_remaining {
                continue;
            }

            let run_queue = lock(&self.run_queue);
            if !run_queue.is_empty() {
                continue;
            }

            // check whether the scheduler signalled us to stop
            if self.stop.load(Ordering::Acquire) {
                tracing::debug!(worker, "stop signal received, shutting down");
                break;
            }

            tracing::trace!("going to sleep");
            drop(wait(&self.work, run_queue));
            tracing::trace!("woke up");
        }

        CURRENT.set(0);
    }
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Marks the calling thread as running jobs of a scheduler for as long as it is alive.
struct Enter {
    prev: usize,
}

impl Enter {
    fn new(id: usize) -> Self {
        Self {
            prev: CURRENT.replace(id),
        }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.set(self.prev);
    }
}

// === impl Builder ===

impl Builder {
    pub fn new() -> Self {
        Self {
            name: String::from("taskflow"),
            workers: None,
            tick_size: DEFAULT_TICK_SIZE,
        }
    }

    /// Override the queue name, worker threads are named `{name}-{index}`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the number of worker threads.
    ///
    /// By default this is read from the `TASKFLOW_WORKERS` environment variable, falling back to
    /// the available parallelism of the machine.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Override the maximum number of jobs run per tick before checking for other work.
    #[must_use]
    pub fn tick_size(mut self, tick_size: NonZeroUsize) -> Self {
        self.tick_size = tick_size.get();
        self
    }

    /// Builds the scheduler, spawning its worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned. Already spawned workers are
    /// stopped again.
    pub fn try_build(self) -> std::io::Result<Scheduler> {
        let num_workers = self.workers.unwrap_or_else(default_workers);
        let shared = Shared::new(self.name, num_workers, self.tick_size);

        let mut workers = Vec::with_capacity(num_workers);
        for worker in 0..num_workers {
            let spawned = thread::Builder::new()
                .name(format!("{}-{worker}", shared.name))
                .spawn({
                    let shared = shared.clone();
                    move || shared.run_worker(worker)
                });

            match spawned {
                Ok(join) => workers.push(join),
                Err(err) => {
                    // dropping the partial scheduler joins the workers spawned so far
                    drop(Scheduler::from_shared(shared, workers));
                    return Err(err);
                }
            }
        }

        tracing::debug!(queue = %shared.name, num_workers, "scheduler started");
        Ok(Scheduler::from_shared(shared, workers))
    }

    /// Builds the scheduler, spawning its worker threads.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned, see [`try_build`][Self::try_build].
    pub fn build(self) -> Scheduler {
        match self.try_build() {
            Ok(scheduler) => scheduler,
            Err(err) => panic!("failed to spawn scheduler worker thread: {err}"),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_workers() -> usize {
    std::env::var(WORKERS_ENV)
        .ok()
        .and_then(|workers| workers.trim().parse::<usize>().ok())
        .filter(|workers| *workers > 0)
        .or_else(|| thread::available_parallelism().ok().map(NonZeroUsize::get))
        .unwrap_or(1)
}
