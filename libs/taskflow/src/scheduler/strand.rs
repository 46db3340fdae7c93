// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::lock;
use crate::loom::sync::Mutex;
use crate::scheduler::Job;
use std::collections::VecDeque;

/// Serializes the bookkeeping steps of a chain.
///
/// Jobs dispatched to a strand never overlap and run in dispatch order. A strand owns no thread:
/// whichever thread finds it idle drains it, jobs dispatched while it is busy are picked up by
/// that same thread before it lets go.
pub(crate) struct Strand {
    state: Mutex<State>,
}

struct State {
    queue: VecDeque<Job>,
    running: bool,
}

impl Strand {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: false,
            }),
        }
    }

    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(job);
        self.drain();
    }

    /// Queues `job` without running it, it runs on the next [`drain`][Self::drain].
    pub(crate) fn push<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.state).queue.push_back(Box::new(job));
    }

    /// Runs queued jobs until the queue is empty. Returns right away if another call is already
    /// draining the strand, that call picks up everything queued in the meantime.
    pub(crate) fn drain(&self) {
        {
            let mut state = lock(&self.state);
            if state.running || state.queue.is_empty() {
                return;
            }
            state.running = true;
        }

        let _guard = Running(self);
        loop {
            let job = {
                let mut state = lock(&self.state);
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            job();
        }
    }
}

/// Releases the strand if a job unwinds, so later dispatches are not stuck behind it.
struct Running<'a>(&'a Strand);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.0.state).running = false;
        }
    }
}
