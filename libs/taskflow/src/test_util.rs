// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{Completion, TaskResult, Work};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a thread-local subscriber for the duration of a test.
pub fn trace_init() -> impl Sized {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

/// A unit of work that holds on to its completion until it is released by the test.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    done: Mutex<Option<Completion<u32>>>,
    cancelled: AtomicUsize,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self, result: TaskResult<u32>) {
        let done = self.inner.done.lock().unwrap().take();
        done.expect("gate was never started").complete(result);
    }

    pub fn cancelled(&self) -> usize {
        self.inner.cancelled.load(Ordering::Relaxed)
    }
}

impl Work<u32> for Gate {
    fn execute(&self, done: Completion<u32>) {
        *self.inner.done.lock().unwrap() = Some(done);
    }

    fn cancel(&self) {
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}
