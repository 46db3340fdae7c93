#![allow(unused, reason = "not used by all tests")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use taskflow::{Completion, Observer, Task, TaskResult, Work};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub fn trace_init() -> impl Sized {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

/// A unit of work that parks its completion until the test releases it, counting how often it
/// was started and cancelled.
#[derive(Clone, Default)]
pub struct Gated {
    inner: Arc<GatedInner>,
}

#[derive(Default)]
struct GatedInner {
    done: Mutex<Option<Completion<u32>>>,
    started: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Gated {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self) -> Task<u32> {
        Task::new(self.clone())
    }

    pub fn release(&self, result: TaskResult<u32>) {
        let done = self.inner.done.lock().unwrap().take();
        done.expect("gated work was never started").complete(result);
    }

    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> usize {
        self.inner.cancelled.load(Ordering::Relaxed)
    }
}

impl Work<u32> for Gated {
    fn execute(&self, done: Completion<u32>) {
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        *self.inner.done.lock().unwrap() = Some(done);
    }

    fn cancel(&self) {
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WillBegin(&'static str, String),
    DidComplete(&'static str, String, Result<u32, String>),
    DidCancel(&'static str, String),
}

/// Records every notification it receives into a log shared with other recorders, so tests can
/// assert on the interleaving across observers.
pub struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new(name: &'static str, log: &Arc<Mutex<Vec<Event>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: log.clone(),
        })
    }
}

impl Observer<u32> for Recorder {
    fn will_begin(&self, key: &str, _task: &Task<u32>) {
        self.log
            .lock()
            .unwrap()
            .push(Event::WillBegin(self.name, key.to_owned()));
    }

    fn did_complete(&self, key: &str, _task: &Task<u32>, result: &TaskResult<u32>) {
        let result = result.as_ref().copied().map_err(ToString::to_string);
        self.log
            .lock()
            .unwrap()
            .push(Event::DidComplete(self.name, key.to_owned(), result));
    }

    fn did_cancel(&self, key: &str, _task: &Task<u32>) {
        self.log
            .lock()
            .unwrap()
            .push(Event::DidCancel(self.name, key.to_owned()));
    }
}
