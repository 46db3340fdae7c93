mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskflow::{
    Completion, ExecuteError, Id, Observer, Registry, Scheduler, Task, TaskResult, registry,
};

use crate::common::{Event, Gated, Recorder, trace_init};

fn log() -> Arc<Mutex<Vec<Event>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn ready(value: u32) -> Task<u32> {
    Task::from_fn(move |done: Completion<u32>| done.succeed(value))
}

#[test]
fn observers_receive_events_in_registration_order() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let first = Recorder::new("first", &log);
    let second = Recorder::new("second", &log);
    let other = Recorder::new("other", &log);
    registry.add_observer(&first, "x");
    registry.add_observer(&second, "x");
    registry.add_observer(&other, "y");

    registry.execute(ready(9).keyed("x")).unwrap();
    queue.run_until_idle();

    assert_eq!(
        *log.lock().unwrap(),
        [
            Event::WillBegin("first", "x".into()),
            Event::WillBegin("second", "x".into()),
            Event::DidComplete("first", "x".into(), Ok(9)),
            Event::DidComplete("second", "x".into(), Ok(9)),
        ]
    );
    assert!(!registry.is_executing("x"));
}

#[test]
fn latest_request_wins() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);
    registry.add_observer(&recorder, "x");

    let a = Gated::new();
    let b = Gated::new();
    let task_a = a.task();
    let task_b = b.task();
    let id_b = task_b.id();

    registry.execute(task_a.clone().keyed("x")).unwrap();
    queue.run_until_idle();
    assert_eq!(a.started(), 1);

    registry.execute(task_b.keyed("x")).unwrap();
    assert_eq!(a.cancelled(), 1);
    assert!(task_a.is_cancelled());
    assert_eq!(registry.task_id("x"), Some(id_b));

    queue.run_until_idle();
    b.release(Ok(2));
    // reporting after being superseded goes nowhere
    a.release(Ok(1));

    assert_eq!(
        *log.lock().unwrap(),
        [
            Event::WillBegin("obs", "x".into()),
            Event::DidCancel("obs", "x".into()),
            Event::WillBegin("obs", "x".into()),
            Event::DidComplete("obs", "x".into(), Ok(2)),
        ]
    );
    assert_eq!(registry.task_id("x"), None);
}

#[test]
fn cancelling_before_start_notifies_once() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);
    registry.add_observer(&recorder, "x");

    let gated = Gated::new();
    registry.execute(gated.task().keyed("x")).unwrap();
    assert!(registry.is_executing("x"));

    assert!(registry.cancel("x"));
    assert!(!registry.cancel("x"));
    queue.run_until_idle();

    assert_eq!(gated.started(), 0);
    assert_eq!(*log.lock().unwrap(), [Event::DidCancel("obs", "x".into())]);
}

#[test]
fn failures_reach_observers() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);
    registry.add_observer(&recorder, "x");

    registry
        .execute(Task::failure(anyhow::anyhow!("offline")).keyed("x"))
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            Event::WillBegin("obs", "x".into()),
            Event::DidComplete("obs", "x".into(), Err("offline".into())),
        ]
    );
}

#[test]
fn observer_bookkeeping_is_idempotent() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);

    // removing an unregistered observer is a no-op
    registry.remove_observer(&recorder, "x");
    registry.add_observer(&recorder, "x");
    registry.add_observer(&recorder, "x");
    assert_eq!(registry.observer_count("x"), 1);

    registry.remove_observer(&recorder, "x");
    registry.remove_observer(&recorder, "x");
    assert_eq!(registry.observer_count("x"), 0);

    registry.add_observer(&recorder, "x");
    registry.remove_all_observers("x");
    registry.execute(ready(1).keyed("x")).unwrap();
    queue.run_until_idle();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn dropped_observers_are_skipped() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let kept = Recorder::new("kept", &log);
    let dropped = Recorder::new("dropped", &log);
    registry.add_observer(&dropped, "x");
    registry.add_observer(&kept, "x");
    drop(dropped);

    registry.execute(ready(1).keyed("x")).unwrap();
    queue.run_until_idle();

    assert_eq!(
        *log.lock().unwrap(),
        [
            Event::WillBegin("kept", "x".into()),
            Event::DidComplete("kept", "x".into(), Ok(1)),
        ]
    );
    assert_eq!(registry.observer_count("x"), 1);
}

#[test]
fn retain_mode_keeps_the_last_result() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = registry::Builder::new()
        .scheduler(&queue)
        .retain_results(true)
        .build();

    registry
        .execute(ready(4).keyed("x").with_update(4))
        .unwrap();
    assert_eq!(registry.pending_update("x").as_deref(), Some(&4));
    queue.run_until_idle();

    assert!(registry.did_finish("x"));
    assert!(!registry.is_executing("x"));
    assert!(registry.pending_update("x").is_none());
    let result = registry.result("x").unwrap();
    assert!(matches!(*result, Ok(4)));

    // a finished task can no longer be cancelled
    assert!(!registry.cancel("x"));

    assert!(registry.remove("x"));
    assert!(registry.result("x").is_none());
    assert!(!registry.did_finish("x"));
}

#[test]
fn execute_all_submits_every_task() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);
    registry.add_observer(&recorder, "a");
    registry.add_observer(&recorder, "b");

    registry
        .execute_all([ready(1).keyed("a"), ready(2).keyed("b")])
        .unwrap();
    queue.run_until_idle();

    let log = log.lock().unwrap();
    assert!(log.contains(&Event::DidComplete("obs", "a".into(), Ok(1))));
    assert!(log.contains(&Event::DidComplete("obs", "b".into(), Ok(2))));

    assert_eq!(
        registry.execute_all([ready(3).keyed("c"), ready(4).keyed("")]),
        Err(ExecuteError::EmptyKey)
    );
}

#[test]
fn teardown_cancels_silently() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let registry = Registry::new(&queue);
    let log = log();
    let recorder = Recorder::new("obs", &log);
    registry.add_observer(&recorder, "x");

    let gated = Gated::new();
    registry.execute(gated.task().keyed("x")).unwrap();
    queue.run_until_idle();
    log.lock().unwrap().clear();

    drop(registry);
    assert_eq!(gated.cancelled(), 1);

    gated.release(Ok(1));
    queue.run_until_idle();
    assert!(log.lock().unwrap().is_empty());
}

#[derive(Default)]
struct Tally {
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Tally {
    fn total(&self) -> usize {
        self.completed.load(Ordering::Acquire) + self.cancelled.load(Ordering::Acquire)
    }
}

impl Observer<u32> for Tally {
    fn did_complete(&self, _key: &str, _task: &Task<u32>, _result: &TaskResult<u32>) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn did_cancel(&self, _key: &str, _task: &Task<u32>) {
        self.cancelled.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn concurrent_submissions_each_get_one_terminal_event() {
    let _trace = trace_init();

    const THREADS: usize = 4;
    const TASKS: usize = 50;

    let queue = Scheduler::builder().name("pool").workers(4).build();
    let registry = Arc::new(Registry::new(&queue));
    let tally = Arc::new(Tally::default());
    registry.add_observer(&tally, "x");

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..TASKS {
                    let value = u32::try_from(i).unwrap();
                    registry.execute(ready(value).keyed("x")).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while tally.total() < THREADS * TASKS {
        assert!(Instant::now() < deadline, "missing terminal events");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(tally.total(), THREADS * TASKS);
    assert!(tally.completed.load(Ordering::Acquire) >= 1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Begin,
    Complete,
    Cancel,
}

#[derive(Default)]
struct Timeline {
    log: Mutex<Vec<(Step, Id)>>,
}

impl Observer<u32> for Timeline {
    fn will_begin(&self, _key: &str, task: &Task<u32>) {
        self.log.lock().unwrap().push((Step::Begin, task.id()));
    }

    fn did_complete(&self, _key: &str, task: &Task<u32>, _result: &TaskResult<u32>) {
        self.log.lock().unwrap().push((Step::Complete, task.id()));
    }

    fn did_cancel(&self, _key: &str, task: &Task<u32>) {
        self.log.lock().unwrap().push((Step::Cancel, task.id()));
    }
}

#[test]
fn racing_submissions_never_overlap() {
    let _trace = trace_init();

    for _ in 0..2000 {
        let registry = Registry::<u32>::default();
        let timeline = Arc::new(Timeline::default());
        registry.add_observer(&timeline, "x");

        let barrier = Barrier::new(2);
        thread::scope(|s| {
            for value in 0..2 {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    registry.execute(Task::success(value).keyed("x")).unwrap();
                });
            }
        });

        let log = timeline.log.lock().unwrap();
        let mut active: Option<Id> = None;
        let mut terminal = 0;
        for &(step, id) in log.iter() {
            match step {
                Step::Begin => {
                    assert!(active.is_none(), "two active tasks for one key: {log:?}");
                    active = Some(id);
                }
                Step::Complete | Step::Cancel => {
                    assert!(
                        active.is_none_or(|active| active == id),
                        "terminal event of a task that is not the active one: {log:?}"
                    );
                    active = None;
                    terminal += 1;
                }
            }
        }
        assert_eq!(terminal, 2, "{log:?}");
    }
}

/// Drops the registry it holds as soon as a task completes.
#[derive(Default)]
struct Teardown {
    registry: Mutex<Option<Registry<u32>>>,
}

impl Observer<u32> for Teardown {
    fn did_complete(&self, _key: &str, _task: &Task<u32>, _result: &TaskResult<u32>) {
        let registry = self.registry.lock().unwrap().take();
        drop(registry);
    }
}

#[test]
fn teardown_during_delivery_silences_remaining_observers() {
    let _trace = trace_init();

    let queue = Scheduler::current_thread("main");
    let log = log();
    let teardown = Arc::new(Teardown::default());
    let recorder = Recorder::new("obs", &log);

    let registry = Registry::new(&queue);
    registry.add_observer(&teardown, "x");
    registry.add_observer(&recorder, "x");
    registry.execute(ready(1).keyed("x")).unwrap();
    *teardown.registry.lock().unwrap() = Some(registry);

    queue.run_until_idle();

    assert!(teardown.registry.lock().unwrap().is_none());
    assert_eq!(*log.lock().unwrap(), [Event::WillBegin("obs", "x".into())]);
}

#[test]
fn observers_may_resubmit_from_did_cancel() {
    let _trace = trace_init();

    struct Retry {
        registry: Arc<Registry<u32>>,
        retried: AtomicUsize,
    }

    impl Observer<u32> for Retry {
        fn did_complete(&self, _key: &str, _task: &Task<u32>, _result: &TaskResult<u32>) {}

        fn did_cancel(&self, key: &str, _task: &Task<u32>) {
            if self.retried.fetch_add(1, Ordering::Relaxed) == 0 {
                self.registry.execute(ready(3).keyed(key)).unwrap();
            }
        }
    }

    let queue = Scheduler::current_thread("main");
    let registry = Arc::new(Registry::new(&queue));
    let retry = Arc::new(Retry {
        registry: registry.clone(),
        retried: AtomicUsize::new(0),
    });
    registry.add_observer(&retry, "x");

    let gated = Gated::new();
    registry.execute(gated.task().keyed("x")).unwrap();
    registry.execute(ready(2).keyed("x")).unwrap();

    // the resubmission from `did_cancel` superseded the second task in turn
    assert_eq!(retry.retried.load(Ordering::Relaxed), 2);
    queue.run_until_idle();
    assert!(!registry.is_executing("x"));
}
