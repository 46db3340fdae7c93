// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Callback based task composition.
//!
//! A [`Task`] wraps a unit of deferred [`Work`] into a cancellable value that can be composed
//! with chain combinators ([`then`][Task::then], [`map`][Task::map], [`catch`][Task::catch]...),
//! run on a [`Scheduler`], and deduplicated by key through a [`Registry`] that notifies
//! [`Observer`]s about every lifecycle event.
//!
//! ```
//! use taskflow::Task;
//!
//! let res = Task::success(5)
//!     .map(|x| x * 2)
//!     .then(|x| Task::success(x + 1))
//!     .wait();
//!
//! assert_eq!(res.unwrap(), 11);
//! ```

mod chain;
pub mod error;
mod loom;
pub mod registry;
pub mod scheduler;
pub mod task;
#[cfg(test)]
mod test_util;

pub use error::{Closed, Error, ExecuteError};
pub use registry::{KeyedTask, Observer, Registry};
pub use scheduler::Scheduler;
pub use task::{Completion, Id, JoinHandle, Lifecycle, Task, TaskResult, Work};
