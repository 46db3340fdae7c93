// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;

/// Task state. The task stores its state in an atomic `usize` with the following layout:
///
/// ```text
/// | 2         2 | 1       0 |
/// | submitted   | lifecycle |
/// ```
///
/// All transitions go through [`State::transition`] so a concurrent `cancel` and a concurrent
/// completion always observe each other: exactly one of them wins.
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// Where the task is in its lifecycle.
        pub(crate) const LIFECYCLE: Lifecycle;
        /// If set, `execute` (or one of its siblings) has been called on this task.
        pub(crate) const SUBMITTED: bool;
    }
}

/// The lifecycle of a [`Task`][crate::Task].
///
/// Transitions are monotonic: `Pending → Running → Finished`, with `Cancelled` reachable from
/// both `Pending` and `Running`. `Finished` and `Cancelled` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Lifecycle {
    /// The task has not started running yet.
    Pending = 0b00,
    /// The task's unit of work is executing.
    Running = 0b01,
    /// The task reported a result.
    Finished = 0b10,
    /// The task was cancelled before it reported a result.
    Cancelled = 0b11,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum SubmitAction {
    /// First submission, go ahead and schedule the task.
    Submit,
    /// The task was cancelled before it was ever submitted.
    Cancelled,
    /// The task has been submitted before, this is a contract violation.
    AlreadySubmitted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum StartAction {
    /// Successful transition to `Running`, it's okay to run the unit of work.
    Run,
    /// The task was cancelled while it sat in the queue.
    Cancelled,
    /// The task is already running or done, this shouldn't happen.
    DontRun,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum CompleteAction {
    /// The result should be delivered to the task's subscriber.
    Deliver,
    /// The task was cancelled (or has already completed), drop the result.
    Discard,
}

impl State {
    /// Returns a task's initial state.
    pub(super) fn new() -> State {
        State {
            val: AtomicUsize::new(Snapshot::new().with(Snapshot::LIFECYCLE, Lifecycle::Pending).0),
        }
    }

    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(super) fn lifecycle(&self) -> Lifecycle {
        self.load(Ordering::Acquire).get(Snapshot::LIFECYCLE)
    }

    pub(super) fn submit(&self) -> SubmitAction {
        self.transition(|s| {
            if s.get(Snapshot::SUBMITTED) {
                return SubmitAction::AlreadySubmitted;
            }
            s.set(Snapshot::SUBMITTED, true);

            if s.get(Snapshot::LIFECYCLE) == Lifecycle::Cancelled {
                SubmitAction::Cancelled
            } else {
                SubmitAction::Submit
            }
        })
    }

    /// Attempt to transition the task from `Pending` to `Running`.
    pub(super) fn start(&self) -> StartAction {
        self.transition(|s| match s.get(Snapshot::LIFECYCLE) {
            Lifecycle::Pending => {
                s.set(Snapshot::LIFECYCLE, Lifecycle::Running);
                StartAction::Run
            }
            Lifecycle::Cancelled => StartAction::Cancelled,
            Lifecycle::Running | Lifecycle::Finished => StartAction::DontRun,
        })
    }

    /// Attempt to transition the task from `Running` to `Finished`.
    pub(super) fn complete(&self) -> CompleteAction {
        self.transition(|s| match s.get(Snapshot::LIFECYCLE) {
            Lifecycle::Running => {
                s.set(Snapshot::LIFECYCLE, Lifecycle::Finished);
                CompleteAction::Deliver
            }
            Lifecycle::Pending => {
                debug_assert!(false, "a task cannot complete before it started running");
                CompleteAction::Discard
            }
            Lifecycle::Cancelled | Lifecycle::Finished => CompleteAction::Discard,
        })
    }

    /// Cancel the task.
    ///
    /// Returns `true` if the task was successfully cancelled, `false` if it already reached a
    /// terminal state.
    pub(super) fn cancel(&self) -> bool {
        self.transition(|s| match s.get(Snapshot::LIFECYCLE) {
            Lifecycle::Pending | Lifecycle::Running => {
                s.set(Snapshot::LIFECYCLE, Lifecycle::Cancelled);
                true
            }
            Lifecycle::Finished | Lifecycle::Cancelled => false,
        })
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            tracing::trace!("State::transition; current:\n{}", current);
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            tracing::trace!("State::transition; next:\n{}", next);
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

impl Lifecycle {
    /// Returns `true` for `Finished` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Finished | Lifecycle::Cancelled)
    }
}

impl mycelium_bitfield::FromBits<usize> for Lifecycle {
    type Error = core::convert::Infallible;

    /// The number of bits required to represent a value of this type.
    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Pending as usize => Ok(Self::Pending),
            b if b == Self::Running as usize => Ok(Self::Running),
            b if b == Self::Finished as usize => Ok(Self::Finished),
            b if b == Self::Cancelled as usize => Ok(Self::Cancelled),
            _ => {
                // this should never happen unless the bitpacking code is broken
                unreachable!("invalid task lifecycle {bits:#b}")
            }
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}
