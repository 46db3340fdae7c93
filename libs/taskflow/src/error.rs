// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The reason a task resolved to `Err`.
///
/// Cancellation is normally *not* reported through this type: a cancelled task simply never
/// invokes its completion callback. Only the bridges that must produce a value no matter what
/// ([`Task::wait`][crate::Task::wait], [`JoinHandle`][crate::JoinHandle] and
/// [`Scheduler::block_on`][crate::Scheduler::block_on]) surface [`Error::Cancelled`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The unit of work never overrode [`Work::execute`][crate::Work::execute].
    NotImplemented,
    /// The unit of work dropped its completion handle without reporting a result.
    NoResult,
    /// A transform step failed to convert a value.
    Decoding(anyhow::Error),
    /// The task was cancelled before it produced a result.
    Cancelled,
    /// The unit of work panicked while holding its completion handle.
    Panicked,
    /// The queue the task (or one of its steps) was assigned to has been stopped.
    Closed,
    /// An error raised by the wrapped unit of work or by a chain step.
    User(anyhow::Error),
}

impl Error {
    /// Wraps an arbitrary error raised by user code.
    pub fn user<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::User(err.into())
    }

    /// Wraps an error raised while converting a value.
    pub fn decoding<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Decoding(err.into())
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Attempts to downcast the wrapped user or decoding error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::User(err) | Self::Decoding(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotImplemented => f.write_str("task execution is not implemented"),
            Error::NoResult => f.write_str("task finished without producing a result"),
            Error::Decoding(err) => write!(f, "failed to decode task result: {err}"),
            Error::Cancelled => f.write_str("task was cancelled"),
            Error::Panicked => f.write_str("task panicked"),
            Error::Closed => f.write_str("task queue was closed"),
            Error::User(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::User(err) | Error::Decoding(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // steps that bubble up one of our own errors through `?` keep its kind
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Self::User(err),
        }
    }
}

impl From<Closed> for Error {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

/// Returned when submitting work to a [`Scheduler`][crate::Scheduler] that has been stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

/// Returned by [`Registry::execute`][crate::Registry::execute] when a keyed task is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecuteError {
    /// The task was submitted with an empty dedup key.
    EmptyKey,
    /// The registry has been torn down.
    Closed,
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::EmptyKey => f.write_str("keyed task has an empty key"),
            ExecuteError::Closed => f.write_str("registry was closed"),
        }
    }
}

impl core::error::Error for ExecuteError {}

impl From<Closed> for ExecuteError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl core::error::Error for Boom {}

    #[test]
    fn anyhow_roundtrip_keeps_kind() {
        let err = Error::from(anyhow::Error::new(Error::NoResult));
        assert!(matches!(err, Error::NoResult));

        let err = Error::from(anyhow::Error::new(Boom));
        assert!(err.is_user());
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn decoding_exposes_source() {
        let err = Error::decoding(Boom);
        assert!(core::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "failed to decode task result: boom");
    }
}
