use std::fmt;

/// Errors surfaced by the runtime core.
///
/// `OutOfMemory` doubles as a panic payload: it is raised with
/// `std::panic::panic_any` inside a task when a stacklet or deque buffer
/// cannot be allocated, so that the failure propagates through the regular
/// exception path (stash, join, rethrow).
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A stacklet or a deque buffer allocation failed.
    ///
    /// When raised at a fork push the child was never started and the parent
    /// resumes; the failure is recoverable by the parent's caller.
    #[error("allocation failed for a stacklet or deque buffer")]
    OutOfMemory,

    /// `Future::get` was called on a future with no shared state.
    #[error("future has no shared state")]
    BrokenFuture,

    /// `Future::get` was called more than once.
    #[error("future result was already taken")]
    EmptyFuture,

    /// `schedule` was called from within a worker thread.
    ///
    /// Workers must dispatch work with `fork`/`call`; blocking a worker on a
    /// root future would deadlock the pool.
    #[error("schedule called from a worker thread")]
    ScheduleInWorker,
}

/// Substitute error reported by the `sync`/`eager` awaitables when a sibling
/// panicked while the current task does not have exclusive ownership of its
/// frame (some children were stolen).
///
/// The real payload may still be in flight on another worker, so it cannot be
/// inspected yet. Await [`join`](crate::join) afterwards; the join point
/// re-raises the real payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionBeforeJoin;

impl fmt::Display for ExceptionBeforeJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sibling task panicked; await join() to observe the payload")
    }
}

impl std::error::Error for ExceptionBeforeJoin {}
