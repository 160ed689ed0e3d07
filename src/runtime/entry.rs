//! The root entry: bridging a non-worker caller to the pool.
//!
//! `schedule` builds a root task on a transient stack, releases the stack
//! chain into the task's submission node, and delivers it to the scheduler;
//! the caller gets back a [`Future`] whose `get` blocks on a binary
//! semaphore signaled at the root's terminal suspension.

use crate::context;
use crate::errors::Error;
use crate::runtime::Scheduler;
use crate::task::frame::{Payload, Tag};
use crate::task::layout;
use crate::task::ret::RetSlot;
use crate::utils::Semaphore;
use std::cell::UnsafeCell;
use std::panic::resume_unwind;
use std::sync::Arc;

/// Shared state between a root frame and the [`Future`] watching it.
struct RootState<R> {
    sem: Semaphore,
    cell: UnsafeCell<RootCell<R>>,
}

enum RootCell<R> {
    Empty,
    Value(R),
    Panicked(Payload),
}

// Safety: the cell is written by the completing worker before the semaphore
// release and read by the getter after the acquire.
unsafe impl<R: Send> Send for RootState<R> {}
unsafe impl<R: Send> Sync for RootState<R> {}

impl<R> RootState<R> {
    fn new() -> Self {
        Self {
            sem: Semaphore::new(),
            cell: UnsafeCell::new(RootCell::Empty),
        }
    }
}

/// The root's return receptacle: value-or-panic into the shared cell, then
/// signal. A root always stashes its panics here, so an uncaught panic in a
/// root re-raises from `get`, never on a worker.
struct RootRet<R>(Arc<RootState<R>>);

impl<R: Send> RetSlot<R> for RootRet<R> {
    unsafe fn write(&mut self, value: R) {
        // Safety: sole writer until the semaphore is released.
        unsafe { *self.0.cell.get() = RootCell::Value(value) };
        self.0.sem.release();
    }

    fn stash(&mut self, payload: Payload) -> Result<(), Payload> {
        unsafe { *self.0.cell.get() = RootCell::Panicked(payload) };
        self.0.sem.release();
        Ok(())
    }
}

/// Handle to a scheduled root task.
///
/// Dropping it detaches the task (which still runs to completion before the
/// pool shuts down).
pub struct Future<R> {
    state: Option<Arc<RootState<R>>>,
    taken: bool,
}

impl<R: Send> Future<R> {
    /// Block until the root completes and take its result.
    ///
    /// Re-raises the root's panic, if it panicked. Errors: `BrokenFuture`
    /// if this future never had shared state (`Future::default()`),
    /// `EmptyFuture` if the result was already taken.
    pub fn get(&mut self) -> Result<R, Error> {
        let Some(state) = self.state.take() else {
            return Err(if self.taken {
                Error::EmptyFuture
            } else {
                Error::BrokenFuture
            });
        };
        self.taken = true;

        state.sem.acquire();
        // Safety: the semaphore ordered the worker's write before us, and
        // taking `state` out makes us the only reader.
        let cell = unsafe { &mut *state.cell.get() };
        match std::mem::replace(cell, RootCell::Empty) {
            RootCell::Value(value) => Ok(value),
            RootCell::Panicked(payload) => resume_unwind(payload),
            RootCell::Empty => unreachable!("root signaled without a result"),
        }
    }
}

impl<R> Default for Future<R> {
    /// A future with no shared state; `get` reports `BrokenFuture`.
    fn default() -> Self {
        Self {
            state: None,
            taken: false,
        }
    }
}

/// Schedule `task` as a root on `sch` from a non-worker thread.
///
/// The root frame is built on a transient stack whose chain is released
/// into the submission; the receiving worker adopts it on resume.
pub fn schedule<S, F>(sch: &S, task: F) -> Result<Future<F::Output>, Error>
where
    S: Scheduler,
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    if context::is_worker() {
        // A worker blocking on a root future deadlocks the pool; workers
        // dispatch with fork/call instead.
        return Err(Error::ScheduleInWorker);
    }

    let state = Arc::new(RootState::new());

    let sub = context::with_transient_stack(|stack| {
        let handle = layout::allocate_frame(
            stack,
            task,
            RootRet(Arc::clone(&state)),
            None,
            Tag::Root,
        )?;

        // Float the chain the root lives on; the resuming worker adopts it.
        let _floating = stack.release();
        Ok::<_, Error>(layout::submit_handle(handle))
    })?;

    sch.schedule(sub);
    tracing::trace!("root scheduled");

    Ok(Future {
        state: Some(state),
        taken: false,
    })
}

/// Schedule `task` and block for its result.
pub fn sync_wait<S, F>(sch: &S, task: F) -> F::Output
where
    S: Scheduler,
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    schedule(sch, task)
        .expect("sync_wait: could not schedule")
        .get()
        .expect("sync_wait: future consumed")
}

/// Schedule `task` and discard the handle (fire-and-forget). The task still
/// completes before the pool's destructor returns.
pub fn detach<S, F>(sch: &S, task: F)
where
    S: Scheduler,
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    let _detached = schedule(sch, task).expect("detach: could not schedule");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_future_is_broken() {
        let mut fut: Future<u32> = Future::default();
        assert_eq!(fut.get().unwrap_err(), Error::BrokenFuture);
    }

    #[test]
    fn second_get_is_empty() {
        let state = Arc::new(RootState::new());
        let mut ret = RootRet(Arc::clone(&state));
        unsafe { ret.write(5u32) };

        let mut fut = Future {
            state: Some(state),
            taken: false,
        };
        assert_eq!(fut.get().unwrap(), 5);
        assert_eq!(fut.get().unwrap_err(), Error::EmptyFuture);
    }
}
