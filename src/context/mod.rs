//! Thread-local anchors: the current worker's stack and context.
//!
//! Two anchors, with a lifecycle tied to [`worker_init`]/[`finalize`]. Worker
//! threads install both for the lifetime of their loop. Non-worker entry
//! points install a transient stack for the duration of root construction
//! and tear it down on the same thread.

use crate::stack::Stack;
use crate::task::Frame;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;

// Public API
pub(crate) mod worker;
pub use worker::WorkerContext;
pub(crate) use worker::{Action, SchedShim};

thread_local! {
    static STACK: RefCell<Option<Stack>> = const { RefCell::new(None) };
    static WORKER: Cell<Option<NonNull<WorkerContext>>> = const { Cell::new(None) };
}

/// Establish this thread as a worker: installs the thread-local stack and
/// context. `notify` is invoked whenever an external producer submits to
/// this worker.
///
/// The returned context must be kept alive (and [`finalize`]d on this same
/// thread) by the caller; pools hold one per worker for their lifetime.
#[track_caller]
pub fn worker_init<N>(notify: N) -> Arc<WorkerContext>
where
    N: Fn() + Send + Sync + 'static,
{
    let ctx = Arc::new(WorkerContext::new(Box::new(notify)));

    STACK.with(|slot| {
        let prev = slot.borrow_mut().replace(Stack::new());
        assert!(prev.is_none(), "worker_init called twice on this thread");
    });
    WORKER.with(|slot| slot.set(Some(NonNull::from(ctx.as_ref()))));

    ctx
}

/// Dual of [`worker_init`]: drops the thread-local stack and unhooks the
/// context. Must run on the thread that called `worker_init`.
#[track_caller]
pub fn finalize(ctx: &Arc<WorkerContext>) {
    WORKER.with(|slot| slot.set(None));
    STACK.with(|slot| {
        let stack = slot.borrow_mut().take();
        assert!(stack.is_some(), "finalize on a thread without worker_init");
        drop(stack);
    });
    ctx.clear_neighbors();
}

pub(crate) fn is_worker() -> bool {
    WORKER.with(|slot| slot.get().is_some())
}

/// Run `f` with the current worker context.
#[track_caller]
pub(crate) fn with_worker<F, R>(f: F) -> R
where
    F: FnOnce(&WorkerContext) -> R,
{
    let ptr = WORKER
        .with(|slot| slot.get())
        .expect("not on a worker thread");
    // Safety: the pool keeps the context alive for the thread's lifetime and
    // finalize clears the anchor before it drops.
    f(unsafe { ptr.as_ref() })
}

/// Run `f` with the current thread's stack. Panics off-worker unless a
/// transient stack is installed.
#[track_caller]
pub(crate) fn with_stack<F, R>(f: F) -> R
where
    F: FnOnce(&mut Stack) -> R,
{
    STACK.with(|slot| {
        let mut borrow = slot.borrow_mut();
        f(borrow.as_mut().expect("no stack installed on this thread"))
    })
}

/// The frame currently executing on this worker.
#[track_caller]
pub(crate) fn current_frame() -> NonNull<Frame> {
    with_worker(|ctx| ctx.current()).expect("not inside a running task")
}

/// Reference form of [`current_frame`]. The unbound lifetime is internal:
/// the frame outlives the poll that is asking.
#[track_caller]
pub(crate) fn current_frame_ref<'a>() -> &'a Frame {
    // Safety: the resume shim set this pointer before polling; the frame is
    // live for the whole poll.
    unsafe { current_frame().as_ref() }
}

/// Install a stack just long enough to build a root task on a non-worker
/// thread, and tear it down again.
pub(crate) fn with_transient_stack<F, R>(f: F) -> R
where
    F: FnOnce(&mut Stack) -> R,
{
    STACK.with(|slot| {
        {
            let mut borrow = slot.borrow_mut();
            debug_assert!(borrow.is_none(), "transient stack over an installed one");
            *borrow = Some(Stack::new());
        }
        let result = f(slot.borrow_mut().as_mut().expect("just installed"));
        slot.borrow_mut().take();
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_anchors_lifecycle() {
        assert!(!is_worker());

        let ctx = worker_init(|| {});
        assert!(is_worker());
        with_stack(|stack| assert!(stack.is_unused()));

        finalize(&ctx);
        assert!(!is_worker());
    }

    #[test]
    fn transient_stack_tears_down() {
        with_transient_stack(|stack| {
            let ptr = stack.allocate(64).unwrap();
            unsafe { stack.deallocate(ptr) };
        });
        // Gone again: with_stack must panic.
        assert!(std::panic::catch_unwind(|| with_stack(|_| ())).is_err());
    }
}
