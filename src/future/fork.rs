use crate::context::{self, Action};
use crate::errors::{Error, ExceptionBeforeJoin};
use crate::future::build_child;
use crate::task::ret::IntoRet;
use crate::task::{Tag, TaskHandle, layout};
use std::panic::{panic_any, resume_unwind};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Spawn `task` as a stealable child writing its result through `ret`.
///
/// Awaiting the returned [`Fork`] suspends the current task, publishes its
/// continuation for stealing, and symmetric-transfers to the child. The
/// child's result (and `ret`'s referent) may only be used after the scope's
/// [`join`](crate::join).
///
/// The awaitable must be awaited immediately; constructing several forks
/// before awaiting the first breaks the stack's LIFO discipline.
///
/// The child (and everything it captures) may execute on any worker thread
/// of the pool. The `Send` requirement is enforced at the pool boundary
/// (`schedule`); in-task spawns cannot repeat the bound without forbidding
/// recursive forks, so captures must not smuggle thread-affine data.
pub fn fork<R, T, F>(ret: T, task: F) -> Fork
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    Fork {
        child: Some(build_child(ret, task, Tag::Fork)),
    }
}

/// `fork` that additionally reports whether the child completed
/// synchronously, with the eager rethrow discipline.
pub fn fork_sync<R, T, F>(ret: T, task: F) -> SyncFork
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    SyncFork {
        child: Some(build_child(ret, task, Tag::Fork)),
        steals_pre: context::current_frame_ref().load_steals(),
        outside: false,
    }
}

/// [`fork_sync`] for use outside a fork-join scope (no prior forks in the
/// current scope): the rethrow never needs the substitute error.
pub fn fork_sync_outside<R, T, F>(ret: T, task: F) -> SyncFork
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    let steals_pre = context::current_frame_ref().load_steals();
    debug_assert_eq!(steals_pre, 0, "fork_sync_outside inside a fork-join scope");
    SyncFork {
        child: Some(build_child(ret, task, Tag::Fork)),
        steals_pre,
        outside: true,
    }
}

/// Awaitable produced by [`fork`].
#[must_use = "a fork does nothing until awaited; await it immediately"]
pub struct Fork {
    child: Option<TaskHandle>,
}

impl Future for Fork {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.child.take() {
            Some(child) => {
                context::with_worker(|ctx| ctx.set_action(Action::Fork(child)));
                Poll::Pending
            }
            None => {
                rethrow_fork_oom();
                Poll::Ready(())
            }
        }
    }
}

impl Drop for Fork {
    fn drop(&mut self) {
        drop_unawaited(&mut self.child);
    }
}

/// Awaitable produced by [`fork_sync`]/[`fork_sync_outside`].
///
/// Resolves to `Ok(true)` if the child completed synchronously, `Ok(false)`
/// if its continuation was stolen, and `Err(ExceptionBeforeJoin)` when a
/// synchronously completed sibling panicked but the payload cannot be
/// inspected yet (steals happened); `join` then re-raises the real payload.
#[must_use = "a fork does nothing until awaited; await it immediately"]
pub struct SyncFork {
    child: Option<TaskHandle>,
    steals_pre: u16,
    outside: bool,
}

impl Future for SyncFork {
    type Output = Result<bool, ExceptionBeforeJoin>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(child) = this.child.take() {
            context::with_worker(|ctx| ctx.set_action(Action::Fork(child)));
            return Poll::Pending;
        }

        rethrow_fork_oom();

        let frame = context::current_frame_ref();
        let steals_post = frame.load_steals();

        if steals_post != this.steals_pre {
            // Someone stole the continuation; the child is asynchronous.
            return Poll::Ready(Ok(false));
        }

        // The child completed synchronously, but its value is only safe to
        // consume if no sibling panic is (or may still be) in flight.
        if this.outside || steals_post == 0 {
            if let Some(payload) = frame.take_exception() {
                resume_unwind(payload);
            }
        } else if frame.has_exception() {
            return Poll::Ready(Err(ExceptionBeforeJoin));
        }
        Poll::Ready(Ok(true))
    }
}

impl Drop for SyncFork {
    fn drop(&mut self) {
        drop_unawaited(&mut self.child);
    }
}

/// A constructed-but-never-awaited child is destroyed in place; it has not
/// started and nothing else references it.
fn drop_unawaited(child: &mut Option<TaskHandle>) {
    if let Some(child) = child.take() {
        // Safety: unpublished child, still the top allocation.
        unsafe { layout::destroy_frame(child) };
    }
}

/// Re-raise a deferred fork-push allocation failure in the parent.
fn rethrow_fork_oom() {
    if context::with_worker(|ctx| ctx.take_fork_oom()) {
        panic_any(Error::OutOfMemory);
    }
}
