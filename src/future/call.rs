use crate::context::{self, Action};
use crate::errors::ExceptionBeforeJoin;
use crate::future::build_child;
use crate::task::ret::IntoRet;
use crate::task::{Tag, TaskHandle, layout};
use std::panic::resume_unwind;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Spawn `task` as a non-stealable child writing its result through `ret`.
///
/// Identical to [`fork`](crate::fork) except the parent's continuation is
/// not published: the child completes, then control returns here directly.
pub fn call<R, T, F>(ret: T, task: F) -> Call
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    Call {
        child: Some(build_child(ret, task, Tag::Call)),
    }
}

/// `call` that re-raises panics eagerly when that is safe.
pub fn call_eager<R, T, F>(ret: T, task: F) -> EagerCall
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    EagerCall {
        child: Some(build_child(ret, task, Tag::Call)),
        outside: false,
    }
}

/// [`call_eager`] for use outside a fork-join scope: with no steals possible
/// the real payload can always be re-raised directly.
pub fn call_eager_outside<R, T, F>(ret: T, task: F) -> EagerCall
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    debug_assert_eq!(
        context::current_frame_ref().load_steals(),
        0,
        "call_eager_outside inside a fork-join scope",
    );
    EagerCall {
        child: Some(build_child(ret, task, Tag::Call)),
        outside: true,
    }
}

/// Awaitable produced by [`call`].
#[must_use = "a call does nothing until awaited; await it immediately"]
pub struct Call {
    child: Option<TaskHandle>,
}

impl Future for Call {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.child.take() {
            Some(child) => {
                context::with_worker(|ctx| ctx.set_action(Action::Call(child)));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        drop_unawaited(&mut self.child);
    }
}

/// Awaitable produced by [`call_eager`]/[`call_eager_outside`].
///
/// Resolves to `Err(ExceptionBeforeJoin)` when a panic happened somewhere in
/// the scope but cannot be inspected yet; `join` then re-raises it.
#[must_use = "a call does nothing until awaited; await it immediately"]
pub struct EagerCall {
    child: Option<TaskHandle>,
    outside: bool,
}

impl Future for EagerCall {
    type Output = Result<(), ExceptionBeforeJoin>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(child) = this.child.take() {
            context::with_worker(|ctx| ctx.set_action(Action::Call(child)));
            return Poll::Pending;
        }

        let frame = context::current_frame_ref();
        let steals = frame.load_steals();
        if this.outside {
            debug_assert_eq!(steals, 0);
        }

        if steals == 0 {
            // Exclusive ownership: the real payload is safe to touch.
            if let Some(payload) = frame.take_exception() {
                resume_unwind(payload);
            }
            Poll::Ready(Ok(()))
        } else if frame.has_exception() {
            Poll::Ready(Err(ExceptionBeforeJoin))
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for EagerCall {
    fn drop(&mut self) {
        drop_unawaited(&mut self.child);
    }
}

fn drop_unawaited(child: &mut Option<TaskHandle>) {
    if let Some(child) = child.take() {
        // Safety: unpublished child, still the top allocation.
        unsafe { layout::destroy_frame(child) };
    }
}
