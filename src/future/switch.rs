use crate::context::{self, Action, SchedShim};
use crate::queue::SubmitNode;
use crate::runtime::Scheduler;
use crate::task::SubmitHandle;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// Reschedule the current task onto `dest`.
///
/// The task suspends, its submission node is handed to `dest`, and the
/// current worker goes back to its loop (self-stealing any continuations the
/// departing task left behind). `dest` must outlive the rescheduled task.
pub fn resume_on<S: Scheduler>(dest: &S) -> Switch<'_, S> {
    Switch {
        dest,
        node: SubmitNode::new(),
        registered: false,
        _pin: PhantomPinned,
    }
}

/// Awaitable produced by [`resume_on`]. The submission node is embedded
/// here, inside the suspended frame, so rescheduling never allocates.
#[must_use = "a context switch does nothing until awaited"]
pub struct Switch<'a, S: Scheduler> {
    dest: &'a S,
    node: SubmitNode,
    registered: bool,
    _pin: PhantomPinned,
}

impl<'a, S: Scheduler> Future for Switch<'a, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // Safety: we never move out of the pinned awaitable; the node's
        // address must stay stable until the destination resumes us.
        let this = unsafe { self.get_unchecked_mut() };

        if this.registered {
            return Poll::Ready(());
        }
        this.registered = true;

        this.node.frame.set(Some(context::current_frame()));
        let node = SubmitHandle::new(NonNull::from(&this.node));
        let sched = SchedShim::new(this.dest);

        context::with_worker(|ctx| ctx.set_action(Action::Switch { node, sched }));
        Poll::Pending
    }
}
