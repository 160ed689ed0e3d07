use crate::context::{self, Action};
use crate::task::{Frame, JOINS_INIT};
use std::panic::resume_unwind;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Synchronize with all children forked in the current scope.
///
/// Completes synchronously when no child continuation was stolen, or when
/// every stolen child has already returned; otherwise the task suspends and
/// is resumed by whichever worker the join race elects. Either way, a panic
/// stashed by any child of the scope is re-raised here.
pub fn join() -> Join {
    Join { registered: false }
}

/// Awaitable produced by [`join`].
#[must_use = "a join does nothing until awaited"]
pub struct Join {
    registered: bool,
}

impl Future for Join {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let frame = context::current_frame_ref();

        if this.registered {
            // Resumed by the race winner, who took the stack back and reset
            // the counters before resuming us.
            debug_assert_eq!(frame.load_steals(), 0);
            debug_assert_eq!(frame.load_joins(Ordering::Acquire), JOINS_INIT);
            debug_assert!(context::with_stack(|stack| stack.top()) == frame.stacklet());
            rethrow(frame);
            return Poll::Ready(());
        }

        let steals = frame.load_steals();
        if steals == 0 {
            // No steals: sole owner, every child already completed here and
            // no counter was ever touched.
            rethrow(frame);
            return Poll::Ready(());
        }

        // Prefer seeing every decrement over suspending: the acquire load
        // orders the children's writes before ours if we continue.
        let joined = JOINS_INIT - frame.load_joins(Ordering::Acquire);
        if steals == joined {
            // All stolen children returned: take the stack back and carry on
            // synchronously.
            context::with_stack(|stack| unsafe { stack.adopt(frame.stacklet()) });
            frame.reset();
            rethrow(frame);
            return Poll::Ready(());
        }

        // Children outstanding: suspend, then let the resume shim publish
        // the pending join (the counter subtract must happen after this poll
        // has returned).
        this.registered = true;
        context::with_worker(|ctx| ctx.set_action(Action::Join));
        Poll::Pending
    }
}

/// Re-raise whatever the scope stashed. Requires exclusive frame ownership.
fn rethrow(frame: &Frame) {
    if let Some(payload) = frame.take_exception() {
        resume_unwind(payload);
    }
}
