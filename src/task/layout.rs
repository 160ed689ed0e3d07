//! Frame allocation and the monomorphized vtable.
//!
//! A task allocation is a [`FrameBox`]: the [`Frame`] header first (so a
//! `NonNull<Frame>` is the universal thin pointer), the embedded submission
//! node, the return slot, then the future itself. The vtable carries the two
//! monomorphized entry points plus the submission-node offset, mirroring the
//! trailer-offset trick used by raw-task runtimes.

use crate::context;
use crate::errors::Error;
use crate::queue::SubmitNode;
use crate::stack::{STACK_ALIGN, Stack};
use crate::task::frame::{Frame, JOINS_INIT, Payload, Polled, Tag, Vtable};
use crate::task::ret::RetSlot;
use crate::task::{SubmitHandle, TaskHandle};
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, Waker};

#[repr(C)]
struct FrameBox<F, I> {
    frame: Frame,
    node: SubmitNode,
    ret: I,
    future: F,
}

fn vtable<F, I>() -> &'static Vtable
where
    F: Future,
    I: RetSlot<F::Output>,
{
    &Vtable {
        poll: poll_frame::<F, I>,
        drop: drop_frame::<F, I>,
        node_offset: mem::offset_of!(FrameBox<F, I>, node),
    }
}

/// Construct a task frame on `stack`.
///
/// The frame records `stack.top()` after the allocation, which is the
/// stacklet the frame's bytes actually landed on.
pub(crate) fn allocate_frame<F, I>(
    stack: &mut Stack,
    future: F,
    ret: I,
    parent: Option<NonNull<Frame>>,
    tag: Tag,
) -> Result<TaskHandle, Error>
where
    F: Future,
    I: RetSlot<F::Output> + Send,
{
    const {
        assert!(
            mem::align_of::<FrameBox<F, I>>() <= STACK_ALIGN,
            "task frames requiring more than the default alignment are not supported",
        )
    };

    let ptr = stack.allocate(mem::size_of::<FrameBox<F, I>>())?;
    let ptr = ptr.cast::<FrameBox<F, I>>();

    // Safety: `ptr` is a fresh, exclusive, sufficiently sized allocation.
    unsafe {
        ptr.write(FrameBox {
            frame: Frame::new(vtable::<F, I>(), stack.top(), parent, tag),
            node: SubmitNode::new(),
            ret,
            future,
        });
        ptr.as_ref().node.frame.set(Some(ptr.cast::<Frame>()));
    }

    Ok(TaskHandle::new(ptr.cast::<Frame>()))
}

/// The submission node embedded in `task`'s frame allocation.
pub(crate) fn submit_handle(task: TaskHandle) -> SubmitHandle {
    let offset = task.frame().vtable().node_offset;
    // Safety: the node lives at `node_offset` inside the live allocation.
    let node = unsafe {
        NonNull::new_unchecked(task.ptr().as_ptr().cast::<u8>().add(offset)).cast::<SubmitNode>()
    };
    SubmitHandle::new(node)
}

/// Drop the frame contents (future, return slot, header) in place. The
/// caller still owns the bytes and deallocates them from the stack.
///
/// Safety: exclusive access; called exactly once, after the frame's last
/// resumption.
pub(crate) unsafe fn drop_contents(task: TaskHandle) {
    let vtable = task.frame().vtable();
    unsafe { (vtable.drop)(task.ptr()) };
}

/// Destroy a frame and return its bytes to the current worker's stack.
///
/// Safety: as for [`drop_contents`]; additionally the frame must be the most
/// recent live allocation on the current stack.
pub(crate) unsafe fn destroy_frame(task: TaskHandle) {
    debug_assert_eq!(
        task.frame().load_joins(Ordering::Relaxed),
        JOINS_INIT,
        "frame destroyed with a pending join",
    );

    // Drop outside the stack borrow: destructors of captured values may
    // themselves touch the thread-local stack (e.g. a stack-allocated span).
    unsafe { drop_contents(task) };
    context::with_stack(|stack| unsafe { stack.deallocate(task.ptr().cast()) });
}

/// Drive the frame's future once.
///
/// Safety: requires the exclusive resume right for this frame; the frame
/// must have been allocated with the matching `F`/`I`.
unsafe fn poll_frame<F, I>(ptr: NonNull<Frame>) -> Polled
where
    F: Future,
    I: RetSlot<F::Output>,
{
    let boxed = unsafe { ptr.cast::<FrameBox<F, I>>().as_mut() };

    // The frame never moves once allocated, so pinning is structural. The
    // waker is inert: suspension is communicated through the worker context,
    // never through wakeups.
    let future = unsafe { Pin::new_unchecked(&mut boxed.future) };
    let mut cx = Context::from_waker(Waker::noop());

    match catch_unwind(AssertUnwindSafe(|| future.poll(&mut cx))) {
        Ok(Poll::Pending) => Polled::Suspend,
        Ok(Poll::Ready(value)) => {
            guard_scope_closed(&boxed.frame);
            // Safety: completion delivers the result exactly once.
            unsafe { boxed.ret.write(value) };
            Polled::Complete
        }
        Err(payload) => {
            guard_scope_closed(&boxed.frame);
            deliver_panic(&mut boxed.ret, &boxed.frame, payload);
            Polled::Complete
        }
    }
}

/// A frame may only complete with its fork-join scope closed: either no
/// child continuation was ever stolen, or a join reset the counters. A body
/// that unwinds (or returns) past live stolen children would let them write
/// into a destroyed frame, and the frame's stacklet is not owned by this
/// worker; there is no way to continue.
fn guard_scope_closed(frame: &Frame) {
    if frame.load_steals() != 0 {
        tracing::error!("task completed inside an unjoined fork-join scope");
        std::process::abort();
    }
}

/// Route a panic payload per the exception protocol: the frame's own
/// receptacle first, the parent's one-shot slot otherwise.
fn deliver_panic<R>(ret: &mut dyn RetSlot<R>, frame: &Frame, payload: Payload) {
    if let Err(payload) = ret.stash(payload) {
        match frame.parent() {
            // Safety: a parent outlives all of its children.
            Some(parent) => unsafe { parent.as_ref() }.stash_exception(payload),
            // Roots always carry a stashing receptacle.
            None => unreachable!("root task without a panic receptacle"),
        }
    }
}

/// Drop the frame contents in place.
unsafe fn drop_frame<F, I>(ptr: NonNull<Frame>) {
    unsafe { std::ptr::drop_in_place(ptr.cast::<FrameBox<F, I>>().as_ptr()) };
}
