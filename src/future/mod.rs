//! The suspension points: fork, call, join, context switch, and stack
//! allocation.
//!
//! These are hand-written futures. A first poll performs only frame-local
//! work and records a transfer action in the worker context; the resume shim
//! executes the transfer once the poll has returned. The second poll (after
//! the task is resumed) finishes the operation: reporting synchronous
//! completion, re-raising panics, or simply yielding `Ready`.

use crate::context;
use crate::task::ret::IntoRet;
use crate::task::{Tag, TaskHandle, layout};

// Public API
mod fork;
pub use fork::{Fork, SyncFork, fork, fork_sync, fork_sync_outside};

mod call;
pub use call::{Call, EagerCall, call, call_eager, call_eager_outside};

mod join;
pub use join::{Join, join};

mod switch;
pub use switch::{Switch, resume_on};

mod alloc;
pub use alloc::{StackSpan, co_new};

/// Allocate a child frame on the current worker's stack, parented to the
/// currently executing frame. Panics with [`Error::OutOfMemory`] if the
/// stack cannot grow (raised in the parent; the child was never created).
///
/// [`Error::OutOfMemory`]: crate::Error::OutOfMemory
fn build_child<R, T, F>(ret: T, task: F, tag: Tag) -> TaskHandle
where
    R: Send,
    T: IntoRet<R>,
    F: Future<Output = R>,
{
    let parent = context::current_frame();
    context::with_stack(|stack| {
        layout::allocate_frame(stack, task, ret.into_slot(), Some(parent), tag)
    })
    .unwrap_or_else(|err| std::panic::panic_any(err))
}
