use crate::context;
use crate::stack::STACK_ALIGN;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind, panic_any, resume_unwind};
use std::ptr::NonNull;
use std::slice;

/// Allocate `count` default-initialized `T`s on the current worker's
/// segmented stack.
///
/// The returned span deallocates on drop; spans must be dropped in reverse
/// allocation order (ordinary scoping gives this for free) and before the
/// task returns. The allocation survives forks and joins of the enclosing
/// scope, like any other frame-local data.
///
/// Only callable inside a running task, at a point where the task owns its
/// stack: before the first fork of a scope, or after its `join`. (A stolen
/// continuation runs on a borrowed stack until the join reclaims it.)
/// Panics with [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the
/// stack cannot grow.
pub fn co_new<T: Default>(count: usize) -> StackSpan<T> {
    const {
        assert!(
            mem::align_of::<T>() <= STACK_ALIGN,
            "co_new types requiring more than the default alignment are not supported",
        )
    };

    let frame = context::current_frame_ref();
    // Allocating requires owning the stack; true at any point a task runs.
    debug_assert!(context::with_stack(|stack| stack.top()) == frame.stacklet());

    let ptr = context::with_stack(|stack| stack.allocate(count * mem::size_of::<T>()))
        .unwrap_or_else(|err| panic_any(err))
        .cast::<T>();

    for i in 0..count {
        match catch_unwind(AssertUnwindSafe(T::default)) {
            // Safety: `ptr..ptr+count` is exclusively ours.
            Ok(value) => unsafe { ptr.as_ptr().add(i).write(value) },
            Err(payload) => {
                // Unwind cleanly: drop what was built, give the bytes back.
                unsafe {
                    std::ptr::drop_in_place(slice::from_raw_parts_mut(ptr.as_ptr(), i));
                }
                context::with_stack(|stack| unsafe { stack.deallocate(ptr.cast()) });
                resume_unwind(payload);
            }
        }
    }

    // The stack may have grown onto a new stacklet: re-anchor the frame so a
    // join winner adopts the chain at its true top.
    context::with_stack(|stack| frame.set_stacklet(stack.top()));

    StackSpan {
        ptr,
        len: count,
        _not_send: PhantomData,
    }
}

/// An RAII span of stack-allocated values; see [`co_new`].
pub struct StackSpan<T> {
    ptr: NonNull<T>,
    len: usize,
    /// Tied to the owning worker's stack: neither Send nor Sync.
    _not_send: PhantomData<*mut T>,
}

impl<T> Deref for StackSpan<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: the span owns `len` initialized elements.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for StackSpan<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for StackSpan<T> {
    fn drop(&mut self) {
        // Safety: dropping in reverse allocation order per the contract; the
        // worker dropping us owns the stack (post-join invariant).
        unsafe {
            std::ptr::drop_in_place(slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len));
        }
        context::with_stack(|stack| unsafe { stack.deallocate(self.ptr.cast()) });

        let frame = context::current_frame_ref();
        context::with_stack(|stack| frame.set_stacklet(stack.top()));
    }
}
