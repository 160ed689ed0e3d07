//! Return addresses: where a child task writes its result.
//!
//! A spawned task does not hand its result back through the awaitable (the
//! parent resumes long before a stolen child finishes); instead the result is
//! written through a return address captured when the child is constructed.
//! Supported addresses: a plain `&mut R`, an [`Eventually`] cell
//! (value-or-empty), a [`TryEventually`] cell (value-or-empty-or-panic), and
//! [`Discard`] for fire-and-forget or `()` tasks.

use crate::task::frame::Payload;
use std::any::Any;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::panic::resume_unwind;
use std::ptr::NonNull;

/// Destination slot a frame writes its completion into. Implementations are
/// plain pointers or cells; they are moved into the child frame and may be
/// used from whichever worker completes the child.
///
/// Public only because [`IntoRet`] names it; not meant to be implemented
/// outside the crate.
#[doc(hidden)]
pub trait RetSlot<R> {
    /// Deliver the task's value.
    ///
    /// Safety: called exactly once, by the worker completing the task, while
    /// the referent is live (the fork-join discipline: children complete
    /// before the scope's join).
    unsafe fn write(&mut self, value: R);

    /// Offer a panic payload. `Ok(())` means the slot captured it; `Err`
    /// hands it back for forwarding to the parent frame.
    fn stash(&mut self, payload: Box<dyn Any + Send>) -> Result<(), Box<dyn Any + Send>> {
        Err(payload)
    }
}

/// Result sink for `fork(&mut r, ..)` / `call(&mut r, ..)`.
#[doc(hidden)]
pub struct RawRet<R>(NonNull<R>);

// Safety: the address is only dereferenced under the RetSlot::write contract.
unsafe impl<R: Send> Send for RawRet<R> {}

impl<R> RetSlot<R> for RawRet<R> {
    unsafe fn write(&mut self, value: R) {
        // The referent is initialized (it is a live `&mut R`): assign, do not
        // overwrite uninitialized memory.
        unsafe { *self.0.as_mut() = value };
    }
}

/// A write-once cell filled in by a child task and read after `join`.
pub struct Eventually<R> {
    slot: UnsafeCell<Option<R>>,
}

// Safety: writes happen-before the join that makes reads possible, and reads
// require `&mut self`.
unsafe impl<R: Send> Send for Eventually<R> {}
unsafe impl<R: Send> Sync for Eventually<R> {}

impl<R> Eventually<R> {
    pub fn new() -> Self {
        Self {
            slot: UnsafeCell::new(None),
        }
    }

    /// Take the value, if the task produced one. Call after `join`.
    pub fn take(&mut self) -> Option<R> {
        self.slot.get_mut().take()
    }
}

impl<R> Default for Eventually<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[doc(hidden)]
pub struct EventuallyRet<R>(NonNull<Eventually<R>>);

// Safety: as for RawRet.
unsafe impl<R: Send> Send for EventuallyRet<R> {}

impl<R> RetSlot<R> for EventuallyRet<R> {
    unsafe fn write(&mut self, value: R) {
        unsafe { *self.0.as_ref().slot.get() = Some(value) };
    }
}

enum TryState<R> {
    Empty,
    Value(R),
    Panicked(Payload),
}

/// Like [`Eventually`], but also captures a panic of its task instead of
/// letting it propagate to the parent's exception slot.
pub struct TryEventually<R> {
    slot: UnsafeCell<TryState<R>>,
}

// Safety: as for Eventually.
unsafe impl<R: Send> Send for TryEventually<R> {}
unsafe impl<R: Send> Sync for TryEventually<R> {}

impl<R> TryEventually<R> {
    pub fn new() -> Self {
        Self {
            slot: UnsafeCell::new(TryState::Empty),
        }
    }

    /// Take the value if the task produced one; re-raises the task's panic if
    /// it captured one. Call after `join`.
    pub fn take(&mut self) -> Option<R> {
        match std::mem::replace(self.slot.get_mut(), TryState::Empty) {
            TryState::Empty => None,
            TryState::Value(value) => Some(value),
            TryState::Panicked(payload) => resume_unwind(payload),
        }
    }
}

impl<R> Default for TryEventually<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[doc(hidden)]
pub struct TryRet<R>(NonNull<TryEventually<R>>);

// Safety: as for RawRet.
unsafe impl<R: Send> Send for TryRet<R> {}

impl<R> RetSlot<R> for TryRet<R> {
    unsafe fn write(&mut self, value: R) {
        unsafe { *self.0.as_ref().slot.get() = TryState::Value(value) };
    }

    fn stash(&mut self, payload: Box<dyn Any + Send>) -> Result<(), Box<dyn Any + Send>> {
        unsafe { *self.0.as_ref().slot.get() = TryState::Panicked(payload) };
        Ok(())
    }
}

/// Discards the task's result; the sink for `()` tasks and fire-and-forget.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

#[doc(hidden)]
pub struct DiscardRet<R>(PhantomData<fn(R)>);

impl<R> RetSlot<R> for DiscardRet<R> {
    unsafe fn write(&mut self, value: R) {
        drop(value);
    }
}

/// Conversion from the user-facing return addresses to the slot stored in
/// the child frame.
pub trait IntoRet<R>: sealed::Sealed {
    #[doc(hidden)]
    type Slot: RetSlot<R> + Send;

    #[doc(hidden)]
    fn into_slot(self) -> Self::Slot;
}

impl<'a, R: Send> IntoRet<R> for &'a mut R {
    type Slot = RawRet<R>;

    fn into_slot(self) -> RawRet<R> {
        RawRet(NonNull::from(self))
    }
}

impl<'a, R: Send> IntoRet<R> for &'a Eventually<R> {
    type Slot = EventuallyRet<R>;

    fn into_slot(self) -> EventuallyRet<R> {
        EventuallyRet(NonNull::from(self))
    }
}

impl<'a, R: Send> IntoRet<R> for &'a TryEventually<R> {
    type Slot = TryRet<R>;

    fn into_slot(self) -> TryRet<R> {
        TryRet(NonNull::from(self))
    }
}

impl<R: Send> IntoRet<R> for Discard {
    type Slot = DiscardRet<R>;

    fn into_slot(self) -> DiscardRet<R> {
        DiscardRet(PhantomData)
    }
}

mod sealed {
    pub trait Sealed {}

    impl<'a, R> Sealed for &'a mut R {}
    impl<'a, R> Sealed for &'a super::Eventually<R> {}
    impl<'a, R> Sealed for &'a super::TryEventually<R> {}
    impl Sealed for super::Discard {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn raw_ret_assigns() {
        let mut out = 0u64;
        let mut slot = (&mut out).into_slot();
        unsafe { slot.write(42u64) };
        assert_eq!(out, 42);
    }

    #[test]
    fn eventually_round_trip() {
        let mut cell = Eventually::new();
        let mut slot = (&cell).into_slot();
        unsafe { slot.write(String::from("done")) };
        assert_eq!(cell.take().as_deref(), Some("done"));
        assert_eq!(cell.take(), None);
    }

    #[test]
    fn try_eventually_captures_panics() {
        let mut cell: TryEventually<u32> = TryEventually::new();
        let mut slot = (&cell).into_slot();
        assert!(slot.stash(Box::new("boom")).is_ok());

        let err = catch_unwind(AssertUnwindSafe(|| cell.take())).unwrap_err();
        assert_eq!(*err.downcast_ref::<&str>().unwrap(), "boom");
    }

    #[test]
    fn raw_ret_refuses_panics() {
        let mut out = 0u32;
        let mut slot = (&mut out).into_slot();
        assert!(slot.stash(Box::new("boom")).is_err());
    }
}
