//! The per-task control block.
//!
//! A [`Frame`] sits at the head of every task allocation on the segmented
//! stack. It is deliberately small: the vtable, the stacklet back-pointer,
//! the parent link, and the fork-join counters described below.
//!
//! # Counter encoding
//!
//! `joins` is initialized to `u16::MAX` and semantically encodes
//! `u16::MAX - num_children_joined`. The sentinel lets a worker publish a
//! pending join with a single `fetch_sub` (no CAS): after subtracting
//! `u16::MAX - steals` the counter holds `steals - num_joined`, and the last
//! returning child observes it reach zero. `steals` counts how many times
//! this frame's continuation has been stolen; it is written by thieves
//! (monotone increments at steal time) and read/reset by the owner.

use crate::queue::Word;
use crate::stack::Stacklet;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// "No join pending" sentinel for the join counter.
pub(crate) const JOINS_INIT: u16 = u16::MAX;

/// A captured panic from a task body.
pub(crate) type Payload = Box<dyn Any + Send + 'static>;

/// Selects the terminal-suspension protocol for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    /// Scheduled from outside the pool; signals a semaphore on completion.
    Root,
    /// Child whose parent continuation is not stealable.
    Call,
    /// Child whose parent continuation was pushed to the deque.
    Fork,
}

/// Outcome of driving a frame's future once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Polled {
    /// The task body finished (or panicked; the payload is already routed).
    Complete,
    /// The task suspended; the transfer action is in the worker context.
    Suspend,
}

/// Monomorphized entry points for a frame.
pub(crate) struct Vtable {
    /// Drive the task's future once. Requires exclusive resume rights.
    pub(crate) poll: unsafe fn(NonNull<Frame>) -> Polled,
    /// Drop the frame contents in place (future, return slot, header).
    pub(crate) drop: unsafe fn(NonNull<Frame>),
    /// Byte offset of the embedded submission node.
    pub(crate) node_offset: usize,
}

/// The task control block. First field of every frame allocation, so a
/// `NonNull<Frame>` is the universal thin task pointer.
pub(crate) struct Frame {
    vtable: &'static Vtable,

    /// The stacklet this frame was allocated on. Updated when a `co_new`
    /// grows the stack under the frame, so the join winner always adopts the
    /// chain at its true top.
    stacklet: Cell<NonNull<Stacklet>>,

    /// Parent frame; `None` for roots (their completion signal lives in the
    /// root return receptacle).
    parent: Option<NonNull<Frame>>,

    tag: Tag,

    /// Times this frame's continuation has been stolen.
    steals: AtomicU16,

    /// `u16::MAX - num_children_joined`; see the module docs.
    joins: AtomicU16,

    /// Guards `exception`; first writer wins.
    has_exception: AtomicBool,

    /// One-shot storage for a captured panic of this task's subtree.
    exception: UnsafeCell<Option<Payload>>,
}

// Safety: the atomic fields carry all cross-thread traffic. `stacklet` and
// `exception` are only touched by the worker holding the resume right (or,
// for `exception`, by the race winner of `has_exception`).
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn new(
        vtable: &'static Vtable,
        stacklet: NonNull<Stacklet>,
        parent: Option<NonNull<Frame>>,
        tag: Tag,
    ) -> Self {
        Self {
            vtable,
            stacklet: Cell::new(stacklet),
            parent,
            tag,
            steals: AtomicU16::new(0),
            joins: AtomicU16::new(JOINS_INIT),
            has_exception: AtomicBool::new(false),
            exception: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub(crate) fn vtable(&self) -> &'static Vtable {
        self.vtable
    }

    #[inline]
    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub(crate) fn parent(&self) -> Option<NonNull<Frame>> {
        self.parent
    }

    #[inline]
    pub(crate) fn stacklet(&self) -> NonNull<Stacklet> {
        self.stacklet.get()
    }

    #[inline]
    pub(crate) fn set_stacklet(&self, stacklet: NonNull<Stacklet>) {
        self.stacklet.set(stacklet);
    }

    /// Owner-side read of the steal count. Relaxed: every increment was made
    /// by a thief whose subsequent execution of the continuation
    /// happens-before any owner read.
    #[inline]
    pub(crate) fn load_steals(&self) -> u16 {
        self.steals.load(Ordering::Relaxed)
    }

    /// Thief-side increment, at steal time.
    #[inline]
    pub(crate) fn fetch_add_steal(&self) -> u16 {
        self.steals.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load_joins(&self, order: Ordering) -> u16 {
        self.joins.load(order)
    }

    #[inline]
    pub(crate) fn fetch_sub_joins(&self, n: u16, order: Ordering) -> u16 {
        self.joins.fetch_sub(n, order)
    }

    /// Reset the counters after a completed join. Exclusive ownership makes
    /// plain (relaxed) stores sufficient.
    pub(crate) fn reset(&self) {
        self.steals.store(0, Ordering::Relaxed);
        self.joins.store(JOINS_INIT, Ordering::Relaxed);
    }

    /// Store a child's panic payload; the first writer wins, later payloads
    /// are dropped. Callable from any worker running a child of this frame.
    pub(crate) fn stash_exception(&self, payload: Payload) {
        if self
            .has_exception
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: winning the flag grants exclusive write access; readers
            // look only after the join protocol ordered them after us.
            unsafe { *self.exception.get() = Some(payload) };
        }
    }

    /// Whether some child has (at least started to) stash a panic. Safe to
    /// call without exclusive ownership; the payload itself is not.
    #[inline]
    pub(crate) fn has_exception(&self) -> bool {
        self.has_exception.load(Ordering::Acquire)
    }

    /// Take the stashed payload. Requires exclusive ownership of the frame
    /// (after a completed join, or with `steals == 0`).
    pub(crate) fn take_exception(&self) -> Option<Payload> {
        if self.has_exception.load(Ordering::Acquire) {
            self.has_exception.store(false, Ordering::Relaxed);
            // Safety: exclusive ownership per the caller contract.
            unsafe { (*self.exception.get()).take() }
        } else {
            None
        }
    }
}

/// A thin, copyable pointer to a task frame: the deque entry type and the
/// argument of the stolen-task resume path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(NonNull<Frame>);

// Safety: a handle is just an address; the protocol guarantees a single
// resumer at a time.
unsafe impl Send for TaskHandle {}

impl TaskHandle {
    pub(crate) fn new(ptr: NonNull<Frame>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub(crate) fn ptr(self) -> NonNull<Frame> {
        self.0
    }

    /// Safety contract is internal: the frame outlives every handle by the
    /// lifecycle rules (destroyed exactly once, at terminal suspension).
    #[inline]
    pub(crate) fn frame<'a>(self) -> &'a Frame {
        unsafe { self.0.as_ref() }
    }
}

// Safety: round-trips through a word exactly; handles are plain addresses.
unsafe impl Word for TaskHandle {
    fn into_word(self) -> usize {
        self.0.as_ptr() as usize
    }

    unsafe fn from_word(word: usize) -> Self {
        // Safety: the word came from `into_word` of a valid handle.
        Self(unsafe { NonNull::new_unchecked(word as *mut Frame) })
    }
}

/// A submitted task: a pointer to the intrusive submission node embedded in
/// (or alongside) the task's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitHandle(NonNull<crate::queue::SubmitNode>);

// Safety: as for `TaskHandle`.
unsafe impl Send for SubmitHandle {}

impl SubmitHandle {
    pub(crate) fn new(node: NonNull<crate::queue::SubmitNode>) -> Self {
        Self(node)
    }

    #[inline]
    pub(crate) fn node(self) -> NonNull<crate::queue::SubmitNode> {
        self.0
    }

    /// The task this submission resumes.
    #[inline]
    pub(crate) fn task(self) -> TaskHandle {
        // Safety: the node is embedded in a live frame allocation.
        let frame = unsafe { self.0.as_ref() }
            .frame
            .get()
            .expect("submission node without a frame");
        TaskHandle::new(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskHandle: Send, Copy);
    assert_impl_all!(SubmitHandle: Send, Copy);

    #[test]
    fn join_counter_encoding() {
        // joins = MAX - num_joined; after fetch_sub(MAX - steals) it holds
        // steals - num_joined, reaching zero when the last child returns.
        let steals: u16 = 3;
        let mut joins = JOINS_INIT;

        // Two children returned before the join was issued.
        joins -= 2;
        let joined = JOINS_INIT - joins;
        assert_eq!(joined, 2);
        assert_ne!(steals, joined, "join must suspend");

        // Parent registers the pending join.
        joins -= JOINS_INIT - steals;
        assert_eq!(joins, 1, "one stolen child still owed");

        // Last child returns: counter hits zero, it wins the race.
        joins -= 1;
        assert_eq!(joins, 0);
    }
}
