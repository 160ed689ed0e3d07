//! Intrusive MPSC submission list.
//!
//! Every worker owns one of these; external producers deliver root tasks (and
//! context-switched tasks) by linking a [`SubmitNode`] that is embedded in the
//! task's own frame allocation, so submission never allocates. Producers push
//! with a CAS-retry loop; the owning worker drains the whole list with a
//! single exchange and reverses it off the hot path to recover FIFO order.

use crate::task::{Frame, SubmitHandle};
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// An intrusive submission node.
///
/// Lives inside the frame allocation it refers to (for roots) or inside a
/// suspended context-switch awaitable (which itself lives in a frame), so its
/// address is stable for exactly as long as the task can be resumed.
pub(crate) struct SubmitNode {
    pub(crate) frame: Cell<Option<NonNull<Frame>>>,
    next: AtomicPtr<SubmitNode>,
}

impl SubmitNode {
    pub(crate) fn new() -> Self {
        Self {
            frame: Cell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// Safety: `frame` is written once before the node is published and only read
// by the single consumer that drained it.
unsafe impl Send for SubmitNode {}
unsafe impl Sync for SubmitNode {}

/// Lock-free multi-producer single-consumer list of submitted tasks.
pub(crate) struct IntrusiveList {
    head: AtomicPtr<SubmitNode>,
}

impl IntrusiveList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Link `node` at the head. Any thread.
    pub(crate) fn push(&self, node: NonNull<SubmitNode>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the node is not yet published, we have exclusive access.
            unsafe { node.as_ref().next.store(head, Ordering::Relaxed) };

            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Detach everything and yield it in FIFO order. Owner only.
    pub(crate) fn try_pop_all(&self) -> Drain {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        // Reverse in place: the list was LIFO-linked.
        let mut prev: *mut SubmitNode = ptr::null_mut();
        let mut cur = head;
        while let Some(node) = NonNull::new(cur) {
            // Safety: detached nodes are exclusively ours.
            unsafe {
                cur = node.as_ref().next.load(Ordering::Relaxed);
                node.as_ref().next.store(prev, Ordering::Relaxed);
            }
            prev = node.as_ptr();
        }

        Drain { head: prev }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

/// FIFO iterator over a drained submission list.
pub struct Drain {
    head: *mut SubmitNode,
}

// Safety: drained nodes are exclusively owned by the drainer.
unsafe impl Send for Drain {}

impl Iterator for Drain {
    type Item = SubmitHandle;

    fn next(&mut self) -> Option<SubmitHandle> {
        let node = NonNull::new(self.head)?;
        // Safety: drained nodes are exclusively ours until handed out.
        self.head = unsafe { node.as_ref().next.load(Ordering::Relaxed) };
        Some(SubmitHandle::new(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn node() -> Box<SubmitNode> {
        Box::new(SubmitNode::new())
    }

    #[test]
    fn drain_is_fifo() {
        let list = IntrusiveList::new();
        let nodes: Vec<_> = (0..4).map(|_| node()).collect();

        for n in &nodes {
            list.push(NonNull::from(&**n));
        }
        assert!(!list.is_empty());

        let drained: Vec<_> = list.try_pop_all().map(|h| h.node().as_ptr()).collect();
        let expected: Vec<_> = nodes.iter().map(|n| &**n as *const _ as *mut _).collect();
        assert_eq!(drained, expected);
        assert!(list.is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 256;

        let list = Arc::new(IntrusiveList::new());
        let mut nodes = Vec::new();
        for _ in 0..PRODUCERS {
            nodes.push((0..PER_PRODUCER).map(|_| node()).collect::<Vec<_>>());
        }

        thread::scope(|scope| {
            for batch in &nodes {
                let list = Arc::clone(&list);
                scope.spawn(move || {
                    for n in batch {
                        list.push(NonNull::from(&**n));
                    }
                });
            }
        });

        let mut seen = 0;
        while !list.is_empty() {
            seen += list.try_pop_all().count();
        }
        assert_eq!(seen, PRODUCERS * PER_PRODUCER);
    }
}
