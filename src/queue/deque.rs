//! Chase–Lev work-stealing deque.
//!
//! Single-producer (the owning worker, `push`/`pop` at the bottom),
//! multi-consumer (thieves, `steal` at the top), unbounded. Based on "Dynamic
//! Circular Work-Stealing Deque" (Chase & Lev, 2005) with the weak-memory
//! orderings of "Correct and Efficient Work-Stealing for Weak Memory Models"
//! (Lê et al., 2013).
//!
//! # Ordering rationale
//!
//! - `push` writes the slot, then publishes with a release fence before the
//!   store of the new `bottom`; a thief observes the element through its
//!   acquire load of `bottom`.
//! - `pop` races with a concurrent `steal` exactly at the last element; the
//!   race is decided by a seq_cst `compare_exchange` on `top`.
//! - Stored values are single words held in atomic slots, so the speculative
//!   read a thief performs before its CAS is a plain relaxed load and stays
//!   harmless when the race is lost.
//!
//! Growing allocates a new power-of-two buffer and retires the old one into a
//! per-deque garbage list: a thief may still be reading the retired buffer,
//! so retired buffers are only freed when the deque itself drops.

use crate::errors::Error;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::marker::PhantomData;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering, fence};

#[cfg(loom)]
use loom::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering, fence};

/// Initial buffer capacity, in entries.
const DEFAULT_CAPACITY: usize = 1024;

/// Retired buffers the garbage list is sized for up front.
const GARBAGE_RESERVE: usize = 64;

/// Result of a steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal<T> {
    /// An element was stolen.
    Success(T),
    /// Lost a race against another thief or the owner; the caller decides
    /// whether to retry.
    Lost,
    /// The deque was observed empty.
    Empty,
}

impl<T> Steal<T> {
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Types that can live in a deque slot: trivially copyable single words.
///
/// # Safety
///
/// `from_word(into_word(x))` must reproduce `x` exactly, and dropping `T`
/// must be a no-op (slots are duplicated by speculative reads).
pub unsafe trait Word: Copy {
    fn into_word(self) -> usize;

    /// Safety: `word` must come from `into_word`.
    unsafe fn from_word(word: usize) -> Self;
}

// Safety: identity conversion, usize is plain data.
unsafe impl Word for usize {
    fn into_word(self) -> usize {
        self
    }

    unsafe fn from_word(word: usize) -> usize {
        word
    }
}

/// A circular power-of-two buffer of atomic words.
struct Buffer {
    mask: isize,
    slots: Box<[AtomicUsize]>,
}

impl Buffer {
    /// Fallible allocation: growing the deque must not abort the process,
    /// the failure is reported to the forking task instead.
    fn alloc(capacity: usize) -> Result<Box<Buffer>, Error> {
        debug_assert!(capacity.is_power_of_two());

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        slots.resize_with(capacity, || AtomicUsize::new(0));

        Ok(Box::new(Buffer {
            mask: capacity as isize - 1,
            slots: slots.into_boxed_slice(),
        }))
    }

    #[inline]
    fn capacity(&self) -> isize {
        self.mask + 1
    }

    #[inline]
    fn read(&self, index: isize) -> usize {
        self.slots[(index & self.mask) as usize].load(Ordering::Relaxed)
    }

    #[inline]
    fn write(&self, index: isize, word: usize) {
        self.slots[(index & self.mask) as usize].store(word, Ordering::Relaxed);
    }
}

/// The work-stealing deque.
///
/// `push` and `pop` are owner-only; `steal` may be called from any thread.
pub struct Deque<T: Word> {
    bottom: CachePadded<AtomicIsize>,
    top: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Buffer>,
    /// Retired buffers; owner-only, freed on drop.
    garbage: UnsafeCell<Vec<Box<Buffer>>>,
    _marker: PhantomData<T>,
}

// Safety: bottom/top/buffer are atomics; `garbage` is only touched by the
// owning worker (from `push`), per the single-producer contract.
unsafe impl<T: Word + Send> Send for Deque<T> {}
unsafe impl<T: Word + Send> Sync for Deque<T> {}

impl<T: Word> Deque<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let buffer = Buffer::alloc(capacity).expect("initial deque buffer allocation failed");
        Self {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Box::into_raw(buffer)),
            garbage: UnsafeCell::new(Vec::with_capacity(GARBAGE_RESERVE)),
            _marker: PhantomData,
        }
    }

    /// Push at the bottom. Owner only.
    ///
    /// Fails with [`Error::OutOfMemory`] when the deque is full and a larger
    /// buffer cannot be allocated; the element is not enqueued.
    pub fn push(&self, value: T) -> Result<(), Error> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // Safety (here and below): the buffer pointer is valid until drop;
        // retired buffers are kept alive in the garbage list.
        if b - t >= unsafe { (*buffer).capacity() } {
            buffer = self.grow(b, t)?;
        }

        unsafe { (*buffer).write(b, value.into_word()) };

        // Publish the slot before the new bottom.
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop at the bottom. Owner only.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty: restore the canonical empty state.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let word = unsafe { (*buffer).read(b) };
        if t < b {
            // More than one element, no race possible.
            return Some(unsafe { T::from_word(word) });
        }

        // Last element: race a concurrent thief for it.
        let won = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b + 1, Ordering::Relaxed);
        won.then(|| unsafe { T::from_word(word) })
    }

    /// Steal at the top. Any thread.
    pub fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        // Speculative read; only valid if the CAS below claims index `t`.
        let buffer = self.buffer.load(Ordering::Acquire);
        let word = unsafe { (*buffer).read(t) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Success(unsafe { T::from_word(word) })
        } else {
            Steal::Lost
        }
    }

    /// Observed-empty check; exact for the owner, approximate for others.
    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        b <= t
    }

    /// Double the buffer, copying the live range. Owner only, called from
    /// `push` with the current indices.
    #[cold]
    fn grow(&self, b: isize, t: isize) -> Result<*mut Buffer, Error> {
        let old = self.buffer.load(Ordering::Relaxed);
        // Safety: owner-exclusive access to the current buffer's geometry.
        let next = Buffer::alloc(unsafe { (*old).capacity() } as usize * 2)?;

        for i in t..b {
            unsafe { next.write(i, (*old).read(i)) };
        }

        let next = Box::into_raw(next);
        self.buffer.store(next, Ordering::Release);

        // A thief may still be reading `old`: retire it, free on drop.
        unsafe {
            let garbage = &mut *self.garbage.get();
            garbage.push(Box::from_raw(old));
        }

        tracing::trace!(capacity = unsafe { (*next).capacity() }, "deque grew");
        Ok(next)
    }
}

impl<T: Word> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Word> Drop for Deque<T> {
    fn drop(&mut self) {
        // Safety: drop is exclusive; entries are plain words and need no drop.
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
        }
        // Garbage buffers drop with the UnsafeCell's Vec.
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn owner_is_lifo() {
        let deque: Deque<usize> = Deque::with_capacity(8);
        for i in 0..5 {
            deque.push(i).unwrap();
        }
        for i in (0..5).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn thieves_are_fifo() {
        let deque: Deque<usize> = Deque::with_capacity(8);
        for i in 0..5 {
            deque.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(deque.steal(), Steal::Success(i));
        }
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn growth_beyond_initial_capacity_loses_nothing() {
        const N: usize = 3 * DEFAULT_CAPACITY;

        let deque: Deque<usize> = Deque::new();
        for i in 0..N {
            deque.push(i).unwrap();
        }

        let mut seen = Vec::with_capacity(N);
        while let Some(v) = deque.pop() {
            seen.push(v);
        }
        seen.reverse();
        assert_eq!(seen, (0..N).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_stealers_no_loss_no_duplication() {
        const N: usize = 50_000;
        const THIEVES: usize = 4;

        let deque: Arc<Deque<usize>> = Arc::new(Deque::new());
        for i in 0..N {
            deque.push(i).unwrap();
        }

        let counts = thread::scope(|scope| {
            let handles: Vec<_> = (0..THIEVES)
                .map(|_| {
                    let deque = Arc::clone(&deque);
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        loop {
                            match deque.steal() {
                                Steal::Success(v) => seen.push(v),
                                Steal::Lost => continue,
                                Steal::Empty => break,
                            }
                        }
                        seen
                    })
                })
                .collect();

            // Owner pops concurrently.
            let mut owned = Vec::new();
            while let Some(v) = deque.pop() {
                owned.push(v);
            }

            let mut all = owned;
            for h in handles {
                all.extend(h.join().unwrap());
            }
            all
        });

        let mut all = counts;
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), N, "every element delivered exactly once");
    }

    #[test]
    fn interleaved_pop_and_steal() {
        let deque: Deque<usize> = Deque::with_capacity(8);
        for i in 1..=5 {
            deque.push(i).unwrap();
        }

        assert_eq!(deque.steal(), Steal::Success(1));
        assert_eq!(deque.pop(), Some(5));
        assert_eq!(deque.steal(), Steal::Success(2));
        assert_eq!(deque.pop(), Some(4));
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.pop(), None);
        assert_eq!(deque.steal(), Steal::Empty);
    }
}

// Run with: RUSTFLAGS="--cfg loom" cargo test --release deque::loom_tests
#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn last_element_race_is_exclusive() {
        loom::model(|| {
            let deque: loom::sync::Arc<Deque<usize>> =
                loom::sync::Arc::new(Deque::with_capacity(2));
            deque.push(7).unwrap();

            let thief = {
                let deque = deque.clone();
                thread::spawn(move || deque.steal().success())
            };

            let popped = deque.pop();
            let stolen = thief.join().unwrap();

            // Exactly one side gets the element.
            assert!(popped.is_some() ^ stolen.is_some());
        });
    }

    #[test]
    fn steal_sees_published_element() {
        loom::model(|| {
            let deque: loom::sync::Arc<Deque<usize>> =
                loom::sync::Arc::new(Deque::with_capacity(2));

            let thief = {
                let deque = deque.clone();
                thread::spawn(move || match deque.steal() {
                    Steal::Success(v) => Some(v),
                    _ => None,
                })
            };

            deque.push(13).unwrap();
            let stolen = thief.join().unwrap();
            if let Some(v) = stolen {
                assert_eq!(v, 13);
            } else {
                assert_eq!(deque.pop(), Some(13));
            }
        });
    }
}
