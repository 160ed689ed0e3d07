use parking_lot::{Condvar, Mutex};

/// A binary semaphore: the completion signal between a root task and the
/// thread blocked in `Future::get`.
pub(crate) struct Semaphore {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Signal completion. Called by whichever worker finishes the root.
    pub(crate) fn release(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cv.notify_one();
    }

    /// Block until released.
    pub(crate) fn acquire(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cv.wait(&mut signaled);
        }
        *signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn release_unblocks_acquire() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };

        thread::sleep(Duration::from_millis(10));
        sem.release();
        waiter.join().unwrap();
    }

    #[test]
    fn release_before_acquire_is_not_lost() {
        let sem = Semaphore::new();
        sem.release();
        sem.acquire();
    }
}
