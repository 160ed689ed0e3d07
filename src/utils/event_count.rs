use parking_lot::{Condvar, Mutex};

/// A futex-like event count: the sleep/wake primitive of the lazy scheduler.
///
/// The sleep protocol is prepare/re-check/commit: [`prepare_wait`] snapshots
/// the epoch, the caller re-checks its wake conditions, and [`commit_wait`]
/// blocks only if no notification arrived in between. Notifications bump the
/// epoch first, so a wake between prepare and commit is never lost. Spurious
/// wake-ups are allowed; callers re-check in their loop.
///
/// [`prepare_wait`]: EventCount::prepare_wait
/// [`commit_wait`]: EventCount::commit_wait
pub(crate) struct EventCount {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl EventCount {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Snapshot the epoch; the wait key for a later [`commit_wait`].
    ///
    /// [`commit_wait`]: EventCount::commit_wait
    pub(crate) fn prepare_wait(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Abandon a prepared wait. A no-op, present so call sites spell out the
    /// protocol.
    pub(crate) fn cancel_wait(&self) {}

    /// Block until some notification arrives after the `key` snapshot.
    pub(crate) fn commit_wait(&self, key: u64) {
        let mut epoch = self.epoch.lock();
        while *epoch == key {
            self.cv.wait(&mut epoch);
        }
    }

    /// Wake (at least) one committed waiter.
    pub(crate) fn notify_one(&self) {
        *self.epoch.lock() += 1;
        self.cv.notify_one();
    }

    /// Wake every committed waiter.
    pub(crate) fn notify_all(&self) {
        *self.epoch.lock() += 1;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_between_prepare_and_commit_is_not_lost() {
        let ec = EventCount::new();
        let key = ec.prepare_wait();
        ec.notify_one();
        // Must return immediately; a lost wake would hang the test.
        ec.commit_wait(key);
    }

    #[test]
    fn notify_all_wakes_sleepers() {
        let ec = Arc::new(EventCount::new());
        let woken = Arc::new(AtomicBool::new(false));

        let sleeper = {
            let ec = Arc::clone(&ec);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                let key = ec.prepare_wait();
                ec.commit_wait(key);
                woken.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(10));
        ec.notify_all();
        sleeper.join().unwrap();
        assert!(woken.load(Ordering::Acquire));
    }
}
