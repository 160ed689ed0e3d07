//! Small synchronization primitives shared by the pools.

pub(crate) mod event_count;
pub(crate) use event_count::EventCount;

pub(crate) mod semaphore;
pub(crate) use semaphore::Semaphore;
