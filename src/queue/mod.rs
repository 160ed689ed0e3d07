//! Lock-free queues: the per-worker Chase–Lev deque and the MPSC submission
//! list.

// Public API
pub mod deque;
pub use deque::{Deque, Steal, Word};

// Re-exports
pub(crate) mod list;
pub use list::Drain;
pub(crate) use list::{IntrusiveList, SubmitNode};
