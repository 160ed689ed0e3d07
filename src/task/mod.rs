//! Task frames: the control block, the frame layout, and return addresses.

// Public API
pub mod ret;
pub use ret::{Discard, Eventually, IntoRet, TryEventually};

// Re-exports
pub(crate) mod frame;
pub use frame::{SubmitHandle, TaskHandle};
pub(crate) use frame::{Frame, JOINS_INIT, Payload, Polled, Tag};

pub(crate) mod layout;
