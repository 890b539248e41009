//! Change tracking.
//!
//! Every entity a session knows about is an [`Entry`] in the session's
//! [`StateManager`]. Entries carry current and original values, per-property
//! modified and temporary flags, and links to their owner and principals.

mod entry;
mod manager;

pub use entry::{EntityState, Entry};
pub use manager::StateManager;
