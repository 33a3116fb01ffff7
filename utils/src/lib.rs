//! Shared utilities for Relay.
//!
//! Currently this is just atomic file replacement, used by the session store
//! for metadata writes that readers must never observe half-finished.

mod atomic_write;

pub use atomic_write::{AtomicWriteOptions, atomic_write, atomic_write_with_options, recover_backup};
