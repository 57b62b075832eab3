//! Job worker.
//!
//! - `poller` — the find → claim → dispatch loop

pub mod poller;

pub use poller::Worker;
