//! Executor-side plumbing.
//!
//! The queue only hands out work units; something still has to park an
//! executor in `pop`, run what comes back, and release resources afterwards.
//! [`ExecutorAgent`] is that loop, one per executor slot.

pub mod agent;

pub use agent::ExecutorAgent;
