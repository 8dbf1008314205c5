//! Per-role channel registries.
//!
//! Lock order: the registry's membership lock is always taken before any
//! record lock.  Callers holding a record lock must not call back into the
//! registry.

/// Client side
pub mod client;
mod scheduler;
/// Server side
pub mod server;

pub use client::ClientChannelRegistry;
pub use server::ServerChannelRegistry;
