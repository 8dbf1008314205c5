#![crate_name = "payment_channel"]

//! Two-party payment channels: channel records, the per-role registries that
//! keep them across restarts, and the transaction helpers used by both roles.
//! The protocol state machines live in the `paychan-handler` crate.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub use bitcoin;

/// Channel records
pub mod channel;
/// Client and server policy
pub mod config;
/// Errors
pub mod error;
/// Persistence
pub mod persist;
/// Client and server channel registries
pub mod registry;
/// Transaction construction, signing and validation
pub mod tx;
/// Various utilities
pub mod util;
/// Wallet and broadcaster collaborators
pub mod wallet;

pub use error::{Error, Result};

/// Common imports
pub mod prelude {
    pub use std::collections::{BTreeMap as OrderedMap, HashMap as Map, HashSet as UnorderedSet};
    pub use std::sync::{Arc, Mutex, MutexGuard, Weak};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;
