use crate::prelude::*;

/// Models for persistence
#[allow(missing_docs)]
pub mod model;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Error returned by a channel store or while decoding persisted state
pub enum Error {
    /// Store is temporarily unavailable, might work later
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    #[error("not found: {0}")]
    NotFound(String),
    /// Inconsistent state, resource already present
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Persisted bytes could not be decoded or failed validation
    #[error("corrupt: {0}")]
    Corrupt(String),
    /// Non-recoverable internal error
    #[error("internal: {0}")]
    Internal(String),
}

/// The serialize/deserialize contract a registry offers to its host.
///
/// The host decides where the bytes live (a wallet file, a database row,
/// a [`ChannelStore`]).
pub trait ChannelExtension: SendSync {
    /// A stable identifier for the blob
    fn extension_id(&self) -> &'static str;

    /// Encode all stored records
    fn serialize(&self) -> Result<Vec<u8>, Error>;

    /// Replace the stored records with the decoded ones, re-arming their timers
    fn deserialize(&self, data: &[u8]) -> Result<(), Error>;
}

/// Durable storage for registry blobs.
///
/// Implementations should persist durably before returning.
pub trait ChannelStore: SendSync {
    /// Store a blob under a key, replacing any previous value
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Fetch the blob stored under a key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Remove the blob stored under a key
    fn delete(&self, key: &str) -> Result<(), Error>;
}

/// A channel store that keeps blobs in memory
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<OrderedMap<String, Vec<u8>>>,
}

impl SendSync for MemoryStore {}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for MemoryStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.blobs.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Load a registry from a store, if the store holds a blob for it.
///
/// Returns whether anything was loaded.
pub fn load_extension(store: &dyn ChannelStore, extension: &dyn ChannelExtension) -> Result<bool, Error> {
    match store.get(extension.extension_id())? {
        Some(data) => {
            extension.deserialize(&data)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_replaces_and_deletes() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.put("a", vec![1]).unwrap();
        store.put("a", vec![2]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![2]));
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }
}
