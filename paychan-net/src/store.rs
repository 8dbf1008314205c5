//! A [`ChannelStore`] keeping one file per key in a directory

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use payment_channel::persist::{ChannelStore, Error};
use payment_channel::SendSync;
use tempfile::NamedTempFile;

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the old one, so a crash leaves either the old or the new contents.
pub struct FileStore {
    dir: PathBuf,
}

impl SendSync for FileStore {}

impl FileStore {
    /// Open a store in `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileStore { dir: dir.as_ref().to_path_buf() })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

fn unavailable(e: impl ToString) -> Error {
    Error::Unavailable(e.to_string())
}

impl ChannelStore for FileStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut file = NamedTempFile::new_in(&self.dir).map_err(unavailable)?;
        file.write_all(&value).map_err(unavailable)?;
        file.as_file().sync_all().map_err(unavailable)?;
        file.persist(self.path(key)).map_err(|e| unavailable(e.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(unavailable(e)),
            _ => Ok(()),
        }
    }
}
