// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Staged piece data lives in a directory owned by the provider. Deals
//! reference staged files by a store-relative [`Path`]; an empty path means
//! nothing is staged.

use log::warn;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Store-relative reference to a staged file. Empty when unset.
pub type Path = String;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found in store: {0}")]
    NotFound(Path),
    #[error("file path escapes the store: {0}")]
    InvalidPath(Path),
    #[error("base path is not a directory")]
    NotDirectory,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An open staged file.
pub struct File {
    path: Path,
    inner: fs::File,
    size: u64,
}

impl File {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for File {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// A directory of staged files, shared by all deals of one market instance.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    /// Opens the store rooted at an existing directory.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, Error> {
        let base = base.into();
        if !base.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok(FileStore { base })
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
        if path.is_empty() || path.contains("..") || path.starts_with('/') {
            return Err(Error::InvalidPath(path.clone()));
        }
        Ok(self.base.join(path))
    }

    /// Opens an existing staged file for reading.
    pub fn open(&self, path: &Path) -> Result<File, Error> {
        let os_path = self.resolve(path)?;
        if !os_path.is_file() {
            return Err(Error::NotFound(path.clone()));
        }
        let inner = fs::File::open(&os_path)?;
        let size = inner.metadata()?.len();
        Ok(File {
            path: path.clone(),
            inner,
            size,
        })
    }

    /// Creates a staged file under a fresh random name.
    pub fn create_temp(&self) -> Result<File, Error> {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let path = format!("fstmp-{}", name);
        let os_path = self.base.join(&path);
        let inner = fs::File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(os_path)?;
        Ok(File {
            path,
            inner,
            size: 0,
        })
    }

    /// Removes a staged file. Deleting a file that is already gone only
    /// logs.
    pub fn delete(&self, path: &Path) -> Result<(), Error> {
        let os_path = self.resolve(path)?;
        if let Err(e) = fs::remove_file(os_path) {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!("staged file {} already deleted", path);
                return Ok(());
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_reopen_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.create_temp().unwrap();
        file.write_all(b"staged piece bytes").unwrap();
        assert_eq!(file.size(), 18);
        let path = file.path().clone();
        drop(file);

        let mut reopened = store.open(&path).unwrap();
        assert_eq!(reopened.size(), 18);
        let mut contents = String::new();
        reopened.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "staged piece bytes");

        store.delete(&path).unwrap();
        assert!(matches!(store.open(&path), Err(Error::NotFound(_))));
        // second delete is not an error
        store.delete(&path).unwrap();
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let escape = "../outside".to_string();
        assert!(matches!(store.open(&escape), Err(Error::InvalidPath(_))));
        assert!(matches!(
            store.open(&String::new()),
            Err(Error::InvalidPath(_))
        ));
    }
}
