//! Per-package state files owned by the package in flight.
//!
//! A key-value pass works with three files per package: the saved state
//! from the last successful pass, the new state the agent writes, and the
//! data blob handed to the transport. [`PackageFiles`] owns the new state
//! and the data blob: committing renames the new state over the saved one,
//! and dropping without committing deletes both.

use crate::error::CoreResult;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// The state files of one package.
#[derive(Debug)]
pub struct PackageFiles {
    package: String,
    saved_state: PathBuf,
    new_state: PathBuf,
    data: PathBuf,
    committed: bool,
}

impl PackageFiles {
    /// Creates empty new-state and data files for `package`.
    pub fn create(state_dir: &Path, data_dir: &Path, package: &str, suffix: &str) -> CoreResult<Self> {
        fs::create_dir_all(state_dir)?;
        fs::create_dir_all(data_dir)?;
        let files = Self {
            package: package.to_string(),
            saved_state: state_dir.join(package),
            new_state: state_dir.join(format!("{package}.new")),
            data: data_dir.join(format!("{package}.{suffix}")),
            committed: false,
        };
        File::create(&files.new_state)?;
        File::create(&files.data)?;
        Ok(files)
    }

    /// The package these files belong to.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Opens the saved state for reading, if there is any.
    pub fn open_saved_state(&self) -> CoreResult<Option<File>> {
        match File::open(&self.saved_state) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the saved state so the agent starts from scratch.
    pub fn discard_saved_state(&self) -> CoreResult<()> {
        remove_if_exists(&self.saved_state)?;
        Ok(())
    }

    /// Returns true if the saved state is missing or empty.
    #[must_use]
    pub fn saved_state_is_empty(&self) -> bool {
        fs::metadata(&self.saved_state).map_or(true, |m| m.len() == 0)
    }

    /// Opens the new-state file for writing.
    pub fn open_new_state(&self) -> CoreResult<File> {
        Ok(OpenOptions::new().write(true).truncate(true).open(&self.new_state)?)
    }

    /// Opens the data file for writing.
    pub fn open_data_for_write(&self) -> CoreResult<File> {
        Ok(OpenOptions::new().write(true).truncate(true).open(&self.data)?)
    }

    /// Opens the data file for reading.
    pub fn open_data(&self) -> CoreResult<File> {
        Ok(File::open(&self.data)?)
    }

    /// Reads the whole data file.
    pub fn read_data(&self) -> CoreResult<Vec<u8>> {
        Ok(fs::read(&self.data)?)
    }

    /// Replaces the data file's content.
    pub fn write_data(&self, bytes: &[u8]) -> CoreResult<()> {
        fs::write(&self.data, bytes)?;
        Ok(())
    }

    /// Size of the data file.
    pub fn data_len(&self) -> CoreResult<u64> {
        Ok(fs::metadata(&self.data)?.len())
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data
    }

    /// Moves the new state into place and deletes the data blob.
    pub fn commit(mut self) -> CoreResult<()> {
        fs::rename(&self.new_state, &self.saved_state)?;
        self.committed = true;
        remove_if_exists(&self.data)?;
        Ok(())
    }
}

impl Drop for PackageFiles {
    fn drop(&mut self) {
        let mut leftovers = vec![&self.data];
        if !self.committed {
            leftovers.push(&self.new_state);
        }
        for path in leftovers {
            if let Err(e) = remove_if_exists(path) {
                tracing::warn!(package = %self.package, path = %path.display(), error = %e, "failed to delete state file");
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn commit_rotates_state() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let data = dir.path().join("data");

        let files = PackageFiles::create(&state, &data, "p", "data").unwrap();
        assert!(files.open_saved_state().unwrap().is_none());
        assert!(files.saved_state_is_empty());
        files.open_new_state().unwrap().write_all(b"v1").unwrap();
        files.commit().unwrap();

        assert_eq!(fs::read(state.join("p")).unwrap(), b"v1");
        assert!(!state.join("p.new").exists());
        assert!(!data.join("p.data").exists());
    }

    #[test]
    fn drop_discards_uncommitted_files() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let data = dir.path().join("data");
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join("p"), b"old").unwrap();

        {
            let files = PackageFiles::create(&state, &data, "p", "data").unwrap();
            files.write_data(b"payload").unwrap();
            files.open_new_state().unwrap().write_all(b"new").unwrap();
        }

        assert_eq!(fs::read(state.join("p")).unwrap(), b"old");
        assert!(!state.join("p.new").exists());
        assert!(!data.join("p.data").exists());
    }
}
