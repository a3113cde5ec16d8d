/*!
Abstract filesystem capability

The engine is parameterized over an abstract filesystem so that migrations
coming from a real directory tree and migrations bundled into the binary
(via `include_str!`) can be reconciled with identical planning logic. Only
two operations are needed: list entries in a directory, and read a file's
contents.
*/
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::*;

/// One file found while listing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Path relative to the scanned root, with only the basename meaningful
    /// to the caller (the parser only cares about the filename).
    pub path: PathBuf,
}

/// A source of migration file bytes. Implemented by `RealFs` (an on-disk
/// directory tree) and `MemFs` (an in-memory / embedded-at-compile-time
/// stand-in used by tests and by consumers embedding migrations in their
/// binary).
pub trait MigrationFs {
    /// Recursively list every entry under `dir`, relative to nothing in
    /// particular -- callers only use the returned paths' file names.
    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Read a file's full contents as bytes.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
}

/// The real, on-disk filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl MigrationFs for RealFs {
    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).into_iter() {
            let entry = entry.map_err(|e| {
                Error::from(ErrorKind::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            })?;
            if entry.file_type().is_file() {
                entries.push(DirEntry {
                    path: entry.path().to_owned(),
                });
            }
        }
        Ok(entries)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).chain_err(|| format!("failed reading migration file: {:?}", path))
    }
}

/// An in-memory filesystem, useful both for unit tests and for consumers
/// who embed migration files in their binary with `include_str!` and want
/// to drive the same engine used for on-disk migrations.
#[derive(Debug, Default, Clone)]
pub struct MemFs {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file<P: Into<PathBuf>, B: Into<Vec<u8>>>(mut self, path: P, contents: B) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    pub fn insert<P: Into<PathBuf>, B: Into<Vec<u8>>>(&mut self, path: P, contents: B) {
        self.files.insert(path.into(), contents.into());
    }
}

impl MigrationFs for MemFs {
    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        Ok(self
            .files
            .keys()
            .filter(|p| p.starts_with(dir))
            .map(|p| DirEntry { path: p.clone() })
            .collect())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::NotFound(format!("no such file: {:?}", path))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfs_lists_only_prefixed_entries() {
        let fs = MemFs::new()
            .with_file("migrations/100_a.sql", "-- migrate:up\n-- migrate:down\n")
            .with_file("other/100_b.sql", "-- migrate:up\n-- migrate:down\n");
        let entries = fs.list_dir(Path::new("migrations")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from("migrations/100_a.sql"));
    }

    #[test]
    fn memfs_read_missing_file_errors() {
        let fs = MemFs::new();
        assert!(fs.read_file(Path::new("nope.sql")).is_err());
    }
}
