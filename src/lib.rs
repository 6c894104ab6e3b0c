//! A single-file, page-oriented key/value storage engine: fixed 4096-byte
//! pages, a B-Tree of `u32` keys over framed byte-string values, free-space
//! bookkeeping, and whole-file defragmentation. Single-threaded, strictly
//! synchronous -- every call blocks on the backing file.

pub mod btree;
pub mod data_page;
pub mod error;
pub mod file_manager;
pub mod io;
pub mod node;
pub mod page;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use error::EngineError;
pub use file_manager::FileManager;

const DEFAULT_BASE_DIR: &str = "databases";

fn resolve_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{}.db", name))
}

/// A handle on an open database file. Acquired by [`create`]/[`open`],
/// released by [`Db::close`], which flushes the FileHeader back to page 0.
pub struct Db {
    fm: FileManager,
}

impl Db {
    /// Create a fresh database named `name` under `databases/`.
    pub fn create(name: &str) -> Result<Self> {
        Self::create_in(Path::new(DEFAULT_BASE_DIR), name)
    }

    /// Create a fresh database named `name` under `base_dir` instead of the
    /// default `databases/` directory.
    pub fn create_in(base_dir: &Path, name: &str) -> Result<Self> {
        let path = resolve_path(base_dir, name);
        Ok(Db { fm: FileManager::create(path)? })
    }

    /// Open an existing database named `name` under `databases/`.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_in(Path::new(DEFAULT_BASE_DIR), name)
    }

    /// Open an existing database named `name` under `base_dir` instead of
    /// the default `databases/` directory.
    pub fn open_in(base_dir: &Path, name: &str) -> Result<Self> {
        let path = resolve_path(base_dir, name);
        Ok(Db { fm: FileManager::open(path)? })
    }

    /// Flush the FileHeader and release the handle.
    pub fn close(self) -> Result<()> {
        self.fm.close()
    }

    /// Insert `(key, value)`. Duplicates are silently ignored.
    pub fn insert(&mut self, key: u32, value: &[u8]) -> Result<()> {
        let result = btree::insert(&mut self.fm, key, value);
        self.fm.flush_header()?;
        result
    }

    /// Look up `key`, returning `(value, found)`.
    pub fn search(&mut self, key: u32) -> Result<(Vec<u8>, bool)> {
        let root = self.fm.header.root_node_id;
        match btree::search(&mut self.fm, root, key)? {
            Some(v) => Ok((v, true)),
            None => Ok((Vec::new(), false)),
        }
    }

    /// Delete `key`. Fails with `KeyNotFound` if absent.
    pub fn delete(&mut self, key: u32) -> Result<()> {
        let result = btree::delete(&mut self.fm, key);
        self.fm.flush_header()?;
        result
    }

    /// Render every page in the file as a human-readable summary line.
    pub fn visualize(&mut self) -> Result<String> {
        self.fm.visualize()
    }

    pub fn total_data_size(&self) -> u64 {
        self.fm.header.total_data_size
    }

    pub fn total_pages(&self) -> u32 {
        self.fm.header.total_pages
    }
}
