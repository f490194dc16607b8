//! Sorted chunk files and their merge cursors.
//!
//! The chunk sort stage partitions the input into runs of at most
//! `chunk_size` elements, sorts each run in memory and persists it to its
//! own temporary file. The merge stage later consumes those files through
//! [`ChunkCursor`]s, one in-flight element per chunk.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::cache::{BlockCache, Fd};
use crate::element::{self, Element, ELEMENT_BYTES};

/// Chunk persistence error.
#[derive(Debug)]
pub enum ChunkError {
    /// Chunk file creation failed.
    Open(io::Error),
    /// Writing or syncing chunk data failed.
    Write(io::Error),
}

impl Error for ChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match self {
            ChunkError::Open(err) => err,
            ChunkError::Write(err) => err,
        })
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::Open(err) => write!(f, "chunk file not created: {}", err),
            ChunkError::Write(err) => write!(f, "chunk data not written: {}", err),
        }
    }
}

/// Number of chunks a file of `elements` elements splits into.
pub fn chunk_count(elements: u64, chunk_size: usize) -> u64 {
    (elements + chunk_size as u64 - 1) / chunk_size as u64
}

/// Temporary file path for chunk `index` of `input`.
pub fn chunk_path(dir: &Path, input: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}_chunk_{}.dat", sanitize_file_name(input), index))
}

/// Replaces path separators in the input path so it can serve as a single
/// file name component.
fn sanitize_file_name(input: &Path) -> String {
    input
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// A sorted chunk persisted to its own temporary file. Never mutated after
/// creation; consumed and deleted by the merge stage.
#[derive(Debug)]
pub struct ChunkFile {
    path: PathBuf,
    index: u64,
}

impl ChunkFile {
    /// Sorts `values` in the given thread pool and persists them to the
    /// chunk file for `index`, fsynced and closed before returning.
    pub fn build(
        cache: &mut BlockCache,
        dir: &Path,
        input: &Path,
        index: u64,
        mut values: Vec<Element>,
        pool: &rayon::ThreadPool,
    ) -> Result<ChunkFile, ChunkError> {
        pool.install(|| values.par_sort_unstable());

        let path = chunk_path(dir, input, index);
        let fd = cache.create(&path).map_err(ChunkError::Open)?;

        let result = (|| {
            let mut bytes = Vec::with_capacity(values.len() * ELEMENT_BYTES);
            element::encode_into(&values, &mut bytes);
            cache.write(fd, &bytes)?;
            cache.fsync(fd)
        })();
        let closed = cache.close(fd);
        result.and(closed).map_err(ChunkError::Write)?;

        return Ok(ChunkFile { path, index });
    }

    /// Path of the chunk file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ordinal of the chunk within its input file.
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Read state over one chunk during the merge: the next unread offset lives
/// in the cache handle, exhaustion is tracked here.
pub struct ChunkCursor {
    chunk: ChunkFile,
    fd: Fd,
    exhausted: bool,
}

impl ChunkCursor {
    /// Opens the chunk for sequential reading.
    pub fn open(cache: &mut BlockCache, chunk: ChunkFile) -> io::Result<ChunkCursor> {
        let fd = cache.open(chunk.path())?;

        Ok(ChunkCursor {
            chunk,
            fd,
            exhausted: false,
        })
    }

    /// Fetches the next element, or `None` once the chunk is exhausted.
    /// A chunk ending in the middle of an element is a structural error.
    pub fn next(&mut self, cache: &mut BlockCache) -> io::Result<Option<Element>> {
        if self.exhausted {
            return Ok(None);
        }

        let value = element::read_one(cache, self.fd)?;
        if value.is_none() {
            self.exhausted = true;
        }

        Ok(value)
    }

    /// Closes the handle and deletes the chunk file.
    pub fn retire(self, cache: &mut BlockCache) -> io::Result<()> {
        cache.close(self.fd)?;
        fs::remove_file(self.chunk.path())
    }
}
