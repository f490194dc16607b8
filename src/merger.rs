//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;
use std::fmt;
use std::io;

use crate::cache::{BlockCache, Fd};
use crate::chunk::{ChunkCursor, ChunkFile};
use crate::element;

/// Merge error, tagged with the side of the transfer that failed.
#[derive(Debug)]
pub enum MergeError {
    /// Opening a chunk file failed.
    Open(io::Error),
    /// Reading or retiring a chunk failed.
    Read(io::Error),
    /// Writing the merged output failed.
    Write(io::Error),
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match self {
            MergeError::Open(err) => err,
            MergeError::Read(err) => err,
            MergeError::Write(err) => err,
        })
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Open(err) => write!(f, "chunk file not opened for merging: {}", err),
            MergeError::Read(err) => write!(f, "chunk data not read: {}", err),
            MergeError::Write(err) => write!(f, "merged output not written: {}", err),
        }
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted chunk files into a single sorted output stream.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number
/// of elements, *n* is the number of chunks; memory is bounded by one
/// in-flight element per chunk.
pub struct BinaryHeapMerger {
    chunks: Vec<ChunkFile>,
}

impl BinaryHeapMerger {
    /// Creates an instance of a binary heap merger using chunk files as
    /// inputs. Chunks should be sorted in ascending order otherwise the
    /// result is undefined.
    pub fn new(chunks: Vec<ChunkFile>) -> Self {
        BinaryHeapMerger { chunks }
    }

    /// Streams the merged order to `output` through the cache, deleting
    /// each chunk file as it is exhausted. Returns the number of elements
    /// written.
    pub fn merge_into(mut self, cache: &mut BlockCache, output: Fd) -> Result<u64, MergeError> {
        let mut cursors: Vec<Option<ChunkCursor>> = Vec::with_capacity(self.chunks.len());
        // binary heap is max-heap by default so both sides are reversed to
        // pop the smallest value first, ties broken by the lowest chunk index
        let mut items = BinaryHeap::with_capacity(self.chunks.len());

        for (index, chunk) in self.chunks.drain(..).enumerate() {
            let mut cursor = ChunkCursor::open(cache, chunk).map_err(MergeError::Open)?;
            match cursor.next(cache).map_err(MergeError::Read)? {
                Some(value) => {
                    items.push((Reverse(value), Reverse(index)));
                    cursors.push(Some(cursor));
                }
                None => {
                    // an empty chunk contributes nothing
                    cursor.retire(cache).map_err(MergeError::Read)?;
                    cursors.push(None);
                }
            }
        }

        let mut written = 0u64;
        while let Some((Reverse(value), Reverse(index))) = items.pop() {
            element::write_one(cache, output, value).map_err(MergeError::Write)?;
            written += 1;

            let refill = match cursors[index].as_mut() {
                Some(cursor) => cursor.next(cache).map_err(MergeError::Read)?,
                None => None,
            };
            match refill {
                Some(value) => items.push((Reverse(value), Reverse(index))),
                None => {
                    if let Some(cursor) = cursors[index].take() {
                        cursor.retire(cache).map_err(MergeError::Read)?;
                    }
                }
            }
        }

        return Ok(written);
    }
}
