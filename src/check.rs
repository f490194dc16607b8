//! Sortedness checker.

use std::error::Error;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::Instant;

use crate::cache::{BlockCache, CacheConfig, Fd};
use crate::element::{Element, ELEMENT_BYTES};

/// Verdict of a sortedness scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every adjacent pair is non-decreasing.
    Sorted,
    /// The first violation found: `value` at element `index` is smaller
    /// than its predecessor. The scan stops here.
    NotSorted {
        index: u64,
        value: Element,
        prev: Element,
    },
}

/// Checker error.
#[derive(Debug)]
pub enum CheckError {
    /// File length is not a multiple of the element size.
    Malformed { len: u64 },
    /// Underlying I/O failure.
    Io(io::Error),
}

impl Error for CheckError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckError::Malformed { .. } => None,
            CheckError::Io(err) => Some(err),
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Malformed { len } => {
                write!(f, "file length {} is not a multiple of the element size", len)
            }
            CheckError::Io(err) => write!(f, "I/O operation failed: {}", err),
        }
    }
}

/// Streams `path` through a fresh cache in block-sized buffers and verifies
/// global non-decreasing order. The file is never mutated, so repeated
/// checks return the same verdict.
pub fn check_sorted(path: &Path, config: CacheConfig) -> Result<CheckOutcome, CheckError> {
    let started = Instant::now();
    let mut cache = BlockCache::new(config);

    let fd = cache.open(path).map_err(CheckError::Io)?;
    let result = scan(&mut cache, fd, config.block_size());
    let closed = cache.close(fd).map_err(CheckError::Io);

    let outcome = result?;
    closed?;

    log::debug!("sortedness check of {} took {:?}", path.display(), started.elapsed());
    Ok(outcome)
}

fn scan(cache: &mut BlockCache, fd: Fd, block_size: usize) -> Result<CheckOutcome, CheckError> {
    let len = cache.seek(fd, SeekFrom::End(0)).map_err(CheckError::Io)?;
    if len % ELEMENT_BYTES as u64 != 0 {
        return Err(CheckError::Malformed { len });
    }
    cache.seek(fd, SeekFrom::Start(0)).map_err(CheckError::Io)?;

    let mut buf = vec![0u8; block_size.max(ELEMENT_BYTES)];
    let mut prev: Option<Element> = None;
    let mut index = 0u64;

    loop {
        let got = cache.read(fd, &mut buf).map_err(CheckError::Io)?;
        if got == 0 {
            break;
        }

        for raw in buf[..got].chunks_exact(ELEMENT_BYTES) {
            let value = Element::from_ne_bytes(raw.try_into().expect("chunk is element sized"));
            if let Some(prev) = prev {
                if value < prev {
                    return Ok(CheckOutcome::NotSorted { index, value, prev });
                }
            }
            prev = Some(value);
            index += 1;
        }
    }

    Ok(CheckOutcome::Sorted)
}
