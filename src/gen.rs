//! Random test-file generation.
//!
//! The generator is the crate's only source of test data; any uniform
//! 32-bit generator plugs in through [`rand::Rng`].

use std::io;
use std::path::Path;
use std::time::Instant;

use rand::Rng;

use crate::cache::{BlockCache, CacheConfig};
use crate::element::{Element, ELEMENT_BYTES};

/// Fills `path` with `elements` uniform random values, written through the
/// cache one block-sized batch at a time. The emitted length is always a
/// multiple of the element size.
pub fn generate_random_file<R: Rng>(
    path: &Path,
    elements: u64,
    rng: &mut R,
    config: CacheConfig,
) -> io::Result<()> {
    let started = Instant::now();
    let mut cache = BlockCache::new(config);

    let fd = cache.create(path)?;
    let result = (|| {
        let batch_elements = (config.block_size() / ELEMENT_BYTES).max(1);
        let mut batch = vec![0u8; batch_elements * ELEMENT_BYTES];

        let mut written = 0u64;
        while written < elements {
            let take = (elements - written).min(batch_elements as u64) as usize;
            for slot in batch.chunks_exact_mut(ELEMENT_BYTES).take(take) {
                slot.copy_from_slice(&rng.gen::<Element>().to_ne_bytes());
            }

            cache.write(fd, &batch[..take * ELEMENT_BYTES])?;
            written += take as u64;
        }

        cache.fsync(fd)
    })();
    let closed = cache.close(fd);
    result.and(closed)?;

    log::debug!(
        "generated {} random elements into {} in {:?}",
        elements,
        path.display(),
        started.elapsed()
    );
    return Ok(());
}
