//! External sorter.

use std::error::Error;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;

use crate::cache::{BlockCache, CacheConfig, Fd};
use crate::chunk::{self, ChunkError, ChunkFile};
use crate::element::{self, Element, ELEMENT_BYTES};
use crate::merger::{BinaryHeapMerger, MergeError};

/// Sorting error, tagged with the stage that failed.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPool(rayon::ThreadPoolBuildError),
    /// File open or create failure.
    Open(io::Error),
    /// Read failure.
    Read(io::Error),
    /// Write failure.
    Write(io::Error),
    /// Seek failure.
    Seek(io::Error),
    /// Input file length is not a multiple of the element size.
    Malformed { len: u64 },
    /// Merged output element count does not match the input.
    SizeMismatch { expected: u64, written: u64 },
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPool(err) => Some(err),
            SortError::Open(err) => Some(err),
            SortError::Read(err) => Some(err),
            SortError::Write(err) => Some(err),
            SortError::Seek(err) => Some(err),
            SortError::Malformed { .. } | SortError::SizeMismatch { .. } => None,
        }
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPool(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Open(err) => write!(f, "file open failed: {}", err),
            SortError::Read(err) => write!(f, "read failed: {}", err),
            SortError::Write(err) => write!(f, "write failed: {}", err),
            SortError::Seek(err) => write!(f, "seek failed: {}", err),
            SortError::Malformed { len } => {
                write!(f, "file length {} is not a multiple of the element size", len)
            }
            SortError::SizeMismatch { expected, written } => {
                write!(f, "merge wrote {} elements, expected {}", written, expected)
            }
        }
    }
}

impl From<ChunkError> for SortError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Open(err) => SortError::Open(err),
            ChunkError::Write(err) => SortError::Write(err),
        }
    }
}

impl From<MergeError> for SortError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::Open(err) => SortError::Open(err),
            MergeError::Read(err) => SortError::Read(err),
            MergeError::Write(err) => SortError::Write(err),
        }
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`]
/// initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort chunk buffers in parallel.
    threads_number: Option<usize>,
    /// Directory the per-run temporary directory is created under.
    tmp_dir: Option<Box<Path>>,
    /// Chunk size in elements; [`None`] selects the in-memory path.
    chunk_size: Option<usize>,
    /// Cache geometry used for every file the sorter touches.
    cache_config: CacheConfig,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.chunk_size,
            self.cache_config,
        )
    }

    /// Sets number of threads to be used to sort chunk buffers in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets the chunk size in elements and selects the chunked path.
    ///
    /// # Panics
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> ExternalSorterBuilder {
        assert!(chunk_size > 0, "chunk size must be at least one element");
        self.chunk_size = Some(chunk_size);
        return self;
    }

    /// Sets the block cache geometry.
    pub fn with_cache_config(mut self, config: CacheConfig) -> ExternalSorterBuilder {
        self.cache_config = config;
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            chunk_size: None,
            cache_config: CacheConfig::default(),
        }
    }
}

/// External sorter.
///
/// Each call to [`sort`](ExternalSorter::sort) drives its own block cache:
/// cache instances are never shared across operations.
pub struct ExternalSorter {
    /// Chunk buffer sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory the per-run temporary directory is created under.
    tmp_dir: Option<Box<Path>>,
    /// Chunk size in elements; [`None`] selects the in-memory path.
    chunk_size: Option<usize>,
    /// Cache geometry used for every file the sorter touches.
    cache_config: CacheConfig,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort chunk
    ///   buffers in parallel. If the parameter is [`None`] threads number
    ///   will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If
    ///   parameter is [`None`] default OS temporary directory will be used.
    /// * `chunk_size` - Chunk size in elements. [`None`] selects the
    ///   in-memory sort path.
    /// * `cache_config` - Block cache geometry.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        chunk_size: Option<usize>,
        cache_config: CacheConfig,
    ) -> Result<Self, SortError> {
        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
            chunk_size,
            cache_config,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder.build().map_err(SortError::ThreadPool)?;

        return Ok(thread_pool);
    }

    /// Sorts `input` into `output`, returning the element count. The
    /// chunked or in-memory path is selected by the configured chunk size;
    /// both produce identical output for the same input.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<u64, SortError> {
        match self.chunk_size {
            Some(chunk_size) => self.sort_chunked(input, output, chunk_size),
            None => self.sort_in_memory(input, output),
        }
    }

    fn sort_chunked(&self, input: &Path, output: &Path, chunk_size: usize) -> Result<u64, SortError> {
        let started = Instant::now();
        let mut cache = BlockCache::new(self.cache_config);
        let run_dir = self.init_tmp_directory()?;

        let input_fd = cache.open(input).map_err(SortError::Open)?;
        let result = self.split_into_chunks(&mut cache, input_fd, input, run_dir.path(), chunk_size);
        let closed = cache.close(input_fd).map_err(SortError::Read);
        let (total, chunks) = result?;
        closed?;

        log::debug!("external sort preparation done");

        let output_fd = cache.create(output).map_err(SortError::Open)?;
        let result: Result<u64, SortError> = (|| {
            let written = BinaryHeapMerger::new(chunks).merge_into(&mut cache, output_fd)?;
            cache.fsync(output_fd).map_err(SortError::Write)?;
            Ok(written)
        })();
        let closed = cache.close(output_fd).map_err(SortError::Write);
        let written = result?;
        closed?;

        if written != total {
            return Err(SortError::SizeMismatch { expected: total, written });
        }

        if let Err(err) = run_dir.close() {
            log::warn!("temporary directory not removed: {}", err);
        }

        log::debug!("external sort of {} took {:?}", input.display(), started.elapsed());
        return Ok(total);
    }

    fn sort_in_memory(&self, input: &Path, output: &Path) -> Result<u64, SortError> {
        let started = Instant::now();
        let mut cache = BlockCache::new(self.cache_config);

        let input_fd = cache.open(input).map_err(SortError::Open)?;
        let result = self.read_all(&mut cache, input_fd);
        let closed = cache.close(input_fd).map_err(SortError::Read);
        let mut values = result?;
        closed?;

        log::info!("sorting {} elements in memory", values.len());
        self.thread_pool.install(|| values.par_sort_unstable());

        let total = values.len() as u64;
        let output_fd = cache.create(output).map_err(SortError::Open)?;
        let result: Result<(), SortError> = (|| {
            let mut bytes = Vec::with_capacity(values.len() * ELEMENT_BYTES);
            element::encode_into(&values, &mut bytes);
            cache.write(output_fd, &bytes).map_err(SortError::Write)?;
            cache.fsync(output_fd).map_err(SortError::Write)
        })();
        let closed = cache.close(output_fd).map_err(SortError::Write);
        result?;
        closed?;

        log::debug!("in-memory sort of {} took {:?}", input.display(), started.elapsed());
        return Ok(total);
    }

    fn init_tmp_directory(&self) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = self.tmp_dir.as_deref() {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// The chunk sort stage: reads the input chunk by chunk, each chunk
    /// sorted and persisted to its own temporary file.
    fn split_into_chunks(
        &self,
        cache: &mut BlockCache,
        input_fd: Fd,
        input: &Path,
        run_dir: &Path,
        chunk_size: usize,
    ) -> Result<(u64, Vec<ChunkFile>), SortError> {
        let total = self.input_elements(cache, input_fd)?;
        let count = chunk::chunk_count(total, chunk_size);
        log::info!("sorting {} chunks of up to {} elements", count, chunk_size);

        let mut chunks = Vec::with_capacity(count as usize);
        let mut remaining = total;
        for index in 0..count {
            let take = remaining.min(chunk_size as u64) as usize;
            let mut bytes = vec![0u8; take * ELEMENT_BYTES];
            let got = cache.read(input_fd, &mut bytes).map_err(SortError::Read)?;
            if got != bytes.len() {
                return Err(SortError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input file shorter than its reported length",
                )));
            }

            let values = element::decode_all(&bytes);
            let chunk = ChunkFile::build(cache, run_dir, input, index, values, &self.thread_pool)?;
            log::debug!("chunk {}/{} sorted and saved", index + 1, count);

            chunks.push(chunk);
            remaining -= take as u64;
        }

        return Ok((total, chunks));
    }

    /// Whole-file read for the in-memory path.
    fn read_all(&self, cache: &mut BlockCache, fd: Fd) -> Result<Vec<Element>, SortError> {
        let total = self.input_elements(cache, fd)?;

        let mut bytes = vec![0u8; (total * ELEMENT_BYTES as u64) as usize];
        let got = cache.read(fd, &mut bytes).map_err(SortError::Read)?;
        if got != bytes.len() {
            return Err(SortError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input file shorter than its reported length",
            )));
        }

        Ok(element::decode_all(&bytes))
    }

    /// Element count discovered by seeking to the end and back; a length
    /// that is not a multiple of the element size is malformed input.
    fn input_elements(&self, cache: &mut BlockCache, fd: Fd) -> Result<u64, SortError> {
        let len = cache.seek(fd, SeekFrom::End(0)).map_err(SortError::Seek)?;
        if len % ELEMENT_BYTES as u64 != 0 {
            return Err(SortError::Malformed { len });
        }
        cache.seek(fd, SeekFrom::Start(0)).map_err(SortError::Seek)?;

        Ok(len / ELEMENT_BYTES as u64)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rand::prelude::*;
    use rstest::*;

    use super::{ExternalSorterBuilder, SortError};
    use crate::cache::CacheConfig;
    use crate::check::{check_sorted, CheckOutcome};
    use crate::element::{Element, ELEMENT_BYTES};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_values(path: &Path, values: &[Element]) {
        let mut bytes = Vec::with_capacity(values.len() * ELEMENT_BYTES);
        for value in values {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        fs::write(path, bytes).unwrap();
    }

    fn read_values(path: &Path) -> Vec<Element> {
        fs::read(path)
            .unwrap()
            .chunks_exact(ELEMENT_BYTES)
            .map(|raw| Element::from_ne_bytes(raw.try_into().unwrap()))
            .collect()
    }

    #[rstest]
    fn test_chunked_sort_concrete_scenario(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");
        write_values(&input, &[5, 3, 8, 1, 7]);

        let sorter = ExternalSorterBuilder::new()
            .with_chunk_size(2)
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let total = sorter.sort(&input, &output).unwrap();

        assert_eq!(total, 5);
        assert_eq!(read_values(&output), vec![1, 3, 5, 7, 8]);
        assert_eq!(
            check_sorted(&output, CacheConfig::default()).unwrap(),
            CheckOutcome::Sorted
        );
    }

    #[rstest]
    fn test_chunk_files_cleaned_up_after_merge(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");
        write_values(&input, &[9, 2, 7, 7, 0, 4, 1]);

        let sorter = ExternalSorterBuilder::new()
            .with_chunk_size(3)
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        // the per-run directory and every chunk file in it are gone
        let leftovers: Vec<PathBuf> = fs::read_dir(tmp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| *path != input && *path != output)
            .collect();
        assert_eq!(leftovers, Vec::<PathBuf>::new());
    }

    #[rstest]
    #[case(None)]
    #[case(Some(16))]
    fn test_round_trip_preserves_multiset(#[case] chunk_size: Option<usize>) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");

        let mut rng = StdRng::seed_from_u64(42);
        let values: Vec<Element> = (0..500).map(|_| rng.gen::<Element>() % 100).collect();
        write_values(&input, &values);

        let mut builder = ExternalSorterBuilder::new()
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path());
        if let Some(chunk_size) = chunk_size {
            builder = builder.with_chunk_size(chunk_size);
        }
        let sorter = builder.build().unwrap();

        let total = sorter.sort(&input, &output).unwrap();
        assert_eq!(total, values.len() as u64);

        let mut expected = values;
        expected.sort_unstable();
        assert_eq!(read_values(&output), expected);
    }

    #[rstest]
    fn test_in_memory_and_chunked_agree(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.dat");
        let out_mem = tmp_dir.path().join("out_mem.dat");
        let out_chunked = tmp_dir.path().join("out_chunked.dat");

        let mut rng = StdRng::seed_from_u64(1);
        let values: Vec<Element> = (0..300).map(|_| rng.gen()).collect();
        write_values(&input, &values);

        let in_memory = ExternalSorterBuilder::new()
            .with_threads_number(2)
            .build()
            .unwrap();
        let chunked = ExternalSorterBuilder::new()
            .with_threads_number(2)
            .with_chunk_size(64)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        in_memory.sort(&input, &out_mem).unwrap();
        chunked.sort(&input, &out_chunked).unwrap();

        assert_eq!(fs::read(&out_mem).unwrap(), fs::read(&out_chunked).unwrap());
    }

    #[rstest]
    #[case(None)]
    #[case(Some(4))]
    fn test_empty_input_sorts_to_empty_output(#[case] chunk_size: Option<usize>) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");
        write_values(&input, &[]);

        let mut builder = ExternalSorterBuilder::new()
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path());
        if let Some(chunk_size) = chunk_size {
            builder = builder.with_chunk_size(chunk_size);
        }
        let sorter = builder.build().unwrap();

        assert_eq!(sorter.sort(&input, &output).unwrap(), 0);
        assert_eq!(fs::metadata(&output).unwrap().len(), 0);
        assert_eq!(
            check_sorted(&output, CacheConfig::default()).unwrap(),
            CheckOutcome::Sorted
        );
    }

    #[rstest]
    fn test_malformed_input_length_is_rejected(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");
        fs::write(&input, [0u8; 6]).unwrap();

        let sorter = ExternalSorterBuilder::new()
            .with_chunk_size(2)
            .with_threads_number(2)
            .build()
            .unwrap();

        assert!(matches!(
            sorter.sort(&input, &output),
            Err(SortError::Malformed { len: 6 })
        ));
    }

    #[rstest]
    fn test_sort_under_tiny_cache_pressure(tmp_dir: tempfile::TempDir) {
        // a 4-slot cache of 16-byte blocks forces constant eviction across
        // the input, chunk and output handles
        let input = tmp_dir.path().join("input.dat");
        let output = tmp_dir.path().join("output.dat");

        let mut rng = StdRng::seed_from_u64(3);
        let values: Vec<Element> = (0..200).map(|_| rng.gen()).collect();
        write_values(&input, &values);

        let sorter = ExternalSorterBuilder::new()
            .with_chunk_size(16)
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .with_cache_config(CacheConfig::new(16, 4))
            .build()
            .unwrap();

        sorter.sort(&input, &output).unwrap();

        let mut expected = values;
        expected.sort_unstable();
        assert_eq!(read_values(&output), expected);
    }
}
