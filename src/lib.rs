//! `ema-sort` is an external merge sort for files of fixed-width unsigned
//! 32-bit integers.
//!
//! External sorting is required when the data being sorted does not fit
//! into the main memory (RAM) of a computer. Sorting is achieved in two
//! passes: during the first pass the input is split into chunks that each
//! fit in RAM, sorted and persisted to temporary files; during the second
//! pass the sorted chunks are merged together with a k-way binary heap
//! merge. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! What sets this implementation apart is that every file access goes
//! through a fixed-capacity [`BlockCache`]: reads and writes of arbitrary
//! size and offset are turned into whole, memory-aligned blocks of a fixed
//! size, the transfer discipline unbuffered (direct) device I/O demands.
//! The cache evicts least-recently-used blocks under a global budget,
//! writing dirty ones back first.
//!
//! # Overview
//!
//! * **Two sort paths:**
//!   a chunk+merge path for files larger than memory and an in-memory path
//!   for files that fit, both driving the same cache abstraction and
//!   producing identical output.
//! * **Multithreading support:**
//!   chunk buffers are sorted in a rayon thread pool utilizing maximum CPU
//!   resources and reducing sorting time.
//! * **Verification and test data:**
//!   a streaming sortedness checker and a uniform-random file generator
//!   round out the pipeline.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ema_sort::{check_sorted, CacheConfig, CheckOutcome, ExternalSorterBuilder};
//!
//! fn main() {
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_chunk_size(8 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let total = sorter
//!         .sort(Path::new("input.dat"), Path::new("output.dat"))
//!         .unwrap();
//!     println!("sorted {} elements", total);
//!
//!     let verdict = check_sorted(Path::new("output.dat"), CacheConfig::default()).unwrap();
//!     assert_eq!(verdict, CheckOutcome::Sorted);
//! }
//! ```

pub mod cache;
pub mod check;
pub mod chunk;
pub mod element;
pub mod gen;
pub mod merger;
pub mod sort;

pub use cache::{BlockCache, CacheConfig, Fd, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE};
pub use check::{check_sorted, CheckError, CheckOutcome};
pub use element::{Element, ELEMENT_BYTES};
pub use gen::generate_random_file;
pub use merger::{BinaryHeapMerger, MergeError};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError};
