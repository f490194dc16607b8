//! Block-aligned LRU file cache.
//!
//! Every file access in this crate goes through [`BlockCache`]: a small
//! POSIX-like surface (`open`/`close`/`read`/`write`/`seek`/`fsync`) that
//! internally stages data in fixed-size blocks, aligned in memory to the
//! block size as unbuffered device transfers require. Callers read and
//! write at byte granularity and arbitrary offsets; the cache turns that
//! into whole-block transfers and evicts the least-recently-used block once
//! the global capacity is reached, flushing it first if it is dirty.
//!
//! A cache instance is owned and driven by a single operation; it is never
//! shared across concurrent sorts.

use std::alloc::{self, Layout};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, prelude::*, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default cache capacity in blocks, shared across all open handles.
pub const DEFAULT_BLOCK_COUNT: usize = 1024;

/// Cache geometry: block size and resident block budget.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    block_size: usize,
    block_count: usize,
}

impl CacheConfig {
    /// Creates a cache configuration.
    ///
    /// # Panics
    /// Panics if `block_size` is not a power of two or `block_count` is
    /// zero.
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");
        assert!(block_count > 0, "cache capacity must be at least one block");

        CacheConfig {
            block_size,
            block_count,
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Cache capacity in blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::new(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_COUNT)
    }
}

/// Handle to a file opened through the cache. Valid until passed to
/// [`BlockCache::close`]; every operation on a closed handle fails with an
/// `InvalidInput` error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Fd(usize);

/// Fixed-size byte buffer aligned to its own length.
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn zeroed(layout: Layout) -> AlignedBuf {
        // SAFETY: the layout has a nonzero, power-of-two size validated in
        // `CacheConfig::new`.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        AlignedBuf { ptr, layout }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the allocation is `layout.size()` bytes and outlives the
        // returned slice.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `Deref`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A resident cache block.
struct Block {
    buf: AlignedBuf,
    dirty: bool,
}

/// Owning handle plus block index.
type BlockKey = (Fd, u64);

struct OpenFile {
    file: fs::File,
    /// Logical read/write position.
    pos: u64,
    /// Logical file length, including data still dirty in cache.
    len: u64,
}

/// Fixed-capacity block cache over a set of open files.
///
/// The capacity is a global budget: blocks of all open handles compete for
/// the same `block_count` slots and eviction is handle-agnostic.
pub struct BlockCache {
    config: CacheConfig,
    block_layout: Layout,
    files: Vec<Option<OpenFile>>,
    blocks: HashMap<BlockKey, Block>,
    /// Access order, least recently used at the front.
    lru: VecDeque<BlockKey>,
}

impl BlockCache {
    /// Creates an empty cache with the given geometry.
    pub fn new(config: CacheConfig) -> Self {
        let block_layout = Layout::from_size_align(config.block_size(), config.block_size())
            .expect("block size is a validated power of two");

        BlockCache {
            config,
            block_layout,
            files: Vec::new(),
            blocks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    /// Cache geometry.
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Opens `path`, creating the file if absent. Existing contents are
    /// preserved and the position starts at zero.
    pub fn open(&mut self, path: impl AsRef<Path>) -> io::Result<Fd> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(self.install(file, len))
    }

    /// Opens `path` for writing, creating the file if absent and truncating
    /// it to zero length otherwise.
    pub fn create(&mut self, path: impl AsRef<Path>) -> io::Result<Fd> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(self.install(file, 0))
    }

    fn install(&mut self, file: fs::File, len: u64) -> Fd {
        let entry = OpenFile { file, pos: 0, len };

        match self.files.iter().position(|slot| slot.is_none()) {
            Some(idx) => {
                self.files[idx] = Some(entry);
                Fd(idx)
            }
            None => {
                self.files.push(Some(entry));
                Fd(self.files.len() - 1)
            }
        }
    }

    /// Logical length of the file, including unflushed data.
    pub fn len(&self, fd: Fd) -> io::Result<u64> {
        Ok(self.entry(fd)?.len)
    }

    /// Reads up to `buf.len()` bytes at the handle's current position,
    /// advancing it. The count returned is short only at end of file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let (pos, len) = {
            let entry = self.entry(fd)?;
            (entry.pos, entry.len)
        };
        let wanted = (buf.len() as u64).min(len.saturating_sub(pos)) as usize;
        let block_size = self.config.block_size;

        let mut done = 0;
        while done < wanted {
            let at = pos + done as u64;
            let block_index = at / block_size as u64;
            let in_block = (at % block_size as u64) as usize;
            let take = (block_size - in_block).min(wanted - done);
            let key = (fd, block_index);

            if in_block == 0 && take == block_size && !self.blocks.contains_key(&key) {
                // Aligned whole-block miss: transfer directly without
                // making the block resident. Resident blocks are always
                // served from cache so dirty data is never bypassed.
                self.transfer_from_file(fd, at, &mut buf[done..done + take])?;
            } else {
                let block = self.fetch(fd, block_index)?;
                buf[done..done + take].copy_from_slice(&block.buf[in_block..in_block + take]);
            }

            done += take;
        }

        self.entry_mut(fd)?.pos = pos + done as u64;
        Ok(done)
    }

    /// Writes the whole of `buf` at the handle's current position, advancing
    /// it and extending the logical length when writing past the end.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let pos = self.entry(fd)?.pos;
        let block_size = self.config.block_size;

        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let block_index = at / block_size as u64;
            let in_block = (at % block_size as u64) as usize;
            let take = (block_size - in_block).min(buf.len() - done);
            let key = (fd, block_index);

            if in_block == 0 && take == block_size && !self.blocks.contains_key(&key) {
                // Aligned whole-block miss: write through without residency.
                self.transfer_to_file(fd, at, &buf[done..done + take])?;
            } else {
                let block = self.fetch(fd, block_index)?;
                block.buf[in_block..in_block + take].copy_from_slice(&buf[done..done + take]);
                block.dirty = true;
            }

            done += take;

            // The length must cover dirty data before any later eviction
            // writes it back, so it is advanced span by span.
            let entry = self.entry_mut(fd)?;
            entry.len = entry.len.max(at + take as u64);
        }

        self.entry_mut(fd)?.pos = pos + done as u64;
        Ok(done)
    }

    /// Repositions the handle. Block residency and contents are unaffected.
    /// `SeekFrom::End` is relative to the logical length.
    pub fn seek(&mut self, fd: Fd, pos: SeekFrom) -> io::Result<u64> {
        let entry = self.entry_mut(fd)?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => entry.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => entry.len.checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        entry.pos = target;

        Ok(target)
    }

    /// Flushes every dirty block owned by `fd` to the underlying file and
    /// syncs it. Flushed blocks stay resident with their dirty flag cleared.
    pub fn fsync(&mut self, fd: Fd) -> io::Result<()> {
        self.entry(fd)?;

        let keys: Vec<BlockKey> = self.lru.iter().filter(|key| key.0 == fd).copied().collect();
        for key in keys {
            let block = match self.blocks.get_mut(&key) {
                Some(block) if block.dirty => block,
                _ => continue,
            };
            let entry = self
                .files
                .get_mut(key.0 .0)
                .and_then(|slot| slot.as_mut())
                .ok_or_else(bad_handle)?;

            write_back(&mut entry.file, self.config.block_size, entry.len, key, &block.buf)?;
            block.dirty = false;
        }

        self.entry_mut(fd)?.file.sync_all()
    }

    /// Flushes and evicts every block owned by the handle, then releases the
    /// underlying file. The handle is invalid afterwards, on every path: a
    /// flush failure is reported but the file is still released.
    pub fn close(&mut self, fd: Fd) -> io::Result<()> {
        self.entry(fd)?;

        let keys: Vec<BlockKey> = self.lru.iter().filter(|key| key.0 == fd).copied().collect();
        let mut first_err = None;

        for key in keys {
            let block = match self.blocks.remove(&key) {
                Some(block) => block,
                None => continue,
            };
            if !block.dirty {
                continue;
            }
            if let Some(entry) = self.files.get_mut(key.0 .0).and_then(|slot| slot.as_mut()) {
                let flushed =
                    write_back(&mut entry.file, self.config.block_size, entry.len, key, &block.buf);
                if let Err(err) = flushed {
                    first_err.get_or_insert(err);
                }
            }
        }

        self.lru.retain(|key| key.0 != fd);
        self.files[fd.0] = None;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Makes the block resident and most recently used, reading it from the
    /// file on a miss.
    fn fetch(&mut self, fd: Fd, block_index: u64) -> io::Result<&mut Block> {
        let key = (fd, block_index);

        if self.blocks.contains_key(&key) {
            self.touch(key);
        } else {
            self.evict_to_capacity()?;

            let mut buf = AlignedBuf::zeroed(self.block_layout);
            let offset = block_index * self.config.block_size as u64;
            self.transfer_from_file(fd, offset, &mut buf)?;

            self.blocks.insert(key, Block { buf, dirty: false });
            self.lru.push_back(key);
        }

        Ok(self.blocks.get_mut(&key).expect("block is resident"))
    }

    /// Marks the key most recently used.
    fn touch(&mut self, key: BlockKey) {
        if self.lru.back() == Some(&key) {
            return;
        }
        if let Some(at) = self.lru.iter().position(|k| *k == key) {
            self.lru.remove(at);
        }
        self.lru.push_back(key);
    }

    /// Evicts least-recently-used blocks until one slot is free, flushing
    /// dirty victims. A flush failure surfaces to the caller that triggered
    /// the eviction.
    fn evict_to_capacity(&mut self) -> io::Result<()> {
        while self.blocks.len() >= self.config.block_count {
            let victim = match self.lru.pop_front() {
                Some(key) => key,
                None => break,
            };
            let block = match self.blocks.remove(&victim) {
                Some(block) => block,
                None => continue,
            };

            if block.dirty {
                log::trace!("evicting dirty block {} of handle {:?}", victim.1, victim.0);
                let entry = self
                    .files
                    .get_mut(victim.0 .0)
                    .and_then(|slot| slot.as_mut())
                    .ok_or_else(bad_handle)?;
                write_back(&mut entry.file, self.config.block_size, entry.len, victim, &block.buf)?;
            }
        }

        Ok(())
    }

    /// Reads `buf.len()` bytes of the underlying file at `offset`. Regions
    /// past the physical end (unwritten holes) read as zeros.
    fn transfer_from_file(&mut self, fd: Fd, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = &mut self.entry_mut(fd)?.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        buf[filled..].fill(0);

        Ok(())
    }

    /// Writes `buf` to the underlying file at `offset`.
    fn transfer_to_file(&mut self, fd: Fd, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = &mut self.entry_mut(fd)?.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn entry(&self, fd: Fd) -> io::Result<&OpenFile> {
        self.files
            .get(fd.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(bad_handle)
    }

    fn entry_mut(&mut self, fd: Fd) -> io::Result<&mut OpenFile> {
        self.files
            .get_mut(fd.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(bad_handle)
    }
}

/// Writes a block back to its file, clamped to the logical length so a tail
/// block never pads the file past what was written.
fn write_back(
    file: &mut fs::File,
    block_size: usize,
    file_len: u64,
    key: BlockKey,
    buf: &[u8],
) -> io::Result<()> {
    let offset = key.1 * block_size as u64;
    let valid = file_len.saturating_sub(offset).min(block_size as u64) as usize;
    if valid == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&buf[..valid])
}

fn bad_handle() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "file handle is closed or invalid")
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::SeekFrom;
    use std::path::PathBuf;

    use rstest::*;

    use super::{BlockCache, CacheConfig};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn tmp_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    fn small_cache() -> BlockCache {
        BlockCache::new(CacheConfig::new(16, 4))
    }

    #[rstest]
    fn test_sub_block_read_assembly(tmp_dir: tempfile::TempDir) {
        // A 10-byte read at offset 6 must come back correct even though the
        // cache fetches whole 4096-byte blocks underneath.
        let path = tmp_file(&tmp_dir, "data.bin");
        let content: Vec<u8> = (0u8..64).collect();
        fs::write(&path, &content).unwrap();

        let mut cache = BlockCache::new(CacheConfig::default());
        let fd = cache.open(&path).unwrap();

        cache.seek(fd, SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(cache.read(fd, &mut buf).unwrap(), 10);
        assert_eq!(&buf, &content[6..16]);

        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_unaligned_write_read_round_trip(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        // Spans three 16-byte blocks, none of the spans block aligned.
        let payload: Vec<u8> = (0u8..40).collect();
        cache.seek(fd, SeekFrom::Start(5)).unwrap();
        assert_eq!(cache.write(fd, &payload).unwrap(), payload.len());

        cache.seek(fd, SeekFrom::Start(5)).unwrap();
        let mut back = vec![0u8; payload.len()];
        assert_eq!(cache.read(fd, &mut back).unwrap(), payload.len());
        assert_eq!(back, payload);

        assert_eq!(cache.len(fd).unwrap(), 45);
        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_eviction_flushes_dirty_blocks(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        // Unaligned writes keep every block resident and dirty; writing ten
        // 10-byte records through a 4-block cache forces evictions.
        for i in 0u8..10 {
            let record = [i; 10];
            cache.write(fd, &record).unwrap();
        }
        assert!(cache.blocks.len() <= 4);

        cache.close(fd).unwrap();

        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 100);
        for i in 0usize..10 {
            assert!(on_disk[i * 10..(i + 1) * 10].iter().all(|b| *b == i as u8));
        }
    }

    #[rstest]
    fn test_close_flushes_and_invalidates(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        cache.write(fd, b"hello").unwrap();
        cache.close(fd).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        let mut buf = [0u8; 1];
        assert!(cache.read(fd, &mut buf).is_err());
        assert!(cache.close(fd).is_err());
    }

    #[rstest]
    fn test_fsync_flushes_but_keeps_blocks(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        cache.write(fd, b"abc").unwrap();
        cache.fsync(fd).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"abc");
        assert_eq!(cache.blocks.len(), 1);

        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_tail_block_is_not_padded(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        // 21 bytes dirty a full block plus a 5-byte tail; the flush must
        // not grow the file to a block multiple.
        cache.write(fd, &[7u8; 21]).unwrap();
        cache.close(fd).unwrap();

        assert_eq!(fs::read(&path).unwrap().len(), 21);
    }

    #[rstest]
    fn test_aligned_read_sees_dirty_resident_block(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();

        // Block 0 becomes resident and dirty through a sub-block write;
        // a full-block read afterwards must be served from the cache, not
        // from the (still empty) file.
        cache.write(fd, &[9u8; 16]).unwrap();
        cache.seek(fd, SeekFrom::Start(0)).unwrap();
        cache.write(fd, b"xy").unwrap();

        cache.seek(fd, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(cache.read(fd, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..2], b"xy");
        assert!(buf[2..].iter().all(|b| *b == 9));

        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_seek_whence_semantics(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();
        cache.write(fd, &[0u8; 32]).unwrap();

        assert_eq!(cache.seek(fd, SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(cache.seek(fd, SeekFrom::Current(8)).unwrap(), 12);
        assert_eq!(cache.seek(fd, SeekFrom::Current(-2)).unwrap(), 10);
        assert_eq!(cache.seek(fd, SeekFrom::End(0)).unwrap(), 32);
        assert_eq!(cache.seek(fd, SeekFrom::End(-32)).unwrap(), 0);
        assert!(cache.seek(fd, SeekFrom::End(-33)).is_err());

        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_read_past_eof_is_short(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        fs::write(&path, b"1234").unwrap();

        let mut cache = small_cache();
        let fd = cache.open(&path).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(cache.read(fd, &mut buf).unwrap(), 4);
        assert_eq!(cache.read(fd, &mut buf).unwrap(), 0);

        cache.close(fd).unwrap();
    }

    #[rstest]
    fn test_create_truncates_existing_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_file(&tmp_dir, "data.bin");
        fs::write(&path, &[1u8; 64]).unwrap();

        let mut cache = small_cache();
        let fd = cache.create(&path).unwrap();
        assert_eq!(cache.len(fd).unwrap(), 0);
        cache.write(fd, b"new").unwrap();
        cache.close(fd).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[rstest]
    fn test_capacity_is_shared_across_handles(tmp_dir: tempfile::TempDir) {
        let mut cache = small_cache();
        let a = cache.create(tmp_file(&tmp_dir, "a.bin")).unwrap();
        let b = cache.create(tmp_file(&tmp_dir, "b.bin")).unwrap();

        for _ in 0..5 {
            cache.write(a, &[1u8; 10]).unwrap();
            cache.write(b, &[2u8; 10]).unwrap();
        }
        assert!(cache.blocks.len() <= 4);

        cache.close(a).unwrap();
        cache.close(b).unwrap();

        assert_eq!(fs::read(tmp_file(&tmp_dir, "a.bin")).unwrap(), [1u8; 50]);
        assert_eq!(fs::read(tmp_file(&tmp_dir, "b.bin")).unwrap(), [2u8; 50]);
    }
}
