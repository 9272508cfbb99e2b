//! Persistent memory pool.
//!
//! The tree lives inside a single contiguous mapping. The first page holds a
//! [`Superblock`] with the root slot and the allocator cursor, everything after
//! it is handed out in cache-line sized chunks. All references between objects
//! in the pool are offsets from the start of the mapping, so a pool file can be
//! mapped at a different address in the next process.
//!
//! The free lists are volatile. After a restart they are rebuilt from the gaps
//! between live objects by [`PmPool::rebuild_free_lists`].

use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    mem::{align_of, size_of},
    path::{Path, PathBuf},
    ptr::{self, NonNull},
    sync::atomic::{fence, AtomicU64, Ordering},
};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::{tagged_pointer::OFFSET_ALIGNMENT, Error, FlushMode, LeafLayout, PoolConfig, Result};

/// "PARTPOOL" in little endian.
const POOL_MAGIC: u64 = u64::from_le_bytes(*b"PARTPOOL");

/// Version of the on-pool layout.
const POOL_LAYOUT_VERSION: u64 = 1;

/// Offset of the first allocatable byte.
pub const DATA_START: u64 = 4096;

/// Offsets must fit below this bound so that buckets can pack a fingerprint
/// into the upper bits of a slot.
pub const MAX_POOL_CAPACITY: u64 = 1 << 48;

/// Smallest pool that can hold a root node and a few buckets.
pub const MIN_POOL_CAPACITY: u64 = DATA_START + 64 * 1024;

/// Round `size` up to the allocation granularity of the pool.
pub const fn round_to_cache_line(size: usize) -> usize {
    let align = OFFSET_ALIGNMENT as usize;
    size.div_ceil(align) * align
}

/// Marker for types that can be viewed in place inside the pool.
///
/// # Safety
///  - The type must be `#[repr(C)]` and consist only of atomics (or arrays of
///    atomics), so that every bit pattern, in particular all zeroes, is a valid
///    value and shared mutation through `&Self` is sound.
///  - The alignment of the type must not exceed [`OFFSET_ALIGNMENT`].
pub unsafe trait PoolObject: Sized + Sync {}

/// Header of the pool, stored at offset zero.
#[repr(C, align(64))]
pub struct Superblock {
    magic: AtomicU64,
    layout_version: AtomicU64,
    capacity: AtomicU64,
    root: AtomicU64,
    bump: AtomicU64,
    generation: AtomicU64,
    flags: AtomicU64,
}

// SAFETY: `Superblock` is `repr(C)`, contains only `AtomicU64` fields and has
// an alignment of 64.
unsafe impl PoolObject for Superblock {}

/// A memory-mapped region holding the tree.
pub struct PmPool {
    map: MmapMut,
    base: NonNull<u8>,
    capacity: u64,
    flush_mode: FlushMode,
    generation: u64,
    recovered: bool,
    path: Option<PathBuf>,
    free: Mutex<BTreeMap<usize, Vec<u64>>>,
}

// SAFETY: The raw base pointer is only used to derive references to
// `PoolObject`s (which are `Sync`) and to read immutable byte ranges. All
// mutation of shared state goes through atomics or the free list mutex.
unsafe impl Send for PmPool {}
// SAFETY: See the `Send` implementation above.
unsafe impl Sync for PmPool {}

impl PmPool {
    /// Open the pool described by `config`, creating it when it does not
    /// exist yet. The leaf layout is only recorded when the pool is created.
    pub fn open(config: &PoolConfig, layout: LeafLayout) -> Result<Self> {
        match &config.path {
            None => Self::anonymous(config.capacity, layout),
            Some(path) => {
                let existing = std::fs::metadata(path)
                    .map(|meta| meta.len() > 0)
                    .unwrap_or(false);
                if existing {
                    Self::recover(path, config.flush)
                } else {
                    Self::create(path, config.capacity, config.flush, layout)
                }
            },
        }
    }

    /// Create a volatile pool backed by an anonymous mapping.
    pub fn anonymous(capacity: u64, layout: LeafLayout) -> Result<Self> {
        let capacity = validate_capacity(capacity, None)?;
        let map = MmapMut::map_anon(capacity as usize)?;
        let pool = Self::from_map(map, capacity, FlushMode::None, 1, false, None);
        pool.format(layout);

        tracing::debug!(capacity, "created anonymous pool");
        Ok(pool)
    }

    fn create(path: &Path, capacity: u64, flush: FlushMode, layout: LeafLayout) -> Result<Self> {
        let capacity = validate_capacity(capacity, Some(path))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity)?;

        // SAFETY: The file was just sized by this process. Concurrent
        // modification of the file by other processes is not supported.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let pool = Self::from_map(map, capacity, flush, 1, false, Some(path.to_path_buf()));
        pool.format(layout);

        tracing::info!(path = %path.display(), capacity, "created pool");
        Ok(pool)
    }

    fn recover(path: &Path, flush: FlushMode) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPool {
            path: path.to_path_buf(),
            reason,
        };

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < MIN_POOL_CAPACITY {
            return Err(invalid(format!("file is only {len} bytes long")));
        }

        // SAFETY: Concurrent modification of the file by other processes is not
        // supported.
        let map = unsafe { MmapMut::map_mut(&file)? };
        // SAFETY: The mapping is at least `MIN_POOL_CAPACITY` bytes long and
        // page aligned, so the superblock is in bounds and aligned.
        let superblock = unsafe { &*map.as_ptr().cast::<Superblock>() };

        let magic = superblock.magic.load(Ordering::Acquire);
        if magic != POOL_MAGIC {
            return Err(invalid(format!("bad magic {magic:#x}")));
        }
        let version = superblock.layout_version.load(Ordering::Acquire);
        if version != POOL_LAYOUT_VERSION {
            return Err(invalid(format!("unsupported layout version {version}")));
        }
        let capacity = superblock.capacity.load(Ordering::Acquire);
        if capacity != len {
            return Err(invalid(format!(
                "recorded capacity {capacity} does not match file length {len}"
            )));
        }
        let bump = superblock.bump.load(Ordering::Acquire);
        if !(DATA_START..=capacity).contains(&bump) {
            return Err(invalid(format!("allocation cursor {bump} out of bounds")));
        }

        let generation = superblock.generation.load(Ordering::Acquire) + 1;
        let pool = Self::from_map(
            map,
            capacity,
            flush,
            generation,
            true,
            Some(path.to_path_buf()),
        );
        let superblock = pool.superblock();
        superblock.generation.store(generation, Ordering::Release);
        pool.persist(&superblock.generation);

        tracing::info!(
            path = %path.display(),
            capacity,
            generation,
            used = bump - DATA_START,
            "recovered pool"
        );
        Ok(pool)
    }

    fn from_map(
        mut map: MmapMut,
        capacity: u64,
        flush_mode: FlushMode,
        generation: u64,
        recovered: bool,
        path: Option<PathBuf>,
    ) -> Self {
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());

        PmPool {
            map,
            base,
            capacity,
            flush_mode,
            generation,
            recovered,
            path,
            free: Mutex::new(BTreeMap::new()),
        }
    }

    /// Write a fresh superblock. The magic goes last so that a torn format is
    /// rejected on the next open.
    fn format(&self, layout: LeafLayout) {
        let superblock = self.superblock();
        superblock
            .layout_version
            .store(POOL_LAYOUT_VERSION, Ordering::Relaxed);
        superblock.capacity.store(self.capacity, Ordering::Relaxed);
        superblock.root.store(0, Ordering::Relaxed);
        superblock.bump.store(DATA_START, Ordering::Relaxed);
        superblock
            .generation
            .store(self.generation, Ordering::Relaxed);
        superblock.flags.store(layout.to_flag(), Ordering::Relaxed);
        self.flush(0, size_of::<Superblock>());

        superblock.magic.store(POOL_MAGIC, Ordering::Release);
        self.persist(&superblock.magic);
    }

    fn superblock(&self) -> &Superblock {
        self.get(0)
    }

    /// Total size of the pool in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The generation of this open of the pool. It starts at one and grows by
    /// one every time an existing pool is reopened.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Return true if this pool existed before it was opened.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Location of the pool file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The leaf layout recorded when the pool was created.
    pub fn leaf_layout(&self) -> LeafLayout {
        LeafLayout::from_flag(self.superblock().flags.load(Ordering::Acquire))
    }

    /// Offset of the first byte that has never been handed out.
    pub fn bump(&self) -> u64 {
        self.superblock().bump.load(Ordering::Acquire)
    }

    /// Bytes currently sitting in the free lists.
    pub fn free_bytes(&self) -> u64 {
        self.free
            .lock()
            .iter()
            .map(|(size, offsets)| (*size * offsets.len()) as u64)
            .sum()
    }

    /// The raw root slot. Zero means the tree has not been created yet.
    pub fn root(&self) -> u64 {
        self.superblock().root.load(Ordering::Acquire)
    }

    /// Replace the root slot if it still holds `current`.
    pub fn compare_exchange_root(&self, current: u64, new: u64) -> bool {
        let superblock = self.superblock();
        let swapped = superblock
            .root
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.persist(&superblock.root);
        }
        swapped
    }

    /// View the object of type `T` stored at `offset`.
    ///
    /// # PANICS
    ///  - Panics if the object would not be aligned or would extend past the
    ///    end of the pool. Either means the tree is corrupted.
    pub fn get<T: PoolObject>(&self, offset: u64) -> &T {
        assert!(
            offset % align_of::<T>() as u64 == 0
                && offset
                    .checked_add(size_of::<T>() as u64)
                    .is_some_and(|end| end <= self.capacity),
            "pool offset {offset:#x} does not hold a valid object"
        );

        // SAFETY: The range is in bounds and aligned. `PoolObject` guarantees
        // that every bit pattern is a valid `T` and that shared mutation goes
        // through atomics.
        unsafe { &*self.base.as_ptr().add(offset as usize).cast::<T>() }
    }

    /// View `len` raw bytes starting at `offset`.
    ///
    /// # PANICS
    ///  - Panics if the range extends past the end of the pool.
    ///
    /// # SAFETY
    ///  - The range must not be written for as long as the returned slice is
    ///    alive. Published leaves and slice buffers are immutable, and an epoch
    ///    guard held by the caller keeps them from being reused.
    pub unsafe fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        self.check_range(offset, len);

        // SAFETY: Bounds checked above, immutability is guaranteed by the
        // caller.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset as usize), len) }
    }

    /// Copy `bytes` into the pool at `offset`.
    ///
    /// # PANICS
    ///  - Panics if the range extends past the end of the pool.
    ///
    /// # SAFETY
    ///  - The range must belong to an allocation that is not yet reachable by
    ///    any other thread.
    pub unsafe fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        self.check_range(offset, bytes.len());

        // SAFETY: Bounds checked above, exclusivity is guaranteed by the
        // caller.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset as usize),
                bytes.len(),
            )
        }
    }

    fn check_range(&self, offset: u64, len: usize) {
        assert!(
            offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.capacity),
            "pool range {offset:#x}+{len} is out of bounds"
        );
    }

    /// Offset of an object that lives inside the pool.
    pub fn offset_of<T>(&self, value: &T) -> u64 {
        (value as *const T as usize - self.base.as_ptr() as usize) as u64
    }

    /// Allocate `size` zeroed bytes, rounded up to a whole number of cache
    /// lines.
    pub fn allocate(&self, size: usize) -> Result<u64> {
        let size = round_to_cache_line(size.max(1));

        let offset = match self.take_free(size) {
            Some(offset) => offset,
            None => {
                let offset = self.bump_allocate(size)?;
                self.persist(&self.superblock().bump);
                offset
            },
        };

        // SAFETY: The range was just taken out of the free lists or from above
        // the bump cursor, so no other thread can reach it.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset as usize), 0, size) };

        Ok(offset)
    }

    /// Move the bump cursor past `size` bytes and return where it was.
    fn bump_allocate(&self, size: usize) -> Result<u64> {
        let bump = &self.superblock().bump;
        let mut current = bump.load(Ordering::Acquire);
        loop {
            let end = current
                .checked_add(size as u64)
                .filter(|&end| end <= self.capacity)
                .ok_or(Error::PoolExhausted {
                    requested: size,
                    available: self.capacity.saturating_sub(current),
                })?;
            match bump.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Best-fit search of the free lists, splitting off the remainder.
    fn take_free(&self, size: usize) -> Option<u64> {
        let mut free = self.free.lock();
        let class = free.range(size..).next().map(|(class, _)| *class)?;

        let offsets = free.get_mut(&class)?;
        let offset = offsets.pop()?;
        if offsets.is_empty() {
            free.remove(&class);
        }
        if class > size {
            free.entry(class - size)
                .or_default()
                .push(offset + size as u64);
        }

        Some(offset)
    }

    /// Return `size` bytes at `offset` to the free lists.
    pub fn free(&self, offset: u64, size: usize) {
        let size = round_to_cache_line(size.max(1));
        debug_assert!(offset >= DATA_START && offset + size as u64 <= self.capacity);

        self.free.lock().entry(size).or_default().push(offset);
    }

    /// Replace the free lists with the gaps between the given live ranges and
    /// pull the bump cursor back to the end of the last live range.
    ///
    /// Returns the number of bytes that became available again.
    pub fn rebuild_free_lists(&self, mut live: Vec<(u64, usize)>) -> u64 {
        live.sort_unstable();

        let mut free = BTreeMap::<usize, Vec<u64>>::new();
        let mut cursor = DATA_START;
        let mut reclaimed = 0;
        for (offset, size) in live {
            if offset > cursor {
                let gap = offset - cursor;
                free.entry(gap as usize).or_default().push(cursor);
                reclaimed += gap;
            }
            cursor = cursor.max(offset + round_to_cache_line(size.max(1)) as u64);
        }

        let superblock = self.superblock();
        let bump = superblock.bump.load(Ordering::Acquire);
        if bump > cursor {
            reclaimed += bump - cursor;
            superblock.bump.store(cursor, Ordering::Release);
            self.persist(&superblock.bump);
        }

        *self.free.lock() = free;
        reclaimed
    }

    /// Make the `len` bytes at `offset` durable according to the flush mode.
    ///
    /// # PANICS
    ///  - Panics if `msync` fails, since the durability of the structure can
    ///    no longer be guaranteed.
    pub fn flush(&self, offset: u64, len: usize) {
        match self.flush_mode {
            FlushMode::None => {},
            FlushMode::Fence => fence(Ordering::SeqCst),
            FlushMode::Msync => {
                if let Err(err) = self.map.flush_range(offset as usize, len) {
                    tracing::error!(offset, len, %err, "failed to persist pool range");
                    panic!("failed to persist pool range {offset:#x}+{len}: {err}");
                }
            },
        }
    }

    /// Make a single field of a pool object durable.
    pub fn persist<T>(&self, field: &T) {
        self.flush(self.offset_of(field), size_of::<T>());
    }
}

impl Drop for PmPool {
    fn drop(&mut self) {
        if self.flush_mode == FlushMode::Msync {
            if let Err(err) = self.map.flush() {
                tracing::error!(%err, "failed to flush pool on close");
            }
        }
    }
}

fn validate_capacity(capacity: u64, path: Option<&Path>) -> Result<u64> {
    let capacity = round_to_cache_line(capacity as usize) as u64;
    if !(MIN_POOL_CAPACITY..=MAX_POOL_CAPACITY).contains(&capacity) {
        return Err(Error::InvalidPool {
            path: path.map(Path::to_path_buf).unwrap_or_default(),
            reason: format!(
                "capacity {capacity} is outside of {MIN_POOL_CAPACITY}..={MAX_POOL_CAPACITY}"
            ),
        });
    }
    Ok(capacity)
}
