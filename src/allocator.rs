use std::{
    alloc::{AllocError, Allocator, Layout},
    cell::UnsafeCell,
    fmt,
    hint::unreachable_unchecked,
    ptr::{self, NonNull},
};

use crate::{
    bucket::Bucket,
    config::Config,
    hint::{self, Hints},
    large::{self, LargeAllocBehavior},
    platform::{PageMapper, Platform},
    stats::{StatsTracker, Tracked, Untracked},
    tables::Tables,
    AllocResult, Pointer,
};

/// The allocator engine. Every request is classified into one of `N` power
/// of two size classes and served from that bucket's free lists; each bucket
/// carves its blocks out of page-aligned slabs requested from the page
/// mapper `M`. This is the full picture:
///
/// ```text
///                 recycled list (intrusive, LIFO)
///                +--------------------------------------+
///                |                                      |
///               +-|----+     +------+     +------+    +-v----+
/// buckets[0] -> | head |     | next-+---->| next-+--->|  0   |   128 B blocks
///               +------+     +--^---+     +------+    +------+
///                               |
///                               +-- blocks point at each other through
///                                   their own first word
///
///               +------+     +------+------+------+------+------+
/// buckets[1] -> | head-+---->|      |      |      |      |      |  1 KiB blocks
///               +------+     +------+------+------+------+------+
///                 brand new: never-issued tail of the current slab,
///                 issuing a block just bumps the head forward
/// ```
///
/// Blocks carry no headers. Which bucket a pointer belongs to is recomputed
/// from the `(len, alignment)` pair the caller hands back, so a block is
/// exactly its content and nothing else. The price is that the caller must
/// pass back the same pair it allocated with; anything else is undefined
/// behaviour.
///
/// Requests that classify above the largest bucket follow the configured
/// [`LargeAllocBehavior`].
///
/// All operations take `&mut self` and nothing here is thread safe. See
/// [`Slabloc`] for the [`std::alloc::Allocator`] front end.
///
/// # Drop
///
/// There is deliberately no [`Drop`] impl: slabs are never returned to the
/// OS, not even on teardown. The process keeps the memory until it exits.
pub struct SlabAllocator<const N: usize, M: PageMapper = Platform, S: StatsTracker = Untracked> {
    pub(crate) tables: Tables<N>,
    pub(crate) behavior: LargeAllocBehavior,
    pub(crate) hints: Hints,
    pub(crate) buckets: [Bucket; N],
    pub(crate) mapper: M,
    pub(crate) stats: S,
}

impl<const N: usize> SlabAllocator<N> {
    /// Builds an allocator on the OS page mapper, without statistics. The
    /// configuration is validated here; in a `const` context a bad bucket
    /// list becomes a compile error.
    pub const fn new(config: Config<N>) -> Self {
        Self::with_parts(config, Platform, Untracked)
    }
}

impl<const N: usize> SlabAllocator<N, Platform, Tracked<N>> {
    /// Same as [`SlabAllocator::new`] but with statistics tracking. Costs
    /// roughly three times the allocator footprint plus bookkeeping on
    /// every call.
    pub const fn with_stats(config: Config<N>) -> Self {
        Self::with_parts(config, Platform, Tracked::new())
    }
}

impl<const N: usize, M: PageMapper, S: StatsTracker> SlabAllocator<N, M, S> {
    /// Builds an allocator from explicit parts: a validated configuration,
    /// the page mapper to carve slabs from and the statistics tracker.
    pub const fn with_parts(config: Config<N>, mapper: M, stats: S) -> Self {
        let config = config.validated();

        Self {
            tables: Tables::build(&config),
            behavior: config.large_allocation_behavior,
            hints: config.hints,
            buckets: [Bucket::new(); N],
            mapper,
            stats,
        }
    }

    /// Read access to the statistics tracker.
    pub fn stats(&self) -> &S {
        &self.stats
    }

    /// Allocates a block for `len` bytes at the given alignment. The
    /// returned pointer is aligned to the chosen bucket's block size (which
    /// is at least `alignment`) and its contents are uninitialised. Returns
    /// `None` when the page mapper is out of memory.
    ///
    /// # Safety
    ///
    /// `alignment` must be a power of two.
    pub unsafe fn alloc(&mut self, len: usize, alignment: usize) -> Option<NonNull<u8>> {
        let class = self.tables.size_class(len, alignment);

        if hint::weigh(self.hints.large_allocation, self.tables.is_large(class)) {
            return self.alloc_large(len, alignment, class);
        }

        let index = self.tables.bucket_index(class);
        let address = self.bucket_alloc(index)?;
        self.stats.record_bucket_alloc(index, len);

        Some(address)
    }

    /// Returns a block. `len` and `alignment` must be the exact values the
    /// block was allocated with; they are what identifies the bucket, since
    /// blocks carry no metadata.
    ///
    /// # Safety
    ///
    /// `address` must come from [`SlabAllocator::alloc`] on this allocator
    /// with the same `(len, alignment)` pair, and must not be used
    /// afterwards.
    pub unsafe fn free(&mut self, address: NonNull<u8>, len: usize, alignment: usize) {
        let class = self.tables.size_class(len, alignment);

        if hint::weigh(self.hints.large_allocation, self.tables.is_large(class)) {
            return self.free_large(address, len, class);
        }

        let index = self.tables.bucket_index(class);
        self.buckets[index].recycled.push(address);
        self.stats.record_bucket_free(index, len);
    }

    /// In-place resize. Returns true iff `(new_len, alignment)` classifies
    /// into the same bucket as `(old_len, alignment)`, in which case the
    /// existing block already fits and nothing moves. On false the caller
    /// has to alloc-copy-free itself; no data is ever copied here.
    ///
    /// # Safety
    ///
    /// Same contract as [`SlabAllocator::free`] for `address`, `old_len`
    /// and `alignment`.
    pub unsafe fn resize(
        &mut self,
        address: NonNull<u8>,
        old_len: usize,
        alignment: usize,
        new_len: usize,
    ) -> bool {
        let old_class = self.tables.size_class(old_len, alignment);
        let new_class = self.tables.size_class(new_len, alignment);
        let old_is_large = self.tables.is_large(old_class);
        let new_is_large = self.tables.is_large(new_class);

        if hint::weigh(self.hints.large_allocation, old_is_large || new_is_large) {
            return match self.behavior {
                LargeAllocBehavior::UsePageAllocator => {
                    if !(old_is_large && new_is_large) {
                        if !old_is_large {
                            self.stats
                                .record_rejected_resize(self.tables.bucket_index(old_class));
                        }
                        return false;
                    }

                    self.stats.record_large_resize_attempt(old_len, new_len);
                    match self.mapper.realloc(address, old_len, new_len, false) {
                        Some(same) => {
                            debug_assert!(same == address);
                            self.stats.record_large_resized(old_len, new_len);
                            true
                        }
                        None => false,
                    }
                }
                LargeAllocBehavior::Panic => large::oversize_request(
                    if old_is_large { old_class } else { new_class },
                    self.tables.largest_block_log2,
                ),
                LargeAllocBehavior::Unreachable => unreachable_unchecked(),
            };
        }

        let old_bucket = self.tables.bucket_index(old_class);
        let new_bucket = self.tables.bucket_index(new_class);

        if old_bucket == new_bucket {
            return true;
        }

        if new_bucket > old_bucket {
            self.stats.record_rejected_resize(old_bucket);
        }

        false
    }

    /// Move-permitted resize. Same class test as [`SlabAllocator::resize`]:
    /// if the classes match the block is returned unchanged, otherwise the
    /// result is `None` and the caller falls back to alloc-copy-free. The
    /// allocator never allocates the replacement block itself; the only
    /// case where the result can differ from `address` is a page-mapper
    /// delegated reallocation of an oversize block.
    ///
    /// # Safety
    ///
    /// Same contract as [`SlabAllocator::free`] for `address`, `old_len`
    /// and `alignment`.
    pub unsafe fn remap(
        &mut self,
        address: NonNull<u8>,
        old_len: usize,
        alignment: usize,
        new_len: usize,
    ) -> Option<NonNull<u8>> {
        let old_class = self.tables.size_class(old_len, alignment);
        let new_class = self.tables.size_class(new_len, alignment);
        let old_is_large = self.tables.is_large(old_class);
        let new_is_large = self.tables.is_large(new_class);

        if hint::weigh(self.hints.large_allocation, old_is_large || new_is_large) {
            return match self.behavior {
                LargeAllocBehavior::UsePageAllocator => {
                    if !(old_is_large && new_is_large) {
                        if !old_is_large {
                            self.stats
                                .record_rejected_resize(self.tables.bucket_index(old_class));
                        }
                        return None;
                    }

                    self.stats.record_large_resize_attempt(old_len, new_len);
                    let new_address = self.mapper.realloc(address, old_len, new_len, true)?;
                    self.stats.record_large_resized(old_len, new_len);

                    Some(new_address)
                }
                LargeAllocBehavior::Panic => large::oversize_request(
                    if old_is_large { old_class } else { new_class },
                    self.tables.largest_block_log2,
                ),
                LargeAllocBehavior::Unreachable => unreachable_unchecked(),
            };
        }

        let old_bucket = self.tables.bucket_index(old_class);
        let new_bucket = self.tables.bucket_index(new_class);

        if old_bucket == new_bucket {
            return Some(address);
        }

        if new_bucket > old_bucket {
            self.stats.record_rejected_resize(old_bucket);
        }

        None
    }

    /// Number of bytes actually usable behind a successful allocation for
    /// `(len, alignment)`: the whole block for bucket requests, the exact
    /// length for delegated ones.
    pub(crate) fn usable_size(&self, len: usize, alignment: usize) -> usize {
        let class = self.tables.size_class(len, alignment);

        if self.tables.is_large(class) {
            len
        } else {
            self.tables.block_bytes[self.tables.bucket_index(class)]
        }
    }

    /// Serves a request from the bucket at `index`, mapping a fresh slab
    /// only when both free lists are empty.
    #[inline]
    unsafe fn bucket_alloc(&mut self, index: usize) -> Pointer<u8> {
        let recycled = self.buckets[index].recycled.len() > 0;
        if hint::weigh(self.hints.recycled_blocks, recycled) {
            return self.buckets[index].recycled.pop();
        }

        let brand_new = self.buckets[index].brand_new.len() > 0;
        if hint::weigh(self.hints.brand_new_blocks, brand_new) {
            let block_bytes = self.tables.block_bytes[index];
            return self.buckets[index].brand_new.bump(block_bytes);
        }

        self.map_fresh_slab(index)
    }

    /// Maps a slab for the bucket at `index`, hands the first block to the
    /// caller and adopts the remainder as brand-new blocks.
    unsafe fn map_fresh_slab(&mut self, index: usize) -> Pointer<u8> {
        let slab_bytes = self.tables.slab_bytes[index];
        let block_bytes = self.tables.block_bytes[index];

        let slab = self.mapper.map(slab_bytes, block_bytes)?;
        self.stats.record_slab_mapped(index);

        let second_block = NonNull::new_unchecked(slab.as_ptr().add(block_bytes));
        self.buckets[index]
            .brand_new
            .refill(second_block, self.tables.extra_blocks_per_slab[index]);

        Some(slab)
    }

    unsafe fn alloc_large(
        &mut self,
        len: usize,
        alignment: usize,
        class: u32,
    ) -> Option<NonNull<u8>> {
        match self.behavior {
            LargeAllocBehavior::UsePageAllocator => {
                let address = self.mapper.map(len, alignment)?;
                self.stats.record_large_alloc(len);

                Some(address)
            }
            LargeAllocBehavior::Panic => {
                large::oversize_request(class, self.tables.largest_block_log2)
            }
            LargeAllocBehavior::Unreachable => unreachable_unchecked(),
        }
    }

    unsafe fn free_large(&mut self, address: NonNull<u8>, len: usize, class: u32) {
        match self.behavior {
            LargeAllocBehavior::UsePageAllocator => {
                self.mapper.unmap(address, len);
                self.stats.record_large_free(len);
            }
            LargeAllocBehavior::Panic => {
                large::oversize_request(class, self.tables.largest_block_log2)
            }
            LargeAllocBehavior::Unreachable => unreachable_unchecked(),
        }
    }
}

/// Single-threaded front end implementing [`std::alloc::Allocator`], so the
/// engine works with anything that takes an allocator. The engine needs
/// `&mut self` and the trait hands out `&self`, hence the [`UnsafeCell`];
/// there is no lock behind it, which is why this type is not [`Sync`] and
/// there is no [`std::alloc::GlobalAlloc`] impl (a global allocator must be
/// `Sync`).
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use std::alloc::{Allocator, Layout};
///
/// use slabloc::Slabloc;
///
/// let slabloc = Slabloc::with_default_config();
/// let layout = Layout::from_size_align(100, 8).unwrap();
///
/// let address = slabloc.allocate(layout).unwrap();
/// // The chosen block can be bigger than the request.
/// assert!(address.len() >= 100);
/// assert_eq!(address.cast::<u8>().as_ptr() as usize % 8, 0);
///
/// unsafe { slabloc.deallocate(address.cast(), layout) };
/// ```
///
/// ## Collections and [`Box`]
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use slabloc::Slabloc;
///
/// let slabloc = Slabloc::with_default_config();
///
/// let num = Box::new_in(12, &slabloc);
/// assert_eq!(*num, 12);
///
/// let mut vec = Vec::new_in(&slabloc);
/// vec.push(5);
/// assert_eq!(vec[0], 5);
/// ```
pub struct Slabloc<const N: usize = 3, M: PageMapper = Platform, S: StatsTracker = Untracked> {
    allocator: UnsafeCell<SlabAllocator<N, M, S>>,
}

impl Slabloc {
    /// Three buckets: 128 byte blocks on 4 KiB slabs, 1 KiB blocks on
    /// 16 KiB slabs and 8 KiB blocks on 64 KiB slabs. Anything bigger goes
    /// to the page mapper.
    pub const fn with_default_config() -> Self {
        use crate::config::BucketConfig;

        Self::new(Config::new([
            BucketConfig::new(128, 4096),
            BucketConfig::new(1024, 16384),
            BucketConfig::new(8192, 65536),
        ]))
    }
}

impl<const N: usize> Slabloc<N> {
    /// See [`SlabAllocator::new`].
    pub const fn new(config: Config<N>) -> Self {
        Self {
            allocator: UnsafeCell::new(SlabAllocator::new(config)),
        }
    }
}

impl<const N: usize, M: PageMapper, S: StatsTracker> Slabloc<N, M, S> {
    /// See [`SlabAllocator::with_parts`].
    pub const fn with_parts(config: Config<N>, mapper: M, stats: S) -> Self {
        Self {
            allocator: UnsafeCell::new(SlabAllocator::with_parts(config, mapper, stats)),
        }
    }

    /// Renders the free-list and statistics report. See
    /// [`SlabAllocator::write_report`].
    pub fn write_report<W: fmt::Write>(&self, label: &str, out: &mut W) -> fmt::Result {
        unsafe { (*self.allocator.get()).write_report(label, out) }
    }
}

impl Default for Slabloc {
    fn default() -> Self {
        Slabloc::with_default_config()
    }
}

unsafe impl<const N: usize, M: PageMapper, S: StatsTracker> Allocator for Slabloc<N, M, S> {
    fn allocate(&self, layout: Layout) -> AllocResult {
        unsafe {
            let allocator = &mut *self.allocator.get();

            match allocator.alloc(layout.size(), layout.align()) {
                Some(address) => Ok(NonNull::slice_from_raw_parts(
                    address,
                    allocator.usable_size(layout.size(), layout.align()),
                )),
                None => Err(AllocError),
            }
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
        (*self.allocator.get()).free(address, layout.size(), layout.align());
    }

    unsafe fn grow(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        self.reallocate(address, old_layout, new_layout, old_layout.size())
    }

    unsafe fn grow_zeroed(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        let new_address = self.grow(address, old_layout, new_layout)?;

        let zero_from = new_address.cast::<u8>().as_ptr().add(old_layout.size());
        zero_from.write_bytes(0, new_layout.size() - old_layout.size());

        Ok(new_address)
    }

    unsafe fn shrink(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        self.reallocate(address, old_layout, new_layout, new_layout.size())
    }
}

impl<const N: usize, M: PageMapper, S: StatsTracker> Slabloc<N, M, S> {
    /// The alloc-copy-free fallback the engine's class test pushes onto its
    /// caller, which at this seam is us. Whether growing or shrinking,
    /// first try to keep the block in place; `preserve` is how many bytes
    /// to carry over when it has to move.
    unsafe fn reallocate(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        preserve: usize,
    ) -> AllocResult {
        let allocator = &mut *self.allocator.get();
        let usable = |allocator: &SlabAllocator<N, M, S>| {
            allocator.usable_size(new_layout.size(), new_layout.align())
        };

        // The class test only applies when the alignment doesn't change;
        // a different alignment can demand a different bucket on its own.
        if old_layout.align() == new_layout.align() {
            if let Some(in_place) = allocator.remap(
                address,
                old_layout.size(),
                old_layout.align(),
                new_layout.size(),
            ) {
                return Ok(NonNull::slice_from_raw_parts(in_place, usable(allocator)));
            }
        }

        let Some(new_address) = allocator.alloc(new_layout.size(), new_layout.align()) else {
            return Err(AllocError);
        };
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), preserve);
        allocator.free(address, old_layout.size(), old_layout.align());

        Ok(NonNull::slice_from_raw_parts(new_address, usable(allocator)))
    }
}
