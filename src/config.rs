//! Allocator configuration and its validation. Everything here runs in
//! `const` context, so an allocator built in a `const` or `static` item
//! rejects a bad bucket list at compile time; building one at runtime
//! panics at construction instead. Either way a misconfiguration never
//! survives into the hot paths.

use crate::{
    hint::Hints,
    large::LargeAllocBehavior,
    size::WORD_SIZE,
};

/// The smallest page size of any target we run on. Real page sizes are only
/// known at runtime (see [`crate::platform`]), but validation happens in
/// `const` context, so it checks against this conservative floor.
pub(crate) const MIN_PAGE_SIZE: usize = 4096;

/// One size class: blocks of `block_size` bytes carved out of slabs of
/// `slab_size` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketConfig {
    /// Size of every block this bucket hands out. Power of two, at least one
    /// machine word, at most `slab_size`.
    pub block_size: usize,
    /// Size of the page-aligned slabs this bucket requests from the page
    /// mapper. Power of two, at least one page.
    pub slab_size: usize,
}

impl BucketConfig {
    pub const fn new(block_size: usize, slab_size: usize) -> Self {
        Self {
            block_size,
            slab_size,
        }
    }
}

/// Complete allocator configuration: the bucket list, what to do with
/// requests too big for any bucket, and the advisory branch hints.
///
/// # Examples
///
/// ```rust
/// use slabloc::{BucketConfig, Config, LargeAllocBehavior};
///
/// const CONFIG: Config<2> = Config::new([
///     BucketConfig::new(128, 4096),
///     BucketConfig::new(1024, 16384),
/// ])
/// .large_allocation_behavior(LargeAllocBehavior::UsePageAllocator);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Config<const N: usize> {
    pub buckets: [BucketConfig; N],
    pub large_allocation_behavior: LargeAllocBehavior,
    pub hints: Hints,
}

impl<const N: usize> Config<N> {
    /// Builds a configuration with the given buckets, page-mapper delegation
    /// for large requests and no branch predictions. Validation happens when
    /// the allocator is constructed, not here.
    pub const fn new(buckets: [BucketConfig; N]) -> Self {
        Self {
            buckets,
            large_allocation_behavior: LargeAllocBehavior::UsePageAllocator,
            hints: Hints::UNKNOWN,
        }
    }

    /// Replaces the large-request policy.
    pub const fn large_allocation_behavior(mut self, behavior: LargeAllocBehavior) -> Self {
        self.large_allocation_behavior = behavior;
        self
    }

    /// Replaces the branch-likelihood hints.
    pub const fn hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    /// Checks every rule the bucket list must satisfy, panicking on the
    /// first violation. Called once by the allocator constructors.
    pub(crate) const fn validated(self) -> Self {
        assert!(N > 0, "allocator requires at least one bucket");

        let mut i = 0;
        while i < N {
            let bucket = self.buckets[i];

            assert!(
                bucket.block_size.is_power_of_two(),
                "bucket block sizes must be powers of two"
            );
            assert!(
                bucket.slab_size.is_power_of_two(),
                "bucket slab sizes must be powers of two"
            );
            assert!(
                bucket.block_size >= WORD_SIZE,
                "bucket block sizes must be at least one machine word"
            );
            assert!(
                bucket.block_size <= bucket.slab_size,
                "bucket block sizes cannot exceed their slab size"
            );
            assert!(
                bucket.slab_size >= MIN_PAGE_SIZE,
                "bucket slab sizes must be at least one page"
            );
            if i > 0 {
                assert!(
                    bucket.block_size > self.buckets[i - 1].block_size,
                    "bucket block sizes must be strictly increasing"
                );
            }

            i += 1;
        }

        self
    }
}
