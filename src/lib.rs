#![feature(allocator_api)]
#![feature(likely_unlikely)]
#![feature(cold_path)]

use std::{alloc::AllocError, ptr::NonNull};

mod allocator;
mod bucket;
mod config;
mod freelist;
mod hint;
mod large;
mod platform;
mod report;
mod size;
mod stats;
mod tables;

/// Non-null pointer to `T`. We use this instead of `*mut T` wherever a
/// pointer can be absent, because the compiler forces us to handle the
/// `None` case and the null-pointer niche makes it the same size as a raw
/// pointer, which matters for [`freelist::FreeBlock`].
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for the [`std::alloc::Allocator`] return types.
pub(crate) type AllocResult = Result<NonNull<[u8]>, AllocError>;

pub use allocator::{SlabAllocator, Slabloc};
pub use config::{BucketConfig, Config};
pub use hint::{Hints, Likelihood};
pub use large::LargeAllocBehavior;
pub use platform::{PageMapper, Platform};
pub use size::{class_bytes, size_name, SizeName};
pub use stats::{StatsTracker, Tracked, Untracked};
