//! Renders the allocator's free-list state, and the statistics when they
//! are being tracked, into a caller-supplied character sink. The allocator
//! itself never does any I/O; whoever wants the report on a screen or in a
//! log hands us something that implements [`fmt::Write`] and ships the text
//! themselves.

use std::fmt;

use crate::{
    allocator::SlabAllocator,
    hint,
    platform::PageMapper,
    size,
    stats::StatsTracker,
};

impl<const N: usize, M: PageMapper, S: StatsTracker> SlabAllocator<N, M, S> {
    /// Writes a labelled report with one line per bucket (block size name,
    /// free slabs, free blocks, free bytes) followed by the statistics
    /// section when tracking is enabled.
    ///
    /// The free slab count is an estimate, marked as such in the output:
    /// blocks on the recycled list can come from any slab the bucket ever
    /// mapped, so dividing free blocks by blocks-per-slab over-approximates
    /// how many slabs are entirely free.
    pub fn write_report<W: fmt::Write>(&self, label: &str, out: &mut W) -> fmt::Result {
        writeln!(out, "memory report: {label}")?;

        for index in 0..N {
            let free_blocks = self.buckets[index].free_blocks();
            let free_slabs = free_blocks / self.tables.blocks_per_slab[index];
            let free_bytes = free_blocks * self.tables.block_bytes[index];

            writeln!(
                out,
                "{:>14}: ~{} free slabs, {} free blocks, {} free bytes",
                size::size_name(self.tables.block_log2[index]).to_string(),
                free_slabs,
                free_blocks,
                free_bytes,
            )?;
        }

        if hint::weigh(self.hints.usage_statistics, S::ENABLED) {
            self.stats.render(out)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{BucketConfig, Config},
        stats::Tracked,
        Platform, SlabAllocator,
    };

    fn two_buckets() -> Config<2> {
        Config::new([
            BucketConfig::new(128, 4096),
            BucketConfig::new(1024, 16384),
        ])
    }

    #[test]
    fn reports_free_lists_per_bucket() {
        unsafe {
            let mut allocator = SlabAllocator::<2>::new(two_buckets());

            let first = allocator.alloc(6, 1).unwrap();
            let second = allocator.alloc(600, 1).unwrap();
            allocator.free(first, 6, 1);
            allocator.free(second, 600, 1);

            let mut report = String::new();
            allocator.write_report("after warmup", &mut report).unwrap();

            assert!(report.starts_with("memory report: after warmup\n"));
            // 31 brand new plus the recycled one; 32 blocks make one whole
            // (estimated) slab.
            assert!(report.contains("128 bytes: ~1 free slabs, 32 free blocks, 4096 free bytes"));
            assert!(report.contains("1 kilobyte: ~1 free slabs, 16 free blocks, 16384 free bytes"));
            // No statistics section without tracking.
            assert!(!report.contains("total bytes outstanding"));
        }
    }

    #[test]
    fn reports_statistics_when_tracked() {
        unsafe {
            let mut allocator: SlabAllocator<2, Platform, Tracked<2>> =
                SlabAllocator::with_stats(two_buckets());

            let address = allocator.alloc(40, 1).unwrap();
            allocator.free(address, 40, 1);

            let mut report = String::new();
            allocator.write_report("tracked", &mut report).unwrap();

            assert!(report.contains("total bytes outstanding: 0 now, 40 peak"));
            assert!(report.contains("requests seen: 40..40 bytes"));
            assert!(report.contains("bucket 0: requests 40..40 bytes, live blocks 0 now, 1 peak"));
            assert!(report.contains("large: requests none"));
        }
    }
}
