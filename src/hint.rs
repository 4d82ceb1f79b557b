//! Advisory branch-likelihood hints. Allocation hot paths are dominated by a
//! handful of branches (is this request oversize? does the bucket have
//! recycled blocks?) whose outcome distribution only the embedding
//! application knows. The hints below let the caller describe that
//! distribution at configuration time so we can forward it to the code
//! generator. They never affect what the allocator does, only how the
//! machine code for it is laid out.

use std::hint::{black_box, cold_path, likely, unlikely};

/// How likely a hot-path branch is to be taken, as predicted by whoever
/// configures the allocator. `Unknown` leaves the compiler to its own
/// devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Likelihood {
    Unknown,
    VeryLikely,
    VeryUnlikely,
    AlmostNever,
    CannotPredict,
}

/// Per-branch hints for the allocator's hot paths. Each field names the
/// condition it describes.
#[derive(Clone, Copy, Debug)]
pub struct Hints {
    /// A request classifies above the largest configured block.
    pub large_allocation: Likelihood,
    /// The chosen bucket has blocks that were freed in the past.
    pub recycled_blocks: Likelihood,
    /// The chosen bucket has blocks carved from a slab but never handed out.
    pub brand_new_blocks: Likelihood,
    /// The statistics section of the usage report gets rendered.
    pub usage_statistics: Likelihood,
}

impl Hints {
    /// No predictions at all.
    pub const UNKNOWN: Hints = Hints {
        large_allocation: Likelihood::Unknown,
        recycled_blocks: Likelihood::Unknown,
        brand_new_blocks: Likelihood::Unknown,
        usage_statistics: Likelihood::Unknown,
    };
}

/// Evaluates `condition` annotated with the given likelihood. Returns
/// `condition` unchanged; the hint only reaches the optimizer.
#[inline(always)]
pub(crate) fn weigh(likelihood: Likelihood, condition: bool) -> bool {
    match likelihood {
        Likelihood::Unknown => condition,
        Likelihood::VeryLikely => likely(condition),
        Likelihood::VeryUnlikely => unlikely(condition),
        Likelihood::AlmostNever => {
            if unlikely(condition) {
                cold_path();
                true
            } else {
                false
            }
        }
        // There is no "unpredictable" primitive on stable or nightly, but an
        // opaque value stops the optimizer from assuming anything about the
        // branch, which is the closest available spelling.
        Likelihood::CannotPredict => black_box(condition),
    }
}
