//! Policy for requests that classify above the largest configured block.
//! The allocator itself only ever deals in fixed-size blocks; anything
//! bigger either gets handed straight to the page mapper or is declared a
//! caller bug, depending on which variant was configured.

use crate::size;

/// What to do with a request whose size class exceeds the largest configured
/// block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LargeAllocBehavior {
    /// Delegate the request to the page mapper: `alloc` becomes `map`,
    /// `free` becomes `unmap`, and resize/remap become `realloc` when both
    /// endpoints are large.
    UsePageAllocator,
    /// Abort with a message naming the offending size class. For programs
    /// that consider an oversize request a bug but still want a diagnosis.
    Panic,
    /// The caller guarantees oversize requests never happen, and in exchange
    /// the classification range check compiles away entirely. An oversize
    /// request under this policy is undefined behaviour.
    Unreachable,
}

/// Diagnostic for the [`LargeAllocBehavior::Panic`] policy. `class` is the
/// size class of the offending request, `largest` the largest class any
/// bucket supports.
#[cold]
#[inline(never)]
pub(crate) fn oversize_request(class: u32, largest: u32) -> ! {
    panic!(
        "request of {} exceeds the largest configured block of {}",
        size::size_name(class),
        size::size_name(largest),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "request of 2 kilobytes exceeds the largest configured block of 1 kilobyte")]
    fn diagnostic_names_both_classes() {
        oversize_request(11, 10);
    }
}
