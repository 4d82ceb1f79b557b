use std::fmt;

/// Machine word size in bytes. Doubles as the smallest block size any bucket
/// may be configured with, because a free block has to be able to store one
/// pointer inside its own content. See [`crate::freelist::FreeBlock`].
pub(crate) const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Machine word size in bits. Used by the classification rule at
/// [`crate::tables::Tables::size_class`].
pub(crate) const WORD_BITS: u32 = usize::BITS;

/// Byte count of the size class `log2`. Also its alignment: a class is a
/// power of two, so the two representations coincide.
#[inline]
pub const fn class_bytes(log2: u32) -> usize {
    1 << log2
}

/// Human readable name for `2^log2` bytes. The returned value implements
/// [`fmt::Display`], so both the report writer and panic messages can render
/// it without allocating anything (WE ARE THE ALLOCATOR, there's nobody below
/// us to allocate from).
///
/// # Examples
///
/// ```rust
/// # use slabloc::size_name;
/// assert_eq!(size_name(0).to_string(), "1 byte");
/// assert_eq!(size_name(11).to_string(), "2 kilobytes");
/// ```
#[inline]
pub const fn size_name(log2: u32) -> SizeName {
    assert!(log2 < 70, "size class out of range");
    SizeName { log2 }
}

/// See [`size_name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeName {
    log2: u32,
}

/// Binary units, one per power of 1024.
const UNITS: [&str; 7] = [
    "byte",
    "kilobyte",
    "megabyte",
    "gigabyte",
    "terabyte",
    "petabyte",
    "exabyte",
];

impl fmt::Display for SizeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = UNITS[(self.log2 / 10) as usize];
        let count = 1u64 << (self.log2 % 10);

        if count == 1 {
            write!(f, "1 {unit}")
        } else {
            write!(f, "{count} {unit}s")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let cases = [
            (0, "1 byte"),
            (1, "2 bytes"),
            (3, "8 bytes"),
            (9, "512 bytes"),
            (10, "1 kilobyte"),
            (11, "2 kilobytes"),
            (20, "1 megabyte"),
            (30, "1 gigabyte"),
            (42, "4 terabytes"),
            (53, "8 petabytes"),
            (60, "1 exabyte"),
            (63, "8 exabytes"),
        ];

        for (log2, expected) in cases {
            assert_eq!(size_name(log2).to_string(), expected);
        }
    }

    #[test]
    fn log2_to_bytes() {
        assert_eq!(class_bytes(0), 1);
        assert_eq!(class_bytes(7), 128);
        assert_eq!(class_bytes(12), 4096);
    }
}
