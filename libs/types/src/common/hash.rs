//! Shard placement checksum
//!
//! A rolling `h * 31 + c` checksum over UTF-16 code units with 32-bit
//! wrapping arithmetic, shifted into the non-negative range. It only has to
//! be stable across workers and runs; it makes no collision-resistance or
//! security promises.

/// Hash a string for shard placement.
///
/// Every worker computes the same value for the same input, which is what
/// makes string-id placement deterministic.
pub fn hash(input: &str) -> u32 {
    let folded = input.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(unit))
    });

    // i32 range shifted up by 2^31 lands exactly in u32
    (i64::from(folded) + i64::from(i32::MAX) + 1) as u32
}
