//! Reflected binary (Gray) code conversions
//!
//! Absolute encoders report positions in Gray code so that only one bit changes between adjacent
//! positions.

/// Convert a binary value to Gray code
pub const fn binary_to_gray(value: u32) -> u32 {
    value ^ (value >> 1)
}

/// Convert a Gray coded value to binary
///
/// Each bit, from the most significant down, is XORed with all of the already decoded higher
/// bits.
pub const fn gray_to_binary(gray: u32) -> u32 {
    let mut value = gray;
    let mut shifted = gray >> 1;
    while shifted != 0 {
        value ^= shifted;
        shifted >>= 1;
    }
    value
}
