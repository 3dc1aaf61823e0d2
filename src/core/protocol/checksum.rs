//! Frame checksum
//!
//! Frames carry an LRC: the two's-complement of the 8-bit byte sum, so that
//! every byte of a valid frame (checksum included) sums to zero mod 256.
//! Wider checksum fields hold the same value zero-padded in little-endian
//! order.

/// Longitudinal Redundancy Check (sum mod 256, negated)
pub fn lrc_checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Checksum field of `width` bytes for `data`
pub fn calculate(data: &[u8], width: usize) -> Vec<u8> {
    let mut field = vec![0u8; width];
    if let Some(first) = field.first_mut() {
        *first = lrc_checksum(data);
    }
    field
}

/// Verify a checksum field against the bytes it covers
pub fn verify(data: &[u8], checksum: &[u8]) -> bool {
    calculate(data, checksum.len()) == checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrc_zero_sum() {
        let data = [0xAA, 0x00, 0x01, 0x02, 0x00, 0x48, 0x49];
        let lrc = lrc_checksum(&data);
        assert_eq!(lrc, 0xC2);
        assert_eq!(sum8_checksum(&data).wrapping_add(lrc), 0);
    }

    #[test]
    fn test_lrc_empty() {
        assert_eq!(lrc_checksum(&[]), 0);
    }

    #[test]
    fn test_wide_field_padding() {
        assert_eq!(calculate(&[0x01], 2), vec![0xFF, 0x00]);
        assert!(verify(&[0x01], &[0xFF, 0x00]));
        assert!(!verify(&[0x01], &[0xFF, 0x01]));
    }
}
