//! Integrity checks used by the device families.

use crate::errors::{DriverError, Result};

/// Sum of all bytes modulo 256.
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Rolling sum of the bytes taken as signed values, wrapping on overflow.
pub fn signed_sum(bytes: &[u8]) -> i8 {
    bytes.iter().fold(0i8, |acc, b| acc.wrapping_add(*b as i8))
}

/// Compare a computed checksum with the one received on the wire.
pub fn verify(expected: u8, received: u8) -> Result<()> {
    if expected == received {
        Ok(())
    } else {
        Err(DriverError::ChecksumMismatch { expected, received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_sum_wraps() {
        assert_eq!(0x53, byte_sum(&[0x50, 0x03]));
        assert_eq!(0x01, byte_sum(&[0xFF, 0x02]));
        assert_eq!(0, byte_sum(&[]));
    }

    #[test]
    fn test_signed_sum_wraps() {
        assert_eq!(-2, signed_sum(&[0xFF, 0xFF]));
        assert_eq!(-128, signed_sum(&[0x7F, 0x01]));
        assert_eq!(5, signed_sum(&[0xFE, 0x07]));
    }

    #[test]
    fn test_verify() {
        assert!(verify(0x2A, 0x2A).is_ok());
        assert!(matches!(
            verify(0x2A, 0x2B),
            Err(DriverError::ChecksumMismatch {
                expected: 0x2A,
                received: 0x2B
            })
        ));
    }
}
