//! PKCS#7 block padding for envelope plaintexts

use super::errors::CodecError;

pub const BLOCK_SIZE: usize = 16;

/// Pad `data` up to the next block boundary.
/// An input that is already block-aligned (including empty) gains a full block.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let n = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + n);
    out.extend_from_slice(data);
    out.resize(data.len() + n, n as u8);
    out
}

pub fn unpad(data: &[u8]) -> Result<&[u8], CodecError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::Padding);
    }
    let n = data[data.len() - 1] as usize;
    if n == 0 || n > BLOCK_SIZE {
        return Err(CodecError::Padding);
    }
    let (body, tail) = data.split_at(data.len() - n);
    if tail.iter().any(|&b| b as usize != n) {
        return Err(CodecError::Padding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_pads_to_full_block() {
        let padded = pad(&[]);
        assert_eq!(padded, vec![16u8; 16]);
        assert_eq!(unpad(&padded).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_aligned_input_gains_block() {
        let data = [7u8; 32];
        let padded = pad(&data);
        assert_eq!(padded.len(), 48);
        assert_eq!(unpad(&padded).unwrap(), &data);
    }

    #[test]
    fn test_unpad_rejects_garbage() {
        assert!(unpad(&[]).is_err());
        assert!(unpad(&[1, 2, 3]).is_err());
        let mut bad = pad(b"hello");
        let last = bad.len() - 2;
        bad[last] = 0xff;
        assert!(unpad(&bad).is_err());
        assert!(unpad(&[0u8; 16]).is_err());
    }

    proptest! {
        #[test]
        fn prop_pad_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            let padded = pad(&data);
            prop_assert_eq!(padded.len() % BLOCK_SIZE, 0);
            prop_assert!(padded.len() > data.len());
            prop_assert_eq!(unpad(&padded).unwrap(), &data[..]);
        }
    }
}
