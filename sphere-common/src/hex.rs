//! Hex encoding/decoding for byte slices and fixed-size arrays.

use std::fmt::{self, Write};

use thiserror::Error;

/// Errors which can occur while decoding a hex string.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("hex decode error: input string length must be even")]
    OddInputLength,
    #[error("hex decode error: input contains a non-hex character")]
    InvalidCharacter,
    #[error("hex decode error: decoded length doesn't match expected length")]
    BadLength,
}

/// Encode a byte slice as an owned lowercase hex string. Use [`display`] when
/// you only need to format the bytes, which avoids the allocation.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(encode_nibble(byte >> 4));
        out.push(encode_nibble(byte & 0x0f));
    }
    out
}

/// Decode a hex string into owned bytes.
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let input = hex.as_bytes();
    if input.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    input
        .chunks_exact(2)
        .map(|pair| {
            let hi = decode_nibble(pair[0])?;
            let lo = decode_nibble(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

/// Decode a hex string into a fixed-size array.
pub fn decode_array<const N: usize>(hex: &str) -> Result<[u8; N], DecodeError> {
    let bytes = decode(hex)?;
    <[u8; N]>::try_from(bytes).map_err(|_| DecodeError::BadLength)
}

/// Get an impl [`fmt::Display`] for a byte slice without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

/// Formats the contained byte slice as lowercase hex.
pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            f.write_char(encode_nibble(byte >> 4))?;
            f.write_char(encode_nibble(byte & 0x0f))?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[inline]
const fn encode_nibble(nib: u8) -> char {
    (match nib {
        0..=9 => b'0' + nib,
        _ => b'a' + nib - 10,
    }) as char
}

#[inline]
const fn decode_nibble(c: u8) -> Result<u8, DecodeError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(DecodeError::InvalidCharacter),
    }
}

/// Returns `true` iff `s` is a well-formed hex string of `n` bytes.
pub fn is_hex_of_len(s: &str, n: usize) -> bool {
    s.len() == n * 2 && s.bytes().all(|c| decode_nibble(c).is_ok())
}

#[cfg(test)]
mod test {
    use proptest::{collection::vec, prelude::*, proptest};

    use super::*;

    #[test]
    fn encode_known_vectors() {
        assert_eq!("", encode(&[]));
        assert_eq!("01348900abff", encode(&[0x01, 0x34, 0x89, 0x00, 0xab, 0xff]));
    }

    #[test]
    fn decode_rejects_bad_inputs() {
        assert_eq!(decode("abc"), Err(DecodeError::OddInputLength));
        assert_eq!(decode("zz"), Err(DecodeError::InvalidCharacter));
        assert_eq!(decode_array::<4>("aabb"), Err(DecodeError::BadLength));
    }

    #[test]
    fn roundtrip_bytes_to_string_to_bytes() {
        proptest!(|(bytes in vec(any::<u8>(), 0..64))| {
            prop_assert_eq!(bytes.as_slice(), decode(&encode(&bytes)).unwrap());
        });
    }

    #[test]
    fn display_matches_encode() {
        proptest!(|(bytes in vec(any::<u8>(), 0..64))| {
            prop_assert_eq!(encode(&bytes), display(&bytes).to_string());
        });
    }

    #[test]
    fn mixed_case_decodes() {
        assert_eq!(decode("AbCd").unwrap(), vec![0xab, 0xcd]);
    }
}
