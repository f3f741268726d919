//! One interface over three compressors, used to optionally increase a
//! chunk's entropy before it is authenticated and enciphered.
//!
//! `restore` is always told the expected output length up front; the byte
//! count actually produced is compared against it and a mismatch is a
//! decipher error, never a silent truncation/extension.

use crate::error::{Result, ToolkitError};
use std::io::{Read, Write};

/// The codec identifiers carried on the wire (`cipher:entropy`) and as
/// the one-byte per-chunk marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntropyCodec {
    None = 0,
    Zip = 1,
    Bzip = 2,
    Lzma = 3,
}

impl EntropyCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            EntropyCodec::None => "None",
            EntropyCodec::Zip => "ZIP",
            EntropyCodec::Bzip => "BZIP",
            EntropyCodec::Lzma => "LZMA",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(EntropyCodec::None),
            "ZIP" => Ok(EntropyCodec::Zip),
            "BZIP" => Ok(EntropyCodec::Bzip),
            "LZMA" => Ok(EntropyCodec::Lzma),
            other => Err(ToolkitError::option(format!("unknown entropy codec {other}"))),
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EntropyCodec::None),
            1 => Ok(EntropyCodec::Zip),
            2 => Ok(EntropyCodec::Bzip),
            3 => Ok(EntropyCodec::Lzma),
            other => Err(ToolkitError::entropy(format!("unknown entropy byte {other}"))),
        }
    }

    /// Clamps a requested compression effort into the valid `1..9` range.
    pub fn clamp_level(level: u32) -> u32 {
        level.clamp(1, 9)
    }

    /// Compresses `plaintext` at the given effort level. Stateless per call.
    pub fn increase(self, plaintext: &[u8], level: u32) -> Result<Vec<u8>> {
        let level = Self::clamp_level(level);
        match self {
            EntropyCodec::None => Ok(plaintext.to_vec()),
            EntropyCodec::Zip => {
                let mut enc = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(level),
                );
                enc.write_all(plaintext)
                    .map_err(|e| ToolkitError::entropy(e.to_string()))?;
                enc.finish().map_err(|e| ToolkitError::entropy(e.to_string()))
            }
            EntropyCodec::Bzip => {
                let mut enc = bzip2::write::BzEncoder::new(
                    Vec::new(),
                    bzip2::Compression::new(level),
                );
                enc.write_all(plaintext)
                    .map_err(|e| ToolkitError::entropy(e.to_string()))?;
                enc.finish().map_err(|e| ToolkitError::entropy(e.to_string()))
            }
            EntropyCodec::Lzma => {
                let mut enc = xz2::write::XzEncoder::new(Vec::new(), level);
                enc.write_all(plaintext)
                    .map_err(|e| ToolkitError::entropy(e.to_string()))?;
                enc.finish().map_err(|e| ToolkitError::entropy(e.to_string()))
            }
        }
    }

    /// Decompresses `chaos` back to exactly `expected_len` plaintext bytes.
    /// Trailing bytes in `chaos` beyond what the decompressor needed (the
    /// reservoir padding bytes added to keep chunk framing fixed-size) are
    /// ignored.
    pub fn restore(self, expected_len: usize, chaos: &[u8]) -> Result<Vec<u8>> {
        if self == EntropyCodec::None {
            if chaos.len() < expected_len {
                return Err(ToolkitError::entropy("chunk shorter than expected length"));
            }
            return Ok(chaos[..expected_len].to_vec());
        }

        let mut out = vec![0u8; expected_len];
        let produced = match self {
            EntropyCodec::Zip => {
                let mut dec = flate2::read::DeflateDecoder::new(chaos);
                read_exact_up_to(&mut dec, &mut out)?
            }
            EntropyCodec::Bzip => {
                let mut dec = bzip2::read::BzDecoder::new(chaos);
                read_exact_up_to(&mut dec, &mut out)?
            }
            EntropyCodec::Lzma => {
                let mut dec = xz2::read::XzDecoder::new(chaos);
                read_exact_up_to(&mut dec, &mut out)?
            }
            EntropyCodec::None => unreachable!(),
        };
        if produced != expected_len {
            return Err(ToolkitError::entropy(format!(
                "restored {produced} bytes, expected {expected_len}"
            )));
        }
        Ok(out)
    }
}

/// Reads from `src` until `out` is full or the stream ends, returning the
/// number of bytes actually produced (never more than `out.len()`).
fn read_exact_up_to<R: Read>(src: &mut R, out: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < out.len() {
        let read = src
            .read(&mut out[total..])
            .map_err(|e| ToolkitError::entropy(e.to_string()))?;
        if read == 0 {
            break;
        }
        total += read;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let chaos = EntropyCodec::Zip.increase(&data, 9).unwrap();
        let restored = EntropyCodec::Zip.restore(data.len(), &chaos).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn bzip_round_trips() {
        let data = vec![0xAAu8; 4096];
        let chaos = EntropyCodec::Bzip.increase(&data, 5).unwrap();
        let restored = EntropyCodec::Bzip.restore(data.len(), &chaos).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn lzma_round_trips() {
        let data = b"abcabcabcabcabcabcabcabcabcabc".to_vec();
        let chaos = EntropyCodec::Lzma.increase(&data, 1).unwrap();
        let restored = EntropyCodec::Lzma.restore(data.len(), &chaos).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn none_is_identity() {
        let data = b"verbatim".to_vec();
        let chaos = EntropyCodec::None.increase(&data, 9).unwrap();
        assert_eq!(chaos, data);
        let restored = EntropyCodec::None.restore(data.len(), &chaos).unwrap();
        assert_eq!(restored, data);
    }
}
