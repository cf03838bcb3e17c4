// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm to use for appended terms
/// (document summaries and index tree nodes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,
}

impl CompressionType {
    // Every appended term carries its own compression marker, so terms
    // written with an older setting stay readable after a config change.
    pub(crate) fn compress(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Self::None => {
                let mut out = Vec::with_capacity(raw.len() + 1);
                out.push(0);
                out.extend_from_slice(raw);
                out
            }

            #[cfg(feature = "lz4")]
            Self::Lz4 => {
                let mut out = lz4_flex::compress_prepend_size(raw);
                out.insert(0, 1);
                out
            }
        }
    }
}

pub(crate) fn decompress_term(data: &[u8]) -> crate::Result<Vec<u8>> {
    match data.split_first() {
        Some((0, rest)) => Ok(rest.to_vec()),

        #[cfg(feature = "lz4")]
        Some((1, rest)) => {
            lz4_flex::decompress_size_prepended(rest).map_err(|_| crate::Error::Decompress)
        }

        _ => Err(crate::Error::Decompress),
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(0)?,

            #[cfg(feature = "lz4")]
            Self::Lz4 => writer.write_u8(1)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_term_roundtrip_none() -> crate::Result<()> {
        let data = b"some document body".to_vec();
        let compressed = CompressionType::None.compress(&data);
        assert_eq!(data, decompress_term(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "lz4")]
    mod lz4 {
        use super::*;
        use test_log::test;

        #[test]
        fn compression_term_roundtrip_lz4() -> crate::Result<()> {
            let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
            let compressed = CompressionType::Lz4.compress(&data);
            assert_eq!(data, decompress_term(&compressed)?);
            Ok(())
        }

        #[test]
        fn compression_marker_mixed() -> crate::Result<()> {
            // terms written uncompressed stay readable
            let data = b"body".to_vec();
            let compressed = CompressionType::None.compress(&data);
            assert_eq!(data, decompress_term(&compressed)?);
            Ok(())
        }
    }
}
