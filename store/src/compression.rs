//! Codec registry: maps the 32-bit tag carried in every block index to a
//! concrete chunk codec, and packs/unpacks chunk payload bytes.
//!
//! Chunks are compressed independently; a block's payload is the
//! concatenation of the stored (post-codec) chunk bytes.

use std::io::Cursor;

use crate::Error;

pub const TAG_NONE: u32 = 0;
pub const TAG_BROTLI_GENERIC_MIN: u32 = u32::from_be_bytes(*b"btg1");
pub const TAG_BROTLI_GENERIC_DEFAULT: u32 = u32::from_be_bytes(*b"btg2");
pub const TAG_BROTLI_GENERIC_MAX: u32 = u32::from_be_bytes(*b"btg3");
pub const TAG_BROTLI_TEXT_MIN: u32 = u32::from_be_bytes(*b"btt1");
pub const TAG_BROTLI_TEXT_DEFAULT: u32 = u32::from_be_bytes(*b"btt2");
pub const TAG_BROTLI_TEXT_MAX: u32 = u32::from_be_bytes(*b"btt3");
pub const TAG_LZ4_DEFAULT: u32 = u32::from_be_bytes(*b"lz4d");
pub const TAG_ZSTD_MIN: u32 = u32::from_be_bytes(*b"zst1");
pub const TAG_ZSTD_DEFAULT: u32 = u32::from_be_bytes(*b"zst2");
pub const TAG_ZSTD_MAX: u32 = u32::from_be_bytes(*b"zst3");

const BROTLI_QUALITY_MIN: i32 = 2;
const BROTLI_QUALITY_DEFAULT: i32 = 9;
const BROTLI_QUALITY_MAX: i32 = 11;
const ZSTD_LEVEL_MIN: i32 = 1;
const ZSTD_LEVEL_MAX: i32 = 19;

/// A compression selection as named on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    BrotliGenericMin,
    BrotliGenericDefault,
    BrotliGenericMax,
    BrotliTextMin,
    BrotliTextDefault,
    BrotliTextMax,
    Lz4Default,
    ZstdMin,
    ZstdDefault,
    ZstdMax,
}

impl CompressionAlgorithm {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "none" => Ok(CompressionAlgorithm::None),
            "brotli_min" => Ok(CompressionAlgorithm::BrotliGenericMin),
            "brotli" => Ok(CompressionAlgorithm::BrotliGenericDefault),
            "brotli_max" => Ok(CompressionAlgorithm::BrotliGenericMax),
            "brotli_text_min" => Ok(CompressionAlgorithm::BrotliTextMin),
            "brotli_text" => Ok(CompressionAlgorithm::BrotliTextDefault),
            "brotli_text_max" => Ok(CompressionAlgorithm::BrotliTextMax),
            "lz4" => Ok(CompressionAlgorithm::Lz4Default),
            "zstd_min" => Ok(CompressionAlgorithm::ZstdMin),
            "zstd" => Ok(CompressionAlgorithm::ZstdDefault),
            "zstd_max" => Ok(CompressionAlgorithm::ZstdMax),
            other => Err(Error::Config(format!(
                "unknown compression algorithm '{}'",
                other
            ))),
        }
    }

    pub fn tag(&self) -> u32 {
        match self {
            CompressionAlgorithm::None => TAG_NONE,
            CompressionAlgorithm::BrotliGenericMin => TAG_BROTLI_GENERIC_MIN,
            CompressionAlgorithm::BrotliGenericDefault => TAG_BROTLI_GENERIC_DEFAULT,
            CompressionAlgorithm::BrotliGenericMax => TAG_BROTLI_GENERIC_MAX,
            CompressionAlgorithm::BrotliTextMin => TAG_BROTLI_TEXT_MIN,
            CompressionAlgorithm::BrotliTextDefault => TAG_BROTLI_TEXT_DEFAULT,
            CompressionAlgorithm::BrotliTextMax => TAG_BROTLI_TEXT_MAX,
            CompressionAlgorithm::Lz4Default => TAG_LZ4_DEFAULT,
            CompressionAlgorithm::ZstdMin => TAG_ZSTD_MIN,
            CompressionAlgorithm::ZstdDefault => TAG_ZSTD_DEFAULT,
            CompressionAlgorithm::ZstdMax => TAG_ZSTD_MAX,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self, Error> {
        match tag {
            TAG_NONE => Ok(CompressionAlgorithm::None),
            TAG_BROTLI_GENERIC_MIN => Ok(CompressionAlgorithm::BrotliGenericMin),
            TAG_BROTLI_GENERIC_DEFAULT => Ok(CompressionAlgorithm::BrotliGenericDefault),
            TAG_BROTLI_GENERIC_MAX => Ok(CompressionAlgorithm::BrotliGenericMax),
            TAG_BROTLI_TEXT_MIN => Ok(CompressionAlgorithm::BrotliTextMin),
            TAG_BROTLI_TEXT_DEFAULT => Ok(CompressionAlgorithm::BrotliTextDefault),
            TAG_BROTLI_TEXT_MAX => Ok(CompressionAlgorithm::BrotliTextMax),
            TAG_LZ4_DEFAULT => Ok(CompressionAlgorithm::Lz4Default),
            TAG_ZSTD_MIN => Ok(CompressionAlgorithm::ZstdMin),
            TAG_ZSTD_DEFAULT => Ok(CompressionAlgorithm::ZstdDefault),
            TAG_ZSTD_MAX => Ok(CompressionAlgorithm::ZstdMax),
            other => Err(Error::Corruption(format!(
                "unknown compression tag 0x{:08x}",
                other
            ))),
        }
    }

    /// Compress one chunk for storage.
    pub fn pack_chunk(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::BrotliGenericMin => brotli_pack(data, BROTLI_QUALITY_MIN, false),
            CompressionAlgorithm::BrotliGenericDefault => {
                brotli_pack(data, BROTLI_QUALITY_DEFAULT, false)
            }
            CompressionAlgorithm::BrotliGenericMax => brotli_pack(data, BROTLI_QUALITY_MAX, false),
            CompressionAlgorithm::BrotliTextMin => brotli_pack(data, BROTLI_QUALITY_MIN, true),
            CompressionAlgorithm::BrotliTextDefault => {
                brotli_pack(data, BROTLI_QUALITY_DEFAULT, true)
            }
            CompressionAlgorithm::BrotliTextMax => brotli_pack(data, BROTLI_QUALITY_MAX, true),
            CompressionAlgorithm::Lz4Default => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionAlgorithm::ZstdMin => zstd_pack(data, ZSTD_LEVEL_MIN),
            CompressionAlgorithm::ZstdDefault => zstd_pack(data, zstd::DEFAULT_COMPRESSION_LEVEL),
            CompressionAlgorithm::ZstdMax => zstd_pack(data, ZSTD_LEVEL_MAX),
        }
    }

    /// Restore one chunk's content from its stored bytes.
    pub fn unpack_chunk(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::BrotliGenericMin
            | CompressionAlgorithm::BrotliGenericDefault
            | CompressionAlgorithm::BrotliGenericMax
            | CompressionAlgorithm::BrotliTextMin
            | CompressionAlgorithm::BrotliTextDefault
            | CompressionAlgorithm::BrotliTextMax => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut Cursor::new(data), &mut out)
                    .map_err(|e| Error::Corruption(format!("brotli decode: {}", e)))?;
                Ok(out)
            }
            CompressionAlgorithm::Lz4Default => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Corruption(format!("lz4 decode: {}", e))),
            CompressionAlgorithm::ZstdMin
            | CompressionAlgorithm::ZstdDefault
            | CompressionAlgorithm::ZstdMax => zstd::stream::decode_all(Cursor::new(data))
                .map_err(|e| Error::Corruption(format!("zstd decode: {}", e))),
        }
    }
}

fn brotli_pack(data: &[u8], quality: i32, text_mode: bool) -> Result<Vec<u8>, Error> {
    let mut params = brotli::enc::BrotliEncoderParams {
        quality,
        ..Default::default()
    };
    if text_mode {
        params.mode = brotli::enc::backward_references::BrotliEncoderMode::BROTLI_MODE_TEXT;
    }
    let mut out = Vec::new();
    brotli::BrotliCompress(&mut Cursor::new(data), &mut out, &params)
        .map_err(|e| Error::Fatal(format!("brotli encode: {}", e)))?;
    Ok(out)
}

fn zstd_pack(data: &[u8], level: i32) -> Result<Vec<u8>, Error> {
    zstd::stream::encode_all(Cursor::new(data), level)
        .map_err(|e| Error::Fatal(format!("zstd encode: {}", e)))
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::BrotliGenericMin => "brotli_min",
            CompressionAlgorithm::BrotliGenericDefault => "brotli",
            CompressionAlgorithm::BrotliGenericMax => "brotli_max",
            CompressionAlgorithm::BrotliTextMin => "brotli_text_min",
            CompressionAlgorithm::BrotliTextDefault => "brotli_text",
            CompressionAlgorithm::BrotliTextMax => "brotli_text_max",
            CompressionAlgorithm::Lz4Default => "lz4",
            CompressionAlgorithm::ZstdMin => "zstd_min",
            CompressionAlgorithm::ZstdDefault => "zstd",
            CompressionAlgorithm::ZstdMax => "zstd_max",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::none("none")]
    #[case::brotli_min("brotli_min")]
    #[case::brotli("brotli")]
    #[case::brotli_max("brotli_max")]
    #[case::brotli_text_min("brotli_text_min")]
    #[case::brotli_text("brotli_text")]
    #[case::brotli_text_max("brotli_text_max")]
    #[case::lz4("lz4")]
    #[case::zstd_min("zstd_min")]
    #[case::zstd("zstd")]
    #[case::zstd_max("zstd_max")]
    fn name_tag_round_trip(#[case] name: &str) {
        let algo = CompressionAlgorithm::from_name(name).unwrap();
        assert_eq!(algo.to_string(), name);
        assert_eq!(CompressionAlgorithm::from_tag(algo.tag()).unwrap(), algo);
    }

    #[rstest]
    #[case::none("none")]
    #[case::brotli("brotli")]
    #[case::brotli_text("brotli_text")]
    #[case::lz4("lz4")]
    #[case::zstd("zstd")]
    fn pack_unpack_round_trip(#[case] name: &str) {
        let algo = CompressionAlgorithm::from_name(name).unwrap();
        let data: Vec<u8> = b"the quick brown fox jumps over the lazy dog"
            .repeat(64)
            .to_vec();
        let packed = algo.pack_chunk(&data).unwrap();
        assert_eq!(algo.unpack_chunk(&packed).unwrap(), data);
    }

    #[test]
    fn unknown_name_and_tag_are_rejected() {
        assert!(matches!(
            CompressionAlgorithm::from_name("snappy"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            CompressionAlgorithm::from_tag(0xdead_beef),
            Err(Error::Corruption(_))
        ));
    }
}
