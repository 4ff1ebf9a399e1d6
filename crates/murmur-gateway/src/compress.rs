//! Optional payload decompression.

use std::io::Read;

use flate2::read::ZlibDecoder;

/// Byte-buffer to JSON-text decoder for compressed gateway frames.
pub trait Inflater: Send + Sync {
    /// Decompress one frame into a UTF-8 JSON string.
    ///
    /// `None` drops the frame without surfacing an error.
    fn inflate(&self, bytes: &[u8]) -> Option<String>;
}

/// zlib (RFC 1950) inflater for per-payload compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibInflater;

impl Inflater for ZlibInflater {
    fn inflate(&self, bytes: &[u8]) -> Option<String> {
        let mut text = String::new();
        ZlibDecoder::new(bytes).read_to_string(&mut text).ok()?;
        Some(text)
    }
}
