//! LZ4 compression wrapper for envelope payloads (COMPRESSED flag)

use super::ProtocolError;

/// Compress data using LZ4 with size prepend
///
/// The lz4_flex::compress_prepend_size function stores the uncompressed size
/// at the beginning, allowing automatic decompression.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress data that was compressed with `compress()`, refusing inputs
/// whose declared uncompressed size exceeds `ceiling`.
pub fn decompress(data: &[u8], ceiling: usize) -> Result<Vec<u8>, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::BufferTooShort {
            need: 4,
            got: data.len(),
        });
    }
    let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if declared > ceiling {
        return Err(ProtocolError::OversizeClaim { declared, ceiling });
    }
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| ProtocolError::DecompressionFailed(e.to_string()))
}

/// Compress only when it actually wins; returns None when the payload is
/// incompressible or too small to bother.
pub fn compress_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 64 {
        return None;
    }
    let compressed = compress(data);
    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}
