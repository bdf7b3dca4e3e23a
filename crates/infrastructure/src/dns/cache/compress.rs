//! Optional Snappy compression of stored wire bytes.
//!
//! The TTL offset table always refers to the uncompressed bytes, so the hit
//! path decompresses before patching and the store path extracts offsets
//! before compressing.

pub fn compress(wire: &[u8]) -> Vec<u8> {
    snap::raw::Encoder::new()
        .compress_vec(wire)
        .unwrap_or_else(|_| wire.to_vec())
}

pub fn decompress(stored: &[u8]) -> Option<Vec<u8>> {
    snap::raw::Decoder::new().decompress_vec(stored).ok()
}
