//! CRC-32/ISO-HDLC helpers.
//!
//! This is the zlib/PNG CRC: reflected polynomial 0xEDB88320, initial value
//! and final XOR 0xFFFFFFFF. `crc32fast` implements exactly this variant.

/// CRC32 of a single buffer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC32 of several buffers, as if they were concatenated.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
