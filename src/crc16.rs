//! Cluster hash slots.
//!
//! Redis Cluster maps every key to one of 16384 slots with CRC16-XMODEM
//! (polynomial 0x1021) over the key, or over its hash tag when it has one.

/// Number of hash slots in a Redis Cluster.
pub const HASH_SLOTS: u16 = 16384;

/// CRC16-XMODEM lookup table (polynomial 0x1021).
static CRC16_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0u16;
    while i < 256 {
        let mut crc = i << 8;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// CRC16-XMODEM checksum of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize]
    })
}

/// The part of `key` that is hashed.
///
/// That is the text between the first `{` and the next `}` when it is
/// non-empty; otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = memchr::memchr(b'{', key) else {
        return key;
    };
    match memchr::memchr(b'}', &key[open + 1..]) {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}

/// Slot owning `key`: `CRC16(hash_tag(key)) mod 16384`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % HASH_SLOTS
}

// ── Tests ──────────────────────────────────────────────────────────
