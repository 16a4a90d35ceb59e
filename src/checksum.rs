//! Checksums used by on-disk structures and the Fletcher-32 filter

use crate::error::{H5Error, Result};

/// Jenkins lookup3 `hashlittle` over `data`, seeded with `initval`.
///
/// Every version-2 era metadata structure (extensible/fixed arrays, v2
/// B-trees) ends with this hash of all preceding bytes, stored little-endian.
pub fn lookup3(data: &[u8], initval: u32) -> u32 {
    let mut a = 0xdeadbeef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(initval);
    let mut b = a;
    let mut c = a;

    if data.is_empty() {
        return c;
    }

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(word(&rest[0..4]));
        b = b.wrapping_add(word(&rest[4..8]));
        c = c.wrapping_add(word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    // tail of 1..=12 bytes, zero padded
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(word(&tail[0..4]));
    b = b.wrapping_add(word(&tail[4..8]));
    c = c.wrapping_add(word(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);

    c
}

fn word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Verify the trailing lookup3 checksum of a metadata structure.
///
/// `block` must include the 4-byte checksum at its end.
pub fn verify_metadata_checksum(block: &[u8], structure: &str) -> Result<()> {
    if block.len() < 4 {
        return Err(H5Error::InvalidFormat(format!(
            "{} is too short to carry a checksum",
            structure
        )));
    }

    let (body, stored) = block.split_at(block.len() - 4);
    let computed = lookup3(body, 0);

    if computed != word(stored) {
        return Err(H5Error::ChecksumMismatch(structure.to_string()));
    }

    Ok(())
}

/// Fletcher-32 over 16-bit big-endian words, odd trailing byte padded.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;

    let whole = data.len() & !1;

    // fold every 360 words so the 32-bit sums never overflow
    for block in data[..whole].chunks(720) {
        for pair in block.chunks_exact(2) {
            sum1 = sum1.wrapping_add(((pair[0] as u32) << 8) | pair[1] as u32);
            sum2 = sum2.wrapping_add(sum1);
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    if whole < data.len() {
        sum1 = sum1.wrapping_add((data[whole] as u32) << 8);
        sum2 = sum2.wrapping_add(sum1);
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);

    (sum2 << 16) | sum1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup3_empty() {
        assert_eq!(lookup3(&[], 0), 0xdeadbeef);
    }

    #[test]
    fn test_lookup3_known_values() {
        // reference vectors from lookup3.c driver5()
        assert_eq!(lookup3(b"Four score and seven years ago", 0), 0x17770551);
        assert_eq!(lookup3(b"Four score and seven years ago", 1), 0xcd628161);
    }

    #[test]
    fn test_verify_metadata_checksum() {
        let mut block = b"EAHD\0\0payload".to_vec();
        let sum = lookup3(&block, 0);
        block.extend_from_slice(&sum.to_le_bytes());
        assert!(verify_metadata_checksum(&block, "test block").is_ok());

        let last = block.len() - 5;
        block[last] ^= 0x01;
        assert!(matches!(
            verify_metadata_checksum(&block, "test block"),
            Err(H5Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_fletcher32() {
        assert_eq!(fletcher32(&[]), 0);
        // one word 0x0102: sum1 = 0x0102, sum2 = 0x0102
        assert_eq!(fletcher32(&[0x01, 0x02]), 0x0102_0102);
        // odd trailing byte is treated as the high half of a word
        assert_eq!(fletcher32(&[0x01]), 0x0100_0100);
        // two words: sum1 = 0x0001 + 0x0002, sum2 = 0x0001 + 0x0003
        assert_eq!(fletcher32(&[0x00, 0x01, 0x00, 0x02]), 0x0004_0003);
    }
}
