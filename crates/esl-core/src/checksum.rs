//! Frame checksum: reflected CRC-32 over the IEEE polynomial, seeded and
//! finalised with `0xFFFF_FFFF`, written to the wire big-endian.

const POLYNOMIAL: u32 = 0xEDB8_8320;

static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut slot = 0;
    while slot < 256 {
        let mut value = slot as u32;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 1 != 0 {
                POLYNOMIAL ^ (value >> 1)
            } else {
                value >> 1
            };
            bit += 1;
        }
        table[slot] = value;
        slot += 1;
    }
    table
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc = TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

pub fn checksum(bytes: &[u8]) -> [u8; 4] {
    crc32(bytes).to_be_bytes()
}

/// Appends the checksum of everything currently in `buf`.
pub fn append_checksum(buf: &mut Vec<u8>) {
    let trailer = checksum(buf);
    buf.extend_from_slice(&trailer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_ieee_reference() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 0x7707_3096);
        assert_eq!(TABLE[255], 0x2D02_EF8D);
    }

    #[test]
    fn check_value_fixture() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b"123456789"), [0xCB, 0xF4, 0x39, 0x26]);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn trailer_is_appended_in_place() {
        let mut buf = b"123456789".to_vec();
        append_checksum(&mut buf);
        assert_eq!(&buf[9..], &[0xCB, 0xF4, 0x39, 0x26]);
    }
}
