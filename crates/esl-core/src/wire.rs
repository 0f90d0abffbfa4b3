use crate::error::CodecError;

pub(crate) fn is_upper_hex(byte: u8) -> bool {
    byte.is_ascii_digit() || (b'A'..=b'F').contains(&byte)
}

/// Appends the low `width` bytes of `value`, most significant first.
pub(crate) fn push_be(out: &mut Vec<u8>, value: u32, width: usize) {
    for shift in (0..width).rev() {
        out.push((value >> (shift * 8)) as u8);
    }
}

pub fn decode_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.len() % 2 != 0 {
        return Err(CodecError::InvalidHex(text.to_string()));
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let high = hex_value(pair[0]);
            let low = hex_value(pair[1]);
            match (high, low) {
                (Some(high), Some(low)) => Ok((high << 4) | low),
                _ => Err(CodecError::InvalidHex(text.to_string())),
            }
        })
        .collect()
}

pub(crate) fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Parses a fixed-width hex field; rejects signs and whitespace.
pub(crate) fn parse_hex_field(field: &str) -> Option<u32> {
    if field.is_empty() || field.len() > 8 {
        return None;
    }
    field
        .bytes()
        .try_fold(0u32, |acc, byte| Some((acc << 4) | hex_value(byte)? as u32))
}
