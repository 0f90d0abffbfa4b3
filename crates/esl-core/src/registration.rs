//! AP registration handshake.
//!
//! Layout (offsets in bytes):
//!
//! ```text
//! 0  2 3 4 5 6 7    11          23   27   31 32  35       43
//! AA , D , 6 , SSSS MMMMMMMMMMMM Vhhh Vfff . fff CCCCCCCC
//! ```
//!
//! `AA` AP id (hex), `D` backlog flag, `SSSS` store code, `M` MAC,
//! `Vhhh` hardware version, `Vfff.fff` firmware version, `C` check tail.

use crate::error::RegistrationError;
use crate::wire::is_upper_hex;
use serde::{Deserialize, Serialize};

pub const REGISTRATION_LEN: usize = 43;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub ap_id: String,
    pub has_backlog: bool,
    pub store_code: String,
    pub mac: String,
    pub hardware: String,
    pub firmware: String,
}

impl Registration {
    /// Session table key: store code followed by AP id.
    pub fn key(&self) -> String {
        format!("{}{}", self.store_code, self.ap_id)
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Hex,
    Digit,
    Flag,
    Any,
    Literal(u8),
}

impl Slot {
    fn accepts(self, byte: u8) -> bool {
        match self {
            Slot::Hex => is_upper_hex(byte),
            Slot::Digit => byte.is_ascii_digit(),
            Slot::Flag => byte == b'0' || byte == b'1',
            Slot::Any => byte != b'\n' && byte != b'\r',
            Slot::Literal(expected) => byte == expected,
        }
    }
}

const GRAMMAR: &[(Slot, usize)] = &[
    (Slot::Hex, 2),
    (Slot::Literal(b','), 1),
    (Slot::Flag, 1),
    (Slot::Literal(b','), 1),
    (Slot::Literal(b'6'), 1),
    (Slot::Literal(b','), 1),
    (Slot::Hex, 16),
    (Slot::Literal(b'V'), 1),
    (Slot::Digit, 3),
    (Slot::Literal(b'V'), 1),
    (Slot::Digit, 3),
    (Slot::Any, 1),
    (Slot::Digit, 3),
    (Slot::Hex, 8),
];

/// Validates the first handshake read. Surrounding whitespace and trailing
/// NUL padding are ignored; anything after the check tail is not inspected.
pub fn parse_registration(raw: &[u8]) -> Result<Registration, RegistrationError> {
    let trimmed = trim(raw);
    if trimmed.len() < REGISTRATION_LEN {
        return Err(RegistrationError::TooShort { len: trimmed.len() });
    }
    let head = &trimmed[..REGISTRATION_LEN];
    if !head.is_ascii() {
        return Err(RegistrationError::NotAscii);
    }

    let mut offset = 0;
    for &(slot, width) in GRAMMAR {
        for byte in &head[offset..offset + width] {
            if !slot.accepts(*byte) {
                return Err(RegistrationError::Unexpected { offset });
            }
            offset += 1;
        }
    }

    let text = |from: usize, to: usize| String::from_utf8_lossy(&head[from..to]).into_owned();
    Ok(Registration {
        ap_id: text(0, 2),
        has_backlog: head[3] == b'1',
        store_code: text(7, 11),
        mac: text(11, 23),
        hardware: text(23, 27),
        firmware: text(27, 35),
    })
}

fn trim(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |idx| idx + 1);
    let start = raw[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    &raw[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "01,0,6,0001A1B2C3D4E5F6V100V001.00212345678";

    #[test]
    fn parses_sample_handshake() {
        let registration = parse_registration(SAMPLE.as_bytes()).expect("valid");
        assert_eq!(
            registration,
            Registration {
                ap_id: "01".to_string(),
                has_backlog: false,
                store_code: "0001".to_string(),
                mac: "A1B2C3D4E5F6".to_string(),
                hardware: "V100".to_string(),
                firmware: "V001.002".to_string(),
            }
        );
        assert_eq!(registration.key(), "000101");
    }

    #[test]
    fn backlog_flag_and_padding() {
        let raw = format!("  {}\r\n\0\0\0", SAMPLE.replacen(",0,", ",1,", 1));
        let registration = parse_registration(raw.as_bytes()).expect("valid");
        assert!(registration.has_backlog);
    }

    #[test]
    fn rejects_grammar_violations() {
        assert_eq!(
            parse_registration(b"01,0,6,0001"),
            Err(RegistrationError::TooShort { len: 11 })
        );
        let bad_flag = SAMPLE.replacen(",0,", ",2,", 1);
        assert_eq!(
            parse_registration(bad_flag.as_bytes()),
            Err(RegistrationError::Unexpected { offset: 3 })
        );
        let lower_mac = SAMPLE.replace("A1B2", "a1b2");
        assert_eq!(
            parse_registration(lower_mac.as_bytes()),
            Err(RegistrationError::Unexpected { offset: 11 })
        );
        let bad_version = SAMPLE.replace("V100", "X100");
        assert_eq!(
            parse_registration(bad_version.as_bytes()),
            Err(RegistrationError::Unexpected { offset: 23 })
        );
    }
}
