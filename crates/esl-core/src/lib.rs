pub mod checksum;
pub mod entity;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod planes;
pub mod reassembly;
pub mod registration;
mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use error::{CodecError, RegistrationError};
pub use wire::decode_hex;

/// Upper bound of tags addressed by one push call or one group bitmap.
pub const MAX_TAGS_PER_REQUEST: usize = 216;

pub fn is_store_code(value: &str) -> bool {
    value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit())
}

pub fn is_tag_id(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(wire::is_upper_hex)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Page {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl Default for Page {
    fn default() -> Self {
        Self::P0
    }
}

impl Page {
    pub const ALL: [Page; 8] = [
        Page::P0,
        Page::P1,
        Page::P2,
        Page::P3,
        Page::P4,
        Page::P5,
        Page::P6,
        Page::P7,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Out-of-range requests snap to the nearest valid page.
    pub fn clamped(index: i64) -> Self {
        Self::ALL[index.clamp(0, 7) as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Page::P0 => "p0",
            Page::P1 => "p1",
            Page::P2 => "p2",
            Page::P3 => "p3",
            Page::P4 => "p4",
            Page::P5 => "p5",
            Page::P6 => "p6",
            Page::P7 => "p7",
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Page {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        let digits = normalized.trim_start_matches('p');
        match digits.parse::<u8>() {
            Ok(value) if value < 8 => Ok(Self::ALL[value as usize]),
            _ => Err(format!("Unknown page: {input}")),
        }
    }
}

/// Class of tag operation; each maps to one protocol op code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    UpdateDisplay,
    UpdatePart,
    Update,
    Display,
    DisplayInfo,
    Query,
    Check,
    Sort,
    Key,
    PreOta,
    Led,
}

impl Default for Pattern {
    fn default() -> Self {
        Self::UpdateDisplay
    }
}

const UPDATE_DISPLAY_CODES: [u8; 8] = [0x33, 0x36, 0x39, 0x3C, 0x40, 0x41, 0x42, 0x43];
const UPDATE_CODES: [u8; 8] = [0x34, 0x37, 0x3A, 0x3D, 0x44, 0x45, 0x46, 0x47];
const DISPLAY_CODES: [u8; 8] = [0x35, 0x38, 0x3B, 0x3E, 0x48, 0x49, 0x4A, 0x4B];

impl Pattern {
    pub fn op_code(self, page: Page) -> u8 {
        let slot = page.index() as usize;
        match self {
            Pattern::UpdateDisplay => UPDATE_DISPLAY_CODES[slot],
            Pattern::Update => UPDATE_CODES[slot],
            Pattern::Display => DISPLAY_CODES[slot],
            Pattern::UpdatePart | Pattern::DisplayInfo => 0x31,
            Pattern::Led => 0x32,
            Pattern::Query => 0x56,
            Pattern::Check => 0x70,
            Pattern::Sort | Pattern::Key | Pattern::PreOta => 0x20,
        }
    }

    pub fn carries_image(self) -> bool {
        matches!(
            self,
            Pattern::UpdateDisplay | Pattern::Update | Pattern::UpdatePart
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::UpdateDisplay => "update_display",
            Pattern::UpdatePart => "update_part",
            Pattern::Update => "update",
            Pattern::Display => "display",
            Pattern::DisplayInfo => "display_info",
            Pattern::Query => "query",
            Pattern::Check => "check",
            Pattern::Sort => "sort",
            Pattern::Key => "key",
            Pattern::PreOta => "pre_ota",
            Pattern::Led => "led",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "update_display" | "updatedisplay" => Ok(Pattern::UpdateDisplay),
            "update_part" | "updatepart" => Ok(Pattern::UpdatePart),
            "update" => Ok(Pattern::Update),
            "display" => Ok(Pattern::Display),
            "display_info" | "displayinfo" | "displayinfor" => Ok(Pattern::DisplayInfo),
            "query" => Ok(Pattern::Query),
            "check" => Ok(Pattern::Check),
            "sort" => Ok(Pattern::Sort),
            "key" => Ok(Pattern::Key),
            "pre_ota" | "preota" => Ok(Pattern::PreOta),
            "led" => Ok(Pattern::Led),
            other => Err(format!("Unknown pattern: {other}")),
        }
    }
}
