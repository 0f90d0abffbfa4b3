use crate::error::CodecError;
use crate::planes::encode_image_planes;
use crate::wire::{decode_hex, push_be};
use crate::{is_tag_id, Page, Pattern};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub const KEY_BLOCK: [u8; 14] = [
    0x0D, 0xFF, 0xFF, 0xFF, 0x00, 0xF6, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];
const QUERY_MARKER: [u8; 6] = [0x08, 0x12, 0x34, 0x56, 0x00, 0xEC];
const GROUP_MARKER: [u8; 6] = [0x09, 0x12, 0x34, 0x56, 0x00, 0xEC];
const LED_MARKER: u8 = 0x07;
const CONTINUOUS_FLASH: [u8; 2] = [0x7F, 0xFE];
const MAX_ENTITY_LEN: usize = 0xFF_FFFF;

/// Longest finite flash duration accepted from callers.
pub const MAX_FLASH_TIMES: u16 = 36_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flash {
    Times(u16),
    Continuous,
}

impl Default for Flash {
    fn default() -> Self {
        Self::Times(0)
    }
}

impl Flash {
    /// `-1` requests continuous flashing; other values clamp to 0..=36000.
    pub fn from_request(times: i64) -> Self {
        if times == -1 {
            Flash::Continuous
        } else {
            Flash::Times(times.clamp(0, MAX_FLASH_TIMES as i64) as u16)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedSignal {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
    pub flash: Flash,
}

impl LedSignal {
    fn color_bits(&self) -> u8 {
        ((self.red as u8) << 2) | ((self.green as u8) << 1) | self.blue as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSlot {
    pub group: u16,
    pub index: u8,
}

/// Everything needed to build one tag's entity payload.
#[derive(Debug, Clone, Copy)]
pub struct TagCommand<'a> {
    pub tag_id: &'a str,
    pub token: u16,
    pub pattern: Pattern,
    pub page: Page,
    pub led: LedSignal,
    pub group: Option<GroupSlot>,
    pub image: Option<&'a RgbImage>,
}

impl<'a> TagCommand<'a> {
    pub fn new(tag_id: &'a str, token: u16, pattern: Pattern) -> Self {
        Self {
            tag_id,
            token,
            pattern,
            page: Page::default(),
            led: LedSignal::default(),
            group: None,
            image: None,
        }
    }
}

/// Builds `len(3) + tag id(6) + op code + blocks`, where `len` counts hex
/// characters of the entity after the length field.
pub fn encode_entity(command: &TagCommand<'_>) -> Result<Vec<u8>, CodecError> {
    if !is_tag_id(command.tag_id) {
        return Err(CodecError::InvalidTagId(command.tag_id.to_string()));
    }
    let tag = decode_hex(command.tag_id)?;

    let mut body = vec![command.pattern.op_code(command.page)];
    if command.pattern == Pattern::Query {
        body.extend_from_slice(&QUERY_MARKER);
        let (group, index) = command
            .group
            .map(|slot| (slot.group, slot.index))
            .unwrap_or((0xFFFF, 0));
        push_be(&mut body, group as u32, 2);
        body.push(index);
        push_led(&mut body, &command.led, command.token);
    } else {
        body.extend_from_slice(&KEY_BLOCK);
        push_led(&mut body, &command.led, command.token);
        if let Some(slot) = command.group {
            body.extend_from_slice(&GROUP_MARKER);
            push_be(&mut body, slot.group as u32, 2);
            body.push(slot.index % 8);
            body.push(slot.index / 8);
        }
        if let Some(image) = command.image {
            body.extend(encode_image_planes(image, command.tag_id).bytes);
        }
    }

    let declared = (body.len() + tag.len()) * 2;
    if declared > MAX_ENTITY_LEN {
        return Err(CodecError::LengthOverflow {
            size: declared,
            max: MAX_ENTITY_LEN,
        });
    }
    let mut entity = Vec::with_capacity(3 + tag.len() + body.len());
    push_be(&mut entity, declared as u32, 3);
    entity.extend(tag);
    entity.extend(body);
    Ok(entity)
}

fn push_led(out: &mut Vec<u8>, led: &LedSignal, token: u16) {
    out.push(LED_MARKER);
    out.push(led.color_bits());
    push_be(out, token as u32, 2);
    out.extend_from_slice(&[0x00, 0xED]);
    match led.flash {
        Flash::Continuous => out.extend_from_slice(&CONTINUOUS_FLASH),
        Flash::Times(times) => push_be(out, times as u32, 2),
    }
}
