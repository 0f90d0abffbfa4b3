//! Outbound frame builders.
//!
//! Every frame opens with `E`, six hex digits of declared length and a six
//! character quality code; the binary body that follows ends in a checksum.

use crate::checksum::append_checksum;
use crate::error::CodecError;
use crate::wire::push_be;
use crate::MAX_TAGS_PER_REQUEST;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const BATCH_MARKER: [u8; 2] = [0x0F, 0x1B];
pub const QUALITY_UNGROUPED: &str = "FFFFFF";
pub const QUALITY_CLUSTERED: &str = "FFFFFE";
pub const QUALITY_BROADCAST: &str = "FFFFFD";
pub const QUALITY_GROUP: &str = "FFFFFC";

/// Observed cut-off for the suffix-collision ratio in [`quality_code`].
pub const DEFAULT_SUFFIX_RATIO: f32 = 10.0;

/// Acknowledgment echoed to an AP after every substantive read.
pub const DATA_ACK: &[u8] = b"$";

const BROADCAST_HEADER: &[u8; 13] = b"E000027FFFFFD";
const BROADCAST_PREAMBLE: [u8; 4] = [0x00, 0x01, 0x0F, 0x33];
const GROUP_BITMAP_BYTES: usize = MAX_TAGS_PER_REQUEST / 8;
const MAX_DECLARED_LEN: usize = 0xFF_FFFF;
const QUALITY_LEN: usize = 6;

/// Batch of pre-encoded entities, always tagged `FFFFFE`.
pub fn encode_batch<E: AsRef<[u8]>>(entities: &[E]) -> Result<Vec<u8>, CodecError> {
    let mut body = batch_prefix(entities.len())?;
    for entity in entities {
        body.extend_from_slice(entity.as_ref());
    }
    append_checksum(&mut body);
    wrap(QUALITY_CLUSTERED, body)
}

#[derive(Debug, Clone, Copy)]
pub struct GroupMember<'a> {
    pub tag_id: &'a str,
    pub index: u8,
    pub entity: &'a [u8],
}

/// Batch with optional group addressing.
///
/// With a group id, members are written in slot order behind a 216-bit
/// membership bitmap and the frame carries the group quality code.
pub fn encode_group_batch(
    members: &[GroupMember<'_>],
    group: Option<u16>,
    suffix_ratio: f32,
) -> Result<Vec<u8>, CodecError> {
    let mut body = batch_prefix(members.len())?;
    let quality = quality_code(members.iter().map(|m| m.tag_id), group, suffix_ratio);

    match group {
        None => {
            for member in members {
                body.extend_from_slice(member.entity);
            }
        }
        Some(group_id) => {
            let mut ordered = members.to_vec();
            ordered.sort_by_key(|member| member.index);
            let mut bitmap = [0u8; GROUP_BITMAP_BYTES];
            for pair in ordered.windows(2) {
                if pair[0].index == pair[1].index {
                    return Err(CodecError::GroupIndex {
                        index: pair[0].index,
                    });
                }
            }
            for member in &ordered {
                let slot = member.index as usize;
                if slot >= MAX_TAGS_PER_REQUEST {
                    return Err(CodecError::GroupIndex {
                        index: member.index,
                    });
                }
                bitmap[slot / 8] |= 0x80 >> (slot % 8);
            }

            let mut section = Vec::with_capacity(2 + GROUP_BITMAP_BYTES);
            push_be(&mut section, group_id as u32, 2);
            section.extend_from_slice(&bitmap);
            body.push(section.len() as u8);
            body.extend(section);
            for member in &ordered {
                body.extend_from_slice(member.entity);
            }
        }
    }

    append_checksum(&mut body);
    wrap(quality, body)
}

/// Grouping hint derived from how often neighbouring ids (sorted by their
/// reversed text) share the final eight characters.
pub fn quality_code<'a, I>(tag_ids: I, group: Option<u16>, suffix_ratio: f32) -> &'static str
where
    I: IntoIterator<Item = &'a str>,
{
    if group.is_some() {
        return QUALITY_GROUP;
    }
    let mut ids = tag_ids.into_iter().collect::<Vec<_>>();
    if ids.len() < 2 {
        return QUALITY_UNGROUPED;
    }

    ids.sort_by_cached_key(|id| id.chars().rev().collect::<String>());
    let shared = ids
        .windows(2)
        .filter(|pair| suffix(pair[0], 4) == suffix(pair[1], 4))
        .count();
    let ratio = shared as f32 / ids.len() as f32;
    if ratio < suffix_ratio {
        QUALITY_CLUSTERED
    } else {
        QUALITY_UNGROUPED
    }
}

fn suffix(id: &str, from: usize) -> &str {
    id.get(from..).unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Broadcast {
    /// Radio shift speed; `fast` selects the accelerated profile.
    ShiftSpeed { fast: bool },
    SwitchPage { page: u8 },
    DisplayBarcode,
}

impl Broadcast {
    pub fn op_code(&self) -> u8 {
        match self {
            Broadcast::ShiftSpeed { .. } => 0x03,
            Broadcast::SwitchPage { .. } => 0x04,
            Broadcast::DisplayBarcode => 0x05,
        }
    }

    /// Flag pair and effective token. Page commands carry the page number in
    /// place of the caller's token.
    fn flags(&self, token: u16) -> ([u8; 2], u16) {
        match *self {
            Broadcast::ShiftSpeed { fast: true } => ([0xC8, 0x03], token),
            Broadcast::ShiftSpeed { fast: false } => ([0x00, 0x00], token),
            Broadcast::DisplayBarcode => ([0xD8, 0x12], token),
            Broadcast::SwitchPage { page } if page < 8 => {
                ([0x01, ((page + 1) << 4) | 0x02], page as u16 + 1)
            }
            Broadcast::SwitchPage { .. } => ([0x01, 0x11], 9),
        }
    }
}

pub fn encode_broadcast(command: Broadcast, token: u16) -> Vec<u8> {
    let (flags, token) = command.flags(token);
    let mut block = vec![command.op_code()];
    push_be(&mut block, token as u32, 2);
    block.extend_from_slice(&[0xFF; 8]);
    block.extend_from_slice(&[0x00; 4]);
    block.extend_from_slice(&[0xFF; 4]);
    block.extend_from_slice(&flags);
    append_checksum(&mut block);

    let mut body = BROADCAST_PREAMBLE.to_vec();
    body.extend(block);
    append_checksum(&mut body);

    let mut frame = BROADCAST_HEADER.to_vec();
    frame.extend(body);
    frame
}

/// Text sent to an AP once its registration handshake is accepted.
pub fn registration_ack(now: NaiveDateTime) -> Vec<u8> {
    format!("ok \"{}\"", now.format("%Y-%m-%d %H:%M:%S")).into_bytes()
}

fn batch_prefix(count: usize) -> Result<Vec<u8>, CodecError> {
    if count > u16::MAX as usize {
        return Err(CodecError::TooManyEntities {
            count,
            max: u16::MAX as usize,
        });
    }
    let mut body = Vec::new();
    push_be(&mut body, count as u32, 2);
    body.extend_from_slice(&BATCH_MARKER);
    Ok(body)
}

fn wrap(quality: &str, body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    let declared = body.len() + QUALITY_LEN;
    if declared > MAX_DECLARED_LEN {
        return Err(CodecError::LengthOverflow {
            size: declared,
            max: MAX_DECLARED_LEN,
        });
    }
    let mut frame = format!("E{declared:06X}{quality}").into_bytes();
    frame.extend(body);
    Ok(frame)
}
