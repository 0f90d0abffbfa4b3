//! Bitmap to display-plane conversion.
//!
//! A tag image is reduced to two boolean masks, black and red, each written as
//! a plane record: flag byte, 8-byte location header, then either the
//! run-length stream (prefixed by its 4-byte length) or MSB-first packed bits.

use crate::wire::push_be;
use image::RgbImage;

pub const FLAG_COMPRESSED: u8 = 0xFC;
pub const FLAG_BLACK_RAW: u8 = 0xFE;
pub const FLAG_RED_RAW: u8 = 0x03;

const MAX_RUN: usize = 0xFFFF;
const LITERAL_BITS: usize = 7;
const LUMA_BLACK_MAX: u32 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelSize {
    pub width: u32,
    pub height: u32,
}

/// Panel resolution for the tag type carried in the first two id characters.
pub fn panel_size(tag_id: &str) -> PanelSize {
    let kind = tag_id
        .get(..2)
        .and_then(|prefix| u8::from_str_radix(prefix, 16).ok())
        .unwrap_or(0);
    let (width, height) = match kind {
        0x30..=0x32 => (152, 152),
        0x33..=0x35 => (200, 200),
        0x36..=0x39 => (250, 122),
        0x3A..=0x3C | 0x5B => (296, 152),
        0x3D..=0x3F | 0x54 => (296, 128),
        0x40..=0x43 => (400, 300),
        0x44..=0x48 => (800, 480),
        0x49..=0x4B => (960, 640),
        0x4C..=0x4E => (522, 152),
        0x4F..=0x51 => (648, 480),
        0x55 => (384, 184),
        0x58 => (1304, 984),
        _ => (152, 152),
    };
    PanelSize { width, height }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masks {
    pub width: u32,
    pub height: u32,
    pub black: Vec<bool>,
    pub red: Vec<bool>,
}

/// Clips the image to the panel, widening rows to a whole number of bytes.
/// Columns added by the widening read as white.
pub fn rasterize(image: &RgbImage, panel: PanelSize) -> Masks {
    let height = panel.height.min(image.height());
    let mut width = panel.width.min(image.width());
    if width % 8 != 0 {
        width += 8 - width % 8;
    }

    let cells = (width * height) as usize;
    let mut black = vec![false; cells];
    let mut red = vec![false; cells];
    for y in 0..height {
        for x in 0..width.min(image.width()) {
            let [r, g, b] = image.get_pixel(x, y).0;
            let cell = (y * width + x) as usize;
            if r > 200 && g < 70 && b < 70 {
                red[cell] = true;
            } else {
                let luma = (r as u32 * 19595 + g as u32 * 38469 + b as u32 * 7472) >> 16;
                black[cell] = luma <= LUMA_BLACK_MAX;
            }
        }
    }

    Masks {
        width,
        height,
        black,
        red,
    }
}

/// Run-length codes a mask.
///
/// Runs shorter than seven are emitted as a literal byte carrying seven raw
/// bits; longer runs use a one, two or three byte header depending on length.
pub fn compress(bits: &[bool]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while cursor < bits.len() {
        let value = bits[cursor];
        let mut run = 1;
        while run < MAX_RUN && cursor + run < bits.len() && bits[cursor + run] == value {
            run += 1;
        }

        let lead = (value as u8) << 6;
        if run < LITERAL_BITS {
            let mut byte = 0x80 | lead;
            for offset in 1..LITERAL_BITS {
                if bits.get(cursor + offset).copied().unwrap_or(false) {
                    byte |= 1 << (6 - offset);
                }
            }
            out.push(byte);
            cursor += LITERAL_BITS;
            continue;
        }

        if run <= 31 {
            out.push(lead | run as u8);
        } else if run <= 255 {
            out.push(lead | 0x01);
            out.push(run as u8);
        } else {
            out.push(lead);
            out.push((run & 0xFF) as u8);
            out.push((run >> 8) as u8);
        }
        cursor += run;
    }
    out
}

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (slot, &set)| if set { acc | (0x80 >> slot) } else { acc })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneEncoding {
    Compressed,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPlanes {
    pub encoding: PlaneEncoding,
    pub bytes: Vec<u8>,
}

pub fn encode_image_planes(image: &RgbImage, tag_id: &str) -> EncodedPlanes {
    encode_masks(&rasterize(image, panel_size(tag_id)))
}

/// Compressed planes are kept only while both streams together stay below the
/// size of one packed plane.
pub fn encode_masks(masks: &Masks) -> EncodedPlanes {
    let black = compress(&masks.black);
    let red = compress(&masks.red);
    let packed_len = masks.black.len().div_ceil(8);
    let mut location = location_header(
        0,
        0,
        masks.height.saturating_sub(1),
        masks.width.saturating_sub(1),
    );

    let mut bytes = Vec::new();
    if black.len() + red.len() < packed_len {
        push_plane(&mut bytes, FLAG_COMPRESSED, &location, &black, true);
        location[0] |= 0x80;
        location[4] |= 0x80;
        push_plane(&mut bytes, FLAG_COMPRESSED, &location, &red, true);
        return EncodedPlanes {
            encoding: PlaneEncoding::Compressed,
            bytes,
        };
    }

    push_plane(&mut bytes, FLAG_BLACK_RAW, &location, &pack_bits(&masks.black), false);
    push_plane(&mut bytes, FLAG_RED_RAW, &location, &pack_bits(&masks.red), false);
    EncodedPlanes {
        encoding: PlaneEncoding::Raw,
        bytes,
    }
}

fn location_header(top: u32, left: u32, bottom: u32, right: u32) -> [u8; 8] {
    let mut raw = Vec::with_capacity(8);
    for value in [top, left, bottom, right] {
        push_be(&mut raw, value, 2);
    }
    let mut header = [0u8; 8];
    header.copy_from_slice(&raw);
    header
}

fn push_plane(out: &mut Vec<u8>, flag: u8, location: &[u8; 8], data: &[u8], sized: bool) {
    out.push(flag);
    out.extend_from_slice(location);
    if sized {
        push_be(out, data.len() as u32, 4);
    }
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checkerboard(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    #[test]
    fn panel_lookup_uses_type_prefix() {
        assert_eq!(panel_size("3A0000000001"), PanelSize { width: 296, height: 152 });
        assert_eq!(panel_size("580000000001"), PanelSize { width: 1304, height: 984 });
        assert_eq!(panel_size("520000000001"), PanelSize { width: 152, height: 152 });
        assert_eq!(panel_size("??"), PanelSize { width: 152, height: 152 });
    }

    #[test]
    fn pixel_classification() {
        let image = RgbImage::from_fn(8, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 0, 0]),
            2 => Rgb([126, 126, 126]),
            3 => Rgb([125, 125, 125]),
            _ => Rgb([255, 255, 255]),
        });
        let masks = rasterize(&image, panel_size("300000000001"));
        assert_eq!(masks.width, 8);
        assert_eq!(&masks.red[..4], &[true, false, false, false]);
        assert_eq!(&masks.black[..4], &[false, true, false, true]);
    }

    #[test]
    fn width_rounds_up_to_whole_bytes() {
        let image = RgbImage::from_pixel(13, 4, Rgb([0, 0, 0]));
        let masks = rasterize(&image, panel_size("300000000001"));
        assert_eq!(masks.width, 16);
        assert_eq!(masks.height, 4);
        assert!(masks.black[12]);
        assert!(!masks.black[13]);
    }

    #[test]
    fn run_length_header_sizes() {
        assert_eq!(compress(&[true; 7]), vec![0x40 | 7]);
        assert_eq!(compress(&[false; 31]), vec![31]);
        assert_eq!(compress(&[true; 32]), vec![0x41, 32]);
        assert_eq!(compress(&[false; 300]), vec![0x00, 0x2C, 0x01]);
        assert_eq!(
            compress(&[true, false, true, false, true, false, true]),
            vec![0x80 | 0x40 | 0b010101]
        );
    }

    #[test]
    fn long_runs_split_at_sixteen_bits() {
        let bits = vec![false; MAX_RUN + 10];
        let out = compress(&bits);
        assert_eq!(&out[..3], &[0x00, 0xFF, 0xFF]);
        assert_eq!(&out[3..], &[10]);
    }

    #[test]
    fn packing_is_msb_first() {
        let mut bits = vec![false; 16];
        bits[0] = true;
        bits[9] = true;
        assert_eq!(pack_bits(&bits), vec![0x80, 0x40]);
    }

    #[test]
    fn uniform_image_selects_compressed_planes() {
        let image = RgbImage::from_pixel(152, 152, Rgb([255, 255, 255]));
        let planes = encode_image_planes(&image, "300000000001");
        assert_eq!(planes.encoding, PlaneEncoding::Compressed);
        assert_eq!(planes.bytes[0], FLAG_COMPRESSED);
        assert!(planes.bytes.len() < 152 * 152 / 8);
        assert_eq!(&planes.bytes[1..9], &[0x00, 0x00, 0x00, 0x00, 0x00, 0x97, 0x00, 0x97]);
    }

    #[test]
    fn checkerboard_falls_back_to_raw_planes() {
        let image = checkerboard(152, 152);
        let masks = rasterize(&image, panel_size("300000000001"));
        let compressed = compress(&masks.black).len() + compress(&masks.red).len();
        assert!(compressed >= masks.black.len() / 8);

        let planes = encode_masks(&masks);
        assert_eq!(planes.encoding, PlaneEncoding::Raw);
        let plane_len = 1 + 8 + 152 * 152 / 8;
        assert_eq!(planes.bytes.len(), plane_len * 2);
        assert_eq!(planes.bytes[0], FLAG_BLACK_RAW);
        assert_eq!(planes.bytes[plane_len], FLAG_RED_RAW);
        assert_eq!(planes.bytes[9], 0xAA);
    }

    #[test]
    fn second_compressed_plane_marks_location() {
        let image = RgbImage::from_pixel(64, 8, Rgb([255, 255, 255]));
        let planes = encode_image_planes(&image, "300000000001");
        assert_eq!(planes.encoding, PlaneEncoding::Compressed);
        let black_stream = compress(&[false; 512]);
        let red_at = 1 + 8 + 4 + black_stream.len();
        assert_eq!(planes.bytes[red_at], FLAG_COMPRESSED);
        assert_eq!(planes.bytes[red_at + 1] & 0x80, 0x80);
        assert_eq!(planes.bytes[red_at + 5] & 0x80, 0x80);
    }
}
