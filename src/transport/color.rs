//! RGB888 → wire pixel packing.

use super::header::ColorEncoding;

/// 5-6-5: red in bits 15-11, green 10-5, blue 4-0.
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

/// 3-3-2: red in bits 7-5, green 4-2, blue 1-0.
pub fn pack_rgb332(r: u8, g: u8, b: u8) -> u8 {
    ((r >> 5) << 5) | ((g >> 5) << 2) | (b >> 6)
}

/// Append the wire form of packed RGB888 `pixels` to `out`.
pub fn encode_pixels(pixels: &[u8], color: ColorEncoding, out: &mut Vec<u8>) {
    out.reserve(pixels.len() / 3 * color.bytes_per_pixel());
    match color {
        ColorEncoding::Rgb565 => {
            for px in pixels.chunks_exact(3) {
                out.extend_from_slice(&pack_rgb565(px[0], px[1], px[2]).to_be_bytes());
            }
        }
        ColorEncoding::Rgb332 => {
            out.extend(
                pixels
                    .chunks_exact(3)
                    .map(|px| pack_rgb332(px[0], px[1], px[2])),
            );
        }
    }
}
