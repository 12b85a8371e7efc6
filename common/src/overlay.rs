//! In-place drawing on RGB frames: box outlines and short text labels.
//!
//! Labels use the public-domain 8x8 bitmap font from `font8x8`. Characters the
//! font has no glyph for are drawn as `?`.

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const GLYPH_SIZE: u32 = 8;
const FALLBACK: char = '?';

/// One-pixel outline of the rectangle spanning `(x0, y0)`..=`(x1, y1)`,
/// clipped to the image.
pub fn draw_rect(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
    let (left, right) = (x0.min(x1), x0.max(x1));
    let (top, bottom) = (y0.min(y1), y0.max(y1));
    let rect = Rect::at(left as i32, top as i32).of_size(right - left + 1, bottom - top + 1);
    draw_hollow_rect_mut(image, rect, color);
}

/// Render `text` with its top-left corner at `(x, y)`. `scale` multiplies the
/// glyph size; 0 is treated as 1.
pub fn draw_label(image: &mut RgbImage, x: u32, y: u32, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1);
    let advance = GLYPH_SIZE * scale;

    for (i, ch) in text.chars().enumerate() {
        let origin_x = x + i as u32 * advance;
        if origin_x >= image.width() {
            break;
        }
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = origin_x + col * scale;
                let py = y + row as u32 * scale;
                draw_filled_rect_mut(
                    image,
                    Rect::at(px as i32, py as i32).of_size(scale, scale),
                    color,
                );
            }
        }
    }
}

/// Width in pixels that `draw_label` will use for `text`.
pub fn label_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * GLYPH_SIZE * scale.max(1)
}

pub fn label_height(scale: u32) -> u32 {
    GLYPH_SIZE * scale.max(1)
}

fn glyph(ch: char) -> [u8; 8] {
    BASIC_FONTS
        .get(ch)
        .or_else(|| BASIC_FONTS.get(FALLBACK))
        .unwrap_or([0; 8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn lit(img: &RgbImage, color: Rgb<u8>) -> Vec<(u32, u32)> {
        img.enumerate_pixels()
            .filter(|(_, _, p)| **p == color)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    #[test]
    fn rect_outline_only() {
        let mut img = RgbImage::from_pixel(20, 20, BLACK);
        draw_rect(&mut img, 2, 3, 10, 12, RED);
        assert_eq!(*img.get_pixel(2, 3), RED);
        assert_eq!(*img.get_pixel(10, 12), RED);
        assert_eq!(*img.get_pixel(6, 3), RED);
        assert_eq!(*img.get_pixel(2, 8), RED);
        // Interior untouched.
        assert_eq!(*img.get_pixel(6, 8), BLACK);
        assert_eq!(*img.get_pixel(11, 13), BLACK);
    }

    #[test]
    fn rect_is_clipped() {
        let mut img = RgbImage::from_pixel(10, 10, BLACK);
        draw_rect(&mut img, 5, 5, 40, 40, RED);
        assert_eq!(*img.get_pixel(9, 5), RED);
        assert_eq!(*img.get_pixel(5, 9), RED);
        draw_rect(&mut img, 50, 50, 60, 60, WHITE);
        assert!(img.pixels().all(|p| *p != WHITE));
    }

    #[test]
    fn label_marks_pixels_inside_its_box() {
        let mut img = RgbImage::from_pixel(120, 20, BLACK);
        draw_label(&mut img, 1, 1, "Saving frame", RED, 1);
        let lit = lit(&img, RED);
        assert!(!lit.is_empty());
        let width = label_width("Saving frame", 1);
        assert!(lit
            .iter()
            .all(|&(x, y)| x >= 1 && x < 1 + width && y >= 1 && y < 1 + label_height(1)));
    }

    #[test]
    fn any_ascii_text_is_visible() {
        for text in ["Motion 42%", "ZONE-B", "x"] {
            let mut img = RgbImage::from_pixel(100, 10, BLACK);
            draw_label(&mut img, 0, 0, text, WHITE, 1);
            assert!(!lit(&img, WHITE).is_empty(), "{text:?} rendered blank");
        }
    }

    #[test]
    fn missing_glyph_falls_back_to_question_mark() {
        let mut unknown = RgbImage::from_pixel(8, 8, BLACK);
        draw_label(&mut unknown, 0, 0, "\u{2603}", WHITE, 1);
        let mut question = RgbImage::from_pixel(8, 8, BLACK);
        draw_label(&mut question, 0, 0, "?", WHITE, 1);
        assert!(!lit(&unknown, WHITE).is_empty());
        assert_eq!(unknown, question);
    }

    #[test]
    fn scale_multiplies_glyph_size() {
        let mut img = RgbImage::from_pixel(40, 40, BLACK);
        draw_label(&mut img, 0, 0, "I", WHITE, 3);
        let lit = lit(&img, WHITE);
        assert!(lit.iter().all(|&(x, y)| x < 24 && y < 24));
        assert!(lit.iter().any(|&(x, y)| x >= 8 || y >= 8));
        assert_eq!(label_height(3), 24);
        assert_eq!(label_width("ab", 3), 48);
    }

    #[test]
    fn label_past_edge_does_not_panic() {
        let mut img = RgbImage::from_pixel(8, 4, BLACK);
        draw_label(&mut img, 6, 2, "Camera unavailable", WHITE, 2);
    }
}
