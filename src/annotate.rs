use image::{Rgba, RgbaImage};

use crate::config::{DrawElement, DrawKind, Roi};

const DEFAULT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const DEFAULT_THICKNESS: i32 = 2;
const BASE_FONT_SIZE: i32 = 13;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Parses `#RRGGBB` or `RRGGBB`. Malformed values fall back to solid red.
pub fn parse_color(hex: &str) -> Rgba<u8> {
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 {
        return DEFAULT_COLOR;
    }
    let parse = |range| u8::from_str_radix(&hex[range], 16);
    match (parse(0..2), parse(2..4), parse(4..6)) {
        (Ok(r), Ok(g), Ok(b)) => Rgba([r, g, b, 255]),
        _ => DEFAULT_COLOR,
    }
}

/// Draws the legacy ROI rectangles: solid red outline, thickness 2.
pub fn draw_rois(img: &mut RgbaImage, rois: &[Roi]) {
    for roi in rois {
        stroke_rect(
            img,
            roi.x,
            roi.y,
            roi.x + roi.width,
            roi.y + roi.height,
            DEFAULT_COLOR,
            DEFAULT_THICKNESS,
        );
    }
}

/// Draws the configured elements in order; later elements overdraw earlier
/// ones.
pub fn draw_elements(img: &mut RgbaImage, elements: &[DrawElement]) {
    for element in elements {
        match element.kind {
            DrawKind::Rectangle => draw_rectangle(img, element),
            DrawKind::Polyline => draw_polyline(img, element),
            DrawKind::Text => draw_text(img, element),
        }
    }
}

fn thickness_or_default(thickness: i32) -> i32 {
    if thickness <= 0 { DEFAULT_THICKNESS } else { thickness }
}

fn draw_rectangle(img: &mut RgbaImage, element: &DrawElement) {
    if element.points.len() < 2 {
        return;
    }
    let (mut x1, mut y1) = (element.points[0].x, element.points[0].y);
    let (mut x2, mut y2) = (element.points[1].x, element.points[1].y);
    if x1 > x2 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y1 > y2 {
        std::mem::swap(&mut y1, &mut y2);
    }

    let color = parse_color(&element.color);
    let thickness = thickness_or_default(element.thickness);
    stroke_rect(img, x1, y1, x2, y2, color, thickness);
}

// Outline as four filled bands, clipped to the frame.
fn stroke_rect(img: &mut RgbaImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgba<u8>, thickness: i32) {
    fill_rect(img, x1, y1, x2, y1 + thickness, color);
    fill_rect(img, x1, y2 - thickness, x2, y2, color);
    fill_rect(img, x1, y1, x1 + thickness, y2, color);
    fill_rect(img, x2 - thickness, y1, x2, y2, color);
}

// Fills the half-open box [x1, x2) x [y1, y2).
fn fill_rect(img: &mut RgbaImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgba<u8>) {
    let x1 = x1.max(0);
    let y1 = y1.max(0);
    let x2 = x2.min(img.width() as i32);
    let y2 = y2.min(img.height() as i32);
    for y in y1..y2 {
        for x in x1..x2 {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_polyline(img: &mut RgbaImage, element: &DrawElement) {
    if element.points.len() < 2 {
        return;
    }
    let color = parse_color(&element.color);
    let thickness = thickness_or_default(element.thickness);
    for pair in element.points.windows(2) {
        draw_line(img, pair[0].x, pair[0].y, pair[1].x, pair[1].y, color, thickness);
    }
}

/// Bresenham line; every stepped pixel gets a thickness x thickness square
/// centered on it, clipped to the frame.
fn draw_line(img: &mut RgbaImage, mut x0: i32, mut y0: i32, x1: i32, y1: i32, color: Rgba<u8>, thickness: i32) {
    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx - dy;

    let width = img.width() as i32;
    let height = img.height() as i32;
    let half = thickness / 2;

    loop {
        for tx in -half..=half {
            for ty in -half..=half {
                let (px, py) = (x0 + tx, y0 + ty);
                if px >= 0 && px < width && py >= 0 && py < height {
                    img.put_pixel(px as u32, py as u32, color);
                }
            }
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x0 += sx;
        }
        if e2 < dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Renders text at a baseline origin with the built-in 5x7 bitmap font.
///
/// Sizes other than the base 13 are approximated by redrawing the string
/// with single-pixel offsets, one pass per 13 points of requested size. A
/// real font renderer is the caller's upgrade path for anything better.
fn draw_text(img: &mut RgbaImage, element: &DrawElement) {
    if element.points.is_empty() || element.text.is_empty() {
        return;
    }
    let origin = element.points[0];
    let color = parse_color(&element.color);
    let font_size = if element.font_size <= 0 { BASE_FONT_SIZE } else { element.font_size };
    let passes = (font_size / BASE_FONT_SIZE).max(1);

    for dx in 0..passes {
        for dy in 0..passes {
            draw_string(img, origin.x + dx, origin.y + dy, &element.text, color);
        }
    }
}

fn draw_string(img: &mut RgbaImage, x: i32, baseline: i32, text: &str, color: Rgba<u8>) {
    let width = img.width() as i32;
    let height = img.height() as i32;
    let top = baseline - GLYPH_HEIGHT;
    let mut pen_x = x;

    for ch in text.chars() {
        if let Some(rows) = glyph(ch.to_ascii_uppercase()) {
            for (row, pattern) in rows.iter().enumerate() {
                let py = top + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let px = pen_x + col;
                        if px >= 0 && px < width {
                            img.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE;
    }
}

#[rustfmt::skip]
fn glyph(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010]),
        'X' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
        'Y' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        ' ' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000]),
        '.' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00110]),
        ',' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00100]),
        ':' => Some([0b00000, 0b00110, 0b00110, 0b00000, 0b00110, 0b00110, 0b00000]),
        '-' => Some([0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000]),
        '_' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111]),
        '/' => Some([0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
        '%' => Some([0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000]),
        '(' => Some([0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010]),
        ')' => Some([0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000]),
        '!' => Some([0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100]),
        '?' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100]),
        '+' => Some([0b00000, 0b00100, 0b00100, 0b11111, 0b00100, 0b00100, 0b00000]),
        '=' => Some([0b00000, 0b00000, 0b11111, 0b00000, 0b11111, 0b00000, 0b00000]),
        '#' => Some([0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Point;

    fn blank(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]))
    }

    fn rectangle(p1: (i32, i32), p2: (i32, i32), color: &str, thickness: i32) -> DrawElement {
        DrawElement {
            kind: DrawKind::Rectangle,
            points: vec![Point { x: p1.0, y: p1.1 }, Point { x: p2.0, y: p2.1 }],
            text: String::new(),
            color: color.to_string(),
            thickness,
            font_size: 0,
        }
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("#00FF00"), Rgba([0, 255, 0, 255]));
        assert_eq!(parse_color("0000ff"), Rgba([0, 0, 255, 255]));
        assert_eq!(parse_color(""), DEFAULT_COLOR);
        assert_eq!(parse_color("#12345"), DEFAULT_COLOR);
        assert_eq!(parse_color("#GGGGGG"), DEFAULT_COLOR);
    }

    #[test]
    fn test_empty_element_list_leaves_frame_untouched() {
        let mut img = blank(32, 32);
        let before = img.clone();
        draw_elements(&mut img, &[]);
        draw_rois(&mut img, &[]);
        assert_eq!(img, before);
    }

    #[test]
    fn test_rectangle_outline_not_fill() {
        let mut img = blank(64, 64);
        draw_elements(&mut img, &[rectangle((10, 10), (50, 50), "#00FF00", 2)]);

        let green = Rgba([0, 255, 0, 255]);
        assert_eq!(img.get_pixel(10, 10), &green);
        assert_eq!(img.get_pixel(49, 11), &green);
        // Interior stays black.
        assert_eq!(img.get_pixel(30, 30), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_rectangle_corners_normalized() {
        let mut a = blank(64, 64);
        let mut b = blank(64, 64);
        draw_elements(&mut a, &[rectangle((10, 10), (50, 50), "#00FF00", 2)]);
        draw_elements(&mut b, &[rectangle((50, 50), (10, 10), "#00FF00", 2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_thickness_applied() {
        let mut zero = blank(64, 64);
        let mut two = blank(64, 64);
        draw_elements(&mut zero, &[rectangle((5, 5), (40, 40), "#FFFFFF", 0)]);
        draw_elements(&mut two, &[rectangle((5, 5), (40, 40), "#FFFFFF", 2)]);
        assert_eq!(zero, two);
    }

    #[test]
    fn test_polyline_draws_and_clips() {
        let mut img = blank(32, 32);
        let line = DrawElement {
            kind: DrawKind::Polyline,
            points: vec![
                Point { x: -10, y: -10 },
                Point { x: 16, y: 16 },
                Point { x: 100, y: 16 },
            ],
            text: String::new(),
            color: "#0000FF".to_string(),
            thickness: 3,
            font_size: 0,
        };
        draw_elements(&mut img, &[line]);
        assert_eq!(img.get_pixel(16, 16), &Rgba([0, 0, 255, 255]));
        // A degenerate vertex count draws nothing.
        let mut single = blank(32, 32);
        let before = single.clone();
        draw_elements(
            &mut single,
            &[DrawElement {
                kind: DrawKind::Polyline,
                points: vec![Point { x: 5, y: 5 }],
                text: String::new(),
                color: String::new(),
                thickness: 1,
                font_size: 0,
            }],
        );
        assert_eq!(single, before);
    }

    #[test]
    fn test_text_paints_pixels_above_baseline() {
        let mut img = blank(64, 32);
        let label = DrawElement {
            kind: DrawKind::Text,
            points: vec![Point { x: 4, y: 20 }],
            text: "CAM 1".to_string(),
            color: "#FFFFFF".to_string(),
            thickness: 0,
            font_size: 0,
        };
        draw_elements(&mut img, &[label]);

        let white = Rgba([255, 255, 255, 255]);
        let painted = img
            .enumerate_pixels()
            .filter(|(_, y, p)| *p == &white && *y >= 13 && *y < 20)
            .count();
        assert!(painted > 0);
        // Nothing below the baseline for glyphs without descenders.
        assert!(img.enumerate_pixels().all(|(_, y, p)| p != &white || y < 20));
    }

    #[test]
    fn test_legacy_roi_is_red() {
        let mut img = blank(64, 64);
        draw_rois(&mut img, &[Roi { x: 8, y: 8, width: 20, height: 20 }]);
        assert_eq!(img.get_pixel(8, 8), &Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(18, 18), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_later_elements_overdraw_earlier() {
        let mut img = blank(64, 64);
        draw_elements(
            &mut img,
            &[
                rectangle((10, 10), (50, 50), "#FF0000", 2),
                rectangle((10, 10), (50, 50), "#00FF00", 2),
            ],
        );
        assert_eq!(img.get_pixel(10, 10), &Rgba([0, 255, 0, 255]));
    }
}
