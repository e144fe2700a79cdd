use crate::vision::Rect;
use image::{Rgb, RgbImage};

fn luma(Rgb([r, g, b]): Rgb<u8>) -> i16 {
    let weighted = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
    i16::try_from(weighted / 1000).unwrap_or(i16::MAX)
}

/// Fraction of pixels inside `region` whose luma moved by more than `threshold`.
///
/// Captures of different sizes count as a complete change. A region outside
/// the capture falls back to the whole capture.
pub fn change_ratio(pre: &RgbImage, post: &RgbImage, region: Option<Rect>, threshold: u8) -> f64 {
    if pre.dimensions() != post.dimensions() {
        return 1.0;
    }
    let (width, height) = pre.dimensions();
    let full = Rect::new(
        0,
        0,
        i32::try_from(width).unwrap_or(i32::MAX),
        i32::try_from(height).unwrap_or(i32::MAX),
    );
    let area = region
        .and_then(|r| r.clamp_to(width, height))
        .unwrap_or(full);
    if !area.is_valid() {
        return 0.0;
    }

    let threshold = i16::from(threshold);
    let mut changed: u64 = 0;
    for y in area.y..area.bottom() {
        for x in area.x..area.right() {
            // Both coordinates are inside the clamped area, so they are non-negative.
            let (px, py) = (x.unsigned_abs(), y.unsigned_abs());
            let delta = (luma(*pre.get_pixel(px, py)) - luma(*post.get_pixel(px, py))).abs();
            if delta > threshold {
                changed += 1;
            }
        }
    }
    changed as f64 / area.area() as f64
}
