use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in screen pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a rectangle from two corners given in any order.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self::new(left, top, right.saturating_sub(left), bottom.saturating_sub(top))
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn area(&self) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        i64::from(self.width) * i64::from(self.height)
    }

    pub fn centroid(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }

    /// Integer click point at the centre of the rectangle.
    pub fn center_point(&self) -> (i32, i32) {
        (self.x.saturating_add(self.width / 2), self.y.saturating_add(self.height / 2))
    }

    pub fn contains_point(&self, px: f64, py: f64) -> bool {
        px >= f64::from(self.x)
            && px <= f64::from(self.right())
            && py >= f64::from(self.y)
            && py <= f64::from(self.bottom())
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::from_corners(x1, y1, x2, y2))
    }

    pub fn intersection_area(&self, other: &Rect) -> i64 {
        self.intersection(other).map_or(0, |r| r.area())
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn iou(&self, other: &Rect) -> f64 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    /// Grows the rectangle by `margin` pixels on every side.
    pub fn expand(&self, margin: f64) -> Rect {
        let m = margin.max(0.0).round().min(f64::from(i32::MAX / 2)) as i32;
        Rect::new(
            self.x.saturating_sub(m),
            self.y.saturating_sub(m),
            self.width.saturating_add(m.saturating_mul(2)),
            self.height.saturating_add(m.saturating_mul(2)),
        )
    }

    /// Clips the rectangle to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let bounds = Rect::new(
            0,
            0,
            i32::try_from(width).unwrap_or(i32::MAX),
            i32::try_from(height).unwrap_or(i32::MAX),
        );
        self.intersection(&bounds)
    }
}
