//! Geometric helpers shared by the detection, layout and pipeline stages.
//!
//! Boxes are integer pixel rectangles ([`BBox`]), polygons are float point lists.

use geo::{Area, Coord, EuclideanLength, LineString};
use geo_clipper::{ClipperInt, EndType, JoinType};
use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into_with, Interpolation, Projection};

use crate::entities::{BBox, Point, Polygon, Rotation};

/// Minimum vertical distance for two boxes to be considered on different lines.
pub const SAME_LINE_Y_TOLERANCE: i32 = 10;

/// Crops taller than `ratio * width` are rotated upright.
pub const VERTICAL_CROP_RATIO: f32 = 1.5;

/// Expands a polygon outward by `area * ratio / perimeter`.
/// Falls back to the input polygon when the offset yields nothing.
pub fn unclip(polygon: &[Point], ratio: f32) -> Polygon {
    try_unclip(polygon, ratio).unwrap_or_else(|| polygon.to_vec())
}

fn try_unclip(polygon: &[Point], ratio: f32) -> Option<Polygon> {
    if polygon.len() < 3 {
        return None;
    }
    let coords: Vec<Coord<f64>> = polygon
        .iter()
        .map(|p| Coord {
            x: p.x as f64,
            y: p.y as f64,
        })
        .collect();
    let poly = geo::Polygon::new(LineString::from(coords), vec![]);
    let perimeter = poly.exterior().euclidean_length();
    if perimeter <= f64::EPSILON || poly.unsigned_area() <= f64::EPSILON {
        return None;
    }
    let distance = poly.unsigned_area() * ratio as f64 / perimeter;

    let coords_int: Vec<Coord<i64>> = polygon
        .iter()
        .map(|p| Coord {
            x: p.x.trunc() as i64,
            y: p.y.trunc() as i64,
        })
        .collect();
    let poly_int = geo::Polygon::new(LineString::from(coords_int), vec![]);
    let offset = poly_int.offset(distance, JoinType::Round(0.25), EndType::ClosedPolygon);

    let exterior = offset.0.first()?.exterior();
    let coords: Vec<_> = exterior.coords().collect();
    // geo closes the ring, drop the repeated point
    if coords.len() <= 3 {
        return None;
    }
    Some(
        coords[..coords.len() - 1]
            .iter()
            .map(|c| Point::new(c.x as f32, c.y as f32))
            .collect(),
    )
}

/// Expands a box through [`unclip`] on its corners, scaling about the center
/// when the polygon offset is unavailable. The fallback never shrinks the box.
pub fn unclip_box(bbox: &BBox, ratio: f32) -> BBox {
    try_unclip(&bbox.corners(), ratio)
        .and_then(|poly| BBox::from_points(&poly))
        .unwrap_or_else(|| scale_box(bbox, ratio.max(1.0)))
}

/// Scales a box symmetrically about its center.
pub fn scale_box(bbox: &BBox, ratio: f32) -> BBox {
    let (cx, cy) = (
        (bbox.x0 + bbox.x1) as f64 / 2.0,
        (bbox.y0 + bbox.y1) as f64 / 2.0,
    );
    let half_w = bbox.width() as f64 * ratio as f64 / 2.0;
    let half_h = bbox.height() as f64 * ratio as f64 / 2.0;
    BBox {
        x0: (cx - half_w).round() as i32,
        y0: (cy - half_h).round() as i32,
        x1: (cx + half_w).round() as i32,
        y1: (cy + half_h).round() as i32,
    }
}

#[inline(always)]
pub fn merge_boxes(a: &BBox, b: &BBox) -> BBox {
    a.merge(b)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: Point,
    pub width: f32,
    pub height: f32,
    /// Angle of the width axis in degrees.
    pub angle: f32,
    axis: (f32, f32),
}

impl RotatedRect {
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Corners ordered top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self) -> [Point; 4] {
        let (nx, ny) = self.axis;
        let (px, py) = (-ny, nx);
        let (hw, hh) = (self.width / 2.0, self.height / 2.0);
        let c = self.center;
        let mut pts = [
            Point::new(c.x - nx * hw - px * hh, c.y - ny * hw - py * hh),
            Point::new(c.x + nx * hw - px * hh, c.y + ny * hw - py * hh),
            Point::new(c.x + nx * hw + px * hh, c.y + ny * hw + py * hh),
            Point::new(c.x - nx * hw + px * hh, c.y - ny * hw + py * hh),
        ];
        pts.sort_by(|a, b| a.x.total_cmp(&b.x));
        let (tl, bl) = if pts[0].y <= pts[1].y {
            (pts[0], pts[1])
        } else {
            (pts[1], pts[0])
        };
        let (tr, br) = if pts[2].y <= pts[3].y {
            (pts[2], pts[3])
        } else {
            (pts[3], pts[2])
        };
        [tl, tr, br, bl]
    }
}

fn cross(o: &Point, a: &Point, b: &Point) -> f32 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain, counter-clockwise without collinear points.
fn convex_hull(points: &[Point]) -> Vec<Point> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }
    let mut hull: Vec<Point> = Vec::with_capacity(pts.len() * 2);
    for p in pts.iter().chain(pts.iter().rev().skip(1)) {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

/// Minimum-area enclosing rectangle through rotating calipers on the hull.
pub fn min_area_rect(points: &[Point]) -> Option<RotatedRect> {
    let hull = convex_hull(points);
    if hull.is_empty() {
        return None;
    }
    if hull.len() < 3 {
        let (x0, y0) = (
            hull.iter().map(|p| p.x).fold(f32::MAX, f32::min),
            hull.iter().map(|p| p.y).fold(f32::MAX, f32::min),
        );
        let (x1, y1) = (
            hull.iter().map(|p| p.x).fold(f32::MIN, f32::max),
            hull.iter().map(|p| p.y).fold(f32::MIN, f32::max),
        );
        return Some(RotatedRect {
            center: Point::new((x0 + x1) / 2.0, (y0 + y1) / 2.0),
            width: x1 - x0,
            height: y1 - y0,
            angle: 0.0,
            axis: (1.0, 0.0),
        });
    }

    let n = hull.len();
    let mut best: Option<(f32, RotatedRect)> = None;
    for i in 0..n {
        let (a, b) = (hull[i], hull[(i + 1) % n]);
        let (ex, ey) = (b.x - a.x, b.y - a.y);
        let len = (ex * ex + ey * ey).sqrt();
        if len < f32::EPSILON {
            continue;
        }
        let (nx, ny) = (ex / len, ey / len);
        let (px, py) = (-ny, nx);

        let (mut min_n, mut max_n, mut min_p, mut max_p) = (f32::MAX, f32::MIN, f32::MAX, f32::MIN);
        for p in &hull {
            let (dx, dy) = (p.x - a.x, p.y - a.y);
            let proj_n = nx * dx + ny * dy;
            let proj_p = px * dx + py * dy;
            min_n = min_n.min(proj_n);
            max_n = max_n.max(proj_n);
            min_p = min_p.min(proj_p);
            max_p = max_p.max(proj_p);
        }

        let (width, height) = (max_n - min_n, max_p - min_p);
        let area = width * height;
        if best.as_ref().map_or(true, |(best_area, _)| area < *best_area) {
            let (cn, cp) = ((min_n + max_n) / 2.0, (min_p + max_p) / 2.0);
            let rect = RotatedRect {
                center: Point::new(a.x + cn * nx + cp * px, a.y + cn * ny + cp * py),
                width,
                height,
                angle: ny.atan2(nx).to_degrees(),
                axis: (nx, ny),
            };
            best = Some((area, rect));
        }
    }
    best.map(|(_, rect)| rect)
}

fn distance(a: &Point, b: &Point) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Perspective-warps the minimum-area rectangle around `quad` into an upright crop,
/// replicating border pixels. Tall crops are turned 90° counter-clockwise.
pub fn rotate_crop(image: &RgbImage, quad: &[Point]) -> Option<RgbImage> {
    let rect = min_area_rect(quad)?;
    let [tl, tr, br, bl] = rect.corners();
    let crop_w = distance(&tl, &tr).round() as u32;
    let crop_h = distance(&tl, &bl).round() as u32;
    if crop_w == 0 || crop_h == 0 || image.width() == 0 || image.height() == 0 {
        return None;
    }

    let dst = [
        (0f32, 0f32),
        (crop_w as f32, 0f32),
        (crop_w as f32, crop_h as f32),
        (0f32, crop_h as f32),
    ];
    let src = [(tl.x, tl.y), (tr.x, tr.y), (br.x, br.y), (bl.x, bl.y)];
    let projection = Projection::from_control_points(dst, src)?;

    let (max_x, max_y) = ((image.width() - 1) as f32, (image.height() - 1) as f32);
    let mut out = RgbImage::new(crop_w, crop_h);
    warp_into_with(
        image,
        move |x, y| {
            let (sx, sy) = projection * (x, y);
            (sx.clamp(0.0, max_x), sy.clamp(0.0, max_y))
        },
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut out,
    );

    if out.height() as f32 >= out.width() as f32 * VERTICAL_CROP_RATIO {
        Some(imageops::rotate270(&out))
    } else {
        Some(out)
    }
}

/// Axis-aligned crop, `None` when the box has no area inside the image.
pub fn crop_bbox(image: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let b = bbox.clip(image.width(), image.height())?;
    Some(
        imageops::crop_imm(
            image,
            b.x0 as u32,
            b.y0 as u32,
            b.width() as u32,
            b.height() as u32,
        )
        .to_image(),
    )
}

/// Sorts top-to-bottom then left-to-right, swapping neighbours that sit on the
/// same visual line (top edges within [`SAME_LINE_Y_TOLERANCE`]) by their left edge.
pub fn sort_reading_order_by<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> BBox,
{
    items.sort_by_key(|item| {
        let b = key(item);
        (b.y0, b.x0)
    });
    for i in 0..items.len().saturating_sub(1) {
        for j in (0..=i).rev() {
            let (next, cur) = (key(&items[j + 1]), key(&items[j]));
            if (next.y0 - cur.y0).abs() < SAME_LINE_Y_TOLERANCE && next.x0 < cur.x0 {
                items.swap(j, j + 1);
            } else {
                break;
            }
        }
    }
}

pub fn sort_reading_order(boxes: &mut [BBox]) {
    sort_reading_order_by(boxes, |b| *b)
}

/// Rotates the whole page: 90 is counter-clockwise, 270 clockwise.
pub fn rotate_image(image: &RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::Deg0 => image.clone(),
        Rotation::Deg90 => imageops::rotate270(image),
        Rotation::Deg180 => imageops::rotate180(image),
        Rotation::Deg270 => imageops::rotate90(image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon_area(poly: &[Point]) -> f32 {
        let n = poly.len();
        (0..n)
            .map(|i| {
                let (a, b) = (poly[i], poly[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f32>()
            .abs()
            / 2.0
    }

    #[test]
    fn test_unclip_grows_polygon() {
        let poly = BBox::new(10, 10, 110, 40).corners();
        for ratio in [1.0, 1.5, 2.0] {
            let expanded = unclip(&poly, ratio);
            assert!(expanded.len() >= 4);
            assert!(polygon_area(&expanded) >= polygon_area(&poly));
        }
    }

    #[test]
    fn test_unclip_degenerate_returns_input() {
        let line = vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)];
        assert_eq!(unclip(&line, 1.5), line);
    }

    #[test]
    fn test_scale_box_identity_at_one() {
        let b = BBox::new(3, 7, 51, 22);
        assert_eq!(scale_box(&b, 1.0), b);
        let bigger = scale_box(&b, 2.0);
        assert!(bigger.contains(&b));
    }

    #[test]
    fn test_unclip_box_contains_input() {
        let b = BBox::new(20, 20, 120, 50);
        let expanded = unclip_box(&b, 0.2);
        assert!(expanded.contains(&b));
        // A flat box has no polygon area and falls back to scaling.
        let flat = BBox::new(5, 5, 5, 30);
        assert_eq!(unclip_box(&flat, 0.5), flat);
    }

    #[test]
    fn test_min_area_rect_axis_aligned() {
        let rect = min_area_rect(&BBox::new(10, 20, 60, 40).corners()).unwrap();
        let (w, h) = (rect.width.max(rect.height), rect.width.min(rect.height));
        assert!((w - 50.0).abs() < 1e-3);
        assert!((h - 20.0).abs() < 1e-3);
        let [tl, tr, br, bl] = rect.corners();
        assert!((tl.x - 10.0).abs() < 1e-3 && (tl.y - 20.0).abs() < 1e-3);
        assert!((tr.x - 60.0).abs() < 1e-3 && (tr.y - 20.0).abs() < 1e-3);
        assert!((br.x - 60.0).abs() < 1e-3 && (br.y - 40.0).abs() < 1e-3);
        assert!((bl.x - 10.0).abs() < 1e-3 && (bl.y - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_min_area_rect_rotated_square() {
        let diamond = [
            Point::new(10.0, 0.0),
            Point::new(20.0, 10.0),
            Point::new(10.0, 20.0),
            Point::new(0.0, 10.0),
        ];
        let rect = min_area_rect(&diamond).unwrap();
        let side = 200f32.sqrt();
        assert!((rect.width - side).abs() < 1e-3);
        assert!((rect.height - side).abs() < 1e-3);
        assert!((rect.center.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_rotate_crop_upright_and_vertical() {
        let img = RgbImage::from_pixel(100, 100, Rgb([200, 10, 10]));
        let crop = rotate_crop(&img, &BBox::new(10, 10, 70, 30).corners()).unwrap();
        assert_eq!((crop.width(), crop.height()), (60, 20));
        assert_eq!(crop.get_pixel(5, 5), &Rgb([200, 10, 10]));

        let tall = rotate_crop(&img, &BBox::new(10, 10, 30, 70).corners()).unwrap();
        assert_eq!((tall.width(), tall.height()), (60, 20));
    }

    #[test]
    fn test_sort_reading_order() {
        let mut boxes = vec![
            BBox::new(50, 10, 80, 20),
            BBox::new(5, 200, 30, 210),
            BBox::new(10, 12, 40, 22),
        ];
        sort_reading_order(&mut boxes);
        assert_eq!(
            boxes,
            vec![
                BBox::new(10, 12, 40, 22),
                BBox::new(50, 10, 80, 20),
                BBox::new(5, 200, 30, 210),
            ]
        );
    }

    #[test]
    fn test_four_rotations_identity() {
        let mut img = RgbImage::new(7, 3);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([x as u8, y as u8, (x * y) as u8]);
        }
        let mut rotated = img.clone();
        for _ in 0..4 {
            rotated = rotate_image(&rotated, Rotation::Deg90);
        }
        assert_eq!(rotated, img);
        assert_eq!(rotate_image(&img, Rotation::Deg90).dimensions(), (3, 7));
    }
}
