use image::{GrayImage, Luma};
use imageproc::{
    contours::{find_contours, BorderType},
    distance_transform::Norm,
    drawing::draw_polygon_mut,
    morphology,
    point::Point as ImgPoint,
};
use ndarray::ArrayView2;

use super::DetectionParams;
use crate::{
    entities::{BBox, DetectedRegion, Point, RegionType},
    geometry::{min_area_rect, unclip},
};

/// Candidate boxes with a shorter side below this many pixels are dropped.
pub const MIN_BOX_SIDE: f32 = 5.0;

pub fn binarize(pred: &ArrayView2<f32>, thresh: f32) -> GrayImage {
    let (h, w) = pred.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        if pred[[y as usize, x as usize]] > thresh {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Mean probability inside `contour`, falling back to its bounding box
/// when the polygon can't be rasterized.
fn contour_score(pred: &ArrayView2<f32>, contour: &[ImgPoint<i32>]) -> f32 {
    let (h, w) = pred.dim();
    let (min_x, max_x) = contour.iter().fold((i32::MAX, i32::MIN), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
    let (min_y, max_y) = contour.iter().fold((i32::MAX, i32::MIN), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));
    let x0 = min_x.clamp(0, w as i32 - 1);
    let x1 = max_x.clamp(0, w as i32 - 1);
    let y0 = min_y.clamp(0, h as i32 - 1);
    let y1 = max_y.clamp(0, h as i32 - 1);
    let (mw, mh) = ((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);

    let mut poly: Vec<ImgPoint<i32>> = contour
        .iter()
        .map(|p| ImgPoint::new(p.x - x0, p.y - y0))
        .collect();
    poly.dedup();
    while poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }

    let mut mask = GrayImage::new(mw, mh);
    if poly.len() >= 3 {
        draw_polygon_mut(&mut mask, &poly, Luma([1u8]));
    }

    let (mut sum, mut count, mut box_sum) = (0f32, 0usize, 0f32);
    for (mx, my, m) in mask.enumerate_pixels() {
        let v = pred[[(y0 as u32 + my) as usize, (x0 as u32 + mx) as usize]];
        box_sum += v;
        if m.0[0] > 0 {
            sum += v;
            count += 1;
        }
    }
    if count > 0 {
        sum / count as f32
    } else {
        box_sum / (mw * mh) as f32
    }
}

/// Turns a probability map into text regions in `dest_width x dest_height` pixel space.
#[tracing::instrument(skip_all)]
pub fn boxes_from_bitmap(
    pred: &ArrayView2<f32>,
    params: &DetectionParams,
    dest_width: u32,
    dest_height: u32,
) -> Vec<DetectedRegion> {
    let (h, w) = pred.dim();
    if h == 0 || w == 0 {
        return Vec::new();
    }
    let mut bitmap = binarize(pred, params.thresh);
    if params.use_close {
        bitmap = morphology::close(&bitmap, Norm::LInf, 1);
    }

    let scale_x = dest_width as f32 / w as f32;
    let scale_y = dest_height as f32 / h as f32;

    let mut regions = Vec::new();
    for contour in find_contours::<i32>(&bitmap) {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        let points: Vec<Point> = contour
            .points
            .iter()
            .map(|p| Point::new(p.x as f32, p.y as f32))
            .collect();
        let Some(rect) = min_area_rect(&points) else {
            continue;
        };
        if rect.min_side() < MIN_BOX_SIDE {
            continue;
        }

        let score = contour_score(pred, &contour.points);
        if score < params.box_thresh {
            continue;
        }

        let expanded = unclip(&rect.corners(), params.unclip_ratio);
        let Some(expanded_rect) = min_area_rect(&expanded) else {
            continue;
        };
        if expanded_rect.min_side() < MIN_BOX_SIDE + 2.0 {
            continue;
        }

        let quad: Vec<Point> = expanded_rect
            .corners()
            .iter()
            .map(|p| {
                Point::new(
                    (p.x * scale_x).round().clamp(0.0, dest_width as f32),
                    (p.y * scale_y).round().clamp(0.0, dest_height as f32),
                )
            })
            .collect();
        let Some(bbox) = BBox::from_points(&quad).and_then(|b| b.clip(dest_width, dest_height))
        else {
            continue;
        };

        regions.push(DetectedRegion {
            bbox,
            polygon: Some(quad),
            region_type: RegionType::Text,
            confidence: score,
        });
    }

    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    regions.truncate(params.max_candidates);
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn params() -> DetectionParams {
        DetectionParams {
            thresh: 0.3,
            box_thresh: 0.6,
            unclip_ratio: 1.5,
            max_candidates: 1000,
            use_close: false,
        }
    }

    fn fill(pred: &mut Array2<f32>, x0: usize, y0: usize, x1: usize, y1: usize, v: f32) {
        for y in y0..y1 {
            for x in x0..x1 {
                pred[[y, x]] = v;
            }
        }
    }

    #[test]
    fn single_bar_is_detected() {
        let mut pred = Array2::<f32>::zeros((64, 160));
        fill(&mut pred, 20, 10, 120, 30, 0.9);

        let regions = boxes_from_bitmap(&pred.view(), &params(), 160, 64);
        assert_eq!(regions.len(), 1);
        let known = BBox::new(20, 10, 120, 30);
        assert!(regions[0].bbox.overlap_ratio(&known) > 0.8);
        assert!((regions[0].confidence - 0.9).abs() < 1e-4);
        assert_eq!(regions[0].polygon.as_ref().map(Vec::len), Some(4));
        assert_eq!(regions[0].region_type, RegionType::Text);
    }

    #[test]
    fn boxes_are_mapped_to_destination() {
        let mut pred = Array2::<f32>::zeros((64, 160));
        fill(&mut pred, 20, 10, 120, 30, 0.9);

        let regions = boxes_from_bitmap(&pred.view(), &params(), 320, 128);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].bbox.overlap_ratio(&BBox::new(40, 20, 240, 60)) > 0.8);
        assert!(regions[0].bbox.x1 <= 320 && regions[0].bbox.y1 <= 128);
    }

    #[test]
    fn low_score_and_tiny_regions_are_rejected() {
        let mut pred = Array2::<f32>::zeros((64, 160));
        // above thresh but below box_thresh
        fill(&mut pred, 20, 10, 120, 30, 0.4);
        // too thin
        fill(&mut pred, 10, 50, 100, 53, 0.95);

        let regions = boxes_from_bitmap(&pred.view(), &params(), 160, 64);
        assert!(regions.is_empty());
    }

    #[test]
    fn empty_map_yields_nothing() {
        let pred = Array2::<f32>::zeros((32, 32));
        assert!(boxes_from_bitmap(&pred.view(), &params(), 32, 32).is_empty());
    }

    #[test]
    fn regions_sorted_and_truncated() {
        let mut pred = Array2::<f32>::zeros((96, 160));
        fill(&mut pred, 10, 5, 60, 20, 0.7);
        fill(&mut pred, 10, 40, 60, 55, 0.95);
        fill(&mut pred, 10, 70, 60, 85, 0.8);

        let mut p = params();
        p.max_candidates = 2;
        let regions = boxes_from_bitmap(&pred.view(), &p, 160, 96);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].confidence > regions[1].confidence);
        assert!((regions[0].confidence - 0.95).abs() < 1e-4);
    }

    #[test]
    fn close_bridges_single_pixel_gaps() {
        let mut pred = Array2::<f32>::zeros((48, 160));
        fill(&mut pred, 10, 10, 70, 30, 0.9);
        fill(&mut pred, 71, 10, 130, 30, 0.9);

        let open = boxes_from_bitmap(&pred.view(), &params(), 160, 48);
        let mut p = params();
        p.use_close = true;
        let closed = boxes_from_bitmap(&pred.view(), &p, 160, 48);
        assert_eq!(open.len(), 2);
        assert_eq!(closed.len(), 1);
    }
}
