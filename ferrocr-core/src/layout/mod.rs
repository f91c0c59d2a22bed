use itertools::Itertools;

use crate::entities::DetectedRegion;

pub mod model;

pub use model::LayoutDetector;

/// Folds same-type regions overlapping a higher-scoring one by at least
/// `threshold` into it. Kept regions grow to the union box.
pub fn merge_same_type(regions: Vec<DetectedRegion>, threshold: f32) -> Vec<DetectedRegion> {
    let mut kept: Vec<DetectedRegion> = Vec::with_capacity(regions.len());
    for region in regions
        .into_iter()
        .sorted_by(|r1, r2| r2.confidence.total_cmp(&r1.confidence))
    {
        let target = kept.iter_mut().find(|k| {
            k.region_type == region.region_type && k.bbox.overlap_ratio(&region.bbox) >= threshold
        });
        match target {
            Some(k) => {
                *k = DetectedRegion {
                    bbox: k.bbox.merge(&region.bbox),
                    polygon: None,
                    region_type: k.region_type.clone(),
                    confidence: k.confidence.max(region.confidence),
                };
            }
            None => kept.push(region),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BBox, RegionType};

    fn region(bbox: BBox, region_type: RegionType, confidence: f32) -> DetectedRegion {
        DetectedRegion {
            bbox,
            polygon: None,
            region_type,
            confidence,
        }
    }

    #[test]
    fn test_merge_contained_box() {
        let regions = vec![
            region(BBox::new(0, 0, 100, 100), RegionType::Text, 0.7),
            region(BBox::new(10, 10, 50, 50), RegionType::Text, 0.9),
        ];
        let merged = merge_same_type(regions, 0.8);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].bbox, BBox::new(0, 0, 100, 100));
        assert_eq!(merged[0].confidence, 0.9);
    }

    #[test]
    fn test_merge_keeps_other_types() {
        let regions = vec![
            region(BBox::new(0, 0, 100, 100), RegionType::Text, 0.9),
            region(BBox::new(0, 0, 100, 100), RegionType::Table, 0.8),
        ];
        let merged = merge_same_type(regions, 0.8);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_low_overlap() {
        let regions = vec![
            region(BBox::new(0, 0, 100, 100), RegionType::Figure, 0.9),
            region(BBox::new(90, 90, 200, 200), RegionType::Figure, 0.8),
        ];
        let merged = merge_same_type(regions, 0.8);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence, 0.9);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_same_type(vec![], 0.8).is_empty());
    }
}
