use std::borrow::Cow;

use image::RgbImage;

use crate::{
    entities::Rotation, error::Result, geometry::rotate_image, orientation::OrientationClassifier,
};

pub mod lifecycle;
pub mod ocr;
pub mod structure;

pub use lifecycle::{ModelSlot, PipelineState, PipelineStatus};
pub use ocr::{lines_to_text, merge_overlapping, CropMode, OcrModels, OcrOptions, OcrPipeline};
pub use structure::{
    FormulaRecognizer, NoFormulaRecognizer, NoTableRecognizer, StructureOptions,
    StructurePipeline, TableRecognizer,
};

/// Whole-page rotation to apply: the classifier's answer when it is at least
/// `threshold` confident, upright with confidence 1 otherwise.
pub(crate) fn page_rotation(
    classifier: &OrientationClassifier,
    image: &RgbImage,
    enabled: bool,
    threshold: f32,
) -> Result<(Rotation, f32)> {
    if !enabled {
        return Ok((Rotation::Deg0, 1.0));
    }
    let orientation = classifier.classify(image)?;
    if orientation.confidence >= threshold {
        Ok((orientation.rotation, orientation.confidence))
    } else {
        Ok((Rotation::Deg0, 1.0))
    }
}

pub(crate) fn rotated(image: &RgbImage, rotation: Rotation) -> Cow<'_, RgbImage> {
    match rotation {
        Rotation::Deg0 => Cow::Borrowed(image),
        r => Cow::Owned(rotate_image(image, r)),
    }
}
