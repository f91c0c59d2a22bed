use std::{sync::Arc, time::Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::{
    lifecycle::{ModelSlot, PipelineState, PipelineStatus},
    page_rotation, rotated,
};
use crate::{
    config::{missing_files, OcrPipelineConfig},
    detection::TextDetector,
    entities::{OcrLine, OcrPage},
    error::{PipelineError, Result},
    geometry::{crop_bbox, rotate_crop, sort_reading_order_by},
    infer::{EngineLoader, ORTConfig, OrtLoader},
    orientation::OrientationClassifier,
    recognition::TextRecognizer,
};

/// How text crops are cut from the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    /// Axis-aligned box crop.
    #[default]
    Bbox,
    /// Perspective-unwarped crop of the detected quadrilateral.
    Rotated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrOptions {
    /// Minimum detector box score.
    pub conf_threshold: f32,
    pub use_orientation: bool,
    pub orientation_threshold: f32,
    pub merge_overlaps: bool,
    pub merge_threshold: f32,
    pub use_close: bool,
    /// Replaces the detector's binarization threshold.
    pub det_thresh: Option<f32>,
    pub crop_mode: CropMode,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            use_orientation: true,
            orientation_threshold: 0.9,
            merge_overlaps: false,
            merge_threshold: 0.9,
            use_close: true,
            det_thresh: None,
            crop_mode: CropMode::Bbox,
        }
    }
}

pub struct OcrModels {
    pub detector: TextDetector,
    pub recognizer: TextRecognizer,
    pub classifier: OrientationClassifier,
}

/// Detection, recognition and page orientation behind one lazily loaded slot.
pub struct OcrPipeline {
    config: OcrPipelineConfig,
    loader: Arc<dyn EngineLoader>,
    slot: ModelSlot<OcrModels>,
}

fn component<T>(name: &str, res: Result<T>, failures: &mut Vec<String>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            failures.push(format!("{name}: {e}"));
            None
        }
    }
}

impl OcrPipeline {
    pub fn new(config: OcrPipelineConfig, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            config,
            loader,
            slot: ModelSlot::new(),
        }
    }

    pub fn with_ort(config: OcrPipelineConfig, ort: ORTConfig) -> Self {
        Self::new(config, Arc::new(OrtLoader::new(ort)))
    }

    pub fn config(&self) -> &OcrPipelineConfig {
        &self.config
    }

    pub(crate) fn loader(&self) -> Arc<dyn EngineLoader> {
        self.loader.clone()
    }

    fn build(&self) -> Result<OcrModels> {
        let missing = missing_files(&self.config.required_artifacts());
        if !missing.is_empty() {
            return Err(PipelineError::MissingArtifacts(missing));
        }
        let loader = self.loader.as_ref();
        let mut failures = Vec::new();
        let detector = component(
            "text detector",
            TextDetector::load(loader, &self.config.det_model_dir),
            &mut failures,
        );
        let recognizer = component(
            "text recognizer",
            TextRecognizer::load(
                loader,
                &self.config.rec_model_dir,
                &self.config.rec_dict_path(),
            ),
            &mut failures,
        );
        let classifier = component(
            "orientation classifier",
            OrientationClassifier::load(loader, &self.config.cls_model_dir),
            &mut failures,
        );
        match (detector, recognizer, classifier) {
            (Some(detector), Some(recognizer), Some(classifier)) => Ok(OcrModels {
                detector,
                recognizer,
                classifier,
            }),
            _ => Err(PipelineError::LoadFailed { failures }),
        }
    }

    /// Builds every model once. Already loaded pipelines return immediately.
    #[tracing::instrument(skip_all)]
    pub fn load(&self) -> Result<()> {
        let start = Instant::now();
        self.slot.load_with(|| self.build())?;
        tracing::debug!("ocr models ready in {}ms", start.elapsed().as_millis());
        Ok(())
    }

    pub fn unload(&self) -> bool {
        let unloaded = self.slot.unload();
        if unloaded {
            tracing::info!("ocr models unloaded");
        }
        unloaded
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.is_loaded()
    }

    pub fn state(&self) -> PipelineState {
        self.slot.state()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::new(
            self.state(),
            missing_files(&self.config.required_artifacts()),
        )
    }

    /// Loaded models, loading them first if needed.
    pub fn models(&self) -> Result<Arc<OcrModels>> {
        match self.slot.get() {
            Some(models) => Ok(models),
            None => {
                tracing::info!("ocr models not loaded, loading");
                self.slot.load_with(|| self.build())
            }
        }
    }

    /// Lines in reading order: top to bottom, then left to right within a line.
    #[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn ocr(&self, image: &RgbImage, options: &OcrOptions) -> Result<Vec<OcrLine>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::InvalidInput("empty image".into()));
        }
        let models = self.models()?;
        let start = Instant::now();

        let (rotation, rotation_confidence) = page_rotation(
            &models.classifier,
            image,
            options.use_orientation,
            options.orientation_threshold,
        )?;
        let page = rotated(image, rotation);

        let mut params = models.detector.default_params();
        params.box_thresh = options.conf_threshold;
        params.use_close = options.use_close;
        if let Some(thresh) = options.det_thresh {
            params.thresh = thresh;
        }
        let regions = models.detector.detect(&page, &params)?;

        let (regions, crops): (Vec<_>, Vec<_>) = regions
            .into_iter()
            .filter_map(|region| {
                let crop = match (options.crop_mode, region.polygon.as_deref()) {
                    (CropMode::Rotated, Some(quad)) => {
                        rotate_crop(&page, quad).or_else(|| crop_bbox(&page, &region.bbox))
                    }
                    _ => crop_bbox(&page, &region.bbox),
                }?;
                Some((region, crop))
            })
            .unzip();
        let texts = models.recognizer.recognize(&crops)?;

        let lines: Vec<OcrLine> = regions
            .into_iter()
            .zip(texts)
            .map(|(region, rec)| OcrLine {
                bbox: region.bbox,
                text: rec.text,
                text_confidence: rec.confidence,
                text_region_confidence: region.confidence,
                rotation,
                rotation_confidence,
            })
            .collect();
        let mut lines = if options.merge_overlaps {
            merge_overlapping(lines, options.merge_threshold)
        } else {
            lines
        };
        sort_reading_order_by(&mut lines, |l| l.bbox);
        tracing::debug!(
            "ocr: {} lines in {}ms",
            lines.len(),
            start.elapsed().as_millis()
        );
        Ok(lines)
    }

    /// One result per page, numbered from 1.
    pub fn ocr_pages(
        &self,
        pages: &[RgbImage],
        options: &OcrOptions,
    ) -> Result<Vec<OcrPage>> {
        pages
            .iter()
            .enumerate()
            .map(|(idx, page)| {
                Ok(OcrPage {
                    page: idx + 1,
                    results: self.ocr(page, options)?,
                })
            })
            .collect()
    }
}

/// Folds lines overlapping a more confident line by at least `threshold` into it.
pub fn merge_overlapping(mut lines: Vec<OcrLine>, threshold: f32) -> Vec<OcrLine> {
    lines.sort_by(|a, b| b.text_confidence.total_cmp(&a.text_confidence));
    let mut merged: Vec<OcrLine> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged
            .iter_mut()
            .find(|m| line.bbox.overlap_ratio(&m.bbox) >= threshold)
        {
            Some(m) => {
                if line.text_confidence > m.text_confidence {
                    m.text = line.text;
                    m.text_confidence = line.text_confidence;
                }
                m.bbox = m.bbox.merge(&line.bbox);
                m.text_region_confidence = m.text_region_confidence.max(line.text_region_confidence);
            }
            None => merged.push(line),
        }
    }
    merged
}

/// Newline-joined text of the non-blank lines at or above `min_confidence`.
pub fn lines_to_text(lines: &[OcrLine], min_confidence: f32) -> String {
    lines
        .iter()
        .filter(|l| l.text_confidence >= min_confidence && !l.text.trim().is_empty())
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
