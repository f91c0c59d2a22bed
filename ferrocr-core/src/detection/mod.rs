use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use ndarray::{Array4, Axis, Ix2};

use crate::{
    config::{DetectorConfig, LimitType, MODEL_FILE},
    entities::DetectedRegion,
    error::{PipelineError, Result},
    infer::{EngineLoader, InferenceEngine, Stage, TensorMap},
};

pub mod db;

/// Per-call DB post-processing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    pub thresh: f32,
    pub box_thresh: f32,
    pub unclip_ratio: f32,
    pub max_candidates: usize,
    pub use_close: bool,
}

impl From<&DetectorConfig> for DetectionParams {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            thresh: config.thresh,
            box_thresh: config.box_thresh,
            unclip_ratio: config.unclip_ratio,
            max_candidates: config.max_candidates,
            use_close: config.use_close,
        }
    }
}

#[derive(Debug)]
pub struct DetContext {
    src_width: u32,
    src_height: u32,
    params: DetectionParams,
}

/// DB text detector.
pub struct TextDetector {
    engine: Box<dyn InferenceEngine>,
    config: DetectorConfig,
    input_name: String,
}

impl TextDetector {
    /// Side lengths are rounded to this multiple.
    pub const SIZE_ALIGN: u32 = 32;

    pub fn new(engine: Box<dyn InferenceEngine>, config: DetectorConfig) -> Self {
        let input_name = engine
            .inputs()
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "x".to_owned());
        Self {
            engine,
            config,
            input_name,
        }
    }

    pub fn load(loader: &dyn EngineLoader, model_dir: &Path) -> Result<Self> {
        let config = DetectorConfig::load_or_default(model_dir)?;
        let engine = loader.load(&model_dir.join(MODEL_FILE))?;
        Ok(Self::new(engine, config))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn default_params(&self) -> DetectionParams {
        DetectionParams::from(&self.config)
    }

    pub fn detect(&self, image: &RgbImage, params: &DetectionParams) -> Result<Vec<DetectedRegion>> {
        self.run((image, params))
    }

    /// Aspect-preserving target size, aligned to [`Self::SIZE_ALIGN`].
    pub fn resize_dims(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = (width as f32, height as f32);
        let limit = self.config.limit_side_len as f32;
        let ratio = match self.config.limit_type {
            LimitType::Max if w.max(h) > limit => limit / w.max(h),
            LimitType::Min if w.min(h) < limit => limit / w.min(h),
            _ => 1.0,
        };
        let (mut rw, mut rh) = ((w * ratio).trunc(), (h * ratio).trunc());
        let max_side = self.config.max_side_limit as f32;
        if rw.max(rh) > max_side {
            let r = max_side / rw.max(rh);
            rw = (rw * r).trunc();
            rh = (rh * r).trunc();
        }
        let align = |v: f32| {
            let a = Self::SIZE_ALIGN as f32;
            ((v / a).round() * a).max(a) as u32
        };
        (align(rw), align(rh))
    }
}

impl Stage for TextDetector {
    type Input<'a> = (&'a RgbImage, &'a DetectionParams);
    type Context = DetContext;
    type Output = Vec<DetectedRegion>;

    fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    #[tracing::instrument(skip_all)]
    fn preprocess(&self, (image, params): Self::Input<'_>) -> Result<(TensorMap, DetContext)> {
        let (src_width, src_height) = image.dimensions();
        if src_width == 0 || src_height == 0 {
            return Err(PipelineError::InvalidInput("empty image".into()));
        }
        let (w, h) = self.resize_dims(src_width, src_height);
        let resized = image::imageops::resize(image, w, h, FilterType::Triangle);

        let [mr, mg, mb] = self.config.mean;
        let [sr, sg, sb] = self.config.std;
        let mut input = Array4::<f32>::zeros([1, 3, h as usize, w as usize]);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            input[[0, 0, y, x]] = (r as f32 / 255.0 - mr) / sr;
            input[[0, 1, y, x]] = (g as f32 / 255.0 - mg) / sg;
            input[[0, 2, y, x]] = (b as f32 / 255.0 - mb) / sb;
        }

        let inputs = TensorMap::new().with(self.input_name.clone(), input.into_dyn());
        Ok((
            inputs,
            DetContext {
                src_width,
                src_height,
                params: params.clone(),
            },
        ))
    }

    #[tracing::instrument(skip_all)]
    fn postprocess(&self, outputs: TensorMap, ctx: DetContext) -> Result<Vec<DetectedRegion>> {
        let (_, maps) = outputs.take_first()?;
        let mut maps = maps.into_float();
        // [1, 1, H, W] or [1, H, W] down to [H, W]
        while maps.ndim() > 2 {
            if maps.shape()[0] != 1 {
                return Err(PipelineError::Output(format!(
                    "expected a single probability map, got shape {:?}",
                    maps.shape()
                )));
            }
            maps = maps.index_axis_move(Axis(0), 0);
        }
        let pred = maps.into_dimensionality::<Ix2>()?;
        let regions = db::boxes_from_bitmap(&pred.view(), &ctx.params, ctx.src_width, ctx.src_height);
        tracing::debug!("detected {} text regions", regions.len());
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entities::BBox, testing::StubEngine};
    use image::Rgb;

    fn detector(config: DetectorConfig) -> TextDetector {
        TextDetector::new(Box::new(StubEngine::detector()), config)
    }

    #[test]
    fn resize_dims_are_aligned() {
        let det = detector(DetectorConfig::default());
        assert_eq!(det.resize_dims(100, 50), (96, 64));
        assert_eq!(det.resize_dims(1920, 1080), (960, 544));
        assert_eq!(det.resize_dims(10, 10), (32, 32));

        let det = detector(DetectorConfig {
            limit_type: LimitType::Min,
            limit_side_len: 64,
            ..Default::default()
        });
        assert_eq!(det.resize_dims(32, 16), (128, 64));
    }

    #[test]
    fn detects_dark_bar_in_original_coordinates() {
        let mut img = RgbImage::from_pixel(300, 100, Rgb([255, 255, 255]));
        for y in 30..60 {
            for x in 40..240 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let det = detector(DetectorConfig::default());
        let regions = det.detect(&img, &det.default_params()).unwrap();
        assert_eq!(regions.len(), 1);
        assert!(regions[0].bbox.overlap_ratio(&BBox::new(40, 30, 240, 60)) > 0.8);
        assert!(regions[0].bbox.x1 <= 300 && regions[0].bbox.y1 <= 100);
    }

    #[test]
    fn blank_page_has_no_regions() {
        let img = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let det = detector(DetectorConfig::default());
        assert!(det.detect(&img, &det.default_params()).unwrap().is_empty());
    }
}
