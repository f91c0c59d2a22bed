use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use ndarray::{Array2, Array4, Axis};

use crate::{
    config::{BoxConvention, LayoutConfig, MODEL_FILE, SIDECAR_FILE},
    entities::{BBox, DetectedRegion, RegionType},
    error::{PipelineError, Result},
    infer::{EngineLoader, InferenceEngine, Stage, TensorMap},
};

/// Raw layout prediction before coordinate mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutCandidate {
    pub label: RegionType,
    pub score: f32,
    pub coords: [f32; 4],
}

#[derive(Debug)]
pub struct LayoutContext {
    src_width: u32,
    src_height: u32,
    /// canvas / original, `(y, x)`
    scale: (f32, f32),
    threshold: f32,
}

pub struct LayoutDetector {
    engine: Box<dyn InferenceEngine>,
    config: LayoutConfig,
    image_input: String,
}

impl LayoutDetector {
    pub const IMAGE_INPUT: &'static str = "image";
    pub const IM_SHAPE_INPUT: &'static str = "im_shape";
    pub const SCALE_FACTOR_INPUT: &'static str = "scale_factor";

    pub fn new(engine: Box<dyn InferenceEngine>, config: LayoutConfig) -> Self {
        let image_input = if engine.has_input(Self::IMAGE_INPUT) {
            Self::IMAGE_INPUT.to_owned()
        } else {
            engine
                .inputs()
                .iter()
                .map(|i| i.name.as_str())
                .find(|n| *n != Self::IM_SHAPE_INPUT && *n != Self::SCALE_FACTOR_INPUT)
                .unwrap_or(Self::IMAGE_INPUT)
                .to_owned()
        };
        Self {
            engine,
            config,
            image_input,
        }
    }

    pub fn load(loader: &dyn EngineLoader, model_dir: &Path) -> Result<Self> {
        let config = LayoutConfig::from_sidecar(&model_dir.join(SIDECAR_FILE))?;
        let engine = loader.load(&model_dir.join(MODEL_FILE))?;
        tracing::debug!(
            "layout detector {} ready with {} labels",
            config.model_name.as_deref().unwrap_or("(unnamed)"),
            config.label_list.len()
        );
        Ok(Self::new(engine, config))
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Regions scoring at least `threshold`, in original-image pixels.
    #[tracing::instrument(skip_all)]
    pub fn detect(&self, image: &RgbImage, threshold: f32) -> Result<Vec<DetectedRegion>> {
        self.run((image, threshold))
    }

    fn candidates(&self, rows: &Array2<f32>, threshold: f32) -> Vec<LayoutCandidate> {
        rows.axis_iter(Axis(0))
            .filter_map(|row| {
                let (class_id, score) = (row[0], row[1]);
                if score < threshold || class_id < 0.0 {
                    return None;
                }
                let label = self.config.label_list.get(class_id as usize)?;
                Some(LayoutCandidate {
                    label: RegionType::from(label.as_str()),
                    score,
                    coords: [row[2], row[3], row[4], row[5]],
                })
            })
            .collect()
    }
}

/// Maps `coords` into original pixels under a concrete convention.
fn map_coords(coords: [f32; 4], convention: BoxConvention, ctx: &LayoutContext) -> [f32; 4] {
    let [x1, y1, x2, y2] = coords;
    let (sy, sx) = ctx.scale;
    let (w, h) = (ctx.src_width as f32, ctx.src_height as f32);
    match convention {
        BoxConvention::Canvas => [x1 / sx, y1 / sy, x2 / sx, y2 / sy],
        BoxConvention::Normalized => [x1 * w, y1 * h, x2 * w, y2 * h],
        BoxConvention::Original | BoxConvention::Auto => coords,
    }
}

fn to_bbox(coords: [f32; 4], width: u32, height: u32) -> Option<BBox> {
    let (w, h) = (width as f32, height as f32);
    let bbox = BBox::new(
        coords[0].clamp(0.0, w) as i32,
        coords[1].clamp(0.0, h) as i32,
        coords[2].clamp(0.0, w) as i32,
        coords[3].clamp(0.0, h) as i32,
    );
    (!bbox.is_degenerate()).then_some(bbox)
}

/// Convention keeping the most usable boxes inside the image. Ties favour original, then canvas.
fn resolve_convention(
    candidates: &[LayoutCandidate],
    convention: BoxConvention,
    ctx: &LayoutContext,
) -> BoxConvention {
    if convention != BoxConvention::Auto {
        return convention;
    }
    let (w, h) = (ctx.src_width as f32, ctx.src_height as f32);
    let fits = |conv: BoxConvention| {
        candidates
            .iter()
            .filter(|c| {
                let [x1, y1, x2, y2] = map_coords(c.coords, conv, ctx);
                x1 >= -1.0 && y1 >= -1.0 && x2 <= w + 1.0 && y2 <= h + 1.0 && x2 - x1 >= 1.0 && y2 - y1 >= 1.0
            })
            .count()
    };
    [
        BoxConvention::Original,
        BoxConvention::Canvas,
        BoxConvention::Normalized,
    ]
    .into_iter()
    .fold((BoxConvention::Original, 0usize), |best, conv| {
        let n = fits(conv);
        if n > best.1 {
            (conv, n)
        } else {
            best
        }
    })
    .0
}

impl Stage for LayoutDetector {
    type Input<'a> = (&'a RgbImage, f32);
    type Context = LayoutContext;
    type Output = Vec<DetectedRegion>;

    fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    fn preprocess(&self, (image, threshold): Self::Input<'_>) -> Result<(TensorMap, LayoutContext)> {
        let (src_width, src_height) = image.dimensions();
        if src_width == 0 || src_height == 0 {
            return Err(PipelineError::InvalidInput("empty image".into()));
        }
        let [th, tw] = self.config.target_size;
        let resized = image::imageops::resize(image, tw, th, FilterType::Triangle);

        let [mr, mg, mb] = self.config.mean;
        let [sr, sg, sb] = self.config.std;
        let mut input = Array4::<f32>::zeros([1, 3, th as usize, tw as usize]);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            input[[0, 0, y, x]] = (r as f32 / 255.0 - mr) / sr;
            input[[0, 1, y, x]] = (g as f32 / 255.0 - mg) / sg;
            input[[0, 2, y, x]] = (b as f32 / 255.0 - mb) / sb;
        }

        let scale = (th as f32 / src_height as f32, tw as f32 / src_width as f32);
        let mut inputs = TensorMap::new().with(self.image_input.clone(), input.into_dyn());
        if self.engine.has_input(Self::IM_SHAPE_INPUT) {
            let im_shape = Array2::from_shape_vec((1, 2), vec![th as f32, tw as f32])?;
            inputs.insert(Self::IM_SHAPE_INPUT, im_shape.into_dyn());
        }
        if self.engine.has_input(Self::SCALE_FACTOR_INPUT) {
            let factor = Array2::from_shape_vec((1, 2), vec![scale.0, scale.1])?;
            inputs.insert(Self::SCALE_FACTOR_INPUT, factor.into_dyn());
        }
        Ok((
            inputs,
            LayoutContext {
                src_width,
                src_height,
                scale,
                threshold,
            },
        ))
    }

    fn postprocess(&self, outputs: TensorMap, ctx: LayoutContext) -> Result<Vec<DetectedRegion>> {
        let boxes = outputs
            .into_iter()
            .map(|(_, t)| t.into_float())
            .find(|t| t.ndim() == 2 && t.shape()[1] == 6)
            .ok_or_else(|| PipelineError::Output("layout model returned no [N, 6] output".into()))?
            .into_dimensionality::<ndarray::Ix2>()?;

        let candidates = self.candidates(&boxes, ctx.threshold);
        let convention = resolve_convention(&candidates, self.config.box_convention, &ctx);
        let regions: Vec<DetectedRegion> = candidates
            .into_iter()
            .filter_map(|c| {
                let bbox = to_bbox(
                    map_coords(c.coords, convention, &ctx),
                    ctx.src_width,
                    ctx.src_height,
                )?;
                Some(DetectedRegion {
                    bbox,
                    polygon: None,
                    region_type: c.label,
                    confidence: c.score,
                })
            })
            .collect();
        tracing::debug!(
            "layout found {} regions ({:?} boxes)",
            regions.len(),
            convention
        );
        Ok(regions)
    }
}
