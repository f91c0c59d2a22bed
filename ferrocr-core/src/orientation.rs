use std::{collections::HashMap, path::Path};

use image::{imageops::FilterType, RgbImage};
use lazy_static::lazy_static;
use ndarray::{Array4, Axis};

use crate::{
    config::{ClassifierConfig, MODEL_FILE, SIDECAR_FILE},
    entities::Rotation,
    error::{PipelineError, Result},
    infer::{EngineLoader, InferenceEngine, Stage, TensorMap},
};

lazy_static! {
    static ref ANGLES: HashMap<u16, Rotation> = HashMap::from([
        (0, Rotation::Deg0),
        (90, Rotation::Deg90),
        (180, Rotation::Deg180),
        (270, Rotation::Deg270),
    ]);
}

/// Top-1 page orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrientationResult {
    pub rotation: Rotation,
    pub label: String,
    pub confidence: f32,
}

/// Reads the angle from the leading digits of a label such as `"180_degree"`.
pub fn parse_rotation(label: &str) -> Option<Rotation> {
    let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u16>().ok().and_then(|d| ANGLES.get(&d).copied())
}

fn is_distribution(row: &[f32]) -> bool {
    row.iter().all(|p| (0.0..=1.0).contains(p)) && (row.iter().sum::<f32>() - 1.0).abs() < 1e-3
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub struct OrientationClassifier {
    engine: Box<dyn InferenceEngine>,
    config: ClassifierConfig,
    input_name: String,
}

impl OrientationClassifier {
    pub fn new(engine: Box<dyn InferenceEngine>, config: ClassifierConfig) -> Self {
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

    /// The classifier sidecar is mandatory, it carries the label table.
    pub fn load(loader: &dyn EngineLoader, model_dir: &Path) -> Result<Self> {
        let config = ClassifierConfig::from_sidecar(&model_dir.join(SIDECAR_FILE))?;
        let engine = loader.load(&model_dir.join(MODEL_FILE))?;
        tracing::debug!(
            "orientation classifier {} ready",
            config.model_name.as_deref().unwrap_or("(unnamed)")
        );
        Ok(Self::new(engine, config))
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    #[tracing::instrument(skip_all)]
    pub fn classify(&self, image: &RgbImage) -> Result<OrientationResult> {
        self.run(image)
    }

    /// Short side to `resize_short`, then a centered `crop_size` square.
    fn resize_and_crop(&self, image: &RgbImage) -> RgbImage {
        let (w, h) = image.dimensions();
        let scale = self.config.resize_short as f32 / w.min(h) as f32;
        let rw = ((w as f32 * scale).round() as u32).max(1);
        let rh = ((h as f32 * scale).round() as u32).max(1);
        let resized = image::imageops::resize(image, rw, rh, FilterType::Triangle);

        let cw = self.config.crop_size.min(rw);
        let ch = self.config.crop_size.min(rh);
        image::imageops::crop_imm(&resized, (rw - cw) / 2, (rh - ch) / 2, cw, ch).to_image()
    }
}

impl Stage for OrientationClassifier {
    type Input<'a> = &'a RgbImage;
    type Context = ();
    type Output = OrientationResult;

    fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    fn preprocess(&self, image: &RgbImage) -> Result<(TensorMap, ())> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::InvalidInput("empty image".into()));
        }
        let crop = self.resize_and_crop(image);
        let (w, h) = crop.dimensions();
        let [mr, mg, mb] = self.config.mean;
        let [sr, sg, sb] = self.config.std;
        let mut input = Array4::<f32>::zeros([1, 3, h as usize, w as usize]);
        for (x, y, pixel) in crop.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            input[[0, 0, y, x]] = (r as f32 / 255.0 - mr) / sr;
            input[[0, 1, y, x]] = (g as f32 / 255.0 - mg) / sg;
            input[[0, 2, y, x]] = (b as f32 / 255.0 - mb) / sb;
        }
        Ok((
            TensorMap::new().with(self.input_name.clone(), input.into_dyn()),
            (),
        ))
    }

    fn postprocess(&self, outputs: TensorMap, _: ()) -> Result<OrientationResult> {
        let (_, probs) = outputs.take_first()?;
        let probs = probs.into_float();
        let row: Vec<f32> = match probs.ndim() {
            1 => probs.iter().copied().collect(),
            2 => probs.index_axis(Axis(0), 0).iter().copied().collect(),
            _ => {
                return Err(PipelineError::Output(format!(
                    "unexpected classifier output shape {:?}",
                    probs.shape()
                )))
            }
        };
        let row = if is_distribution(&row) { row } else { softmax(&row) };

        let (idx, confidence) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        let label = self
            .config
            .label_list
            .get(idx)
            .ok_or_else(|| PipelineError::Output(format!("class {idx} has no label")))?
            .clone();
        let rotation = parse_rotation(&label)
            .ok_or_else(|| PipelineError::Output(format!("unsupported orientation label {label}")))?;
        tracing::debug!("page orientation {label} ({confidence:.3})");
        Ok(OrientationResult {
            rotation,
            label,
            confidence,
        })
    }
}
