use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;

use crate::{
    config::{RecognizerConfig, MODEL_FILE},
    entities::RecognitionResult,
    error::{PipelineError, Result},
    infer::{EngineLoader, InferenceEngine, Stage, TensorMap},
};

pub mod ctc;

pub use ctc::CtcDecoder;

/// CTC line recognizer over height-normalized, zero-padded crops.
pub struct TextRecognizer {
    engine: Box<dyn InferenceEngine>,
    config: RecognizerConfig,
    decoder: CtcDecoder,
    input_name: String,
    image_height: u32,
    fixed_width: Option<u32>,
}

impl TextRecognizer {
    pub fn new(engine: Box<dyn InferenceEngine>, config: RecognizerConfig, characters: Vec<String>) -> Self {
        let input = engine.inputs().first().cloned();
        let input_name = input
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "x".to_owned());
        let image_height = input
            .as_ref()
            .and_then(|i| i.fixed_dim(2))
            .map(|h| h as u32)
            .unwrap_or(config.image_height);
        let fixed_width = input.as_ref().and_then(|i| i.fixed_dim(3)).map(|w| w as u32);
        Self {
            engine,
            decoder: CtcDecoder::new(characters),
            config,
            input_name,
            image_height,
            fixed_width,
        }
    }

    pub fn load(loader: &dyn EngineLoader, model_dir: &Path, dict_path: &Path) -> Result<Self> {
        let config = RecognizerConfig::load_or_default(model_dir)?;
        let characters = config.load_dictionary(dict_path)?;
        let engine = loader.load(&model_dir.join(MODEL_FILE))?;
        tracing::debug!(
            "recognizer {} ready with {} characters",
            config.model_name.as_deref().unwrap_or("(unnamed)"),
            characters.len()
        );
        Ok(Self::new(engine, config, characters))
    }

    pub fn decoder(&self) -> &CtcDecoder {
        &self.decoder
    }

    /// Recognizes every crop, batching by aspect ratio. Results follow input order.
    #[tracing::instrument(skip_all, fields(crops = images.len()))]
    pub fn recognize(&self, images: &[RgbImage]) -> Result<Vec<RecognitionResult>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let mut order: Vec<usize> = (0..images.len()).collect();
        order.sort_by(|&a, &b| aspect_ratio(&images[a]).total_cmp(&aspect_ratio(&images[b])));

        let mut results = vec![RecognitionResult::empty(); images.len()];
        for chunk in order.chunks(self.config.batch_size.max(1)) {
            let batch: Vec<&RgbImage> = chunk.iter().map(|&i| &images[i]).collect();
            let batch_results = self.run(&batch)?;
            for (&idx, res) in chunk.iter().zip(batch_results) {
                results[idx] = res;
            }
        }
        Ok(results)
    }

    /// Model width when fixed, otherwise wide enough for the widest crop.
    pub fn batch_width(&self, images: &[&RgbImage]) -> u32 {
        if let Some(w) = self.fixed_width {
            return w;
        }
        let max_ratio = images.iter().map(|i| aspect_ratio(i)).fold(0f32, f32::max);
        let w = (self.image_height as f32 * max_ratio).ceil() as u32;
        w.clamp(self.config.min_width, self.config.max_width.max(self.config.min_width))
    }

    fn normalize(&self, image: &RgbImage, batch_width: u32) -> Array3<f32> {
        let h = self.image_height;
        let resized_w = ((h as f32 * aspect_ratio(image)).ceil() as u32).clamp(1, batch_width);
        let resized = image::imageops::resize(image, resized_w, h, FilterType::Triangle);
        let mut out = Array3::<f32>::zeros([3, h as usize, batch_width as usize]);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            out[[0, y, x]] = (r as f32 / 255.0 - 0.5) / 0.5;
            out[[1, y, x]] = (g as f32 / 255.0 - 0.5) / 0.5;
            out[[2, y, x]] = (b as f32 / 255.0 - 0.5) / 0.5;
        }
        out
    }
}

fn aspect_ratio(image: &RgbImage) -> f32 {
    image.width() as f32 / image.height().max(1) as f32
}

impl Stage for TextRecognizer {
    type Input<'a> = &'a [&'a RgbImage];
    type Context = usize;
    type Output = Vec<RecognitionResult>;

    fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    fn preprocess(&self, images: Self::Input<'_>) -> Result<(TensorMap, usize)> {
        if images.iter().any(|i| i.width() == 0 || i.height() == 0) {
            return Err(PipelineError::InvalidInput("empty crop".into()));
        }
        let width = self.batch_width(images);
        let normalized: Vec<Array3<f32>> = images
            .par_iter()
            .map(|img| self.normalize(img, width))
            .collect();

        let mut batch = Array4::<f32>::zeros([
            images.len(),
            3,
            self.image_height as usize,
            width as usize,
        ]);
        for (mut slot, img) in batch.axis_iter_mut(Axis(0)).zip(normalized.iter()) {
            slot.assign(img);
        }
        Ok((
            TensorMap::new().with(self.input_name.clone(), batch.into_dyn()),
            images.len(),
        ))
    }

    fn postprocess(&self, outputs: TensorMap, batch_len: usize) -> Result<Vec<RecognitionResult>> {
        let (_, output) = outputs.take_first()?;
        let results = self.decoder.decode_batch(output)?;
        if results.len() != batch_len {
            return Err(PipelineError::Output(format!(
                "recognizer returned {} rows for {} crops",
                results.len(),
                batch_len
            )));
        }
        Ok(results)
    }
}
