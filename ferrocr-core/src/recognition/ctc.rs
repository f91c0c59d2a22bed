use ndarray::{ArrayView2, Axis, Ix2, Ix3};

use crate::{
    entities::RecognitionResult,
    error::{PipelineError, Result},
    infer::Tensor,
};

/// Greedy CTC decoder. Class 0 is the blank, class `i` maps to `characters[i - 1]`.
#[derive(Debug, Clone)]
pub struct CtcDecoder {
    characters: Vec<String>,
}

impl CtcDecoder {
    pub const BLANK: usize = 0;

    pub fn new(characters: Vec<String>) -> Self {
        Self { characters }
    }

    pub fn num_classes(&self) -> usize {
        self.characters.len() + 1
    }

    /// Collapses repeats, drops blanks and out-of-range classes, averages the kept confidences.
    pub fn decode<I>(&self, steps: I) -> RecognitionResult
    where
        I: IntoIterator<Item = (usize, f32)>,
    {
        let mut text = String::new();
        let mut confidences = Vec::new();
        let mut prev: Option<usize> = None;
        for (idx, conf) in steps {
            if prev == Some(idx) {
                continue;
            }
            prev = Some(idx);
            if idx == Self::BLANK {
                continue;
            }
            if let Some(c) = self.characters.get(idx - 1) {
                text.push_str(c);
                confidences.push(conf);
            }
        }
        if confidences.is_empty() {
            return RecognitionResult::empty();
        }
        let confidence = confidences.iter().sum::<f32>() / confidences.len() as f32;
        RecognitionResult { text, confidence }
    }

    /// Decodes `[T, C]` class probabilities by per-step argmax.
    pub fn decode_probs(&self, probs: &ArrayView2<f32>) -> RecognitionResult {
        self.decode(probs.axis_iter(Axis(0)).map(|step| {
            step.iter()
                .enumerate()
                .fold((0usize, f32::MIN), |(bi, bv), (i, &v)| {
                    if v > bv {
                        (i, v)
                    } else {
                        (bi, bv)
                    }
                })
        }))
    }

    /// `[N, T, C]` probabilities or `[N, T]` pre-argmaxed indices, one result per row.
    pub fn decode_batch(&self, output: Tensor) -> Result<Vec<RecognitionResult>> {
        match output {
            Tensor::Float(probs) if probs.ndim() == 3 => {
                let probs = probs.into_dimensionality::<Ix3>()?;
                Ok(probs
                    .axis_iter(Axis(0))
                    .map(|seq| self.decode_probs(&seq))
                    .collect())
            }
            Tensor::Int(indices) if indices.ndim() == 2 => {
                let indices = indices.into_dimensionality::<Ix2>()?;
                Ok(indices
                    .axis_iter(Axis(0))
                    .map(|seq| self.decode(seq.iter().map(|&i| (i.max(0) as usize, 1.0))))
                    .collect())
            }
            Tensor::Float(indices) if indices.ndim() == 2 => {
                let indices = indices.into_dimensionality::<Ix2>()?;
                Ok(indices
                    .axis_iter(Axis(0))
                    .map(|seq| self.decode(seq.iter().map(|&i| (i.max(0.0) as usize, 1.0))))
                    .collect())
            }
            other => Err(PipelineError::Output(format!(
                "unsupported recognizer output shape {:?}",
                other.shape()
            ))),
        }
    }
}
