//! Stub engines and model fixtures shared by the unit tests.

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use ndarray::{Array2, Array4, ArrayD, Axis};

use crate::{
    config::{
        ModelRegistry, DEFAULT_CLS_MODEL, DEFAULT_DET_MODEL, DEFAULT_DICT_FILE,
        DEFAULT_LAYOUT_MODEL, DEFAULT_REC_MODEL, MODEL_FILE, SIDECAR_FILE,
    },
    error::{PipelineError, Result},
    infer::{EngineLoader, InferenceEngine, Tensor, TensorMap, TensorSpec},
};

pub(crate) const TEST_DICT: &[&str] = &[
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r",
    "s", "t", "u", "v", "w", "x", "y", "z",
];

pub(crate) const LAYOUT_LABELS: &[&str] = &["text", "table", "figure", "formula", "doc_title"];

type StubFn = dyn Fn(&TensorMap) -> Result<TensorMap> + Send + Sync;

pub(crate) struct StubEngine {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    run: Box<StubFn>,
}

fn float_input<'a>(inputs: &'a TensorMap, name: &str) -> Result<&'a ArrayD<f32>> {
    match inputs.get(name) {
        Some(Tensor::Float(a)) => Ok(a),
        _ => Err(PipelineError::Inference(format!("missing input {name}"))),
    }
}

fn dict_indices(word: &str) -> Vec<usize> {
    word.chars()
        .map(|c| {
            TEST_DICT
                .iter()
                .position(|d| d.starts_with(c))
                .map(|i| i + 1)
                .unwrap_or(TEST_DICT.len() + 1)
        })
        .collect()
}

impl StubEngine {
    /// Probability 0.9 on black pixels and 0.7 on mid-gray ones, read from the
    /// normalized red channel.
    pub fn detector() -> Self {
        Self {
            inputs: vec![TensorSpec::new("x", vec![-1, 3, -1, -1])],
            outputs: vec![TensorSpec::new("sigmoid_0.tmp_0", vec![-1, 1, -1, -1])],
            run: Box::new(|inputs| {
                let x = float_input(inputs, "x")?;
                let (h, w) = (x.shape()[2], x.shape()[3]);
                let red = x
                    .index_axis(Axis(0), 0)
                    .index_axis_move(Axis(0), 0)
                    .into_dimensionality::<ndarray::Ix2>()?;
                let map = Array4::from_shape_fn([1, 1, h, w], |(_, _, y, xx)| {
                    match red[[y, xx]] {
                        v if v < -1.5 => 0.9,
                        v if v < 0.0 => 0.7,
                        _ => 0.0,
                    }
                });
                Ok(TensorMap::new().with("sigmoid_0.tmp_0", map.into_dyn()))
            }),
        }
    }

    /// Emits `word` for every crop with 0.9 on each character, blanks in between.
    /// Crops with no black pixel read as `faint_word` when one is given.
    pub fn recognizer(word: &str, faint_word: Option<&str>) -> Self {
        let indices = dict_indices(word);
        let faint_indices = faint_word.map(dict_indices);
        let classes = TEST_DICT.len() + 2;
        Self {
            inputs: vec![TensorSpec::new("x", vec![-1, 3, 48, -1])],
            outputs: vec![TensorSpec::new("softmax", vec![-1, -1, classes as i64])],
            run: Box::new(move |inputs| {
                let x = float_input(inputs, "x")?;
                let (n, w) = (x.shape()[0], x.shape()[3]);
                let longest = indices
                    .len()
                    .max(faint_indices.as_ref().map_or(0, Vec::len));
                let steps = (w / 8).max(longest * 2);
                let rest = 0.1 / (classes - 1) as f32;
                let mut probs = ndarray::Array3::<f32>::from_elem((n, steps, classes), rest);
                for b in 0..n {
                    let darkest = x
                        .index_axis(Axis(0), b)
                        .iter()
                        .copied()
                        .fold(f32::INFINITY, f32::min);
                    let read = match &faint_indices {
                        Some(faint) if darkest > -0.6 => faint,
                        _ => &indices,
                    };
                    for t in 0..steps {
                        let class = match t % 2 {
                            0 => read.get(t / 2).copied().unwrap_or(0),
                            _ => 0,
                        };
                        probs[[b, t, class]] = 0.9;
                    }
                }
                Ok(TensorMap::new().with("softmax", probs.into_dyn()))
            }),
        }
    }

    /// Returns `probs` for every image in the batch.
    pub fn classifier(probs: Vec<f32>) -> Self {
        Self {
            inputs: vec![TensorSpec::new("x", vec![-1, 3, 224, 224])],
            outputs: vec![TensorSpec::new("softmax_1.tmp_0", vec![-1, probs.len() as i64])],
            run: Box::new(move |inputs| {
                let n = float_input(inputs, "x")?.shape()[0];
                let out = Array2::from_shape_fn((n, probs.len()), |(_, j)| probs[j]);
                Ok(TensorMap::new().with("softmax_1.tmp_0", out.into_dyn()))
            }),
        }
    }

    /// Returns fixed `(class_id, score, x1, y1, x2, y2)` rows.
    pub fn layout(rows: Vec<[f32; 6]>) -> Self {
        Self {
            inputs: vec![
                TensorSpec::new("im_shape", vec![-1, 2]),
                TensorSpec::new("image", vec![-1, 3, -1, -1]),
                TensorSpec::new("scale_factor", vec![-1, 2]),
            ],
            outputs: vec![
                TensorSpec::new("fetch_name_0", vec![-1, 6]),
                TensorSpec::new("fetch_name_1", vec![-1]),
            ],
            run: Box::new(move |inputs| {
                float_input(inputs, "image")?;
                float_input(inputs, "im_shape")?;
                let out = Array2::from_shape_fn((rows.len(), 6), |(i, j)| rows[i][j]);
                let count = ndarray::arr1(&[rows.len() as i64]);
                Ok(TensorMap::new()
                    .with("fetch_name_0", out.into_dyn())
                    .with("fetch_name_1", count.into_dyn()))
            }),
        }
    }
}

impl InferenceEngine for StubEngine {
    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&self, inputs: TensorMap) -> Result<TensorMap> {
        (self.run)(&inputs)
    }
}

/// Picks a stub by model directory name and counts constructions.
pub(crate) struct StubLoader {
    pub word: String,
    pub faint_word: Option<String>,
    pub cls_probs: Vec<f32>,
    pub layout_rows: Vec<[f32; 6]>,
    /// Model directories containing this fragment fail to load.
    pub fail_on: Option<String>,
    pub(crate) loads: AtomicUsize,
}

impl Default for StubLoader {
    fn default() -> Self {
        Self {
            word: "hello".to_owned(),
            faint_word: None,
            cls_probs: vec![0.97, 0.01, 0.01, 0.01],
            layout_rows: Vec::new(),
            fail_on: None,
            loads: AtomicUsize::new(0),
        }
    }
}

impl StubLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl EngineLoader for StubLoader {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceEngine>> {
        let dir = model_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if self.fail_on.as_deref().is_some_and(|f| dir.contains(f)) {
            return Err(PipelineError::Inference(format!("cannot load {dir}")));
        }
        let engine = if dir.contains("_det") {
            StubEngine::detector()
        } else if dir.contains("_rec") {
            StubEngine::recognizer(&self.word, self.faint_word.as_deref())
        } else if dir.contains("_ori") {
            StubEngine::classifier(self.cls_probs.clone())
        } else if dir.contains("Layout") {
            StubEngine::layout(self.layout_rows.clone())
        } else {
            return Err(PipelineError::Inference(format!("unknown model {dir}")));
        };
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(engine))
    }
}

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Lays out the four default model directories under `root`.
pub(crate) fn model_fixture(root: &Path) -> ModelRegistry {
    let registry = ModelRegistry::new(root);
    write(&registry.resolve(DEFAULT_DET_MODEL).join(MODEL_FILE), "");

    let rec = registry.resolve(DEFAULT_REC_MODEL);
    write(&rec.join(MODEL_FILE), "");
    write(&rec.join(DEFAULT_DICT_FILE), &TEST_DICT.join("\n"));

    let cls = registry.resolve(DEFAULT_CLS_MODEL);
    write(&cls.join(MODEL_FILE), "");
    write(
        &cls.join(SIDECAR_FILE),
        "PostProcess:\n  Topk:\n    topk: 1\n    label_list: [\"0\", \"90\", \"180\", \"270\"]\n",
    );

    let layout = registry.resolve(DEFAULT_LAYOUT_MODEL);
    write(&layout.join(MODEL_FILE), "");
    write(
        &layout.join(SIDECAR_FILE),
        &format!("label_list: [{}]\ndraw_threshold: 0.5\n", LAYOUT_LABELS.join(", ")),
    );
    registry
}
