use std::path::Path;

use ndarray::ArrayD;

use crate::error::{PipelineError, Result};

pub mod onnx;

pub use onnx::{ORTConfig, OptLevel, OrtEngine, OrtLoader};

#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Float(ArrayD<f32>),
    Int(ArrayD<i64>),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Float(a) => a.shape(),
            Tensor::Int(a) => a.shape(),
        }
    }

    /// Float view of the tensor, converting integer outputs.
    pub fn into_float(self) -> ArrayD<f32> {
        match self {
            Tensor::Float(a) => a,
            Tensor::Int(a) => a.mapv(|v| v as f32),
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::Float(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::Int(a)
    }
}

/// Named tensors, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap(Vec<(String, Tensor)>);

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<Tensor>) {
        let name = name.into();
        let tensor = tensor.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = tensor,
            None => self.0.push((name, tensor)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, tensor: impl Into<Tensor>) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Takes the first output, the common case for single-head models.
    pub fn take_first(mut self) -> Result<(String, Tensor)> {
        if self.0.is_empty() {
            return Err(PipelineError::Output("model returned no outputs".into()));
        }
        Ok(self.0.swap_remove(0))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Name and shape of a model input/output. Dynamic dimensions are `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Static size of dimension `axis`, `None` when dynamic or absent.
    pub fn fixed_dim(&self, axis: usize) -> Option<usize> {
        self.shape
            .get(axis)
            .copied()
            .filter(|d| *d > 0)
            .map(|d| d as usize)
    }
}

/// Opaque model runtime: named tensors in, named tensors out.
pub trait InferenceEngine: Send + Sync {
    fn inputs(&self) -> &[TensorSpec];
    fn outputs(&self) -> &[TensorSpec];
    fn run(&self, inputs: TensorMap) -> Result<TensorMap>;

    fn has_input(&self, name: &str) -> bool {
        self.inputs().iter().any(|s| s.name == name)
    }
}

pub trait EngineLoader: Send + Sync {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceEngine>>;
}

/// Preprocess, infer, postprocess.
pub trait Stage {
    type Input<'a>;
    type Context;
    type Output;

    fn engine(&self) -> &dyn InferenceEngine;

    fn preprocess(&self, input: Self::Input<'_>) -> Result<(TensorMap, Self::Context)>;

    fn postprocess(&self, outputs: TensorMap, ctx: Self::Context) -> Result<Self::Output>;

    fn infer(&self, inputs: TensorMap) -> Result<TensorMap> {
        self.engine().run(inputs)
    }

    fn run(&self, input: Self::Input<'_>) -> Result<Self::Output> {
        let (inputs, ctx) = self.preprocess(input)?;
        let outputs = self.infer(inputs)?;
        self.postprocess(outputs, ctx)
    }
}
