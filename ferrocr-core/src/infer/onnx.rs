use std::{borrow::Cow, path::Path};

use ort::{
    execution_providers::CPUExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    value::{DynValue, ValueType},
};

use super::{EngineLoader, InferenceEngine, Tensor, TensorMap, TensorSpec};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    Disable,
    Level1,
    Level2,
    #[default]
    Level3,
}

impl TryFrom<usize> for OptLevel {
    type Error = PipelineError;

    fn try_from(level: usize) -> Result<Self> {
        match level {
            0 => Ok(OptLevel::Disable),
            1 => Ok(OptLevel::Level1),
            2 => Ok(OptLevel::Level2),
            3 => Ok(OptLevel::Level3),
            l => Err(PipelineError::InvalidInput(format!(
                "graph optimization level must be in 0..=3, got {l}"
            ))),
        }
    }
}

impl From<OptLevel> for GraphOptimizationLevel {
    fn from(level: OptLevel) -> Self {
        match level {
            OptLevel::Disable => GraphOptimizationLevel::Disable,
            OptLevel::Level1 => GraphOptimizationLevel::Level1,
            OptLevel::Level2 => GraphOptimizationLevel::Level2,
            OptLevel::Level3 => GraphOptimizationLevel::Level3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ORTConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub opt_level: OptLevel,
}

impl ORTConfig {
    pub const ORT_INTRATHREAD: usize = 4;
    pub const ORT_INTERTHREAD: usize = 1;
}

impl Default for ORTConfig {
    fn default() -> Self {
        Self {
            intra_threads: Self::ORT_INTRATHREAD,
            inter_threads: Self::ORT_INTERTHREAD,
            opt_level: OptLevel::default(),
        }
    }
}

#[derive(Debug)]
pub struct OrtEngine {
    session: Session,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

fn tensor_spec(name: &str, ty: &ValueType) -> TensorSpec {
    let shape = match ty {
        ValueType::Tensor { dimensions, .. } => dimensions.clone(),
        _ => Vec::new(),
    };
    TensorSpec::new(name, shape)
}

impl OrtEngine {
    #[tracing::instrument(skip(config))]
    pub fn new(model_path: &Path, config: &ORTConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .with_optimization_level(config.opt_level.into())?
            .with_intra_threads(config.intra_threads)?
            .with_inter_threads(config.inter_threads)?
            .commit_from_file(model_path)?;

        let inputs = session
            .inputs
            .iter()
            .map(|i| tensor_spec(&i.name, &i.input_type))
            .collect::<Vec<_>>();
        let outputs = session
            .outputs
            .iter()
            .map(|o| tensor_spec(&o.name, &o.output_type))
            .collect::<Vec<_>>();
        tracing::debug!(
            "loaded {} with inputs {:?} outputs {:?}",
            model_path.display(),
            inputs,
            outputs
        );

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }

    fn extract(name: &str, value: &DynValue) -> Result<Tensor> {
        if let Ok(t) = value.try_extract_tensor::<f32>() {
            return Ok(Tensor::Float(t.to_owned()));
        }
        if let Ok(t) = value.try_extract_tensor::<i64>() {
            return Ok(Tensor::Int(t.to_owned()));
        }
        if let Ok(t) = value.try_extract_tensor::<i32>() {
            return Ok(Tensor::Int(t.mapv(|v| v as i64)));
        }
        Err(PipelineError::Output(format!(
            "output {name} is not a f32/i64/i32 tensor"
        )))
    }
}

impl InferenceEngine for OrtEngine {
    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&self, inputs: TensorMap) -> Result<TensorMap> {
        let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let value: DynValue = match tensor {
                Tensor::Float(a) => ort::value::Tensor::from_array(a)?.into_dyn(),
                Tensor::Int(a) => ort::value::Tensor::from_array(a)?.into_dyn(),
            };
            values.push((Cow::Owned(name), SessionInputValue::from(value)));
        }

        let outputs = self.session.run(values)?;

        let mut result = TensorMap::new();
        for spec in &self.outputs {
            let value = outputs.get(spec.name.as_str()).ok_or_else(|| {
                PipelineError::Output(format!("can't get the value of output {}", spec.name))
            })?;
            result.insert(spec.name.clone(), Self::extract(&spec.name, value)?);
        }
        Ok(result)
    }
}

/// Builds [`OrtEngine`]s sharing one [`ORTConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrtLoader {
    pub config: ORTConfig,
}

impl OrtLoader {
    pub fn new(config: ORTConfig) -> Self {
        Self { config }
    }
}

impl EngineLoader for OrtLoader {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(OrtEngine::new(model_path, &self.config)?))
    }
}
