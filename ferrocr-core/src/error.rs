use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing model artifacts: {}", display_paths(.0))]
    MissingArtifacts(Vec<PathBuf>),

    #[error("failed to load models: {}", .failures.join("; "))]
    LoadFailed { failures: Vec<String> },

    #[error("invalid model config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected model output: {0}")]
    Output(String),

    #[error("degenerate region {0:?}")]
    DegenerateRegion([i32; 4]),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Ort(#[from] ort::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the failure comes from the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidInput(_) | PipelineError::Image(_) | PipelineError::Pdf(_)
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
