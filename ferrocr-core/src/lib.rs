pub mod config;
pub mod detection;
pub mod document;
pub mod entities;
pub mod error;
pub mod geometry;
pub mod infer;
pub mod layout;
pub mod orientation;
pub mod pipeline;
pub mod recognition;
pub mod render;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ModelRegistry, OcrPipelineConfig, StructurePipelineConfig};
pub use document::{DocumentInput, PdfRasterizer};
pub use error::{PipelineError, Result};
pub use infer::{ORTConfig, OptLevel};
pub use pipeline::{
    OcrOptions, OcrPipeline, PipelineState, PipelineStatus, StructureOptions, StructurePipeline,
};
pub use render::{to_markdown, FigureMode, MarkdownDocument};
