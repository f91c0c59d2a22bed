//! Model registry and typed views over the `inference.yml` sidecars shipped next to each model.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{PipelineError, Result};

pub const MODELS_DIR_ENV: &str = "FERROCR_MODELS_DIR";
pub const MODEL_FILE: &str = "inference.onnx";
pub const SIDECAR_FILE: &str = "inference.yml";
pub const DEFAULT_DICT_FILE: &str = "ppocrv5_dict.txt";

pub const DEFAULT_DET_MODEL: &str = "PP-OCRv5_mobile_det-ONNX";
pub const DEFAULT_REC_MODEL: &str = "PP-OCRv5_mobile_rec-ONNX";
pub const DEFAULT_CLS_MODEL: &str = "PP-LCNet_x1_0_doc_ori-ONNX";
pub const DEFAULT_LAYOUT_MODEL: &str = "PP-DocLayout-L-ONNX";

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub path: PathBuf,
    pub has_sidecar: bool,
}

/// Directory holding one sub-directory per model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$FERROCR_MODELS_DIR`, else `<data dir>/ferrocr/models`.
    pub fn from_env() -> Self {
        match std::env::var_os(MODELS_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(Self::default_root()),
        }
    }

    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ferrocr")
            .join("models")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    pub fn list(&self) -> Result<Vec<ModelEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.join(MODEL_FILE).is_file() {
                continue;
            }
            let id = match path.file_name().and_then(|n| n.to_str()) {
                Some(id) => id.to_owned(),
                None => continue,
            };
            entries.push(ModelEntry {
                has_sidecar: path.join(SIDECAR_FILE).is_file(),
                id,
                path,
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

fn config_error(path: &Path, reason: impl ToString) -> PipelineError {
    PipelineError::Config {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
    serde_yaml::from_str(&raw).map_err(|e| config_error(path, e))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PaddleSidecar {
    #[serde(default)]
    global: Option<GlobalSection>,
    #[serde(default)]
    pre_process: Option<PreProcessSection>,
    #[serde(default)]
    post_process: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GlobalSection {
    #[serde(default)]
    model_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PreProcessSection {
    #[serde(default)]
    transform_ops: Vec<HashMap<String, Value>>,
}

impl PaddleSidecar {
    /// Typed view of the first transform op named `name`. Ops without arguments yield defaults.
    fn transform_op<T: DeserializeOwned + Default>(&self, name: &str, path: &Path) -> Result<Option<T>> {
        let Some(pre) = &self.pre_process else {
            return Ok(None);
        };
        for op in &pre.transform_ops {
            if let Some(args) = op.get(name) {
                if args.is_null() {
                    return Ok(Some(T::default()));
                }
                return serde_yaml::from_value(args.clone())
                    .map(Some)
                    .map_err(|e| config_error(path, format!("{name}: {e}")));
            }
        }
        Ok(None)
    }

    fn post_process<T: DeserializeOwned + Default>(&self, path: &Path) -> Result<T> {
        match &self.post_process {
            Some(v) if !v.is_null() => serde_yaml::from_value(v.clone())
                .map_err(|e| config_error(path, format!("PostProcess: {e}"))),
            _ => Ok(T::default()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NormalizeOp {
    #[serde(default)]
    mean: Option<[f32; 3]>,
    #[serde(default)]
    std: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// Longest side is capped at the limit.
    #[default]
    Max,
    /// Shortest side is raised to the limit.
    Min,
}

#[derive(Debug, Default, Deserialize)]
struct DetResizeOp {
    #[serde(default)]
    limit_side_len: Option<u32>,
    #[serde(default)]
    limit_type: Option<LimitType>,
    #[serde(default)]
    resize_long: Option<u32>,
    #[serde(default)]
    max_side_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DetPostProcess {
    #[serde(default)]
    thresh: Option<f32>,
    #[serde(default)]
    box_thresh: Option<f32>,
    #[serde(default)]
    unclip_ratio: Option<f32>,
    #[serde(default)]
    max_candidates: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub limit_side_len: u32,
    pub limit_type: LimitType,
    pub max_side_limit: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub thresh: f32,
    pub box_thresh: f32,
    pub unclip_ratio: f32,
    pub max_candidates: usize,
    pub use_close: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            limit_side_len: 960,
            limit_type: LimitType::Max,
            max_side_limit: 4000,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            thresh: 0.3,
            box_thresh: 0.6,
            unclip_ratio: 1.5,
            max_candidates: 1000,
            use_close: false,
        }
    }
}

impl DetectorConfig {
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        let sidecar: PaddleSidecar = read_yaml(path)?;
        let mut config = Self::default();
        if let Some(resize) = sidecar.transform_op::<DetResizeOp>("DetResizeForTest", path)? {
            if let Some(len) = resize.limit_side_len.or(resize.resize_long) {
                config.limit_side_len = len;
            }
            if let Some(limit_type) = resize.limit_type {
                config.limit_type = limit_type;
            }
            if let Some(max_side) = resize.max_side_limit {
                config.max_side_limit = max_side;
            }
        }
        if let Some(norm) = sidecar.transform_op::<NormalizeOp>("NormalizeImage", path)? {
            config.mean = norm.mean.unwrap_or(config.mean);
            config.std = norm.std.unwrap_or(config.std);
        }
        let post: DetPostProcess = sidecar.post_process(path)?;
        config.thresh = post.thresh.unwrap_or(config.thresh);
        config.box_thresh = post.box_thresh.unwrap_or(config.box_thresh);
        config.unclip_ratio = post.unclip_ratio.unwrap_or(config.unclip_ratio);
        config.max_candidates = post.max_candidates.unwrap_or(config.max_candidates);
        Ok(config)
    }

    /// Sidecar values when `inference.yml` exists, defaults otherwise.
    pub fn load_or_default(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(SIDECAR_FILE);
        if path.is_file() {
            Self::from_sidecar(&path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecResizeOp {
    #[serde(default)]
    image_shape: Option<Vec<usize>>,
}

#[derive(Debug, Default, Deserialize)]
struct RecPostProcess {
    #[serde(default)]
    character_dict: Option<Vec<Value>>,
    #[serde(default)]
    use_space_char: Option<bool>,
}

fn yaml_scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerConfig {
    pub image_height: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub batch_size: usize,
    pub use_space_char: bool,
    /// Characters listed inline in the sidecar.
    pub character_dict: Option<Vec<String>>,
    pub model_name: Option<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            image_height: 48,
            min_width: 320,
            max_width: 3200,
            batch_size: 6,
            use_space_char: true,
            character_dict: None,
            model_name: None,
        }
    }
}

impl RecognizerConfig {
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        let sidecar: PaddleSidecar = read_yaml(path)?;
        let mut config = Self {
            model_name: sidecar.global.as_ref().and_then(|g| g.model_name.clone()),
            ..Self::default()
        };
        if let Some(resize) = sidecar.transform_op::<RecResizeOp>("RecResizeImg", path)? {
            if let Some([_, h, w]) = resize.image_shape.as_deref().and_then(|s| <[usize; 3]>::try_from(s).ok()) {
                config.image_height = h as u32;
                config.min_width = w as u32;
            }
        }
        let post: RecPostProcess = sidecar.post_process(path)?;
        config.use_space_char = post.use_space_char.unwrap_or(config.use_space_char);
        config.character_dict = post
            .character_dict
            .map(|chars| chars.iter().filter_map(yaml_scalar_to_string).collect());
        Ok(config)
    }

    pub fn load_or_default(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(SIDECAR_FILE);
        if path.is_file() {
            Self::from_sidecar(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Character table: inline sidecar entries, else one character per line of `dict_path`.
    pub fn load_dictionary(&self, dict_path: &Path) -> Result<Vec<String>> {
        let mut chars = match &self.character_dict {
            Some(chars) if !chars.is_empty() => chars.clone(),
            _ => fs::read_to_string(dict_path)
                .map_err(|e| config_error(dict_path, e))?
                .lines()
                .map(str::to_owned)
                .collect(),
        };
        if chars.is_empty() {
            return Err(config_error(dict_path, "empty character dictionary"));
        }
        if self.use_space_char {
            chars.push(" ".to_owned());
        }
        Ok(chars)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResizeShortOp {
    #[serde(default)]
    resize_short: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CropOp {
    #[serde(default)]
    size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClsPostProcess {
    #[serde(default)]
    topk: Option<TopkSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TopkSection {
    #[serde(default)]
    label_list: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub resize_short: u32,
    pub crop_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub label_list: Vec<String>,
    pub model_name: Option<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            resize_short: 256,
            crop_size: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            label_list: ["0", "90", "180", "270"].map(String::from).to_vec(),
            model_name: None,
        }
    }
}

impl ClassifierConfig {
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        let sidecar: PaddleSidecar = read_yaml(path)?;
        let mut config = Self {
            model_name: sidecar.global.as_ref().and_then(|g| g.model_name.clone()),
            ..Self::default()
        };
        if let Some(op) = sidecar.transform_op::<ResizeShortOp>("ResizeImage", path)? {
            config.resize_short = op.resize_short.unwrap_or(config.resize_short);
        }
        if let Some(op) = sidecar.transform_op::<CropOp>("CropImage", path)? {
            config.crop_size = op.size.unwrap_or(config.crop_size);
        }
        if let Some(norm) = sidecar.transform_op::<NormalizeOp>("NormalizeImage", path)? {
            config.mean = norm.mean.unwrap_or(config.mean);
            config.std = norm.std.unwrap_or(config.std);
        }
        let post: ClsPostProcess = sidecar.post_process(path)?;
        if let Some(labels) = post.topk.and_then(|t| t.label_list) {
            let labels: Vec<String> = labels.iter().filter_map(yaml_scalar_to_string).collect();
            if !labels.is_empty() {
                config.label_list = labels;
            }
        }
        Ok(config)
    }
}

/// Coordinate space of the boxes a layout model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxConvention {
    /// Already in original-image pixels.
    #[default]
    Original,
    /// Pixels of the resized model canvas.
    Canvas,
    /// Fractions of the image size.
    Normalized,
    /// Picks whichever mapping keeps the most boxes inside the image.
    Auto,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum LayoutPreprocessOp {
    Resize {
        #[serde(default)]
        target_size: Option<[u32; 2]>,
    },
    NormalizeImage {
        #[serde(default)]
        mean: Option<[f32; 3]>,
        #[serde(default)]
        std: Option<[f32; 3]>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct LayoutSidecar {
    #[serde(default, rename = "Global")]
    global: Option<GlobalSection>,
    #[serde(default, rename = "Preprocess")]
    preprocess: Vec<LayoutPreprocessOp>,
    #[serde(default)]
    label_list: Vec<String>,
    #[serde(default)]
    draw_threshold: Option<f32>,
    #[serde(default)]
    box_convention: Option<BoxConvention>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConfig {
    /// `[height, width]` of the model canvas.
    pub target_size: [u32; 2],
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub label_list: Vec<String>,
    pub threshold: f32,
    pub box_convention: BoxConvention,
    pub model_name: Option<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            target_size: [640, 640],
            mean: [0.0; 3],
            std: [1.0; 3],
            label_list: Vec::new(),
            threshold: 0.5,
            box_convention: BoxConvention::Original,
            model_name: None,
        }
    }
}

impl LayoutConfig {
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        let sidecar: LayoutSidecar = read_yaml(path)?;
        if sidecar.label_list.is_empty() {
            return Err(config_error(path, "no label_list found"));
        }
        let mut config = Self {
            label_list: sidecar.label_list,
            model_name: sidecar.global.and_then(|g| g.model_name),
            ..Self::default()
        };
        config.threshold = sidecar.draw_threshold.unwrap_or(config.threshold);
        config.box_convention = sidecar.box_convention.unwrap_or_default();
        for op in sidecar.preprocess {
            match op {
                LayoutPreprocessOp::Resize { target_size } => {
                    config.target_size = target_size.unwrap_or(config.target_size);
                }
                LayoutPreprocessOp::NormalizeImage { mean, std } => {
                    config.mean = mean.unwrap_or(config.mean);
                    config.std = std.unwrap_or(config.std);
                }
                LayoutPreprocessOp::Other => {}
            }
        }
        Ok(config)
    }
}

/// Model locations for the OCR pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPipelineConfig {
    pub det_model_dir: PathBuf,
    pub rec_model_dir: PathBuf,
    pub cls_model_dir: PathBuf,
    /// Overrides `<rec_model_dir>/ppocrv5_dict.txt`.
    pub rec_dict_path: Option<PathBuf>,
}

impl OcrPipelineConfig {
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        Self {
            det_model_dir: registry.resolve(DEFAULT_DET_MODEL),
            rec_model_dir: registry.resolve(DEFAULT_REC_MODEL),
            cls_model_dir: registry.resolve(DEFAULT_CLS_MODEL),
            rec_dict_path: None,
        }
    }

    pub fn rec_dict_path(&self) -> PathBuf {
        self.rec_dict_path
            .clone()
            .unwrap_or_else(|| self.rec_model_dir.join(DEFAULT_DICT_FILE))
    }

    /// Files that must exist before any model is built.
    pub fn required_artifacts(&self) -> Vec<PathBuf> {
        let mut files = vec![
            self.det_model_dir.join(MODEL_FILE),
            self.rec_model_dir.join(MODEL_FILE),
            self.cls_model_dir.join(MODEL_FILE),
            self.cls_model_dir.join(SIDECAR_FILE),
        ];
        let inline_dict = RecognizerConfig::load_or_default(&self.rec_model_dir)
            .ok()
            .and_then(|c| c.character_dict)
            .is_some_and(|d| !d.is_empty());
        if !inline_dict {
            files.push(self.rec_dict_path());
        }
        files
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructurePipelineConfig {
    pub ocr: OcrPipelineConfig,
    pub layout_model_dir: PathBuf,
}

impl StructurePipelineConfig {
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        Self {
            ocr: OcrPipelineConfig::from_registry(registry),
            layout_model_dir: registry.resolve(DEFAULT_LAYOUT_MODEL),
        }
    }

    pub fn required_artifacts(&self) -> Vec<PathBuf> {
        vec![
            self.layout_model_dir.join(MODEL_FILE),
            self.layout_model_dir.join(SIDECAR_FILE),
        ]
    }
}

/// Paths from `candidates` that do not exist on disk.
pub fn missing_files(candidates: &[PathBuf]) -> Vec<PathBuf> {
    candidates.iter().filter(|p| !p.is_file()).cloned().collect()
}
