use std::{collections::HashMap, io::Write, path::PathBuf, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;
use ferrocr_api::init_tracing;
use ferrocr_core::{
    config::ModelEntry,
    document::{is_pdf, load_image, DEFAULT_OCR_DPI, DEFAULT_STRUCTURE_DPI},
    entities::{OcrLine, OcrPage, PageResult, StructureResult},
    pipeline::lines_to_text,
    render::{to_markdown, FigureMode},
    utils::FIGURES_DIR,
    DocumentInput, ModelRegistry, OcrOptions, OcrPipeline, OcrPipelineConfig, ORTConfig,
    OptLevel, PdfRasterizer, PipelineError, PipelineStatus, StructureOptions,
    StructurePipeline, StructurePipelineConfig,
};
use memmap2::Mmap;
use mimalloc::MiMalloc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::{fs::File, net::TcpListener};
use tower_http::trace::TraceLayer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const MAX_SIZE_LIMIT: usize = 250 * 1024 * 1024;

/// Lines below this recognition confidence are left out of `/ocr` and
/// `/ocr/ocr2text` responses.
const MIN_LINE_CONFIDENCE: f32 = 0.1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OpenTelemetry collector endpoint
    #[arg(long, env = "OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Sentry DSN
    #[arg(long, env = "SENTRY_DSN")]
    sentry_dsn: Option<String>,

    /// Sentry environment
    #[arg(long, env = "SENTRY_ENVIRONMENT", default_value = "dev")]
    sentry_environment: String,

    /// API listen address
    #[arg(long, env = "API_LISTEN_ADDR", default_value = "0.0.0.0:3002")]
    listen_addr: String,

    /// Directory holding one sub-directory per model
    #[arg(long, env = "FERROCR_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Load every model before accepting requests
    #[arg(long, env = "FERROCR_PRELOAD", default_value_t = false)]
    preload: bool,

    /// Number of threads to use within individual operations
    #[arg(
        long,
        short = 'j',
        help = "Number of threads to use for parallel processing within operations",
        default_value = "4"
    )]
    intra_threads: usize,

    /// Number of threads to use for parallel operation execution
    #[arg(
        long,
        help = "Number of threads to use for executing operations in parallel",
        default_value = "1"
    )]
    inter_threads: usize,

    #[arg(long, short = 'O', help = "Ort graph optimization level (0-3)")]
    graph_opt_level: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
}

fn pipeline_error(e: PipelineError) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    api_error(status, e.to_string())
}

#[derive(Clone)]
struct AppState {
    registry: ModelRegistry,
    ocr: Arc<OcrPipeline>,
    structure: Arc<StructurePipeline>,
    rasterizer: Option<Arc<PdfRasterizer>>,
}

/// A multipart form: the uploaded file spooled to disk plus the text fields.
#[derive(Default)]
struct Upload {
    file: Option<NamedTempFile>,
    filename: Option<String>,
    size: usize,
    fields: HashMap<String, String>,
}

impl Upload {
    fn f32_field(&self, name: &str, default: f32) -> Result<f32, ApiError> {
        parse_f32_field(&self.fields, name, default)
    }

    fn bool_field(&self, name: &str, default: bool) -> Result<bool, ApiError> {
        parse_bool_field(&self.fields, name, default)
    }

    /// Maps the spooled file. The temp file is returned alongside so it
    /// outlives the mapping.
    async fn map_file(self) -> Result<(NamedTempFile, Mmap, Option<String>), ApiError> {
        let temp_file = self
            .file
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing `file` field"))?;
        if self.size == 0 {
            return Err(api_error(StatusCode::BAD_REQUEST, "uploaded file is empty"));
        }
        let file = File::open(temp_file.path()).await.map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to open temp file: {}", e),
            )
        })?;
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to memory map file: {}", e),
                )
            })?
        };
        Ok((temp_file, mmap, self.filename))
    }
}

fn parse_f32_field(
    fields: &HashMap<String, String>,
    name: &str,
    default: f32,
) -> Result<f32, ApiError> {
    match fields.get(name).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(v) => v
            .parse::<f32>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid value for `{name}`: {v}"),
                )
            }),
    }
}

fn parse_bool_field(
    fields: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ApiError> {
    match fields.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid value for `{name}`: {v}"),
            )),
        },
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut upload = Upload::default();
    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to get next field: {}", e),
        )
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let mut temp_file = NamedTempFile::new().map_err(|e| {
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to create temp file: {}", e),
                )
            })?;
            upload.filename = field.file_name().map(str::to_owned);
            upload.size = 0;
            while let Some(chunk) = field.chunk().await.map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read chunk: {}", e),
                )
            })? {
                temp_file.write_all(&chunk).map_err(|e| {
                    api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to write to temp file: {}", e),
                    )
                })?;
                upload.size += chunk.len();
            }
            temp_file.flush().map_err(|e| {
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to flush temp file: {}", e),
                )
            })?;
            upload.file = Some(temp_file);
        } else {
            let value = field.text().await.map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read field `{name}`: {}", e),
                )
            })?;
            upload.fields.insert(name, value);
        }
    }
    Ok(upload)
}

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {}", e),
        )
    })?
}

fn decode_document(
    rasterizer: Option<&PdfRasterizer>,
    bytes: &[u8],
    filename: Option<&str>,
    dpi: f32,
) -> Result<DocumentInput, ApiError> {
    match rasterizer {
        Some(rasterizer) => {
            DocumentInput::from_bytes(bytes, filename, rasterizer, dpi).map_err(pipeline_error)
        }
        None if is_pdf(bytes, filename) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "PDF support unavailable: pdfium library not found",
        )),
        None => load_image(bytes)
            .map(DocumentInput::Image)
            .map_err(pipeline_error),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let use_sentry = args.sentry_dsn.is_some();
    let _guard = args.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1f32,
                sample_rate: 1f32,
                environment: Some(args.sentry_environment.clone().into()),
                ..Default::default()
            },
        ))
    });

    init_tracing(
        args.otlp_endpoint.as_deref(),
        "ferrocr-api".into(),
        use_sentry,
    )?;

    let ort_config = ORTConfig {
        intra_threads: args.intra_threads,
        inter_threads: args.inter_threads,
        opt_level: args
            .graph_opt_level
            .map(OptLevel::try_from)
            .transpose()?
            .unwrap_or_default(),
    };
    let registry = args
        .models_dir
        .clone()
        .map(ModelRegistry::new)
        .unwrap_or_else(ModelRegistry::from_env);
    tracing::info!("using models from {}", registry.root().display());

    let ocr = Arc::new(OcrPipeline::with_ort(
        OcrPipelineConfig::from_registry(&registry),
        ort_config.clone(),
    ));
    let structure = Arc::new(StructurePipeline::with_ort(
        StructurePipelineConfig::from_registry(&registry),
        ort_config,
    ));
    let rasterizer = match PdfRasterizer::new() {
        Ok(r) => Some(Arc::new(r)),
        Err(e) => {
            tracing::warn!("PDF input disabled: {e}");
            None
        }
    };

    if args.preload {
        let (ocr, structure) = (ocr.clone(), structure.clone());
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            ocr.load()?;
            structure.load()?;
            Ok(())
        })
        .await??;
    }

    let app_state = AppState {
        registry,
        ocr,
        structure,
        rasterizer,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/models", get(list_models))
        .route("/ocr", post(ocr_handler))
        .route("/ocr/ocr2text", post(ocr_to_text_handler))
        .route("/ocr/load", post(ocr_load_handler))
        .route("/ocr/unload", post(ocr_unload_handler))
        .route("/ocr/model_status", get(ocr_status_handler))
        .route("/structure", post(structure_handler))
        .route("/structure/markdown", post(markdown_handler))
        .route("/structure/load", post(structure_load_handler))
        .route("/structure/unload", post(structure_unload_handler))
        .route("/structure/model_status", get(structure_status_handler))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .layer(DefaultBodyLimit::max(MAX_SIZE_LIMIT));

    let listener = TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(
        "Starting ferrocr service listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("Service is healthy")
}

#[tracing::instrument(skip_all)]
async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ModelEntry>>>, ApiError> {
    let registry = state.registry.clone();
    let models = blocking(move || registry.list().map_err(pipeline_error)).await?;
    Ok(ApiResponse::ok(models))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OcrResults {
    Lines(Vec<OcrLine>),
    Pages(Vec<OcrPage>),
}

#[derive(Debug, Serialize, Deserialize)]
struct OcrLines {
    results: Vec<OcrLine>,
}

#[derive(Debug, Serialize)]
struct OcrResponse {
    results: OcrResults,
}

fn confident(mut lines: Vec<OcrLine>) -> Vec<OcrLine> {
    lines.retain(|l| l.text_confidence >= MIN_LINE_CONFIDENCE);
    lines
}

#[tracing::instrument(skip_all)]
async fn ocr_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<OcrResponse>>, ApiError> {
    let upload = read_multipart(multipart).await?;
    let options = OcrOptions {
        det_thresh: Some(upload.f32_field("det_db_thresh", 0.3)?),
        orientation_threshold: upload.f32_field("cls_thresh", 0.9)?,
        use_orientation: upload.bool_field("use_cls", true)?,
        merge_overlaps: upload.bool_field("merge_overlaps", false)?,
        ..Default::default()
    };
    let (_temp_file, mmap, filename) = upload.map_file().await?;

    let results = blocking(move || {
        let document = decode_document(
            state.rasterizer.as_deref(),
            &mmap,
            filename.as_deref(),
            DEFAULT_OCR_DPI,
        )?;
        let results = match document {
            DocumentInput::Image(image) => state
                .ocr
                .ocr(&image, &options)
                .map(|lines| OcrResults::Lines(confident(lines))),
            DocumentInput::Pdf(pages) => state.ocr.ocr_pages(&pages, &options).map(|pages| {
                OcrResults::Pages(
                    pages
                        .into_iter()
                        .map(|p| OcrPage {
                            page: p.page,
                            results: confident(p.results),
                        })
                        .collect(),
                )
            }),
        };
        results.map_err(pipeline_error)
    })
    .await?;

    Ok(ApiResponse::ok(OcrResponse { results }))
}

#[derive(Debug, Serialize)]
struct TextResponse {
    text: String,
}

#[tracing::instrument(skip_all)]
async fn ocr_to_text_handler(Json(body): Json<OcrLines>) -> impl IntoResponse {
    ApiResponse::ok(TextResponse {
        text: lines_to_text(&body.results, MIN_LINE_CONFIDENCE),
    })
}

#[derive(Debug, Serialize)]
struct LoadResponse {
    loaded: bool,
    message: String,
}

#[tracing::instrument(skip_all)]
async fn ocr_load_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<LoadResponse>>, ApiError> {
    let ocr = state.ocr.clone();
    blocking(move || ocr.load().map_err(pipeline_error)).await?;
    Ok(ApiResponse::ok(LoadResponse {
        loaded: true,
        message: "OCR models loaded".into(),
    }))
}

#[tracing::instrument(skip_all)]
async fn ocr_unload_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<LoadResponse>>, ApiError> {
    let ocr = state.ocr.clone();
    let was_loaded = blocking(move || Ok(ocr.unload())).await?;
    Ok(ApiResponse::ok(LoadResponse {
        loaded: false,
        message: unload_message("OCR", was_loaded),
    }))
}

#[tracing::instrument(skip_all)]
async fn ocr_status_handler(State(state): State<AppState>) -> Json<ApiResponse<PipelineStatus>> {
    ApiResponse::ok(state.ocr.status())
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum StructureResponse {
    Page(StructureResult),
    Pages(Vec<PageResult<StructureResult>>),
}

#[tracing::instrument(skip_all)]
async fn structure_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<StructureResponse>>, ApiError> {
    let upload = read_multipart(multipart).await?;
    let options = StructureOptions {
        layout_conf: upload.f32_field("layout_conf_threshold", 0.5)?,
        ocr_det_thresh: Some(upload.f32_field("ocr_det_db_thresh", 0.3)?),
        orientation_threshold: upload.f32_field("ocr_cls_thresh", 0.9)?,
        use_orientation: upload.bool_field("ocr_use_cls", true)?,
        ..Default::default()
    };
    let (_temp_file, mmap, filename) = upload.map_file().await?;

    let response = blocking(move || {
        let document = decode_document(
            state.rasterizer.as_deref(),
            &mmap,
            filename.as_deref(),
            DEFAULT_STRUCTURE_DPI,
        )?;
        let result = match document {
            DocumentInput::Image(image) => state
                .structure
                .analyze_structure(&image, &options)
                .map(StructureResponse::Page),
            DocumentInput::Pdf(pages) => state
                .structure
                .analyze_pages(&pages, &options)
                .map(StructureResponse::Pages),
        };
        result.map_err(pipeline_error)
    })
    .await?;

    Ok(ApiResponse::ok(response))
}

#[derive(Debug, Serialize)]
struct MarkdownImage {
    filename: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct MarkdownResponse {
    markdown: String,
    images: Vec<MarkdownImage>,
}

#[tracing::instrument(skip_all)]
async fn markdown_handler(
    multipart: Multipart,
) -> Result<Json<ApiResponse<MarkdownResponse>>, ApiError> {
    let upload = read_multipart(multipart).await?;
    let result: StructureResult = upload
        .fields
        .get("layout_result")
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing `layout_result` field"))
        .and_then(|raw| {
            serde_json::from_str(raw).map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to parse layout_result: {}", e),
                )
            })
        })?;
    let mode = if upload.bool_field("external_images", false)? {
        FigureMode::External {
            dir: FIGURES_DIR.to_owned(),
        }
    } else {
        FigureMode::Inline
    };
    let (_temp_file, mmap, _) = upload.map_file().await?;

    let document = blocking(move || {
        let image = load_image(&mmap).map_err(pipeline_error)?;
        to_markdown(&result, &image, mode).map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to convert to markdown: {}", e),
            )
        })
    })
    .await?;

    Ok(ApiResponse::ok(MarkdownResponse {
        markdown: document.markdown,
        images: document
            .images
            .into_iter()
            .map(|(filename, bytes)| MarkdownImage {
                filename,
                data: STANDARD.encode(bytes),
            })
            .collect(),
    }))
}

#[tracing::instrument(skip_all)]
async fn structure_load_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<LoadResponse>>, ApiError> {
    let structure = state.structure.clone();
    blocking(move || structure.load().map_err(pipeline_error)).await?;
    Ok(ApiResponse::ok(LoadResponse {
        loaded: true,
        message: "Structure models loaded".into(),
    }))
}

#[tracing::instrument(skip_all)]
async fn structure_unload_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<LoadResponse>>, ApiError> {
    let structure = state.structure.clone();
    let was_loaded = blocking(move || Ok(structure.unload())).await?;
    Ok(ApiResponse::ok(LoadResponse {
        loaded: false,
        message: unload_message("Structure", was_loaded),
    }))
}

#[tracing::instrument(skip_all)]
async fn structure_status_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<PipelineStatus>> {
    ApiResponse::ok(state.structure.status())
}

fn unload_message(pipeline: &str, was_loaded: bool) -> String {
    if was_loaded {
        format!("{pipeline} models unloaded")
    } else {
        format!("{pipeline} models were not loaded")
    }
}
