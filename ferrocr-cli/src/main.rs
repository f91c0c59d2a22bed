use anyhow::Context;
use clap::{Parser, ValueEnum};

use ferrocr_core::{
    document::{is_pdf, load_image, DEFAULT_OCR_DPI, DEFAULT_STRUCTURE_DPI},
    entities::{OcrPage, PageResult, StructureResult},
    render::{to_markdown, FigureMode, MarkdownDocument},
    utils::{create_dirs, save_results, FIGURES_DIR},
    ModelRegistry, OcrOptions, OcrPipeline, OcrPipelineConfig, ORTConfig,
    OptLevel, PdfRasterizer, StructureOptions, StructurePipeline, StructurePipelineConfig,
};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use memmap2::Mmap;
use std::{fmt::Write, ops::Range, path::PathBuf, time::Instant};
use tokio::fs::File;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Text lines with boxes and confidences
    Ocr,
    /// Layout regions with their content, plus markdown
    Structure,
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Ferrocr - OCR and document structure analysis",
    long_about = "Ferrocr runs text detection, recognition and layout analysis over images and PDFs with ONNX models."
)]
struct Args {
    /// Path to the image or PDF file
    file_path: PathBuf,

    #[arg(value_enum, default_value_t = Mode::Ocr)]
    mode: Mode,

    #[arg(
        long,
        short('r'),
        help = "Specify pages to process (e.g., '1-5' or '1' for single page)"
    )]
    page_range: Option<String>,

    /// Specifies the target directory where results will be saved
    ///
    /// If not specified, defaults to the current working directory.
    #[arg(
        long,
        env = "FERROCR_OUTPUT_DIR",
        help = "Specify the directory to store results"
    )]
    output_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "FERROCR_MODELS_DIR",
        help = "Directory holding one sub-directory per model"
    )]
    models_dir: Option<PathBuf>,

    #[arg(long, help = "PDF rasterization DPI (defaults to 300 for ocr, 200 for structure)")]
    dpi: Option<f32>,

    #[arg(long, default_value_t = 0.3, help = "Detector binarization threshold")]
    det_thresh: f32,

    #[arg(long, default_value_t = 0.5, help = "Minimum detector box score")]
    box_thresh: f32,

    #[arg(long, default_value_t = 0.5, help = "Minimum layout region confidence")]
    layout_thresh: f32,

    #[arg(long, default_value_t = 0.9, help = "Minimum orientation confidence to rotate a page")]
    cls_thresh: f32,

    #[arg(long, default_value_t = false, help = "Skip page orientation classification")]
    no_cls: bool,

    #[arg(long, default_value_t = false, help = "Merge overlapping OCR lines")]
    merge_overlaps: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Inline figures in the markdown instead of saving them under figures/"
    )]
    inline_figures: bool,

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

fn parse_page_range(range_str: &str) -> anyhow::Result<Range<usize>> {
    if let Some((start, end)) = range_str.split_once('-') {
        let start: usize = start.trim().parse()?;
        let end: usize = end.trim().parse()?;
        if start > 0 && end >= start {
            Ok(Range {
                start: start - 1,
                end,
            })
        } else {
            anyhow::bail!("Invalid page range: start must be > 0 and end must be >= start")
        }
    } else {
        let page: usize = range_str.trim().parse()?;
        if page > 0 {
            Ok(Range {
                start: page - 1,
                end: page,
            })
        } else {
            anyhow::bail!("Page number must be greater than 0")
        }
    }
}

/// Pages selected by `range`, keeping their 1-based numbers.
fn select_pages<T>(
    pages: Vec<T>,
    range: Option<Range<usize>>,
) -> anyhow::Result<Vec<(usize, T)>> {
    let numbered = pages.into_iter().enumerate().map(|(i, p)| (i + 1, p));
    match range {
        Some(range) => {
            let total = numbered.len();
            if range.end > total {
                anyhow::bail!(
                    "Page range end ({}) exceeds document length ({})",
                    range.end,
                    total
                );
            }
            Ok(numbered.skip(range.start).take(range.len()).collect())
        }
        None => Ok(numbered.collect()),
    }
}

fn setup_progress_bar(length_pages: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(length_pages as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg} ({eta})",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );
    Ok(pb)
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

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

    let page_range = args
        .page_range
        .as_deref()
        .map(parse_page_range)
        .transpose()
        .context("invalid page range")?;

    let doc_name = args
        .file_path
        .file_stem()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let file = File::open(&args.file_path)
        .await
        .with_context(|| format!("can't open {}", args.file_path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    let dpi = args.dpi.unwrap_or(match args.mode {
        Mode::Ocr => DEFAULT_OCR_DPI,
        Mode::Structure => DEFAULT_STRUCTURE_DPI,
    });
    let pages = if is_pdf(&mmap, args.file_path.to_str()) {
        let first = page_range.as_ref().map_or(0, |r| r.start);
        PdfRasterizer::new()?
            .rasterize_range(&mmap, dpi, page_range)?
            .into_iter()
            .enumerate()
            .map(|(i, page)| (first + i + 1, page))
            .collect::<Vec<_>>()
    } else {
        select_pages(vec![load_image(&mmap)?], page_range)?
    };
    tracing::info!("{} page(s) decoded", pages.len());

    let res_dir_path = create_dirs(
        args.output_dir.as_ref(),
        &doc_name,
        args.mode == Mode::Structure && !args.inline_figures,
    )?;

    let pb = setup_progress_bar(pages.len())?;
    let start = Instant::now();

    match args.mode {
        Mode::Ocr => {
            let options = OcrOptions {
                conf_threshold: args.box_thresh,
                det_thresh: Some(args.det_thresh),
                use_orientation: !args.no_cls,
                orientation_threshold: args.cls_thresh,
                merge_overlaps: args.merge_overlaps,
                ..Default::default()
            };
            let pipeline =
                OcrPipeline::with_ort(OcrPipelineConfig::from_registry(&registry), ort_config);
            pipeline.load().context("can't load ocr models")?;

            let mut results = Vec::with_capacity(pages.len());
            for (page, image) in &pages {
                pb.set_message(format!("Page #{}", page));
                let lines = pipeline
                    .ocr(image, &options)
                    .with_context(|| format!("ocr failed on page {page}"))?;
                results.push(OcrPage {
                    page: *page,
                    results: lines,
                });
                pb.inc(1u64);
            }
            pb.finish_with_message(format!(
                "Processed document in {}ms",
                start.elapsed().as_millis()
            ));
            save_results(&doc_name, &results, None, &res_dir_path)?;
        }
        Mode::Structure => {
            let options = StructureOptions {
                layout_conf: args.layout_thresh,
                ocr_det_thresh: Some(args.det_thresh),
                use_orientation: !args.no_cls,
                orientation_threshold: args.cls_thresh,
                ..Default::default()
            };
            let mode = if args.inline_figures {
                FigureMode::Inline
            } else {
                FigureMode::External {
                    dir: FIGURES_DIR.to_owned(),
                }
            };
            let pipeline = StructurePipeline::with_ort(
                StructurePipelineConfig::from_registry(&registry),
                ort_config,
            );
            pipeline.load().context("can't load structure models")?;

            let mut results: Vec<PageResult<StructureResult>> = Vec::with_capacity(pages.len());
            let mut markdown = MarkdownDocument::default();
            for (page, image) in &pages {
                pb.set_message(format!("Page #{}", page));
                let result = pipeline
                    .analyze_structure(image, &options)
                    .with_context(|| format!("structure analysis failed on page {page}"))?;
                let page_md = to_markdown(&result, image, mode.clone())?;
                if !markdown.markdown.is_empty() {
                    markdown.markdown.push_str("\n---\n\n");
                }
                markdown.markdown.push_str(&page_md.markdown);
                markdown.images.extend(page_md.images);
                results.push(PageResult {
                    page: *page,
                    result,
                });
                pb.inc(1u64);
            }
            pb.finish_with_message(format!(
                "Processed document in {}ms",
                start.elapsed().as_millis()
            ));
            save_results(&doc_name, &results, Some(&markdown), &res_dir_path)?;
        }
    }
    Ok(())
}
