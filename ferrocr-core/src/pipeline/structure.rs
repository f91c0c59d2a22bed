use std::{sync::Arc, time::Instant};

use image::RgbImage;

use super::{
    lifecycle::{ModelSlot, PipelineState, PipelineStatus},
    ocr::{OcrModels, OcrOptions, OcrPipeline},
    page_rotation, rotated,
};
use crate::{
    config::{missing_files, StructurePipelineConfig},
    entities::{
        DetectedRegion, FigureRegion, FormulaContent, FormulaRegion, PageResult,
        ProcessingMetadata, RegionRoute, StructureResult, TableContent, TableRegion, TextRegion,
    },
    error::{PipelineError, Result},
    geometry::{crop_bbox, unclip_box},
    infer::{EngineLoader, ORTConfig, OrtLoader},
    layout::{merge_same_type, LayoutDetector},
};

/// Extracts table content from a cropped table region.
pub trait TableRecognizer: Send + Sync {
    fn recognize(&self, crop: &RgbImage, region: &DetectedRegion) -> Result<TableContent>;
}

/// Extracts LaTeX from a cropped formula region.
pub trait FormulaRecognizer: Send + Sync {
    fn recognize(&self, crop: &RgbImage, region: &DetectedRegion) -> Result<FormulaContent>;
}

/// Leaves table regions empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTableRecognizer;

impl TableRecognizer for NoTableRecognizer {
    fn recognize(&self, _: &RgbImage, _: &DetectedRegion) -> Result<TableContent> {
        Ok(TableContent::default())
    }
}

/// Leaves formula regions empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFormulaRecognizer;

impl FormulaRecognizer for NoFormulaRecognizer {
    fn recognize(&self, _: &RgbImage, _: &DetectedRegion) -> Result<FormulaContent> {
        Ok(FormulaContent::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureOptions {
    pub layout_conf: f32,
    /// Minimum recognition confidence for a line to count towards its region.
    pub ocr_conf: f32,
    pub unclip_ratio: f32,
    pub use_orientation: bool,
    pub orientation_threshold: f32,
    pub merge_layout: bool,
    pub layout_merge_threshold: f32,
    pub ocr_det_thresh: Option<f32>,
}

impl Default for StructureOptions {
    fn default() -> Self {
        Self {
            layout_conf: 0.5,
            ocr_conf: 0.5,
            unclip_ratio: 0.2,
            use_orientation: true,
            orientation_threshold: 0.9,
            merge_layout: false,
            layout_merge_threshold: 0.8,
            ocr_det_thresh: None,
        }
    }
}

enum RegionContent {
    Text(TextRegion),
    Table(TableRegion),
    Formula(FormulaRegion),
    Figure(FigureRegion),
}

/// Layout analysis on top of an [`OcrPipeline`].
pub struct StructurePipeline {
    config: StructurePipelineConfig,
    ocr: OcrPipeline,
    layout: ModelSlot<LayoutDetector>,
    tables: Box<dyn TableRecognizer>,
    formulas: Box<dyn FormulaRecognizer>,
}

impl StructurePipeline {
    pub fn new(config: StructurePipelineConfig, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            ocr: OcrPipeline::new(config.ocr.clone(), loader),
            config,
            layout: ModelSlot::new(),
            tables: Box::new(NoTableRecognizer),
            formulas: Box::new(NoFormulaRecognizer),
        }
    }

    pub fn with_ort(config: StructurePipelineConfig, ort: ORTConfig) -> Self {
        Self::new(config, Arc::new(OrtLoader::new(ort)))
    }

    pub fn with_table_recognizer(mut self, tables: impl TableRecognizer + 'static) -> Self {
        self.tables = Box::new(tables);
        self
    }

    pub fn with_formula_recognizer(mut self, formulas: impl FormulaRecognizer + 'static) -> Self {
        self.formulas = Box::new(formulas);
        self
    }

    pub fn ocr(&self) -> &OcrPipeline {
        &self.ocr
    }

    fn required_artifacts(&self) -> Vec<std::path::PathBuf> {
        let mut files = self.config.ocr.required_artifacts();
        files.extend(self.config.required_artifacts());
        files
    }

    /// Loads the inner OCR models and the layout model. On failure nothing
    /// loaded by this call is kept.
    #[tracing::instrument(skip_all)]
    pub fn load(&self) -> Result<()> {
        let missing = missing_files(&self.required_artifacts());
        if !missing.is_empty() {
            return Err(PipelineError::MissingArtifacts(missing));
        }
        let ocr_was_loaded = self.ocr.is_loaded();
        let mut failures = Vec::new();
        if let Err(e) = self.ocr.load() {
            match e {
                PipelineError::LoadFailed { failures: f } => failures.extend(f),
                e => failures.push(format!("ocr pipeline: {e}")),
            }
        }
        let loader = self.ocr.loader();
        if let Err(e) = self
            .layout
            .load_with(|| LayoutDetector::load(loader.as_ref(), &self.config.layout_model_dir))
        {
            failures.push(format!("layout detector: {e}"));
        }
        if failures.is_empty() {
            return Ok(());
        }
        self.layout.unload();
        if !ocr_was_loaded {
            self.ocr.unload();
        }
        Err(PipelineError::LoadFailed { failures })
    }

    pub fn unload(&self) -> bool {
        let layout = self.layout.unload();
        let ocr = self.ocr.unload();
        layout || ocr
    }

    pub fn is_loaded(&self) -> bool {
        self.layout.is_loaded() && self.ocr.is_loaded()
    }

    pub fn state(&self) -> PipelineState {
        match (self.layout.state(), self.ocr.state()) {
            (PipelineState::Loading, _) | (_, PipelineState::Loading) => PipelineState::Loading,
            (PipelineState::Loaded, PipelineState::Loaded) => PipelineState::Loaded,
            _ => PipelineState::Unloaded,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::new(self.state(), missing_files(&self.required_artifacts()))
    }

    fn models(&self) -> Result<(Arc<OcrModels>, Arc<LayoutDetector>)> {
        if !self.is_loaded() {
            tracing::info!("structure models not loaded, loading");
            self.load()?;
        }
        let layout = self
            .layout
            .get()
            .ok_or_else(|| PipelineError::LoadFailed {
                failures: vec!["layout detector was unloaded".into()],
            })?;
        Ok((self.ocr.models()?, layout))
    }

    #[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn analyze_structure(
        &self,
        image: &RgbImage,
        options: &StructureOptions,
    ) -> Result<StructureResult> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::InvalidInput("empty image".into()));
        }
        let (ocr_models, layout) = self.models()?;
        let start = Instant::now();

        let (rotation, rotation_confidence) = page_rotation(
            &ocr_models.classifier,
            image,
            options.use_orientation,
            options.orientation_threshold,
        )?;
        let page = rotated(image, rotation);

        let mut layout_regions = layout.detect(&page, options.layout_conf)?;
        if options.merge_layout {
            layout_regions = merge_same_type(layout_regions, options.layout_merge_threshold);
        }

        let mut result = StructureResult {
            image_shape: [page.height(), page.width(), 3],
            rotation,
            rotation_confidence,
            layout_regions: Vec::new(),
            text_regions: Vec::new(),
            table_regions: Vec::new(),
            formula_regions: Vec::new(),
            figure_regions: Vec::new(),
            metadata: ProcessingMetadata::default(),
        };
        for region in &layout_regions {
            match self.process_region(&page, region, options) {
                Ok(Some(RegionContent::Text(r))) => result.text_regions.push(r),
                Ok(Some(RegionContent::Table(r))) => result.table_regions.push(r),
                Ok(Some(RegionContent::Formula(r))) => result.formula_regions.push(r),
                Ok(Some(RegionContent::Figure(r))) => result.figure_regions.push(r),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        "skipping {} region {:?}: {e}",
                        region.region_type,
                        region.bbox
                    )
                }
            }
        }
        result.layout_regions = layout_regions;
        result.metadata = ProcessingMetadata::new(start.elapsed());
        tracing::debug!(
            "structure: {} layout regions, {} text regions in {}ms",
            result.layout_regions.len(),
            result.text_regions.len(),
            result.metadata.processing_duration.as_millis()
        );
        Ok(result)
    }

    /// One result per page, numbered from 1.
    pub fn analyze_pages(
        &self,
        pages: &[RgbImage],
        options: &StructureOptions,
    ) -> Result<Vec<PageResult<StructureResult>>> {
        pages
            .iter()
            .enumerate()
            .map(|(idx, page)| {
                Ok(PageResult {
                    page: idx + 1,
                    result: self.analyze_structure(page, options)?,
                })
            })
            .collect()
    }

    fn process_region(
        &self,
        page: &RgbImage,
        region: &DetectedRegion,
        options: &StructureOptions,
    ) -> Result<Option<RegionContent>> {
        let route = region.region_type.route();
        if route == RegionRoute::LayoutOnly {
            return Ok(None);
        }
        let crop = unclip_box(&region.bbox, options.unclip_ratio)
            .clip(page.width(), page.height())
            .and_then(|b| crop_bbox(page, &b))
            .ok_or(PipelineError::DegenerateRegion(region.bbox.into()))?;

        let content = match route {
            RegionRoute::Text => {
                let ocr_options = OcrOptions {
                    use_orientation: false,
                    use_close: true,
                    det_thresh: options.ocr_det_thresh,
                    ..OcrOptions::default()
                };
                let lines: Vec<_> = self
                    .ocr
                    .ocr(&crop, &ocr_options)?
                    .into_iter()
                    .filter(|l| l.text_confidence >= options.ocr_conf)
                    .collect();
                if lines.is_empty() {
                    return Ok(None);
                }
                let text_confidence =
                    lines.iter().map(|l| l.text_confidence).sum::<f32>() / lines.len() as f32;
                let text = lines
                    .into_iter()
                    .map(|l| l.text)
                    .collect::<Vec<_>>()
                    .join(" ");
                RegionContent::Text(TextRegion {
                    region: region.clone(),
                    text,
                    text_confidence,
                })
            }
            RegionRoute::Table => RegionContent::Table(TableRegion {
                region: region.clone(),
                content: self.tables.recognize(&crop, region)?,
            }),
            RegionRoute::Formula => RegionContent::Formula(FormulaRegion {
                region: region.clone(),
                content: self.formulas.recognize(&crop, region)?,
            }),
            RegionRoute::Figure => RegionContent::Figure(FigureRegion {
                region: region.clone(),
            }),
            RegionRoute::LayoutOnly => return Ok(None),
        };
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelRegistry, DEFAULT_LAYOUT_MODEL, SIDECAR_FILE},
        entities::{BBox, RegionType},
        testing::{model_fixture, StubLoader},
    };
    use image::Rgb;

    fn page() -> RgbImage {
        let mut img = RgbImage::from_pixel(300, 200, Rgb([255, 255, 255]));
        for y in 50..80 {
            for x in 40..240 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        img
    }

    fn layout_rows() -> Vec<[f32; 6]> {
        vec![
            // text
            [0.0, 0.95, 30.0, 40.0, 250.0, 90.0],
            // table
            [1.0, 0.9, 20.0, 120.0, 280.0, 190.0],
            // figure
            [2.0, 0.85, 250.0, 10.0, 290.0, 40.0],
            // below layout_conf
            [3.0, 0.2, 0.0, 0.0, 10.0, 10.0],
        ]
    }

    fn pipeline(registry: &ModelRegistry, loader: StubLoader) -> (StructurePipeline, Arc<StubLoader>) {
        let loader = Arc::new(loader);
        let pipeline = StructurePipeline::new(
            StructurePipelineConfig::from_registry(registry),
            loader.clone(),
        );
        (pipeline, loader)
    }

    struct FixedTable;

    impl TableRecognizer for FixedTable {
        fn recognize(&self, _: &RgbImage, _: &DetectedRegion) -> Result<TableContent> {
            Ok(TableContent {
                table_html: "<table></table>".into(),
                table_data: vec![vec!["a".into(), "b".into()]],
            })
        }
    }

    struct FailingTable;

    impl TableRecognizer for FailingTable {
        fn recognize(&self, _: &RgbImage, _: &DetectedRegion) -> Result<TableContent> {
            Err(PipelineError::Inference("table model crashed".into()))
        }
    }

    #[test]
    fn routes_regions_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let loader = StubLoader {
            layout_rows: layout_rows(),
            ..Default::default()
        };
        let (pipeline, _) = pipeline(&registry, loader);
        let pipeline = pipeline.with_table_recognizer(FixedTable);

        let result = pipeline.analyze_structure(&page(), &StructureOptions::default()).unwrap();
        assert_eq!(result.image_shape, [200, 300, 3]);
        assert_eq!(result.layout_regions.len(), 3);

        assert_eq!(result.text_regions.len(), 1);
        let text = &result.text_regions[0];
        assert_eq!(text.text, "hello");
        assert_eq!(text.region.bbox, BBox::new(30, 40, 250, 90));
        assert_eq!(text.region.region_type, RegionType::Text);

        assert_eq!(result.table_regions.len(), 1);
        assert_eq!(result.table_regions[0].content.table_data[0], vec!["a", "b"]);
        assert_eq!(result.figure_regions.len(), 1);
        assert!(result.formula_regions.is_empty());
    }

    #[test]
    fn paragraph_lines_join_top_to_bottom() {
        let mut img = RgbImage::from_pixel(300, 200, Rgb([255, 255, 255]));
        for x in 40..240 {
            for y in 30..55 {
                img.put_pixel(x, y, Rgb([80, 80, 80]));
            }
            for y in 110..135 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let loader = StubLoader {
            word: "second".to_owned(),
            faint_word: Some("first".to_owned()),
            layout_rows: vec![[0.0, 0.95, 20.0, 10.0, 260.0, 160.0]],
            ..Default::default()
        };
        let (pipeline, _) = pipeline(&registry, loader);

        let result = pipeline.analyze_structure(&img, &StructureOptions::default()).unwrap();
        assert_eq!(result.text_regions.len(), 1);
        assert_eq!(result.text_regions[0].text, "first second");
    }

    #[test]
    fn failing_region_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let loader = StubLoader {
            layout_rows: layout_rows(),
            ..Default::default()
        };
        let (pipeline, _) = pipeline(&registry, loader);
        let pipeline = pipeline.with_table_recognizer(FailingTable);

        let result = pipeline.analyze_structure(&page(), &StructureOptions::default()).unwrap();
        assert!(result.table_regions.is_empty());
        assert_eq!(result.text_regions.len(), 1);
        assert_eq!(result.layout_regions.len(), 3);
    }

    #[test]
    fn three_pages_three_results() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let loader = StubLoader {
            layout_rows: vec![[0.0, 0.95, 30.0, 40.0, 250.0, 90.0]],
            ..Default::default()
        };
        let (pipeline, _) = pipeline(&registry, loader);
        let pages = vec![page(), page(), page()];

        let results = pipeline.analyze_pages(&pages, &StructureOptions::default()).unwrap();
        assert_eq!(results.len(), 3);
        for (idx, page) in results.iter().enumerate() {
            assert_eq!(page.page, idx + 1);
            assert_eq!(page.result.text_regions.len(), 1);
            assert_eq!(page.result.text_regions[0].region.region_type, RegionType::Text);
        }
    }

    #[test]
    fn load_covers_ocr_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let (pipeline, loader) = pipeline(&registry, StubLoader::default());
        pipeline.load().unwrap();
        pipeline.load().unwrap();
        assert_eq!(loader.loads(), 4);
        assert!(pipeline.is_loaded());
        assert!(pipeline.ocr().is_loaded());

        assert!(pipeline.unload());
        assert!(!pipeline.unload());
        assert_eq!(pipeline.state(), PipelineState::Unloaded);
    }

    #[test]
    fn layout_failure_rolls_back_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        std::fs::write(
            registry.resolve(DEFAULT_LAYOUT_MODEL).join(SIDECAR_FILE),
            "draw_threshold: 0.5\n",
        )
        .unwrap();
        let (pipeline, _) = pipeline(&registry, StubLoader::default());

        match pipeline.load() {
            Err(PipelineError::LoadFailed { failures }) => {
                assert!(failures.iter().any(|f| f.starts_with("layout detector")))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!pipeline.is_loaded());
        assert!(!pipeline.ocr().is_loaded());
    }

    #[test]
    fn missing_layout_model_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = model_fixture(dir.path());
        let sidecar = registry.resolve(DEFAULT_LAYOUT_MODEL).join(SIDECAR_FILE);
        std::fs::remove_file(&sidecar).unwrap();
        let (pipeline, loader) = pipeline(&registry, StubLoader::default());

        assert!(matches!(
            pipeline.load(),
            Err(PipelineError::MissingArtifacts(paths)) if paths == vec![sidecar.clone()]
        ));
        assert_eq!(loader.loads(), 0);
        assert_eq!(pipeline.status().missing, vec![sidecar]);
    }
}
