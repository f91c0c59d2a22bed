use std::{ops::Range, path::Path};

use image::RgbImage;
use pdfium_render::prelude::{PdfDocument, PdfPage, PdfRenderConfig, Pdfium};

use crate::error::{PipelineError, Result};

pub const DEFAULT_STRUCTURE_DPI: f32 = 200.0;
pub const DEFAULT_OCR_DPI: f32 = 300.0;

/// Rendered pages are capped to this many pixels on their longest side.
pub const MAX_PAGE_SIDE: u32 = 6000;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Decodes any format `image` understands into an RGB buffer. Alpha is dropped.
pub fn load_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(PipelineError::InvalidInput("empty image".into()));
    }
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::InvalidInput(format!("can't decode image: {e}")))
}

pub fn is_pdf(bytes: &[u8], filename: Option<&str>) -> bool {
    bytes.starts_with(PDF_MAGIC)
        || filename
            .and_then(|f| Path::new(f).extension())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Renders PDF pages through a dynamically bound pdfium.
pub struct PdfRasterizer {
    pdfium: Pdfium,
}

impl PdfRasterizer {
    /// Binds the pdfium library next to the executable, falling back to the
    /// system one.
    pub fn new() -> Result<Self> {
        let local_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| ".".into());
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
            &local_dir,
        ))
        .or_else(|_| Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| PipelineError::Pdf(format!("can't bind pdfium library: {e}")))?;
        Ok(Self {
            pdfium: Pdfium::new(bindings),
        })
    }

    pub fn rasterize(&self, bytes: &[u8], dpi: f32) -> Result<Vec<RgbImage>> {
        self.rasterize_range(bytes, dpi, None)
    }

    /// Renders only the 0-based `pages` range when one is given.
    #[tracing::instrument(skip_all, fields(dpi))]
    pub fn rasterize_range(
        &self,
        bytes: &[u8],
        dpi: f32,
        pages: Option<Range<usize>>,
    ) -> Result<Vec<RgbImage>> {
        if dpi <= 0.0 {
            return Err(PipelineError::InvalidInput(format!("invalid dpi {dpi}")));
        }
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| PipelineError::Pdf(format!("can't open document: {e}")))?;
        render_document(&document, dpi, pages)
    }
}

/// Checks `range` against the page count, defaulting to every page.
fn page_span(total: usize, range: Option<Range<usize>>) -> Result<Range<usize>> {
    match range {
        Some(range) if range.start >= range.end || range.end > total => {
            Err(PipelineError::InvalidInput(format!(
                "page range {}-{} is outside the document's {} pages",
                range.start + 1,
                range.end,
                total
            )))
        }
        Some(range) => Ok(range),
        None => Ok(0..total),
    }
}

fn render_document(
    document: &PdfDocument<'_>,
    dpi: f32,
    range: Option<Range<usize>>,
) -> Result<Vec<RgbImage>> {
    let pages = document.pages();
    if pages.len() == 0 {
        return Err(PipelineError::Pdf("document has no pages".into()));
    }
    let span = page_span(pages.len() as usize, range)?;
    let mut images = Vec::with_capacity(span.len());
    for (index, page) in pages.iter().enumerate().skip(span.start).take(span.len()) {
        let image = render_page(&page, dpi).map_err(|e| {
            PipelineError::Pdf(format!("can't render page {}: {e}", index + 1))
        })?;
        tracing::debug!(
            "rendered page {} at {}x{}",
            index + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }
    Ok(images)
}

fn render_page(page: &PdfPage<'_>, dpi: f32) -> std::result::Result<RgbImage, String> {
    let scale = dpi / 72.0;
    let (width, height) = page_pixels(page.width().value, page.height().value, scale);
    let config = PdfRenderConfig::new()
        .set_target_width(width as i32)
        .set_target_height(height as i32)
        .render_form_data(true)
        .render_annotations(true);
    page.render_with_config(&config)
        .map(|bitmap| bitmap.as_image().to_rgb8())
        .map_err(|e| e.to_string())
}

fn page_pixels(width_pt: f32, height_pt: f32, scale: f32) -> (u32, u32) {
    let width = (width_pt * scale).round().max(1.0);
    let height = (height_pt * scale).round().max(1.0);
    let longest = width.max(height);
    if longest > MAX_PAGE_SIDE as f32 {
        let ratio = MAX_PAGE_SIDE as f32 / longest;
        (
            ((width * ratio).round() as u32).max(1),
            ((height * ratio).round() as u32).max(1),
        )
    } else {
        (width as u32, height as u32)
    }
}

/// An uploaded document, decoded into pages.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    Image(RgbImage),
    Pdf(Vec<RgbImage>),
}

impl DocumentInput {
    pub fn from_bytes(
        bytes: &[u8],
        filename: Option<&str>,
        rasterizer: &PdfRasterizer,
        dpi: f32,
    ) -> Result<Self> {
        if is_pdf(bytes, filename) {
            Ok(DocumentInput::Pdf(rasterizer.rasterize(bytes, dpi)?))
        } else {
            Ok(DocumentInput::Image(load_image(bytes)?))
        }
    }

    pub fn pages(&self) -> &[RgbImage] {
        match self {
            DocumentInput::Image(image) => std::slice::from_ref(image),
            DocumentInput::Pdf(pages) => pages,
        }
    }

    pub fn into_pages(self) -> Vec<RgbImage> {
        match self {
            DocumentInput::Image(image) => vec![image],
            DocumentInput::Pdf(pages) => pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    #[test]
    fn pdf_detection() {
        assert!(is_pdf(b"%PDF-1.7\n...", None));
        assert!(is_pdf(b"garbage", Some("Report.PDF")));
        assert!(!is_pdf(b"%PD", Some("scan.png")));
        assert!(!is_pdf(b"\x89PNG", None));
    }

    #[test]
    fn decodes_and_drops_alpha() {
        let rgba = RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 0]));
        let mut png = Vec::new();
        rgba.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let rgb = load_image(&png).unwrap();
        assert_eq!(rgb.dimensions(), (4, 3));
        assert_eq!(rgb.get_pixel(2, 1).0, [10, 20, 30]);
    }

    #[test]
    fn garbage_is_invalid_input() {
        let err = load_image(b"not an image").unwrap_err();
        assert!(err.is_client_error());
        assert!(load_image(&[]).unwrap_err().is_client_error());
    }

    #[test]
    fn page_size_follows_dpi() {
        // US letter at 200 dpi
        assert_eq!(page_pixels(612.0, 792.0, 200.0 / 72.0), (1700, 2200));
        let (w, h) = page_pixels(612.0, 7920.0, 300.0 / 72.0);
        assert_eq!(h, MAX_PAGE_SIDE);
        assert!(w < MAX_PAGE_SIDE / 10 + 2);
    }

    #[test]
    fn page_spans() {
        assert_eq!(page_span(5, None).unwrap(), 0..5);
        assert_eq!(page_span(5, Some(2..3)).unwrap(), 2..3);
        assert!(page_span(5, Some(3..6)).unwrap_err().is_client_error());
        assert!(page_span(5, Some(2..2)).is_err());
    }

    #[test]
    fn single_image_pages() {
        let doc = DocumentInput::Image(RgbImage::new(2, 2));
        assert_eq!(doc.pages().len(), 1);
        assert_eq!(doc.into_pages().len(), 1);
    }
}
