use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, RgbImage};
use uuid::Uuid;

use super::{Render, RegionItem, Renderer};
use crate::{
    entities::{BBox, FormulaContent, RegionType, StructureResult, TableContent},
    geometry::crop_bbox,
    pipeline::rotated,
};

/// Where figure crops end up.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FigureMode {
    /// `data:` URIs inside the markdown.
    #[default]
    Inline,
    /// Links to `<dir>/figure-<uuid>.png`, bytes returned next to the markdown.
    External { dir: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkdownDocument {
    pub markdown: String,
    /// `(file name, PNG bytes)` for external figures.
    pub images: Vec<(String, Vec<u8>)>,
}

pub struct MarkdownRender<'a> {
    page: &'a RgbImage,
    mode: FigureMode,
    out: String,
    images: Vec<(String, Vec<u8>)>,
}

impl<'a> MarkdownRender<'a> {
    pub fn new(page: &'a RgbImage, mode: FigureMode) -> Self {
        Self {
            page,
            mode,
            out: String::new(),
            images: Vec::new(),
        }
    }

    pub fn finalize(self) -> MarkdownDocument {
        let mut markdown = self.out.trim_end().to_owned();
        if !markdown.is_empty() {
            markdown.push('\n');
        }
        MarkdownDocument {
            markdown,
            images: self.images,
        }
    }

    fn push_text(&mut self, region_type: &RegionType, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let block = match region_type {
            RegionType::DocTitle => format!("# {text}\n\n"),
            RegionType::ParagraphTitle
            | RegionType::FigureTitle
            | RegionType::TableTitle
            | RegionType::ChartTitle => format!("## {text}\n\n"),
            RegionType::List => format!("- {text}\n"),
            _ => format!("{text}\n\n"),
        };
        self.out.push_str(&block);
    }

    fn push_figure(&mut self, bbox: &BBox) -> anyhow::Result<()> {
        let Some(crop) = crop_bbox(self.page, bbox) else {
            self.out.push_str("*Invalid image region*\n\n");
            return Ok(());
        };
        let mut png = Vec::new();
        crop.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        let link = match &self.mode {
            FigureMode::Inline => format!("data:image/png;base64,{}", STANDARD.encode(&png)),
            FigureMode::External { dir } => {
                let filename = format!("figure-{}.png", Uuid::new_v4());
                let link = if dir.is_empty() {
                    filename.clone()
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), filename)
                };
                self.images.push((filename, png));
                link
            }
        };
        self.out.push_str(&format!("![Figure]({link})\n\n"));
        Ok(())
    }
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}

/// The first row is only a header when the table markup says so.
fn has_header_row(table_html: &str) -> bool {
    let html = table_html.to_ascii_lowercase();
    html.contains("<thead") || html.contains("<th>") || html.contains("<th ")
}

fn table_markdown(content: &TableContent) -> String {
    let max_cols = content.table_data.iter().map(Vec::len).max().unwrap_or(0);
    if max_cols == 0 {
        return if content.table_html.trim().is_empty() {
            "*No table content*\n\n".to_owned()
        } else {
            format!("{}\n\n", content.table_html.trim())
        };
    }
    let row_line = |row: &[String]| {
        let cells: Vec<String> = (0..max_cols)
            .map(|i| row.get(i).map(|c| escape_cell(c)).unwrap_or_default())
            .collect();
        format!("| {} |\n", cells.join(" | "))
    };
    let mut out = String::new();
    let (header, rows) = if has_header_row(&content.table_html) {
        content.table_data.split_at(1)
    } else {
        (&[][..], &content.table_data[..])
    };
    out.push_str(&row_line(header.first().map(Vec::as_slice).unwrap_or_default()));
    out.push_str(&format!("| {} |\n", vec!["---"; max_cols].join(" | ")));
    for row in rows {
        out.push_str(&row_line(row));
    }
    out.push('\n');
    out
}

fn formula_markdown(content: &FormulaContent) -> String {
    let latex = content.formula_latex.trim();
    let text = content.formula_text.trim();
    if !latex.is_empty() {
        format!("$${latex}$$\n\n")
    } else if !text.is_empty() {
        format!("`{text}`\n\n")
    } else {
        "*Formula not available*\n\n".to_owned()
    }
}

impl Renderer for MarkdownRender<'_> {
    type Ok = ();

    fn render_region(&mut self, region: &RegionItem<'_>) -> anyhow::Result<()> {
        match region {
            RegionItem::Text(r) => self.push_text(&r.region.region_type, &r.text),
            RegionItem::Table(r) => self.out.push_str(&table_markdown(&r.content)),
            RegionItem::Formula(r) => self.out.push_str(&formula_markdown(&r.content)),
            RegionItem::Figure(r) => self.push_figure(&r.region.bbox)?,
        }
        Ok(())
    }
}

/// Renders `result` over the page it was computed from. The page is
/// re-rotated to match the result before figures are cropped.
#[tracing::instrument(skip_all)]
pub fn to_markdown(
    result: &StructureResult,
    image: &RgbImage,
    mode: FigureMode,
) -> anyhow::Result<MarkdownDocument> {
    let page = rotated(image, result.rotation);
    let mut renderer = MarkdownRender::new(&page, mode);
    result.render(&mut renderer)?;
    Ok(renderer.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        DetectedRegion, FigureRegion, FormulaRegion, ProcessingMetadata, Rotation, TableRegion,
        TextRegion,
    };

    fn region(bbox: BBox, region_type: RegionType) -> DetectedRegion {
        DetectedRegion {
            bbox,
            polygon: None,
            region_type,
            confidence: 0.9,
        }
    }

    fn text(bbox: BBox, region_type: RegionType, text: &str) -> TextRegion {
        TextRegion {
            region: region(bbox, region_type),
            text: text.to_owned(),
            text_confidence: 0.9,
        }
    }

    fn result() -> StructureResult {
        StructureResult {
            image_shape: [400, 300, 3],
            rotation: Rotation::Deg0,
            rotation_confidence: 1.0,
            layout_regions: Vec::new(),
            text_regions: vec![
                text(BBox::new(10, 100, 290, 120), RegionType::Text, "Body text."),
                text(BBox::new(10, 10, 290, 40), RegionType::DocTitle, "Title"),
                text(BBox::new(10, 60, 290, 80), RegionType::ParagraphTitle, "Section"),
                text(BBox::new(10, 130, 290, 140), RegionType::List, "item"),
                text(BBox::new(10, 145, 290, 150), RegionType::Text, "   "),
            ],
            table_regions: vec![TableRegion {
                region: region(BBox::new(10, 160, 290, 220), RegionType::Table),
                content: TableContent {
                    table_html: String::new(),
                    table_data: vec![
                        vec!["a".into(), "b".into()],
                        vec!["1".into()],
                        vec!["2".into(), "3".into(), "4".into()],
                    ],
                },
            }],
            formula_regions: vec![FormulaRegion {
                region: region(BBox::new(10, 230, 290, 250), RegionType::Formula),
                content: FormulaContent {
                    formula_latex: "E=mc^2".into(),
                    formula_text: String::new(),
                },
            }],
            figure_regions: vec![FigureRegion {
                region: region(BBox::new(10, 260, 110, 360), RegionType::Figure),
            }],
            metadata: ProcessingMetadata::default(),
        }
    }

    #[test]
    fn renders_in_reading_order() {
        let image = RgbImage::new(300, 400);
        let doc = to_markdown(&result(), &image, FigureMode::Inline).unwrap();
        let expected_prefix = "# Title\n\n## Section\n\nBody text.\n\n- item\n\
            |  |  |  |\n| --- | --- | --- |\n| a | b |  |\n| 1 |  |  |\n| 2 | 3 | 4 |\n\n\
            $$E=mc^2$$\n\n![Figure](data:image/png;base64,";
        assert!(doc.markdown.starts_with(expected_prefix), "{}", doc.markdown);
        assert!(doc.images.is_empty());
    }

    #[test]
    fn external_figures_are_returned() {
        let image = RgbImage::new(300, 400);
        let doc = to_markdown(
            &result(),
            &image,
            FigureMode::External {
                dir: "figures/".into(),
            },
        )
        .unwrap();
        assert_eq!(doc.images.len(), 1);
        let (name, bytes) = &doc.images[0];
        assert!(name.starts_with("figure-") && name.ends_with(".png"));
        assert!(doc.markdown.contains(&format!("![Figure](figures/{name})")));
        let decoded = image::load_from_memory(bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 100));
    }

    #[test]
    fn marked_header_row_is_promoted() {
        let rows = vec![
            vec!["name".to_owned(), "qty".to_owned()],
            vec!["bolt".to_owned(), "4".to_owned()],
        ];
        let marked = TableContent {
            table_html: "<table><THEAD><tr><td>name</td><td>qty</td></tr></THEAD></table>".into(),
            table_data: rows.clone(),
        };
        assert_eq!(
            table_markdown(&marked),
            "| name | qty |\n| --- | --- |\n| bolt | 4 |\n\n"
        );

        let plain = TableContent {
            table_html: "<table><tr><td>name</td><td>qty</td></tr></table>".into(),
            table_data: rows,
        };
        assert_eq!(
            table_markdown(&plain),
            "|  |  |\n| --- | --- |\n| name | qty |\n| bolt | 4 |\n\n"
        );
        assert!(has_header_row("<tr><th class=\"h\">x</th></tr>"));
        assert!(!has_header_row("<table><tbody></tbody></table>"));
    }

    #[test]
    fn fallbacks() {
        assert_eq!(table_markdown(&TableContent::default()), "*No table content*\n\n");
        assert_eq!(
            table_markdown(&TableContent {
                table_html: "<table></table>".into(),
                table_data: vec![],
            }),
            "<table></table>\n\n"
        );
        assert_eq!(
            formula_markdown(&FormulaContent {
                formula_latex: String::new(),
                formula_text: "x+1".into()
            }),
            "`x+1`\n\n"
        );
        assert_eq!(formula_markdown(&FormulaContent::default()), "*Formula not available*\n\n");
    }

    #[test]
    fn invalid_figure_region() {
        let mut res = result();
        res.figure_regions[0].region.bbox = BBox::new(500, 500, 600, 600);
        let doc = to_markdown(&res, &RgbImage::new(300, 400), FigureMode::Inline).unwrap();
        assert!(doc.markdown.contains("*Invalid image region*"));
    }

    #[test]
    fn inline_figure_is_valid_png() {
        let doc = to_markdown(&result(), &RgbImage::new(300, 400), FigureMode::Inline).unwrap();
        let start = doc.markdown.find("base64,").unwrap() + "base64,".len();
        let end = doc.markdown[start..].find(')').unwrap() + start;
        let bytes = STANDARD.decode(&doc.markdown[start..end]).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }
}
