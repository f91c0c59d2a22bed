use anyhow::Context;

use crate::{
    entities::{BBox, FigureRegion, FormulaRegion, StructureResult, TableRegion, TextRegion},
    geometry::sort_reading_order_by,
};

pub mod markdown;

pub use markdown::{to_markdown, FigureMode, MarkdownDocument, MarkdownRender};

/// A content region of a [`StructureResult`], borrowed for rendering.
#[derive(Debug, Clone, Copy)]
pub enum RegionItem<'a> {
    Text(&'a TextRegion),
    Table(&'a TableRegion),
    Formula(&'a FormulaRegion),
    Figure(&'a FigureRegion),
}

impl RegionItem<'_> {
    pub fn bbox(&self) -> BBox {
        match self {
            RegionItem::Text(r) => r.region.bbox,
            RegionItem::Table(r) => r.region.bbox,
            RegionItem::Formula(r) => r.region.bbox,
            RegionItem::Figure(r) => r.region.bbox,
        }
    }
}

/// Every content region in reading order.
pub fn reading_order(result: &StructureResult) -> Vec<RegionItem<'_>> {
    let mut items: Vec<RegionItem<'_>> = result
        .text_regions
        .iter()
        .map(RegionItem::Text)
        .chain(result.table_regions.iter().map(RegionItem::Table))
        .chain(result.formula_regions.iter().map(RegionItem::Formula))
        .chain(result.figure_regions.iter().map(RegionItem::Figure))
        .collect();
    sort_reading_order_by(&mut items, RegionItem::bbox);
    items
}

pub trait Render {
    type Output;
    fn render<R: Renderer>(&self, renderer: &mut R) -> anyhow::Result<Self::Output>;
}

pub trait Renderer {
    type Ok;

    fn render_region(&mut self, region: &RegionItem<'_>) -> anyhow::Result<Self::Ok>;
}

impl Render for &StructureResult {
    type Output = ();

    fn render<R: Renderer>(&self, renderer: &mut R) -> anyhow::Result<()> {
        for region in reading_order(self) {
            renderer
                .render_region(&region)
                .with_context(|| format!("can't render region {:?}", region.bbox()))?;
        }
        Ok(())
    }
}
