use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

pub type PageID = usize;

const FERROCR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Axis-aligned box in original-image pixel space, serialized as `[x0, y0, x1, y1]`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl From<[i32; 4]> for BBox {
    fn from([x0, y0, x1, y1]: [i32; 4]) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x0, b.y0, b.x1, b.y1]
    }
}

impl BBox {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Axis-aligned hull of a set of points, truncated towards zero.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        Some(Self::new(x0 as i32, y0 as i32, x1 as i32, y1 as i32))
    }

    #[inline(always)]
    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    #[inline(always)]
    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }

    #[inline(always)]
    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    #[inline(always)]
    pub fn center(&self) -> (f32, f32) {
        (
            self.x0 as f32 + self.width() as f32 / 2f32,
            self.y0 as f32 + self.height() as f32 / 2f32,
        )
    }

    #[inline(always)]
    pub fn is_degenerate(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    /// Union box, leaves both inputs untouched.
    #[inline(always)]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    #[inline(always)]
    fn overlap_x(&self, other: &Self) -> i64 {
        0.max(self.x1.min(other.x1) - self.x0.max(other.x0)) as i64
    }

    #[inline(always)]
    fn overlap_y(&self, other: &Self) -> i64 {
        0.max(self.y1.min(other.y1) - self.y0.max(other.y0)) as i64
    }

    #[inline(always)]
    pub fn intersection(&self, other: &Self) -> i64 {
        self.overlap_x(other) * self.overlap_y(other)
    }

    #[inline(always)]
    fn union(&self, other: &Self) -> i64 {
        self.area() + other.area() - self.intersection(other)
    }

    #[inline(always)]
    pub fn contains(&self, other: &Self) -> bool {
        other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1
    }

    /// Intersection over the smaller of the two areas.
    /// Zero when either box has a non-positive area.
    #[inline(always)]
    pub fn overlap_ratio(&self, other: &Self) -> f32 {
        let min_area = self.area().min(other.area());
        if self.is_degenerate() || other.is_degenerate() || min_area <= 0 {
            return 0f32;
        }
        self.intersection(other) as f32 / min_area as f32
    }

    #[inline(always)]
    pub fn iou(&self, other: &Self) -> f32 {
        let union = self.union(other);
        if union <= 0 {
            return 0f32;
        }
        self.intersection(other) as f32 / union as f32
    }

    /// Clamps the box into `[0, width] x [0, height]`, `None` if nothing is left.
    pub fn clip(&self, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as i32, height as i32);
        let clipped = Self {
            x0: self.x0.clamp(0, w),
            y0: self.y0.clamp(0, h),
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
        };
        (!clipped.is_degenerate()).then_some(clipped)
    }

    /// Four corners, clockwise from top-left.
    pub fn corners(&self) -> [Point; 4] {
        let (x0, y0, x1, y1) = (self.x0 as f32, self.y0 as f32, self.x1 as f32, self.y1 as f32);
        [
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

pub type Polygon = Vec<Point>;

/// Label attached to a detected region. Labels outside the known set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum RegionType {
    Text,
    Table,
    Formula,
    Figure,
    Image,
    DocTitle,
    ParagraphTitle,
    FigureTitle,
    TableTitle,
    ChartTitle,
    List,
    Header,
    Footer,
    Other(String),
}

/// Where the structure pipeline sends a region for content extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRoute {
    Text,
    Table,
    Formula,
    Figure,
    LayoutOnly,
}

impl RegionType {
    pub fn as_str(&self) -> &str {
        match self {
            RegionType::Text => "text",
            RegionType::Table => "table",
            RegionType::Formula => "formula",
            RegionType::Figure => "figure",
            RegionType::Image => "image",
            RegionType::DocTitle => "doc_title",
            RegionType::ParagraphTitle => "paragraph_title",
            RegionType::FigureTitle => "figure_title",
            RegionType::TableTitle => "table_title",
            RegionType::ChartTitle => "chart_title",
            RegionType::List => "list",
            RegionType::Header => "header",
            RegionType::Footer => "footer",
            RegionType::Other(label) => label,
        }
    }

    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            RegionType::Text
                | RegionType::ParagraphTitle
                | RegionType::FigureTitle
                | RegionType::TableTitle
                | RegionType::DocTitle
                | RegionType::ChartTitle
                | RegionType::List
        )
    }

    pub fn route(&self) -> RegionRoute {
        match self {
            t if t.is_text_like() => RegionRoute::Text,
            RegionType::Table => RegionRoute::Table,
            RegionType::Formula => RegionRoute::Formula,
            RegionType::Figure | RegionType::Image => RegionRoute::Figure,
            _ => RegionRoute::LayoutOnly,
        }
    }
}

impl From<&str> for RegionType {
    fn from(label: &str) -> Self {
        match label {
            "text" => RegionType::Text,
            "table" => RegionType::Table,
            "formula" => RegionType::Formula,
            "figure" => RegionType::Figure,
            "image" => RegionType::Image,
            "doc_title" => RegionType::DocTitle,
            "paragraph_title" => RegionType::ParagraphTitle,
            "figure_title" => RegionType::FigureTitle,
            "table_title" => RegionType::TableTitle,
            "chart_title" => RegionType::ChartTitle,
            "list" => RegionType::List,
            "header" => RegionType::Header,
            "footer" => RegionType::Footer,
            other => RegionType::Other(other.to_owned()),
        }
    }
}

impl From<String> for RegionType {
    fn from(label: String) -> Self {
        RegionType::from(label.as_str())
    }
}

impl From<RegionType> for String {
    fn from(t: RegionType) -> Self {
        t.as_str().to_owned()
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetectedRegion {
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Polygon>,
    #[serde(rename = "type")]
    pub region_type: RegionType,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RecognitionResult {
    pub text: String,
    pub confidence: f32,
}

impl RecognitionResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Quarter-turn orientation of a page, serialized as degrees.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            v => Err(format!("unsupported rotation angle {v}")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(r: Rotation) -> Self {
        r.degrees()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OcrLine {
    #[serde(rename = "box")]
    pub bbox: BBox,
    pub text: String,
    pub text_confidence: f32,
    #[serde(default)]
    pub text_region_confidence: f32,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default = "default_rotation_confidence")]
    pub rotation_confidence: f32,
}

fn default_rotation_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextRegion {
    #[serde(flatten)]
    pub region: DetectedRegion,
    pub text: String,
    pub text_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct TableContent {
    #[serde(default)]
    pub table_html: String,
    #[serde(default)]
    pub table_data: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TableRegion {
    #[serde(flatten)]
    pub region: DetectedRegion,
    #[serde(flatten)]
    pub content: TableContent,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct FormulaContent {
    #[serde(default)]
    pub formula_latex: String,
    #[serde(default)]
    pub formula_text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FormulaRegion {
    #[serde(flatten)]
    pub region: DetectedRegion,
    #[serde(flatten)]
    pub content: FormulaContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FigureRegion {
    #[serde(flatten)]
    pub region: DetectedRegion,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessingMetadata {
    #[serde(with = "serde_millis")]
    pub processing_duration: Duration,
    pub ferrocr_version: String,
}

impl ProcessingMetadata {
    pub fn new(processing_duration: Duration) -> Self {
        Self {
            processing_duration,
            ferrocr_version: FERROCR_VERSION.to_owned(),
        }
    }
}

impl Default for ProcessingMetadata {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructureResult {
    /// `[height, width, channels]`
    pub image_shape: [u32; 3],
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default = "default_rotation_confidence")]
    pub rotation_confidence: f32,
    #[serde(default)]
    pub layout_regions: Vec<DetectedRegion>,
    #[serde(default)]
    pub text_regions: Vec<TextRegion>,
    #[serde(default)]
    pub table_regions: Vec<TableRegion>,
    #[serde(default)]
    pub formula_regions: Vec<FormulaRegion>,
    #[serde(default)]
    pub figure_regions: Vec<FigureRegion>,
    #[serde(default)]
    pub metadata: ProcessingMetadata,
}

/// One page of a multi-page document, numbered from 1.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PageResult<T> {
    pub page: usize,
    pub result: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OcrPage {
    pub page: usize,
    pub results: Vec<OcrLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection() {
        let bbox1 = BBox::new(0, 0, 2, 2);
        let bbox2 = BBox::new(1, 1, 3, 3);
        let bbox3 = BBox::new(2, 2, 4, 4);
        let bbox4 = BBox::new(3, 3, 5, 5); // No overlap
        let bbox5 = BBox::new(-1, -1, 1, 1); // Negative coordinates

        // Edge Cases
        assert_eq!(bbox1.intersection(&bbox3), 0);
        assert_eq!(bbox1.intersection(&bbox4), 0);
        assert_eq!(bbox5.intersection(&bbox1), 1);

        // Overlaps
        assert_eq!(bbox1.intersection(&bbox2), 1);

        // Sanity Checks
        assert_eq!(bbox1.intersection(&bbox1), bbox1.area());
    }

    #[test]
    fn test_iou() {
        let bbox1 = BBox::new(0, 0, 2, 2);
        let bbox2 = BBox::new(1, 1, 3, 3);
        let bbox4 = BBox::new(3, 3, 5, 5);

        assert_eq!(bbox1.iou(&bbox1), 1.0);
        assert_eq!(bbox1.iou(&bbox4), 0.0);
        assert_eq!(bbox1.iou(&bbox2), 1.0 / 7.0);
    }

    #[test]
    fn test_overlap_ratio() {
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(5, 0, 25, 10);
        let inside = BBox::new(2, 2, 4, 4);
        let far = BBox::new(100, 100, 110, 110);
        let flat = BBox::new(0, 0, 10, 0);

        assert_eq!(a.overlap_ratio(&a), 1.0);
        assert_eq!(a.overlap_ratio(&b), b.overlap_ratio(&a));
        assert_eq!(a.overlap_ratio(&b), 0.5);
        assert_eq!(a.overlap_ratio(&inside), 1.0);
        assert_eq!(a.overlap_ratio(&far), 0.0);
        assert_eq!(a.overlap_ratio(&flat), 0.0);
    }

    #[test]
    fn test_merge_contains_both() {
        let a = BBox::new(0, 5, 10, 10);
        let b = BBox::new(8, 0, 20, 7);
        let merged = a.merge(&b);

        assert_eq!(merged, BBox::new(0, 0, 20, 10));
        assert!(merged.contains(&a));
        assert!(merged.contains(&b));
    }

    #[test]
    fn test_clip() {
        let b = BBox::new(-5, -5, 50, 20);
        assert_eq!(b.clip(30, 30), Some(BBox::new(0, 0, 30, 20)));
        assert_eq!(BBox::new(40, 40, 50, 50).clip(30, 30), None);
    }

    #[test]
    fn test_bbox_serializes_as_array() {
        let b = BBox::new(1, 2, 3, 4);
        assert_eq!(serde_json::to_string(&b).unwrap(), "[1,2,3,4]");
        let parsed: BBox = serde_json::from_str("[5,6,7,8]").unwrap();
        assert_eq!(parsed, BBox::new(5, 6, 7, 8));
    }

    #[test]
    fn test_region_type_keeps_unknown_labels() {
        let t: RegionType = serde_json::from_str("\"seal\"").unwrap();
        assert_eq!(t, RegionType::Other("seal".into()));
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"seal\"");
        assert_eq!(RegionType::from("doc_title"), RegionType::DocTitle);
        assert_eq!(RegionType::from("image").route(), RegionRoute::Figure);
        assert_eq!(RegionType::from("header").route(), RegionRoute::LayoutOnly);
        assert_eq!(RegionType::List.route(), RegionRoute::Text);
    }

    #[test]
    fn test_ocr_line_json_shape() {
        let line = OcrLine {
            bbox: BBox::new(0, 0, 10, 5),
            text: "hi".into(),
            text_confidence: 0.5,
            text_region_confidence: 0.75,
            rotation: Rotation::Deg180,
            rotation_confidence: 0.25,
        };
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v["box"], serde_json::json!([0, 0, 10, 5]));
        assert_eq!(v["rotation"], serde_json::json!(180));
        assert!(serde_json::from_str::<Rotation>("45").is_err());
    }

    #[test]
    fn test_text_region_flattens_region() {
        let region = TextRegion {
            region: DetectedRegion {
                bbox: BBox::new(0, 0, 4, 4),
                polygon: None,
                region_type: RegionType::DocTitle,
                confidence: 0.5,
            },
            text: "Title".into(),
            text_confidence: 0.75,
        };
        let v = serde_json::to_value(&region).unwrap();
        assert_eq!(v["type"], "doc_title");
        assert_eq!(v["text"], "Title");
        let back: TextRegion = serde_json::from_value(v).unwrap();
        assert_eq!(back, region);
    }
}
