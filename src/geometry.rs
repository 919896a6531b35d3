//! Extraction regions and the geometry rules they obey.
//!
//! Regions live in page-pixel coordinates at whatever scale the page was
//! rendered. They know nothing about pages, so the same region can be
//! applied to every page of every document.

use std::{error, fmt};

use schemars::JsonSchema;
use uuid::Uuid;

use crate::prelude::*;

/// Regions must be strictly larger than this in both dimensions.
///
/// Anything smaller is almost certainly a stray click rather than a field.
pub const MIN_REGION_EXTENT: f64 = 10.0;

/// The outline of a region.
///
/// Both shapes are stored and cropped as their bounding box. The shape only
/// matters when drawing an outline.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    Rectangle,
    Ellipse,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Rectangle => write!(f, "rectangle"),
            Shape::Ellipse => write!(f, "ellipse"),
        }
    }
}

/// A named, page-independent area to extract text from.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    /// Stable, unique identifier.
    id: Uuid,

    /// The outline of the region.
    shape: Shape,

    /// Left edge, in page pixels.
    x: f64,

    /// Top edge, in page pixels.
    y: f64,

    /// Width, in page pixels. Always greater than [`MIN_REGION_EXTENT`].
    width: f64,

    /// Height, in page pixels. Always greater than [`MIN_REGION_EXTENT`].
    height: f64,

    /// Human-readable label, used as the field name in results.
    field_name: String,
}

/// Build a region from two opposite corners, in any order.
///
/// This is the only way to create a [`Region`], and it enforces the minimum
/// size.
pub fn create_region(
    shape: Shape,
    (x0, y0): (f64, f64),
    (x1, y1): (f64, f64),
    field_name: impl Into<String>,
) -> Result<Region, RegionRejected> {
    Region::from_parts(
        Uuid::new_v4(),
        shape,
        x0.min(x1),
        y0.min(y1),
        (x1 - x0).abs(),
        (y1 - y0).abs(),
        field_name.into(),
    )
}

impl Region {
    /// Validate and assemble a region from its canonical representation.
    pub(crate) fn from_parts(
        id: Uuid,
        shape: Shape,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        field_name: String,
    ) -> Result<Self, RegionRejected> {
        let finite = [x, y, width, height].iter().all(|v| v.is_finite());
        if !finite || width <= MIN_REGION_EXTENT || height <= MIN_REGION_EXTENT {
            return Err(RegionRejected { width, height });
        }
        Ok(Self {
            id,
            shape,
            x,
            y,
            width,
            height,
            field_name,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Replace a blank field name with a positional placeholder.
    pub(crate) fn with_default_field_name(mut self, position: usize) -> Self {
        if self.field_name.trim().is_empty() {
            self.field_name = field_placeholder(position);
        }
        self
    }

    /// The geometric center of the region.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Horizontal and vertical radii, for drawing an [`Shape::Ellipse`].
    pub fn radii(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }

    /// The pixel rectangle `(x, y, width, height)` to crop from a page of the
    /// given size, clamped to the page.
    ///
    /// Returns `None` if the region lies entirely outside the page.
    pub fn crop_bounds(&self, page_width: u32, page_height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = self.x.floor().max(0.0);
        let top = self.y.floor().max(0.0);
        let right = (self.x + self.width).ceil().min(f64::from(page_width));
        let bottom = (self.y + self.height).ceil().min(f64::from(page_height));
        if right <= left || bottom <= top {
            return None;
        }
        // All four values are now within `0..=u32::MAX`.
        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }

    /// Attach a page number, producing the copy stored in each result.
    pub fn on_page(&self, page_number: u32) -> PageRegion {
        PageRegion {
            region: self.clone(),
            page_number,
        }
    }
}

/// The placeholder name for the region at 1-based `position`.
pub fn field_placeholder(position: usize) -> String {
    format!("Field {position}")
}

/// A [`Region`] applied to a specific page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRegion {
    #[serde(flatten)]
    pub region: Region,

    /// 1-based page number within the source document.
    pub page_number: u32,
}

/// A box which failed the minimum size check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionRejected {
    pub width: f64,
    pub height: f64,
}

impl fmt::Display for RegionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region {}x{} is too small (both sides must be larger than {})",
            self.width, self.height, MIN_REGION_EXTENT
        )
    }
}

impl error::Error for RegionRejected {}

/// An in-progress drag, from pointer-down to pointer-up.
///
/// Sessions are throwaway values: nothing about them is stored once the
/// region is committed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawSession {
    shape: Shape,
    start: (f64, f64),
    current: (f64, f64),
}

/// Start drawing a region at the given point.
pub fn begin_draw(shape: Shape, x: f64, y: f64) -> DrawSession {
    DrawSession {
        shape,
        start: (x, y),
        current: (x, y),
    }
}

impl DrawSession {
    /// Move the free corner of the box.
    pub fn update_draw(&mut self, x: f64, y: f64) {
        self.current = (x, y);
    }

    /// Finish drawing, producing a region if the box is big enough.
    pub fn commit_draw(self, field_name: impl Into<String>) -> Result<Region, RegionRejected> {
        create_region(self.shape, self.start, self.current, field_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_corners_in_any_order() {
        let region = create_region(Shape::Rectangle, (110.0, 50.0), (10.0, 10.0), "Tag")
            .unwrap();
        assert_eq!(
            (region.x(), region.y(), region.width(), region.height()),
            (10.0, 10.0, 100.0, 40.0)
        );
        assert_eq!(region.field_name(), "Tag");
    }

    #[test]
    fn rejects_boxes_at_or_below_threshold() {
        for (w, h) in [(10.0, 50.0), (50.0, 10.0), (0.0, 0.0), (5.0, 100.0)] {
            let result = create_region(Shape::Rectangle, (0.0, 0.0), (w, h), "x");
            assert_eq!(result, Err(RegionRejected { width: w, height: h }));
        }
    }

    #[test]
    fn accepts_boxes_just_above_threshold() {
        assert!(create_region(Shape::Ellipse, (0.0, 0.0), (10.5, 10.5), "x").is_ok());
        assert!(create_region(Shape::Rectangle, (5.0, 5.0), (16.0, 16.0), "x").is_ok());
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let result = create_region(Shape::Rectangle, (f64::NAN, 0.0), (100.0, 100.0), "x");
        assert!(result.is_err());
    }

    #[test]
    fn ellipse_center_and_radii() {
        let region = create_region(Shape::Ellipse, (20.0, 40.0), (120.0, 100.0), "e").unwrap();
        assert_eq!(region.center(), (70.0, 70.0));
        assert_eq!(region.radii(), (50.0, 30.0));
    }

    #[test]
    fn crop_bounds_are_clamped_to_page() {
        let region =
            create_region(Shape::Rectangle, (-5.5, 90.2), (40.0, 130.0), "edge").unwrap();
        assert_eq!(region.crop_bounds(100, 120), Some((0, 90, 40, 30)));

        let outside =
            create_region(Shape::Rectangle, (200.0, 200.0), (260.0, 260.0), "gone").unwrap();
        assert_eq!(outside.crop_bounds(100, 120), None);
    }

    #[test]
    fn draw_session_commits_latest_corner() {
        let mut session = begin_draw(Shape::Rectangle, 10.0, 10.0);
        session.update_draw(12.0, 12.0);
        session.update_draw(60.0, 45.0);
        let region = session.commit_draw("Drawn").unwrap();
        assert_eq!((region.width(), region.height()), (50.0, 35.0));
    }

    #[test]
    fn draw_session_rejects_accidental_click() {
        let session = begin_draw(Shape::Ellipse, 30.0, 30.0);
        assert!(session.commit_draw("Click").is_err());
    }

    #[test]
    fn placeholder_only_replaces_blank_names() {
        let blank = create_region(Shape::Rectangle, (0.0, 0.0), (20.0, 20.0), "  ").unwrap();
        assert_eq!(blank.with_default_field_name(3).field_name(), "Field 3");
        let named = create_region(Shape::Rectangle, (0.0, 0.0), (20.0, 20.0), "Tag").unwrap();
        assert_eq!(named.with_default_field_name(3).field_name(), "Tag");
    }
}
