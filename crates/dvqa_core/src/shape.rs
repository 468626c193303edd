//! Image geometry: patch grids and detected regions.
//!
//! Patch-based models tokenise the image into a regular grid; every image
//! position of the embedding sequence maps to one `(row, col)` cell. Region
//! based models instead receive one token per detected box.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Size of a model's patch grid.
///
/// # Example
///
/// ```rust
/// use dvqa_core::PatchGrid;
///
/// let grid = PatchGrid::new(12, 16);
/// assert_eq!(grid.cells(), 192);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchGrid {
    rows: usize,
    cols: usize,
}

impl PatchGrid {
    /// Create a grid with `rows` x `cols` cells.
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of rows (patch height count).
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (patch width count).
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of cells.
    #[must_use]
    pub const fn cells(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the grid has no cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Whether `(row, col)` lies inside the grid.
    #[must_use]
    pub const fn contains(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols
    }
}

impl std::fmt::Display for PatchGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Mapping from image-patch sequence positions to grid cells.
///
/// `positions[i]` is the cell of the `i`-th image patch, *excluding* the
/// image aggregate token that precedes the patches in the embedding sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchIndex {
    grid: PatchGrid,
    positions: Vec<(usize, usize)>,
}

impl PatchIndex {
    /// Create a patch index, validating every position against the grid.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidShape`] if a position falls outside the grid.
    pub fn new(grid: PatchGrid, positions: Vec<(usize, usize)>) -> Result<Self> {
        if let Some(&(row, col)) = positions.iter().find(|&&(r, c)| !grid.contains(r, c)) {
            return Err(CoreError::InvalidShape {
                expected: format!("cell inside {grid} grid"),
                got: format!("({row}, {col})"),
            });
        }
        Ok(Self { grid, positions })
    }

    /// Row-major index covering every cell of the grid once.
    #[must_use]
    pub fn dense(grid: PatchGrid) -> Self {
        let positions = (0..grid.rows())
            .flat_map(|r| (0..grid.cols()).map(move |c| (r, c)))
            .collect();
        Self { grid, positions }
    }

    /// The grid geometry.
    #[must_use]
    pub const fn grid(&self) -> PatchGrid {
        self.grid
    }

    /// Cell of every patch, in sequence order.
    #[must_use]
    pub fn positions(&self) -> &[(usize, usize)] {
        &self.positions
    }

    /// Number of indexed patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether no patches are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Axis-aligned pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x0: f32,
    /// Top edge.
    pub y0: f32,
    /// Right edge (exclusive).
    pub x1: f32,
    /// Bottom edge (exclusive).
    pub y1: f32,
}

impl BoundingBox {
    /// Create a box from its corners.
    #[must_use]
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Integer pixel span `(x0, y0, x1, y1)` clipped to a `width` x `height` image.
    ///
    /// Coordinates are truncated toward zero; an inverted or fully outside
    /// box yields an empty span (`x0 == x1` or `y0 == y1`).
    #[must_use]
    pub fn clamp_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clip = |v: f32, max: u32| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v as u32).min(max)
            }
        };
        let x0 = clip(self.x0, width);
        let y0 = clip(self.y0, height);
        let x1 = clip(self.x1, width).max(x0);
        let y1 = clip(self.y1, height).max(y0);
        (x0, y0, x1, y1)
    }

    /// Box normalised by image size, as region-based models consume it.
    #[must_use]
    pub fn normalized(&self, width: u32, height: u32) -> [f32; 4] {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        [self.x0 / w, self.y0 / h, self.x1 / w, self.y1 / h]
    }
}

/// A detector label with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLabel {
    /// Vocabulary id.
    pub id: usize,
    /// Human-readable name.
    pub name: String,
    /// Detector confidence.
    pub score: f32,
}

/// One detected image region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Pixel rectangle.
    pub bbox: BoundingBox,
    /// Most likely object class.
    pub object: DetectedLabel,
    /// Most likely attribute.
    pub attribute: DetectedLabel,
}

/// Output of an object detector for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    /// Detected regions, in token order.
    pub regions: Vec<Region>,
    /// Pooled region features, one row per region.
    pub features: Vec<Vec<f32>>,
    /// Region boxes normalised to `[0, 1]`.
    pub normalized_boxes: Vec<[f32; 4]>,
}

impl Detections {
    /// Bundle detector output, checking that per-region arrays agree.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if features or normalised boxes do
    /// not have one entry per region.
    pub fn new(
        regions: Vec<Region>,
        features: Vec<Vec<f32>>,
        normalized_boxes: Vec<[f32; 4]>,
    ) -> Result<Self> {
        if features.len() != regions.len() || normalized_boxes.len() != regions.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "{} regions, {} feature rows, {} normalized boxes",
                regions.len(),
                features.len(),
                normalized_boxes.len()
            )));
        }
        Ok(Self {
            regions,
            features,
            normalized_boxes,
        })
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the detector found nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Pixel boxes in token order.
    #[must_use]
    pub fn boxes(&self) -> Vec<BoundingBox> {
        self.regions.iter().map(|r| r.bbox).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(id: usize) -> DetectedLabel {
        DetectedLabel {
            id,
            name: format!("obj{id}"),
            score: 0.5,
        }
    }

    #[test]
    fn test_patch_index_rejects_outside_cells() {
        let grid = PatchGrid::new(2, 3);
        assert!(PatchIndex::new(grid, vec![(0, 0), (1, 2)]).is_ok());
        assert!(PatchIndex::new(grid, vec![(2, 0)]).is_err());
        assert!(PatchIndex::new(grid, vec![(0, 3)]).is_err());
    }

    #[test]
    fn test_dense_index_is_row_major() {
        let index = PatchIndex::dense(PatchGrid::new(2, 2));
        assert_eq!(index.positions(), &[(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_box_clamp() {
        let b = BoundingBox::new(-5.0, 2.5, 300.0, 10.0);
        assert_eq!(b.clamp_to(100, 50), (0, 2, 100, 10));

        let inverted = BoundingBox::new(40.0, 40.0, 10.0, 10.0);
        let (x0, y0, x1, y1) = inverted.clamp_to(100, 100);
        assert_eq!(x0, x1);
        assert_eq!(y0, y1);
    }

    #[test]
    fn test_detections_length_check() {
        let region = Region {
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            object: label(1),
            attribute: label(2),
        };
        assert!(Detections::new(vec![region.clone()], vec![vec![0.0; 4]], vec![[0.0; 4]]).is_ok());
        assert!(Detections::new(vec![region], vec![], vec![[0.0; 4]]).is_err());
        assert!(Detections::default().is_empty());
    }

    #[test]
    fn test_grid_serialization() {
        let grid = PatchGrid::new(7, 9);
        let json = serde_json::to_string(&grid).unwrap();
        let restored: PatchGrid = serde_json::from_str(&json).unwrap();
        assert_eq!(grid, restored);
    }
}
