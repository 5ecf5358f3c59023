//! Flat arena memory: segment tables, mirrored buffers and their manager.
//!
//! Every layer's data lives in one of a handful of large `f32` buffers. A
//! "matrix" is a shaped sub-range (segment) of such a buffer, described by an
//! entry in a [`SegmentTable`]; there is no per-matrix allocation.

mod manager;
mod mirrored_buffer;

pub use manager::{ArenaLimits, MemoryArenaManager};
pub use mirrored_buffer::{MirroredBuffer, SyncState};

use std::fmt;
use std::ops::Range;

/// The arenas owned by a [`MemoryArenaManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    Nodes,
    Weights,
    Biases,
    NodeGradients,
    WeightGradients,
    BiasGradients,
    /// Per-pass kernel state: arg-max records, dropout masks, staged example, loss counters.
    Scratch,
}

impl ArenaKind {
    pub const ALL: [ArenaKind; 7] = [
        ArenaKind::Nodes,
        ArenaKind::Weights,
        ArenaKind::Biases,
        ArenaKind::NodeGradients,
        ArenaKind::WeightGradients,
        ArenaKind::BiasGradients,
        ArenaKind::Scratch,
    ];

    pub const GRADIENTS: [ArenaKind; 3] = [
        ArenaKind::NodeGradients,
        ArenaKind::WeightGradients,
        ArenaKind::BiasGradients,
    ];

    /// Position of the arena in [`ArenaKind::ALL`], also its GPU binding slot.
    pub fn slot(self) -> usize {
        match self {
            ArenaKind::Nodes => 0,
            ArenaKind::Weights => 1,
            ArenaKind::Biases => 2,
            ArenaKind::NodeGradients => 3,
            ArenaKind::WeightGradients => 4,
            ArenaKind::BiasGradients => 5,
            ArenaKind::Scratch => 6,
        }
    }

    /// The value arena whose segment table this arena shares.
    pub fn layout_source(self) -> ArenaKind {
        match self {
            ArenaKind::NodeGradients => ArenaKind::Nodes,
            ArenaKind::WeightGradients => ArenaKind::Weights,
            ArenaKind::BiasGradients => ArenaKind::Biases,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArenaKind::Nodes => "nodes",
            ArenaKind::Weights => "weights",
            ArenaKind::Biases => "biases",
            ArenaKind::NodeGradients => "node gradients",
            ArenaKind::WeightGradients => "weight gradients",
            ArenaKind::BiasGradients => "bias gradients",
            ArenaKind::Scratch => "scratch",
        }
    }
}

impl fmt::Display for ArenaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-segment offsets and shapes of one arena.
///
/// Shapes are stored as `rows` (x) and `cols` (y); segment data is column-major,
/// so element `(x, y)` of a segment sits at `offset + y * rows + x`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTable {
    offsets: Vec<usize>,
    rows: Vec<usize>,
    cols: Vec<usize>,
    total_len: usize,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `rows x cols` segment and returns its index.
    pub fn push(&mut self, rows: usize, cols: usize) -> usize {
        self.offsets.push(self.total_len);
        self.rows.push(rows);
        self.cols.push(cols);
        self.total_len += rows * cols;
        self.offsets.len() - 1
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total number of elements covered by all segments.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn offset(&self, segment: usize) -> usize {
        self.offsets[segment]
    }

    pub fn rows(&self, segment: usize) -> usize {
        self.rows[segment]
    }

    pub fn cols(&self, segment: usize) -> usize {
        self.cols[segment]
    }

    pub fn segment_len(&self, segment: usize) -> usize {
        self.rows[segment] * self.cols[segment]
    }

    pub fn segment_range(&self, segment: usize) -> Range<usize> {
        let start = self.offsets[segment];
        start..start + self.segment_len(segment)
    }
}

/// A layer's contiguous region inside one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    /// First element of the region.
    pub offset: usize,
    /// Number of elements; zero for kinds without data in this arena.
    pub len: usize,
    /// Index of the first segment in the arena's [`SegmentTable`].
    pub first_segment: usize,
    pub segment_count: usize,
}

impl Placement {
    /// An empty region sitting at the current end of `table`.
    pub fn empty_at(table: &SegmentTable) -> Self {
        Self {
            offset: table.total_len(),
            len: 0,
            first_segment: table.len(),
            segment_count: 0,
        }
    }

    /// Appends `count` segments of `rows x cols` to `table` and returns their placement.
    pub fn push_segments(table: &mut SegmentTable, count: usize, rows: usize, cols: usize) -> Self {
        let mut placement = Self::empty_at(table);
        for _ in 0..count {
            table.push(rows, cols);
        }
        placement.segment_count = count;
        placement.len = table.total_len() - placement.offset;
        placement
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// What a kernel may touch of one layer's segment(s) in one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaView {
    pub arena: ArenaKind,
    pub offset: usize,
    pub len: usize,
    /// Rows of each segment; zero for an empty view.
    pub x_shape: usize,
    /// Columns of each segment; zero for an empty view.
    pub y_shape: usize,
    pub segments: usize,
}

impl ArenaView {
    pub fn new(arena: ArenaKind, placement: &Placement, table: &SegmentTable) -> Self {
        let (x_shape, y_shape) = if placement.segment_count > 0 {
            (
                table.rows(placement.first_segment),
                table.cols(placement.first_segment),
            )
        } else {
            (0, 0)
        };
        Self {
            arena,
            offset: placement.offset,
            len: placement.len,
            x_shape,
            y_shape,
            segments: placement.segment_count,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_table_offsets_are_running_totals() {
        let mut table = SegmentTable::new();
        assert_eq!(table.push(4, 4), 0);
        assert_eq!(table.push(2, 3), 1);
        assert_eq!(table.offset(0), 0);
        assert_eq!(table.offset(1), 16);
        assert_eq!(table.total_len(), 22);
        assert_eq!(table.segment_range(1), 16..22);
    }

    #[test]
    fn test_empty_placement_keeps_a_valid_offset() {
        let mut table = SegmentTable::new();
        Placement::push_segments(&mut table, 2, 3, 3);
        let empty = Placement::empty_at(&table);
        assert_eq!(empty.offset, 18);
        assert_eq!(empty.len, 0);
        assert_eq!(empty.first_segment, 2);
        assert!(empty.range().is_empty());
    }

    #[test]
    fn test_view_reports_segment_shape() {
        let mut table = SegmentTable::new();
        table.push(1, 1);
        let placement = Placement::push_segments(&mut table, 6, 24, 24);
        let view = ArenaView::new(ArenaKind::Nodes, &placement, &table);
        assert_eq!(view.offset, 1);
        assert_eq!(view.len, 6 * 24 * 24);
        assert_eq!((view.x_shape, view.y_shape, view.segments), (24, 24, 6));
    }

    #[test]
    fn test_gradient_arenas_share_value_layout() {
        assert_eq!(ArenaKind::WeightGradients.layout_source(), ArenaKind::Weights);
        assert_eq!(ArenaKind::Scratch.layout_source(), ArenaKind::Scratch);
        for (i, kind) in ArenaKind::ALL.iter().enumerate() {
            assert_eq!(kind.slot(), i);
        }
    }
}
