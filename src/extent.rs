use derive_more::Display;

/// Chunk grid coordinate in TCZYX order.
pub type ChunkCoord = [usize; 5];

pub const T: usize = 0;
pub const C: usize = 1;
pub const Z: usize = 2;
pub const Y: usize = 3;
pub const X: usize = 4;

/// Inclusive range along one axis. `min > max` is representable and marks the range as invalid.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("[{min}, {max}]")]
pub struct AxisRange {
    pub min: usize,
    pub max: usize,
}
impl AxisRange {
    pub fn new(min: usize, max: usize) -> Self { AxisRange { min, max } }
    /// Range covering `0..len`
    pub fn full(len: usize) -> Self {
        AxisRange {
            min: 0,
            max: len.saturating_sub(1),
        }
    }
    pub fn is_valid(&self) -> bool { self.min <= self.max }
    pub fn len(&self) -> usize {
        if self.is_valid() {
            self.max - self.min + 1
        } else {
            0
        }
    }
}

/// Rectangular sub-region of a voxel (or chunk) grid.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("x{x} y{y} z{z}")]
pub struct Extent {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
}
impl Extent {
    pub fn new(x: AxisRange, y: AxisRange, z: AxisRange) -> Self { Extent { x, y, z } }

    /// Extent covering a whole grid of the given `[x, y, z]` dimensions
    pub fn full(dims: [usize; 3]) -> Self {
        Extent {
            x: AxisRange::full(dims[0]),
            y: AxisRange::full(dims[1]),
            z: AxisRange::full(dims[2]),
        }
    }

    pub fn is_valid(&self) -> bool { self.x.is_valid() && self.y.is_valid() && self.z.is_valid() }

    /// Number of voxels covered, 0 for invalid extents
    pub fn volume(&self) -> usize { self.x.len() * self.y.len() * self.z.len() }

    pub fn fits_within(&self, dims: [usize; 3]) -> bool {
        self.x.max < dims[0] && self.y.max < dims[1] && self.z.max < dims[2]
    }
}
