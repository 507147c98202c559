//! Boundary pixel records and the face arrays they are exchanged in.

use crate::arrays::Window;
use crate::common::{SPLIT_COLUMN, SPLIT_ROW, SPLIT_SLICE};
use crate::error::{Error, Result};

/// One boundary pixel descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Index {
    /// Position of the pixel in its section's flattened array.
    pub pixel_index: u32,
    /// Resident section that produced the pixel.
    pub pixel_section: u16,
    pub edge_mask: bool,
    /// Edge strength, `-inf` when invalid.
    pub edge_value: f32,
    /// 0 = unlabeled.
    pub region_class_label: u32,
    /// 0 = none.
    pub region_object_label: u32,
    /// Hierarchical level at which the pixel became a boundary pixel, 0 = interior.
    pub boundary_map: u16,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            pixel_index: 0,
            pixel_section: 0,
            edge_mask: false,
            edge_value: f32::NEG_INFINITY,
            region_class_label: 0,
            region_object_label: 0,
            boundary_map: 0,
        }
    }
}

impl Index {
    /// Builds a record, dropping derived state of unlabeled pixels.
    pub fn new(
        pixel_index: u32,
        pixel_section: u16,
        region_class_label: u32,
        region_object_label: u32,
        boundary_map: u16,
    ) -> Self {
        let labeled = region_class_label != 0;
        Self {
            pixel_index,
            pixel_section,
            region_class_label,
            region_object_label: if labeled { region_object_label } else { 0 },
            boundary_map: if labeled { boundary_map } else { 0 },
            ..Self::default()
        }
    }

    pub fn with_edge(mut self, edge_mask: bool, edge_value: f32) -> Self {
        self.edge_mask = edge_mask;
        self.edge_value = edge_value;
        self
    }

    pub fn is_labeled(&self) -> bool {
        self.region_class_label != 0
    }
}

/// Faces of a processing window, in the order they are stored in a [`Border`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Face {
    Column = 0,
    Row = 1,
    Slice = 2,
}

impl Face {
    pub const ALL: [Face; 3] = [Face::Column, Face::Row, Face::Slice];

    pub fn flag(&self) -> u8 {
        match self {
            Face::Column => SPLIT_COLUMN,
            Face::Row => SPLIT_ROW,
            Face::Slice => SPLIT_SLICE,
        }
    }

    pub fn dim(&self) -> usize {
        *self as usize
    }
}

/// Border selection: 1 = column, 2 = row, 4 = slice, additive. Only 1..=7 are valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BorderFlags(u8);

impl BorderFlags {
    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, face: Face) -> bool {
        self.0 & face.flag() != 0
    }

    pub fn faces(&self) -> impl Iterator<Item = Face> + '_ {
        Face::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl TryFrom<u8> for BorderFlags {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1..=7 => Ok(Self(value)),
            _ => Err(Error::protocol(format!("invalid border flag {value}"))),
        }
    }
}

/// Extent of a face array: the window with the face dimension replaced by the seam size.
pub fn face_extent(window: &Window, face: Face, seam_size: usize) -> [usize; 3] {
    let mut extent = [window.ncols, window.nrows, window.nslices];
    extent[face.dim()] = seam_size;
    extent
}

/// Flat position inside a face array; column fastest, then row, then slice.
#[inline(always)]
pub fn face_index(extent: &[usize; 3], coords: [usize; 3]) -> usize {
    debug_assert!(coords[0] < extent[0] && coords[1] < extent[1] && coords[2] < extent[2]);
    coords[0] + extent[0] * (coords[1] + extent[1] * coords[2])
}

/// Window coordinate of a face-array coordinate along the face dimension: the low half maps
/// onto the low edge, the high half onto the high edge.
#[inline(always)]
pub fn face_to_window(coord: usize, extent: usize, seam_size: usize) -> usize {
    if coord < seam_size / 2 {
        coord
    } else {
        coord + extent - seam_size
    }
}

/// The outer `seam_size` pixels of each selected face of a window.
#[derive(Clone, Debug, PartialEq)]
pub struct Border {
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
    pub seam_size: usize,
    pub flags: BorderFlags,
    faces: [Vec<Index>; 3],
}

impl Border {
    pub fn new(window: &Window, flags: BorderFlags, seam_size: usize) -> Self {
        let mut faces: [Vec<Index>; 3] = Default::default();
        for face in flags.faces() {
            let extent = face_extent(window, face, seam_size);
            faces[face.dim()] = vec![Index::default(); extent.iter().product()];
        }
        Self {
            ncols: window.ncols,
            nrows: window.nrows,
            nslices: window.nslices,
            seam_size,
            flags,
            faces,
        }
    }

    pub fn window(&self) -> Window {
        Window::new(self.ncols, self.nrows, self.nslices)
    }

    pub fn extent(&self, face: Face) -> [usize; 3] {
        face_extent(&self.window(), face, self.seam_size)
    }

    pub fn face(&self, face: Face) -> &[Index] {
        &self.faces[face.dim()]
    }

    pub fn face_mut(&mut self, face: Face) -> &mut [Index] {
        &mut self.faces[face.dim()]
    }

    pub fn nb_records(&self) -> usize {
        self.faces.iter().map(|f| f.len()).sum()
    }
}
