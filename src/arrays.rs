use crate::error::{Error, Result};
use aligned_vec::{AVec, ConstAlign};
use std::ops::{Index, IndexMut};

pub const ALIGN: usize = 64;

pub type AlignedVec<T> = AVec<T, ConstAlign<ALIGN>>;

pub(crate) fn avec_from_fill<T: Copy>(value: T, len: usize) -> AlignedVec<T> {
    AVec::from_iter(ALIGN, (0..len).map(|_| value))
}

/// Placement of a processing window inside the whole image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub col: usize,
    pub row: usize,
    pub slice: usize,
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
}

impl Window {
    pub fn new(ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            col: 0,
            row: 0,
            slice: 0,
            ncols,
            nrows,
            nslices,
        }
    }

    pub fn nb_pixels(&self) -> usize {
        self.ncols * self.nrows * self.nslices
    }

    /// Flat index inside the window, column fastest.
    #[inline(always)]
    pub fn get_index(&self, col: usize, row: usize, slice: usize) -> usize {
        debug_assert!(col < self.ncols, "column {col} out of {}", self.ncols);
        debug_assert!(row < self.nrows, "row {row} out of {}", self.nrows);
        debug_assert!(slice < self.nslices, "slice {slice} out of {}", self.nslices);
        col + self.ncols * (row + self.nrows * slice)
    }

    pub fn get_coords(&self, index: usize) -> (usize, usize, usize) {
        debug_assert!(index < self.nb_pixels());
        let col = index % self.ncols;
        let row = (index / self.ncols) % self.nrows;
        let slice = index / (self.ncols * self.nrows);
        (col, row, slice)
    }

    /// Extent along the dimension selected by a single split flag.
    pub fn extent(&self, dim: usize) -> usize {
        match dim {
            0 => self.ncols,
            1 => self.nrows,
            _ => self.nslices,
        }
    }
}

/// Dense 3D array stored column fastest, then row, then slice.
#[derive(Debug, Clone)]
pub struct Array3D<T> {
    pub data: AlignedVec<T>,
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
}

impl<T: Copy> Array3D<T> {
    pub fn from_fill(value: T, ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            data: avec_from_fill(value, ncols * nrows * nslices),
            ncols,
            nrows,
            nslices,
        }
    }

    pub fn from_slice(data: &[T], ncols: usize, nrows: usize, nslices: usize) -> Result<Self> {
        if data.len() != ncols * nrows * nslices {
            return Err(Error::DimensionMismatch(format!(
                "{} elements for a {ncols}x{nrows}x{nslices} array",
                data.len()
            )));
        }
        Ok(Self {
            data: AVec::from_slice(ALIGN, data),
            ncols,
            nrows,
            nslices,
        })
    }

    pub fn window(&self) -> Window {
        Window::new(self.ncols, self.nrows, self.nslices)
    }

    #[inline(always)]
    pub fn get_index(&self, col: usize, row: usize, slice: usize) -> usize {
        debug_assert!(col < self.ncols && row < self.nrows && slice < self.nslices);
        col + self.ncols * (row + self.nrows * slice)
    }

    pub fn get_row(&self, row: usize, slice: usize) -> &[T] {
        let start = self.get_index(0, row, slice);
        &self.data[start..start + self.ncols]
    }

    /// Copies the part of this array covered by `window` (window offsets are relative to this
    /// array).
    pub fn extract_window(&self, window: &Window) -> Self {
        let mut out = Vec::with_capacity(window.nb_pixels());
        for slice in window.slice..window.slice + window.nslices {
            for row in window.row..window.row + window.nrows {
                let start = self.get_index(window.col, row, slice);
                out.extend_from_slice(&self.data[start..start + window.ncols]);
            }
        }
        Self {
            data: AVec::from_slice(ALIGN, &out),
            ncols: window.ncols,
            nrows: window.nrows,
            nslices: window.nslices,
        }
    }

    /// Writes `part` back into the region covered by `window`.
    pub fn insert_window(&mut self, window: &Window, part: &Self) {
        assert_eq!(part.data.len(), window.nb_pixels());
        for slice in 0..window.nslices {
            for row in 0..window.nrows {
                let start = self.get_index(window.col, window.row + row, window.slice + slice);
                self.data[start..start + window.ncols]
                    .copy_from_slice(part.get_row(row, slice));
            }
        }
    }
}

impl<T: Copy> Index<(usize, usize, usize)> for Array3D<T> {
    type Output = T;
    fn index(&self, (col, row, slice): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.get_index(col, row, slice)]
    }
}

impl<T: Copy> IndexMut<(usize, usize, usize)> for Array3D<T> {
    fn index_mut(&mut self, (col, row, slice): (usize, usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(col, row, slice);
        &mut self.data[idx]
    }
}

impl<T: Copy + PartialEq> PartialEq for Array3D<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ncols == other.ncols
            && self.nrows == other.nrows
            && self.nslices == other.nslices
            && self.data[..] == other.data[..]
    }
}

/// Per-pixel labeled state of a section: region class, region object and the hierarchical
/// level at which a pixel became a boundary pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialMaps {
    pub region_class_label_map: Array3D<u32>,
    pub region_object_label_map: Array3D<u32>,
    pub boundary_map: Array3D<u16>,
}

impl SpatialMaps {
    pub fn new(ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            region_class_label_map: Array3D::from_fill(0, ncols, nrows, nslices),
            region_object_label_map: Array3D::from_fill(0, ncols, nrows, nslices),
            boundary_map: Array3D::from_fill(0, ncols, nrows, nslices),
        }
    }

    /// Maps with the given region classes and no objects or boundaries yet.
    pub fn from_class_labels(labels: &[u32], ncols: usize, nrows: usize, nslices: usize) -> Result<Self> {
        Ok(Self {
            region_class_label_map: Array3D::from_slice(labels, ncols, nrows, nslices)?,
            region_object_label_map: Array3D::from_fill(0, ncols, nrows, nslices),
            boundary_map: Array3D::from_fill(0, ncols, nrows, nslices),
        })
    }

    pub fn window(&self) -> Window {
        self.region_class_label_map.window()
    }

    pub fn nb_pixels(&self) -> usize {
        self.region_class_label_map.data.len()
    }

    pub fn extract_window(&self, window: &Window) -> Self {
        Self {
            region_class_label_map: self.region_class_label_map.extract_window(window),
            region_object_label_map: self.region_object_label_map.extract_window(window),
            boundary_map: self.boundary_map.extract_window(window),
        }
    }

    pub fn insert_window(&mut self, window: &Window, part: &Self) {
        self.region_class_label_map
            .insert_window(window, &part.region_class_label_map);
        self.region_object_label_map
            .insert_window(window, &part.region_object_label_map);
        self.boundary_map.insert_window(window, &part.boundary_map);
    }
}
