//! Pixel store of a section.
//!
//! Holds the input bands in the data type selected for the job plus the per-pixel auxiliary
//! channels. Optional channels exist only when the matching feature is enabled in [`Config`].

use crate::arrays::{avec_from_fill, AlignedVec, Window, ALIGN};
use crate::common::{Config, PixelDataType};
use crate::error::{Error, Result};
use aligned_vec::AVec;

/// Input bands, band sequential (`band * nb_pixels + pixel`).
#[derive(Debug, Clone)]
pub enum PixelData {
    U8(AlignedVec<u8>),
    U16(AlignedVec<u16>),
    F32(AlignedVec<f32>),
}

impl PixelData {
    pub fn zeros(data_type: PixelDataType, len: usize) -> Self {
        match data_type {
            PixelDataType::U8 => PixelData::U8(avec_from_fill(0, len)),
            PixelDataType::U16 => PixelData::U16(avec_from_fill(0, len)),
            PixelDataType::F32 => PixelData::F32(avec_from_fill(0.0, len)),
        }
    }

    pub fn data_type(&self) -> PixelDataType {
        match self {
            PixelData::U8(_) => PixelDataType::U8,
            PixelData::U16(_) => PixelDataType::U16,
            PixelData::F32(_) => PixelDataType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(d) => d.len(),
            PixelData::U16(d) => d.len(),
            PixelData::F32(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn value(&self, index: usize) -> f64 {
        match self {
            PixelData::U8(d) => d[index] as f64,
            PixelData::U16(d) => d[index] as f64,
            PixelData::F32(d) => d[index] as f64,
        }
    }

    fn extract(&self, full: &Window, window: &Window, planes: usize) -> Self {
        match self {
            PixelData::U8(d) => PixelData::U8(extract_planes(d, full, window, planes)),
            PixelData::U16(d) => PixelData::U16(extract_planes(d, full, window, planes)),
            PixelData::F32(d) => PixelData::F32(extract_planes(d, full, window, planes)),
        }
    }
}

impl PartialEq for PixelData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PixelData::U8(a), PixelData::U8(b)) => a[..] == b[..],
            (PixelData::U16(a), PixelData::U16(b)) => a[..] == b[..],
            (PixelData::F32(a), PixelData::F32(b)) => a[..] == b[..],
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StdDevChannel {
    /// `nb_bands * nb_pixels` values, band sequential.
    pub local_std_dev: AlignedVec<f32>,
    pub std_dev_mask: AlignedVec<u8>,
}

#[derive(Debug, Clone)]
pub struct EdgeChannel {
    pub edge_value: AlignedVec<f32>,
    pub edge_mask: AlignedVec<u8>,
}

#[derive(Debug, Clone)]
pub struct PixelStore {
    /// Placement of the section inside the whole image.
    pub window: Window,
    pub nb_bands: usize,
    pub init_flags: AlignedVec<u8>,
    pub mask: Option<AlignedVec<u8>>,
    /// Region class label produced by region growing, 0 for unlabeled pixels.
    pub region_label: AlignedVec<u32>,
    pub data: PixelData,
    pub std_dev: Option<StdDevChannel>,
    pub edge: Option<EdgeChannel>,
}

impl PixelStore {
    /// Zeroed store for `window` with the channels enabled in `config`.
    pub fn new(config: &Config, window: Window) -> Self {
        let n = window.nb_pixels();
        Self {
            window,
            nb_bands: config.nb_bands,
            init_flags: avec_from_fill(0, n),
            mask: config.mask.then(|| avec_from_fill(1, n)),
            region_label: avec_from_fill(0, n),
            data: PixelData::zeros(config.data_type, n * config.nb_bands),
            std_dev: config.std_dev.then(|| StdDevChannel {
                local_std_dev: avec_from_fill(0.0, n * config.nb_bands),
                std_dev_mask: avec_from_fill(0, n),
            }),
            edge: config.edge.then(|| EdgeChannel {
                edge_value: avec_from_fill(f32::NEG_INFINITY, n),
                edge_mask: avec_from_fill(0, n),
            }),
        }
    }

    /// Whole-image store from band data and region labels. Pixels with a non-zero region
    /// label are flagged as initialized.
    pub fn from_data(config: &Config, data: PixelData, region_label: &[u32]) -> Result<Self> {
        let window = Window::new(config.ncols, config.nrows, config.nslices);
        let n = window.nb_pixels();
        if region_label.len() != n || data.len() != n * config.nb_bands {
            return Err(Error::DimensionMismatch(format!(
                "{} labels and {} band values for {n} pixels and {} bands",
                region_label.len(),
                data.len(),
                config.nb_bands
            )));
        }
        if data.data_type() != config.data_type {
            return Err(Error::DimensionMismatch(format!(
                "{:?} data for a {:?} job",
                data.data_type(),
                config.data_type
            )));
        }
        let mut store = Self::new(config, window);
        store.data = data;
        store.region_label = AVec::from_slice(ALIGN, region_label);
        store.init_flags = AVec::from_iter(ALIGN, region_label.iter().map(|l| (*l != 0) as u8));
        Ok(store)
    }

    pub fn nb_pixels(&self) -> usize {
        self.window.nb_pixels()
    }

    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        self.mask.as_ref().map_or(true, |m| m[index] != 0)
    }

    #[inline]
    pub fn band_value(&self, index: usize, band: usize) -> f64 {
        self.data.value(band * self.nb_pixels() + index)
    }

    /// Region class label of a pixel, 0 when masked out.
    #[inline]
    pub fn class_label(&self, index: usize) -> u32 {
        if self.is_valid(index) {
            self.region_label[index]
        } else {
            0
        }
    }

    /// Edge annotation, `(false, -inf)` when the feature is disabled.
    #[inline]
    pub fn edge_at(&self, index: usize) -> (bool, f32) {
        match &self.edge {
            Some(edge) => (edge.edge_mask[index] != 0, edge.edge_value[index]),
            None => (false, f32::NEG_INFINITY),
        }
    }

    /// Copies the pixels covered by `window`; offsets of `window` are relative to this store,
    /// the returned store is placed in image coordinates.
    pub fn extract_window(&self, window: &Window) -> Self {
        let full = Window::new(self.window.ncols, self.window.nrows, self.window.nslices);
        let placed = Window {
            col: self.window.col + window.col,
            row: self.window.row + window.row,
            slice: self.window.slice + window.slice,
            ..*window
        };
        Self {
            window: placed,
            nb_bands: self.nb_bands,
            init_flags: extract_planes(&self.init_flags, &full, window, 1),
            mask: self.mask.as_ref().map(|m| extract_planes(m, &full, window, 1)),
            region_label: extract_planes(&self.region_label, &full, window, 1),
            data: self.data.extract(&full, window, self.nb_bands),
            std_dev: self.std_dev.as_ref().map(|s| StdDevChannel {
                local_std_dev: extract_planes(&s.local_std_dev, &full, window, self.nb_bands),
                std_dev_mask: extract_planes(&s.std_dev_mask, &full, window, 1),
            }),
            edge: self.edge.as_ref().map(|e| EdgeChannel {
                edge_value: extract_planes(&e.edge_value, &full, window, 1),
                edge_mask: extract_planes(&e.edge_mask, &full, window, 1),
            }),
        }
    }
}

impl PartialEq for PixelStore {
    fn eq(&self, other: &Self) -> bool {
        fn opt_eq<T: PartialEq>(a: &Option<AlignedVec<T>>, b: &Option<AlignedVec<T>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a[..] == b[..],
                (None, None) => true,
                _ => false,
            }
        }
        let std_dev_eq = match (&self.std_dev, &other.std_dev) {
            (Some(a), Some(b)) => {
                a.local_std_dev[..] == b.local_std_dev[..] && a.std_dev_mask[..] == b.std_dev_mask[..]
            }
            (None, None) => true,
            _ => false,
        };
        let edge_eq = match (&self.edge, &other.edge) {
            (Some(a), Some(b)) => {
                a.edge_value[..] == b.edge_value[..] && a.edge_mask[..] == b.edge_mask[..]
            }
            (None, None) => true,
            _ => false,
        };
        self.window == other.window
            && self.nb_bands == other.nb_bands
            && self.init_flags[..] == other.init_flags[..]
            && opt_eq(&self.mask, &other.mask)
            && self.region_label[..] == other.region_label[..]
            && self.data == other.data
            && std_dev_eq
            && edge_eq
    }
}

/// Copies `planes` consecutive planes of `full` restricted to `window`.
fn extract_planes<T: Copy>(src: &[T], full: &Window, window: &Window, planes: usize) -> AlignedVec<T> {
    let plane_len = full.nb_pixels();
    debug_assert_eq!(src.len(), plane_len * planes);
    let mut out = Vec::with_capacity(window.nb_pixels() * planes);
    for plane in 0..planes {
        let base = plane * plane_len;
        for slice in window.slice..window.slice + window.nslices {
            for row in window.row..window.row + window.nrows {
                let start = base + full.get_index(window.col, row, slice);
                out.extend_from_slice(&src[start..start + window.ncols]);
            }
        }
    }
    AVec::from_slice(ALIGN, &out)
}
