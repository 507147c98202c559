use crate::error::{Error, Result};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Neighbourhood used by the connected-component labeling.
///
/// The 2D variants are the usual 4/8 neighbourhoods plus the 5x5 extensions
/// (12: 8 + the four pixels two steps away along the axes, 20: 5x5 without the
/// corners, 24: full 5x5). The 3D variants are the face, face+edge and full
/// 3x3x3 neighbourhoods.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NbConn {
    Four,
    Eight,
    Twelve,
    Twenty,
    TwentyFour,
    Six,
    Eighteen,
    TwentySix,
}

impl NbConn {
    pub fn is_3d(&self) -> bool {
        matches!(self, NbConn::Six | NbConn::Eighteen | NbConn::TwentySix)
    }

    /// Largest per-axis distance of a neighbour.
    pub fn radius(&self) -> usize {
        match self {
            NbConn::Twelve | NbConn::Twenty | NbConn::TwentyFour => 2,
            _ => 1,
        }
    }

    /// The smaller neighbourhood used only to mark boundary pixels.
    pub fn boundary_conn(&self) -> NbConn {
        if self.is_3d() {
            NbConn::Six
        } else {
            NbConn::Four
        }
    }

    /// Smallest seam size that lets every neighbour pair across a seam be seen.
    pub fn min_seam_size(&self) -> usize {
        2 * self.radius()
    }
}

/// Data type of the input bands. Selected once per job.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PixelDataType {
    U8,
    U16,
    F32,
}

impl PixelDataType {
    pub fn size_of(&self) -> usize {
        match self {
            PixelDataType::U8 => 1,
            PixelDataType::U16 => 2,
            PixelDataType::F32 => 4,
        }
    }
}

/// Split flags used both in the per-level recursion masks and in the border
/// selection flags.
pub const SPLIT_COLUMN: u8 = 1;
pub const SPLIT_ROW: u8 = 2;
pub const SPLIT_SLICE: u8 = 4;

/// Main config for the processing.
///
/// The config is immutable once a job is launched. It is shared between the
/// tasks as `Arc<Config>` and every component receives it explicitly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of columns of the whole image.
    pub ncols: usize,
    /// Number of rows of the whole image.
    pub nrows: usize,
    /// Number of slices, 1 for 2D images.
    pub nslices: usize,
    /// Number of spectral bands.
    pub nb_bands: usize,
    pub data_type: PixelDataType,
    /// One 3-bit mask per splitting level (1 = column, 2 = row, 4 = slice).
    ///
    /// The recursion has `recur_masks.len() + 1` levels, the deepest level never splits.
    pub recur_masks: Vec<u8>,
    /// Recursion level at which a section is fully resident and processed by the regular
    /// (in-memory) algorithms. Levels above it recurse and stitch seams.
    pub ram_level: u16,
    /// Sections at this level are mapped one-to-one onto worker tasks. Zero means the whole
    /// job runs in a single task.
    pub task_level: u16,
    /// Neighbourhood for the connected-component labeling.
    pub conn_type: NbConn,
    /// Width of the strip extracted on each side of a seam. Half is taken from the low edge
    /// of a window and half from the high edge.
    pub seam_size: usize,
    /// Region object labels are carried in the pixel-sourced border records.
    pub object_labels: bool,
    /// Input has a validity mask (1 byte per pixel).
    pub mask: bool,
    /// Local standard deviation channels are present.
    pub std_dev: bool,
    /// Edge value channel is present.
    pub edge: bool,
    /// Page the sections of a task out to `temp_dir` between visits.
    pub out_of_core: bool,
    pub temp_dir: PathBuf,
    /// How long a parent waits for a reply from a child task. `None` blocks forever.
    pub reply_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ncols: 256,
            nrows: 256,
            nslices: 1,
            nb_bands: 1,
            data_type: PixelDataType::U8,
            recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW, SPLIT_COLUMN | SPLIT_ROW],
            ram_level: 1,
            task_level: 0,
            conn_type: NbConn::Eight,
            seam_size: 2,
            object_labels: true,
            mask: false,
            std_dev: false,
            edge: false,
            out_of_core: false,
            temp_dir: std::env::temp_dir(),
            reply_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl Config {
    pub fn nb_levels(&self) -> u16 {
        self.recur_masks.len() as u16 + 1
    }

    pub fn is_3d(&self) -> bool {
        self.nslices > 1
    }

    pub fn nb_pixels(&self) -> usize {
        self.ncols * self.nrows * self.nslices
    }

    /// Checks the config once before a job starts.
    pub fn validate(&self) -> Result<()> {
        if self.ncols == 0 || self.nrows == 0 || self.nslices == 0 {
            return Err(Error::Config("image dimensions must be non-zero".into()));
        }
        if self.nb_bands == 0 {
            return Err(Error::Config("at least one band is required".into()));
        }
        if self.conn_type.is_3d() != self.is_3d() {
            return Err(Error::Config(format!(
                "connectivity {:?} does not match an image with {} slices",
                self.conn_type, self.nslices
            )));
        }
        if self.seam_size % 2 != 0 || self.seam_size < self.conn_type.min_seam_size() {
            return Err(Error::Config(format!(
                "seam size {} must be even and at least {} for {:?}",
                self.seam_size,
                self.conn_type.min_seam_size(),
                self.conn_type
            )));
        }
        if self.seam_size > u16::MAX as usize {
            return Err(Error::Config(format!(
                "seam size {} does not fit the {} limit of border requests",
                self.seam_size,
                u16::MAX
            )));
        }
        if self.ram_level >= self.nb_levels() {
            return Err(Error::Config(format!(
                "ram level {} must be below the number of levels {}",
                self.ram_level,
                self.nb_levels()
            )));
        }
        if self.task_level > self.ram_level {
            return Err(Error::Config(format!(
                "task level {} must not be deeper than ram level {}",
                self.task_level, self.ram_level
            )));
        }
        let mut leaves: usize = 1;
        let (mut ncols, mut nrows, mut nslices) = (self.ncols, self.nrows, self.nslices);
        for (level, mask) in self.recur_masks.iter().enumerate() {
            if *mask > 7 {
                return Err(Error::Config(format!("invalid recursion mask {mask} at level {level}")));
            }
            if mask & SPLIT_SLICE != 0 && !self.is_3d() {
                return Err(Error::Config(format!("level {level} splits slices of a 2D image")));
            }
            leaves *= 1 << mask.count_ones();
            if level >= self.ram_level as usize {
                continue;
            }
            for (bit, extent) in [
                (SPLIT_COLUMN, &mut ncols),
                (SPLIT_ROW, &mut nrows),
                (SPLIT_SLICE, &mut nslices),
            ] {
                if mask & bit != 0 {
                    if *extent % 2 != 0 {
                        return Err(Error::Config(format!(
                            "extent {} is not divisible at level {level}",
                            *extent
                        )));
                    }
                    *extent /= 2;
                }
            }
        }
        if leaves > u16::MAX as usize {
            return Err(Error::Config(format!("{leaves} sections do not fit 16-bit section ids")));
        }
        // Every split dimension must keep at least one full seam inside a resident window.
        for (bit, extent) in [
            (SPLIT_COLUMN, ncols),
            (SPLIT_ROW, nrows),
            (SPLIT_SLICE, nslices),
        ] {
            let split_above_ram = self.recur_masks[..self.ram_level as usize]
                .iter()
                .any(|m| m & bit != 0);
            if split_above_ram && extent < self.seam_size {
                return Err(Error::Config(format!(
                    "resident window extent {extent} is smaller than seam size {}",
                    self.seam_size
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .collect()
}
