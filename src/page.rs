//! Out-of-core page store.
//!
//! Every resident section is persisted in two files: the pixel store and the spatial maps.
//! All values are little-endian and written in a fixed channel order; optional channels are
//! present only when the matching feature is enabled for the job:
//!
//! | pixel file | type | present |
//! |---|---|---|
//! | `init_flags[n]` | u8 | always |
//! | `mask[n]` | u8 | mask enabled |
//! | `region_label[n]` | u32 | always |
//! | band data `[n * bands]` | u8/u16/f32 | always |
//! | `local_std_dev[n * bands]`, `std_dev_mask[n]` | f32, u8 | std-dev enabled |
//! | `edge_value[n]`, `edge_mask[n]` | f32, u8 | edge enabled |
//!
//! The maps file holds `class[n]` u32, `object[n]` u32 and `boundary[n]` u16.

use crate::arrays::{avec_from_fill, Array3D, SpatialMaps, Window};
use crate::common::Config;
use crate::error::{Error, Result};
use crate::pixel::{EdgeChannel, PixelData, PixelStore, StdDevChannel};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const PAGE_BUFFER_SIZE: usize = 1 << 16;

fn write_u32s<W: Write>(writer: &mut W, values: &[u32]) -> io::Result<()> {
    values.iter().try_for_each(|v| writer.write_u32::<LittleEndian>(*v))
}

fn write_u16s<W: Write>(writer: &mut W, values: &[u16]) -> io::Result<()> {
    values.iter().try_for_each(|v| writer.write_u16::<LittleEndian>(*v))
}

fn write_f32s<W: Write>(writer: &mut W, values: &[f32]) -> io::Result<()> {
    values.iter().try_for_each(|v| writer.write_f32::<LittleEndian>(*v))
}

/// Reads and writes the files of the sections of one recursion level in a directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    dir: PathBuf,
    level: u16,
    config: Arc<Config>,
}

impl PageStore {
    pub fn new(config: Arc<Config>, dir: impl Into<PathBuf>, level: u16) -> Self {
        Self {
            dir: dir.into(),
            level,
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, kind: &str, section: u16) -> PathBuf {
        self.dir
            .join(format!("{kind}_level{}_section{section}.bin", self.level))
    }

    fn create(&self, kind: &str, section: u16) -> Result<BufWriter<File>> {
        let file = File::create(self.path(kind, section)).map_err(|e| Error::io(self.level, section, e))?;
        Ok(BufWriter::with_capacity(PAGE_BUFFER_SIZE, file))
    }

    fn open(&self, kind: &str, section: u16) -> Result<BufReader<File>> {
        let file = File::open(self.path(kind, section)).map_err(|e| Error::io(self.level, section, e))?;
        Ok(BufReader::with_capacity(PAGE_BUFFER_SIZE, file))
    }

    /// Writes the pixel store of `section`, replacing an earlier page.
    pub fn save_pixels(&self, section: u16, pixels: &PixelStore) -> Result<()> {
        let mut writer = self.create("pixels", section)?;
        self.write_pixels(&mut writer, pixels)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(self.level, section, e))?;
        trace!("paged out pixels of section {section} at level {}", self.level);
        Ok(())
    }

    fn write_pixels<W: Write>(&self, writer: &mut W, pixels: &PixelStore) -> io::Result<()> {
        writer.write_all(&pixels.init_flags)?;
        if self.config.mask {
            let mask = pixels.mask.as_ref().ok_or_else(|| missing_channel("mask"))?;
            writer.write_all(mask)?;
        }
        write_u32s(writer, &pixels.region_label)?;
        match &pixels.data {
            PixelData::U8(data) => writer.write_all(data)?,
            PixelData::U16(data) => write_u16s(writer, data)?,
            PixelData::F32(data) => write_f32s(writer, data)?,
        }
        if self.config.std_dev {
            let std_dev = pixels.std_dev.as_ref().ok_or_else(|| missing_channel("std-dev"))?;
            write_f32s(writer, &std_dev.local_std_dev)?;
            writer.write_all(&std_dev.std_dev_mask)?;
        }
        if self.config.edge {
            let edge = pixels.edge.as_ref().ok_or_else(|| missing_channel("edge"))?;
            write_f32s(writer, &edge.edge_value)?;
            writer.write_all(&edge.edge_mask)?;
        }
        Ok(())
    }

    /// Reads back the pixel store of `section`, placed at `window`.
    pub fn restore_pixels(&self, section: u16, window: Window) -> Result<PixelStore> {
        let mut reader = self.open("pixels", section)?;
        let pixels = self
            .read_pixels(&mut reader, window)
            .map_err(|e| Error::io(self.level, section, e))?;
        trace!("paged in pixels of section {section} at level {}", self.level);
        Ok(pixels)
    }

    fn read_pixels<R: Read>(&self, reader: &mut R, window: Window) -> io::Result<PixelStore> {
        let n = window.nb_pixels();
        let bands = self.config.nb_bands;
        let mut pixels = PixelStore::new(&self.config, window);
        reader.read_exact(&mut pixels.init_flags)?;
        if let Some(mask) = pixels.mask.as_mut() {
            reader.read_exact(mask)?;
        }
        reader.read_u32_into::<LittleEndian>(&mut pixels.region_label)?;
        match &mut pixels.data {
            PixelData::U8(data) => reader.read_exact(data)?,
            PixelData::U16(data) => reader.read_u16_into::<LittleEndian>(data)?,
            PixelData::F32(data) => reader.read_f32_into::<LittleEndian>(data)?,
        }
        if self.config.std_dev {
            let mut channel = StdDevChannel {
                local_std_dev: avec_from_fill(0.0, n * bands),
                std_dev_mask: avec_from_fill(0, n),
            };
            reader.read_f32_into::<LittleEndian>(&mut channel.local_std_dev)?;
            reader.read_exact(&mut channel.std_dev_mask)?;
            pixels.std_dev = Some(channel);
        }
        if self.config.edge {
            let mut channel = EdgeChannel {
                edge_value: avec_from_fill(0.0, n),
                edge_mask: avec_from_fill(0, n),
            };
            reader.read_f32_into::<LittleEndian>(&mut channel.edge_value)?;
            reader.read_exact(&mut channel.edge_mask)?;
            pixels.edge = Some(channel);
        }
        Ok(pixels)
    }

    pub fn save_maps(&self, section: u16, maps: &SpatialMaps) -> Result<()> {
        let mut writer = self.create("maps", section)?;
        write_u32s(&mut writer, &maps.region_class_label_map.data)
            .and_then(|_| write_u32s(&mut writer, &maps.region_object_label_map.data))
            .and_then(|_| write_u16s(&mut writer, &maps.boundary_map.data))
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(self.level, section, e))
    }

    /// Reads back the spatial maps of a section covering `window`.
    pub fn restore_maps(&self, section: u16, window: Window) -> Result<SpatialMaps> {
        let mut reader = self.open("maps", section)?;
        let mut maps = SpatialMaps::new(window.ncols, window.nrows, window.nslices);
        read_map(&mut reader, &mut maps.region_class_label_map)
            .and_then(|_| read_map(&mut reader, &mut maps.region_object_label_map))
            .and_then(|_| reader.read_u16_into::<LittleEndian>(&mut maps.boundary_map.data))
            .map_err(|e| Error::io(self.level, section, e))?;
        Ok(maps)
    }
}

fn read_map<R: Read>(reader: &mut R, map: &mut Array3D<u32>) -> io::Result<()> {
    reader.read_u32_into::<LittleEndian>(&mut map.data)
}

fn missing_channel(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{name} channel enabled but absent"))
}

/// A resident section: its pixel store and spatial maps.
#[derive(Debug, Clone)]
pub struct Section {
    pub id: u16,
    pub pixels: PixelStore,
    pub maps: SpatialMaps,
}

impl Section {
    /// Section with spatial maps seeded from the pixel store's class labels.
    pub fn new(id: u16, pixels: PixelStore) -> Self {
        let window = pixels.window;
        let mut maps = SpatialMaps::new(window.ncols, window.nrows, window.nslices);
        for (index, class) in maps.region_class_label_map.data.iter_mut().enumerate() {
            *class = pixels.class_label(index);
        }
        Self { id, pixels, maps }
    }
}

#[derive(Debug)]
enum Slot {
    Resident(Box<Section>),
    Paged(Window),
}

/// The ram-level sections owned by a task.
///
/// With out-of-core processing every section lives on disk between operations; an access
/// pages it in, runs the operation and pages it back out, so at most one section is resident.
#[derive(Debug)]
pub struct SectionCache {
    store: Option<PageStore>,
    slots: BTreeMap<u16, Slot>,
    _spill_dir: Option<TempDir>,
}

impl SectionCache {
    pub fn new(config: &Arc<Config>, sections: impl IntoIterator<Item = Section>) -> Result<Self> {
        let (store, spill_dir) = if config.out_of_core {
            let dir = tempfile::Builder::new()
                .prefix("rhseg-")
                .tempdir_in(&config.temp_dir)
                .map_err(|e| Error::io(config.ram_level, 0, e))?;
            debug!("paging sections to {}", dir.path().display());
            let store = PageStore::new(config.clone(), dir.path(), config.ram_level);
            (Some(store), Some(dir))
        } else {
            (None, None)
        };
        let mut slots = BTreeMap::new();
        for section in sections {
            let id = section.id;
            let slot = match &store {
                Some(store) => {
                    store.save_pixels(section.id, &section.pixels)?;
                    store.save_maps(section.id, &section.maps)?;
                    Slot::Paged(section.pixels.window)
                }
                None => Slot::Resident(Box::new(section)),
            };
            slots.insert(id, slot);
        }
        Ok(Self {
            store,
            slots,
            _spill_dir: spill_dir,
        })
    }

    pub fn is_out_of_core(&self) -> bool {
        self.store.is_some()
    }

    pub fn sections(&self) -> Vec<u16> {
        self.slots.keys().copied().collect()
    }

    pub fn contains(&self, section: u16) -> bool {
        self.slots.contains_key(&section)
    }

    /// Runs `f` on a section, paging it in and out when needed.
    pub fn with_section<R>(&mut self, section: u16, f: impl FnOnce(&mut Section) -> Result<R>) -> Result<R> {
        match self.slots.get_mut(&section) {
            None => Err(Error::protocol(format!("section {section} is not held by this task"))),
            Some(Slot::Resident(resident)) => f(resident),
            Some(Slot::Paged(window)) => {
                let store = self
                    .store
                    .as_ref()
                    .ok_or_else(|| Error::protocol("paged section without a page store"))?;
                let mut resident = Section {
                    id: section,
                    pixels: store.restore_pixels(section, *window)?,
                    maps: store.restore_maps(section, Window::new(window.ncols, window.nrows, window.nslices))?,
                };
                let out = f(&mut resident)?;
                store.save_pixels(section, &resident.pixels)?;
                store.save_maps(section, &resident.maps)?;
                Ok(out)
            }
        }
    }
}
