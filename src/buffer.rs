//! Typed transfer buffer.
//!
//! Records are marshalled into five parallel arrays (`u8`, `u16`, `u32`, `f32`, `f64`) with an
//! independent read cursor per array. The capacity of every array is fixed before the first
//! write; a record that does not fit is an error, never a silent truncation. Each record type
//! describes its shape once through [`Transfer`], so the encode and decode order cannot drift.

use crate::common::Config;
use crate::error::{BufferKind, Error, Result};
use crate::index::Index;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::ops::{Add, Mul};

const HEADER_SIZE: usize = 5 * 4;

/// Number of elements per array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferSize {
    pub bytes: usize,
    pub shorts: usize,
    pub ints: usize,
    pub floats: usize,
    pub doubles: usize,
}

impl BufferSize {
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.bytes + 2 * self.shorts + 4 * self.ints + 4 * self.floats + 8 * self.doubles
    }
}

impl Add for BufferSize {
    type Output = BufferSize;
    fn add(self, rhs: Self) -> Self::Output {
        BufferSize {
            bytes: self.bytes + rhs.bytes,
            shorts: self.shorts + rhs.shorts,
            ints: self.ints + rhs.ints,
            floats: self.floats + rhs.floats,
            doubles: self.doubles + rhs.doubles,
        }
    }
}

impl Mul<usize> for BufferSize {
    type Output = BufferSize;
    fn mul(self, rhs: usize) -> Self::Output {
        BufferSize {
            bytes: self.bytes * rhs,
            shorts: self.shorts * rhs,
            ints: self.ints * rhs,
            floats: self.floats * rhs,
            doubles: self.doubles * rhs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferBuffer {
    capacity: BufferSize,
    bytes: Vec<u8>,
    shorts: Vec<u16>,
    ints: Vec<u32>,
    floats: Vec<f32>,
    doubles: Vec<f64>,
    cursor: [usize; 5],
}

macro_rules! put_get {
    ($put:ident, $get:ident, $ty:ty, $field:ident, $cap:ident, $kind:expr, $slot:expr) => {
        #[inline]
        pub fn $put(&mut self, value: $ty) -> Result<()> {
            if self.$field.len() >= self.capacity.$cap {
                return Err(Error::Capacity {
                    kind: $kind,
                    capacity: self.capacity.$cap,
                });
            }
            self.$field.push(value);
            Ok(())
        }

        #[inline]
        pub fn $get(&mut self) -> Result<$ty> {
            let value = self.$field.get(self.cursor[$slot]).copied().ok_or_else(|| {
                Error::protocol(format!("{} buffer exhausted after {} values", $kind, self.cursor[$slot]))
            })?;
            self.cursor[$slot] += 1;
            Ok(value)
        }
    };
}

impl TransferBuffer {
    pub fn with_capacity(capacity: BufferSize) -> Self {
        Self {
            capacity,
            bytes: Vec::with_capacity(capacity.bytes),
            shorts: Vec::with_capacity(capacity.shorts),
            ints: Vec::with_capacity(capacity.ints),
            floats: Vec::with_capacity(capacity.floats),
            doubles: Vec::with_capacity(capacity.doubles),
            cursor: [0; 5],
        }
    }

    put_get!(put_u8, get_u8, u8, bytes, bytes, BufferKind::Byte, 0);
    put_get!(put_u16, get_u16, u16, shorts, shorts, BufferKind::Short, 1);
    put_get!(put_u32, get_u32, u32, ints, ints, BufferKind::Int, 2);
    put_get!(put_f32, get_f32, f32, floats, floats, BufferKind::Float, 3);
    put_get!(put_f64, get_f64, f64, doubles, doubles, BufferKind::Double, 4);

    pub fn capacity(&self) -> BufferSize {
        self.capacity
    }

    /// Elements written so far.
    pub fn len(&self) -> BufferSize {
        BufferSize {
            bytes: self.bytes.len(),
            shorts: self.shorts.len(),
            ints: self.ints.len(),
            floats: self.floats.len(),
            doubles: self.doubles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == BufferSize::default()
    }

    /// All values were read back.
    pub fn is_consumed(&self) -> bool {
        let len = self.len();
        self.cursor == [len.bytes, len.shorts, len.ints, len.floats, len.doubles]
    }

    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(value as u8)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let len = self.len();
        for count in [len.bytes, len.shorts, len.ints, len.floats, len.doubles] {
            writer.write_u32::<LittleEndian>(count as u32)?;
        }
        writer.write_all(&self.bytes)?;
        for v in &self.shorts {
            writer.write_u16::<LittleEndian>(*v)?;
        }
        for v in &self.ints {
            writer.write_u32::<LittleEndian>(*v)?;
        }
        for v in &self.floats {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        for v in &self.doubles {
            writer.write_f64::<LittleEndian>(*v)?;
        }
        Ok(())
    }

    /// Decodes a buffer written by [`TransferBuffer::write_to`]; the counts must match the
    /// remaining input exactly.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let truncated = |e: std::io::Error| Error::protocol(format!("truncated transfer buffer: {e}"));
        let mut reader = Cursor::new(data);
        let mut counts = [0usize; 5];
        for count in counts.iter_mut() {
            *count = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        }
        let size = BufferSize {
            bytes: counts[0],
            shorts: counts[1],
            ints: counts[2],
            floats: counts[3],
            doubles: counts[4],
        };
        if size.wire_len() != data.len() {
            return Err(Error::protocol(format!(
                "transfer buffer of {} bytes announces {} bytes",
                data.len(),
                size.wire_len()
            )));
        }
        let mut buffer = Self::with_capacity(size);
        buffer.bytes.resize(size.bytes, 0);
        reader.read_exact(&mut buffer.bytes).map_err(truncated)?;
        buffer.shorts.resize(size.shorts, 0);
        reader
            .read_u16_into::<LittleEndian>(&mut buffer.shorts)
            .map_err(truncated)?;
        buffer.ints.resize(size.ints, 0);
        reader
            .read_u32_into::<LittleEndian>(&mut buffer.ints)
            .map_err(truncated)?;
        buffer.floats.resize(size.floats, 0.0);
        reader
            .read_f32_into::<LittleEndian>(&mut buffer.floats)
            .map_err(truncated)?;
        buffer.doubles.resize(size.doubles, 0.0);
        reader
            .read_f64_into::<LittleEndian>(&mut buffer.doubles)
            .map_err(truncated)?;
        Ok(buffer)
    }
}

/// Which collaborator an [`Index`] record was filled from. The two sources have different
/// wire shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexSource {
    /// Class label and edge annotation from the pixel store.
    Pixel = 0,
    /// Class, object and boundary labels from the spatial maps, with routing fields.
    SpatialMap = 1,
}

impl TryFrom<u8> for IndexSource {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(IndexSource::Pixel),
            1 => Ok(IndexSource::SpatialMap),
            _ => Err(Error::protocol(format!("invalid index source {value}"))),
        }
    }
}

/// Feature flags that change record shapes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLayout {
    pub object_labels: bool,
    pub edge: bool,
    pub nb_bands: usize,
    pub index_source: IndexSource,
}

impl TransferLayout {
    pub fn new(config: &Config) -> Self {
        Self {
            object_labels: config.object_labels,
            edge: config.edge,
            nb_bands: config.nb_bands,
            index_source: IndexSource::SpatialMap,
        }
    }

    pub fn with_source(mut self, index_source: IndexSource) -> Self {
        self.index_source = index_source;
        self
    }

    /// A pixel-sourced record cut down to the fields its wire shape carries, so records
    /// built in place match the ones received from another task.
    pub fn pixel_record(&self, index: Index) -> Index {
        let object = if self.object_labels {
            index.region_object_label
        } else {
            0
        };
        let record = Index::new(0, 0, index.region_class_label, object, index.boundary_map);
        if self.edge {
            record.with_edge(index.edge_mask, index.edge_value)
        } else {
            record
        }
    }
}

/// Shape of a record type inside a [`TransferBuffer`].
pub trait Transfer: Sized {
    fn size(layout: &TransferLayout) -> BufferSize;
    fn encode(&self, buffer: &mut TransferBuffer, layout: &TransferLayout) -> Result<()>;
    fn decode(buffer: &mut TransferBuffer, layout: &TransferLayout) -> Result<Self>;
}

impl Transfer for Index {
    fn size(layout: &TransferLayout) -> BufferSize {
        match layout.index_source {
            IndexSource::Pixel => BufferSize {
                ints: 1 + layout.object_labels as usize,
                shorts: 1,
                floats: layout.edge as usize,
                bytes: layout.edge as usize,
                ..BufferSize::default()
            },
            IndexSource::SpatialMap => BufferSize {
                shorts: 2,
                ints: 3,
                ..BufferSize::default()
            },
        }
    }

    fn encode(&self, buffer: &mut TransferBuffer, layout: &TransferLayout) -> Result<()> {
        match layout.index_source {
            IndexSource::Pixel => {
                buffer.put_u32(self.region_class_label)?;
                if layout.object_labels {
                    buffer.put_u32(self.region_object_label)?;
                }
                buffer.put_u16(self.boundary_map)?;
                if layout.edge {
                    buffer.put_f32(self.edge_value)?;
                    buffer.put_bool(self.edge_mask)?;
                }
            }
            IndexSource::SpatialMap => {
                buffer.put_u16(self.pixel_section)?;
                buffer.put_u16(self.boundary_map)?;
                buffer.put_u32(self.pixel_index)?;
                buffer.put_u32(self.region_class_label)?;
                buffer.put_u32(self.region_object_label)?;
            }
        }
        Ok(())
    }

    fn decode(buffer: &mut TransferBuffer, layout: &TransferLayout) -> Result<Self> {
        match layout.index_source {
            IndexSource::Pixel => {
                let class = buffer.get_u32()?;
                let object = if layout.object_labels {
                    buffer.get_u32()?
                } else {
                    0
                };
                let boundary = buffer.get_u16()?;
                let mut index = Index::new(0, 0, class, object, boundary);
                if layout.edge {
                    let value = buffer.get_f32()?;
                    let mask = buffer.get_bool()?;
                    index = index.with_edge(mask, value);
                }
                Ok(index)
            }
            IndexSource::SpatialMap => {
                let section = buffer.get_u16()?;
                let boundary = buffer.get_u16()?;
                let pixel_index = buffer.get_u32()?;
                let class = buffer.get_u32()?;
                let object = buffer.get_u32()?;
                Ok(Index::new(pixel_index, section, class, object, boundary))
            }
        }
    }
}

/// Buffer sized for exactly `count` records of `T` plus `extra`.
pub fn sized_for<T: Transfer>(count: usize, layout: &TransferLayout, extra: BufferSize) -> TransferBuffer {
    TransferBuffer::with_capacity(T::size(layout) * count + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(object_labels: bool, edge: bool, source: IndexSource) -> TransferLayout {
        TransferLayout {
            object_labels,
            edge,
            nb_bands: 1,
            index_source: source,
        }
    }

    #[test]
    fn overflow_is_an_error() {
        let mut buffer = TransferBuffer::with_capacity(BufferSize {
            ints: 1,
            ..BufferSize::default()
        });
        buffer.put_u32(1).unwrap();
        assert!(matches!(
            buffer.put_u32(2),
            Err(Error::Capacity {
                kind: BufferKind::Int,
                capacity: 1
            })
        ));
        assert!(matches!(buffer.put_u8(0), Err(Error::Capacity { .. })));
    }

    #[test]
    fn reading_past_the_end_is_an_error() {
        let mut buffer = TransferBuffer::with_capacity(BufferSize::default());
        assert!(matches!(buffer.get_u16(), Err(Error::Protocol(_))));
    }

    #[test]
    fn pixel_index_shape_depends_on_features() {
        let l = layout(true, true, IndexSource::Pixel);
        let index = Index::new(9, 2, 4, 11, 3).with_edge(true, 0.5);
        let mut buffer = sized_for::<Index>(1, &l, BufferSize::default());
        index.encode(&mut buffer, &l).unwrap();
        assert_eq!(buffer.len(), buffer.capacity());
        let decoded = Index::decode(&mut buffer, &l).unwrap();
        // routing fields are not part of the pixel-sourced shape
        assert_eq!(decoded.pixel_index, 0);
        assert_eq!(decoded.region_object_label, 11);
        assert_eq!(decoded.edge_value, 0.5);
        assert!(buffer.is_consumed());

        let l = layout(false, false, IndexSource::Pixel);
        assert_eq!(
            Index::size(&l),
            BufferSize {
                ints: 1,
                shorts: 1,
                ..BufferSize::default()
            }
        );
    }

    #[test]
    fn local_pixel_records_match_received_ones() {
        let index = Index::new(9, 2, 4, 11, 3).with_edge(true, 0.5);
        for (object_labels, edge) in [(true, true), (false, true), (true, false), (false, false)] {
            let l = layout(object_labels, edge, IndexSource::Pixel);
            let mut buffer = sized_for::<Index>(1, &l, BufferSize::default());
            index.encode(&mut buffer, &l).unwrap();
            assert_eq!(Index::decode(&mut buffer, &l).unwrap(), l.pixel_record(index));
        }
    }

    #[test]
    fn wire_bytes_reject_wrong_length() {
        let l = layout(false, false, IndexSource::SpatialMap);
        let mut buffer = sized_for::<Index>(2, &l, BufferSize::default());
        Index::new(1, 2, 3, 4, 5).encode(&mut buffer, &l).unwrap();
        Index::new(6, 7, 0, 9, 10).encode(&mut buffer, &l).unwrap();
        let mut bytes = Vec::new();
        buffer.write_to(&mut bytes).unwrap();
        let mut back = TransferBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(Index::decode(&mut back, &l).unwrap(), Index::new(1, 2, 3, 4, 5));
        let second = Index::decode(&mut back, &l).unwrap();
        assert_eq!(second.region_object_label, 0);
        bytes.pop();
        assert!(TransferBuffer::from_bytes(&bytes).is_err());
    }
}
