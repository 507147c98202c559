//! Request/reply catalogue of the task protocol and its encoding into transfer buffers.
//!
//! A request travels as a header of three `u16` (`request_id`, `calling_task`, `recur_level`)
//! followed by the addressed section and the request body. A reply carries the id of the
//! request it answers and the shape of its body; both are checked on decode.

use crate::arrays::{Array3D, SpatialMaps, Window};
use crate::buffer::{BufferSize, IndexSource, Transfer, TransferBuffer, TransferLayout};
use crate::connectivity::BoundaryUpdate;
use crate::error::{Error, Result};
use crate::index::{Border, BorderFlags, Index};
use crate::region::{RegionClass, RegionObject};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestId {
    Terminate = 0,
    LabelOffset = 1,
    RegionClassInfo = 2,
    RegionObjectInfo = 3,
    InitRegionClasses = 4,
    InitRegionObjects = 5,
    RelabelRegionClasses = 6,
    RelabelRegionObjects = 7,
    BorderIndex = 8,
    SpatialBorderIndex = 9,
    UpdateRegionLabelMap = 10,
    ConnectedComponentInit = 11,
    ConnectedComponentUpdate = 12,
    BoundaryMap = 13,
    SeamBoundaryUpdate = 14,
    CollectSpatialMaps = 15,
}

impl TryFrom<u16> for RequestId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        use RequestId::*;
        Ok(match value {
            0 => Terminate,
            1 => LabelOffset,
            2 => RegionClassInfo,
            3 => RegionObjectInfo,
            4 => InitRegionClasses,
            5 => InitRegionObjects,
            6 => RelabelRegionClasses,
            7 => RelabelRegionObjects,
            8 => BorderIndex,
            9 => SpatialBorderIndex,
            10 => UpdateRegionLabelMap,
            11 => ConnectedComponentInit,
            12 => ConnectedComponentUpdate,
            13 => BoundaryMap,
            14 => SeamBoundaryUpdate,
            15 => CollectSpatialMaps,
            _ => return Err(Error::protocol(format!("unknown request id {value}"))),
        })
    }
}

impl RequestId {
    /// Reply shape a successful handler answers with, `None` for requests without a reply.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        use RequestId::*;
        match self {
            Terminate => None,
            RegionClassInfo | InitRegionClasses => Some(ReplyKind::RegionClasses),
            RegionObjectInfo => Some(ReplyKind::RegionObjects),
            BorderIndex | SpatialBorderIndex => Some(ReplyKind::Border),
            ConnectedComponentInit | ConnectedComponentUpdate => Some(ReplyKind::Count),
            CollectSpatialMaps => Some(ReplyKind::SpatialMaps),
            LabelOffset | InitRegionObjects | RelabelRegionClasses | RelabelRegionObjects
            | UpdateRegionLabelMap | BoundaryMap | SeamBoundaryUpdate => Some(ReplyKind::Ack),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Stop the worker loop; cascades to the worker's child tasks.
    Terminate,
    /// Add `offset` to every non-zero region object label.
    LabelOffset { offset: u32 },
    RegionClassInfo,
    RegionObjectInfo,
    /// Seed the class map from the pixel store's region labels.
    InitRegionClasses,
    /// Clear object labels and boundary levels.
    InitRegionObjects,
    RelabelRegionClasses { pairs: Vec<(u32, u32)> },
    RelabelRegionObjects { pairs: Vec<(u32, u32)> },
    BorderIndex { flags: BorderFlags, seam_size: u16 },
    SpatialBorderIndex { flags: BorderFlags, seam_size: u16 },
    /// Write the class map back into the pixel store.
    UpdateRegionLabelMap,
    ConnectedComponentInit { hlevel: u16 },
    ConnectedComponentUpdate { hlevel: u16 },
    BoundaryMap { hlevel: u16 },
    SeamBoundaryUpdate { updates: Vec<BoundaryUpdate> },
    CollectSpatialMaps,
}

fn pairs_size(pairs: &[(u32, u32)]) -> BufferSize {
    BufferSize {
        ints: 1 + 2 * pairs.len(),
        ..BufferSize::default()
    }
}

fn put_pairs(buffer: &mut TransferBuffer, pairs: &[(u32, u32)]) -> Result<()> {
    buffer.put_u32(pairs.len() as u32)?;
    for (from, to) in pairs {
        buffer.put_u32(*from)?;
        buffer.put_u32(*to)?;
    }
    Ok(())
}

fn get_pairs(buffer: &mut TransferBuffer) -> Result<Vec<(u32, u32)>> {
    let count = buffer.get_u32()?;
    (0..count)
        .map(|_| -> Result<(u32, u32)> { Ok((buffer.get_u32()?, buffer.get_u32()?)) })
        .collect()
}

impl Request {
    pub fn id(&self) -> RequestId {
        match self {
            Request::Terminate => RequestId::Terminate,
            Request::LabelOffset { .. } => RequestId::LabelOffset,
            Request::RegionClassInfo => RequestId::RegionClassInfo,
            Request::RegionObjectInfo => RequestId::RegionObjectInfo,
            Request::InitRegionClasses => RequestId::InitRegionClasses,
            Request::InitRegionObjects => RequestId::InitRegionObjects,
            Request::RelabelRegionClasses { .. } => RequestId::RelabelRegionClasses,
            Request::RelabelRegionObjects { .. } => RequestId::RelabelRegionObjects,
            Request::BorderIndex { .. } => RequestId::BorderIndex,
            Request::SpatialBorderIndex { .. } => RequestId::SpatialBorderIndex,
            Request::UpdateRegionLabelMap => RequestId::UpdateRegionLabelMap,
            Request::ConnectedComponentInit { .. } => RequestId::ConnectedComponentInit,
            Request::ConnectedComponentUpdate { .. } => RequestId::ConnectedComponentUpdate,
            Request::BoundaryMap { .. } => RequestId::BoundaryMap,
            Request::SeamBoundaryUpdate { .. } => RequestId::SeamBoundaryUpdate,
            Request::CollectSpatialMaps => RequestId::CollectSpatialMaps,
        }
    }

    fn body_size(&self) -> BufferSize {
        match self {
            Request::LabelOffset { .. } => BufferSize {
                ints: 1,
                ..BufferSize::default()
            },
            Request::RelabelRegionClasses { pairs } | Request::RelabelRegionObjects { pairs } => pairs_size(pairs),
            Request::BorderIndex { .. } | Request::SpatialBorderIndex { .. } => BufferSize {
                bytes: 1,
                shorts: 1,
                ..BufferSize::default()
            },
            Request::ConnectedComponentInit { .. }
            | Request::ConnectedComponentUpdate { .. }
            | Request::BoundaryMap { .. } => BufferSize {
                shorts: 1,
                ..BufferSize::default()
            },
            Request::SeamBoundaryUpdate { updates } => BufferSize {
                ints: 1 + updates.len(),
                shorts: 2 * updates.len(),
                ..BufferSize::default()
            },
            _ => BufferSize::default(),
        }
    }

    fn encode_body(&self, buffer: &mut TransferBuffer) -> Result<()> {
        match self {
            Request::LabelOffset { offset } => buffer.put_u32(*offset),
            Request::RelabelRegionClasses { pairs } | Request::RelabelRegionObjects { pairs } => {
                put_pairs(buffer, pairs)
            }
            Request::BorderIndex { flags, seam_size } | Request::SpatialBorderIndex { flags, seam_size } => {
                buffer.put_u8(flags.bits())?;
                buffer.put_u16(*seam_size)
            }
            Request::ConnectedComponentInit { hlevel }
            | Request::ConnectedComponentUpdate { hlevel }
            | Request::BoundaryMap { hlevel } => buffer.put_u16(*hlevel),
            Request::SeamBoundaryUpdate { updates } => {
                buffer.put_u32(updates.len() as u32)?;
                for update in updates {
                    buffer.put_u16(update.section)?;
                    buffer.put_u16(update.boundary)?;
                    buffer.put_u32(update.pixel_index)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn decode_body(id: RequestId, buffer: &mut TransferBuffer) -> Result<Self> {
        Ok(match id {
            RequestId::Terminate => Request::Terminate,
            RequestId::LabelOffset => Request::LabelOffset {
                offset: buffer.get_u32()?,
            },
            RequestId::RegionClassInfo => Request::RegionClassInfo,
            RequestId::RegionObjectInfo => Request::RegionObjectInfo,
            RequestId::InitRegionClasses => Request::InitRegionClasses,
            RequestId::InitRegionObjects => Request::InitRegionObjects,
            RequestId::RelabelRegionClasses => Request::RelabelRegionClasses {
                pairs: get_pairs(buffer)?,
            },
            RequestId::RelabelRegionObjects => Request::RelabelRegionObjects {
                pairs: get_pairs(buffer)?,
            },
            RequestId::BorderIndex => Request::BorderIndex {
                flags: BorderFlags::try_from(buffer.get_u8()?)?,
                seam_size: buffer.get_u16()?,
            },
            RequestId::SpatialBorderIndex => Request::SpatialBorderIndex {
                flags: BorderFlags::try_from(buffer.get_u8()?)?,
                seam_size: buffer.get_u16()?,
            },
            RequestId::UpdateRegionLabelMap => Request::UpdateRegionLabelMap,
            RequestId::ConnectedComponentInit => Request::ConnectedComponentInit {
                hlevel: buffer.get_u16()?,
            },
            RequestId::ConnectedComponentUpdate => Request::ConnectedComponentUpdate {
                hlevel: buffer.get_u16()?,
            },
            RequestId::BoundaryMap => Request::BoundaryMap {
                hlevel: buffer.get_u16()?,
            },
            RequestId::SeamBoundaryUpdate => {
                let count = buffer.get_u32()?;
                let updates = (0..count)
                    .map(|_| -> Result<BoundaryUpdate> {
                        let section = buffer.get_u16()?;
                        let boundary = buffer.get_u16()?;
                        Ok(BoundaryUpdate {
                            section,
                            boundary,
                            pixel_index: buffer.get_u32()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Request::SeamBoundaryUpdate { updates }
            }
            RequestId::CollectSpatialMaps => Request::CollectSpatialMaps,
        })
    }
}

/// A request addressed to a section at a recursion level.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub calling_task: u16,
    pub recur_level: u16,
    pub section: u16,
    pub request: Request,
}

impl Envelope {
    pub fn encode(&self) -> Result<TransferBuffer> {
        let header = BufferSize {
            shorts: 4,
            ..BufferSize::default()
        };
        let mut buffer = TransferBuffer::with_capacity(header + self.request.body_size());
        buffer.put_u16(self.request.id() as u16)?;
        buffer.put_u16(self.calling_task)?;
        buffer.put_u16(self.recur_level)?;
        buffer.put_u16(self.section)?;
        self.request.encode_body(&mut buffer)?;
        Ok(buffer)
    }

    pub fn decode(buffer: &mut TransferBuffer) -> Result<Self> {
        let id = RequestId::try_from(buffer.get_u16()?)?;
        let calling_task = buffer.get_u16()?;
        let recur_level = buffer.get_u16()?;
        let section = buffer.get_u16()?;
        let request = Request::decode_body(id, buffer)?;
        if !buffer.is_consumed() {
            return Err(Error::protocol(format!("trailing data after {id:?} request")));
        }
        Ok(Self {
            calling_task,
            recur_level,
            section,
            request,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    Ack = 0,
    Count = 1,
    Border = 2,
    RegionClasses = 3,
    RegionObjects = 4,
    SpatialMaps = 5,
    Failed = 6,
}

impl TryFrom<u8> for ReplyKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ReplyKind::Ack,
            1 => ReplyKind::Count,
            2 => ReplyKind::Border,
            3 => ReplyKind::RegionClasses,
            4 => ReplyKind::RegionObjects,
            5 => ReplyKind::SpatialMaps,
            6 => ReplyKind::Failed,
            _ => return Err(Error::protocol(format!("unknown reply kind {value}"))),
        })
    }
}

/// Spatial maps of one resident section placed in the image.
#[derive(Clone, Debug, PartialEq)]
pub struct PlacedMaps {
    pub window: Window,
    pub maps: SpatialMaps,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ack,
    Count(u32),
    Border { source: IndexSource, border: Border },
    RegionClasses(Vec<RegionClass>),
    RegionObjects(Vec<RegionObject>),
    SpatialMaps(Vec<PlacedMaps>),
    Failed { level: u16, section: u16, message: String },
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Ack => ReplyKind::Ack,
            Reply::Count(_) => ReplyKind::Count,
            Reply::Border { .. } => ReplyKind::Border,
            Reply::RegionClasses(_) => ReplyKind::RegionClasses,
            Reply::RegionObjects(_) => ReplyKind::RegionObjects,
            Reply::SpatialMaps(_) => ReplyKind::SpatialMaps,
            Reply::Failed { .. } => ReplyKind::Failed,
        }
    }

    fn body_size(&self, layout: &TransferLayout) -> BufferSize {
        match self {
            Reply::Ack => BufferSize::default(),
            Reply::Count(_) => BufferSize {
                ints: 1,
                ..BufferSize::default()
            },
            Reply::Border { source, border } => {
                let header = BufferSize {
                    ints: 3,
                    shorts: 1,
                    bytes: 2,
                    ..BufferSize::default()
                };
                header + Index::size(&layout.with_source(*source)) * border.nb_records()
            }
            Reply::RegionClasses(classes) => {
                let count = BufferSize {
                    ints: 1,
                    ..BufferSize::default()
                };
                count + RegionClass::size(layout) * classes.len()
            }
            Reply::RegionObjects(objects) => {
                let count = BufferSize {
                    ints: 1,
                    ..BufferSize::default()
                };
                count + RegionObject::size(layout) * objects.len()
            }
            Reply::SpatialMaps(sections) => sections.iter().fold(
                BufferSize {
                    ints: 1,
                    ..BufferSize::default()
                },
                |size, placed| {
                    let n = placed.maps.nb_pixels();
                    size + BufferSize {
                        ints: 6 + 2 * n,
                        shorts: n,
                        ..BufferSize::default()
                    }
                },
            ),
            Reply::Failed { message, .. } => BufferSize {
                shorts: 2,
                ints: 1,
                bytes: message.len(),
                ..BufferSize::default()
            },
        }
    }

    /// Encodes the reply to a request `answering`.
    pub fn encode(&self, answering: RequestId, layout: &TransferLayout) -> Result<TransferBuffer> {
        let header = BufferSize {
            shorts: 1,
            bytes: 1,
            ..BufferSize::default()
        };
        let mut buffer = TransferBuffer::with_capacity(header + self.body_size(layout));
        buffer.put_u16(answering as u16)?;
        buffer.put_u8(self.kind() as u8)?;
        match self {
            Reply::Ack => {}
            Reply::Count(count) => buffer.put_u32(*count)?,
            Reply::Border { source, border } => {
                buffer.put_u32(border.ncols as u32)?;
                buffer.put_u32(border.nrows as u32)?;
                buffer.put_u32(border.nslices as u32)?;
                buffer.put_u16(border.seam_size as u16)?;
                buffer.put_u8(border.flags.bits())?;
                buffer.put_u8(*source as u8)?;
                let layout = layout.with_source(*source);
                for face in border.flags.faces() {
                    for record in border.face(face) {
                        record.encode(&mut buffer, &layout)?;
                    }
                }
            }
            Reply::RegionClasses(classes) => {
                buffer.put_u32(classes.len() as u32)?;
                for class in classes {
                    class.encode(&mut buffer, layout)?;
                }
            }
            Reply::RegionObjects(objects) => {
                buffer.put_u32(objects.len() as u32)?;
                for object in objects {
                    object.encode(&mut buffer, layout)?;
                }
            }
            Reply::SpatialMaps(sections) => {
                buffer.put_u32(sections.len() as u32)?;
                for placed in sections {
                    let w = &placed.window;
                    for v in [w.col, w.row, w.slice, w.ncols, w.nrows, w.nslices] {
                        buffer.put_u32(v as u32)?;
                    }
                    for v in placed.maps.region_class_label_map.data.iter() {
                        buffer.put_u32(*v)?;
                    }
                    for v in placed.maps.region_object_label_map.data.iter() {
                        buffer.put_u32(*v)?;
                    }
                    for v in placed.maps.boundary_map.data.iter() {
                        buffer.put_u16(*v)?;
                    }
                }
            }
            Reply::Failed {
                level,
                section,
                message,
            } => {
                buffer.put_u16(*level)?;
                buffer.put_u16(*section)?;
                buffer.put_u32(message.len() as u32)?;
                for byte in message.bytes() {
                    buffer.put_u8(byte)?;
                }
            }
        }
        Ok(buffer)
    }

    /// Decodes the reply to a request `expected`; a reply to another request or with a shape
    /// the request does not answer with is a protocol error. `Failed` is accepted for any
    /// request.
    pub fn decode(buffer: &mut TransferBuffer, expected: RequestId, layout: &TransferLayout) -> Result<Self> {
        let tag = RequestId::try_from(buffer.get_u16()?)?;
        if tag != expected {
            return Err(Error::protocol(format!("reply to {tag:?} while waiting for {expected:?}")));
        }
        let kind = ReplyKind::try_from(buffer.get_u8()?)?;
        if kind != ReplyKind::Failed && Some(kind) != expected.reply_kind() {
            return Err(Error::protocol(format!("{kind:?} reply to {expected:?}")));
        }
        let reply = match kind {
            ReplyKind::Ack => Reply::Ack,
            ReplyKind::Count => Reply::Count(buffer.get_u32()?),
            ReplyKind::Border => {
                let window = Window::new(
                    buffer.get_u32()? as usize,
                    buffer.get_u32()? as usize,
                    buffer.get_u32()? as usize,
                );
                let seam_size = buffer.get_u16()? as usize;
                let flags = BorderFlags::try_from(buffer.get_u8()?)?;
                let source = IndexSource::try_from(buffer.get_u8()?)?;
                let layout = layout.with_source(source);
                let mut border = Border::new(&window, flags, seam_size);
                for face in flags.faces() {
                    for record in border.face_mut(face) {
                        *record = Index::decode(buffer, &layout)?;
                    }
                }
                Reply::Border { source, border }
            }
            ReplyKind::RegionClasses => {
                let count = buffer.get_u32()?;
                Reply::RegionClasses(
                    (0..count)
                        .map(|_| RegionClass::decode(buffer, layout))
                        .collect::<Result<_>>()?,
                )
            }
            ReplyKind::RegionObjects => {
                let count = buffer.get_u32()?;
                Reply::RegionObjects(
                    (0..count)
                        .map(|_| RegionObject::decode(buffer, layout))
                        .collect::<Result<_>>()?,
                )
            }
            ReplyKind::SpatialMaps => {
                let count = buffer.get_u32()?;
                let mut sections = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mut v = [0usize; 6];
                    for slot in v.iter_mut() {
                        *slot = buffer.get_u32()? as usize;
                    }
                    let window = Window {
                        col: v[0],
                        row: v[1],
                        slice: v[2],
                        ncols: v[3],
                        nrows: v[4],
                        nslices: v[5],
                    };
                    let n = window.nb_pixels();
                    let class = (0..n).map(|_| buffer.get_u32()).collect::<Result<Vec<_>>>()?;
                    let object = (0..n).map(|_| buffer.get_u32()).collect::<Result<Vec<_>>>()?;
                    let boundary = (0..n).map(|_| buffer.get_u16()).collect::<Result<Vec<_>>>()?;
                    let maps = SpatialMaps {
                        region_class_label_map: Array3D::from_slice(&class, v[3], v[4], v[5])?,
                        region_object_label_map: Array3D::from_slice(&object, v[3], v[4], v[5])?,
                        boundary_map: Array3D::from_slice(&boundary, v[3], v[4], v[5])?,
                    };
                    sections.push(PlacedMaps { window, maps });
                }
                Reply::SpatialMaps(sections)
            }
            ReplyKind::Failed => {
                let level = buffer.get_u16()?;
                let section = buffer.get_u16()?;
                let len = buffer.get_u32()?;
                let bytes = (0..len).map(|_| buffer.get_u8()).collect::<Result<Vec<_>>>()?;
                Reply::Failed {
                    level,
                    section,
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
        };
        if !buffer.is_consumed() {
            return Err(Error::protocol(format!("trailing data after {kind:?} reply")));
        }
        Ok(reply)
    }
}
