//! Per-task execution context.
//!
//! Every request is addressed to a `(level, section)` pair. At the ram level the section is
//! resident and the regular algorithms run on it; above it the request is fanned out to the
//! child sections and the results are combined. Children owned by another task are reached
//! through the task links, the others are processed in place.

use crate::border::{extract_pixel_border, extract_spatial_border, splice_child_border, SeamStrip};
use crate::buffer::{IndexSource, TransferLayout};
use crate::common::Config;
use crate::connectivity::{
    apply_boundary_updates, apply_relabel, label_components, region_objects, regular_boundary_map, stitch_seam,
    BoundaryUpdate, StitchMode,
};
use crate::error::{Error, Result};
use crate::index::{Border, BorderFlags};
use crate::page::{Section, SectionCache};
use crate::protocol::{Envelope, PlacedMaps, Reply, Request, RequestId};
use crate::region::{
    merge_class_tables, merge_object_tables, region_classes, DisjointSet, RegionClass, RegionObject, RelabelMap,
};
use crate::stride::RecursionScheme;
use crate::transport::TaskLinks;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

fn collect<T>(replies: Vec<Option<Reply>>, mut pick: impl FnMut(Reply) -> Option<T>) -> Result<Vec<T>> {
    replies
        .into_iter()
        .flatten()
        .map(|reply| {
            let kind = reply.kind();
            pick(reply).ok_or_else(|| Error::protocol(format!("unexpected {kind:?} reply")))
        })
        .collect()
}

fn expect_acks(replies: Vec<Option<Reply>>) -> Result<()> {
    collect(replies, |reply| matches!(reply, Reply::Ack).then_some(())).map(|_| ())
}

pub struct TaskContext {
    id: u16,
    config: Arc<Config>,
    scheme: RecursionScheme,
    layout: TransferLayout,
    cache: SectionCache,
    links: TaskLinks,
}

impl TaskContext {
    pub fn new(id: u16, config: Arc<Config>, sections: Vec<Section>, links: TaskLinks) -> Result<Self> {
        let cache = SectionCache::new(&config, sections)?;
        Ok(Self {
            id,
            scheme: RecursionScheme::new(&config),
            layout: TransferLayout::new(&config),
            config,
            cache,
            links,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheme(&self) -> &RecursionScheme {
        &self.scheme
    }

    /// Runs `request` on `section` at `level` and returns the reply a worker would send.
    pub fn dispatch(&mut self, level: u16, section: u16, request: Request) -> Result<Reply> {
        if level > self.scheme.ram_level() {
            return Err(Error::protocol(format!(
                "request at level {level} below the ram level {}",
                self.scheme.ram_level()
            )));
        }
        trace!("task {}: {:?} at level {level}, section {section}", self.id, request.id());
        Ok(match request {
            Request::Terminate => {
                return Err(Error::protocol("terminate is not addressed to a section"));
            }
            Request::LabelOffset { offset } => {
                self.label_offset(level, section, offset)?;
                Reply::Ack
            }
            Request::RegionClassInfo => Reply::RegionClasses(self.region_class_info(level, section, false)?),
            Request::InitRegionClasses => Reply::RegionClasses(self.region_class_info(level, section, true)?),
            Request::RegionObjectInfo => Reply::RegionObjects(self.region_object_info(level, section)?),
            Request::InitRegionObjects => {
                self.init_region_objects(level, section)?;
                Reply::Ack
            }
            Request::RelabelRegionClasses { pairs } => {
                self.relabel_region_classes(level, section, pairs)?;
                Reply::Ack
            }
            Request::RelabelRegionObjects { pairs } => {
                self.relabel_region_objects(level, section, pairs)?;
                Reply::Ack
            }
            Request::BorderIndex { flags, seam_size } => Reply::Border {
                source: IndexSource::Pixel,
                border: self.border_index(level, section, flags, seam_size as usize, IndexSource::Pixel)?,
            },
            Request::SpatialBorderIndex { flags, seam_size } => Reply::Border {
                source: IndexSource::SpatialMap,
                border: self.border_index(level, section, flags, seam_size as usize, IndexSource::SpatialMap)?,
            },
            Request::UpdateRegionLabelMap => {
                self.update_region_label_map(level, section)?;
                Reply::Ack
            }
            Request::ConnectedComponentInit { hlevel } => {
                Reply::Count(self.connected_components(level, section, hlevel, false)?)
            }
            Request::ConnectedComponentUpdate { hlevel } => {
                Reply::Count(self.connected_components(level, section, hlevel, true)?)
            }
            Request::BoundaryMap { hlevel } => {
                self.boundary_map(level, section, hlevel)?;
                Reply::Ack
            }
            Request::SeamBoundaryUpdate { updates } => {
                self.seam_boundary_update(level, section, updates)?;
                Reply::Ack
            }
            Request::CollectSpatialMaps => Reply::SpatialMaps(self.collect_spatial_maps(level, section)?),
        })
    }

    fn is_resident_level(&self, level: u16) -> bool {
        level >= self.scheme.ram_level()
    }

    /// Sends the requests built by `make` to the children of `section`: the ones owned by
    /// other tasks first, then processes the own children, then receives the remote replies
    /// in child order. Children for which `make` returns `None` are skipped.
    fn fan_out(
        &mut self,
        level: u16,
        section: u16,
        mut make: impl FnMut(usize, u16) -> Option<Request>,
    ) -> Result<Vec<Option<Reply>>> {
        let child_level = level + 1;
        let children: Vec<u16> = self.scheme.children(level, section).collect();
        let mut local = Vec::new();
        let mut pending = Vec::new();
        for (k, child) in children.iter().copied().enumerate() {
            let Some(request) = make(k, child) else {
                continue;
            };
            let owner = self.scheme.owner(child);
            if owner == self.id {
                local.push((k, child, request));
                continue;
            }
            let id = request.id();
            let envelope = Envelope {
                calling_task: self.id,
                recur_level: child_level,
                section: child,
                request,
            };
            let link = self
                .links
                .children
                .get(&owner)
                .ok_or_else(|| Error::Transport(format!("task {} has no link to task {owner}", self.id)))?;
            link.send(envelope.encode()?)?;
            pending.push((k, owner, id));
        }

        let mut replies: Vec<Option<Reply>> = vec![None; children.len()];
        let mut first_error = None;
        for (k, child, request) in local {
            match self.dispatch(child_level, child, request) {
                Ok(reply) => replies[k] = Some(reply),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        for (k, owner, id) in pending {
            match self.receive(owner, id) {
                Ok(Reply::Failed {
                    level,
                    section,
                    message,
                }) => {
                    first_error.get_or_insert(Error::Remote {
                        task: owner,
                        level,
                        section,
                        message,
                    });
                }
                Ok(reply) => replies[k] = Some(reply),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }

    fn receive(&self, owner: u16, id: RequestId) -> Result<Reply> {
        let link = self
            .links
            .children
            .get(&owner)
            .ok_or_else(|| Error::Transport(format!("task {} has no link to task {owner}", self.id)))?;
        let mut buffer = link.recv()?;
        Reply::decode(&mut buffer, id, &self.layout)
    }

    /// Runs `f` on the resident section, or broadcasts `request` to the children.
    fn apply(
        &mut self,
        level: u16,
        section: u16,
        request: Request,
        f: impl FnOnce(&mut Section) -> Result<()>,
    ) -> Result<()> {
        if self.is_resident_level(level) {
            return self.cache.with_section(section, f);
        }
        let replies = self.fan_out(level, section, |_, _| Some(request.clone()))?;
        expect_acks(replies)
    }

    pub fn label_offset(&mut self, level: u16, section: u16, offset: u32) -> Result<()> {
        self.apply(level, section, Request::LabelOffset { offset }, |s| {
            s.maps
                .region_object_label_map
                .data
                .iter_mut()
                .filter(|o| **o != 0)
                .for_each(|o| *o += offset);
            Ok(())
        })
    }

    /// Class table of the subtree. With `init` the class maps are first seeded from the
    /// region labels of the pixel stores.
    pub fn region_class_info(&mut self, level: u16, section: u16, init: bool) -> Result<Vec<RegionClass>> {
        if self.is_resident_level(level) {
            return self.cache.with_section(section, |s| {
                if init {
                    for (index, class) in s.maps.region_class_label_map.data.iter_mut().enumerate() {
                        *class = s.pixels.class_label(index);
                    }
                }
                Ok(region_classes(&s.pixels, &s.maps))
            });
        }
        let request = if init {
            Request::InitRegionClasses
        } else {
            Request::RegionClassInfo
        };
        let replies = self.fan_out(level, section, |_, _| Some(request.clone()))?;
        let mut table = BTreeMap::new();
        for classes in collect(replies, |reply| match reply {
            Reply::RegionClasses(classes) => Some(classes),
            _ => None,
        })? {
            merge_class_tables(&mut table, classes);
        }
        Ok(table.into_values().collect())
    }

    pub fn region_object_info(&mut self, level: u16, section: u16) -> Result<Vec<RegionObject>> {
        if self.is_resident_level(level) {
            return self.cache.with_section(section, |s| Ok(region_objects(&s.maps)));
        }
        let replies = self.fan_out(level, section, |_, _| Some(Request::RegionObjectInfo))?;
        let mut table = BTreeMap::new();
        for objects in collect(replies, |reply| match reply {
            Reply::RegionObjects(objects) => Some(objects),
            _ => None,
        })? {
            merge_object_tables(&mut table, objects);
        }
        Ok(table.into_values().collect())
    }

    pub fn init_region_objects(&mut self, level: u16, section: u16) -> Result<()> {
        self.apply(level, section, Request::InitRegionObjects, |s| {
            s.maps.region_object_label_map.data.fill(0);
            s.maps.boundary_map.data.fill(0);
            Ok(())
        })
    }

    pub fn relabel_region_classes(&mut self, level: u16, section: u16, pairs: Vec<(u32, u32)>) -> Result<()> {
        let map = RelabelMap::from_pairs(&pairs);
        self.apply(level, section, Request::RelabelRegionClasses { pairs }, |s| {
            apply_relabel(&mut s.maps.region_class_label_map.data, &map);
            Ok(())
        })
    }

    pub fn relabel_region_objects(&mut self, level: u16, section: u16, pairs: Vec<(u32, u32)>) -> Result<()> {
        let map = RelabelMap::from_pairs(&pairs);
        self.apply(level, section, Request::RelabelRegionObjects { pairs }, |s| {
            apply_relabel(&mut s.maps.region_object_label_map.data, &map);
            Ok(())
        })
    }

    /// Writes the class map back into the region labels of the pixel stores.
    pub fn update_region_label_map(&mut self, level: u16, section: u16) -> Result<()> {
        self.apply(level, section, Request::UpdateRegionLabelMap, |s| {
            for (index, class) in s.maps.region_class_label_map.data.iter().enumerate() {
                if s.pixels.is_valid(index) {
                    s.pixels.region_label[index] = *class;
                }
            }
            Ok(())
        })
    }

    pub fn border_index(
        &mut self,
        level: u16,
        section: u16,
        flags: BorderFlags,
        seam_size: usize,
        source: IndexSource,
    ) -> Result<Border> {
        if seam_size == 0 || seam_size % 2 != 0 {
            return Err(Error::protocol(format!("seam size {seam_size} is not a positive even number")));
        }
        if self.is_resident_level(level) {
            let layout = self.layout.with_source(source);
            return self.cache.with_section(section, |s| {
                let window = s.maps.window();
                if let Some(face) = flags.faces().find(|f| window.extent(f.dim()) < seam_size) {
                    return Err(Error::DimensionMismatch(format!(
                        "section {section} is narrower than the seam size {seam_size} across the {face:?} face"
                    )));
                }
                Ok(match source {
                    IndexSource::Pixel => extract_pixel_border(&s.pixels, Some(&s.maps), flags, seam_size, &layout),
                    IndexSource::SpatialMap => extract_spatial_border(&s.maps, section, flags, seam_size),
                })
            });
        }
        let request = match source {
            IndexSource::Pixel => Request::BorderIndex {
                flags,
                seam_size: seam_size as u16,
            },
            IndexSource::SpatialMap => Request::SpatialBorderIndex {
                flags,
                seam_size: seam_size as u16,
            },
        };
        let replies = self.fan_out(level, section, |_, _| Some(request.clone()))?;
        let children = collect(replies, |reply| match reply {
            Reply::Border { border, .. } => Some(border),
            _ => None,
        })?;
        let mut border = Border::new(&self.scheme.window(level, section), flags, seam_size);
        let split = self.scheme.mask(level);
        for (k, child) in children.iter().enumerate() {
            splice_child_border(&mut border, child, self.scheme.child_halves(level, k as u32), split)?;
        }
        Ok(border)
    }

    /// Reconciles the seams between the children of `section`: fetches their spatial-map
    /// borders across the split faces and runs one seam pass per split dimension.
    fn stitch(&mut self, level: u16, section: u16, mode: StitchMode, set: &mut DisjointSet) -> Result<Vec<BoundaryUpdate>> {
        let mask = self.scheme.mask(level);
        if mask == 0 {
            return Ok(Vec::new());
        }
        let flags = BorderFlags::try_from(mask)?;
        let seam_size = self.config.seam_size;
        let replies = self.fan_out(level, section, |_, _| {
            Some(Request::SpatialBorderIndex {
                flags,
                seam_size: seam_size as u16,
            })
        })?;
        let borders = collect(replies, |reply| match reply {
            Reply::Border { border, .. } => Some(border),
            _ => None,
        })?;
        let halves: Vec<[usize; 3]> = (0..borders.len())
            .map(|k| self.scheme.child_halves(level, k as u32))
            .collect();
        let window = self.scheme.window(level, section);
        let extent = [window.ncols, window.nrows, window.nslices];
        let mut updates = Vec::new();
        for face in flags.faces() {
            let strip = SeamStrip::build(face.dim(), extent, seam_size, halves.iter().copied().zip(borders.iter()))?;
            let unions = stitch_seam(&strip, self.config.conn_type, mode, set, &mut updates);
            trace!("level {level}, section {section}: {unions} unions across the {face:?} seam");
        }
        Ok(updates)
    }

    /// Sends boundary updates down to the children holding the pixels.
    fn route_boundary_updates(&mut self, level: u16, section: u16, updates: Vec<BoundaryUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut groups: BTreeMap<u16, Vec<BoundaryUpdate>> = BTreeMap::new();
        for update in updates {
            let child = self.scheme.ancestor(level + 1, update.section);
            groups.entry(child).or_default().push(update);
        }
        let replies = self.fan_out(level, section, |_, child| {
            groups
                .remove(&child)
                .map(|updates| Request::SeamBoundaryUpdate { updates })
        })?;
        expect_acks(replies)
    }

    pub fn seam_boundary_update(&mut self, level: u16, section: u16, updates: Vec<BoundaryUpdate>) -> Result<()> {
        if !self.is_resident_level(level) {
            return self.route_boundary_updates(level, section, updates);
        }
        if let Some(stray) = updates.iter().find(|u| u.section != section) {
            return Err(Error::protocol(format!(
                "boundary update for section {} delivered to section {section}",
                stray.section
            )));
        }
        self.cache.with_section(section, |s| {
            let nb_pixels = s.maps.nb_pixels();
            if let Some(stray) = updates.iter().find(|u| u.pixel_index as usize >= nb_pixels) {
                return Err(Error::protocol(format!(
                    "boundary update for pixel {} of section {section} with {nb_pixels} pixels",
                    stray.pixel_index
                )));
            }
            apply_boundary_updates(&mut s.maps, &updates);
            Ok(())
        })
    }

    /// Labels the connected components of the subtree and returns their number. With
    /// `update` the existing object labels are kept as the starting point.
    ///
    /// Above the ram level the children are labeled first and shifted into disjoint label
    /// ranges, then the seams are stitched, the union-find is compacted and every child gets
    /// the relabel pairs of its own range.
    pub fn connected_components(&mut self, level: u16, section: u16, hlevel: u16, update: bool) -> Result<u32> {
        let conn = self.config.conn_type;
        if self.is_resident_level(level) {
            return self.cache.with_section(section, |s| {
                let nb_objects = label_components(&mut s.maps, conn, update);
                regular_boundary_map(&mut s.maps, conn, hlevel);
                Ok(nb_objects)
            });
        }
        let request = if update {
            Request::ConnectedComponentUpdate { hlevel }
        } else {
            Request::ConnectedComponentInit { hlevel }
        };
        let replies = self.fan_out(level, section, |_, _| Some(request.clone()))?;
        let counts = collect(replies, |reply| match reply {
            Reply::Count(count) => Some(count),
            _ => None,
        })?;
        let mut offsets = Vec::with_capacity(counts.len());
        let mut total = 0u32;
        for count in &counts {
            offsets.push(total);
            total += count;
        }

        let replies = self.fan_out(level, section, |k, _| {
            (offsets[k] > 0 && counts[k] > 0).then(|| Request::LabelOffset { offset: offsets[k] })
        })?;
        expect_acks(replies)?;

        let mut set = DisjointSet::new(total);
        let mode = StitchMode {
            unions: true,
            boundary_hlevel: Some(hlevel),
        };
        let updates = self.stitch(level, section, mode, &mut set)?;
        self.route_boundary_updates(level, section, updates)?;

        let map = set.compact();
        let replies = self.fan_out(level, section, |k, _| {
            let pairs = map.pairs_in(offsets[k] + 1..=offsets[k] + counts[k]);
            (!pairs.is_empty()).then_some(Request::RelabelRegionObjects { pairs })
        })?;
        expect_acks(replies)?;
        debug!(
            "level {level}, section {section}: {total} child objects reconciled into {}",
            map.nb_objects()
        );
        Ok(map.nb_objects())
    }

    pub fn boundary_map(&mut self, level: u16, section: u16, hlevel: u16) -> Result<()> {
        if self.is_resident_level(level) {
            let conn = self.config.conn_type;
            return self.cache.with_section(section, |s| {
                regular_boundary_map(&mut s.maps, conn, hlevel);
                Ok(())
            });
        }
        let replies = self.fan_out(level, section, |_, _| Some(Request::BoundaryMap { hlevel }))?;
        expect_acks(replies)?;
        let mode = StitchMode {
            unions: false,
            boundary_hlevel: Some(hlevel),
        };
        let updates = self.stitch(level, section, mode, &mut DisjointSet::default())?;
        self.route_boundary_updates(level, section, updates)
    }

    pub fn collect_spatial_maps(&mut self, level: u16, section: u16) -> Result<Vec<PlacedMaps>> {
        if self.is_resident_level(level) {
            return self.cache.with_section(section, |s| {
                Ok(vec![PlacedMaps {
                    window: s.pixels.window,
                    maps: s.maps.clone(),
                }])
            });
        }
        let replies = self.fan_out(level, section, |_, _| Some(Request::CollectSpatialMaps))?;
        Ok(collect(replies, |reply| match reply {
            Reply::SpatialMaps(maps) => Some(maps),
            _ => None,
        })?
        .into_iter()
        .flatten()
        .collect())
    }

    /// Next request from the parent task, `None` once it asked to terminate.
    pub fn next_request(&self) -> Result<Option<Envelope>> {
        let parent = self
            .links
            .parent
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("task {} has no parent", self.id)))?;
        let mut buffer = parent.recv_request()?;
        let envelope = Envelope::decode(&mut buffer)?;
        if envelope.calling_task != parent.peer() {
            return Err(Error::Transport(format!(
                "request from task {} while task {} is the caller",
                envelope.calling_task,
                parent.peer()
            )));
        }
        Ok((envelope.request != Request::Terminate).then_some(envelope))
    }

    pub fn send_reply(&self, answering: RequestId, reply: &Reply) -> Result<()> {
        let parent = self
            .links
            .parent
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("task {} has no parent", self.id)))?;
        parent.send(reply.encode(answering, &self.layout)?)
    }

    /// Forwards termination to every child task.
    pub fn terminate_children(&self) {
        for (task, link) in &self.links.children {
            let envelope = Envelope {
                calling_task: self.id,
                recur_level: 0,
                section: self.scheme.task_section(*task),
                request: Request::Terminate,
            };
            if let Err(e) = envelope.encode().and_then(|buffer| link.send(buffer)) {
                warn!("task {}: could not terminate task {task}: {e}", self.id);
            }
        }
    }
}
