use crate::arrays::SpatialMaps;
use crate::buffer::{BufferSize, Transfer, TransferBuffer, TransferLayout};
use crate::common::split_length_to_ranges;
use crate::error::Result;
use crate::pixel::PixelStore;
use assume::assume;
use rayon::current_num_threads;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Aggregate record of a region class.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionClass {
    pub label: u32,
    pub active_flag: bool,
    pub merge_region_label: u32,
    pub npix: u32,
    pub boundary_npix: u32,
    /// Sum of every band over the pixels of the class.
    pub sum: Vec<f64>,
}

impl RegionClass {
    pub fn new(label: u32, nb_bands: usize) -> Self {
        Self {
            label,
            active_flag: true,
            merge_region_label: label,
            npix: 0,
            boundary_npix: 0,
            sum: vec![0.0; nb_bands],
        }
    }

    /// Adds the statistics of a partial record of the same class.
    pub fn accumulate(&mut self, other: &RegionClass) {
        debug_assert_eq!(self.label, other.label);
        self.npix += other.npix;
        self.boundary_npix += other.boundary_npix;
        self.sum
            .iter_mut()
            .zip(&other.sum)
            .for_each(|(a, b)| *a += *b);
    }
}

impl Transfer for RegionClass {
    fn size(layout: &TransferLayout) -> BufferSize {
        BufferSize {
            bytes: 1,
            ints: 4,
            doubles: layout.nb_bands,
            ..BufferSize::default()
        }
    }

    fn encode(&self, buffer: &mut TransferBuffer, _layout: &TransferLayout) -> Result<()> {
        buffer.put_u32(self.label)?;
        buffer.put_bool(self.active_flag)?;
        buffer.put_u32(self.merge_region_label)?;
        buffer.put_u32(self.npix)?;
        buffer.put_u32(self.boundary_npix)?;
        for value in &self.sum {
            buffer.put_f64(*value)?;
        }
        Ok(())
    }

    fn decode(buffer: &mut TransferBuffer, layout: &TransferLayout) -> Result<Self> {
        let label = buffer.get_u32()?;
        let active_flag = buffer.get_bool()?;
        let merge_region_label = buffer.get_u32()?;
        let npix = buffer.get_u32()?;
        let boundary_npix = buffer.get_u32()?;
        let sum = (0..layout.nb_bands)
            .map(|_| buffer.get_f64())
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            label,
            active_flag,
            merge_region_label,
            npix,
            boundary_npix,
            sum,
        })
    }
}

/// Connected component record.
///
/// `merge_region_label` is the union-find parent; a record is its own representative iff
/// `label == merge_region_label`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionObject {
    pub label: u32,
    pub active_flag: bool,
    pub merge_region_label: u32,
    pub region_class_label: u32,
    pub npix: u32,
    pub boundary_npix: u32,
}

impl RegionObject {
    pub fn new(label: u32) -> Self {
        Self {
            label,
            active_flag: true,
            merge_region_label: label,
            region_class_label: 0,
            npix: 0,
            boundary_npix: 0,
        }
    }

    pub fn accumulate(&mut self, other: &RegionObject) {
        debug_assert_eq!(self.label, other.label);
        if self.region_class_label == 0 {
            self.region_class_label = other.region_class_label;
        }
        self.npix += other.npix;
        self.boundary_npix += other.boundary_npix;
    }
}

impl Transfer for RegionObject {
    fn size(_layout: &TransferLayout) -> BufferSize {
        BufferSize {
            bytes: 1,
            ints: 5,
            ..BufferSize::default()
        }
    }

    fn encode(&self, buffer: &mut TransferBuffer, _layout: &TransferLayout) -> Result<()> {
        buffer.put_u32(self.label)?;
        buffer.put_bool(self.active_flag)?;
        buffer.put_u32(self.merge_region_label)?;
        buffer.put_u32(self.region_class_label)?;
        buffer.put_u32(self.npix)?;
        buffer.put_u32(self.boundary_npix)
    }

    fn decode(buffer: &mut TransferBuffer, _layout: &TransferLayout) -> Result<Self> {
        Ok(Self {
            label: buffer.get_u32()?,
            active_flag: buffer.get_bool()?,
            merge_region_label: buffer.get_u32()?,
            region_class_label: buffer.get_u32()?,
            npix: buffer.get_u32()?,
            boundary_npix: buffer.get_u32()?,
        })
    }
}

/// Merges partial class tables computed for different sections.
pub fn merge_class_tables(into: &mut BTreeMap<u32, RegionClass>, from: impl IntoIterator<Item = RegionClass>) {
    for class in from {
        match into.get_mut(&class.label) {
            Some(existing) => existing.accumulate(&class),
            None => {
                into.insert(class.label, class);
            }
        }
    }
}

pub fn merge_object_tables(into: &mut BTreeMap<u32, RegionObject>, from: impl IntoIterator<Item = RegionObject>) {
    for object in from {
        match into.get_mut(&object.label) {
            Some(existing) => existing.accumulate(&object),
            None => {
                into.insert(object.label, object);
            }
        }
    }
}

/// Region class table of a resident section: pixel counts, boundary pixel counts and band
/// sums per class of the class map.
pub fn region_classes(pixels: &PixelStore, maps: &SpatialMaps) -> Vec<RegionClass> {
    let class = &maps.region_class_label_map.data;
    let boundary = &maps.boundary_map.data;
    let nb_bands = pixels.nb_bands;
    let splits = current_num_threads().min(class.len().max(1));
    let partials: Vec<BTreeMap<u32, RegionClass>> = split_length_to_ranges(class.len(), splits)
        .into_par_iter()
        .map(|range| {
            let mut table: BTreeMap<u32, RegionClass> = BTreeMap::new();
            for index in range {
                let label = class[index];
                if label == 0 {
                    continue;
                }
                let entry = table
                    .entry(label)
                    .or_insert_with(|| RegionClass::new(label, nb_bands));
                entry.npix += 1;
                entry.boundary_npix += (boundary[index] != 0) as u32;
                for (band, sum) in entry.sum.iter_mut().enumerate() {
                    *sum += pixels.band_value(index, band);
                }
            }
            table
        })
        .collect();
    let mut table = BTreeMap::new();
    for partial in partials {
        merge_class_tables(&mut table, partial.into_values());
    }
    table.into_values().collect()
}

/// Union-find over region object labels `1..=len`.
///
/// The numerically smaller root always becomes the representative, so the representative of
/// a component is its smallest label whatever order the unions are applied in.
#[derive(Debug, Clone, Default)]
pub struct DisjointSet {
    objects: Vec<RegionObject>,
}

impl DisjointSet {
    pub fn new(nb_labels: u32) -> Self {
        Self {
            objects: (1..=nb_labels).map(RegionObject::new).collect(),
        }
    }

    /// Appends a fresh singleton and returns its label.
    pub fn push(&mut self) -> u32 {
        let label = self.objects.len() as u32 + 1;
        self.objects.push(RegionObject::new(label));
        label
    }

    pub fn len(&self) -> u32 {
        self.objects.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[RegionObject] {
        &self.objects
    }

    #[inline]
    fn parent(&self, label: u32) -> u32 {
        let slot = label as usize - 1;
        assume!(unsafe: slot < self.objects.len(), "label: {label} > {}", self.objects.len());
        self.objects[slot].merge_region_label
    }

    /// Representative of `label`, compressing the walked path to length 1.
    #[inline]
    pub fn find(&mut self, label: u32) -> u32 {
        debug_assert!(label >= 1 && label <= self.len(), "label {label} out of 1..={}", self.len());
        let mut root = label;
        let mut parent = self.parent(root);
        while parent != root {
            root = parent;
            parent = self.parent(root);
        }
        let mut node = label;
        while node != root {
            let next = self.parent(node);
            self.objects[node as usize - 1].merge_region_label = root;
            node = next;
        }
        root
    }

    /// Joins the components of `a` and `b`. Returns `true` when they were separate.
    #[inline]
    pub fn merge(&mut self, a: u32, b: u32) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }
        let (low, high) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        let absorbed = {
            let object = &mut self.objects[high as usize - 1];
            object.merge_region_label = low;
            object.active_flag = false;
            (object.npix, object.boundary_npix)
        };
        let object = &mut self.objects[low as usize - 1];
        object.npix += absorbed.0;
        object.boundary_npix += absorbed.1;
        true
    }

    /// Points every label directly at its representative.
    pub fn compress(&mut self) {
        for label in 1..=self.len() {
            self.find(label);
        }
    }

    /// Dense relabeling: representatives in increasing order become `1..=nb_objects`.
    pub fn compact(&mut self) -> RelabelMap {
        self.compress();
        let mut lut = vec![0u32; self.objects.len() + 1];
        let mut nb_objects = 0;
        for object in self.objects.iter() {
            if object.merge_region_label == object.label {
                nb_objects += 1;
                lut[object.label as usize] = nb_objects;
            } else {
                lut[object.label as usize] = lut[object.merge_region_label as usize];
            }
        }
        RelabelMap { lut, nb_objects }
    }

    /// Active objects after [`DisjointSet::compact`], renumbered by `map`.
    pub fn compacted_objects(&self, map: &RelabelMap) -> Vec<RegionObject> {
        self.objects
            .iter()
            .filter(|o| o.active_flag)
            .map(|o| RegionObject {
                label: map.get(o.label),
                merge_region_label: map.get(o.label),
                ..o.clone()
            })
            .collect()
    }
}

/// Label lookup table produced by compaction or decoded from relabel pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelabelMap {
    lut: Vec<u32>,
    nb_objects: u32,
}

impl RelabelMap {
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        let max = pairs.iter().map(|(from, _)| *from).max().unwrap_or(0);
        let mut lut: Vec<u32> = (0..=max).collect();
        for (from, to) in pairs {
            lut[*from as usize] = *to;
        }
        let nb_objects = pairs.iter().map(|(_, to)| *to).max().unwrap_or(0);
        Self { lut, nb_objects }
    }

    #[inline(always)]
    pub fn get(&self, label: u32) -> u32 {
        self.lut.get(label as usize).copied().unwrap_or(label)
    }

    pub fn nb_objects(&self) -> u32 {
        self.nb_objects
    }

    /// `(old, new)` for every label that changes.
    pub fn pairs(&self) -> Vec<(u32, u32)> {
        self.lut
            .iter()
            .enumerate()
            .filter(|(from, to)| *from as u32 != **to)
            .map(|(from, to)| (from as u32, *to))
            .collect()
    }

    /// Pairs whose old label falls in `range`.
    pub fn pairs_in(&self, range: std::ops::RangeInclusive<u32>) -> Vec<(u32, u32)> {
        self.pairs()
            .into_iter()
            .filter(|(from, _)| range.contains(from))
            .collect()
    }

    pub fn is_identity(&self) -> bool {
        self.pairs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{sized_for, IndexSource};

    #[test]
    fn smaller_label_is_representative() {
        let mut set = DisjointSet::new(6);
        assert!(set.merge(5, 3));
        assert!(set.merge(6, 5));
        assert!(!set.merge(3, 6));
        assert_eq!(set.find(6), 3);
        assert!(!set.objects()[4].active_flag);
        assert!(set.objects()[2].active_flag);
    }

    #[test]
    fn union_order_does_not_matter() {
        let unions = [(7u32, 2u32), (9, 4), (2, 9), (11, 12), (1, 12), (5, 6)];
        let mut forward = DisjointSet::new(12);
        unions.iter().for_each(|(a, b)| {
            forward.merge(*a, *b);
        });
        let mut backward = DisjointSet::new(12);
        unions.iter().rev().for_each(|(a, b)| {
            backward.merge(*b, *a);
        });
        for label in 1..=12 {
            assert_eq!(forward.find(label), backward.find(label));
        }
        assert_eq!(forward.find(9), 2);
        assert_eq!(forward.find(12), 1);
    }

    #[test]
    fn compression_flattens_paths() {
        let mut set = DisjointSet::new(64);
        for label in (2..=64).rev() {
            set.merge(label, label - 1);
        }
        set.compress();
        assert!(set.objects().iter().all(|o| o.merge_region_label == 1));
    }

    #[test]
    fn compaction_is_dense() {
        let mut set = DisjointSet::new(8);
        set.merge(2, 4);
        set.merge(8, 6);
        set.merge(6, 3);
        let map = set.compact();
        assert_eq!(map.nb_objects(), 5);
        let mut labels: Vec<u32> = (1..=8).map(|l| map.get(l)).collect();
        assert_eq!(labels, vec![1, 2, 3, 2, 4, 3, 5, 3]);
        labels.sort();
        labels.dedup();
        assert_eq!(labels, (1..=5).collect::<Vec<_>>());
        assert_eq!(set.compacted_objects(&map).len(), 5);
    }

    #[test]
    fn relabel_map_from_pairs() {
        let map = RelabelMap::from_pairs(&[(4, 2), (6, 3)]);
        assert_eq!(map.get(4), 2);
        assert_eq!(map.get(5), 5);
        assert_eq!(map.get(100), 100);
        assert_eq!(map.pairs(), vec![(4, 2), (6, 3)]);
        assert_eq!(map.pairs_in(5..=10), vec![(6, 3)]);
    }

    #[test]
    fn class_table_sums_bands() {
        let config = crate::common::Config {
            ncols: 3,
            nrows: 1,
            nb_bands: 2,
            recur_masks: vec![],
            ram_level: 0,
            ..crate::common::Config::default()
        };
        let data = crate::pixel::PixelData::U8(aligned_vec::AVec::from_slice(
            crate::arrays::ALIGN,
            &[1, 2, 3, 10, 20, 30],
        ));
        let pixels = PixelStore::from_data(&config, data, &[4, 4, 5]).unwrap();
        let mut maps = SpatialMaps::from_class_labels(&[4, 4, 5], 3, 1, 1).unwrap();
        maps.boundary_map.data[1] = 1;
        let classes = region_classes(&pixels, &maps);
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].label, 4);
        assert_eq!(classes[0].npix, 2);
        assert_eq!(classes[0].boundary_npix, 1);
        assert_eq!(classes[0].sum, vec![3.0, 30.0]);
        assert_eq!(classes[1].sum, vec![3.0, 30.0]);
    }

    #[test]
    fn region_class_transfer() {
        let layout = TransferLayout {
            object_labels: true,
            edge: false,
            nb_bands: 3,
            index_source: IndexSource::SpatialMap,
        };
        let mut class = RegionClass::new(7, 3);
        class.npix = 12;
        class.sum = vec![1.0, 2.5, -3.0];
        let mut buffer = sized_for::<RegionClass>(1, &layout, BufferSize::default());
        class.encode(&mut buffer, &layout).unwrap();
        assert_eq!(RegionClass::decode(&mut buffer, &layout).unwrap(), class);
    }
}
