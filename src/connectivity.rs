use crate::arrays::{SpatialMaps, Window};
use crate::border::SeamStrip;
use crate::common::{split_length_to_ranges, NbConn};
use crate::index::face_index;
use crate::region::{merge_object_tables, DisjointSet, RegionObject, RelabelMap};
use log::trace;
use multiversion::multiversion;
use rayon::current_num_threads;
use rayon::prelude::*;
use static_init::dynamic;
use std::collections::BTreeMap;
use std::ptr::addr_of;

const CONN_TYPES: [NbConn; 8] = [
    NbConn::Four,
    NbConn::Eight,
    NbConn::Twelve,
    NbConn::Twenty,
    NbConn::TwentyFour,
    NbConn::Six,
    NbConn::Eighteen,
    NbConn::TwentySix,
];

fn in_neighborhood(conn: NbConn, [dc, dr, ds]: [isize; 3]) -> bool {
    let (ac, ar, a_s) = (dc.abs(), dr.abs(), ds.abs());
    let max = ac.max(ar).max(a_s);
    let l1 = ac + ar + a_s;
    if max == 0 {
        return false;
    }
    match conn {
        NbConn::Four => a_s == 0 && l1 == 1,
        NbConn::Eight => a_s == 0 && max == 1,
        NbConn::Twelve => a_s == 0 && (max == 1 || (l1 == 2 && (ac == 0 || ar == 0))),
        NbConn::Twenty => a_s == 0 && max <= 2 && !(ac == 2 && ar == 2),
        NbConn::TwentyFour => a_s == 0 && max <= 2,
        NbConn::Six => l1 == 1,
        NbConn::Eighteen => max == 1 && l1 <= 2,
        NbConn::TwentySix => max == 1,
    }
}

#[dynamic(65535)]
static NEIGHBOR_OFFSETS: [Vec<[isize; 3]>; 8] = core::array::from_fn(|i| {
    let conn = CONN_TYPES[i];
    let mut offsets = Vec::new();
    for ds in -2isize..=2 {
        for dr in -2isize..=2 {
            for dc in -2isize..=2 {
                if in_neighborhood(conn, [dc, dr, ds]) {
                    offsets.push([dc, dr, ds]);
                }
            }
        }
    }
    offsets
});

/// `(column, row, slice)` offsets of a neighbourhood.
pub fn neighbor_offsets(conn: NbConn) -> &'static [[isize; 3]] {
    // initialized before main, never written afterwards
    let tables: &'static [Vec<[isize; 3]>; 8] = unsafe { &*addr_of!(NEIGHBOR_OFFSETS) };
    let slot = CONN_TYPES.iter().position(|c| *c == conn).unwrap_or(0);
    &tables[slot]
}

#[inline(always)]
fn offset_coords(extent: &[usize; 3], coords: [usize; 3], offset: &[isize; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for dim in 0..3 {
        let v = coords[dim] as isize + offset[dim];
        if v < 0 || v >= extent[dim] as isize {
            return None;
        }
        out[dim] = v as usize;
    }
    Some(out)
}

fn window_extent(window: &Window) -> [usize; 3] {
    [window.ncols, window.nrows, window.nslices]
}

/// Calls `f(pixel, neighbour)` for every in-window neighbour pair with the same region class.
#[inline(always)]
fn for_each_same_class_pair(
    class: &[u32],
    extent: &[usize; 3],
    offsets: &[[isize; 3]],
    mut f: impl FnMut(usize, usize),
) {
    for slice in 0..extent[2] {
        for row in 0..extent[1] {
            for col in 0..extent[0] {
                let index = face_index(extent, [col, row, slice]);
                let label = class[index];
                if label == 0 {
                    continue;
                }
                for offset in offsets {
                    if let Some(q) = offset_coords(extent, [col, row, slice], offset) {
                        let neighbor = face_index(extent, q);
                        if class[neighbor] == label {
                            f(index, neighbor);
                        }
                    }
                }
            }
        }
    }
}

/// Connected-component labeling of a resident section.
///
/// Single raster scan propagating object labels to same-class neighbours; conflicting labels
/// are merged (the smaller survives). The labels are then resolved and the section rescanned
/// until a pass finds no new merge, and finally compacted to `1..=nb_objects`.
///
/// With `keep_existing` the current object labels are the starting point and only pixels
/// without an object get fresh labels, which merges objects whose classes were joined.
#[multiversion(targets = "simd")]
pub fn label_components(maps: &mut SpatialMaps, conn: NbConn, keep_existing: bool) -> u32 {
    let extent = window_extent(&maps.window());
    let offsets = neighbor_offsets(conn);
    let class = &maps.region_class_label_map.data;
    let objects = &mut maps.region_object_label_map.data;

    let mut set = if keep_existing {
        objects
            .iter_mut()
            .zip(class.iter())
            .filter(|(_, c)| **c == 0)
            .for_each(|(o, _)| *o = 0);
        // existing labels may be sparse, renumber them by rank first
        let mut existing: Vec<u32> = objects.iter().copied().filter(|o| *o != 0).collect();
        existing.sort_unstable();
        existing.dedup();
        let pairs: Vec<(u32, u32)> = existing.iter().copied().zip(1u32..).collect();
        apply_relabel(objects, &RelabelMap::from_pairs(&pairs));
        DisjointSet::new(existing.len() as u32)
    } else {
        objects.fill(0);
        DisjointSet::default()
    };

    for slice in 0..extent[2] {
        for row in 0..extent[1] {
            for col in 0..extent[0] {
                let index = face_index(&extent, [col, row, slice]);
                let label = class[index];
                if label == 0 {
                    continue;
                }
                if objects[index] == 0 {
                    objects[index] = set.push();
                }
                let mut working = objects[index];
                for offset in offsets {
                    let Some(q) = offset_coords(&extent, [col, row, slice], offset) else {
                        continue;
                    };
                    let neighbor = face_index(&extent, q);
                    if class[neighbor] != label {
                        continue;
                    }
                    match objects[neighbor] {
                        0 => objects[neighbor] = working,
                        other if other != working => {
                            set.merge(other, working);
                            working = working.min(other);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let mut pass = 0;
    loop {
        pass += 1;
        objects
            .iter_mut()
            .filter(|o| **o != 0)
            .for_each(|o| *o = set.find(*o));
        let mut new_pairs = 0usize;
        for_each_same_class_pair(class, &extent, offsets, |p, q| {
            if objects[p] != objects[q] && set.merge(objects[p], objects[q]) {
                new_pairs += 1;
            }
        });
        trace!("component pass {pass}: {new_pairs} new relabel pairs");
        if new_pairs == 0 {
            break;
        }
    }

    let map = set.compact();
    apply_relabel(objects, &map);
    map.nb_objects()
}

#[multiversion(targets = "simd")]
fn relabel_chunk(chunk: &mut [u32], map: &RelabelMap) {
    chunk.iter_mut().for_each(|label| *label = map.get(*label));
}

/// Applies a relabel map to a whole per-pixel label array.
pub fn apply_relabel(data: &mut [u32], map: &RelabelMap) {
    if data.is_empty() {
        return;
    }
    let chunk_size = data.len().div_ceil(current_num_threads()).max(1);
    data.par_chunks_mut(chunk_size)
        .for_each(|chunk| relabel_chunk(chunk, map));
}

/// Marks labeled pixels that touch a different class inside the section with `hlevel + 1`.
pub fn regular_boundary_map(maps: &mut SpatialMaps, conn: NbConn, hlevel: u16) {
    let extent = window_extent(&maps.window());
    let offsets = neighbor_offsets(conn.boundary_conn());
    let class = &maps.region_class_label_map.data;
    let boundary = &mut maps.boundary_map.data;
    for slice in 0..extent[2] {
        for row in 0..extent[1] {
            for col in 0..extent[0] {
                let index = face_index(&extent, [col, row, slice]);
                let label = class[index];
                if label == 0 {
                    continue;
                }
                let is_boundary = offsets.iter().any(|offset| {
                    offset_coords(&extent, [col, row, slice], offset)
                        .is_some_and(|q| class[face_index(&extent, q)] != label)
                });
                if is_boundary {
                    boundary[index] = boundary[index].max(hlevel.saturating_add(1));
                }
            }
        }
    }
}

/// Region object table of a resident section.
pub fn region_objects(maps: &SpatialMaps) -> Vec<RegionObject> {
    let class = &maps.region_class_label_map.data;
    let objects = &maps.region_object_label_map.data;
    let boundary = &maps.boundary_map.data;
    let ranges = split_length_to_ranges(objects.len(), current_num_threads().min(objects.len().max(1)));
    let partials: Vec<BTreeMap<u32, RegionObject>> = ranges
        .into_par_iter()
        .map(|range| {
            let mut table: BTreeMap<u32, RegionObject> = BTreeMap::new();
            for index in range {
                let label = objects[index];
                if label == 0 {
                    continue;
                }
                let object = table.entry(label).or_insert_with(|| RegionObject::new(label));
                object.region_class_label = class[index];
                object.npix += 1;
                object.boundary_npix += (boundary[index] != 0) as u32;
            }
            table
        })
        .collect();
    let mut table = BTreeMap::new();
    for partial in partials {
        merge_object_tables(&mut table, partial.into_values());
    }
    table.into_values().collect()
}

/// A resident pixel whose boundary level is raised by seam reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryUpdate {
    pub section: u16,
    pub pixel_index: u32,
    pub boundary: u16,
}

pub fn apply_boundary_updates(maps: &mut SpatialMaps, updates: &[BoundaryUpdate]) {
    for update in updates {
        let index = update.pixel_index as usize;
        if maps.region_class_label_map.data[index] != 0 {
            let value = &mut maps.boundary_map.data[index];
            *value = (*value).max(update.boundary);
        }
    }
}

/// What a seam pass does for every pair of pixels straddling the seam.
#[derive(Clone, Copy, Debug)]
pub struct StitchMode {
    /// Union the objects of same-class pairs.
    pub unions: bool,
    /// Mark different-class pairs of the boundary neighbourhood with `hlevel + 1`.
    pub boundary_hlevel: Option<u16>,
}

/// Reconciles one seam. Returns the number of unions that joined separate objects.
pub fn stitch_seam(
    strip: &SeamStrip,
    conn: NbConn,
    mode: StitchMode,
    set: &mut DisjointSet,
    updates: &mut Vec<BoundaryUpdate>,
) -> usize {
    let dim = strip.dim;
    let half = strip.extent[dim] / 2;
    let offsets = neighbor_offsets(conn);
    let boundary_offsets = neighbor_offsets(conn.boundary_conn());
    let mut unions = 0;
    for slice in 0..strip.extent[2] {
        for row in 0..strip.extent[1] {
            for col in 0..strip.extent[0] {
                let coords = [col, row, slice];
                if coords[dim] >= half {
                    continue;
                }
                let a = strip.records[face_index(&strip.extent, coords)];
                let crossing = |offset: &&[isize; 3]| offset[dim] > 0;
                if mode.unions && a.region_object_label != 0 {
                    for offset in offsets.iter().filter(crossing) {
                        let Some(q) = offset_coords(&strip.extent, coords, offset) else {
                            continue;
                        };
                        if q[dim] < half {
                            continue;
                        }
                        let b = strip.records[face_index(&strip.extent, q)];
                        if b.region_class_label == a.region_class_label
                            && b.region_object_label != 0
                            && set.merge(a.region_object_label, b.region_object_label)
                        {
                            unions += 1;
                        }
                    }
                }
                let Some(hlevel) = mode.boundary_hlevel else {
                    continue;
                };
                for offset in boundary_offsets.iter().filter(crossing) {
                    let Some(q) = offset_coords(&strip.extent, coords, offset) else {
                        continue;
                    };
                    if q[dim] < half {
                        continue;
                    }
                    let b = strip.records[face_index(&strip.extent, q)];
                    if a.region_class_label == b.region_class_label {
                        continue;
                    }
                    for record in [a, b] {
                        if record.is_labeled() {
                            updates.push(BoundaryUpdate {
                                section: record.pixel_section,
                                pixel_index: record.pixel_index,
                                boundary: hlevel.saturating_add(1),
                            });
                        }
                    }
                }
            }
        }
    }
    unions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::border::{extract_spatial_border, SeamStrip};
    use crate::index::BorderFlags;

    fn maps(labels: &[u32], ncols: usize, nrows: usize) -> SpatialMaps {
        SpatialMaps::from_class_labels(labels, ncols, nrows, 1).unwrap()
    }

    #[test]
    fn neighborhood_sizes() {
        for (conn, size) in [
            (NbConn::Four, 4),
            (NbConn::Eight, 8),
            (NbConn::Twelve, 12),
            (NbConn::Twenty, 20),
            (NbConn::TwentyFour, 24),
            (NbConn::Six, 6),
            (NbConn::Eighteen, 18),
            (NbConn::TwentySix, 26),
        ] {
            assert_eq!(neighbor_offsets(conn).len(), size, "{conn:?}");
        }
    }

    #[test]
    fn regular_labeling_is_dense_and_connected() {
        #[rustfmt::skip]
        let labels = [
            1, 1, 0, 2,
            0, 1, 0, 2,
            3, 0, 2, 2,
            3, 3, 0, 1,
        ];
        let mut m = maps(&labels, 4, 4);
        let nb = label_components(&mut m, NbConn::Four, false);
        assert_eq!(nb, 4);
        let objects = &m.region_object_label_map.data;
        assert_eq!(objects[0], objects[5]);
        assert_eq!(objects[3], objects[10]);
        assert_ne!(objects[15], objects[0]);
        assert_eq!(objects[2], 0);
        let mut used: Vec<u32> = objects.iter().copied().filter(|o| *o != 0).collect();
        used.sort();
        used.dedup();
        assert_eq!(used, vec![1, 2, 3, 4]);
    }

    #[test]
    fn diagonal_joins_with_eight_connectivity() {
        #[rustfmt::skip]
        let labels = [
            4, 0, 4,
            0, 4, 0,
            4, 0, 0,
        ];
        let mut four = maps(&labels, 3, 3);
        assert_eq!(label_components(&mut four, NbConn::Four, false), 4);
        let mut eight = maps(&labels, 3, 3);
        assert_eq!(label_components(&mut eight, NbConn::Eight, false), 1);
    }

    #[test]
    fn u_shape_needs_merge_pass() {
        #[rustfmt::skip]
        let labels = [
            7, 0, 7, 0, 7,
            7, 0, 7, 0, 7,
            7, 7, 7, 7, 7,
        ];
        let mut m = maps(&labels, 5, 3);
        assert_eq!(label_components(&mut m, NbConn::Four, false), 1);
        assert!(m
            .region_object_label_map
            .data
            .iter()
            .zip(labels.iter())
            .all(|(o, c)| (*o == 1) == (*c == 7)));
    }

    #[test]
    fn update_merges_objects_of_joined_classes() {
        let labels = [1, 1, 2, 2];
        let mut m = maps(&labels, 4, 1);
        assert_eq!(label_components(&mut m, NbConn::Four, false), 2);
        m.region_class_label_map.data.iter_mut().for_each(|c| *c = 1);
        assert_eq!(label_components(&mut m, NbConn::Four, true), 1);
        assert!(m.region_object_label_map.data.iter().all(|o| *o == 1));
    }

    #[test]
    fn update_compacts_sparse_labels() {
        let mut m = maps(&[1, 1, 0, 2], 4, 1);
        m.region_object_label_map.data.copy_from_slice(&[5, 5, 0, 17]);
        assert_eq!(label_components(&mut m, NbConn::Four, true), 2);
        assert_eq!(&m.region_object_label_map.data[..], &[1, 1, 0, 2]);
    }

    #[test]
    fn update_labels_are_dense_after_joins() {
        #[rustfmt::skip]
        let classes = [
            1, 1, 2, 2, 0, 3,
            1, 0, 0, 2, 0, 3,
            4, 4, 0, 0, 0, 3,
        ];
        let mut m = maps(&classes, 6, 3);
        #[rustfmt::skip]
        let objects = [
            40, 40, 9, 9, 0, 300,
            40, 0, 0, 9, 0, 300,
            0, 0, 0, 0, 0, 300,
        ];
        m.region_object_label_map.data.copy_from_slice(&objects);
        // join classes 1 and 2; row 2 has no objects yet
        m.region_class_label_map.data.iter_mut().filter(|c| **c == 2).for_each(|c| *c = 1);
        let nb = label_components(&mut m, NbConn::Four, true);
        assert_eq!(nb, 3);
        let labels = &m.region_object_label_map.data;
        let mut used: Vec<u32> = labels.iter().copied().filter(|o| *o != 0).collect();
        used.sort();
        used.dedup();
        assert_eq!(used, (1..=nb).collect::<Vec<_>>());
        assert_eq!(labels[0], labels[3]);
        assert_eq!(labels[12], labels[13]);
        assert_ne!(labels[12], labels[0]);
        assert_ne!(labels[5], labels[0]);
    }

    #[test]
    fn boundary_level_saturates() {
        let mut m = maps(&[1, 2], 2, 1);
        regular_boundary_map(&mut m, NbConn::Four, u16::MAX);
        assert_eq!(&m.boundary_map.data[..], &[u16::MAX, u16::MAX]);
    }

    #[test]
    fn boundary_map_marks_class_changes() {
        let labels = [1, 1, 2, 0];
        let mut m = maps(&labels, 4, 1);
        regular_boundary_map(&mut m, NbConn::Eight, 2);
        assert_eq!(&m.boundary_map.data[..], &[0, 3, 3, 0]);
    }

    /// Two 2x4 column sections; class 5 forms an L straddling the seam.
    #[test]
    fn l_shape_across_column_seam() {
        #[rustfmt::skip]
        let full = [
            5, 0, 0, 0,
            5, 0, 0, 0,
            5, 5, 5, 0,
            0, 0, 5, 5,
        ];
        let mut left = maps(&[5, 0, 5, 0, 5, 5, 0, 0], 2, 4);
        let mut right = maps(&[0, 0, 0, 0, 5, 0, 5, 5], 2, 4);
        let nb_left = label_components(&mut left, NbConn::Four, false);
        let nb_right = label_components(&mut right, NbConn::Four, false);
        assert_eq!((nb_left, nb_right), (1, 1));
        // offset the right section into its own label range
        apply_relabel(
            &mut right.region_object_label_map.data,
            &RelabelMap::from_pairs(&[(1, 1 + nb_left)]),
        );

        let flags = BorderFlags::try_from(1).unwrap();
        let borders = [
            ([0, 0, 0], extract_spatial_border(&left, 0, flags, 2)),
            ([1, 0, 0], extract_spatial_border(&right, 1, flags, 2)),
        ];
        let strip = SeamStrip::build(0, [4, 4, 1], 2, borders.iter().map(|(h, b)| (*h, b))).unwrap();
        let mut set = DisjointSet::new(nb_left + nb_right);
        let mode = StitchMode {
            unions: true,
            boundary_hlevel: None,
        };
        let mut updates = Vec::new();
        assert_eq!(stitch_seam(&strip, NbConn::Four, mode, &mut set, &mut updates), 1);
        let map = set.compact();
        assert_eq!(map.nb_objects(), 1);
        apply_relabel(&mut left.region_object_label_map.data, &map);
        apply_relabel(&mut right.region_object_label_map.data, &map);

        let mut whole = maps(&full, 4, 4);
        assert_eq!(label_components(&mut whole, NbConn::Four, false), 1);
        assert!(left.region_object_label_map.data.iter().all(|o| *o <= 1));
        assert!(right.region_object_label_map.data.iter().all(|o| *o <= 1));

        // a second pass over the reconciled pair finds nothing new
        let borders = [
            ([0, 0, 0], extract_spatial_border(&left, 0, flags, 2)),
            ([1, 0, 0], extract_spatial_border(&right, 1, flags, 2)),
        ];
        let strip = SeamStrip::build(0, [4, 4, 1], 2, borders.iter().map(|(h, b)| (*h, b))).unwrap();
        let mut set = DisjointSet::new(1);
        assert_eq!(stitch_seam(&strip, NbConn::Four, mode, &mut set, &mut updates), 0);
        assert!(set.compact().is_identity());
    }

    #[test]
    fn seam_boundary_updates_route_to_sections() {
        let left = maps(&[1, 1], 2, 1);
        let right = maps(&[2, 2], 2, 1);
        let flags = BorderFlags::try_from(1).unwrap();
        let borders = [
            ([0, 0, 0], extract_spatial_border(&left, 3, flags, 2)),
            ([1, 0, 0], extract_spatial_border(&right, 4, flags, 2)),
        ];
        let strip = SeamStrip::build(0, [4, 1, 1], 2, borders.iter().map(|(h, b)| (*h, b))).unwrap();
        let mut updates = Vec::new();
        let mode = StitchMode {
            unions: false,
            boundary_hlevel: Some(0),
        };
        stitch_seam(&strip, NbConn::Four, mode, &mut DisjointSet::default(), &mut updates);
        assert_eq!(
            updates,
            vec![
                BoundaryUpdate {
                    section: 3,
                    pixel_index: 1,
                    boundary: 1
                },
                BoundaryUpdate {
                    section: 4,
                    pixel_index: 0,
                    boundary: 1
                },
            ]
        );
    }

    #[test]
    fn seam_boundary_level_saturates() {
        let flags = BorderFlags::try_from(1).unwrap();
        let borders = [
            ([0, 0, 0], extract_spatial_border(&maps(&[1, 1], 2, 1), 0, flags, 2)),
            ([1, 0, 0], extract_spatial_border(&maps(&[2, 2], 2, 1), 1, flags, 2)),
        ];
        let strip = SeamStrip::build(0, [4, 1, 1], 2, borders.iter().map(|(h, b)| (*h, b))).unwrap();
        let mode = StitchMode {
            unions: false,
            boundary_hlevel: Some(u16::MAX),
        };
        let mut updates = Vec::new();
        stitch_seam(&strip, NbConn::Four, mode, &mut DisjointSet::default(), &mut updates);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.boundary == u16::MAX));
    }
}
