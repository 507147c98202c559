//! Border extraction from resident sections and assembly of parent borders and seams from the
//! borders of child sections.

use crate::arrays::{SpatialMaps, Window};
use crate::buffer::TransferLayout;
use crate::error::{Error, Result};
use crate::index::{face_extent, face_index, face_to_window, Border, BorderFlags, Face, Index};
use crate::pixel::PixelStore;

fn fill_border(window: &Window, flags: BorderFlags, seam_size: usize, record: impl Fn(usize) -> Index) -> Border {
    let mut border = Border::new(window, flags, seam_size);
    for face in flags.faces() {
        let dim = face.dim();
        let extent = face_extent(window, face, seam_size);
        let records = border.face_mut(face);
        for slice in 0..extent[2] {
            for row in 0..extent[1] {
                for col in 0..extent[0] {
                    let coords = [col, row, slice];
                    let mut at = coords;
                    at[dim] = face_to_window(coords[dim], window.extent(dim), seam_size);
                    records[face_index(&extent, coords)] = record(window.get_index(at[0], at[1], at[2]));
                }
            }
        }
    }
    border
}

/// Border records read from the raw pixel store. Object and boundary labels are taken from
/// `maps` when the section has them. Records have the pixel-sourced shape of `layout` and carry
/// no routing fields.
pub fn extract_pixel_border(
    pixels: &PixelStore,
    maps: Option<&SpatialMaps>,
    flags: BorderFlags,
    seam_size: usize,
    layout: &TransferLayout,
) -> Border {
    let window = Window::new(pixels.window.ncols, pixels.window.nrows, pixels.window.nslices);
    fill_border(&window, flags, seam_size, |pixel| {
        let (object, boundary) = maps.map_or((0, 0), |m| {
            (m.region_object_label_map.data[pixel], m.boundary_map.data[pixel])
        });
        let (edge_mask, edge_value) = pixels.edge_at(pixel);
        layout.pixel_record(
            Index::new(pixel as u32, 0, pixels.class_label(pixel), object, boundary).with_edge(edge_mask, edge_value),
        )
    })
}

/// Border records read from the spatial maps of a resident section.
pub fn extract_spatial_border(maps: &SpatialMaps, section: u16, flags: BorderFlags, seam_size: usize) -> Border {
    fill_border(&maps.window(), flags, seam_size, |pixel| {
        Index::new(
            pixel as u32,
            section,
            maps.region_class_label_map.data[pixel],
            maps.region_object_label_map.data[pixel],
            maps.boundary_map.data[pixel],
        )
    })
}

/// Copies the part of a child border that lies on the parent's border.
///
/// `halves` is the position of the child inside the parent, `split` the parent's split mask.
/// Along a split face dimension only the half of the child face that is on the parent's outer
/// edge is taken; the other half lies on an internal seam.
pub fn splice_child_border(parent: &mut Border, child: &Border, halves: [usize; 3], split: u8) -> Result<()> {
    if parent.seam_size != child.seam_size {
        return Err(Error::DimensionMismatch(format!(
            "child seam size {} in a parent border of {}",
            child.seam_size, parent.seam_size
        )));
    }
    let child_window = child.window();
    let half_seam = parent.seam_size / 2;
    let flags = parent.flags;
    for face in flags.faces() {
        if !child.flags.contains(face) {
            return Err(Error::protocol(format!("child border without {face:?} face")));
        }
        let dim = face.dim();
        let split_here = split & face.flag() != 0;
        let child_extent = child.extent(face);
        let parent_extent = parent.extent(face);
        let records = child.face(face);
        let target = parent.face_mut(face);
        for slice in 0..child_extent[2] {
            for row in 0..child_extent[1] {
                for col in 0..child_extent[0] {
                    let coords = [col, row, slice];
                    if split_here && (coords[dim] < half_seam) != (halves[dim] == 0) {
                        continue;
                    }
                    let mut at = coords;
                    for other in (0..3).filter(|d| *d != dim) {
                        at[other] += halves[other] * child_window.extent(other);
                    }
                    target[face_index(&parent_extent, at)] = records[face_index(&child_extent, coords)];
                }
            }
        }
    }
    Ok(())
}

/// Pixels on both sides of an internal seam of a parent section.
///
/// The strip spans the parent in every dimension except `dim`, where it is `seam_size` wide:
/// the low half holds the high-edge pixels of the children in the low half of the parent,
/// the high half the low-edge pixels of the children in the high half.
#[derive(Clone, Debug)]
pub struct SeamStrip {
    pub dim: usize,
    pub extent: [usize; 3],
    pub records: Vec<Index>,
}

impl SeamStrip {
    pub fn build<'a>(
        dim: usize,
        parent_extent: [usize; 3],
        seam_size: usize,
        children: impl IntoIterator<Item = ([usize; 3], &'a Border)>,
    ) -> Result<Self> {
        let face = Face::ALL[dim];
        let mut extent = parent_extent;
        extent[dim] = seam_size;
        let mut records = vec![Index::default(); extent.iter().product()];
        let half_seam = seam_size / 2;
        for (halves, border) in children {
            if !border.flags.contains(face) || border.seam_size != seam_size {
                return Err(Error::protocol(format!(
                    "child border does not carry a {face:?} face of size {seam_size}"
                )));
            }
            let child_window = border.window();
            let child_extent = border.extent(face);
            let face_records = border.face(face);
            for slice in 0..child_extent[2] {
                for row in 0..child_extent[1] {
                    for col in 0..child_extent[0] {
                        let coords = [col, row, slice];
                        let low = coords[dim] < half_seam;
                        let mut at = coords;
                        match (halves[dim], low) {
                            (0, false) => at[dim] = coords[dim] - half_seam,
                            (1, true) => at[dim] = coords[dim] + half_seam,
                            _ => continue,
                        }
                        for other in (0..3).filter(|d| *d != dim) {
                            at[other] += halves[other] * child_window.extent(other);
                        }
                        records[face_index(&extent, at)] = face_records[face_index(&child_extent, coords)];
                    }
                }
            }
        }
        Ok(Self { dim, extent, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;

    fn numbered_maps(ncols: usize, nrows: usize) -> SpatialMaps {
        let labels: Vec<u32> = (1..=(ncols * nrows) as u32).collect();
        SpatialMaps::from_class_labels(&labels, ncols, nrows, 1).unwrap()
    }

    #[test]
    fn spatial_border_takes_outer_pixels() {
        let maps = numbered_maps(6, 4);
        let border = extract_spatial_border(&maps, 2, BorderFlags::try_from(1).unwrap(), 4);
        let classes: Vec<u32> = border.face(Face::Column).iter().map(|i| i.region_class_label).collect();
        #[rustfmt::skip]
        let expected = vec![
            1, 2, 5, 6,
            7, 8, 11, 12,
            13, 14, 17, 18,
            19, 20, 23, 24,
        ];
        assert_eq!(classes, expected);
        assert!(border.face(Face::Column).iter().all(|i| i.pixel_section == 2));
        assert_eq!(border.face(Face::Column)[2].pixel_index, 4);
    }

    #[test]
    fn pixel_border_honours_mask() {
        let config = Config {
            ncols: 4,
            nrows: 2,
            recur_masks: vec![],
            ram_level: 0,
            mask: true,
            ..Config::default()
        };
        let mut pixels = PixelStore::new(&config, Window::new(4, 2, 1));
        pixels.region_label.iter_mut().for_each(|l| *l = 9);
        if let Some(mask) = pixels.mask.as_mut() {
            mask[4] = 0;
        }
        let layout = TransferLayout::new(&config).with_source(crate::buffer::IndexSource::Pixel);
        let border = extract_pixel_border(&pixels, None, BorderFlags::try_from(2).unwrap(), 2, &layout);
        let row_face = border.face(Face::Row);
        assert_eq!(row_face.len(), 8);
        assert_eq!(row_face[4].region_class_label, 0);
        assert_eq!(row_face[5].region_class_label, 9);
    }

    /// Splicing the borders of the four quadrants gives the border of the whole window.
    #[test]
    fn spliced_border_matches_direct_extraction() {
        let whole = numbered_maps(8, 8);
        let flags = BorderFlags::try_from(3).unwrap();
        let expected = extract_spatial_border(&whole, 0, flags, 2);
        let mut spliced = Border::new(&whole.window(), flags, 2);
        for k in 0..4usize {
            let halves = [k & 1, k >> 1, 0];
            let window = Window {
                col: halves[0] * 4,
                row: halves[1] * 4,
                ..Window::new(4, 4, 1)
            };
            let part = whole.extract_window(&window);
            let mut child = extract_spatial_border(&part, 0, flags, 2);
            // route records back to whole-image pixels for the comparison
            for face in flags.faces() {
                for record in child.face_mut(face) {
                    let (c, r, _) = part.window().get_coords(record.pixel_index as usize);
                    record.pixel_index = whole.window().get_index(c + window.col, r + window.row, 0) as u32;
                }
            }
            splice_child_border(&mut spliced, &child, halves, 3).unwrap();
        }
        assert_eq!(spliced, expected);
    }

    #[test]
    fn seam_strip_joins_facing_edges() {
        let whole = numbered_maps(4, 2);
        let flags = BorderFlags::try_from(1).unwrap();
        let left = extract_spatial_border(&whole.extract_window(&Window::new(2, 2, 1)), 0, flags, 2);
        let right = extract_spatial_border(
            &whole.extract_window(&Window {
                col: 2,
                ..Window::new(2, 2, 1)
            }),
            1,
            flags,
            2,
        );
        let strip = SeamStrip::build(0, [4, 2, 1], 2, [([0, 0, 0], &left), ([1, 0, 0], &right)]).unwrap();
        assert_eq!(strip.extent, [2, 2, 1]);
        let classes: Vec<u32> = strip.records.iter().map(|i| i.region_class_label).collect();
        assert_eq!(classes, vec![2, 3, 6, 7]);
        assert_eq!(strip.records[1].pixel_section, 1);
    }

    #[test]
    fn seam_strip_rejects_missing_face() {
        let maps = numbered_maps(2, 2);
        let border = extract_spatial_border(&maps, 0, BorderFlags::try_from(2).unwrap(), 2);
        assert!(SeamStrip::build(0, [4, 2, 1], 2, [([0, 0, 0], &border)]).is_err());
    }
}
