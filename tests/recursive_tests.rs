use flexi_logger::{Duplicate, Logger};
use rhseg_rust::arrays::SpatialMaps;
use rhseg_rust::common::{Config, NbConn, SPLIT_COLUMN, SPLIT_ROW, SPLIT_SLICE};
use rhseg_rust::error::Error;
use rhseg_rust::index::{BorderFlags, Face};
use rhseg_rust::pixel::{PixelData, PixelStore};
use rhseg_rust::worker::Job;
use std::collections::HashMap;
use std::sync::Once;
use tempfile::tempdir;

static LOGGING: Once = Once::new();

fn setup_logging(base_level: &str) {
    LOGGING.call_once(|| {
        let _ = Logger::try_with_env_or_str(base_level)
            .unwrap_or_else(|e| panic!("Logger initialization failed with {}", e))
            .log_to_stderr()
            .duplicate_to_stderr(Duplicate::Warn)
            .start();
    });
}

const SIZE: usize = 32;

/// Slanted bands of three classes with a sprinkling of unlabeled pixels, so objects
/// cross every seam of a 4x4 split.
fn class_labels(ncols: usize, nrows: usize, nslices: usize) -> Vec<u32> {
    (0..ncols * nrows * nslices)
        .map(|i| {
            let col = i % ncols;
            let row = (i / ncols) % nrows;
            let slice = i / (ncols * nrows);
            if i % 13 == 0 {
                0
            } else {
                ((col / 5 + row / 3 + slice / 2) % 3) as u32 + 1
            }
        })
        .collect()
}

fn config(ram_level: u16, task_level: u16) -> Config {
    Config {
        ncols: SIZE,
        nrows: SIZE,
        recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW, SPLIT_COLUMN | SPLIT_ROW],
        ram_level,
        task_level,
        ..Config::default()
    }
}

fn launch(config: Config) -> Job {
    let labels = class_labels(config.ncols, config.nrows, config.nslices);
    let data = PixelData::zeros(config.data_type, labels.len() * config.nb_bands);
    let image = PixelStore::from_data(&config, data, &labels).unwrap();
    Job::launch(config, &image).unwrap()
}

/// Segments the image and returns the object count and the gathered maps.
fn segment(config: Config) -> (u32, SpatialMaps) {
    let mut job = launch(config);
    job.init_region_classes().unwrap();
    let nb_objects = job.connected_components(0).unwrap();
    let maps = job.spatial_maps().unwrap();
    job.shutdown().unwrap();
    (nb_objects, maps)
}

/// Renumbers labels in order of first appearance; two label maps describe the same
/// partition exactly when their canonical forms are equal.
fn canonical(labels: &[u32]) -> Vec<u32> {
    let mut seen = HashMap::new();
    labels
        .iter()
        .map(|label| match label {
            0 => 0,
            label => {
                let next = seen.len() as u32 + 1;
                *seen.entry(*label).or_insert(next)
            }
        })
        .collect()
}

#[test]
fn recursive_components_match_whole_image() {
    setup_logging("warn");
    let (expected_count, expected) = segment(config(0, 0));
    let (count, maps) = segment(config(2, 2));
    assert_eq!(count, expected_count);
    assert_eq!(
        canonical(&maps.region_object_label_map.data),
        canonical(&expected.region_object_label_map.data)
    );
    assert_eq!(maps.boundary_map, expected.boundary_map);
    assert_eq!(maps.region_class_label_map, expected.region_class_label_map);
}

/// Segments the image once as a single section and once with `ram_level` and `task_level`,
/// and checks that both give the same partition.
fn assert_matches_whole_image(config: impl Fn(u16, u16) -> Config, ram_level: u16, task_level: u16) {
    let (expected_count, expected) = segment(config(0, 0));
    let (count, maps) = segment(config(ram_level, task_level));
    let conn = config(0, 0).conn_type;
    assert_eq!(count, expected_count, "{conn:?}");
    assert_eq!(
        canonical(&maps.region_object_label_map.data),
        canonical(&expected.region_object_label_map.data),
        "{conn:?}"
    );
    assert_eq!(maps.boundary_map, expected.boundary_map, "{conn:?}");
}

#[test]
fn wide_neighborhoods_match_whole_image() {
    setup_logging("warn");
    for conn_type in [NbConn::Twelve, NbConn::Twenty, NbConn::TwentyFour] {
        let config = |ram_level, task_level| Config {
            conn_type,
            seam_size: 4,
            ..config(ram_level, task_level)
        };
        assert_matches_whole_image(config, 2, 1);
    }
}

#[test]
fn three_dimensional_neighborhoods_match_whole_image() {
    setup_logging("warn");
    for conn_type in [NbConn::Six, NbConn::Eighteen, NbConn::TwentySix] {
        let config = |ram_level, task_level| Config {
            ncols: 8,
            nrows: 8,
            nslices: 8,
            recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW | SPLIT_SLICE],
            ram_level,
            task_level,
            conn_type,
            ..Config::default()
        };
        assert_matches_whole_image(config, 1, 1);
    }
}

#[test]
fn unequal_masks_per_level_match_whole_image() {
    setup_logging("warn");
    let flat = |ram_level, task_level| Config {
        recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW, SPLIT_COLUMN, SPLIT_ROW],
        ..config(ram_level, task_level)
    };
    assert_matches_whole_image(flat, 3, 2);
    let wide = |ram_level, task_level| Config {
        recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW, SPLIT_COLUMN, SPLIT_ROW],
        conn_type: NbConn::TwentyFour,
        seam_size: 4,
        ..config(ram_level, task_level)
    };
    assert_matches_whole_image(wide, 3, 1);
    let volume = |ram_level, task_level| Config {
        ncols: 8,
        nrows: 8,
        nslices: 8,
        recur_masks: vec![SPLIT_SLICE, SPLIT_COLUMN | SPLIT_ROW],
        ram_level,
        task_level,
        conn_type: NbConn::TwentySix,
        ..Config::default()
    };
    assert_matches_whole_image(volume, 2, 1);
}

#[test]
fn task_distribution_does_not_change_labels() {
    setup_logging("warn");
    let (count, single) = segment(config(2, 0));
    for task_level in [1, 2] {
        let (other_count, maps) = segment(config(2, task_level));
        assert_eq!(other_count, count);
        assert_eq!(maps, single, "task level {task_level}");
    }
}

#[test]
fn out_of_core_matches_in_memory() {
    setup_logging("warn");
    let dir = tempdir().unwrap();
    let in_memory = segment(config(1, 1));
    let paged = segment(Config {
        out_of_core: true,
        temp_dir: dir.path().to_path_buf(),
        ..config(1, 1)
    });
    assert_eq!(paged, in_memory);
}

#[test]
fn three_dimensional_recursion() {
    setup_logging("warn");
    let config = |ram_level, task_level| Config {
        ncols: 8,
        nrows: 8,
        nslices: 8,
        recur_masks: vec![SPLIT_COLUMN | SPLIT_ROW | SPLIT_SLICE],
        ram_level,
        task_level,
        conn_type: NbConn::Six,
        ..Config::default()
    };
    let (expected_count, expected) = segment(config(0, 0));
    let (count, maps) = segment(config(1, 1));
    assert_eq!(count, expected_count);
    assert_eq!(
        canonical(&maps.region_object_label_map.data),
        canonical(&expected.region_object_label_map.data)
    );
    assert_eq!(maps.boundary_map, expected.boundary_map);
}

#[test]
fn object_table_covers_labeled_pixels() {
    setup_logging("warn");
    let mut job = launch(config(2, 1));
    let classes = job.init_region_classes().unwrap();
    let labeled = class_labels(SIZE, SIZE, 1).iter().filter(|l| **l != 0).count() as u32;
    assert_eq!(classes.iter().map(|c| c.npix).sum::<u32>(), labeled);
    assert_eq!(classes.iter().map(|c| c.label).collect::<Vec<_>>(), vec![1, 2, 3]);

    let nb_objects = job.connected_components(0).unwrap();
    let objects = job.region_object_info().unwrap();
    assert_eq!(objects.len() as u32, nb_objects);
    assert_eq!(objects.iter().map(|o| o.npix).sum::<u32>(), labeled);
    assert!(objects.iter().all(|o| (1..=3).contains(&o.region_class_label)));
    job.shutdown().unwrap();
}

#[test]
fn update_keeps_objects_and_merges_joined_classes() {
    setup_logging("warn");
    let mut job = launch(config(2, 2));
    job.init_region_classes().unwrap();
    let before = job.connected_components(0).unwrap();
    assert_eq!(job.update_connected_components(0).unwrap(), before);

    // joining two classes can only merge objects
    job.relabel_region_classes(vec![(2, 1)]).unwrap();
    let after = job.update_connected_components(1).unwrap();
    assert!(after < before);
    let classes = job.region_class_info().unwrap();
    assert_eq!(classes.iter().map(|c| c.label).collect::<Vec<_>>(), vec![1, 3]);
    job.shutdown().unwrap();
}

#[test]
fn label_offset_and_relabel_reach_every_section() {
    setup_logging("warn");
    let mut job = launch(config(2, 1));
    job.init_region_classes().unwrap();
    let nb_objects = job.connected_components(0).unwrap();
    job.label_offset(100).unwrap();
    let labels: Vec<u32> = job.region_object_info().unwrap().iter().map(|o| o.label).collect();
    assert_eq!(labels, (101..=100 + nb_objects).collect::<Vec<_>>());

    let pairs: Vec<(u32, u32)> = (1..=nb_objects).map(|l| (100 + l, l)).collect();
    job.relabel_region_objects(pairs).unwrap();
    let labels: Vec<u32> = job.region_object_info().unwrap().iter().map(|o| o.label).collect();
    assert_eq!(labels, (1..=nb_objects).collect::<Vec<_>>());

    job.init_region_objects().unwrap();
    assert!(job.region_object_info().unwrap().is_empty());
    job.shutdown().unwrap();
}

#[test]
fn region_label_map_follows_class_relabel() {
    setup_logging("warn");
    let mut job = launch(config(1, 1));
    job.init_region_classes().unwrap();
    job.relabel_region_classes(vec![(3, 2)]).unwrap();
    job.update_region_label_map().unwrap();
    // re-seeding from the pixel labels now finds the relabeled classes
    let classes = job.init_region_classes().unwrap();
    assert_eq!(classes.iter().map(|c| c.label).collect::<Vec<_>>(), vec![1, 2]);
    job.shutdown().unwrap();
}

#[test]
fn boundary_map_matches_whole_image() {
    setup_logging("warn");
    let run = |config: Config| {
        let mut job = launch(config);
        job.init_region_classes().unwrap();
        job.boundary_map(4).unwrap();
        let maps = job.spatial_maps().unwrap();
        job.shutdown().unwrap();
        maps.boundary_map
    };
    let expected = run(config(0, 0));
    assert_eq!(run(config(2, 2)), expected);
    assert!(expected.data.iter().all(|b| *b == 0 || *b == 5));
}

#[test]
fn spliced_border_matches_whole_image() {
    setup_logging("warn");
    let border = |config: Config| {
        let mut job = launch(config);
        job.init_region_classes().unwrap();
        let flags = BorderFlags::try_from(SPLIT_COLUMN | SPLIT_ROW).unwrap();
        let pixel = job.border_index(flags).unwrap();
        let spatial = job.spatial_border_index(flags).unwrap();
        job.shutdown().unwrap();
        let classes = |border: &rhseg_rust::index::Border, face| {
            border.face(face).iter().map(|i| i.region_class_label).collect::<Vec<_>>()
        };
        [Face::Column, Face::Row]
            .into_iter()
            .flat_map(|face| [classes(&pixel, face), classes(&spatial, face)])
            .collect::<Vec<_>>()
    };
    assert_eq!(border(config(2, 2)), border(config(0, 0)));
}

#[test]
fn border_records_do_not_depend_on_tasks() {
    setup_logging("warn");
    let borders = |task_level| {
        let mut job = launch(config(2, task_level));
        job.init_region_classes().unwrap();
        job.connected_components(0).unwrap();
        job.boundary_map(0).unwrap();
        let flags = BorderFlags::try_from(SPLIT_COLUMN | SPLIT_ROW).unwrap();
        let pixel = job.border_index(flags).unwrap();
        let spatial = job.spatial_border_index(flags).unwrap();
        job.shutdown().unwrap();
        (pixel, spatial)
    };
    let (pixel, spatial) = borders(0);
    assert!(pixel.face(Face::Row).iter().any(|i| i.region_object_label != 0));
    assert!(pixel.face(Face::Row).iter().all(|i| i.pixel_index == 0 && i.pixel_section == 0));
    for task_level in [1, 2] {
        let (other_pixel, other_spatial) = borders(task_level);
        assert_eq!(other_pixel, pixel, "task level {task_level}");
        assert_eq!(other_spatial, spatial, "task level {task_level}");
    }
}

#[test]
fn invalid_configuration_is_rejected() {
    setup_logging("warn");
    let labels = class_labels(SIZE, SIZE, 1);
    let valid = config(2, 2);
    let data = PixelData::zeros(valid.data_type, labels.len());
    let image = PixelStore::from_data(&valid, data, &labels).unwrap();

    let three_d_conn = Config {
        conn_type: NbConn::Six,
        ..config(2, 2)
    };
    assert!(matches!(Job::launch(three_d_conn, &image), Err(Error::Config(_))));

    let tasks_below_ram = Config {
        task_level: 2,
        ..config(1, 0)
    };
    assert!(matches!(Job::launch(tasks_below_ram, &image), Err(Error::Config(_))));

    let other_size = Config {
        ncols: 16,
        ..config(1, 0)
    };
    assert!(matches!(Job::launch(other_size, &image), Err(Error::DimensionMismatch(_))));
}
