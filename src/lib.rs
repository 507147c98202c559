//! Coordination core of recursive hierarchical segmentation (RHSeg) in Rust.
//!
//! The image is split recursively into sections. Deep levels of the recursion tree are spread
//! over tasks, each task keeps its resident sections in memory (or pages them to disk) and
//! answers requests from the task above it. This crate implements the plumbing that makes the
//! split invisible to the segmentation itself: section addressing, exchange of border and seam
//! pixels, connected components stitched across section seams, out-of-core paging and the
//! worker command protocol.
//!
//! The region-growing merge logic is not part of this crate; it drives the operations below
//! through a [`worker::Job`].
//!
//! ```rust
//! use rhseg_rust::common::Config;
//! use rhseg_rust::pixel::{PixelData, PixelStore};
//! use rhseg_rust::worker::Job;
//!
//! fn main() -> rhseg_rust::error::Result<()> {
//!     // 64x64 image split twice in both directions, one task per quadrant
//!     let config = Config {
//!         ncols: 64,
//!         nrows: 64,
//!         task_level: 1,
//!         ..Config::default()
//!     };
//!     // left and right halves belong to two region classes
//!     let labels: Vec<u32> = (0..64 * 64).map(|i| if i % 64 < 32 { 1 } else { 2 }).collect();
//!     let data = PixelData::zeros(config.data_type, labels.len());
//!     let image = PixelStore::from_data(&config, data, &labels)?;
//!
//!     let mut job = Job::launch(config, &image)?;
//!     job.init_region_classes()?;
//!     assert_eq!(job.connected_components(1)?, 2);
//!     job.shutdown()
//! }
//! ```
//!
//! Requests always travel down the task tree and replies travel back up, so a task only ever
//! waits on its own children. Hot loops use `assume!` to drop bound checks in release builds,
//! so build in release mode for real images.
//!

pub mod arrays;
pub mod border;
pub mod buffer;
pub mod common;
pub mod connectivity;
pub mod error;
pub mod index;
pub mod page;
pub mod pixel;
pub mod protocol;
pub mod region;
pub mod stride;
pub mod task;
pub mod transport;
pub mod worker;

pub use common::Config;
pub use error::{Error, Result};
pub use worker::Job;
