//! Worker command loop and the job coordinator.
//!
//! Task 0 is the coordinator and runs in the caller's thread; every other task runs
//! [`run_worker`] on its own named thread. A worker idles on its parent link, dispatches each
//! request, and answers with a reply tagged by the request id. `Terminate` ends the loop after
//! it is forwarded to the worker's own child tasks.

use crate::arrays::SpatialMaps;
use crate::buffer::IndexSource;
use crate::common::Config;
use crate::error::{Error, Result};
use crate::index::{Border, BorderFlags};
use crate::page::Section;
use crate::pixel::PixelStore;
use crate::protocol::{Envelope, Reply};
use crate::region::{RegionClass, RegionObject};
use crate::stride::RecursionScheme;
use crate::task::TaskContext;
use crate::transport::build_network;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Serves requests from the parent task until it asks to terminate.
pub fn run_worker(mut ctx: TaskContext) -> Result<()> {
    debug!("task {} waiting for requests", ctx.id());
    loop {
        let envelope = match ctx.next_request() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                warn!("task {}: {e}", ctx.id());
                ctx.terminate_children();
                return Err(e);
            }
        };
        let Envelope {
            recur_level,
            section,
            request,
            ..
        } = envelope;
        let id = request.id();
        let reply = ctx.dispatch(recur_level, section, request).unwrap_or_else(|e| {
            warn!("task {}: {id:?} failed at level {recur_level}, section {section}: {e}", ctx.id());
            Reply::Failed {
                level: recur_level,
                section,
                message: e.to_string(),
            }
        });
        if let Err(e) = ctx.send_reply(id, &reply) {
            ctx.terminate_children();
            return Err(e);
        }
    }
    ctx.terminate_children();
    debug!("task {} done", ctx.id());
    Ok(())
}

/// A running segmentation job: the coordinator task plus the worker threads.
///
/// Every operation is addressed to the whole image, i.e. section 0 at recursion level 0.
pub struct Job {
    coordinator: TaskContext,
    workers: Vec<(u16, JoinHandle<Result<()>>)>,
}

impl Job {
    /// Validates `config`, distributes the resident sections of `image` over the tasks and
    /// starts the workers.
    pub fn launch(config: Config, image: &PixelStore) -> Result<Self> {
        config.validate()?;
        let window = image.window;
        if (window.ncols, window.nrows, window.nslices) != (config.ncols, config.nrows, config.nslices) {
            return Err(Error::DimensionMismatch(format!(
                "{}x{}x{} image for a {}x{}x{} job",
                window.ncols, window.nrows, window.nslices, config.ncols, config.nrows, config.nslices
            )));
        }
        let config = Arc::new(config);
        let scheme = RecursionScheme::new(&config);
        let mut contexts = Vec::with_capacity(scheme.nb_tasks() as usize);
        for (task, links) in (0u16..).zip(build_network(&scheme, config.reply_timeout)) {
            let sections = scheme
                .ram_sections(task)
                .into_iter()
                .map(|section| {
                    let window = scheme.window(scheme.ram_level(), section);
                    Section::new(section, image.extract_window(&window))
                })
                .collect();
            contexts.push(TaskContext::new(task, config.clone(), sections, links)?);
        }

        let mut contexts = contexts.into_iter();
        let coordinator = contexts
            .next()
            .ok_or_else(|| Error::Config("job without tasks".into()))?;
        let mut workers = Vec::new();
        for ctx in contexts {
            let task = ctx.id();
            let handle = thread::Builder::new()
                .name(format!("task-{task}"))
                .spawn(move || run_worker(ctx))
                .map_err(|e| Error::Transport(format!("failed to spawn task {task}: {e}")))?;
            workers.push((task, handle));
        }
        info!(
            "job started: {} levels, ram level {}, {} tasks{}",
            scheme.nb_levels(),
            scheme.ram_level(),
            scheme.nb_tasks(),
            if config.out_of_core { ", out of core" } else { "" }
        );
        Ok(Self { coordinator, workers })
    }

    pub fn config(&self) -> &Config {
        self.coordinator.config()
    }

    pub fn scheme(&self) -> &RecursionScheme {
        self.coordinator.scheme()
    }

    /// Seeds the class maps from the pixel region labels and returns the class table.
    pub fn init_region_classes(&mut self) -> Result<Vec<RegionClass>> {
        self.coordinator.region_class_info(0, 0, true)
    }

    pub fn region_class_info(&mut self) -> Result<Vec<RegionClass>> {
        self.coordinator.region_class_info(0, 0, false)
    }

    pub fn init_region_objects(&mut self) -> Result<()> {
        self.coordinator.init_region_objects(0, 0)
    }

    pub fn region_object_info(&mut self) -> Result<Vec<RegionObject>> {
        self.coordinator.region_object_info(0, 0)
    }

    /// Labels the connected components of the whole image from scratch.
    pub fn connected_components(&mut self, hlevel: u16) -> Result<u32> {
        self.coordinator.connected_components(0, 0, hlevel, false)
    }

    /// Relabels the connected components keeping the current object labels as seeds.
    pub fn update_connected_components(&mut self, hlevel: u16) -> Result<u32> {
        self.coordinator.connected_components(0, 0, hlevel, true)
    }

    pub fn boundary_map(&mut self, hlevel: u16) -> Result<()> {
        self.coordinator.boundary_map(0, 0, hlevel)
    }

    pub fn border_index(&mut self, flags: BorderFlags) -> Result<Border> {
        let seam_size = self.config().seam_size;
        self.coordinator
            .border_index(0, 0, flags, seam_size, IndexSource::Pixel)
    }

    pub fn spatial_border_index(&mut self, flags: BorderFlags) -> Result<Border> {
        let seam_size = self.config().seam_size;
        self.coordinator
            .border_index(0, 0, flags, seam_size, IndexSource::SpatialMap)
    }

    pub fn label_offset(&mut self, offset: u32) -> Result<()> {
        self.coordinator.label_offset(0, 0, offset)
    }

    pub fn relabel_region_classes(&mut self, pairs: Vec<(u32, u32)>) -> Result<()> {
        self.coordinator.relabel_region_classes(0, 0, pairs)
    }

    pub fn relabel_region_objects(&mut self, pairs: Vec<(u32, u32)>) -> Result<()> {
        self.coordinator.relabel_region_objects(0, 0, pairs)
    }

    pub fn update_region_label_map(&mut self) -> Result<()> {
        self.coordinator.update_region_label_map(0, 0)
    }

    /// Gathers the spatial maps of every resident section into whole-image maps.
    pub fn spatial_maps(&mut self) -> Result<SpatialMaps> {
        let config = self.coordinator.config();
        let mut whole = SpatialMaps::new(config.ncols, config.nrows, config.nslices);
        for placed in self.coordinator.collect_spatial_maps(0, 0)? {
            whole.insert_window(&placed.window, &placed.maps);
        }
        Ok(whole)
    }

    /// Terminates every worker and waits for them. Returns the first worker error.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.coordinator.terminate_children();
        let mut first_error = None;
        for (task, handle) in self.workers.drain(..) {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(Error::Transport(format!("task {task} panicked"))));
            if let Err(e) = outcome {
                warn!("task {task} ended with an error: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.stop();
        }
    }
}
