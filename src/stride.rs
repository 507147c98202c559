//! Section addressing of the recursion tree.
//!
//! A section id is the id of the lowest deepest-level section in its subtree, so the children
//! of `section` at `level` are `section + k * stride` for `k < nb_sections`. The child index `k`
//! is read bitwise over the dimensions split at that level, in column, row, slice order.

use crate::arrays::Window;
use crate::common::{Config, SPLIT_COLUMN, SPLIT_ROW, SPLIT_SLICE};

const DIM_FLAGS: [u8; 3] = [SPLIT_COLUMN, SPLIT_ROW, SPLIT_SLICE];

#[derive(Debug, Clone)]
pub struct RecursionScheme {
    masks: Vec<u8>,
    nb_sections: Vec<u32>,
    /// Number of deepest-level sections under one section of a level.
    leaves_under: Vec<u32>,
    image: Window,
    task_level: u16,
    ram_level: u16,
}

impl RecursionScheme {
    pub fn new(config: &Config) -> Self {
        let mut masks = config.recur_masks.clone();
        masks.push(0);
        let nb_sections: Vec<u32> = masks.iter().map(|m| 1u32 << m.count_ones()).collect();
        let mut leaves_under = vec![1u32; masks.len() + 1];
        for level in (0..masks.len()).rev() {
            leaves_under[level] = leaves_under[level + 1] * nb_sections[level];
        }
        Self {
            masks,
            nb_sections,
            leaves_under,
            image: Window::new(config.ncols, config.nrows, config.nslices),
            task_level: config.task_level,
            ram_level: config.ram_level,
        }
    }

    pub fn nb_levels(&self) -> u16 {
        self.masks.len() as u16
    }

    pub fn ram_level(&self) -> u16 {
        self.ram_level
    }

    pub fn task_level(&self) -> u16 {
        self.task_level
    }

    /// Split mask of a level, 0 at the deepest level.
    pub fn mask(&self, level: u16) -> u8 {
        self.masks.get(level as usize).copied().unwrap_or(0)
    }

    /// `(stride, nb_sections)` of the children below a section at `level`.
    pub fn stride_sections(&self, level: u16) -> (u32, u32) {
        let level = level as usize;
        if level + 1 >= self.leaves_under.len() {
            return (1, 1);
        }
        (self.leaves_under[level + 1], self.nb_sections[level])
    }

    pub fn children(&self, level: u16, section: u16) -> impl Iterator<Item = u16> {
        let (stride, nb_sections) = self.stride_sections(level);
        (0..nb_sections).map(move |k| (section as u32 + k * stride) as u16)
    }

    /// Half (0 = low, 1 = high) occupied by child `k` along column, row and slice. Dimensions
    /// that are not split at `level` report 0.
    pub fn child_halves(&self, level: u16, k: u32) -> [usize; 3] {
        let mask = self.mask(level);
        let mut halves = [0usize; 3];
        let mut bit = 0;
        for (dim, flag) in DIM_FLAGS.iter().enumerate() {
            if mask & flag != 0 {
                halves[dim] = ((k >> bit) & 1) as usize;
                bit += 1;
            }
        }
        halves
    }

    pub fn child_window(&self, level: u16, parent: &Window, k: u32) -> Window {
        let mask = self.mask(level);
        let halves = self.child_halves(level, k);
        let mut window = *parent;
        if mask & SPLIT_COLUMN != 0 {
            window.ncols /= 2;
            window.col += halves[0] * window.ncols;
        }
        if mask & SPLIT_ROW != 0 {
            window.nrows /= 2;
            window.row += halves[1] * window.nrows;
        }
        if mask & SPLIT_SLICE != 0 {
            window.nslices /= 2;
            window.slice += halves[2] * window.nslices;
        }
        window
    }

    /// Image window of `section` at `level`.
    pub fn window(&self, level: u16, section: u16) -> Window {
        let mut window = self.image;
        let mut base: u32 = 0;
        for l in 0..level {
            let (stride, nb_sections) = self.stride_sections(l);
            let k = (section as u32 - base) / stride;
            debug_assert!(k < nb_sections, "section {section} not below level {l}");
            window = self.child_window(l, &window, k);
            base += k * stride;
        }
        window
    }

    /// Sections at `level` that contain the deepest-level section `section`.
    pub fn ancestor(&self, level: u16, section: u16) -> u16 {
        let span = self.leaves_under[level as usize];
        (section as u32 - section as u32 % span) as u16
    }

    pub fn nb_tasks(&self) -> u16 {
        (self.leaves_under[0] / self.leaves_per_task()) as u16
    }

    fn leaves_per_task(&self) -> u32 {
        self.leaves_under[self.task_level as usize]
    }

    /// Task that holds `section` in memory.
    pub fn owner(&self, section: u16) -> u16 {
        (section as u32 / self.leaves_per_task()) as u16
    }

    /// Section id of the subtree assigned to `task`.
    pub fn task_section(&self, task: u16) -> u16 {
        (task as u32 * self.leaves_per_task()) as u16
    }

    /// Shallowest level at which `task` processes its own section.
    pub fn task_top_level(&self, task: u16) -> u16 {
        let section = self.task_section(task);
        (0..=self.task_level)
            .find(|level| self.ancestor(*level, section) == section)
            .unwrap_or(self.task_level)
    }

    /// Task that sends requests to `task`, `None` for the coordinator.
    pub fn parent_task(&self, task: u16) -> Option<u16> {
        let top = self.task_top_level(task);
        if top == 0 {
            return None;
        }
        Some(self.owner(self.ancestor(top - 1, self.task_section(task))))
    }

    /// Tasks that receive requests from `task`, in the order they are addressed.
    pub fn child_tasks(&self, task: u16) -> Vec<u16> {
        let section = self.task_section(task);
        (self.task_top_level(task)..self.task_level)
            .flat_map(|level| self.children(level, section).skip(1))
            .map(|child| self.owner(child))
            .collect()
    }

    /// Resident (ram level) sections owned by `task`.
    pub fn ram_sections(&self, task: u16) -> Vec<u16> {
        let start = self.task_section(task) as u32;
        let step = self.leaves_under[self.ram_level as usize];
        (start..start + self.leaves_per_task())
            .step_by(step as usize)
            .map(|s| s as u16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::RecursionScheme;
    use crate::common::Config;

    fn config(masks: Vec<u8>, ram_level: u16, task_level: u16) -> Config {
        Config {
            ncols: 16,
            nrows: 16,
            recur_masks: masks,
            ram_level,
            task_level,
            ..Config::default()
        }
    }

    #[test]
    fn stride_and_sections() {
        let scheme = RecursionScheme::new(&config(vec![3, 1, 2], 1, 0));
        assert_eq!(scheme.stride_sections(0), (4, 4));
        assert_eq!(scheme.stride_sections(1), (2, 2));
        assert_eq!(scheme.stride_sections(2), (1, 2));
        assert_eq!(scheme.stride_sections(3), (1, 1));
        assert_eq!(scheme.children(0, 0).collect::<Vec<_>>(), vec![0, 4, 8, 12]);
        assert_eq!(scheme.children(1, 8).collect::<Vec<_>>(), vec![8, 10]);
    }

    #[test]
    fn windows_follow_child_bits() {
        let scheme = RecursionScheme::new(&config(vec![3, 1], 2, 0));
        let w = scheme.window(1, 2);
        assert_eq!((w.col, w.row, w.ncols, w.nrows), (8, 0, 8, 8));
        let w = scheme.window(1, 4);
        assert_eq!((w.col, w.row), (0, 8));
        let w = scheme.window(2, 7);
        assert_eq!((w.col, w.row, w.ncols, w.nrows), (12, 8, 4, 8));
    }

    #[test]
    fn task_tree() {
        let scheme = RecursionScheme::new(&config(vec![3, 1], 2, 2));
        assert_eq!(scheme.nb_tasks(), 8);
        assert_eq!(scheme.parent_task(0), None);
        assert_eq!(scheme.child_tasks(0), vec![2, 4, 6, 1]);
        assert_eq!(scheme.parent_task(1), Some(0));
        assert_eq!(scheme.parent_task(5), Some(4));
        assert_eq!(scheme.parent_task(4), Some(0));
        assert_eq!(scheme.child_tasks(4), vec![5]);
        assert_eq!(scheme.ram_sections(3), vec![3]);
    }

    #[test]
    fn single_task_owns_everything() {
        let scheme = RecursionScheme::new(&config(vec![3, 3], 1, 0));
        assert_eq!(scheme.nb_tasks(), 1);
        assert!(scheme.child_tasks(0).is_empty());
        assert_eq!(scheme.ram_sections(0), vec![0, 4, 8, 12]);
    }
}
