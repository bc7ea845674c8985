//! Incremental write-order tracking for the index writer.

use super::SortedRegion;
use geopack_formats::{MAX_LEVEL, QuadtreePath};

/// Number of level slots tracked.
pub const LEVEL_SLOTS: usize = MAX_LEVEL as usize + 1;

/// Order statistics maintained on every append.
///
/// `is_preorder` holds while every path is `>=` the previous one.
/// `is_level_ordered` holds while each level's paths were written as one
/// contiguous, ordered run. Both flags only ever go from true to false.
#[derive(Debug, Clone)]
pub struct WriteOrder {
    last: Option<QuadtreePath>,
    is_preorder: bool,
    is_level_ordered: bool,
    level_regions: [SortedRegion; LEVEL_SLOTS],
}

impl Default for WriteOrder {
    fn default() -> Self {
        Self {
            last: None,
            is_preorder: true,
            is_level_ordered: true,
            level_regions: [SortedRegion::default(); LEVEL_SLOTS],
        }
    }
}

impl WriteOrder {
    /// Record that `path` was written as record number `record`.
    pub fn update(&mut self, path: QuadtreePath, record: u64) {
        if let Some(last) = self.last {
            self.is_preorder &= path >= last;
        }
        if self.is_level_ordered {
            self.update_level_ordered(path, record);
        }
        self.last = Some(path);
    }

    fn update_level_ordered(&mut self, path: QuadtreePath, record: u64) {
        let level = path.level() as usize;
        match self.last {
            Some(last) if last.level() == path.level() => {
                if path < last {
                    self.is_level_ordered = false;
                    return;
                }
            }
            _ => {
                // Switching levels: the new level must not have been seen.
                if self.level_regions[level].count != 0 {
                    self.is_level_ordered = false;
                    return;
                }
                self.level_regions[level].position = record;
            }
        }
        self.level_regions[level].count += 1;
    }

    /// Every path so far was `>=` its predecessor.
    pub const fn is_preorder(&self) -> bool {
        self.is_preorder
    }

    /// Every level so far was written as one ordered run.
    pub const fn is_level_ordered(&self) -> bool {
        self.is_level_ordered
    }

    /// Non-empty per-level regions, in level order.
    ///
    /// Positions are record numbers. Only meaningful while
    /// [`is_level_ordered`](Self::is_level_ordered) holds.
    pub fn level_regions(&self) -> Vec<SortedRegion> {
        self.level_regions
            .iter()
            .filter(|r| r.count > 0)
            .copied()
            .collect()
    }
}
