//! Downscale cache -- remembers which pictures already have downscaled copies.
//!
//! A picture buffer is downscaled (4x, and 16x / 32x when hierarchical
//! motion estimation uses them) the first time it is encoded. Later frames
//! that reference it reuse those copies. Entries are keyed by picture id and
//! tagged with the picture's content version: refilling the buffer with a new
//! source bumps the version and makes the cached copies stale.
//!
//! The cache is bounded. When full, the least-recently-used entry is evicted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use kp_common::types::{FrameNumber, ScaleFactor};

use crate::frame::{PictureId, PictureRef};

/// Statistics about cache behaviour since creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    version: u64,
    levels: Vec<ScaleFactor>,
    last_used: FrameNumber,
}

/// Bounded map from picture to the downscale levels produced for its
/// current version.
#[derive(Debug)]
pub struct DownscaleCache {
    entries: HashMap<PictureId, CacheEntry>,
    capacity: usize,
    stats: CacheStats,
}

impl DownscaleCache {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be > 0");
        Self {
            entries: HashMap::new(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Levels still missing for `picture` at its current version.
    ///
    /// An entry with a different version counts as a miss for every level.
    pub fn missing_levels(&mut self, picture: &PictureRef, wanted: &[ScaleFactor]) -> Vec<ScaleFactor> {
        let missing: Vec<ScaleFactor> = match self.entries.get(&picture.id) {
            Some(entry) if entry.version == picture.version => wanted
                .iter()
                .copied()
                .filter(|level| !entry.levels.contains(level))
                .collect(),
            _ => wanted.to_vec(),
        };
        if missing.is_empty() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        missing
    }

    /// Whether `picture` has a valid downscaled copy at `level`.
    pub fn has_level(&self, picture: &PictureRef, level: ScaleFactor) -> bool {
        self.entries
            .get(&picture.id)
            .is_some_and(|e| e.version == picture.version && e.levels.contains(&level))
    }

    /// Record that `levels` were produced for `picture` during `frame`.
    pub fn record(&mut self, picture: &PictureRef, levels: &[ScaleFactor], frame: FrameNumber) {
        if !self.entries.contains_key(&picture.id) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        let entry = self.entries.entry(picture.id).or_insert_with(|| CacheEntry {
            version: picture.version,
            levels: Vec::new(),
            last_used: frame,
        });
        if entry.version != picture.version {
            entry.version = picture.version;
            entry.levels.clear();
        }
        for level in levels {
            if !entry.levels.contains(level) {
                entry.levels.push(*level);
            }
        }
        entry.last_used = frame;
        let cached_levels = entry.levels.len();
        self.stats.entries = self.entries.len();

        debug!(
            picture = picture.id.0,
            version = picture.version,
            levels = cached_levels,
            "Recorded downscaled surfaces"
        );
    }

    /// Mark `picture` as used by `frame` (keeps referenced pictures warm).
    pub fn touch(&mut self, picture: &PictureRef, frame: FrameNumber) {
        if let Some(entry) = self.entries.get_mut(&picture.id) {
            if entry.version == picture.version {
                entry.last_used = frame;
            }
        }
    }

    /// Drop the entry for a picture (buffer released by the application).
    pub fn invalidate(&mut self, id: PictureId) {
        self.entries.remove(&id);
        self.stats.entries = self.entries.len();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    fn evict_lru(&mut self) {
        let lru = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id);
        if let Some(id) = lru {
            self.entries.remove(&id);
            self.stats.evictions += 1;
            debug!(picture = id.0, "Evicted downscale cache entry");
        }
    }
}
