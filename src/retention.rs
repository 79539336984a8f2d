//! Retention policy for pruning old snapshots

use serde::{Deserialize, Serialize};

/// Default number of most recent snapshots to keep
pub const DEFAULT_KEEP: usize = 4;

/// Whether the oldest listed snapshot may be pruned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruneBoundary {
    /// Candidates start at the oldest listed snapshot
    #[default]
    IncludeOldest,
    /// The oldest listed snapshot is never pruned nor reported
    SkipOldest,
}

/// How many snapshots survive a prune, and which end gets cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep: usize,
    pub boundary: PruneBoundary,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep: DEFAULT_KEEP,
            boundary: PruneBoundary::default(),
        }
    }
}

impl RetentionPolicy {
    pub fn keep(keep: usize) -> Self {
        Self {
            keep,
            ..Self::default()
        }
    }

    pub fn with_boundary(mut self, boundary: PruneBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    /// Select the snapshots to delete from a chronological list (oldest first).
    ///
    /// The result is always a contiguous run of the oldest entries and never
    /// touches the newest `keep` snapshots.
    pub fn select_for_deletion<'a, T>(&self, chronological: &'a [T]) -> &'a [T] {
        let total = chronological.len();
        if total <= self.keep {
            return &[];
        }
        let end = total - self.keep;
        let start = match self.boundary {
            PruneBoundary::IncludeOldest => 0,
            PruneBoundary::SkipOldest => 1.min(end),
        };
        &chronological[start..end]
    }

    /// Entries to list in a report; `SkipOldest` hides the oldest one.
    pub fn reportable<'a, T>(&self, chronological: &'a [T]) -> &'a [T] {
        match self.boundary {
            PruneBoundary::IncludeOldest => chronological,
            PruneBoundary::SkipOldest => chronological.get(1..).unwrap_or(&[]),
        }
    }
}
