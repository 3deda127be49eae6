//! Tombstone-aware slot walk shared by the inode table and directory blocks.
//!
//! Both stores are flat arrays whose removed slots are never compacted. A
//! stored live count says how many live slots to expect; the walk visits
//! slots from position 0, counting only live ones, until that many have been
//! seen. The slot right after the last counted live slot is where a new
//! record goes.

use crate::error::{FsError, Result};
use crate::layout::Liveness;

/// Result of walking a slot array
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LiveWalk {
    /// Positions of the live slots, in order
    pub live: Vec<usize>,
    /// Slot where the next record should be written, if any
    pub append_at: Option<usize>,
    /// Number of physical slots visited
    pub scanned: usize,
}

/// Walk `capacity` slots expecting `budget` live ones.
///
/// The append slot is the one right after the budget-th live slot; when
/// that falls past `capacity`, the first tombstone seen during the walk is
/// offered instead. Running out of slots before the budget is spent, or
/// finding a live slot where the append slot should be, means the stored
/// count is wrong and is reported as corruption.
pub(crate) fn walk<F>(capacity: usize, budget: u64, mut state_at: F) -> Result<LiveWalk>
where
    F: FnMut(usize) -> Result<Liveness>,
{
    let mut live = Vec::new();
    let mut first_tombstone = None;
    let mut pos = 0;

    while (live.len() as u64) < budget {
        if pos >= capacity {
            return Err(FsError::Corrupt(format!(
                "expected {} live slots, found {} in {} slots",
                budget,
                live.len(),
                capacity
            )));
        }
        match state_at(pos)? {
            Liveness::Alive => live.push(pos),
            Liveness::Removed => {
                first_tombstone.get_or_insert(pos);
            }
        }
        pos += 1;
    }

    let append_at = if pos < capacity {
        if state_at(pos)?.is_alive() {
            return Err(FsError::Corrupt(format!(
                "slot {} is live beyond the live count {}",
                pos, budget
            )));
        }
        Some(pos)
    } else {
        if first_tombstone.is_some() {
            log::warn!("WALK: slot array exhausted, reusing tombstone {:?}", first_tombstone);
        }
        first_tombstone
    };

    Ok(LiveWalk {
        live,
        append_at,
        scanned: pos,
    })
}
