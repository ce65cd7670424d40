use std::collections::VecDeque;
use std::sync::Arc;

use crate::entry::HistoryEntry;
use crate::jobs::{Job, JobQueue};

pub const DEFAULT_MAX_CACHED: usize = 50;
pub const DEFAULT_LOOK_AHEAD: usize = 5;

/// Insertion-ordered warm set with a symmetric look-ahead window around
/// the cursor. Re-touching an entry appends it again; duplicates are
/// permitted.
pub struct LruWindow {
    entries: VecDeque<Arc<HistoryEntry>>,
    max_cached: usize,
    look_ahead: usize,
}

impl LruWindow {
    pub fn new(max_cached: usize, look_ahead: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_cached,
            look_ahead,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn touch(&mut self, entry: Arc<HistoryEntry>) {
        self.entries.push_back(entry);
    }

    // Runs after every cursor move: evicts down to the floor that leaves
    // room for the look-ahead window, then schedules warm-ups around the
    // cursor. An unsaved blob is the only copy of that backup and must
    // survive eviction.
    pub fn refresh(
        &mut self,
        history: &[Arc<HistoryEntry>],
        cursor: usize,
        queue: &JobQueue,
    ) -> crate::Result<()> {
        if history.is_empty() {
            return Ok(());
        }

        let floor = self.max_cached - self.look_ahead * 2 - 1;
        while self.entries.len() > floor {
            let Some(oldest) = self.entries.pop_front() else {
                break;
            };
            let mut state = oldest.lock()?;
            if state.saved {
                state.blob.clear();
            }
        }

        for i in 1..=self.look_ahead {
            if self.entries.len() >= self.max_cached {
                break;
            }
            if cursor >= i && !history[cursor - i].is_cached()? {
                queue.push(Job::WarmStepCache(Arc::clone(&history[cursor - i])))?;
                self.entries.push_back(Arc::clone(&history[cursor - i]));
            }
            if self.entries.len() >= self.max_cached {
                break;
            }
            if cursor + i < history.len() && !history[cursor + i].is_cached()? {
                queue.push(Job::WarmStepCache(Arc::clone(&history[cursor + i])))?;
                self.entries.push_back(Arc::clone(&history[cursor + i]));
            }
        }
        Ok(())
    }
}
