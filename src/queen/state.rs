//! Page-state table and request queues
//!
//! Both structures sit behind mutexes on the coordinator; state flips and
//! the aggregate counters are always updated together under the same lock.

use std::collections::{HashMap, VecDeque};

use crate::error::PageError;
use crate::types::{Mode, PageCounters, PageState};

/// Per-page state with incrementally maintained aggregate counters.
pub(crate) struct PageTable {
    states: Vec<PageState>,
    finished: usize,
    done: usize,
    failures: HashMap<usize, PageError>,
    /// `(received, expected_total)` for pages currently downloading
    progress: HashMap<usize, (u64, Option<u64>)>,
}

impl PageTable {
    pub(crate) fn new(total_pages: usize) -> Self {
        Self {
            states: vec![PageState::None; total_pages],
            finished: 0,
            done: 0,
            failures: HashMap::new(),
            progress: HashMap::new(),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn state(&self, index: usize) -> PageState {
        self.states.get(index).copied().unwrap_or(PageState::None)
    }

    pub(crate) fn failure(&self, index: usize) -> Option<&PageError> {
        self.failures.get(&index)
    }

    pub(crate) fn counters(&self) -> PageCounters {
        PageCounters {
            finished: self.finished,
            done: self.done,
            total: self.states.len(),
        }
    }

    /// Claim a page for a worker. Only legal from `None`.
    pub(crate) fn set_downloading(&mut self, index: usize) {
        debug_assert_eq!(self.states[index], PageState::None);
        self.states[index] = PageState::Downloading;
        self.progress.insert(index, (0, None));
    }

    pub(crate) fn set_finished(&mut self, index: usize) -> PageCounters {
        if self.states[index] != PageState::Finished {
            self.finished += 1;
            if !self.states[index].is_terminal() {
                self.done += 1;
            }
        }
        self.states[index] = PageState::Finished;
        self.failures.remove(&index);
        self.progress.remove(&index);
        self.counters()
    }

    pub(crate) fn set_failed(&mut self, index: usize, error: PageError) -> PageCounters {
        if self.states[index] == PageState::Finished {
            self.finished -= 1;
        } else if !self.states[index].is_terminal() {
            self.done += 1;
        }
        self.states[index] = PageState::Failed;
        self.failures.insert(index, error);
        self.progress.remove(&index);
        self.counters()
    }

    /// Drop a page back to `None`, unwinding its contribution to the
    /// counters. Used for explicit re-requests and evicted-page recovery.
    pub(crate) fn reset(&mut self, index: usize) {
        match self.states[index] {
            PageState::Finished => {
                self.finished -= 1;
                self.done -= 1;
            }
            PageState::Failed => {
                self.done -= 1;
            }
            PageState::None | PageState::Downloading => {}
        }
        self.states[index] = PageState::None;
        self.failures.remove(&index);
        self.progress.remove(&index);
    }

    /// Mode transition into download: drop every non-downloading page back
    /// to a clean slate and recompute the counters from a scan.
    pub(crate) fn clear_non_downloading(&mut self) {
        for state in self.states.iter_mut() {
            if *state != PageState::Downloading {
                *state = PageState::None;
            }
        }
        self.failures.clear();
        self.finished = 0;
        self.done = 0;
        self.progress
            .retain(|index, _| self.states[*index] == PageState::Downloading);
    }

    pub(crate) fn update_progress(&mut self, index: usize, received: u64, total: Option<u64>) {
        if self.states[index] == PageState::Downloading {
            self.progress.insert(index, (received, total));
        }
    }

    /// Fraction of bytes received for a downloading page; 0.0 while the
    /// expected total is unknown.
    pub(crate) fn progress_fraction(&self, index: usize) -> f32 {
        match self.progress.get(&index) {
            Some((received, Some(total))) if *total > 0 => {
                (*received as f64 / *total as f64).min(1.0) as f32
            }
            _ => 0.0,
        }
    }

    /// The next `None` page at or after `start`, for the sequential cursor.
    pub(crate) fn next_none_from(&self, start: usize) -> Option<usize> {
        (start..self.states.len()).find(|&i| self.states[i] == PageState::None)
    }

    #[cfg(test)]
    pub(crate) fn scan_counters(&self) -> PageCounters {
        let finished = self
            .states
            .iter()
            .filter(|s| **s == PageState::Finished)
            .count();
        let done = self.states.iter().filter(|s| s.is_terminal()).count();
        PageCounters {
            finished,
            done,
            total: self.states.len(),
        }
    }
}

/// The coordinator's request queues plus the sequential download cursor.
///
/// Entries are page indices; duplicates across queues are permitted because
/// the worker re-checks page state before acting.
pub(crate) struct RequestQueues {
    force: VecDeque<usize>,
    on_demand: VecDeque<usize>,
    preload: VecDeque<usize>,
    preload_window: usize,
    /// `Some(next)` while a download-all walk is active
    cursor: Option<usize>,
}

/// Where a dispatched index came from, for force semantics downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub(crate) index: usize,
    pub(crate) forced: bool,
}

impl RequestQueues {
    pub(crate) fn new(preload_window: usize) -> Self {
        Self {
            force: VecDeque::new(),
            on_demand: VecDeque::new(),
            preload: VecDeque::new(),
            preload_window,
            cursor: None,
        }
    }

    pub(crate) fn push_force(&mut self, index: usize) {
        self.force.push_back(index);
    }

    pub(crate) fn push_on_demand(&mut self, index: usize) {
        self.on_demand.push_back(index);
    }

    /// Refill the bounded preload queue, dropping the oldest entries when
    /// the window overflows.
    pub(crate) fn prime_preload(&mut self, indices: impl IntoIterator<Item = usize>) {
        for index in indices {
            self.preload.push_back(index);
        }
        while self.preload.len() > self.preload_window {
            self.preload.pop_front();
        }
    }

    pub(crate) fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub(crate) fn activate_cursor(&mut self) {
        self.cursor = Some(0);
    }

    pub(crate) fn deactivate_cursor(&mut self) {
        self.cursor = None;
    }

    /// Whether a worker waking up would find something to do.
    pub(crate) fn has_work(&self, mode: Mode) -> bool {
        !self.force.is_empty()
            || !self.on_demand.is_empty()
            || !self.preload.is_empty()
            || (mode == Mode::Download && self.cursor.is_some())
    }

    /// Next index per dispatch priority: force > on-demand > preload >
    /// sequential cursor (cursor only in download mode).
    pub(crate) fn pop(&mut self, table: &PageTable, mode: Mode) -> Option<Dispatch> {
        if let Some(index) = self.force.pop_front() {
            return Some(Dispatch {
                index,
                forced: true,
            });
        }
        if let Some(index) = self.on_demand.pop_front() {
            return Some(Dispatch {
                index,
                forced: false,
            });
        }
        if let Some(index) = self.preload.pop_front() {
            return Some(Dispatch {
                index,
                forced: false,
            });
        }
        if mode == Mode::Download {
            if let Some(start) = self.cursor {
                match table.next_none_from(start) {
                    Some(index) => {
                        self.cursor = Some(index + 1);
                        return Some(Dispatch {
                            index,
                            forced: false,
                        });
                    }
                    None => self.cursor = None,
                }
            }
        }
        None
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_every_transition() {
        let mut table = PageTable::new(4);

        table.set_downloading(0);
        table.set_finished(0);
        table.set_downloading(1);
        table.set_failed(1, PageError::RateLimited);

        assert_eq!(table.counters(), table.scan_counters());
        assert_eq!(table.counters().finished, 1);
        assert_eq!(table.counters().done, 2);

        table.reset(1);
        assert_eq!(table.counters(), table.scan_counters());
        assert_eq!(table.counters().done, 1);

        table.reset(0);
        assert_eq!(table.counters(), table.scan_counters());
        assert_eq!(table.counters().finished, 0);
    }

    #[test]
    fn done_reaches_total_only_when_every_page_is_terminal() {
        let mut table = PageTable::new(2);
        table.set_downloading(0);
        let counters = table.set_finished(0);
        assert!(counters.done < counters.total);
        table.set_downloading(1);
        let counters = table.set_failed(1, PageError::Interrupted);
        assert_eq!(counters.done, counters.total);
    }

    #[test]
    fn clear_non_downloading_spares_in_flight_pages() {
        let mut table = PageTable::new(3);
        table.set_downloading(0);
        table.set_finished(0);
        table.set_downloading(1);
        table.set_downloading(2);
        table.set_failed(2, PageError::RateLimited);

        table.clear_non_downloading();

        assert_eq!(table.state(0), PageState::None);
        assert_eq!(table.state(1), PageState::Downloading);
        assert_eq!(table.state(2), PageState::None);
        assert_eq!(table.counters().done, 0);
        assert!(table.failure(2).is_none());
    }

    #[test]
    fn progress_fraction_requires_a_known_total() {
        let mut table = PageTable::new(1);
        table.set_downloading(0);
        assert_eq!(table.progress_fraction(0), 0.0);

        table.update_progress(0, 50, Some(200));
        assert!((table.progress_fraction(0) - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn pop_respects_queue_priority() {
        let table = PageTable::new(10);
        let mut queues = RequestQueues::new(5);

        queues.prime_preload([3]);
        queues.push_on_demand(2);
        queues.push_force(1);

        assert_eq!(
            queues.pop(&table, Mode::Read),
            Some(Dispatch {
                index: 1,
                forced: true
            })
        );
        assert_eq!(
            queues.pop(&table, Mode::Read),
            Some(Dispatch {
                index: 2,
                forced: false
            })
        );
        assert_eq!(
            queues.pop(&table, Mode::Read),
            Some(Dispatch {
                index: 3,
                forced: false
            })
        );
        assert_eq!(queues.pop(&table, Mode::Read), None);
    }

    #[test]
    fn cursor_only_dispatches_in_download_mode() {
        let mut table = PageTable::new(3);
        let mut queues = RequestQueues::new(5);
        queues.activate_cursor();

        assert_eq!(queues.pop(&table, Mode::Read), None);

        table.set_downloading(0); // skipped by the cursor walk
        let dispatch = queues.pop(&table, Mode::Download).unwrap();
        assert_eq!(dispatch.index, 1);
        assert!(!dispatch.forced);
        assert_eq!(queues.pop(&table, Mode::Download).unwrap().index, 2);
        assert_eq!(queues.pop(&table, Mode::Download), None);
        assert_eq!(queues.cursor(), None, "exhausted cursor deactivates");
    }

    #[test]
    fn preload_window_drops_oldest_entries() {
        let mut queues = RequestQueues::new(2);
        queues.prime_preload([1, 2, 3]);

        let table = PageTable::new(10);
        assert_eq!(queues.pop(&table, Mode::Read).unwrap().index, 2);
        assert_eq!(queues.pop(&table, Mode::Read).unwrap().index, 3);
        assert_eq!(queues.pop(&table, Mode::Read), None);
    }
}
