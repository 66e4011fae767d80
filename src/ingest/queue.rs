use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    added_at: u64,
    id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Newest first; ties broken by id so draining is deterministic
        self.added_at
            .cmp(&other.added_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending item ids plus the ids workers are rendering right now.
///
/// An id is held at most once while pending and is never handed to two
/// workers at once: pushing an id that is in flight marks it for one more
/// run once its worker finishes. Removal is lazy: the heap keeps stale
/// entries and skips them when popping.
#[derive(Debug)]
pub struct WorkQueue {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    rerun: HashMap<String, u64>,
    max_workers: usize,
}

impl WorkQueue {
    pub fn new(max_workers: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            rerun: HashMap::new(),
            max_workers: max_workers.max(1),
        }
    }

    /// Queue an id; false if it is already pending
    pub fn push(&mut self, id: &str, added_at: u64) -> bool {
        if self.in_flight.contains(id) {
            return self.rerun.insert(id.to_string(), added_at).is_none();
        }
        if !self.queued.insert(id.to_string()) {
            return false;
        }
        self.heap.push(QueueEntry {
            added_at,
            id: id.to_string(),
        });
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let rerun = self.rerun.remove(id).is_some();
        self.queued.remove(id) || rerun
    }

    /// Remove every pending id below a directory id
    pub fn remove_under(&mut self, dir_id: &str) -> usize {
        let prefix = format!("{}/", dir_id.trim_end_matches('/'));
        let before = self.len();
        self.queued.retain(|id| !id.starts_with(&prefix));
        self.rerun.retain(|id, _| !id.starts_with(&prefix));
        before - self.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.queued.contains(id) || self.rerun.contains_key(id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    /// Take the newest pending id if a worker slot is free, claiming the slot
    pub fn start_next(&mut self) -> Option<String> {
        if self.in_flight.len() >= self.max_workers {
            return None;
        }
        while let Some(entry) = self.heap.pop() {
            if self.queued.remove(&entry.id) {
                self.in_flight.insert(entry.id.clone());
                return Some(entry.id);
            }
        }
        None
    }

    /// Release the slot held for `id`; true if it went back on the queue
    pub fn finish(&mut self, id: &str) -> bool {
        if !self.in_flight.remove(id) {
            return false;
        }
        match self.rerun.remove(id) {
            Some(added_at) => self.push(id, added_at),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.rerun.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.in_flight.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.is_empty()
    }
}
