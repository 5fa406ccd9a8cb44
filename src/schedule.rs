//! Min-priority schedule of model event times.
//!
//! A binary heap keyed by [`Time`] with a position map so entries can be
//! re-keyed in place. Models scheduled at infinity stay in the heap as
//! passive placeholders; they never become imminent unless rescheduled.

use std::collections::HashMap;

use crate::graph::ModelId;
use crate::time::{Time, TimeValue};

#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    key: Time<T>,
    item: ModelId,
}

/// A min-heap of `(model, next event time)` pairs.
#[derive(Debug, Default)]
pub(crate) struct Schedule<T> {
    heap: Vec<Entry<T>>,
    pos: HashMap<ModelId, usize>,
}

impl<T: TimeValue> Schedule<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Inserts `item` with key `t`, or re-keys it if already present.
    pub(crate) fn schedule(&mut self, item: ModelId, t: Time<T>) {
        if let Some(&i) = self.pos.get(&item) {
            self.heap[i].key = t;
            let i = self.sift_up(i);
            self.sift_down(i);
        } else {
            self.heap.push(Entry { key: t, item });
            self.pos.insert(item, self.heap.len() - 1);
            self.sift_up(self.heap.len() - 1);
        }
    }

    /// The smallest key, or infinity when the schedule is empty.
    pub(crate) fn min_priority(&self) -> Time<T> {
        self.heap.first().map_or_else(Time::infinity, |e| e.key)
    }

    /// Every model whose key equals the current minimum, in deterministic
    /// heap-descent order.
    pub(crate) fn visit_imminent(&self) -> Vec<ModelId> {
        let mut imminent = Vec::new();
        if let Some(min) = self.heap.first().map(|e| e.key) {
            self.collect_equal(0, min, &mut imminent);
        }
        imminent
    }

    /// The `k` models with the earliest keys, skipping passive
    /// placeholders. Ties are broken by model id so the selection is
    /// deterministic.
    pub(crate) fn batch(&self, k: usize) -> Vec<ModelId> {
        let mut candidates: Vec<(Time<T>, ModelId)> = self
            .heap
            .iter()
            .filter(|e| !e.key.is_infinite())
            .map(|e| (e.key, e.item))
            .collect();
        candidates.sort_unstable_by(|a, b| a.0.cmp_total(&b.0).then(a.1.cmp(&b.1)));
        candidates.truncate(k);
        candidates.into_iter().map(|(_, item)| item).collect()
    }

    fn collect_equal(&self, i: usize, min: Time<T>, out: &mut Vec<ModelId>) {
        if i >= self.heap.len() || self.heap[i].key != min {
            return;
        }
        out.push(self.heap[i].item);
        self.collect_equal(2 * i + 1, min, out);
        self.collect_equal(2 * i + 2, min, out);
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].key.cmp_total(&self.heap[parent].key).is_lt() {
                self.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len()
                    && self.heap[child]
                        .key
                        .cmp_total(&self.heap[smallest].key)
                        .is_lt()
                {
                    smallest = child;
                }
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].item, a);
        self.pos.insert(self.heap[b].item, b);
    }
}
