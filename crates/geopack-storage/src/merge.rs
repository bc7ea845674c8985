//! K-way streaming merge of ordered sources.
//!
//! A [`Merge`] owns any number of [`MergeSource`]s, each producing a
//! non-decreasing sequence, and yields one globally ordered sequence.
//! Sources live in a manual min-heap keyed by their current value with
//! ties broken by source id, so equal values come out in the order their
//! sources were added.
//!
//! `Merge` is itself a `MergeSource`, so merges nest: many small per-level
//! or per-shard merges can feed one top-level merge. A nested merge that
//! was not started is started when it is added.
//!
//! A merge is a single-consumer pull iterator. Sources may be backed by
//! work done on other threads, but one `Merge` must not be driven from
//! more than one thread at a time.

use crate::{Result, StorageError};
use std::fmt;
use tracing::{debug, warn};

/// An ordered, forward-only stream that can be merged.
pub trait MergeSource<T> {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "source"
    }

    /// Called once when the source is added to a merge, before the first
    /// [`peek`](Self::peek).
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Current value, or `None` once the source is exhausted.
    fn peek(&self) -> Option<&T>;

    /// Move past the current value. Returns whether a value remains.
    fn advance(&mut self) -> Result<bool>;

    /// Release any resources held by the source.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A boxed source owned by a merge.
pub type BoxedSource<T> = Box<dyn MergeSource<T> + Send>;

/// Source over an in-memory vector.
///
/// The vector must already be sorted.
pub struct VecSource<T> {
    name: String,
    values: std::vec::IntoIter<T>,
    current: Option<T>,
}

impl<T> VecSource<T> {
    /// Create a source over `values`.
    pub fn new(name: impl Into<String>, values: Vec<T>) -> Self {
        let mut values = values.into_iter();
        let current = values.next();
        Self {
            name: name.into(),
            values,
            current,
        }
    }
}

impl<T> MergeSource<T> for VecSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn peek(&self) -> Option<&T> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<bool> {
        self.current = self.values.next();
        Ok(self.current.is_some())
    }
}

/// K-way merge over owned sources.
pub struct Merge<T> {
    name: String,
    /// Sources indexed by source id; `None` once exhausted or closed
    sources: Vec<Option<BoxedSource<T>>>,
    /// Min-heap of live source ids
    heap: Vec<usize>,
    started: bool,
}

impl<T: Ord> Merge<T> {
    /// Create an empty merge.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            heap: Vec::new(),
            started: false,
        }
    }

    /// Merge name used in diagnostics.
    pub fn merge_name(&self) -> &str {
        &self.name
    }

    /// Take ownership of `source` and return its source id.
    ///
    /// Before [`start`](Self::start) any source is accepted. Afterwards the
    /// source's first value must strictly follow [`current`](Self::current).
    /// Empty sources are closed immediately but still consume an id, so ids
    /// always match the order sources were added in.
    pub fn add_source<S>(&mut self, source: S) -> Result<usize>
    where
        S: MergeSource<T> + Send + 'static,
    {
        self.add_boxed(Box::new(source))
    }

    /// Boxed form of [`add_source`](Self::add_source).
    pub fn add_boxed(&mut self, mut source: BoxedSource<T>) -> Result<usize> {
        source.prepare()?;
        let Some(first) = source.peek() else {
            debug!("Merge {}: source {} is empty", self.name, source.name());
            source.close()?;
            let id = self.sources.len();
            self.sources.push(None);
            return Ok(id);
        };

        if self.started {
            let Some(&top) = self.heap.first() else {
                return Err(StorageError::NotActive(self.name.clone()));
            };
            let follows = self.sources[top]
                .as_ref()
                .and_then(|s| s.peek())
                .is_some_and(|current| first > current);
            if !follows {
                return Err(StorageError::OutOfOrderSource {
                    merge: self.name.clone(),
                    name: source.name().to_string(),
                });
            }
        }

        let id = self.sources.len();
        self.sources.push(Some(source));
        if self.started {
            self.heap_push(id);
        }
        Ok(id)
    }

    /// Arm the merge. Fails if no sources were added or it already started.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(StorageError::AlreadyStarted(self.name.clone()));
        }
        if self.sources.is_empty() {
            return Err(StorageError::NoSources(self.name.clone()));
        }

        self.heap = (0..self.sources.len())
            .filter(|&id| self.sources[id].is_some())
            .collect();
        if self.heap.len() > 1 {
            let last_internal = (self.heap.len() / 2).saturating_sub(1);
            for i in (0..=last_internal).rev() {
                self.sift_down(i);
            }
        }
        self.started = true;
        debug!(
            "Merge {} started with {} live sources",
            self.name,
            self.heap.len()
        );
        Ok(())
    }

    /// Smallest value not yet consumed.
    pub fn current(&self) -> Result<&T> {
        self.top()
            .and_then(|id| self.peek_source(id))
            .ok_or_else(|| StorageError::NotActive(self.name.clone()))
    }

    /// Id of the source that produced [`current`](Self::current).
    pub fn current_source_id(&self) -> Result<usize> {
        self.top()
            .ok_or_else(|| StorageError::NotActive(self.name.clone()))
    }

    /// Name of the source that produced [`current`](Self::current).
    pub fn current_name(&self) -> Result<&str> {
        self.top()
            .and_then(|id| self.sources[id].as_deref())
            .map(|s| s.name())
            .ok_or_else(|| StorageError::NotActive(self.name.clone()))
    }

    /// Retire the current value. Returns whether any source remains live.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(id) = self.top() else {
            return Err(StorageError::NotActive(self.name.clone()));
        };

        let more = match self.sources[id].as_mut() {
            Some(source) => source.advance()?,
            None => false,
        };

        if more {
            self.sift_down(0);
        } else {
            if let Some(mut source) = self.sources[id].take() {
                source.close()?;
            }
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
            if !self.heap.is_empty() {
                self.sift_down(0);
            }
        }
        Ok(!self.heap.is_empty())
    }

    /// Started and every source exhausted.
    pub fn is_finished(&self) -> bool {
        self.started && self.heap.is_empty()
    }

    /// Started with at least one live source.
    pub fn is_active(&self) -> bool {
        self.started && !self.heap.is_empty()
    }

    /// Number of sources added so far, including exhausted ones.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Close every remaining source.
    ///
    /// Closing before the merge is finished is allowed but logged.
    pub fn close(&mut self) -> Result<()> {
        let live = self.sources.iter().filter(|s| s.is_some()).count();
        if live > 0 {
            warn!("Merge {} closed with {} open sources", self.name, live);
        }
        self.heap.clear();
        let mut first_error = None;
        for slot in &mut self.sources {
            if let Some(mut source) = slot.take()
                && let Err(e) = source.close()
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn top(&self) -> Option<usize> {
        if self.started {
            self.heap.first().copied()
        } else {
            None
        }
    }

    fn peek_source(&self, id: usize) -> Option<&T> {
        self.sources[id].as_ref().and_then(|s| s.peek())
    }

    // ---- Manual min-heap over source ids ----

    fn heap_less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.heap[i], self.heap[j]);
        match (self.peek_source(a), self.peek_source(b)) {
            (Some(x), Some(y)) => x.cmp(y).then(a.cmp(&b)).is_lt(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => a < b,
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap_less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    fn heap_push(&mut self, id: usize) {
        self.heap.push(id);
        let pos = self.heap.len() - 1;
        self.sift_up(pos);
    }
}

impl<T: Ord> MergeSource<T> for Merge<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            self.start()
        }
    }

    fn peek(&self) -> Option<&T> {
        self.current().ok()
    }

    fn advance(&mut self) -> Result<bool> {
        Self::advance(self)
    }

    fn close(&mut self) -> Result<()> {
        Self::close(self)
    }
}

impl<T> fmt::Debug for Merge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merge")
            .field("name", &self.name)
            .field("sources", &self.sources.len())
            .field("live", &self.heap.len())
            .field("started", &self.started)
            .finish()
    }
}

impl<T> Drop for Merge<T> {
    fn drop(&mut self) {
        let live = self.sources.iter().filter(|s| s.is_some()).count();
        if live > 0 {
            warn!(
                "Merge {} dropped without close, {} sources still open",
                self.name, live
            );
            for slot in &mut self.sources {
                if let Some(mut source) = slot.take() {
                    let _ = source.close();
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use geopack_formats::QuadtreePath;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn drain<T: Ord + Clone>(merge: &mut Merge<T>) -> Vec<(T, usize)> {
        let mut out = Vec::new();
        while merge.is_active() {
            out.push((
                merge.current().unwrap().clone(),
                merge.current_source_id().unwrap(),
            ));
            merge.advance().unwrap();
        }
        out
    }

    #[test]
    fn test_protocol_errors() {
        let mut merge: Merge<u32> = Merge::new("empty");
        assert!(matches!(merge.current(), Err(StorageError::NotActive(_))));
        assert!(matches!(merge.start(), Err(StorageError::NoSources(_))));

        merge.add_source(VecSource::new("a", vec![1, 2])).unwrap();
        merge.start().unwrap();
        assert!(matches!(
            merge.start(),
            Err(StorageError::AlreadyStarted(_))
        ));

        assert_eq!(*merge.current().unwrap(), 1);
        assert!(matches!(
            merge.add_source(VecSource::new("late", vec![1])),
            Err(StorageError::OutOfOrderSource { .. })
        ));

        merge.advance().unwrap();
        assert!(!merge.advance().unwrap());
        assert!(merge.is_finished());
        assert!(!merge.is_active());
        assert!(matches!(merge.advance(), Err(StorageError::NotActive(_))));
        assert!(matches!(
            merge.add_source(VecSource::new("after", vec![9])),
            Err(StorageError::NotActive(_))
        ));
        merge.close().unwrap();
    }

    #[test]
    fn test_simple_numbers_with_late_source() {
        let mut merge = Merge::new("numbers");
        merge
            .add_source(VecSource::new("evens", vec![0, 2, 4, 6, 8]))
            .unwrap();
        merge
            .add_source(VecSource::new("odds", vec![1, 3, 5, 7, 9]))
            .unwrap();
        merge.add_source(VecSource::new("none", Vec::new())).unwrap();
        merge.start().unwrap();

        let mut out = Vec::new();
        for _ in 0..4 {
            out.push(*merge.current().unwrap());
            merge.advance().unwrap();
        }
        // current is now 4
        assert_eq!(
            merge
                .add_source(VecSource::new("late", vec![5, 10]))
                .unwrap(),
            3
        );
        assert!(merge.add_source(VecSource::new("stale", vec![4])).is_err());

        while merge.is_active() {
            out.push(*merge.current().unwrap());
            merge.advance().unwrap();
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 5, 6, 7, 8, 9, 10]);
        merge.close().unwrap();
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let mut merge = Merge::new("ties");
        for name in ["a", "b", "c"] {
            merge.add_source(VecSource::new(name, vec![7, 7])).unwrap();
        }
        merge.start().unwrap();
        let ids: Vec<usize> = drain(&mut merge).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_current_name() {
        let mut merge = Merge::new("named");
        merge.add_source(VecSource::new("second", vec![2])).unwrap();
        merge.add_source(VecSource::new("first", vec![1])).unwrap();
        merge.start().unwrap();
        assert_eq!(merge.current_name().unwrap(), "first");
        assert_eq!(merge.current_source_id().unwrap(), 1);
    }

    /// Walk a random subset of the quadtree in preorder.
    fn random_walk(seed: u64, max_level: u32) -> Vec<QuadtreePath> {
        let mut state = seed | 1;
        let mut path = QuadtreePath::root();
        let mut out = Vec::new();
        while path.advance(max_level) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            if state % 3 == 0 {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn test_cascaded_merges() {
        let mut total = 0;
        let mut top = Merge::new("top");
        for group in 0..4u64 {
            let mut inner = Merge::new(format!("group{group}"));
            for i in 0..5u64 {
                let values = random_walk(group * 31 + i + 1, 4);
                total += values.len();
                inner
                    .add_source(VecSource::new(format!("walk{i}"), values))
                    .unwrap();
            }
            inner.start().unwrap();
            top.add_source(inner).unwrap();
        }
        top.start().unwrap();

        let out = drain(&mut top);
        assert_eq!(out.len(), total);
        assert!(out.windows(2).all(|w| w[0].0 <= w[1].0));
        top.close().unwrap();
    }

    #[test]
    fn test_nested_merge_started_on_add() {
        let mut inner = Merge::new("inner");
        inner.add_source(VecSource::new("low", vec![1, 2, 3])).unwrap();

        let mut top = Merge::new("top");
        assert_eq!(top.add_source(inner).unwrap(), 0);
        top.add_source(VecSource::new("high", vec![10])).unwrap();
        top.start().unwrap();

        let values: Vec<u32> = drain(&mut top).into_iter().map(|(v, _)| v).collect();
        assert_eq!(values, vec![1, 2, 3, 10]);
        top.close().unwrap();
    }

    #[test]
    fn test_nested_merge_without_sources_is_rejected() {
        let mut top: Merge<u32> = Merge::new("top");
        assert!(matches!(
            top.add_source(Merge::new("hollow")),
            Err(StorageError::NoSources(_))
        ));
        assert_eq!(top.source_count(), 0);
    }

    proptest! {
        #[test]
        fn merge_is_total_and_ordered(
            mut inputs in prop::collection::vec(prop::collection::vec(any::<u16>(), 0..40), 1..50)
        ) {
            let mut merge = Merge::new("prop");
            let mut expected = Vec::new();
            for (i, values) in inputs.iter_mut().enumerate() {
                values.sort_unstable();
                expected.extend(values.iter().copied());
                merge.add_source(VecSource::new(format!("s{i}"), values.clone())).unwrap();
            }
            merge.start().unwrap();

            let out = drain(&mut merge);
            expected.sort_unstable();
            let values: Vec<u16> = out.iter().map(|(v, _)| *v).collect();
            prop_assert_eq!(values, expected);
            for (value, id) in &out {
                prop_assert!(inputs[*id].contains(value));
            }
            prop_assert!(merge.is_finished());
        }
    }
}
