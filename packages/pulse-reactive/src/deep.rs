//! Deep traversal of watched values.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::*;

/// Bookkeeping for one deep traversal: the remaining depth budget and the
/// subjects already visited, which breaks cycles through reactive handles.
pub struct DeepTracker {
    depth: Option<u32>,
    visited: HashSet<DepId>,
}

impl DeepTracker {
    pub(crate) fn unbounded() -> Self {
        Self {
            depth: None,
            visited: HashSet::new(),
        }
    }

    pub(crate) fn bounded(depth: u32) -> Self {
        Self {
            depth: Some(depth),
            visited: HashSet::new(),
        }
    }

    /// Consume one level of the depth budget. Returns `false` when the budget
    /// is exhausted; implementations skip recursion in that case.
    pub fn descend(&mut self) -> bool {
        match &mut self.depth {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }

    /// Give back the level consumed by the matching [`descend`](Self::descend)
    /// call, so sibling branches share the same budget.
    pub fn ascend(&mut self) {
        if let Some(n) = &mut self.depth {
            *n += 1;
        }
    }

    /// Mark a subject as visited. Returns `false` if it was already visited.
    pub(crate) fn visit(&mut self, dep: DepId) -> bool {
        self.visited.insert(dep)
    }
}

/// Values that can be traversed by a deep watcher.
///
/// [`deep_track`](DeepTrack::deep_track) registers every reactive value
/// nested inside `self` with the currently-collecting subscriber, so a
/// mutation anywhere in the structure re-triggers the watcher. Plain data is
/// a leaf and does nothing; containers recurse into their elements;
/// [`Signal`] and [`Computed`] track themselves and recurse into their
/// stored value.
///
/// For your own leaf types, use [`impl_watch_value!`](crate::impl_watch_value)
/// to opt in.
pub trait DeepTrack {
    /// Register every reactive value nested inside `self`.
    fn deep_track(&self, tracker: &mut DeepTracker);
}

impl<T: DeepTrack + 'static> DeepTrack for ReadSignal<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if !tracker.visit(self.dep()) {
            return;
        }
        self.track();
        if tracker.descend() {
            self.with_untracked(|value| value.deep_track(tracker));
            tracker.ascend();
        }
    }
}

impl<T: DeepTrack + 'static> DeepTrack for Signal<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        (**self).deep_track(tracker);
    }
}

impl<T: DeepTrack + 'static> DeepTrack for Computed<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if !tracker.visit(self.dep_id()) {
            return;
        }
        if tracker.descend() {
            // `with` refreshes, tracks and reads in one go.
            self.with(|value| value.deep_track(tracker));
            tracker.ascend();
        } else {
            self.track();
        }
    }
}

impl<T: DeepTrack> DeepTrack for Option<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if let Some(value) = self {
            value.deep_track(tracker);
        }
    }
}

impl<T: DeepTrack + ?Sized> DeepTrack for Box<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        (**self).deep_track(tracker);
    }
}

impl<T: DeepTrack + ?Sized> DeepTrack for Rc<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        (**self).deep_track(tracker);
    }
}

impl<T: DeepTrack> DeepTrack for Vec<T> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if tracker.descend() {
            for value in self {
                value.deep_track(tracker);
            }
            tracker.ascend();
        }
    }
}

impl<T: DeepTrack, const N: usize> DeepTrack for [T; N] {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if tracker.descend() {
            for value in self {
                value.deep_track(tracker);
            }
            tracker.ascend();
        }
    }
}

impl<K, V: DeepTrack, S> DeepTrack for HashMap<K, V, S> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if tracker.descend() {
            for value in self.values() {
                value.deep_track(tracker);
            }
            tracker.ascend();
        }
    }
}

impl<K, V: DeepTrack> DeepTrack for BTreeMap<K, V> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if tracker.descend() {
            for value in self.values() {
                value.deep_track(tracker);
            }
            tracker.ascend();
        }
    }
}

impl<T: DeepTrack, S> DeepTrack for HashSet<T, S> {
    fn deep_track(&self, tracker: &mut DeepTracker) {
        if tracker.descend() {
            for value in self {
                value.deep_track(tracker);
            }
            tracker.ascend();
        }
    }
}

macro_rules! impl_deep_track_for_tuple {
    ($($T:tt),*) => {
        paste::paste! {
            impl<$($T,)*> DeepTrack for ($($T,)*)
            where
                $($T: DeepTrack,)*
            {
                fn deep_track(&self, tracker: &mut DeepTracker) {
                    if tracker.descend() {
                        let ($([<$T:lower>],)*) = self;
                        $(
                            [<$T:lower>].deep_track(tracker);
                        )*
                        tracker.ascend();
                    }
                }
            }
        }
    }
}

impl_deep_track_for_tuple!(A);
impl_deep_track_for_tuple!(A, B);
impl_deep_track_for_tuple!(A, B, C);
impl_deep_track_for_tuple!(A, B, C, D);
impl_deep_track_for_tuple!(A, B, C, D, E);
impl_deep_track_for_tuple!(A, B, C, D, E, F);
impl_deep_track_for_tuple!(A, B, C, D, E, F, G);
impl_deep_track_for_tuple!(A, B, C, D, E, F, G, H);

impl DeepTrack for f32 {
    fn deep_track(&self, _tracker: &mut DeepTracker) {}
}
impl DeepTrack for f64 {
    fn deep_track(&self, _tracker: &mut DeepTracker) {}
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn deep_track_reaches_nested_signals() {
        let _ = create_root(|| {
            let inner = create_signal(1);
            let outer = create_signal(vec![inner]);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                outer.with(|value| value.deep_track(&mut DeepTracker::unbounded()));
            });
            assert_eq!(runs.get(), 1);

            inner.set(2);
            assert_eq!(runs.get(), 2);

            outer.set(vec![inner, inner]);
            assert_eq!(runs.get(), 3);
        });
    }

    #[test]
    fn bounded_depth_stops_recursion() {
        let _ = create_root(|| {
            let leaf = create_signal(1);
            let middle = create_signal(vec![leaf]);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                // Budget 0: the vec wrapper itself is already too deep.
                middle.with(|value| value.deep_track(&mut DeepTracker::bounded(0)));
            });
            assert_eq!(runs.get(), 1);

            leaf.set(2);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn repeated_handles_are_visited_once() {
        let _ = create_root(|| {
            let shared = create_signal(1);
            let pair = (shared, shared);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                pair.deep_track(&mut DeepTracker::unbounded());
            });
            assert_eq!(runs.get(), 1);

            shared.set(2);
            assert_eq!(runs.get(), 2);
        });
    }
}
