//! Subjects of the dependency graph and the track/trigger primitives.

use indexmap::IndexMap;
use slotmap::new_key_type;
use slotmap::Key;
use smallvec::SmallVec;

use crate::*;

new_key_type! {
    pub(crate) struct DepId;
}

/// One observable event: typically one property of one reactive object, the
/// value of one [`Signal`], or the output of one [`Computed`].
pub(crate) struct DepState {
    /// Subscribers mapped to the epoch at which they last linked to this
    /// subject. An entry whose epoch disagrees with the subscriber's current
    /// [`EffectState::track_id`] is a dead edge, removed on next traversal.
    pub subscribers: IndexMap<EffectId, u64>,
    /// Invoked at most once, when the subscriber map first becomes empty.
    /// Reactive sources use this to drop their bookkeeping for the subject.
    pub on_empty: Option<Box<dyn FnOnce()>>,
    /// If this subject announces the output of a computed, the computed's
    /// internal effect. The dirty check walks through this to resolve
    /// [`DirtyLevel::MaybeDirty`].
    pub computed: Option<EffectId>,
}

pub(crate) fn insert_dep(root: &'static Root, on_empty: Option<Box<dyn FnOnce()>>) -> DepId {
    root.deps.borrow_mut().insert(DepState {
        subscribers: IndexMap::new(),
        on_empty,
        computed: None,
    })
}

/// A subject owned by a reactive source.
///
/// A source calls [`track`](DepHandle::track) while one of its values is read
/// and [`trigger`](DepHandle::trigger) after one of its values is written;
/// the runtime takes care of which subscribers re-run, and when.
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let dep = create_dep(|| {});
/// let runs = create_signal(0);
/// create_effect(move || {
///     dep.track();
///     runs.set_silent(runs.get_untracked() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// dep.trigger(DirtyLevel::Dirty);
/// assert_eq!(runs.get(), 2);
/// # });
/// ```
#[derive(Clone, Copy)]
pub struct DepHandle {
    pub(crate) id: DepId,
    pub(crate) root: &'static Root,
}

/// Creates a new subject for an external reactive source.
///
/// `on_empty` runs at most once, when the last subscriber detaches. The
/// subject stays usable afterwards; sources typically use the callback to
/// remove the subject from their own key maps.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_dep(on_empty: impl FnOnce() + 'static) -> DepHandle {
    let root = Root::global();
    let id = insert_dep(root, Some(Box::new(on_empty)));
    DepHandle { id, root }
}

impl DepHandle {
    /// Record that the currently-collecting subscriber depends on this
    /// subject. A no-op when tracking is paused or nothing is collecting.
    pub fn track(self) {
        track_dep(self.root, self.id);
    }

    /// Announce a change of this subject to every live subscriber.
    ///
    /// Sources pass [`DirtyLevel::Dirty`]; [`DirtyLevel::MaybeDirty`] is a
    /// tentative notice that a derived value upstream might have changed.
    pub fn trigger(self, level: DirtyLevel) {
        trigger_dep(self.root, self.id, level);
    }

    /// Returns `true` if the subject has not been disposed.
    pub fn is_alive(self) -> bool {
        self.root.deps.borrow().get(self.id).is_some()
    }

    /// Removes the subject. Remaining links to subscribers become dead edges
    /// and are garbage-collected as those subscribers re-run or stop.
    pub fn dispose(self) {
        self.root.deps.borrow_mut().remove(self.id);
    }
}

/// Link the currently-collecting effect to `dep`.
///
/// Re-reads within one run are recognised by the epoch already stored in the
/// subscriber map. Reads arriving in the same order as the previous run hit
/// the position fast path: the slot at the reconciliation cursor already
/// holds `dep`, so the link costs a cursor bump and nothing else.
pub(crate) fn track_dep(root: &'static Root, dep: DepId) {
    if !root.should_track.get() {
        return;
    }
    let effect = root.active_effect.get();
    if effect.is_null() {
        return;
    }
    let Some(track_id) = root.effects.borrow().get(effect).map(|e| e.track_id) else {
        return;
    };
    {
        let mut deps = root.deps.borrow_mut();
        let Some(d) = deps.get_mut(dep) else { return };
        if d.subscribers.get(&effect) == Some(&track_id) {
            return;
        }
        d.subscribers.insert(effect, track_id);
    }
    let displaced = {
        let mut effects = root.effects.borrow_mut();
        let Some(e) = effects.get_mut(effect) else {
            return;
        };
        match e.deps.get(e.deps_len).copied() {
            Some(slot) if slot == dep => {
                e.deps_len += 1;
                None
            }
            Some(old) => {
                e.deps[e.deps_len] = dep;
                e.deps_len += 1;
                Some(old)
            }
            None => {
                e.deps.push(dep);
                e.deps_len += 1;
                None
            }
        }
    };
    if let Some(old) = displaced {
        cleanup_dep_effect(root, old, effect);
    }
}

/// Remove the link between `dep` and `effect` if it is stale, firing the
/// subject's `on_empty` hook when the last subscriber leaves.
pub(crate) fn cleanup_dep_effect(root: &'static Root, dep: DepId, effect: EffectId) {
    let current = root.effects.borrow().get(effect).map(|e| e.track_id);
    let on_empty = {
        let mut deps = root.deps.borrow_mut();
        let Some(d) = deps.get_mut(dep) else { return };
        match d.subscribers.get(&effect) {
            Some(&epoch) if Some(epoch) != current => {
                d.subscribers.shift_remove(&effect);
                if d.subscribers.is_empty() {
                    d.on_empty.take()
                } else {
                    None
                }
            }
            _ => None,
        }
    };
    if let Some(f) = on_empty {
        f();
    }
}

/// Propagate a change of `dep` to its live subscribers.
///
/// Each subscriber below `level` is raised to it. Only the transition out of
/// [`DirtyLevel::NotDirty`] arms scheduling and re-broadcasts through a
/// computed's own subject, which collapses a write burst into one downstream
/// notification and stops redundant waves at already-dirty subscribers.
#[cfg_attr(feature = "trace", tracing::instrument(skip(root)))]
pub(crate) fn trigger_dep(root: &'static Root, dep: DepId, level: DirtyLevel) {
    let _guard = ScheduleGuard::new(root);
    let subscribers: SmallVec<[(EffectId, u64); 8]> = match root.deps.borrow().get(dep) {
        Some(d) => d.subscribers.iter().map(|(&e, &epoch)| (e, epoch)).collect(),
        None => return,
    };
    for (effect, epoch) in subscribers {
        let announce = {
            let mut effects = root.effects.borrow_mut();
            let Some(e) = effects.get_mut(effect) else {
                continue;
            };
            if epoch != e.track_id || e.dirty_level >= level {
                continue;
            }
            let last = e.dirty_level;
            e.dirty_level = level;
            if last == DirtyLevel::NotDirty {
                e.should_schedule = true;
                e.computed
            } else {
                None
            }
        };
        if let Some(own_dep) = announce {
            trigger_dep(root, own_dep, DirtyLevel::MaybeDirty);
        }
    }
    schedule_effects(root, dep);
}

/// Queue the schedulers of `dep`'s live subscribers that are armed for
/// scheduling. A subscriber currently running does not queue itself unless it
/// opted into recursion.
pub(crate) fn schedule_effects(root: &'static Root, dep: DepId) {
    let subscribers: SmallVec<[(EffectId, u64); 8]> = match root.deps.borrow().get(dep) {
        Some(d) => d.subscribers.iter().map(|(&e, &epoch)| (e, epoch)).collect(),
        None => return,
    };
    for (effect, epoch) in subscribers {
        let mut effects = root.effects.borrow_mut();
        let Some(e) = effects.get_mut(effect) else {
            continue;
        };
        if epoch != e.track_id
            || e.scheduler.is_none()
            || !e.should_schedule
            || (e.runnings > 0 && !e.allow_recurse)
        {
            continue;
        }
        e.should_schedule = false;
        root.scheduler_queue.borrow_mut().push_back(effect);
    }
}
