//! Subscribers of the dependency graph and their run lifecycle.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::*;

new_key_type! {
    pub(crate) struct EffectId;
}

/// Freshness of a subscriber.
///
/// The levels are ordered: a subscriber is only ever raised, never lowered,
/// by change propagation. [`MaybeDirty`](DirtyLevel::MaybeDirty) is the
/// tentative state a write puts on consumers of a derived value before the
/// derived value has actually been recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirtyLevel {
    /// Up to date.
    NotDirty,
    /// An upstream derived value might have changed; must be resolved by
    /// recomputing it before this subscriber can be declared stale.
    MaybeDirty,
    /// Known stale.
    Dirty,
}

/// How a queued subscriber is dispatched when the scheduler queue drains.
pub(crate) enum Scheduler {
    /// Re-run synchronously if still dirty once the queue drains.
    Run,
    /// Re-queue the subscribers of a computed's own subject.
    Propagate(DepId),
    /// Invoke an arbitrary job (watchers, custom schedulers).
    Job(Rc<RefCell<dyn FnMut()>>),
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        match self {
            Self::Run => Self::Run,
            Self::Propagate(dep) => Self::Propagate(*dep),
            Self::Job(job) => Self::Job(job.clone()),
        }
    }
}

/// A subscriber: a function plus the bookkeeping needed to re-run it when the
/// subjects it read change.
pub(crate) struct EffectState {
    /// Type-erased output slot. Computeds keep `Option<T>` here; everything
    /// else keeps `()`. Taken while the function runs.
    pub value: Option<Box<dyn Any>>,
    /// The tracked function. Receives the output slot and reports whether it
    /// meaningfully changed.
    pub callback: Rc<RefCell<dyn FnMut(&mut Box<dyn Any>) -> bool>>,
    /// For the internal effect of a computed: the subject announcing the
    /// computed's output. Every fresh dirtying re-broadcasts `MaybeDirty`
    /// through it.
    pub computed: Option<DepId>,
    /// How to dispatch once queued. `None` makes the subscriber trigger-only.
    pub scheduler: Option<Scheduler>,
    pub active: bool,
    /// Subjects read during the last run, at positions `0..deps_len`. Any
    /// tail beyond the cursor is leftovers from the run before and is removed
    /// after the current run completes.
    pub deps: SmallVec<[DepId; 4]>,
    /// Reconciliation cursor into `deps` while a run is collecting.
    pub deps_len: usize,
    pub dirty_level: DirtyLevel,
    /// Epoch bumped every time dependency collection restarts. Subscriber
    /// entries carrying an older epoch are dead edges.
    pub track_id: u64,
    /// Nested run counter.
    pub runnings: u32,
    /// Armed on the not-dirty transition, disarmed once queued.
    pub should_schedule: bool,
    pub allow_recurse: bool,
    pub on_stop: Option<Box<dyn FnOnce()>>,
}

pub(crate) fn insert_effect(root: &'static Root, state: EffectState) -> EffectId {
    root.effects.borrow_mut().insert(state)
}

pub(crate) fn plain_effect_state(
    mut f: impl FnMut() + 'static,
    options: EffectOptions,
) -> EffectState {
    let scheduler = match options.scheduler {
        Some(job) => Scheduler::Job(Rc::new(RefCell::new(job))),
        None => Scheduler::Run,
    };
    EffectState {
        value: Some(Box::new(())),
        callback: Rc::new(RefCell::new(move |_: &mut Box<dyn Any>| {
            f();
            true
        })),
        computed: None,
        scheduler: Some(scheduler),
        active: true,
        deps: SmallVec::new(),
        deps_len: 0,
        dirty_level: DirtyLevel::Dirty,
        track_id: 0,
        runnings: 0,
        should_schedule: false,
        allow_recurse: options.allow_recurse,
        on_stop: options.on_stop,
    }
}

/// Options for [`create_effect_with`].
#[derive(Default)]
pub struct EffectOptions {
    /// Skip the initial run. The effect stays [`Dirty`](DirtyLevel::Dirty)
    /// until [`EffectHandle::run`] is called.
    pub lazy: bool,
    /// Allow the effect to schedule itself when it triggers one of its own
    /// subjects mid-run. Only meaningful together with a `scheduler` that
    /// defers past the current run.
    pub allow_recurse: bool,
    /// Replaces the built-in dispatch (re-run synchronously if dirty) with a
    /// custom job. The job decides if and when to call
    /// [`EffectHandle::run`].
    pub scheduler: Option<Box<dyn FnMut()>>,
    /// Invoked once when the effect is stopped.
    pub on_stop: Option<Box<dyn FnOnce()>>,
}

/// A handle to a running effect.
///
/// The handle is `Copy` and can be freely passed around; [`stop`] and
/// [`dispose`] act on the shared effect.
///
/// [`stop`]: EffectHandle::stop
/// [`dispose`]: EffectHandle::dispose
#[derive(Clone, Copy)]
pub struct EffectHandle {
    pub(crate) id: EffectId,
    pub(crate) root: &'static Root,
}

impl EffectHandle {
    /// Re-run the effect now, re-collecting its dependencies.
    pub fn run(&self) {
        run_effect(self.root, self.id);
    }

    /// Resolve whether the effect is genuinely stale, recomputing upstream
    /// derived values as needed. Custom schedulers call this before deciding
    /// to [`run`](EffectHandle::run).
    pub fn dirty(&self) -> bool {
        effect_dirty(self.root, self.id)
    }

    /// Detach the effect from every subject and run its stop hook. After
    /// this, no write reaches the effect. Idempotent.
    pub fn stop(&self) {
        stop_effect(self.root, self.id);
    }

    /// [`stop`](EffectHandle::stop) the effect and release its closures.
    pub fn dispose(self) {
        dispose_effect(self.root, self.id);
    }

    /// Returns `true` if the effect has not been disposed.
    pub fn is_alive(&self) -> bool {
        self.root.effects.borrow().get(self.id).is_some()
    }
}

/// Creates an effect on reactive values used inside the effect closure.
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
///
/// create_effect(move || {
///     println!("new state = {}", state.get());
/// });
/// // Prints "new state = 0"
///
/// state.set(1);
/// // Prints "new state = 1"
/// # });
/// ```
///
/// `create_effect` should only be used for creating **side-effects**. If you
/// want to derive a value from other values, use
/// [`create_computed`](crate::create_computed) instead.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect(f: impl FnMut() + 'static) -> EffectHandle {
    create_effect_with(f, EffectOptions::default())
}

/// Creates an effect with explicit [`EffectOptions`].
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect_with(f: impl FnMut() + 'static, options: EffectOptions) -> EffectHandle {
    let root = Root::global();
    let lazy = options.lazy;
    let id = insert_effect(root, plain_effect_state(f, options));
    if !lazy {
        run_effect(root, id);
    }
    EffectHandle { id, root }
}

/// Puts the taken output slot back without entering the tracked section.
struct DetachedRunGuard {
    root: &'static Root,
    id: EffectId,
    value: Option<Box<dyn Any>>,
}

impl Drop for DetachedRunGuard {
    fn drop(&mut self) {
        if let Some(e) = self.root.effects.borrow_mut().get_mut(self.id) {
            e.value = self.value.take();
        }
    }
}

/// Restores the ambient tracking context and finishes dependency
/// reconciliation. Runs unconditionally, so a panicking user function leaves
/// the effect in a consistent state.
struct RunGuard {
    root: &'static Root,
    id: EffectId,
    prev_active: EffectId,
    prev_should_track: bool,
    value: Option<Box<dyn Any>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.root.active_effect.set(self.prev_active);
        self.root.should_track.set(self.prev_should_track);
        let stale_tail: SmallVec<[DepId; 4]> = {
            let mut effects = self.root.effects.borrow_mut();
            let Some(e) = effects.get_mut(self.id) else {
                return;
            };
            e.value = self.value.take();
            e.runnings -= 1;
            let len = e.deps_len;
            if e.deps.len() > len {
                e.deps.drain(len..).collect()
            } else {
                SmallVec::new()
            }
        };
        for dep in stale_tail {
            cleanup_dep_effect(self.root, dep, self.id);
        }
    }
}

/// Run the effect's function, re-collecting its dependencies, and report
/// whether its output meaningfully changed.
///
/// Collection starts by bumping the epoch and resetting the reconciliation
/// cursor, which turns every existing link stale; reads during the run
/// refresh the surviving ones in place.
#[cfg_attr(feature = "trace", tracing::instrument(skip(root)))]
pub(crate) fn run_effect(root: &'static Root, id: EffectId) -> bool {
    let (callback, value, active) = {
        let mut effects = root.effects.borrow_mut();
        let Some(e) = effects.get_mut(id) else {
            return false;
        };
        e.dirty_level = DirtyLevel::NotDirty;
        let value = e.value.take().expect("effect is already running");
        (e.callback.clone(), value, e.active)
    };
    if !active {
        // A stopped effect still executes its function but collects nothing.
        let mut guard = DetachedRunGuard {
            root,
            id,
            value: Some(value),
        };
        return callback.borrow_mut()(guard.value.as_mut().expect("effect value missing"));
    }
    {
        let mut effects = root.effects.borrow_mut();
        let e = &mut effects[id];
        e.track_id += 1;
        e.deps_len = 0;
        e.runnings += 1;
    }
    let mut guard = RunGuard {
        root,
        id,
        prev_active: root.active_effect.replace(id),
        prev_should_track: root.should_track.replace(true),
        value: Some(value),
    };
    let changed = callback.borrow_mut()(guard.value.as_mut().expect("effect value missing"));
    drop(guard);
    changed
}

/// Resolve [`DirtyLevel::MaybeDirty`] to a definite answer.
///
/// The walk recomputes upstream computeds in dependency order with tracking
/// paused; the first one that actually changed raises this subscriber to
/// [`DirtyLevel::Dirty`] through its subject, at which point the walk stops.
/// If none changed, the tentative bit was a false alarm and the subscriber is
/// marked clean.
pub(crate) fn effect_dirty(root: &'static Root, id: EffectId) -> bool {
    let level = match root.effects.borrow().get(id) {
        Some(e) => e.dirty_level,
        None => return false,
    };
    if level == DirtyLevel::MaybeDirty {
        let _guard = TrackGuard::pause(root);
        let len = root.effects.borrow().get(id).map_or(0, |e| e.deps_len);
        for i in 0..len {
            let dep = root
                .effects
                .borrow()
                .get(id)
                .and_then(|e| e.deps.get(i).copied());
            let Some(dep) = dep else { break };
            let is_computed = root
                .deps
                .borrow()
                .get(dep)
                .is_some_and(|d| d.computed.is_some());
            if !is_computed {
                continue;
            }
            update_computed(root, dep);
            let resolved = root
                .effects
                .borrow()
                .get(id)
                .map_or(true, |e| e.dirty_level >= DirtyLevel::Dirty);
            if resolved {
                break;
            }
        }
        let mut effects = root.effects.borrow_mut();
        if let Some(e) = effects.get_mut(id) {
            if e.dirty_level < DirtyLevel::Dirty {
                e.dirty_level = DirtyLevel::NotDirty;
            }
        }
    }
    root.effects
        .borrow()
        .get(id)
        .is_some_and(|e| e.dirty_level >= DirtyLevel::Dirty)
}

/// Detach the effect from every subject and mark it inactive. Idempotent.
pub(crate) fn stop_effect(root: &'static Root, id: EffectId) {
    let detached = {
        let mut effects = root.effects.borrow_mut();
        match effects.get_mut(id) {
            Some(e) if e.active => {
                // Bumping the epoch turns every link stale in one move.
                e.track_id += 1;
                e.deps_len = 0;
                Some((std::mem::take(&mut e.deps), e.on_stop.take()))
            }
            _ => None,
        }
    };
    let Some((deps, on_stop)) = detached else {
        return;
    };
    for dep in deps {
        cleanup_dep_effect(root, dep, id);
    }
    if let Some(f) = on_stop {
        f();
    }
    if let Some(e) = root.effects.borrow_mut().get_mut(id) {
        e.active = false;
    }
}

/// Stop the effect and remove it from the arena, releasing its closures.
pub(crate) fn dispose_effect(root: &'static Root, id: EffectId) {
    stop_effect(root, id);
    root.effects.borrow_mut().remove(id);
}
