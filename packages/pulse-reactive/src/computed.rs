//! Computeds (lazy, memoised derived values).

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::*;

/// A lazily recomputed, memoised derived value.
///
/// A computed is both a subscriber (its getter re-collects dependencies on
/// every recomputation) and a subject (reading it links the surrounding
/// subscriber to its output). Recomputation happens on read, and only when an
/// upstream change actually went through: a write that leaves the output
/// equal stops the wave here instead of re-running everything downstream.
///
/// See [`create_computed`] for more information.
pub struct Computed<T: 'static> {
    pub(crate) effect: EffectId,
    pub(crate) dep: DepId,
    root: &'static Root,
    /// Keep track of where the computed was created for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// Creates a memoized computation from some reactive values.
///
/// The output is derived from all the reactive values that are used within
/// the closure, and is recomputed lazily: reading the computed after an
/// upstream write runs the closure once, and reading it again without any
/// further write returns the cached value.
///
/// Dependents are only notified when the output meaningfully changed, as
/// decided by [`SameValue`]. To supply your own comparison, use
/// [`create_computed_with`].
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// let double = create_computed(move || state.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed<T: SameValue + 'static>(
    f: impl FnMut() -> T + 'static,
) -> Computed<T> {
    create_computed_with(f, |new, old| new.same_value(old))
}

/// Creates a memoized computation with a custom comparison function.
///
/// `eq` receives the new and the previous output and returns `true` if they
/// are the same; in that case dependents are not notified and the cached
/// value is kept.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed_with<T: 'static>(
    mut f: impl FnMut() -> T + 'static,
    mut eq: impl FnMut(&T, &T) -> bool + 'static,
) -> Computed<T> {
    let root = Root::global();
    let dep = insert_dep(root, None);
    let callback = move |slot: &mut Box<dyn Any>| {
        let slot = slot.downcast_mut::<Option<T>>().expect("wrong computed type");
        let new = f();
        match slot {
            Some(old) if eq(&new, old) => false,
            _ => {
                *slot = Some(new);
                true
            }
        }
    };
    let effect = insert_effect(
        root,
        EffectState {
            value: Some(Box::new(Option::<T>::None)),
            callback: Rc::new(RefCell::new(callback)),
            computed: Some(dep),
            scheduler: Some(Scheduler::Propagate(dep)),
            active: true,
            deps: SmallVec::new(),
            deps_len: 0,
            dirty_level: DirtyLevel::Dirty,
            track_id: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            on_stop: None,
        },
    );
    root.deps.borrow_mut()[dep].computed = Some(effect);
    Computed {
        effect,
        dep,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    }
}

/// Bring the computed behind `dep` up to date and link the surrounding
/// subscriber to it.
///
/// This is the read path shared by [`Computed`] accessors and the dirty-check
/// walk. If the internal effect resolves to genuinely stale, it re-runs, and
/// a changed output is announced downstream as [`DirtyLevel::Dirty`]. Should
/// the internal effect still be tentative afterwards (a read that landed in
/// the middle of a partially-propagated wave), the tentative notice is
/// re-broadcast so consumers holding on to the value stay on notice.
pub(crate) fn update_computed(root: &'static Root, dep: DepId) {
    let internal = root.deps.borrow().get(dep).and_then(|d| d.computed);
    let Some(internal) = internal else { return };
    if effect_dirty(root, internal) {
        let changed = run_effect(root, internal);
        if changed {
            trigger_dep(root, dep, DirtyLevel::Dirty);
        }
    }
    track_dep(root, dep);
    let still_tentative = root
        .effects
        .borrow()
        .get(internal)
        .is_some_and(|e| e.dirty_level >= DirtyLevel::MaybeDirty);
    if still_tentative {
        trigger_dep(root, dep, DirtyLevel::MaybeDirty);
    }
}

impl<T> Computed<T> {
    /// Get the output of the computed, recomputing it first if an upstream
    /// change went through. The type must implement [`Copy`]; otherwise use
    /// [`Computed::get_clone`] or [`Computed::with`].
    ///
    /// When called inside a reactive scope, the computed is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        self.with(|value| *value)
    }

    /// Get the output of the computed. The value is [`Clone`]-ed
    /// automatically.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(&self) -> T
    where
        T: Clone,
    {
        self.with(Clone::clone)
    }

    /// Get the output of the computed without linking the surrounding
    /// subscriber to it. The output is still brought up to date first.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(&self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Clone the output of the computed without linking the surrounding
    /// subscriber to it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(&self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get a value from the output of the computed.
    ///
    /// When called inside a reactive scope, the computed is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        update_computed(self.root, self.dep);
        let value = {
            let mut effects = self.root.effects.borrow_mut();
            match effects.get_mut(self.effect) {
                Some(e) => e.value.take().expect("computed value updating"),
                None => panic!("{}", self.get_disposed_panic_message()),
            }
        };
        let slot = value.downcast_ref::<Option<T>>().expect("wrong computed type");
        let ret = f(slot.as_ref().expect("computed value updating"));
        if let Some(e) = self.root.effects.borrow_mut().get_mut(self.effect) {
            e.value = Some(value);
        }
        ret
    }

    /// Get a value from the output of the computed without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        let _guard = TrackGuard::pause(self.root);
        self.with(f)
    }

    /// Link the surrounding subscriber to this computed without reading or
    /// refreshing its output.
    pub fn track(&self) {
        track_dep(self.root, self.dep);
    }

    pub(crate) fn dep_id(&self) -> DepId {
        self.dep
    }

    /// Returns `true` if the computed is still alive, i.e. has not yet been
    /// disposed.
    pub fn is_alive(&self) -> bool {
        self.root.effects.borrow().get(self.effect).is_some()
    }

    /// Disposes the computed, detaching it from its dependencies and freeing
    /// its cached value. Accessing a computed after it has been disposed
    /// immediately causes a panic.
    pub fn dispose(self) {
        dispose_effect(self.root, self.effect);
        self.root.deps.borrow_mut().remove(self.dep);
    }

    fn get_disposed_panic_message(&self) -> String {
        #[cfg(not(debug_assertions))]
        return "computed was disposed".to_string();

        #[cfg(debug_assertions)]
        return format!("computed was disposed. Created at {}", self.created_at);
    }
}

/// We manually implement `Clone` + `Copy` for `Computed` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Computed<T> {}

impl<T: PartialEq> PartialEq for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn eq(&self, other: &Self) -> bool {
        // Comparing a handle against itself short-circuits, since the value
        // cell can only be taken once at a time.
        self.effect == other.effect || self.with(|value| other.with(|other| value == other))
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Computed<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn computed() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_computed(move || state.get() * 2);

            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn computed_is_lazy() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let evals = create_signal(0);
            let double = create_computed(move || {
                evals.set_silent(evals.get_untracked() + 1);
                state.get() * 2
            });
            assert_eq!(evals.get(), 0); // not evaluated until first read

            assert_eq!(double.get(), 0);
            assert_eq!(evals.get(), 1);

            // Reading again without a write returns the cached value.
            assert_eq!(double.get(), 0);
            assert_eq!(evals.get(), 1);

            state.set(2);
            assert_eq!(evals.get(), 1); // still not recomputed

            assert_eq!(double.get(), 4);
            assert_eq!(evals.get(), 2);
        });
    }

    #[test]
    fn chained_computeds_evaluate_once_per_write() {
        let _ = create_root(|| {
            let a = create_signal(0);
            let b_evals = create_signal(0);
            let c_evals = create_signal(0);
            let runs = create_signal(0);
            let log = create_signal(Vec::new());

            let b = create_computed(move || {
                b_evals.set_silent(b_evals.get_untracked() + 1);
                a.get() * 2
            });
            let c = create_computed(move || {
                c_evals.set_silent(c_evals.get_untracked() + 1);
                b.get() + 1
            });
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                log.update_silent(|l| l.push(c.get()));
            });

            assert_eq!(log.get_clone(), vec![1]);
            assert_eq!((b_evals.get(), c_evals.get(), runs.get()), (1, 1, 1));

            a.set(10);
            assert_eq!(log.get_clone(), vec![1, 21]);
            // Exactly one more evaluation of each getter, one more run.
            assert_eq!((b_evals.get(), c_evals.get(), runs.get()), (2, 2, 2));
        });
    }

    #[test]
    fn unchanged_computed_stops_the_wave() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let parity_evals = create_signal(0);
            let runs = create_signal(0);
            let log = create_signal(Vec::new());

            let parity = create_computed(move || {
                parity_evals.set_silent(parity_evals.get_untracked() + 1);
                a.get() % 2
            });
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                log.update_silent(|l| l.push(parity.get()));
            });
            assert_eq!(log.get_clone(), vec![1]);

            a.set(3);
            // The getter re-ran, saw an equal output, and the effect did not.
            assert_eq!(parity_evals.get(), 2);
            assert_eq!(runs.get(), 1);
            assert_eq!(log.get_clone(), vec![1]);

            a.set(4);
            assert_eq!(runs.get(), 2);
            assert_eq!(log.get_clone(), vec![1, 0]);
        });
    }

    #[test]
    fn diamond_updates_consistently_and_once() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let left = create_computed(move || a.get() + 1);
            let right = create_computed(move || a.get() * 10);
            let runs = create_signal(0);
            let log = create_signal(Vec::new());
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                log.update_silent(|l| l.push((left.get(), right.get())));
            });
            assert_eq!(log.get_clone(), vec![(2, 10)]);

            a.set(2);
            // One re-run, and it never observed a half-updated pair.
            assert_eq!(runs.get(), 2);
            assert_eq!(log.get_clone(), vec![(2, 10), (3, 20)]);
        });
    }

    #[test]
    fn computed_recreates_dependencies_each_time() {
        let _ = create_root(|| {
            let condition = create_signal(true);
            let state1 = create_signal(0);
            let state2 = create_signal(10);
            let evals = create_signal(0);

            let picked = create_computed(move || {
                evals.set_silent(evals.get_untracked() + 1);
                if condition.get() {
                    state1.get()
                } else {
                    state2.get()
                }
            });
            let runs = create_signal(0);
            create_effect(move || {
                picked.track();
                runs.set_silent(runs.get_untracked() + 1);
            });
            assert_eq!(picked.get(), 0);
            assert_eq!(evals.get(), 1);

            state2.set(20); // not currently tracked by the computed
            assert_eq!(picked.get(), 0);
            assert_eq!(evals.get(), 1);
            assert_eq!(runs.get(), 1);

            condition.set(false);
            assert_eq!(picked.get(), 20);

            state1.set(5); // no longer tracked
            assert_eq!(picked.get(), 20);
        });
    }

    #[test]
    fn computed_with_custom_eq() {
        let _ = create_root(|| {
            let state = create_signal(1i32);
            let runs = create_signal(0);
            // Magnitude comparison: sign flips are not meaningful changes.
            let magnitude = create_computed_with(
                move || state.get(),
                |new: &i32, old: &i32| new.abs() == old.abs(),
            );
            create_effect(move || {
                magnitude.track();
                runs.set_silent(runs.get_untracked() + 1);
            });
            assert_eq!(magnitude.get(), 1);
            assert_eq!(runs.get(), 1);

            state.set(-1);
            assert_eq!(runs.get(), 1);
            assert_eq!(magnitude.get(), 1);

            state.set(2);
            assert_eq!(runs.get(), 2);
            assert_eq!(magnitude.get(), 2);
        });
    }

    #[test]
    fn computed_display_and_debug() {
        let _ = create_root(|| {
            let value = create_computed(|| 42);
            assert_eq!(format!("{value}"), "42");
            assert_eq!(format!("{value:?}"), "42");
        });
    }

    #[test]
    fn dispose_computed_detaches_it() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let evals = create_signal(0);
            let double = create_computed(move || {
                evals.set_silent(evals.get_untracked() + 1);
                state.get() * 2
            });
            assert_eq!(double.get(), 0);
            assert!(double.is_alive());

            double.dispose();
            assert!(!double.is_alive());
            state.set(1);
            assert_eq!(evals.get(), 1); // never recomputed again
        });
    }
}
