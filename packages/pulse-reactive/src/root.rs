//! [`Root`] — the process-wide state of the reactive system.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use slotmap::{Key, SlotMap};

use crate::*;

/// A deferred unit of work handed to a host flush queue.
///
/// See [`set_flush_queues`].
pub type Task = Box<dyn FnOnce()>;

/// The struct managing the state of the reactive system. Only one should be
/// created per running app.
///
/// Often times, this is intended to be leaked to be able to get a
/// `&'static Root`. However, the `Root` is also `dispose`-able, meaning that
/// any resources allocated in this `Root` will get deallocated. Therefore in
/// practice, there should be no memory leak at all except for the `Root`
/// itself.
pub(crate) struct Root {
    /// All live subscribers.
    pub effects: RefCell<SlotMap<EffectId, EffectState>>,
    /// All live subjects.
    pub deps: RefCell<SlotMap<DepId, DepState>>,
    /// Value cells backing [`Signal`]s.
    pub signals: RefCell<SlotMap<SignalId, SignalNode>>,
    /// The effect currently collecting dependencies, or the null key if reads
    /// are not being observed.
    pub active_effect: Cell<EffectId>,
    /// Whether reads register dependencies right now.
    pub should_track: Cell<bool>,
    /// Saved `should_track` values for the pause/enable/reset brackets.
    pub track_stack: RefCell<Vec<bool>>,
    /// Depth of nested scheduling pauses. The queue drains at zero.
    pub pause_schedule_depth: Cell<u32>,
    /// Schedulers queued during the current write burst, in trigger order.
    pub scheduler_queue: RefCell<VecDeque<EffectId>>,
    /// Host queue for [`Flush::Pre`] watcher jobs, if installed.
    pub flush_pre: RefCell<Option<Box<dyn Fn(Task)>>>,
    /// Host queue for [`Flush::Post`] watcher jobs, if installed.
    pub flush_post: RefCell<Option<Box<dyn Fn(Task)>>>,
    /// Embedder hook receiving watcher callback panics.
    pub error_handler: RefCell<Option<Box<dyn Fn(Box<dyn Any + Send>)>>>,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Get the current reactive root. Panics if no root is found.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| root.get()).expect("no root found")
    }

    /// Sets the current reactive root. Returns the previous root.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|r| r.replace(root))
    }

    /// Create a new reactive root. This root is leaked and so lives until the
    /// end of the program.
    pub fn new_static() -> &'static Self {
        let this = Self {
            effects: RefCell::new(SlotMap::default()),
            deps: RefCell::new(SlotMap::default()),
            signals: RefCell::new(SlotMap::default()),
            active_effect: Cell::new(EffectId::null()),
            should_track: Cell::new(true),
            track_stack: RefCell::new(Vec::new()),
            pause_schedule_depth: Cell::new(0),
            scheduler_queue: RefCell::new(VecDeque::new()),
            flush_pre: RefCell::new(None),
            flush_post: RefCell::new(None),
            error_handler: RefCell::new(None),
        };
        Box::leak(Box::new(this))
    }

    /// Disposes of all the resources held on by this root and resets the
    /// state.
    pub fn reinit(&'static self) {
        let _ = self.effects.take();
        let _ = self.deps.take();
        let _ = self.signals.take();
        self.active_effect.set(EffectId::null());
        self.should_track.set(true);
        let _ = self.track_stack.take();
        self.pause_schedule_depth.set(0);
        let _ = self.scheduler_queue.take();
        let _ = self.flush_pre.take();
        let _ = self.flush_post.take();
        let _ = self.error_handler.take();
    }

    /// Stop observing reads until the matching [`reset_tracking`] call.
    pub fn pause_tracking(&self) {
        let prev = self.should_track.replace(false);
        self.track_stack.borrow_mut().push(prev);
    }

    /// Observe reads until the matching [`reset_tracking`] call, even inside
    /// a paused region.
    pub fn enable_tracking(&self) {
        let prev = self.should_track.replace(true);
        self.track_stack.borrow_mut().push(prev);
    }

    /// Restore the observation state saved by the last
    /// [`pause_tracking`]/[`enable_tracking`] call.
    pub fn reset_tracking(&self) {
        let last = self.track_stack.borrow_mut().pop();
        self.should_track.set(last.unwrap_or(true));
    }

    /// Defer scheduler dispatch until the matching [`reset_scheduling`] call.
    pub fn pause_scheduling(&self) {
        self.pause_schedule_depth
            .set(self.pause_schedule_depth.get() + 1);
    }

    /// End a scheduling pause. When the outermost pause ends, the queued
    /// schedulers run in FIFO order.
    pub fn reset_scheduling(&'static self) {
        let depth = self.pause_schedule_depth.get();
        self.pause_schedule_depth.set(depth.saturating_sub(1));
        self.drain_schedulers();
    }

    /// Run queued schedulers until the queue is empty or scheduling is paused
    /// again. Entries whose effect has been stopped or disposed in the
    /// meantime are skipped.
    fn drain_schedulers(&'static self) {
        // Set the global root, so callbacks dispatched from a handle resolve
        // this root even outside `run_in`.
        let prev = Root::set_global(Some(self));
        while self.pause_schedule_depth.get() == 0 {
            let next = self.scheduler_queue.borrow_mut().pop_front();
            let Some(id) = next else { break };
            let scheduler = {
                let effects = self.effects.borrow();
                match effects.get(id) {
                    Some(e) if e.active => e.scheduler.clone(),
                    _ => continue,
                }
            };
            #[cfg(feature = "trace")]
            tracing::trace!(?id, "dispatching scheduler");
            match scheduler {
                Some(Scheduler::Run) => {
                    if effect_dirty(self, id) {
                        run_effect(self, id);
                    }
                }
                Some(Scheduler::Propagate(dep)) => schedule_effects(self, dep),
                Some(Scheduler::Job(job)) => job.borrow_mut()(),
                None => {}
            }
        }
        Root::set_global(prev);
    }
}

/// Restores the scheduling pause on drop, so a panicking subscriber cannot
/// leave dispatch deferred forever.
pub(crate) struct ScheduleGuard(pub &'static Root);

impl ScheduleGuard {
    pub fn new(root: &'static Root) -> Self {
        root.pause_scheduling();
        Self(root)
    }
}

impl Drop for ScheduleGuard {
    fn drop(&mut self) {
        self.0.reset_scheduling();
    }
}

/// Restores the tracking state on drop.
pub(crate) struct TrackGuard(pub &'static Root);

impl TrackGuard {
    pub fn pause(root: &'static Root) -> Self {
        root.pause_tracking();
        Self(root)
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.0.reset_tracking();
    }
}

/// A handle to a root. This lets you reinitialize or dispose the root for
/// resource cleanup.
///
/// This is generally obtained from [`create_root`].
#[derive(Clone, Copy)]
pub struct RootHandle {
    _ref: &'static Root,
}

impl RootHandle {
    /// Destroy everything that was created in this root.
    pub fn dispose(&self) {
        self._ref.reinit();
    }

    /// Runs the closure with this root set as the current root.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self._ref));
        let ret = f();
        Root::set_global(prev);
        ret
    }
}

/// Creates a new reactive root. The returned [`RootHandle`] can be used to
/// [`dispose`](RootHandle::dispose) the root.
///
/// # Example
/// ```rust
/// # use pulse_reactive::*;
///
/// create_root(|| {
///     let signal = create_signal(123);
///     assert_eq!(signal.get(), 123);
/// });
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let _ref = Root::new_static();

    // The `Root` allocation itself is leaked: handles borrow from it for
    // `'static`. Recording the pointer keeps the allocation reachable, so
    // leak checkers see an intentionally-retained root rather than lost
    // memory. Roots are per-thread, hence no synchronisation.
    thread_local! {
        static RETAINED_ROOTS: RefCell<Vec<*const Root>> = const { RefCell::new(Vec::new()) };
    }
    RETAINED_ROOTS.with(|roots| roots.borrow_mut().push(_ref as *const Root));

    let prev = Root::set_global(Some(_ref));
    f();
    Root::set_global(prev);
    RootHandle { _ref }
}

/// Run the passed closure inside an untracked dependency scope.
///
/// See also [`ReadSignal::get_untracked`].
///
/// # Example
///
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_computed(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // double value should still be the old value because state was untracked
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let _guard = TrackGuard::pause(Root::global());
    f()
}

/// Batch updates from related sources together and dispatch subscribers only
/// once at the end of the scope.
///
/// # Example
///
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let runs = create_signal(0);
/// create_effect(move || {
///     state.track();
///     runs.set_silent(runs.get_untracked() + 1);
/// });
/// batch(move || {
///     state.set(2);
///     state.set(3);
/// });
/// assert_eq!(runs.get(), 2);
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ScheduleGuard::new(Root::global());
    f()
}

/// Stop observing reads until the matching [`reset_tracking`] call.
///
/// Every call must be paired with exactly one [`reset_tracking`] call. For a
/// scoped version, see [`untrack`].
pub fn pause_tracking() {
    Root::global().pause_tracking();
}

/// Observe reads until the matching [`reset_tracking`] call, even inside a
/// paused region.
pub fn enable_tracking() {
    Root::global().enable_tracking();
}

/// Restore the observation state saved by the last
/// [`pause_tracking`]/[`enable_tracking`] call.
pub fn reset_tracking() {
    Root::global().reset_tracking();
}

/// Defer scheduler dispatch until the matching [`reset_scheduling`] call.
///
/// Every call must be paired with exactly one [`reset_scheduling`] call. For
/// a scoped version, see [`batch`].
pub fn pause_scheduling() {
    Root::global().pause_scheduling();
}

/// End a scheduling pause, dispatching deferred schedulers if this was the
/// outermost one.
pub fn reset_scheduling() {
    Root::global().reset_scheduling();
}

/// Install the host queues that receive [`Flush::Pre`] and [`Flush::Post`]
/// watcher jobs.
///
/// The reactive system does not own an event loop; it only hands each job to
/// the embedder at the time it would run. Without installed queues, jobs run
/// synchronously at dispatch time.
pub fn set_flush_queues(pre: impl Fn(Task) + 'static, post: impl Fn(Task) + 'static) {
    let root = Root::global();
    *root.flush_pre.borrow_mut() = Some(Box::new(pre));
    *root.flush_post.borrow_mut() = Some(Box::new(post));
}

/// Install a handler receiving panics raised by watcher callbacks.
///
/// With a handler installed, a panicking [`watch`] callback is caught, handed
/// to the handler, and the watcher stays armed for the next change. Without
/// one, the panic propagates to whoever performed the write.
pub fn set_error_handler(handler: impl Fn(Box<dyn Any + Send>) + 'static) {
    *Root::global().error_handler.borrow_mut() = Some(Box::new(handler));
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn untrack_suppresses_dependencies() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                untrack(|| {
                    let _ = state.get();
                });
            });
            assert_eq!(runs.get(), 1);

            state.set(1);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn batch_collapses_writes() {
        let _ = create_root(|| {
            let state1 = create_signal(1);
            let state2 = create_signal(2);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                let _ = state1.get() + state2.get();
            });
            assert_eq!(runs.get(), 1);
            state1.set(2);
            state2.set(3);
            assert_eq!(runs.get(), 3);
            batch(move || {
                state1.set(3);
                assert_eq!(runs.get(), 3);
                state2.set(4);
                assert_eq!(runs.get(), 3);
            });
            assert_eq!(runs.get(), 4);
        });
    }

    #[test]
    fn repeated_writes_in_batch_dispatch_once() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                state.track();
                runs.set_silent(runs.get_untracked() + 1);
            });
            batch(move || {
                state.set(1);
                state.set(2);
                state.set(3);
            });
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn nested_tracking_brackets() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set_silent(runs.get_untracked() + 1);
                pause_tracking();
                pause_tracking();
                reset_tracking();
                // Still paused: the outer bracket has not been reset yet.
                let _ = state.get();
                reset_tracking();
            });
            state.set(1);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn dispose_root() {
        let root = create_root(|| {
            let _ = create_signal(123);
        });
        root.dispose();
    }

    #[test]
    fn run_in_restores_previous_root() {
        let outer = create_root(|| {});
        let signal = outer.run_in(|| create_signal(1));
        outer.run_in(|| {
            signal.set(2);
            assert_eq!(signal.get(), 2);
        });
    }
}
