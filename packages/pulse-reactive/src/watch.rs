//! Watchers: value-change callbacks with old/new comparison.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::*;

/// When a watcher job runs relative to the write that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flush {
    /// Hand the job to the host pre-flush queue. Without an installed queue
    /// (see [`set_flush_queues`]), the job runs synchronously.
    #[default]
    Pre,
    /// Hand the job to the host post-render queue. Without an installed
    /// queue, the job runs synchronously.
    Post,
    /// Run the job directly when the write burst ends.
    Sync,
}

/// How far a watcher traverses into its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deep {
    /// Only the watched source itself is tracked.
    #[default]
    Off,
    /// Traverse the whole value, tracking every nested reactive handle.
    All,
    /// Traverse at most this many levels of structure.
    Levels(u32),
}

/// Options for [`watch_with`].
#[derive(Default)]
pub struct WatchOptions {
    /// Invoke the callback right away with the initial value (and no previous
    /// value).
    pub immediate: bool,
    /// Traversal depth into the watched value. Any setting other than
    /// [`Deep::Off`] also makes every dispatch count as a change, since the
    /// mutation happened somewhere inside the structure.
    pub deep: Deep,
    /// Stop the watcher after the first callback invocation.
    pub once: bool,
    /// When the job runs. See [`Flush`].
    pub flush: Flush,
}

/// Registers cleanup functions on behalf of a watcher callback.
///
/// A registered function runs just before the next callback invocation, and
/// when the watcher stops — whichever comes first. Use it to cancel work
/// started by the previous invocation.
#[derive(Clone)]
pub struct OnCleanup {
    registered: Rc<RefCell<Vec<Box<dyn FnOnce()>>>>,
}

impl OnCleanup {
    /// Register `f` to run before the next callback invocation or on stop.
    pub fn register(&self, f: impl FnOnce() + 'static) {
        self.registered.borrow_mut().push(Box::new(f));
    }
}

type Cleanups = Rc<RefCell<Vec<Box<dyn FnOnce()>>>>;

fn run_cleanups(cleanups: &Cleanups) {
    let fns = std::mem::take(&mut *cleanups.borrow_mut());
    for f in fns {
        f();
    }
}

/// A handle that stops a watcher.
#[derive(Clone, Copy)]
pub struct WatchHandle {
    id: EffectId,
    root: &'static Root,
}

impl WatchHandle {
    /// Stop the watcher: run its pending cleanups, detach it from every
    /// subject and release it. Idempotent.
    pub fn stop(self) {
        dispose_effect(self.root, self.id);
    }

    /// Returns `true` if the watcher has not been stopped.
    pub fn is_alive(self) -> bool {
        self.root.effects.borrow().get(self.id).is_some()
    }
}

/// Something a watcher can observe: a [`Signal`], a [`Computed`], a getter
/// closure, or a tuple of sources (watched together, yielding a tuple of
/// values).
pub trait WatchSource {
    /// The value produced by reading the source.
    type Value;

    /// Read the current value, registering dependencies along the way.
    fn read_value(&mut self) -> Self::Value;
}

impl<T: Clone + 'static> WatchSource for Signal<T> {
    type Value = T;

    fn read_value(&mut self) -> T {
        self.get_clone()
    }
}

impl<T: Clone + 'static> WatchSource for ReadSignal<T> {
    type Value = T;

    fn read_value(&mut self) -> T {
        self.get_clone()
    }
}

impl<T: Clone + 'static> WatchSource for Computed<T> {
    type Value = T;

    fn read_value(&mut self) -> T {
        self.get_clone()
    }
}

impl<T, F: FnMut() -> T> WatchSource for F {
    type Value = T;

    fn read_value(&mut self) -> T {
        self()
    }
}

macro_rules! impl_watch_source_for_tuple {
    ($($S:tt),*) => {
        paste::paste! {
            impl<$($S,)*> WatchSource for ($($S,)*)
            where
                $($S: WatchSource,)*
            {
                type Value = ($($S::Value,)*);

                fn read_value(&mut self) -> Self::Value {
                    let ($([<$S:lower>],)*) = self;
                    ($([<$S:lower>].read_value(),)*)
                }
            }
        }
    }
}

impl_watch_source_for_tuple!(A, B);
impl_watch_source_for_tuple!(A, B, C);
impl_watch_source_for_tuple!(A, B, C, D);
impl_watch_source_for_tuple!(A, B, C, D, E);
impl_watch_source_for_tuple!(A, B, C, D, E, F);
impl_watch_source_for_tuple!(A, B, C, D, E, F, G);
impl_watch_source_for_tuple!(A, B, C, D, E, F, G, H);

/// Run a watcher callback, routing a panic to the installed error handler
/// if there is one. The watcher survives either way.
fn guard_callback(root: &'static Root, f: impl FnOnce()) {
    if root.error_handler.borrow().is_some() {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            let handler = root.error_handler.borrow();
            if let Some(handler) = &*handler {
                handler(payload);
            }
        }
    } else {
        f();
    }
}

/// Hand `task` to the host queue for `flush`, or run it synchronously when no
/// queue is installed.
fn dispatch_task(root: &'static Root, flush: Flush, task: Task) {
    let cell = match flush {
        Flush::Pre => &root.flush_pre,
        Flush::Post => &root.flush_post,
        Flush::Sync => {
            task();
            return;
        }
    };
    let mut task = Some(task);
    {
        let queue = cell.borrow();
        if let Some(enqueue) = &*queue {
            enqueue(task.take().expect("task already dispatched"));
        }
    }
    if let Some(task) = task {
        task();
    }
}

/// Wrap a job into the scheduler the flush mode asks for.
fn flush_scheduler(root: &'static Root, flush: Flush, job: Rc<RefCell<dyn FnMut()>>) -> Scheduler {
    match flush {
        Flush::Sync => Scheduler::Job(job),
        Flush::Pre | Flush::Post => Scheduler::Job(Rc::new(RefCell::new(move || {
            let job = job.clone();
            dispatch_task(root, flush, Box::new(move || job.borrow_mut()()));
        }))),
    }
}

/// Watches a reactive source and calls `callback` with the new and the
/// previous value whenever the source meaningfully changes.
///
/// The previous value is `None` only for an
/// [`immediate`](WatchOptions::immediate) invocation, which reports the
/// initial value before any change happened.
///
/// Returns a [`WatchHandle`] that stops the watcher.
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(5);
/// watch(state, |new, old, _on_cleanup| {
///     println!("state changed from {old:?} to {new}");
/// });
///
/// state.set(6); // Prints "state changed from Some(5) to 6"
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch<S, F>(source: S, callback: F) -> WatchHandle
where
    S: WatchSource + 'static,
    S::Value: SameValue + DeepTrack + 'static,
    F: FnMut(&S::Value, Option<&S::Value>, OnCleanup) + 'static,
{
    watch_with(source, callback, WatchOptions::default())
}

/// Watches a reactive source with explicit [`WatchOptions`].
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(5);
/// watch_with(
///     state,
///     |new, old, _on_cleanup| println!("{old:?} -> {new}"),
///     WatchOptions {
///         immediate: true, // Prints "None -> 5" right away
///         ..Default::default()
///     },
/// );
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch_with<S, F>(mut source: S, callback: F, options: WatchOptions) -> WatchHandle
where
    S: WatchSource + 'static,
    S::Value: SameValue + DeepTrack + 'static,
    F: FnMut(&S::Value, Option<&S::Value>, OnCleanup) + 'static,
{
    let root = Root::global();
    let latest: Rc<RefCell<Option<S::Value>>> = Rc::new(RefCell::new(None));
    let cleanups: Cleanups = Rc::new(RefCell::new(Vec::new()));
    let callback = Rc::new(RefCell::new(callback));

    let deep = options.deep;
    let getter = {
        let latest = latest.clone();
        move |_: &mut Box<dyn Any>| {
            let value = source.read_value();
            match deep {
                Deep::Off => {}
                Deep::All => value.deep_track(&mut DeepTracker::unbounded()),
                Deep::Levels(n) => value.deep_track(&mut DeepTracker::bounded(n)),
            }
            *latest.borrow_mut() = Some(value);
            true
        }
    };
    let id = insert_effect(
        root,
        EffectState {
            value: Some(Box::new(())),
            callback: Rc::new(RefCell::new(getter)),
            computed: None,
            scheduler: None,
            active: true,
            deps: SmallVec::new(),
            deps_len: 0,
            dirty_level: DirtyLevel::Dirty,
            track_id: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            on_stop: Some({
                let cleanups = cleanups.clone();
                Box::new(move || run_cleanups(&cleanups))
            }),
        },
    );

    // Baseline run: collect dependencies and remember the initial value
    // without invoking the callback.
    run_effect(root, id);
    let previous: Rc<RefCell<Option<S::Value>>> = Rc::new(RefCell::new(latest.borrow_mut().take()));

    let force_changed = !matches!(deep, Deep::Off);
    let once = options.once;
    let job: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new({
        let latest = latest.clone();
        let previous = previous.clone();
        let cleanups = cleanups.clone();
        let callback = callback.clone();
        move || {
            let active = root.effects.borrow().get(id).is_some_and(|e| e.active);
            if !active || !effect_dirty(root, id) {
                return;
            }
            run_effect(root, id);
            let Some(new_value) = latest.borrow_mut().take() else {
                return;
            };
            let old_value = previous.borrow_mut().take();
            let changed = force_changed
                || old_value
                    .as_ref()
                    .map_or(true, |old| !new_value.same_value(old));
            if !changed {
                *previous.borrow_mut() = old_value;
                return;
            }
            run_cleanups(&cleanups);
            let registrar = OnCleanup {
                registered: cleanups.clone(),
            };
            guard_callback(root, || {
                callback.borrow_mut()(&new_value, old_value.as_ref(), registrar);
            });
            *previous.borrow_mut() = Some(new_value);
            if once {
                dispose_effect(root, id);
            }
        }
    }));
    if let Some(e) = root.effects.borrow_mut().get_mut(id) {
        e.scheduler = Some(flush_scheduler(root, options.flush, job));
    }

    if options.immediate {
        let baseline = previous.borrow_mut().take();
        if let Some(value) = baseline {
            let registrar = OnCleanup {
                registered: cleanups.clone(),
            };
            guard_callback(root, || {
                callback.borrow_mut()(&value, None, registrar);
            });
            *previous.borrow_mut() = Some(value);
            if once {
                dispose_effect(root, id);
            }
        }
    }

    WatchHandle { id, root }
}

/// Runs `f` immediately and re-runs it whenever one of the reactive values it
/// read changes. `f` receives an [`OnCleanup`] registrar whose cleanups run
/// before every re-run and on stop.
///
/// Re-runs go through the [`Flush::Pre`] queue; see [`watch_effect_with`] for
/// other flush modes.
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// watch_effect(move |_on_cleanup| {
///     println!("state = {}", state.get());
/// });
/// // Prints "state = 0"
///
/// state.set(1);
/// // Prints "state = 1"
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch_effect(f: impl FnMut(OnCleanup) + 'static) -> WatchHandle {
    watch_effect_with(f, Flush::Pre)
}

/// [`watch_effect`] re-running on the host post-render queue.
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch_post_effect(f: impl FnMut(OnCleanup) + 'static) -> WatchHandle {
    watch_effect_with(f, Flush::Post)
}

/// [`watch_effect`] re-running synchronously at the end of each write burst.
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch_sync_effect(f: impl FnMut(OnCleanup) + 'static) -> WatchHandle {
    watch_effect_with(f, Flush::Sync)
}

/// Runs `f` immediately and re-runs it through the given [`Flush`] mode
/// whenever one of the reactive values it read changes.
#[cfg_attr(debug_assertions, track_caller)]
pub fn watch_effect_with(mut f: impl FnMut(OnCleanup) + 'static, flush: Flush) -> WatchHandle {
    let root = Root::global();
    let cleanups: Cleanups = Rc::new(RefCell::new(Vec::new()));
    let callback = {
        let cleanups = cleanups.clone();
        move |_: &mut Box<dyn Any>| {
            run_cleanups(&cleanups);
            f(OnCleanup {
                registered: cleanups.clone(),
            });
            true
        }
    };
    let id = insert_effect(
        root,
        EffectState {
            value: Some(Box::new(())),
            callback: Rc::new(RefCell::new(callback)),
            computed: None,
            scheduler: None,
            active: true,
            deps: SmallVec::new(),
            deps_len: 0,
            dirty_level: DirtyLevel::Dirty,
            track_id: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            on_stop: Some({
                let cleanups = cleanups.clone();
                Box::new(move || run_cleanups(&cleanups))
            }),
        },
    );
    let job: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(move || {
        let active = root.effects.borrow().get(id).is_some_and(|e| e.active);
        if active && effect_dirty(root, id) {
            run_effect(root, id);
        }
    }));
    if let Some(e) = root.effects.borrow_mut().get_mut(id) {
        e.scheduler = Some(flush_scheduler(root, flush, job));
    }
    run_effect(root, id);
    WatchHandle { id, root }
}
