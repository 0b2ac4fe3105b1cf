//! Reactive signals — the built-in reactive source.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{AddAssign, Deref, DivAssign, MulAssign, RemAssign, SubAssign};

use slotmap::new_key_type;

use crate::*;

new_key_type! {
    pub(crate) struct SignalId;
}

/// Value cell of one signal, plus the subject its reads and writes go
/// through. The runtime itself never looks inside the value; it only sees
/// the subject.
pub(crate) struct SignalNode {
    pub value: Option<Box<dyn std::any::Any>>,
    pub dep: DepId,
}

/// A read-only reactive value.
///
/// Unlike the difference between Rust's shared and mutable-references (`&T`
/// and `&mut`), the underlying data is not immutable. The data can be updated
/// with the corresponding [`Signal`] (which has mutable access) and will show
/// up in the `ReadSignal` as well.
///
/// A `ReadSignal` can be simply obtained by dereferencing a [`Signal`]. In
/// fact, every [`Signal`] is a `ReadSignal` with additional write abilities!
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let signal: Signal<i32> = create_signal(123);
/// let read_signal: ReadSignal<i32> = *signal;
/// assert_eq!(read_signal.get(), 123);
/// signal.set(456);
/// assert_eq!(read_signal.get(), 456);
/// // read_signal.set(789); // <-- This is not allowed!
/// # });
/// ```
///
/// See [`create_signal`] for more information.
pub struct ReadSignal<T: 'static> {
    pub(crate) id: SignalId,
    root: &'static Root,
    /// Keep track of where the signal was created for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to.
///
/// This is the writable analog of [`ReadSignal`].
///
/// See [`create_signal`] for more information.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`].
///
/// Signals are reactive atoms, pieces of state that can be read and written
/// to and which will automatically update anything which depends on them.
///
/// # Usage
/// The simplest way to use a signal is [`.get()`](ReadSignal::get) and
/// [`.set(...)`](Signal::set). For values that do not implement [`Copy`],
/// use [`.get_clone()`](ReadSignal::get_clone) or
/// [`.with(...)`](ReadSignal::with).
///
/// ```rust
/// # use pulse_reactive::*;
/// # let _ = create_root(|| {
/// let signal = create_signal(1);
/// assert_eq!(signal.get(), 1);
/// signal.set(2);
/// assert_eq!(signal.get(), 2);
/// # });
/// ```
///
/// # Reactivity
/// Accessing a signal inside a subscriber (an effect, a computed, a watcher)
/// automatically registers it as a dependency, so updating the signal later
/// re-runs exactly those subscribers. Writes that leave the value unchanged,
/// as decided by [`SameValue`], do not notify anyone.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T>(value: T) -> Signal<T> {
    let root = Root::global();
    let dep = insert_dep(root, None);
    let id = root.signals.borrow_mut().insert(SignalNode {
        value: Some(Box::new(value)),
        dep,
    });
    Signal(ReadSignal {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

impl<T> ReadSignal<T> {
    /// Run `f` against the stored value, with the value cell temporarily
    /// taken so that `f` may freely read other reactive values.
    #[cfg_attr(debug_assertions, track_caller)]
    fn with_value<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let value = {
            let mut signals = self.root.signals.borrow_mut();
            match signals.get_mut(self.id) {
                Some(node) => node.value.take().expect("value updating"),
                None => panic!("{}", self.get_disposed_panic_message()),
            }
        };
        let ret = f(value.downcast_ref().expect("wrong signal type"));
        if let Some(node) = self.root.signals.borrow_mut().get_mut(self.id) {
            node.value = Some(value);
        }
        ret
    }

    pub(crate) fn dep(self) -> DepId {
        match self.root.signals.borrow().get(self.id) {
            Some(node) => node.dep,
            None => panic!("{}", self.get_disposed_panic_message()),
        }
    }

    /// Returns `true` if the signal is still alive, i.e. has not yet been
    /// disposed.
    pub fn is_alive(self) -> bool {
        self.root.signals.borrow().get(self.id).is_some()
    }

    /// Disposes the signal, i.e. frees up the memory held on by this signal.
    /// Accessing a signal after it has been disposed immediately causes a
    /// panic.
    pub fn dispose(self) {
        let dep = self.root.signals.borrow_mut().remove(self.id).map(|n| n.dep);
        if let Some(dep) = dep {
            self.root.deps.borrow_mut().remove(dep);
        }
    }

    fn get_disposed_panic_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "signal was disposed".to_string();

        #[cfg(debug_assertions)]
        return format!("signal was disposed. Created at {}", self.created_at);
    }

    /// Get the value of the signal without tracking it. The type must
    /// implement [`Copy`]. If this is not the case, use
    /// [`ReadSignal::get_clone_untracked`] or [`ReadSignal::with_untracked`]
    /// instead.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value of the signal without tracking it. The type is
    /// [`Clone`]-ed automatically.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get the value of the signal. The type must implement [`Copy`]. If this
    /// is not the case, use [`ReadSignal::get_clone`] or
    /// [`ReadSignal::with`] instead.
    ///
    /// When called inside a reactive scope, the signal will be automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Get the value of the signal. The type is [`Clone`]-ed automatically.
    ///
    /// When called inside a reactive scope, the signal will be automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Get a value from the signal without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.with_value(f)
    }

    /// Get a value from the signal.
    ///
    /// When called inside a reactive scope, the signal will be automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_value(f)
    }

    /// Track the signal in the current reactive scope. This is done
    /// automatically when calling [`ReadSignal::get`] and other similar
    /// methods.
    pub fn track(self) {
        track_dep(self.root, self.dep());
    }
}

impl<T> Signal<T> {
    /// Silently set a new value for the signal. This will not trigger any
    /// updates in dependent subscribers. As such, this is generally not
    /// recommended as it can easily lead to state inconsistencies.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_silent(self, new: T) {
        self.replace_silent(new);
    }

    /// Set a new value for the signal and automatically update any
    /// dependents, unless the new value is [the same](SameValue) as the
    /// current one.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T)
    where
        T: SameValue,
    {
        self.replace(new);
    }

    /// Silently set a new value for the signal and return the previous value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace_silent(self, new: T) -> T {
        self.update_silent(|val| std::mem::replace(val, new))
    }

    /// Set a new value for the signal and return the previous value,
    /// notifying dependents only if the value meaningfully changed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T
    where
        T: SameValue,
    {
        let changed = !self.with_untracked(|old| new.same_value(old));
        let old = self.replace_silent(new);
        if changed {
            trigger_dep(self.0.root, self.dep(), DirtyLevel::Dirty);
        }
        old
    }

    /// Silently replace the value with [`Default::default()`], returning the
    /// previous value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take_silent(self) -> T
    where
        T: Default,
    {
        self.replace_silent(T::default())
    }

    /// Replace the value with [`Default::default()`], returning the previous
    /// value and notifying dependents on change.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Default + SameValue,
    {
        self.replace(T::default())
    }

    /// Update the value of the signal silently. This will not trigger any
    /// updates in dependent subscribers. As such, this is generally not
    /// recommended as it can easily lead to state inconsistencies.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update_silent<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut value = {
            let mut signals = self.0.root.signals.borrow_mut();
            match signals.get_mut(self.0.id) {
                Some(node) => node.value.take().expect("value updating"),
                None => panic!("{}", self.0.get_disposed_panic_message()),
            }
        };
        let ret = f(value.downcast_mut().expect("wrong signal type"));
        if let Some(node) = self.0.root.signals.borrow_mut().get_mut(self.0.id) {
            node.value = Some(value);
        }
        ret
    }

    /// Update the value of the signal in place and notify dependents.
    ///
    /// The mutation is opaque, so dependents are notified unconditionally.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let ret = self.update_silent(f);
        trigger_dep(self.0.root, self.dep(), DirtyLevel::Dirty);
        ret
    }

    /// Replace the value with the output of `f` applied to the current
    /// value, without notifying dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn_silent(self, f: impl FnOnce(&T) -> T) {
        self.update_silent(move |val| *val = f(val));
    }

    /// Replace the value with the output of `f` applied to the current
    /// value, notifying dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T) {
        self.update(move |val| *val = f(val));
    }

    /// Creates a derived, memoised view of this signal.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn map<U>(self, mut f: impl FnMut(&T) -> U + 'static) -> Computed<U> {
        create_computed_with(move || self.with(|value| f(value)), |_, _| false)
    }

    /// Split the signal into a read half and a setter function.
    pub fn split(self) -> (ReadSignal<T>, impl Fn(T) -> T)
    where
        T: SameValue,
    {
        (*self, move |value| self.replace(value))
    }
}

/// We manually implement `Clone` + `Copy` for `Signal` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

// Implement `Default` for `ReadSignal` and `Signal`.
impl<T: Default> Default for ReadSignal<T> {
    fn default() -> Self {
        *create_signal(Default::default())
    }
}
impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

// Forward `PartialEq`, `Eq`, `PartialOrd`, `Ord`, `Hash` from inner type.
// Comparing a handle against itself short-circuits, since the value cell can
// only be taken once at a time.
impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: PartialOrd> PartialOrd for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.id == other.id {
            return Some(std::cmp::Ordering::Equal);
        }
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.id == other.id {
            return std::cmp::Ordering::Equal;
        }
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T: Eq> Eq for Signal<T> {}
impl<T: PartialOrd> PartialOrd for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}
impl<T: Ord> Ord for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}
impl<T: Hash> Hash for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Formatting implementations for `ReadSignal` and `Signal`.
impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// Serde implementations for `ReadSignal` and `Signal`.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for ReadSignal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(*create_signal(T::deserialize(deserializer)?))
    }
}
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Signal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}

impl<T: AddAssign<Rhs>, Rhs> AddAssign<Rhs> for Signal<T> {
    fn add_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this += rhs);
    }
}
impl<T: SubAssign<Rhs>, Rhs> SubAssign<Rhs> for Signal<T> {
    fn sub_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this -= rhs);
    }
}
impl<T: MulAssign<Rhs>, Rhs> MulAssign<Rhs> for Signal<T> {
    fn mul_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this *= rhs);
    }
}
impl<T: DivAssign<Rhs>, Rhs> DivAssign<Rhs> for Signal<T> {
    fn div_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this /= rhs);
    }
}
impl<T: RemAssign<Rhs>, Rhs> RemAssign<Rhs> for Signal<T> {
    fn rem_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this %= rhs);
    }
}

/// An alternative to [`create_signal`] that uses a reducer to get the next
/// value.
///
/// It uses a reducer function that takes the previous value and a message and
/// returns the next value.
///
/// Returns a [`ReadSignal`] and a dispatch function to send messages to the
/// reducer.
///
/// # Example
/// ```
/// # use pulse_reactive::*;
/// enum Msg {
///     Increment,
///     Decrement,
/// }
///
/// # let _ = create_root(|| {
/// let (state, dispatch) = create_reducer(0, |&state, msg: Msg| match msg {
///     Msg::Increment => state + 1,
///     Msg::Decrement => state - 1,
/// });
///
/// assert_eq!(state.get(), 0);
/// dispatch(Msg::Increment);
/// assert_eq!(state.get(), 1);
/// dispatch(Msg::Decrement);
/// assert_eq!(state.get(), 0);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_reducer<T, Msg>(
    initial: T,
    reduce: impl FnMut(&T, Msg) -> T,
) -> (ReadSignal<T>, impl Fn(Msg)) {
    let reduce = std::cell::RefCell::new(reduce);
    let signal = create_signal(initial);
    let dispatch = move |msg| signal.update(|value| *value = reduce.borrow_mut()(value, msg));
    (*signal, dispatch)
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            assert_eq!(state.get(), 0);

            state.set(1);
            assert_eq!(state.get(), 1);

            state.set_fn(|n| *n + 1);
            assert_eq!(state.get(), 2);
        });
    }

    #[test]
    fn signal_equal_write_does_not_notify() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let log = create_signal(Vec::new());
            create_effect(move || {
                let n = state.get();
                log.update_silent(|l| l.push(n));
            });
            assert_eq!(log.get_clone(), vec![1]);

            state.set(2);
            assert_eq!(log.get_clone(), vec![1, 2]);

            state.set(2); // unchanged, nobody notified
            assert_eq!(log.get_clone(), vec![1, 2]);
        });
    }

    #[test]
    fn set_silent_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = state.map(|&x| x * 2);

            assert_eq!(double.get(), 0);
            state.set_silent(1);
            assert_eq!(double.get(), 0); // double value is unchanged.

            state.set_fn_silent(|n| n + 1);
            assert_eq!(double.get(), 0); // double value is unchanged.
        });
    }

    #[test]
    fn read_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let readonly: ReadSignal<i32> = *state;

            assert_eq!(readonly.get(), 0);
            state.set(1);
            assert_eq!(readonly.get(), 1);
        });
    }

    #[test]
    fn map_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = state.map(|&x| x * 2);

            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn take_signal() {
        let _ = create_root(|| {
            let state = create_signal(123);

            let x = state.take();
            assert_eq!(x, 123);
            assert_eq!(state.get(), 0);
        });
    }

    #[test]
    fn take_silent_signal() {
        let _ = create_root(|| {
            let state = create_signal(123);
            let double = state.map(|&x| x * 2);

            // Do not trigger subscribers.
            state.take_silent();
            assert_eq!(state.get(), 0);
            assert_eq!(double.get(), 246);
        });
    }

    #[test]
    fn signal_split() {
        let _ = create_root(|| {
            let (state, set_state) = create_signal(0).split();
            assert_eq!(state.get(), 0);

            set_state(1);
            assert_eq!(state.get(), 1);
        });
    }

    #[test]
    fn signal_display() {
        let _ = create_root(|| {
            let signal = create_signal(0);
            assert_eq!(format!("{signal}"), "0");
            let read_signal: ReadSignal<_> = *signal;
            assert_eq!(format!("{read_signal}"), "0");
            let computed = create_computed(|| 0);
            assert_eq!(format!("{computed}"), "0");
        });
    }

    #[test]
    fn signal_debug() {
        let _ = create_root(|| {
            let signal = create_signal(0);
            assert_eq!(format!("{signal:?}"), "0");
            let read_signal: ReadSignal<_> = *signal;
            assert_eq!(format!("{read_signal:?}"), "0");
        });
    }

    #[test]
    fn signal_add_assign_update() {
        let _ = create_root(|| {
            let mut signal = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                signal.track();
                runs.set(runs.get_untracked() + 1);
            });
            signal += 1;
            signal -= 1;
            signal *= 1;
            signal /= 1;
            assert_eq!(runs.get(), 5);
        });
    }

    #[test]
    fn signal_update() {
        let _ = create_root(|| {
            let signal = create_signal("Hello ".to_string());
            let runs = create_signal(0);
            create_effect(move || {
                signal.track();
                runs.set(runs.get_untracked() + 1);
            });
            signal.update(|value| value.push_str("World!"));
            assert_eq!(signal.get_clone(), "Hello World!");
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn signal_composition() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = || state.get() * 2;

            assert_eq!(double(), 0);
            state.set(1);
            assert_eq!(double(), 2);
        });
    }

    #[test]
    fn reducer() {
        let _ = create_root(|| {
            enum Msg {
                Increment,
                Decrement,
            }

            let (state, dispatch) = create_reducer(0, |state, msg: Msg| match msg {
                Msg::Increment => *state + 1,
                Msg::Decrement => *state - 1,
            });

            assert_eq!(state.get(), 0);
            dispatch(Msg::Increment);
            assert_eq!(state.get(), 1);
            dispatch(Msg::Decrement);
            assert_eq!(state.get(), 0);
        });
    }

    #[test]
    fn nested_reads_inside_with() {
        let _ = create_root(|| {
            let first = create_signal("a".to_string());
            let second = create_signal("b".to_string());
            let combined = first.with(|a| second.with(|b| format!("{a}{b}")));
            assert_eq!(combined, "ab");
        });
    }
}
