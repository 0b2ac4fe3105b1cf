//! Reactive primitives for Pulse.
//!
//! This crate implements a fine-grained reactivity runtime: reads of reactive
//! values are observed while a subscriber function runs, a dependency graph is
//! built between values and the functions that read them, and writes
//! re-schedule exactly the affected functions.
//!
//! The building blocks are [`Signal`] (a reactive value), [`create_effect`] (a
//! function re-run when its dependencies change), [`create_computed`] (a lazy,
//! memoised derived value) and [`watch`] (a value-change callback receiving
//! old and new values). External reactive sources can participate through
//! [`create_dep`], [`DepHandle::track`] and [`DepHandle::trigger`].

#![warn(missing_docs)]

mod computed;
mod deep;
mod dep;
mod effect;
mod root;
mod signal;
mod utils;
mod watch;

pub use computed::*;
pub use deep::*;
pub use dep::*;
pub use effect::*;
pub use root::*;
pub use signal::*;
pub use utils::*;
pub use watch::*;
