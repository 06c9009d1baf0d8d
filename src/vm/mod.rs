//! The execution engine: operator shapes, components, module bundles, and
//! the dispatch loop that drives them from broker traffic.

pub mod calculator;
pub mod component;
pub(crate) mod dispatch;
pub mod module;
pub mod operator;

pub use component::{Component, ComponentFactory};
pub use module::{builtin_module, Module};
pub use operator::{
    ActiveRun, InstantFunction, InstantMethod, IterativeMethod, Method, MethodRun, Step,
};
