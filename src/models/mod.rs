//! Model traits and wrappers
//!
//! [`CellModel`] is the contract a physical model implements. The wrappers
//! turn it into the raw-array [`ModelWrapper`] interface that the
//! filters operate on.

mod cell;
mod wrapper;

pub use cell::*;
pub use wrapper::*;
