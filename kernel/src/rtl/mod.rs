//! Runtime library (rtl)
//!
//! Self-contained data structures shared across the kernel.

pub mod avltree;

pub use avltree::{AvlNode, AvlTree};
