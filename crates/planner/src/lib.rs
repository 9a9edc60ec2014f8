//! Execution graph handed from the planner to the distributed coordinator.
//!
//! The planner decides *what* runs *where*; this crate only carries the
//! result: per-group unit lists, the node ids authorized to run each unit,
//! downstream wiring, and the final merge spec of every group.

pub mod graph;
pub mod unit;

pub use graph::*;
pub use unit::*;
