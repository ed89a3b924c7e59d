//! # Models
//!
//! Model implementations for spatially structured area-level outcome data.
//! The crate ships one family: the hierarchical CAR model in [`car`].

pub mod car;
