//! Utility functions shared across the relayer crates.
//!
//! Integer arithmetic used by block election and fee scaling.

pub mod math;

pub use math::{ceil_mul, median_ceil, pow_scale, rounded_median};
