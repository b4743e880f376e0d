//! Flat filter/sort payloads → structured queries over materialized collections.

mod filter;
mod normalize;
mod translate;

pub use filter::*;
pub use normalize::normalize;
pub use translate::*;
