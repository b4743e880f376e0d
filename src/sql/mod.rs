//! Safe SQL builder: identifiers from materialized slugs only, values as parameters.

mod builder;
pub mod params;
pub use builder::*;
pub use params::*;
