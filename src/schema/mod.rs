//! Field-list → storage schema compilation.

mod compiler;
mod mapper;

pub use compiler::*;
pub use mapper::*;
