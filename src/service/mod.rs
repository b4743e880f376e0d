//! Table, field and row services over the materialization core.

mod fields;
mod rows;
mod tables;
pub mod validation;

pub use fields::{FieldService, FieldUpdate, NewField};
pub use rows::RowService;
pub use tables::{NewTable, TableService};
pub use validation::RowValidator;
