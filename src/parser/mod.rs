//! W3C extended log format parsing

mod line;
mod schema;

pub use line::{hour_of_day, parse_line};
pub use schema::{classify, Directive, FieldMap};
