//! Data models shared by the engine layer and its callers.

pub mod query;

pub use query::{ExecuteResult, QueryParam, Row, Statement};
