//! Natural-language analytics questions over Mixpanel, backed by a
//! discoverable schema catalog.

pub mod analytics;
pub mod api;
pub mod catalog;
pub mod config;
pub mod describe;
pub mod discovery;
pub mod error;
pub mod interpret;
pub mod llm;
pub mod pipeline;
pub mod summarize;
pub mod trace;
pub mod workflow;

pub use error::{InsightError, Result};
