//! Parsers for workload output
//!
//! - `logs`: classifies the NDJSON log stream of a runner execution
//! - `discovery`: extracts the project list printed by a discovery probe

pub mod discovery;
pub mod logs;

pub use discovery::parse_discovered_projects;
pub use logs::{LogParseResult, parse_renovate_logs};

/// Errors raised while parsing workload output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The discovery output contained no JSON string array
    #[error("no valid JSON array found in discovery logs ({bytes} bytes)")]
    NoProjectArray { bytes: usize },
}
