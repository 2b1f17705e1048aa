//! Runner log parsing
//!
//! Renovate writes one JSON object per line (`LOG_FORMAT=json`) with a
//! numeric bunyan level: 10 trace, 20 debug, 30 info, 40 warn, 50 error,
//! 60 fatal. The last line of a run carries `msg: "Repository finished"` and
//! a `result` field classifying the outcome.

use serde::Deserialize;
use std::io::BufRead;

/// Entries at or above this level count as issues
pub const WARN_LEVEL: i64 = 40;

/// Message of the summary line closing a repository run
pub const REPOSITORY_FINISHED: &str = "Repository finished";

const INITIAL_LINE_CAPACITY: usize = 64 * 1024;
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Verdict extracted from a run's log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogParseResult {
    /// At least one warning or error was logged
    pub has_issues: bool,
    /// Classification of the run, `None` when no summary line was seen
    pub result_status: Option<String>,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    level: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize)]
struct FinishedLine {
    #[serde(default)]
    result: String,
}

/// Parses a complete log
pub fn parse_renovate_logs(logs: &str) -> LogParseResult {
    parse_renovate_log_stream(logs.as_bytes())
}

/// Parses a log stream line by line
///
/// Malformed lines are skipped. The line buffer grows as needed; lines over
/// 1 MiB are treated as unparsable and skipped as well.
pub fn parse_renovate_log_stream<R: BufRead>(mut reader: R) -> LogParseResult {
    let mut result = LogParseResult::default();
    let mut line = Vec::with_capacity(INITIAL_LINE_CAPACITY);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if line.len() > MAX_LINE_LENGTH {
            continue;
        }

        let text = line.trim_ascii();
        if text.is_empty() {
            continue;
        }

        let Ok(entry) = serde_json::from_slice::<LogLine>(text) else {
            continue;
        };

        if entry.level >= WARN_LEVEL {
            result.has_issues = true;
        }

        if entry.msg == REPOSITORY_FINISHED {
            if let Ok(finished) = serde_json::from_slice::<FinishedLine>(text) {
                result.result_status = Some(classify_result(&finished.result));
            }
        }
    }

    result
}

/// Maps the raw `result` of the summary line to its display label
pub fn classify_result(result: &str) -> String {
    match result {
        "disabled-by-config" => "Disabled".to_string(),
        "disabled-closed-onboarding" => "Onboarding Closed".to_string(),
        "disabled-no-config" => "No Config".to_string(),
        "" => "Unknown".to_string(),
        other => other.to_string(),
    }
}
