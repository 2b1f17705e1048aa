//! Discovery output parsing
//!
//! The probe prints the discovered repositories as one JSON string array.
//! Runner noise (stderr, log lines) may be interleaved around it.

use crate::parser::ParseError;

/// Extracts the discovered project list from probe output
///
/// The whole payload is tried first; otherwise the first line that decodes
/// as a JSON string array wins. Output without any array is an error, never
/// an empty list.
pub fn parse_discovered_projects(output: &str) -> Result<Vec<String>, ParseError> {
    if let Ok(projects) = serde_json::from_str::<Vec<String>>(output) {
        return Ok(projects);
    }

    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('['))
        .find_map(|line| serde_json::from_str::<Vec<String>>(line).ok())
        .ok_or(ParseError::NoProjectArray {
            bytes: output.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_array() {
        assert_eq!(
            parse_discovered_projects(r#"["a","b"]"#).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_pretty_printed_array() {
        let output = "[\n  \"org/a\",\n  \"org/b\"\n]\n";
        assert_eq!(
            parse_discovered_projects(output).unwrap(),
            vec!["org/a", "org/b"]
        );
    }

    #[test]
    fn test_array_surrounded_by_noise() {
        let output = "(node:1) ExperimentalWarning: something\n\
                      {\"level\":30,\"msg\":\"Autodiscovered repositories\"}\n\
                      [\"org/a\",\"org/b\"]\n\
                      trailing noise";
        assert_eq!(
            parse_discovered_projects(output).unwrap(),
            vec!["org/a", "org/b"]
        );
    }

    #[test]
    fn test_empty_array_is_valid() {
        assert!(parse_discovered_projects("[]").unwrap().is_empty());
    }

    #[test]
    fn test_no_array_is_an_error() {
        assert_eq!(
            parse_discovered_projects("renovate crashed\n[not json").unwrap_err(),
            ParseError::NoProjectArray { bytes: 26 }
        );
        assert!(parse_discovered_projects("").is_err());
        assert!(parse_discovered_projects("null").is_err());
    }
}
