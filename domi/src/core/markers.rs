//! Workflow error markers that agents print to flag problems.
//!
//! Agents report `CRITICAL_WORKFLOW_ERROR: <message>` style lines (optionally
//! behind an emoji) when they cannot continue. Matching is case-insensitive.

use std::sync::LazyLock;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Warning,
    Error,
    Critical,
    Fatal,
}

impl ErrorLevel {
    /// Critical and fatal markers stop the phase.
    pub fn is_blocking(self) -> bool {
        self >= ErrorLevel::Critical
    }

    fn from_marker(marker: &str) -> ErrorLevel {
        match marker.to_ascii_uppercase().as_str() {
            "CRITICAL_WORKFLOW_ERROR" => ErrorLevel::Critical,
            "FATAL_WORKFLOW_ERROR" => ErrorLevel::Fatal,
            "WORKFLOW_ERROR" => ErrorLevel::Error,
            _ => ErrorLevel::Warning,
        }
    }
}

static MARKER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?im)\b(CRITICAL_WORKFLOW_ERROR|FATAL_WORKFLOW_ERROR|WORKFLOW_ERROR|WORKFLOW_WARNING):[ \t]*(\S.*?)[ \t]*$",
    )
    .expect("marker regex is valid")
});

/// Find every marker in `text`, in order of appearance.
pub fn detect_workflow_errors(text: &str) -> Vec<(ErrorLevel, String)> {
    MARKER_RE
        .captures_iter(text)
        .map(|caps| (ErrorLevel::from_marker(&caps[1]), caps[2].to_string()))
        .collect()
}

/// First blocking marker in `text`, if any.
pub fn first_blocking_error(text: &str) -> Option<(ErrorLevel, String)> {
    detect_workflow_errors(text)
        .into_iter()
        .find(|(level, _)| level.is_blocking())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_markers_with_and_without_emoji() {
        let text = "working...\n🚨 CRITICAL_WORKFLOW_ERROR: missing config file\n\
                    ⚠️ WORKFLOW_WARNING: using defaults\nworkflow_error: bad input  \n";
        let found = detect_workflow_errors(text);
        assert_eq!(
            found,
            vec![
                (ErrorLevel::Critical, "missing config file".to_string()),
                (ErrorLevel::Warning, "using defaults".to_string()),
                (ErrorLevel::Error, "bad input".to_string()),
            ]
        );
    }

    #[test]
    fn nested_marker_names_are_not_double_counted() {
        let found = detect_workflow_errors("FATAL_WORKFLOW_ERROR: disk gone");
        assert_eq!(found, vec![(ErrorLevel::Fatal, "disk gone".to_string())]);
    }

    #[test]
    fn first_blocking_skips_warnings() {
        let text = "WORKFLOW_WARNING: slow\nWORKFLOW_ERROR: retryable\nCRITICAL_WORKFLOW_ERROR: stop";
        assert_eq!(
            first_blocking_error(text),
            Some((ErrorLevel::Critical, "stop".to_string()))
        );
        assert_eq!(first_blocking_error("all good"), None);
    }
}
