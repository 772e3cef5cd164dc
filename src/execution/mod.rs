//! Execution wire types: submission result, plot artifact and log entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a build of the rendering library. Compared by exact string match.
pub type VersionId = String;

/// A plot produced by the sandbox. Only `version` is interpreted; the rest is
/// handed to the rendering library untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionId>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotArtifact>,
}

impl ExecutionResult {
    pub fn has_stderr(&self) -> bool {
        self.stderr.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn log_entry(&self) -> LogEntry {
        LogEntry {
            execution_time: self.execution_time,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

/// What the log sink displays for one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    pub execution_time: Option<f64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl LogEntry {
    pub fn failure(message: String) -> Self {
        Self { execution_time: Some(0.0), stdout: Some(String::new()), stderr: Some(message) }
    }

    /// `0.010 秒`, or `-` when absent or zero.
    pub fn formatted_time(&self) -> String {
        match self.execution_time {
            Some(t) if t != 0.0 && t.is_finite() => format!("{:.3} 秒", t),
            _ => "-".to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.stderr.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// stdout and stderr joined by a newline when both are present.
    pub fn combined(&self) -> String {
        let out = self.stdout.as_deref().unwrap_or("");
        let err = self.stderr.as_deref().unwrap_or("");
        match (out.is_empty(), err.is_empty()) {
            (false, false) => format!("{}\n{}", out, err),
            (false, true) => out.to_string(),
            (true, false) => err.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// One row of `/api/programs/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plot_with_opaque_payload() {
        let raw = r#"{"success":true,"plot":{"version":"3.3.3","target_id":null,"doc":{"roots":[]}}}"#;
        let result: ExecutionResult = serde_json::from_str(raw).unwrap();
        let plot = result.plot.unwrap();
        assert_eq!(plot.version.as_deref(), Some("3.3.3"));
        assert!(plot.payload.contains_key("doc"));
        assert!(!plot.payload.contains_key("version"));

        let back = serde_json::to_value(&plot).unwrap();
        assert_eq!(back["version"], "3.3.3");
        assert_eq!(back["doc"]["roots"], serde_json::json!([]));
    }

    #[test]
    fn missing_fields_default() {
        let result: ExecutionResult = serde_json::from_str("{}").unwrap();
        assert!(!result.success);
        assert!(result.plot.is_none());
        assert!(!result.has_stderr());
    }

    #[test]
    fn formats_execution_time() {
        let entry = LogEntry { execution_time: Some(0.01), ..Default::default() };
        assert_eq!(entry.formatted_time(), "0.010 秒");
        assert_eq!(LogEntry::default().formatted_time(), "-");
        assert_eq!(LogEntry::failure("x".into()).formatted_time(), "-");
    }

    #[test]
    fn combines_streams() {
        let both = LogEntry { stdout: Some("1\n".into()), stderr: Some("boom".into()), ..Default::default() };
        assert_eq!(both.combined(), "1\n\nboom");
        assert!(both.is_error());

        let only_out = LogEntry { stdout: Some("1\n".into()), stderr: Some(String::new()), ..Default::default() };
        assert_eq!(only_out.combined(), "1\n");
        assert!(!only_out.is_error());
    }
}
