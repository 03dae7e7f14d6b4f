//! Failure signals: the normalized error record every tool and LLM
//! invocation produces, successful or not.
//!
//! The exit code carries the retry semantics: 0 success, 1 retryable
//! failure, 2 needs user intervention, 3 fatal.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSource {
    Tool,
    Validation,
    Timeout,
    User,
    Llm,
    System,
}

impl FailureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::User => "user",
            Self::Llm => "llm",
            Self::System => "system",
        }
    }
}

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExecutionError,
    ValidationFailed,
    Timeout,
    Rejected,
    NetworkError,
    PermissionDenied,
    ResourceNotFound,
    InvalidParams,
    RateLimited,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionError => "execution_error",
            Self::ValidationFailed => "validation_failed",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::NetworkError => "network_error",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceNotFound => "resource_not_found",
            Self::InvalidParams => "invalid_params",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }
}

/// Exit codes: 0 success, 1 retryable failure, 2 needs user, 3 fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    Failure,
    NeedUser,
    Fatal,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NeedUser => 2,
            Self::Fatal => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::NeedUser,
            3 => Self::Fatal,
            _ => Self::Failure,
        }
    }
}

/// Normalized failure record. Exactly one signal is produced per tool
/// invocation, including successful ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    pub source: FailureSource,
    pub kind: FailureKind,
    pub exit_code: ExitCode,
    pub error_message: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl FailureSignal {
    pub fn is_success(&self) -> bool {
        self.exit_code == ExitCode::Success
    }

    /// Fatal exit codes and parameter/permission problems are never
    /// retryable: retrying them repeats the same mistake.
    pub fn is_retryable(&self) -> bool {
        if self.exit_code == ExitCode::Fatal {
            return false;
        }
        !matches!(
            self.kind,
            FailureKind::PermissionDenied | FailureKind::InvalidParams
        )
    }

    pub fn needs_user_intervention(&self) -> bool {
        self.exit_code == ExitCode::NeedUser
    }

    /// Human-readable hint derived from the failure kind, with a keyword
    /// scan of the error message as fallback. Stateless.
    pub fn learning(&self) -> String {
        let hint = match self.kind {
            FailureKind::Timeout => {
                Some("Operation timed out; increase the timeout or simplify the operation")
            }
            FailureKind::PermissionDenied => {
                Some("Permission denied; check file or API permissions")
            }
            FailureKind::ResourceNotFound => {
                Some("Resource not found; verify the path or URL")
            }
            FailureKind::NetworkError => {
                Some("Network error; check connectivity or retry later")
            }
            FailureKind::RateLimited => {
                Some("Rate limited; lower the request frequency or wait before retrying")
            }
            FailureKind::InvalidParams => {
                Some("Invalid parameters; check argument format and types")
            }
            FailureKind::ValidationFailed => {
                Some("Validation failed; check that the output meets the acceptance criteria")
            }
            _ => None,
        };
        if let Some(h) = hint {
            return h.to_string();
        }

        let lower = self.error_message.to_lowercase();
        if lower.contains("timeout") {
            return "Operation timed out; increase the timeout or simplify the operation".into();
        }
        if lower.contains("permission") || lower.contains("denied") {
            return "Permission denied; check file or API permissions".into();
        }
        if lower.contains("not found") || lower.contains("404") {
            return "Resource not found; verify the path or URL".into();
        }
        if lower.contains("connection") || lower.contains("network") {
            return "Network error; check connectivity or retry later".into();
        }
        if lower.contains("rate limit") || lower.contains("429") {
            return "Rate limited; lower the request frequency or wait before retrying".into();
        }

        match &self.tool_name {
            Some(tool) => format!("Tool {} failed: {}", tool, self.error_message),
            None => format!("Execution failed: {}", self.error_message),
        }
    }

    pub fn severity(&self) -> &'static str {
        match self.exit_code {
            ExitCode::Success => "none",
            ExitCode::Fatal => "critical",
            ExitCode::NeedUser => "warning",
            ExitCode::Failure => "error",
        }
    }

    /// Progress-log entry. Failures keep their exit code, error, and
    /// learning so later turns can read what went wrong.
    pub fn to_progress_entry(&self) -> String {
        let status = if self.is_success() { "✅" } else { "❌" };
        let mut lines = vec![format!(
            "{} [{}] {}",
            status,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.source.as_str()
        )];
        if let Some(tool) = &self.tool_name {
            lines.push(format!("   Tool: {}", tool));
        }
        if !self.is_success() {
            let retry = if self.is_retryable() { " [retryable]" } else { "" };
            lines.push(format!("   Exit Code: {}{}", self.exit_code.code(), retry));
            lines.push(format!("   Error: {}", self.error_message));
            lines.push(format!("   Learning: {}", self.learning()));
        }
        lines.join("\n")
    }

    /// Build a signal from a tool result. Permission failures map to the
    /// needs-user exit code.
    pub fn from_tool_result(
        tool_name: &str,
        success: bool,
        error: Option<&str>,
        stderr: &str,
        tool_args: Option<Value>,
    ) -> Self {
        if success {
            return Self {
                source: FailureSource::Tool,
                kind: FailureKind::ExecutionError,
                exit_code: ExitCode::Success,
                error_message: String::new(),
                stderr: String::new(),
                tool_name: Some(tool_name.to_string()),
                tool_args,
                timestamp: Utc::now(),
            };
        }

        let kind = Self::infer_kind(error.unwrap_or(""), stderr);
        let exit_code = if kind == FailureKind::PermissionDenied {
            ExitCode::NeedUser
        } else {
            ExitCode::Failure
        };

        Self {
            source: FailureSource::Tool,
            kind,
            exit_code,
            error_message: error.unwrap_or("Unknown error").to_string(),
            stderr: stderr.to_string(),
            tool_name: Some(tool_name.to_string()),
            tool_args,
            timestamp: Utc::now(),
        }
    }

    pub fn infer_kind(error: &str, stderr: &str) -> FailureKind {
        let combined = format!("{} {}", error, stderr).to_lowercase();
        if combined.contains("timeout") {
            FailureKind::Timeout
        } else if combined.contains("permission") || combined.contains("denied") {
            FailureKind::PermissionDenied
        } else if combined.contains("not found") || combined.contains("404") {
            FailureKind::ResourceNotFound
        } else if combined.contains("connection") || combined.contains("network") {
            FailureKind::NetworkError
        } else if combined.contains("rate limit") || combined.contains("429") {
            FailureKind::RateLimited
        } else if combined.contains("invalid") || combined.contains("param") {
            FailureKind::InvalidParams
        } else {
            FailureKind::ExecutionError
        }
    }

    pub fn success(tool_name: Option<&str>) -> Self {
        Self {
            source: if tool_name.is_some() {
                FailureSource::Tool
            } else {
                FailureSource::System
            },
            kind: FailureKind::ExecutionError,
            exit_code: ExitCode::Success,
            error_message: String::new(),
            stderr: String::new(),
            tool_name: tool_name.map(|s| s.to_string()),
            tool_args: None,
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(tool_name: Option<&str>, timeout_secs: u64) -> Self {
        Self {
            source: FailureSource::Timeout,
            kind: FailureKind::Timeout,
            exit_code: ExitCode::Failure,
            error_message: format!("Operation timed out after {}s", timeout_secs),
            stderr: String::new(),
            tool_name: tool_name.map(|s| s.to_string()),
            tool_args: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user_cancelled() -> Self {
        Self {
            source: FailureSource::User,
            kind: FailureKind::Rejected,
            exit_code: ExitCode::NeedUser,
            error_message: "Operation cancelled by user".into(),
            stderr: String::new(),
            tool_name: None,
            tool_args: None,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded ring of recent non-success signals, appended to the context
/// so the model stops repeating the same mistake.
#[derive(Debug, Clone, Default)]
pub struct FailureSummary {
    recent: VecDeque<FailureSignal>,
}

impl FailureSummary {
    pub const MAX_FAILURES: usize = 5;

    /// Successful signals are ignored; the ring holds at most
    /// [`Self::MAX_FAILURES`] entries.
    pub fn add(&mut self, signal: FailureSignal) {
        if signal.is_success() {
            return;
        }
        self.recent.push_back(signal);
        while self.recent.len() > Self::MAX_FAILURES {
            self.recent.pop_front();
        }
    }

    pub fn same_kind_count(&self, kind: FailureKind) -> usize {
        self.recent.iter().filter(|f| f.kind == kind).count()
    }

    pub fn same_tool_count(&self, tool_name: &str) -> usize {
        self.recent
            .iter()
            .filter(|f| f.tool_name.as_deref() == Some(tool_name))
            .count()
    }

    /// The 3-strike rule: three same-kind or same-tool failures within
    /// the window.
    pub fn should_trigger_three_strike(&self, signal: &FailureSignal) -> bool {
        if self.same_kind_count(signal.kind) >= 3 {
            return true;
        }
        if let Some(tool) = &signal.tool_name {
            if self.same_tool_count(tool) >= 3 {
                return true;
            }
        }
        false
    }

    pub fn to_markdown(&self) -> String {
        if self.recent.is_empty() {
            return String::new();
        }
        let mut lines = vec!["## ⚠️ Recent failures (do not repeat)".to_string()];
        for f in &self.recent {
            let tool_info = f
                .tool_name
                .as_deref()
                .map(|t| format!(" ({})", t))
                .unwrap_or_default();
            lines.push(format!("- {}{}: {}", f.kind.as_str(), tool_info, f.learning()));
        }
        lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailureSignal> {
        self.recent.iter()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(tool: &str, error: &str) -> FailureSignal {
        FailureSignal::from_tool_result(tool, false, Some(error), "", None)
    }

    #[test]
    fn test_kind_inference() {
        assert_eq!(
            failed("read_url", "connection refused").kind,
            FailureKind::NetworkError
        );
        assert_eq!(
            failed("read_url", "HTTP 404").kind,
            FailureKind::ResourceNotFound
        );
        assert_eq!(
            failed("shell", "permission denied").kind,
            FailureKind::PermissionDenied
        );
        assert_eq!(failed("api", "429 rate limit").kind, FailureKind::RateLimited);
        assert_eq!(failed("x", "boom").kind, FailureKind::ExecutionError);
    }

    #[test]
    fn test_permission_denied_maps_to_need_user() {
        let sig = failed("shell", "permission denied");
        assert_eq!(sig.exit_code, ExitCode::NeedUser);
        assert!(sig.needs_user_intervention());
        assert!(!sig.is_retryable());
    }

    #[test]
    fn test_retryable_rules() {
        assert!(failed("read_url", "connection reset").is_retryable());
        assert!(!failed("t", "invalid param value").is_retryable());

        let mut fatal = failed("t", "boom");
        fatal.exit_code = ExitCode::Fatal;
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_summary_bounded_at_five() {
        let mut summary = FailureSummary::default();
        for i in 0..8 {
            summary.add(failed(&format!("tool{}", i), "boom"));
        }
        assert_eq!(summary.len(), FailureSummary::MAX_FAILURES);
        // Oldest entries evicted first.
        assert_eq!(summary.same_tool_count("tool0"), 0);
        assert_eq!(summary.same_tool_count("tool7"), 1);
    }

    #[test]
    fn test_summary_ignores_success() {
        let mut summary = FailureSummary::default();
        summary.add(FailureSignal::success(Some("web_search")));
        assert!(summary.is_empty());
    }

    #[test]
    fn test_three_strike_same_kind() {
        let mut summary = FailureSummary::default();
        let sig = failed("a", "connection reset");
        summary.add(failed("a", "connection reset"));
        summary.add(failed("b", "network unreachable"));
        assert!(!summary.should_trigger_three_strike(&sig));
        summary.add(failed("c", "connection refused"));
        assert!(summary.should_trigger_three_strike(&sig));
    }

    #[test]
    fn test_three_strike_same_tool() {
        let mut summary = FailureSummary::default();
        summary.add(failed("read_url", "boom"));
        summary.add(failed("read_url", "timeout"));
        summary.add(failed("read_url", "invalid param"));
        let sig = failed("read_url", "anything");
        assert!(summary.should_trigger_three_strike(&sig));
    }

    #[test]
    fn test_three_strike_never_fires_after_clear() {
        let mut summary = FailureSummary::default();
        for _ in 0..3 {
            summary.add(failed("read_url", "boom"));
        }
        summary.clear();
        let sig = failed("read_url", "boom");
        assert!(!summary.should_trigger_three_strike(&sig));
    }

    #[test]
    fn test_progress_entry_keeps_failure_detail() {
        let entry = failed("read_url", "connection refused").to_progress_entry();
        assert!(entry.contains("❌"));
        assert!(entry.contains("Tool: read_url"));
        assert!(entry.contains("Exit Code: 1"));
        assert!(entry.contains("Learning:"));
    }
}
