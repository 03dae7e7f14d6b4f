//! Three-files working memory: `task_plan`, `findings`, `progress`.
//!
//! The engine owns ordered writes; `progress` is append-only — prior
//! lines are never rewritten. The 2-Action and re-read-plan counters
//! live here and are scoped to the session.

use std::collections::HashMap;
use std::sync::Arc;

use helmsman_core::WorkspaceFs;

/// Search-style tools counted by the 2-Action rule.
const SEARCH_TOOLS: &[&str] = &["web_search", "read_url"];

/// Progress lines included in the memory-clear summary.
const SUMMARY_PROGRESS_LINES: usize = 20;

/// Result of recording an error.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord {
    /// Rolling count for this (session, error kind).
    pub count: usize,
    /// Set on every third same-kind error: re-read the plan before
    /// trying again.
    pub should_reread_plan: bool,
}

pub struct Scratchpad {
    fs: Arc<dyn WorkspaceFs>,
    session_id: String,
    action_count: usize,
    error_counts: HashMap<String, usize>,
}

impl Scratchpad {
    pub fn new(fs: Arc<dyn WorkspaceFs>, session_id: &str) -> Self {
        Self {
            fs,
            session_id: session_id.to_string(),
            action_count: 0,
            error_counts: HashMap::new(),
        }
    }

    fn path(&self, name: &str) -> String {
        format!("sessions/{}/{}.md", self.session_id, name)
    }

    fn read_file(&self, name: &str) -> String {
        let path = self.path(name);
        if !self.fs.exists(&path) {
            return String::new();
        }
        self.fs.read(&path).unwrap_or_default()
    }

    fn append(&self, name: &str, entry: &str) {
        let path = self.path(name);
        let mut content = self.read_file(name);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(entry);
        content.push('\n');
        if let Err(e) = self.fs.write(&path, &content) {
            tracing::error!("scratchpad write failed: {}", e);
        }
    }

    pub fn write_task_plan(&self, content: &str) {
        if let Err(e) = self.fs.write(&self.path("task_plan"), content) {
            tracing::error!("scratchpad write failed: {}", e);
        }
    }

    pub fn append_findings(&self, entry: &str) {
        self.append("findings", entry);
    }

    /// Append one progress entry. Error entries get a ❌ marker so a
    /// later read shows what went wrong.
    pub fn update_progress(&self, entry: &str, is_error: bool) {
        let stamped = format!(
            "[{}] {}{}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            if is_error { "❌ " } else { "" },
            entry
        );
        self.append("progress", &stamped);
    }

    pub fn read_task_plan(&self) -> String {
        self.read_file("task_plan")
    }

    pub fn read_findings(&self) -> String {
        self.read_file("findings")
    }

    pub fn read_progress(&self) -> String {
        self.read_file("progress")
    }

    /// Count a tool call toward the 2-Action rule. Returns true on every
    /// second search-style call: time to record findings.
    pub fn record_action(&mut self, tool_name: &str) -> bool {
        if !SEARCH_TOOLS.contains(&tool_name) {
            return false;
        }
        self.action_count += 1;
        self.action_count % 2 == 0
    }

    /// Record an error with a rolling per-kind count. Every third
    /// same-kind error flags a plan re-read.
    pub fn record_error(&mut self, error_type: &str, message: &str) -> ErrorRecord {
        let count = self.error_counts.entry(error_type.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.update_progress(&format!("{}: {}", error_type, message), true);
        ErrorRecord {
            count,
            should_reread_plan: count % 3 == 0,
        }
    }

    /// Snapshot for the memory-clear path: plan + findings + the tail of
    /// the progress log.
    pub fn summary_snapshot(&self) -> String {
        let plan = self.read_task_plan();
        let findings = self.read_findings();
        let progress = self.read_progress();
        let recent_progress: Vec<&str> = progress
            .lines()
            .rev()
            .take(SUMMARY_PROGRESS_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut sections = Vec::new();
        if !plan.trim().is_empty() {
            sections.push(format!("## Task Plan\n{}", plan.trim()));
        }
        if !findings.trim().is_empty() {
            sections.push(format!("## Findings\n{}", findings.trim()));
        }
        if !recent_progress.is_empty() {
            sections.push(format!("## Recent Progress\n{}", recent_progress.join("\n")));
        }
        sections.join("\n\n")
    }

    /// Reset session-scoped counters. Files are left alone.
    pub fn reset(&mut self) {
        self.action_count = 0;
        self.error_counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::MemoryFs;

    fn scratchpad() -> Scratchpad {
        Scratchpad::new(Arc::new(MemoryFs::new()), "s1")
    }

    #[test]
    fn test_progress_is_append_only() {
        let pad = scratchpad();
        pad.update_progress("first", false);
        pad.update_progress("second", true);
        let progress = pad.read_progress();
        let lines: Vec<&str> = progress.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("first"));
        assert!(lines[1].contains("❌ second"));
    }

    #[test]
    fn test_two_action_rule() {
        let mut pad = scratchpad();
        assert!(!pad.record_action("web_search"));
        assert!(pad.record_action("read_url"));
        assert!(!pad.record_action("web_search"));
        assert!(pad.record_action("web_search"));
        // Non-search tools never count.
        assert!(!pad.record_action("write_file"));
        assert!(!pad.record_action("read_file"));
    }

    #[test]
    fn test_record_error_flags_every_third() {
        let mut pad = scratchpad();
        assert!(!pad.record_error("read_url", "boom").should_reread_plan);
        assert!(!pad.record_error("read_url", "boom").should_reread_plan);
        let third = pad.record_error("read_url", "boom");
        assert_eq!(third.count, 3);
        assert!(third.should_reread_plan);
        // Counts are per error kind.
        assert!(!pad.record_error("web_search", "boom").should_reread_plan);
    }

    #[test]
    fn test_summary_snapshot_sections() {
        let pad = scratchpad();
        pad.write_task_plan("1. do the thing");
        pad.append_findings("the thing is feasible");
        pad.update_progress("started", false);
        let summary = pad.summary_snapshot();
        assert!(summary.contains("## Task Plan"));
        assert!(summary.contains("## Findings"));
        assert!(summary.contains("## Recent Progress"));
    }

    #[test]
    fn test_reset_clears_counters_not_files() {
        let mut pad = scratchpad();
        pad.record_action("web_search");
        pad.record_error("x", "boom");
        pad.reset();
        // Counter restarts: first search call after reset does not flag.
        assert!(!pad.record_action("web_search"));
        assert_eq!(pad.record_error("x", "boom").count, 1);
        // The progress log survives.
        assert!(!pad.read_progress().is_empty());
    }
}
