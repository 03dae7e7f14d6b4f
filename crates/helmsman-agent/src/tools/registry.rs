//! Tool registry with action-space pruning.
//!
//! `set_allowed_tools` restricts the executable subset for a scoped
//! segment of work (typically a skill). The core set stays executable
//! no matter what; pruning never hides a tool from advertisement, it
//! only refuses execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::Tool;

/// Unconditionally allowed tools.
pub const CORE_TOOL_NAMES: &[&str] = &["read_file", "write_file", "run_code", "exit"];

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    allowed: Option<HashSet<String>>,
    pruning_enabled: bool,
}

impl ToolRegistry {
    pub fn new(pruning_enabled: bool) -> Self {
        Self {
            tools: HashMap::new(),
            allowed: None,
            pruning_enabled,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!("tool '{}' re-registered, replacing previous", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tool names, restriction or not: pruning refuses
    /// execution but does not hide existence.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect();
        entries.sort();
        entries
    }

    /// Restrict the executable subset. Core tools stay allowed.
    pub fn set_allowed_tools(&mut self, names: &[String]) {
        let mut allowed: HashSet<String> = names.iter().cloned().collect();
        for core in CORE_TOOL_NAMES {
            allowed.insert((*core).to_string());
        }
        self.allowed = Some(allowed);
    }

    pub fn reset_allowed_tools(&mut self) {
        self.allowed = None;
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        if !self.pruning_enabled {
            return true;
        }
        if CORE_TOOL_NAMES.contains(&name) {
            return true;
        }
        match &self.allowed {
            Some(allowed) => allowed.contains(name),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        async fn execute(&self, _args: Value) -> ToolResult {
            ToolResult::ok(self.0, "ok")
        }
    }

    #[test]
    fn test_pruning_respects_core_set() {
        let mut registry = ToolRegistry::new(true);
        registry.register(Arc::new(Named("web_search")));
        registry.register(Arc::new(Named("read_file")));

        registry.set_allowed_tools(&[]);
        assert!(!registry.is_allowed("web_search"));
        // The core set survives even an empty allow-list.
        assert!(registry.is_allowed("read_file"));
        assert!(registry.is_allowed("exit"));

        registry.reset_allowed_tools();
        assert!(registry.is_allowed("web_search"));
    }

    #[test]
    fn test_pruning_disabled_allows_all() {
        let mut registry = ToolRegistry::new(false);
        registry.register(Arc::new(Named("web_search")));
        registry.set_allowed_tools(&[]);
        assert!(registry.is_allowed("web_search"));
    }

    #[test]
    fn test_restricted_tools_still_advertised() {
        let mut registry = ToolRegistry::new(true);
        registry.register(Arc::new(Named("web_search")));
        registry.set_allowed_tools(&[]);
        assert!(registry.names().contains(&"web_search".to_string()));
    }
}
