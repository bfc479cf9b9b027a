//! What the `capture` hook records

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Master switch; disabled capture exits successfully without writing
    pub enabled: bool,
    /// Tool names never recorded (PreToolUse / PostToolUse)
    pub excluded_tools: Vec<String>,
    /// Hook event names to record; empty = all
    pub hook_types: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_tools: Vec::new(),
            hook_types: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileCapture {
    pub enabled: Option<bool>,
    pub excluded_tools: Option<Vec<String>>,
    pub hook_types: Option<Vec<String>>,
}

impl CaptureConfig {
    pub fn from_file(file: Option<FileCapture>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            excluded_tools: file.excluded_tools.unwrap_or(defaults.excluded_tools),
            hook_types: file.hook_types.unwrap_or(defaults.hook_types),
        }
    }

    pub fn allows_hook(&self, hook_event_name: &str) -> bool {
        self.hook_types.is_empty() || self.hook_types.iter().any(|h| h == hook_event_name)
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        !self.excluded_tools.iter().any(|t| t == tool_name)
    }
}
