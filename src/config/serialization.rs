//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::Config;

impl Config {
    /// Serialize `[capture]` list values
    fn string_list(items: &[String]) -> String {
        let quoted: Vec<String> = items.iter().map(|s| format!("{s:?}")).collect();
        format!("[{}]", quoted.join(", "))
    }

    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# hookq configuration
#
# Environment overrides: HOOKQ_ROOT, HOOKQ_DB, HOOKQ_WORKERS,
# HOOKQ_HEALTH_BIND, HOOKQ_LOG_LEVEL (RUST_LOG overrides the log level too)

# ─────────────────────────────────────────────────────────────────────────────
# QUEUE
# ─────────────────────────────────────────────────────────────────────────────
# Hook invocations write one file per event into <root>/incoming/. The daemon
# moves each through processing/ to archive/ (or failed/).

[queue]
root = "{queue_root}"
retention = "{retention}"  # archive, delete
archive_retention_days = {archive_days}  # 0 = keep forever
reconcile_interval_secs = {reconcile}
watch = {watch}  # false = polling only

# ─────────────────────────────────────────────────────────────────────────────
# PIPELINE
# ─────────────────────────────────────────────────────────────────────────────

[pipeline]
workers = {workers}
work_queue_capacity = {capacity}
max_attempts = {max_attempts}
base_backoff_ms = {base_backoff}
max_backoff_ms = {max_backoff}
stale_after_secs = {stale_after}

# ─────────────────────────────────────────────────────────────────────────────
# CORRELATOR
# ─────────────────────────────────────────────────────────────────────────────
# Events whose predecessor (prompt, tool invocation) has not arrived yet are
# held, then applied with a gap flag after pending_timeout_secs.

[correlator]
pending_timeout_secs = {pending_timeout}
pending_capacity = {pending_capacity}
session_idle_evict_secs = {idle_evict}

[store]
db_path = "{db_path}"
busy_timeout_ms = {busy_timeout}
pool_size = {pool_size}

[health]
enabled = {health_enabled}
bind_addr = "{health_bind}"

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
# File logging (JSON, in addition to the console)
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = "{log_file_prefix}"

# ─────────────────────────────────────────────────────────────────────────────
# CAPTURE (hookq capture)
# ─────────────────────────────────────────────────────────────────────────────
# hook_types: hook event names to record (UserPromptSubmit, PreToolUse,
# PostToolUse, Stop, SubagentStop, SessionStart, SessionEnd); empty = all

[capture]
enabled = {capture_enabled}
excluded_tools = {excluded_tools}
hook_types = {hook_types}
"#,
            queue_root = self.queue.root.display(),
            retention = self.queue.retention.as_str(),
            archive_days = self.queue.archive_retention_days,
            reconcile = self.queue.reconcile_interval_secs,
            watch = self.queue.watch,
            workers = self.pipeline.workers,
            capacity = self.pipeline.work_queue_capacity,
            max_attempts = self.pipeline.max_attempts,
            base_backoff = self.pipeline.base_backoff_ms,
            max_backoff = self.pipeline.max_backoff_ms,
            stale_after = self.pipeline.stale_after_secs,
            pending_timeout = self.correlator.pending_timeout_secs,
            pending_capacity = self.correlator.pending_capacity,
            idle_evict = self.correlator.session_idle_evict_secs,
            db_path = self.store.db_path.display(),
            busy_timeout = self.store.busy_timeout_ms,
            pool_size = self.store.pool_size,
            health_enabled = self.health.enabled,
            health_bind = self.health.bind_addr,
            log_level = self.logging.level,
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = self.logging.file_dir.display(),
            log_file_rotation = self.logging.file_rotation.as_str(),
            log_file_prefix = self.logging.file_prefix,
            capture_enabled = self.capture.enabled,
            excluded_tools = Self::string_list(&self.capture.excluded_tools),
            hook_types = Self::string_list(&self.capture.hook_types),
        )
    }

    /// Write this configuration to the config file
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config path",
            ));
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, self.to_toml())
    }
}
