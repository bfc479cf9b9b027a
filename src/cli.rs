// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - run (default): start the daemon and the health endpoint
// - capture: Claude Code hook entry point (stdin JSON -> queue file)
// - drain: process everything queued once, synchronously
// - status: queue depths, store statistics, dead letters
// - retry-failed: move dead-lettered files back to incoming/
// - show: print a reconstructed conversation as JSON
// - config: --show / --path / --reset / --edit

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hookq::config::{Config, VERSION};
use hookq::correlator::Correlator;
use hookq::hook::{self, CaptureOutcome};
use hookq::pipeline::Pipeline;
use hookq::queue::{DeadLetter, QueueLayout, QueueState, QueueWriter};
use hookq::store::{PersistenceAdapter, SqliteStore};
use serde::Serialize;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;

/// hookq - durable hook-event queue and conversation correlator
#[derive(Parser)]
#[command(name = "hookq")]
#[command(version = VERSION)]
#[command(about = "Durable hook-event queue and conversation correlator for Claude Code", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the background daemon (default)
    Run,

    /// Record one Claude Code hook event read from stdin
    Capture,

    /// Process everything currently queued, then exit
    Drain,

    /// Show queue depths, store statistics and dead letters
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move every dead-lettered file back to incoming/
    RetryFailed,

    /// Print a reconstructed conversation as JSON
    Show {
        /// Session id of the conversation
        session_id: String,
    },

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Print where hookq looks for config.toml
    #[arg(long)]
    path: bool,

    /// Print the effective settings (file and environment merged) as TOML
    #[arg(long)]
    show: bool,

    /// Back up config.toml and write the defaults
    #[arg(long)]
    reset: bool,

    /// Open config.toml in $VISUAL / $EDITOR, then validate it
    #[arg(long)]
    edit: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// capture
// ─────────────────────────────────────────────────────────────────────────────

/// Hook entry point; never fails the client's action
///
/// Exit status 0 on success or when filtered, 1 (a non-blocking hook error)
/// when the event could not be recorded.
pub fn handle_capture(config: &Config) {
    let result = QueueWriter::new(QueueLayout::new(&config.queue.root))
        .map_err(hook::HookError::from)
        .and_then(|writer| hook::capture(std::io::stdin().lock(), &writer, &config.capture));

    match result {
        Ok(CaptureOutcome::Written(path)) => {
            tracing::trace!(path = %path.display(), "Hook event queued");
        }
        Ok(CaptureOutcome::Filtered) => {}
        Ok(CaptureOutcome::Skipped(name)) => {
            tracing::debug!("Ignoring hook event {}", name);
        }
        Err(e) => {
            eprintln!("hookq: {}", e);
            std::process::exit(1);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// drain / status / retry-failed / show
// ─────────────────────────────────────────────────────────────────────────────

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.store.db_path, config.store.options())
        .with_context(|| format!("Failed to open database {}", config.store.db_path.display()))?;
    Ok(Arc::new(store))
}

pub fn handle_drain(config: &Config) -> Result<()> {
    let layout = QueueLayout::new(&config.queue.root);
    layout.ensure()?;

    let correlator = Arc::new(Correlator::new(open_store(config)?, config.correlator.to_runtime()));
    correlator.recover_pending()?;
    let pipeline = Pipeline::new(layout, correlator, config.pipeline_options());

    let report = pipeline.drain()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    queue_root: String,
    queue: hookq::queue::QueueDepths,
    store: hookq::store::StoreStats,
    failed: Vec<DeadLetter>,
}

pub fn handle_status(config: &Config, json: bool) -> Result<()> {
    let layout = QueueLayout::new(&config.queue.root);
    let store = open_store(config)?;

    let report = StatusReport {
        queue_root: layout.root().display().to_string(),
        queue: layout.depths()?,
        store: store.stats()?,
        failed: layout.dead_letters()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Queue: {}", report.queue_root);
    println!("  incoming    {}", report.queue.incoming);
    println!("  processing  {}", report.queue.processing);
    println!("  failed      {}", report.queue.failed);
    println!("  archive     {}", report.queue.archive);
    println!();
    println!("Store: {}", config.store.db_path.display());
    println!(
        "  conversations  {} ({} active)",
        report.store.conversations, report.store.active_conversations
    );
    println!(
        "  exchanges      {} ({} open)",
        report.store.exchanges, report.store.open_exchanges
    );
    println!("  events         {}", report.store.events);
    println!("  pending        {}", report.store.pending);
    println!("  gaps           {}", report.store.gaps);
    println!("  size           {} bytes", report.store.db_size_bytes);

    if !report.failed.is_empty() {
        println!();
        println!("Dead letters:");
        for letter in &report.failed {
            let origin = match (&letter.session_id, &letter.event_kind) {
                (Some(session), Some(kind)) => format!("{session} {kind}"),
                _ => "unrecognized name".to_string(),
            };
            match &letter.detail {
                Some(d) => println!(
                    "  {} ({}) [{}, {} attempt(s)] {}",
                    letter.file,
                    origin,
                    d.kind.as_str(),
                    d.attempts,
                    d.error
                ),
                None => println!("  {} ({}) [no error detail]", letter.file, origin),
            }
        }
        println!();
        println!("Run `hookq retry-failed` to queue them again.");
    }
    Ok(())
}

pub fn handle_retry_failed(config: &Config) -> Result<()> {
    let layout = QueueLayout::new(&config.queue.root);
    let mut moved = 0;
    for name in layout.list(QueueState::Failed)? {
        if layout.requeue_failed(&name)? {
            moved += 1;
        }
    }
    println!("Moved {} file(s) back to incoming/", moved);
    Ok(())
}

pub fn handle_show(config: &Config, session_id: &str) -> Result<()> {
    let store = open_store(config)?;
    match store.conversation(session_id)? {
        Some(view) => {
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        None => anyhow::bail!("No conversation for session {}", session_id),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

/// Handle `config` flags; runs before the config is loaded so a broken file
/// can still be reset or edited
pub fn handle_config(args: &ConfigArgs) {
    if args.path {
        handle_config_path();
    } else if args.show {
        handle_config_show();
    } else if args.reset {
        handle_config_reset();
    } else if args.edit {
        handle_config_edit();
    } else {
        println!("Usage: hookq config [--path|--show|--reset|--edit]");
        println!();
        println!("  --path    Print where hookq looks for config.toml");
        println!("  --show    Print the effective settings as TOML");
        println!("  --reset   Back up config.toml and write the defaults");
        println!("  --edit    Open config.toml in $VISUAL / $EDITOR, then validate it");
    }
}

/// Config path, or exit when there is no config directory on this platform
fn config_path_or_exit() -> std::path::PathBuf {
    Config::config_path().unwrap_or_else(|| {
        eprintln!("hookq: no config directory on this platform (set HOOKQ_ROOT / HOOKQ_DB instead)");
        std::process::exit(1);
    })
}

fn handle_config_path() {
    println!("{}", config_path_or_exit().display());
}

fn handle_config_show() {
    let path = config_path_or_exit();
    let config = Config::load().unwrap_or_else(|e| {
        e.report();
        std::process::exit(1);
    });

    let source = if path.exists() {
        path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    println!("# hookq {} effective configuration", VERSION);
    println!("# from {} (HOOKQ_* environment variables take precedence)", source);
    println!();
    print!("{}", config.to_toml());
}

fn handle_config_reset() {
    let path = config_path_or_exit();

    if path.exists() {
        eprint!("Replace {} with the default hookq config? [y/N] ", path.display());
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        let confirmed = std::io::stdin().read_line(&mut answer).is_ok()
            && matches!(answer.trim(), "y" | "Y" | "yes");
        if !confirmed {
            println!("Left {} unchanged.", path.display());
            return;
        }

        // Keep the old file around; a broken config is often worth a look
        let backup = path.with_extension("toml.bak");
        if let Err(e) = std::fs::copy(&path, &backup) {
            eprintln!("hookq: could not back up {}: {}", path.display(), e);
            std::process::exit(1);
        }
        println!("Previous config saved as {}", backup.display());
    }

    if let Err(e) = Config::default().save() {
        eprintln!("hookq: could not write {}: {}", path.display(), e);
        std::process::exit(1);
    }
    println!("Wrote default config to {}", path.display());
}

/// `$VISUAL`, then `$EDITOR`, then a platform default; blank values are unset
fn editor(env: impl Fn(&str) -> Option<String>) -> String {
    ["VISUAL", "EDITOR"]
        .into_iter()
        .find_map(|var| env(var).filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| (if cfg!(windows) { "notepad" } else { "vi" }).to_string())
}

fn handle_config_edit() {
    let path = config_path_or_exit();
    if !path.exists() {
        Config::ensure_config_exists();
    }

    let editor = editor(|var| std::env::var(var).ok());
    let status = Command::new(&editor).arg(&path).status().unwrap_or_else(|e| {
        eprintln!("hookq: could not start editor '{}': {} (set $VISUAL or $EDITOR)", editor, e);
        std::process::exit(1);
    });
    if !status.success() {
        eprintln!("hookq: {} exited with {}", editor, status);
        std::process::exit(1);
    }

    // Catch mistakes now rather than at the next daemon start
    match Config::load() {
        Ok(_) => println!("{} is valid.", path.display()),
        Err(e) => {
            e.report();
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_editor_prefers_visual() {
        assert_eq!(editor(vars(&[("VISUAL", "hx"), ("EDITOR", "nano")])), "hx");
        assert_eq!(editor(vars(&[("VISUAL", "  "), ("EDITOR", "nano")])), "nano");
    }

    #[test]
    fn test_editor_falls_back_to_platform_default() {
        let fallback = if cfg!(windows) { "notepad" } else { "vi" };
        assert_eq!(editor(vars(&[])), fallback);
    }

    #[test]
    fn test_config_flags_parse() {
        let cli = Cli::try_parse_from(["hookq", "config", "--reset"]).unwrap();
        match cli.command {
            Some(Commands::Config(args)) => assert!(args.reset && !args.edit),
            _ => panic!("expected config subcommand"),
        }
        assert!(Cli::try_parse_from(["hookq", "status", "--json"]).is_ok());
    }
}
