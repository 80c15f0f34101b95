//! `cncsort-cli` – CNCSort Command Line Interface
//!
//! This binary is the operator's entry point to the sorter.  It:
//!
//! 1. Loads `~/.cncsort/config.toml` (or `--config <path>`), writing the
//!    defaults on first run, and refuses to start on an invalid config.
//! 2. Assembles the event channel, subscribers, detection store, motion gate,
//!    bed-mapping orchestrator and planner.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/connect`, `/scan`, `/pick`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to cancel the running scan, pick or move at the
//!    next step boundary.

mod app;
mod config;
mod repl;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use tracing::warn;

use cncsort_types::CancelToken;

use crate::app::App;
use crate::config::Config;

fn main() -> ExitCode {
    let config_path = match parse_args(std::env::args().skip(1)) {
        Ok(Some(path)) => path,
        Ok(None) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("{} {}", "error:".red().bold(), msg);
            print_usage();
            return ExitCode::from(2);
        }
    };

    // Held until exit so buffered spans are flushed.
    let _telemetry = cncsort_runtime::init_tracing("cncsort");

    print_banner();

    let Some(cfg) = load_config(&config_path) else {
        return ExitCode::from(2);
    };

    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut app = match App::build(cfg, &base_dir, CancelToken::new()) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // Cancels whatever scan, pick or move is running; the REPL stays up.
    let cancel = app.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping at the next step …".yellow().bold());
        cancel.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; running operations cannot be cancelled");
    }

    let controller = &app.config().controller;
    println!("  Controller: {}", format!("{:?}", controller.kind).to_lowercase().bold());
    println!();
    println!(
        "  Type {} to reach the machine, {} for a list of commands.\n",
        "/connect".bold().cyan(),
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&mut app);
    ExitCode::SUCCESS
}

/// `Ok(None)` when help was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>, String> {
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-c" | "--config" => match args.next() {
                Some(p) => path = Some(PathBuf::from(p)),
                None => return Err("--config needs a path".to_string()),
            },
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }
    Ok(Some(path.unwrap_or_else(config::config_path)))
}

/// Load, override and validate.  Writes the defaults when no file exists.
fn load_config(path: &Path) -> Option<Config> {
    let cfg = match config::load_from(path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            match config::save_to(&cfg, path) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return None;
        }
    };
    if let Err(e) = cfg.validate() {
        eprintln!("{}: {}", "Config error".red(), e);
        return None;
    }
    Some(cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ________   ________                 __ "#.bold().cyan());
    println!("{}", r#"  / ____/ | / / ____/________  _____/ /_"#.bold().cyan());
    println!("{}", r#" / /   /  |/ / /   / ___/ __ \/ ___/ __/"#.bold().cyan());
    println!("{}", r#"/ /___/ /|  / /___(__  ) /_/ / /  / /_  "#.bold().cyan());
    println!("{}", r#"\____/_/ |_/\____/____/\____/_/   \__/  "#.bold().cyan());
    println!();
    println!("  {} {}",
        "CNCSort".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Bed mapping and pick planning for CNC object sorting");
    println!();
}

fn print_usage() {
    println!("usage: cncsort [--config <path>]");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn config_flag_overrides_default_path() {
        assert_eq!(
            parse_args(args(&["--config", "/etc/cncsort.toml"])),
            Ok(Some(PathBuf::from("/etc/cncsort.toml")))
        );
        assert_eq!(parse_args(args(&["-h"])), Ok(None));
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("cncsort").join("config.toml");
        let cfg = load_config(&path).expect("defaults load");
        assert_eq!(cfg.mapping, config::MappingConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn invalid_config_is_refused() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mapping]\nmin_captures = 1\n").expect("write");
        assert!(load_config(&path).is_none());
    }
}
