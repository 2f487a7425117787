//! Command-line interface.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use sb_domain::config::Config;

#[derive(Parser)]
#[command(name = "switchboard", about = "LLM-agent orchestration hub")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the hub (default).
    Run,
    /// Check the environment: state dir, databases, transcript roots.
    Doctor,
    /// Print the version.
    Version,
}

/// Load config from `--config`, `./switchboard.toml`, or
/// `~/.switchboard/config.toml`, falling back to defaults.
pub fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![path.clone()],
        None => {
            let mut paths = vec![PathBuf::from("switchboard.toml")];
            if let Some(home) = dirs::home_dir() {
                paths.push(home.join(".switchboard").join("config.toml"));
            }
            paths
        }
    };

    for path in candidates {
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: Config = toml::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?;
            return Ok((config, Some(path)));
        } else if explicit.is_some() {
            anyhow::bail!("config file not found: {}", path.display());
        }
    }
    Ok((Config::default(), None))
}

/// Environment checks for `switchboard doctor`. Returns overall pass.
pub fn doctor(config: &Config) -> bool {
    let mut passed = true;
    let mut check = |name: &str, ok: bool, detail: String| {
        let mark = if ok { "ok" } else { "FAIL" };
        println!("[{mark}] {name}: {detail}");
        passed &= ok;
    };

    let state_dir = &config.state.dir;
    let writable = std::fs::create_dir_all(state_dir)
        .and_then(|_| {
            let probe = state_dir.join(".doctor-probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    check("state dir", writable, state_dir.display().to_string());

    let db_ok = crate::routes::RouteStore::open(&state_dir.join("deploy.db")).is_ok();
    check("route database", db_ok, "deploy.db".into());

    let roots = sb_sessions::monitor::SessionMonitor::default_roots();
    let any_root = roots.iter().any(|r| r.exists());
    check(
        "transcript roots",
        true, // informational: absence just means no sessions yet
        if any_root {
            "found".into()
        } else {
            "none present yet".into()
        },
    );

    let claude_on_path = which(&config.providers.claude_bin);
    check(
        "assistant CLI",
        true, // informational
        if claude_on_path {
            config.providers.claude_bin.clone()
        } else {
            format!("{} not on PATH", config.providers.claude_bin)
        },
    );

    passed
}

fn which(bin: &str) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':')
        .any(|dir| std::path::Path::new(dir).join(bin).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_config_is_an_error() {
        let path = PathBuf::from("/definitely/not/here.toml");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn explicit_config_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();
        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(source, Some(path));
    }
}
