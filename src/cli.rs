//! Command-line surface for embedding applications.
//!
//! The engine itself is a library; binaries built on it parse these flags
//! and hand the loaded [`EngineConfig`] to the session coordinator. Exit
//! code 0 on success, non-zero on any engine error.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{self, EngineConfig};
use crate::error::Result;

#[derive(Parser, Debug, Clone)]
#[command(about = "Drive load scenarios against a target and aggregate per-step statistics")]
pub struct Cli {
    /// Path to the session config (JSON).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the infra config (logger, reporting sinks).
    #[arg(short, long)]
    pub infra: Option<PathBuf>,
}

impl Cli {
    /// Load the engine config named by `--config`, or defaults when the
    /// flag is absent.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => config::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_and_infra_paths() {
        let cli = Cli::parse_from(["bench", "-c", "session.json", "--infra", "infra.json"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("session.json")));
        assert_eq!(cli.infra.as_deref(), Some(std::path::Path::new("infra.json")));
    }

    #[test]
    fn no_flags_means_default_config() {
        let cli = Cli::parse_from(["bench"]);
        assert!(cli.engine_config().is_ok());
    }
}
