//! Runtime configuration.
//!
//! A JSON config file controls where repositories are checked out,
//! where the external summarizer lives, and where reports land. The
//! loaded configuration is a plain value threaded through the
//! orchestrator and registry.

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    local_folder: Utf8PathBuf,
    codeql_bin: Utf8PathBuf,
    query_path: Utf8PathBuf,
    enable_low_priority_reports: bool,
    results_folder: Utf8PathBuf,
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// Where repositories and actions are checked out.
    pub(crate) local_folder: Utf8PathBuf,
    /// The external code-analysis binary.
    pub(crate) codeql_bin: Utf8PathBuf,
    /// The query pack evaluated against JS actions.
    pub(crate) query_path: Utf8PathBuf,
    /// Also consume the less-dangerous sink partitions.
    pub(crate) enable_low_priority_reports: bool,
    /// Where SARIF reports are written.
    pub(crate) results_folder: Utf8PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_folder: "/tmp".into(),
            codeql_bin: "codeql".into(),
            query_path: "qlqueries".into(),
            enable_low_priority_reports: true,
            results_folder: "/results".into(),
        }
    }
}

impl Config {
    /// Loads configuration from the given file, if any, and lets the
    /// CLI's output folder override the results destination.
    pub(crate) fn load(path: Option<&Utf8Path>, output_folder: Option<&Utf8Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("couldn't read config file {path}"))?;
                let file: ConfigFile = serde_json::from_str(&contents)
                    .with_context(|| format!("invalid config file {path}"))?;

                Self {
                    local_folder: file.local_folder,
                    codeql_bin: file.codeql_bin,
                    query_path: file.query_path,
                    enable_low_priority_reports: file.enable_low_priority_reports,
                    results_folder: file.results_folder,
                }
            }
            None => {
                tracing::debug!("no config file; using defaults");
                Self::default()
            }
        };

        if let Some(folder) = output_folder {
            config.results_folder = folder.to_path_buf();
        }

        Ok(config)
    }
}
