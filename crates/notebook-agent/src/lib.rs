//! Notebook client core for an AI-assisted notebook.
//!
//! Keeps an ordered document of cells consistent while three actors mutate
//! it: the person editing, a remote kernel that executes code, and an agent
//! backend that issues tool calls. All mutations are funneled through a
//! single [`session`] task so kernel executions and agent replays never
//! interleave.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod document;
pub mod execution;
pub mod gateway;
pub mod persistence;
pub mod protocol;
pub mod reconciler;
pub mod render;
pub mod session;
pub mod settings;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

/// Kind of content a cell holds. Fixed when the cell is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    Code,
    Markdown,
    Raw,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
            CellType::Raw => write!(f, "raw"),
        }
    }
}

impl std::str::FromStr for CellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code" => Ok(CellType::Code),
            "markdown" | "md" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            _ => Err(format!("Unknown cell type: {}", s)),
        }
    }
}

/// Status of the bound kernel session, as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    /// No kernel session is bound yet.
    #[default]
    Unbound,
    Idle,
    Busy,
    /// The last request to the kernel failed.
    Error,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unbound => write!(f, "unbound"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Error => write!(f, "error"),
        }
    }
}

/// Default backend URL, matching the server's default port.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// Default model identifier sent with agent requests.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Extension appended to notebook names when saving.
pub const NOTEBOOK_EXTENSION: &str = ".ipynb";

/// Get the directory holding notebook-agent configuration.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-agent")
}
