//! The agent's tool vocabulary.
//!
//! Tool calls arrive as a name plus JSON arguments. They are parsed into a
//! closed [`AgentTool`] enum so the reconciler can match exhaustively; names
//! this client does not know become [`AgentTool::Unrecognized`] and are
//! skipped, which keeps older clients working when the backend grows new
//! tools.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTool {
    UpdateCell {
        cell_id: String,
        code: String,
        reason: Option<String>,
    },
    InsertCell {
        code: String,
        /// Absent or negative means append.
        index: Option<i64>,
        reason: Option<String>,
    },
    DeleteCell {
        cell_id: String,
        reason: Option<String>,
    },
    RunCell {
        cell_id: String,
    },
    /// Read-only on the backend's side; nothing to apply locally.
    ReadCells {
        cell_id: Option<String>,
    },
    /// Runs on the backend host; nothing to apply locally.
    RunTerminalCommand {
        command: String,
    },
    Unrecognized {
        name: String,
    },
}

/// Arguments did not match the tool's schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid arguments for {tool}: {message}")]
pub struct ToolArgumentError {
    pub tool: String,
    pub message: String,
}

#[derive(Deserialize)]
struct UpdateCellArgs {
    cell_id: String,
    code: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct InsertCellArgs {
    code: String,
    #[serde(default, deserialize_with = "deserialize_index")]
    index: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct DeleteCellArgs {
    cell_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct RunCellArgs {
    cell_id: String,
}

#[derive(Deserialize, Default)]
struct ReadCellsArgs {
    #[serde(default)]
    cell_id: Option<String>,
}

#[derive(Deserialize)]
struct TerminalArgs {
    command: String,
}

/// Accept an index given as an integer, a whole float, a numeric string, or
/// null.
/// Models are not always precise about JSON types.
fn deserialize_index<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct IndexVisitor;

    impl<'de> de::Visitor<'de> for IndexVisitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer index, a numeric string, or null")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Option<i64>, E> {
            Ok(Some(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Option<i64>, E> {
            Ok(Some(i64::try_from(v).unwrap_or(i64::MAX)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Option<i64>, E> {
            if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                Ok(Some(v as i64))
            } else {
                Err(E::custom(format!("invalid index: {v}")))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Option<i64>, E> {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|_| E::custom(format!("invalid index: {v}")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Option<i64>, D::Error> {
            d.deserialize_any(IndexVisitor)
        }
    }

    deserializer.deserialize_any(IndexVisitor)
}

fn args<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T, ToolArgumentError> {
    // Some providers send arguments as an encoded JSON string.
    let decoded;
    let value = match arguments {
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s).map_err(|e| ToolArgumentError {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;
            &decoded
        }
        other => other,
    };
    T::deserialize(value).map_err(|e| ToolArgumentError {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

impl AgentTool {
    /// Parse a tool call by name. Unknown names are not an error.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, ToolArgumentError> {
        let tool = match name {
            "update_cell" => {
                let a: UpdateCellArgs = args(name, arguments)?;
                AgentTool::UpdateCell {
                    cell_id: a.cell_id,
                    code: a.code,
                    reason: a.reason,
                }
            }
            "insert_cell" => {
                let a: InsertCellArgs = args(name, arguments)?;
                AgentTool::InsertCell {
                    code: a.code,
                    index: a.index,
                    reason: a.reason,
                }
            }
            "delete_cell" => {
                let a: DeleteCellArgs = args(name, arguments)?;
                AgentTool::DeleteCell {
                    cell_id: a.cell_id,
                    reason: a.reason,
                }
            }
            "run_cell" => {
                let a: RunCellArgs = args(name, arguments)?;
                AgentTool::RunCell { cell_id: a.cell_id }
            }
            "read_cells" => {
                let a: ReadCellsArgs = if arguments.is_null() {
                    ReadCellsArgs::default()
                } else {
                    args(name, arguments)?
                };
                AgentTool::ReadCells { cell_id: a.cell_id }
            }
            "run_terminal_command" => {
                let a: TerminalArgs = args(name, arguments)?;
                AgentTool::RunTerminalCommand { command: a.command }
            }
            other => AgentTool::Unrecognized {
                name: other.to_string(),
            },
        };
        Ok(tool)
    }
}
