//! Wire types for the notebook backend's HTTP API.
//!
//! Every request and response body is JSON. Field names follow the backend
//! (snake_case, `cell_id`, `kernel_id`, ...). Outputs and errors are carried
//! as raw JSON here and mapped to the document types by their consumers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::ConversationEntry;

/// A cell as the backend sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCell {
    pub cell_id: String,
    pub code: String,
    #[serde(default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

fn default_cell_type() -> String {
    "code".to_string()
}

/// Body of every non-success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: Value,
}

impl ErrorBody {
    /// The detail as display text. Validation errors carry structured detail.
    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKernelResponse {
    pub kernel_id: String,
    #[serde(default)]
    pub status: String,
}

/// Acknowledgement for restart, interrupt and shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelAck {
    pub status: String,
    #[serde(default)]
    pub kernel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub kernel_id: String,
    pub cell_id: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub cell_id: Option<String>,
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub cells: Vec<WireCell>,
    pub user_message: String,
    pub conversation_history: Vec<ConversationEntry>,
    pub model_name: String,
}

/// A tool call made by the agent, with the backend's verdict in `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub result: Value,
}

impl WireToolCall {
    /// Whether the backend already applied this call on its side.
    pub fn succeeded(&self) -> bool {
        self.result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeErrorRequest {
    pub cells: Vec<WireCell>,
    pub error_cell_id: String,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub analysis: String,
    #[serde(default)]
    pub cells_to_fix: Vec<String>,
    /// cell id -> replacement code
    #[serde(default)]
    pub fixes: HashMap<String, String>,
    #[serde(default)]
    pub restart_needed: bool,
    #[serde(default)]
    pub continue_from_cell: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateCodeRequest {
    pub cells: Vec<WireCell>,
    pub user_request: String,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSuggestion {
    pub code: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub cells: Vec<WireCell>,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub cell_id: String,
    pub issue: String,
    pub suggested_fix: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResponse {
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    #[serde(default)]
    pub overall_assessment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveNotebookRequest {
    pub filename: String,
    pub cells: Vec<WireCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveAck {
    pub status: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadNotebookResponse {
    pub filename: String,
    pub cells: Vec<WireCell>,
}

/// A persisted notebook. `modified` is seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookListing {
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub modified: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNotebooksResponse {
    pub notebooks: Vec<NotebookListing>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_cell_defaults() {
        let cell: WireCell = serde_json::from_value(json!({
            "cell_id": "cell-0",
            "code": "x = 1",
        }))
        .unwrap();

        assert_eq!(cell.cell_type, "code");
        assert!(cell.execution_count.is_none());
        assert!(cell.outputs.is_empty());
        assert!(cell.error.is_none());
    }

    #[test]
    fn test_tool_call_success_flag() {
        let ok: WireToolCall = serde_json::from_value(json!({
            "id": "call_1",
            "name": "run_cell",
            "arguments": {"cell_id": "a"},
            "result": {"action": "run_cell", "success": true},
        }))
        .unwrap();
        let failed: WireToolCall = serde_json::from_value(json!({
            "name": "bogus",
            "arguments": {},
            "result": {"error": "Unknown tool: bogus", "success": false},
        }))
        .unwrap();
        let missing: WireToolCall =
            serde_json::from_value(json!({"name": "run_cell", "arguments": {}})).unwrap();

        assert!(ok.succeeded());
        assert!(!failed.succeeded());
        assert!(!missing.succeeded());
    }

    #[test]
    fn test_chat_request_serializes_history_roles() {
        let req = ChatRequest {
            cells: vec![],
            user_message: "hi".into(),
            conversation_history: vec![ConversationEntry {
                role: crate::document::Role::Assistant,
                content: "hello".into(),
            }],
            model_name: "gpt-4o-mini".into(),
        };

        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["conversation_history"][0]["role"], "assistant");
        assert_eq!(json["model_name"], "gpt-4o-mini");
    }

    #[test]
    fn test_error_body_message() {
        let plain: ErrorBody = serde_json::from_value(json!({"detail": "Kernel not found"})).unwrap();
        let structured: ErrorBody =
            serde_json::from_value(json!({"detail": [{"msg": "field required"}]})).unwrap();

        assert_eq!(plain.message(), "Kernel not found");
        assert!(structured.message().contains("field required"));
    }
}
