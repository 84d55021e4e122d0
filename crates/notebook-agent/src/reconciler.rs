//! Agent turns and tool-call reconciliation.
//!
//! The backend decides whether each tool call succeeded and has already
//! applied it to its own copy of the notebook. This side decides when the
//! change becomes visible and physically runs `run_cell`. Calls are replayed
//! strictly in order, each finished before the next starts, because later
//! calls may depend on cells touched by earlier ones. A call that cannot be
//! applied only loses its own effect; the rest of the queue still runs.

use log::{debug, info, warn};

use crate::document::{CellPatch, Document, Position, Role, TranscriptKind};
use crate::execution::{ExecutionController, ExecutionFailure};
use crate::gateway::{GatewayError, NotebookBackend};
use crate::persistence::to_wire_cells;
use crate::protocol::{
    AnalyzeErrorRequest, ChatRequest, CodeSuggestion, ErrorAnalysis, GenerateCodeRequest,
    OptimizeRequest, OptimizeResponse, WireToolCall,
};
use crate::tools::AgentTool;
use crate::CellType;

/// What happened to one tool call during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    /// Mirrored into the local document (or executed, for `run_cell`).
    Applied,
    /// The backend reported failure, so nothing was done locally.
    RejectedByBackend,
    /// The referenced cell no longer exists.
    StaleReference,
    /// A known tool with nothing to do on this side.
    NoLocalEffect,
    /// A tool this client does not know.
    Unrecognized,
    /// Applying the call failed (bad arguments, execution request failed).
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub name: String,
    pub status: ToolStatus,
}

/// Result of one conversational turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub message: String,
    pub tools: Vec<ToolOutcome>,
}

/// Drive one agent turn: send the notebook and message, then replay the
/// returned tool calls against the document.
///
/// The user's message joins the history before the request, so the history
/// sent ends with it. A failed chat request leaves the cells untouched and
/// adds a notice after the message.
pub async fn run_turn<B: NotebookBackend>(
    doc: &mut Document,
    controller: &mut ExecutionController<B>,
    user_message: &str,
    model_name: &str,
) -> Result<TurnOutcome, GatewayError> {
    doc.append_message(Role::User, user_message);
    doc.push_transcript(TranscriptKind::User, user_message);

    let request = ChatRequest {
        cells: to_wire_cells(doc),
        user_message: user_message.to_string(),
        conversation_history: doc.history().to_vec(),
        model_name: model_name.to_string(),
    };

    info!("[agent] Sending turn ({} cells, model {})", request.cells.len(), model_name);
    let response = match controller.backend().chat(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("[agent] Chat request failed: {}", e);
            doc.push_transcript(TranscriptKind::Notice, format!("Agent unavailable: {e}"));
            return Err(e);
        }
    };

    doc.append_message(Role::Assistant, response.message.clone());
    doc.push_transcript(TranscriptKind::Assistant, response.message.clone());

    info!("[agent] Replaying {} tool calls", response.tool_calls.len());
    let mut tools = Vec::with_capacity(response.tool_calls.len());
    for call in &response.tool_calls {
        let status = replay(doc, controller, call).await;
        debug!("[agent] {} -> {:?}", call.name, status);
        tools.push(ToolOutcome {
            name: call.name.clone(),
            status,
        });
    }

    Ok(TurnOutcome {
        message: response.message,
        tools,
    })
}

/// Apply a single tool call. Never fails the turn.
async fn replay<B: NotebookBackend>(
    doc: &mut Document,
    controller: &mut ExecutionController<B>,
    call: &WireToolCall,
) -> ToolStatus {
    if !call.succeeded() {
        doc.push_transcript(
            TranscriptKind::Tool,
            format!("{} was rejected by the backend", call.name),
        );
        return ToolStatus::RejectedByBackend;
    }

    let tool = match AgentTool::parse(&call.name, &call.arguments) {
        Ok(tool) => tool,
        Err(e) => {
            warn!("[agent] {}", e);
            doc.push_transcript(TranscriptKind::Notice, e.to_string());
            return ToolStatus::Failed(e.to_string());
        }
    };

    match tool {
        AgentTool::UpdateCell {
            cell_id,
            code,
            reason,
        } => {
            if !doc.update(&cell_id, CellPatch::code(code)) {
                debug!("[agent] update_cell: {} not found, skipping", cell_id);
                return ToolStatus::StaleReference;
            }
            doc.push_transcript(TranscriptKind::Tool, describe("Updated cell", &cell_id, reason));
            ToolStatus::Applied
        }
        AgentTool::InsertCell {
            code,
            index,
            reason,
        } => {
            let id = doc
                .insert(&code, CellType::Code, Position::from_signed(index))
                .id
                .clone();
            doc.push_transcript(TranscriptKind::Tool, describe("Inserted cell", &id, reason));
            ToolStatus::Applied
        }
        AgentTool::DeleteCell { cell_id, reason } => {
            if doc.delete(&cell_id).is_none() {
                debug!("[agent] delete_cell: {} not found, skipping", cell_id);
                return ToolStatus::StaleReference;
            }
            doc.push_transcript(TranscriptKind::Tool, describe("Deleted cell", &cell_id, reason));
            ToolStatus::Applied
        }
        AgentTool::RunCell { cell_id } => match controller.run_cell(doc, &cell_id).await {
            Ok(summary) => {
                let verdict = if summary.raised { "raised an error" } else { "ok" };
                doc.push_transcript(
                    TranscriptKind::Tool,
                    format!("Ran cell {} ({})", cell_id, verdict),
                );
                ToolStatus::Applied
            }
            Err(ExecutionFailure::CellNotFound(_)) => {
                debug!("[agent] run_cell: {} not found, skipping", cell_id);
                ToolStatus::StaleReference
            }
            Err(e) => {
                doc.push_transcript(
                    TranscriptKind::Notice,
                    format!("Could not run cell {}: {}", cell_id, e),
                );
                ToolStatus::Failed(e.to_string())
            }
        },
        AgentTool::ReadCells { cell_id } => {
            let target = match cell_id {
                Some(id) => format!("cell {}", id),
                None => "every cell".to_string(),
            };
            doc.push_transcript(TranscriptKind::Tool, format!("Agent read {}", target));
            ToolStatus::NoLocalEffect
        }
        AgentTool::RunTerminalCommand { command } => {
            doc.push_transcript(TranscriptKind::Tool, format!("Backend ran `{}`", command));
            ToolStatus::NoLocalEffect
        }
        AgentTool::Unrecognized { name } => {
            debug!("[agent] Ignoring unrecognized tool {}", name);
            ToolStatus::Unrecognized
        }
    }
}

fn describe(action: &str, cell_id: &str, reason: Option<String>) -> String {
    match reason {
        Some(reason) if !reason.is_empty() => format!("{} {}: {}", action, cell_id, reason),
        _ => format!("{} {}", action, cell_id),
    }
}

/// Ask the agent why a cell failed. Read-only.
pub async fn analyze_error<B: NotebookBackend>(
    doc: &Document,
    backend: &B,
    error_cell_id: &str,
    model_name: &str,
) -> Result<ErrorAnalysis, GatewayError> {
    backend
        .analyze_error(AnalyzeErrorRequest {
            cells: to_wire_cells(doc),
            error_cell_id: error_cell_id.to_string(),
            model_name: model_name.to_string(),
        })
        .await
}

/// Apply the code fixes from an analysis, restarting first when the agent
/// says the kernel state is poisoned. Returns how many cells changed.
pub async fn apply_fixes<B: NotebookBackend>(
    doc: &mut Document,
    controller: &mut ExecutionController<B>,
    analysis: &ErrorAnalysis,
) -> Result<usize, ExecutionFailure> {
    if analysis.restart_needed {
        controller.restart(doc).await?;
    }

    // Apply in document order so the transcript reads top to bottom.
    let ids: Vec<String> = doc.cell_ids().to_vec();
    let mut applied = 0;
    for id in ids {
        let Some(code) = analysis.fixes.get(&id) else {
            continue;
        };
        if doc.update(&id, CellPatch::code(code.clone())) {
            doc.push_transcript(TranscriptKind::Tool, format!("Fixed cell {}", id));
            applied += 1;
        }
    }

    let stale = analysis.fixes.len() - applied;
    if stale > 0 {
        debug!("[agent] Skipped {} fixes for cells that no longer exist", stale);
    }
    Ok(applied)
}

/// Ask the agent for new code. Read-only.
pub async fn generate_code<B: NotebookBackend>(
    doc: &Document,
    backend: &B,
    user_request: &str,
    model_name: &str,
) -> Result<CodeSuggestion, GatewayError> {
    backend
        .generate_code(GenerateCodeRequest {
            cells: to_wire_cells(doc),
            user_request: user_request.to_string(),
            model_name: model_name.to_string(),
        })
        .await
}

/// Insert a generated suggestion as a new cell and return its id.
pub fn insert_generated(doc: &mut Document, suggestion: &CodeSuggestion, position: Position) -> String {
    let cell_type = suggestion.cell_type.parse().unwrap_or_default();
    let id = doc.insert(&suggestion.code, cell_type, position).id.clone();
    doc.push_transcript(TranscriptKind::Tool, format!("Inserted generated cell {}", id));
    id
}

/// Ask the agent to review the whole notebook. Read-only.
pub async fn optimize<B: NotebookBackend>(
    doc: &Document,
    backend: &B,
    model_name: &str,
) -> Result<OptimizeResponse, GatewayError> {
    backend
        .optimize(OptimizeRequest {
            cells: to_wire_cells(doc),
            model_name: model_name.to_string(),
        })
        .await
}
