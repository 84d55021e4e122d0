//! Save, load and list notebooks through the backend's notebook store.
//!
//! Maps between the document's cells and the backend's wire cells. Loading
//! replaces the cell sequence wholesale but leaves the conversation history
//! and the kernel binding alone.

use chrono::{DateTime, Local, TimeZone};
use log::{info, warn};
use serde_json::Value;

use crate::document::{Cell, Document, ExecutionError, Output};
use crate::gateway::{GatewayError, NotebookBackend};
use crate::protocol::{NotebookListing, SaveNotebookRequest, WireCell};
use crate::{CellType, NOTEBOOK_EXTENSION};

/// Map a cell to the backend's shape, as sent with agent requests.
pub fn to_wire_cell(cell: &Cell) -> WireCell {
    WireCell {
        cell_id: cell.id.clone(),
        code: cell.code.clone(),
        cell_type: cell.cell_type.to_string(),
        execution_count: cell.execution_count,
        outputs: cell.outputs.iter().map(Output::to_value).collect(),
        error: cell
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
    }
}

/// Every cell in document order.
pub fn to_wire_cells(doc: &Document) -> Vec<WireCell> {
    doc.cells().map(to_wire_cell).collect()
}

/// Map a cell to the shape written into a stored notebook.
///
/// Outputs are nbformat outputs and the execution error travels as a
/// trailing `error` output. Outputs read from a stored notebook are written
/// back verbatim.
pub fn to_stored_cell(cell: &Cell) -> WireCell {
    let outputs = match &cell.stored_outputs {
        Some(stored) => stored.clone(),
        None => cell
            .outputs
            .iter()
            .map(Output::to_nbformat)
            .chain(cell.error.iter().map(ExecutionError::to_nbformat))
            .collect(),
    };
    WireCell {
        outputs,
        ..to_wire_cell(cell)
    }
}

/// Map a wire cell back to a document cell.
///
/// Saved notebooks carry execution errors as `error` outputs; those are
/// lifted onto the cell so they render as errors again.
pub fn from_wire_cell(wire: WireCell) -> Cell {
    let cell_type = wire.cell_type.parse().unwrap_or_else(|e| {
        warn!("[persistence] {}, treating {} as code", e, wire.cell_id);
        CellType::Code
    });

    let stored_outputs = (!wire.outputs.is_empty()).then(|| wire.outputs.clone());
    let mut error = wire.error.map(ExecutionError::from_value);
    let mut outputs = Vec::with_capacity(wire.outputs.len());
    for value in wire.outputs {
        if is_error_output(&value) {
            if error.is_none() {
                error = Some(ExecutionError::from_value(value));
            }
            continue;
        }
        outputs.push(Output::from_value(value));
    }

    Cell {
        id: wire.cell_id,
        code: wire.code,
        cell_type,
        execution_count: wire.execution_count,
        outputs,
        error,
        stored_outputs,
    }
}

fn is_error_output(value: &Value) -> bool {
    value
        .get("output_type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        == Some("error")
}

/// The filename a document is saved under.
pub fn notebook_filename(name: &str) -> String {
    if name.ends_with(NOTEBOOK_EXTENSION) {
        name.to_string()
    } else {
        format!("{}{}", name, NOTEBOOK_EXTENSION)
    }
}

/// Persist every cell. The document itself does not change.
pub async fn save<B: NotebookBackend>(doc: &Document, backend: &B) -> Result<String, GatewayError> {
    let filename = notebook_filename(doc.notebook_name());
    info!("[persistence] Saving {} ({} cells)", filename, doc.len());

    let ack = backend
        .save_notebook(SaveNotebookRequest {
            filename: filename.clone(),
            cells: doc.cells().map(to_stored_cell).collect(),
        })
        .await?;
    Ok(ack.filename.unwrap_or(filename))
}

/// Replace the document's cells with a stored notebook.
///
/// On failure the document is left as it was.
pub async fn load<B: NotebookBackend>(
    doc: &mut Document,
    backend: &B,
    filename: &str,
) -> Result<(), GatewayError> {
    let response = backend.load_notebook(filename).await?;
    let cells: Vec<Cell> = response.cells.into_iter().map(from_wire_cell).collect();
    info!("[persistence] Loaded {} ({} cells)", response.filename, cells.len());

    doc.replace_cells(cells);
    doc.set_notebook_name(response.filename);
    Ok(())
}

/// Enumerate stored notebooks.
pub async fn list<B: NotebookBackend>(backend: &B) -> Result<Vec<NotebookListing>, GatewayError> {
    Ok(backend.list_notebooks().await?.notebooks)
}

impl NotebookListing {
    /// Modification time in the local timezone.
    pub fn modified_at(&self) -> Option<DateTime<Local>> {
        let secs = self.modified.trunc() as i64;
        let nanos = (self.modified.fract() * 1e9) as u32;
        Local.timestamp_opt(secs, nanos).single()
    }
}
