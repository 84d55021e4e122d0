//! The notebook document: ordered cells plus the agent conversation.
//!
//! Cells live in an id map with a separate ordering vector, so lookups by id
//! stay cheap while the display and execution order is explicit. Every
//! mutation goes through a method here; missing ids are silent no-ops so a
//! stale reference from an agent turn never fails the turn.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::CellType;

/// MIME type -> representation, as produced by the kernel.
pub type MimeBundle = BTreeMap<String, Value>;

/// One output produced by executing a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Stream {
        name: String,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
        execution_count: Option<u32>,
    },
    DisplayData {
        data: MimeBundle,
    },
    /// Output of a kind this client does not model. Kept verbatim so it
    /// survives a save.
    Other(Value),
}

impl Output {
    /// Build an output from backend JSON.
    ///
    /// Accepts both the execute endpoint's shape (tagged by `type`) and the
    /// nbformat shape of loaded notebooks (tagged by `output_type`, text
    /// possibly split into lines).
    pub fn from_value(value: Value) -> Self {
        let kind = value
            .get("type")
            .or_else(|| value.get("output_type"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match kind.as_deref() {
            Some("stream") => Output::Stream {
                name: value
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout")
                    .to_string(),
                text: value.get("text").map(multiline_text).unwrap_or_default(),
            },
            Some("execute_result") => Output::ExecuteResult {
                data: mime_bundle(value.get("data")),
                execution_count: value
                    .get("execution_count")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32),
            },
            Some("display_data") => Output::DisplayData {
                data: mime_bundle(value.get("data")),
            },
            _ => Output::Other(value),
        }
    }

    /// Serialize back to the backend's shape.
    pub fn to_value(&self) -> Value {
        match self {
            Output::Stream { name, text } => json!({
                "type": "stream",
                "name": name,
                "text": text,
            }),
            Output::ExecuteResult {
                data,
                execution_count,
            } => json!({
                "type": "execute_result",
                "data": data,
                "execution_count": execution_count,
            }),
            Output::DisplayData { data } => json!({
                "type": "display_data",
                "data": data,
            }),
            Output::Other(value) => value.clone(),
        }
    }

    /// Serialize in the nbformat shape used by stored notebooks.
    pub fn to_nbformat(&self) -> Value {
        match self {
            Output::Stream { name, text } => json!({
                "output_type": "stream",
                "name": name,
                "text": text,
            }),
            Output::ExecuteResult {
                data,
                execution_count,
            } => json!({
                "output_type": "execute_result",
                "data": data,
                "metadata": {},
                "execution_count": execution_count,
            }),
            Output::DisplayData { data } => json!({
                "output_type": "display_data",
                "data": data,
                "metadata": {},
            }),
            Output::Other(value) => value.clone(),
        }
    }

    /// The MIME bundle of a rich output, if any.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::ExecuteResult { data, .. } | Output::DisplayData { data } => Some(data),
            _ => None,
        }
    }
}

/// nbformat stores multiline strings either as one string or a list of lines.
pub(crate) fn multiline_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

fn mime_bundle(value: Option<&Value>) -> MimeBundle {
    value
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Error raised by the executed code (not by this client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(rename = "ename")]
    pub name: String,
    #[serde(rename = "evalue")]
    pub message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ExecutionError {
    /// Parse the backend's `{ename, evalue, traceback}` object. Anything
    /// malformed still yields an error so it is never silently dropped.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| ExecutionError {
            name: "Error".to_string(),
            message: value.to_string(),
            traceback: Vec::new(),
        })
    }

    /// The nbformat `error` output for this error.
    pub fn to_nbformat(&self) -> Value {
        json!({
            "output_type": "error",
            "ename": self.name,
            "evalue": self.message,
            "traceback": self.traceback,
        })
    }
}

/// A single cell and its latest execution result.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub code: String,
    pub cell_type: CellType,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
    pub error: Option<ExecutionError>,
    /// Outputs exactly as read from a stored notebook. Written back
    /// unchanged on save until the cell's execution state changes.
    pub stored_outputs: Option<Vec<Value>>,
}

impl Cell {
    /// A fresh cell with a newly generated id and no execution state.
    pub fn new(code: impl Into<String>, cell_type: CellType) -> Self {
        Self::with_id(new_cell_id(), code, cell_type)
    }

    pub fn with_id(id: impl Into<String>, code: impl Into<String>, cell_type: CellType) -> Self {
        Cell {
            id: id.into(),
            code: code.into(),
            cell_type,
            execution_count: None,
            outputs: Vec::new(),
            error: None,
            stored_outputs: None,
        }
    }

    fn clear_execution_state(&mut self) {
        self.execution_count = None;
        self.outputs.clear();
        self.error = None;
        self.stored_outputs = None;
    }
}

/// Generate an opaque, globally unique cell id.
pub fn new_cell_id() -> String {
    Uuid::new_v4().to_string()
}

/// Where to insert a new cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    End,
    Index(usize),
}

impl Position {
    /// Interpret an agent-supplied index: absent or negative means the end.
    pub fn from_signed(index: Option<i64>) -> Self {
        match index {
            Some(i) if i >= 0 => Position::Index(i as usize),
            _ => Position::End,
        }
    }
}

/// Partial update of a cell. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct CellPatch {
    pub code: Option<String>,
    pub execution_count: Option<Option<u32>>,
    pub outputs: Option<Vec<Output>>,
    pub error: Option<Option<ExecutionError>>,
}

impl CellPatch {
    pub fn code(code: impl Into<String>) -> Self {
        CellPatch {
            code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Replace all execution state at once.
    pub fn execution(
        execution_count: Option<u32>,
        outputs: Vec<Output>,
        error: Option<ExecutionError>,
    ) -> Self {
        CellPatch {
            code: None,
            execution_count: Some(execution_count),
            outputs: Some(outputs),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the agent conversation, as sent back to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
}

/// What a transcript line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    User,
    Assistant,
    /// A tool call the agent made.
    Tool,
    /// A failure or informational notice surfaced to the user.
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub kind: TranscriptKind,
    pub text: String,
}

pub const UNTITLED: &str = "Untitled";

/// The single source of truth for notebook state.
#[derive(Debug, Clone)]
pub struct Document {
    cells: HashMap<String, Cell>,
    order: Vec<String>,
    kernel_id: Option<String>,
    notebook_name: String,
    history: Vec<ConversationEntry>,
    transcript: Vec<TranscriptEntry>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// A new document with one blank code cell.
    pub fn new() -> Self {
        let mut doc = Document {
            cells: HashMap::new(),
            order: Vec::new(),
            kernel_id: None,
            notebook_name: UNTITLED.to_string(),
            history: Vec::new(),
            transcript: Vec::new(),
        };
        doc.insert("", CellType::Code, Position::End);
        doc
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cells in display (and execution context) order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        self.order.iter().filter_map(|id| self.cells.get(id))
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|c| c == id)
    }

    /// Insert a new cell. Indexes at or past the end append.
    pub fn insert(&mut self, code: &str, cell_type: CellType, position: Position) -> &Cell {
        let cell = Cell::new(code, cell_type);
        let id = cell.id.clone();

        let idx = match position {
            Position::Index(i) if i < self.order.len() => i,
            _ => self.order.len(),
        };
        self.order.insert(idx, id.clone());
        self.cells.entry(id).or_insert(cell)
    }

    /// Apply a partial update. Returns false (and changes nothing) when the
    /// id is unknown.
    pub fn update(&mut self, id: &str, patch: CellPatch) -> bool {
        let Some(cell) = self.cells.get_mut(id) else {
            return false;
        };
        if let Some(code) = patch.code {
            cell.code = code;
        }
        if let Some(count) = patch.execution_count {
            cell.execution_count = count;
        }
        if let Some(outputs) = patch.outputs {
            cell.outputs = outputs;
            cell.stored_outputs = None;
        }
        if let Some(error) = patch.error {
            cell.error = error;
            cell.stored_outputs = None;
        }
        true
    }

    /// Remove a cell. Missing ids leave the document untouched.
    pub fn delete(&mut self, id: &str) -> Option<Cell> {
        let cell = self.cells.remove(id)?;
        self.order.retain(|c| c != id);
        Some(cell)
    }

    /// Clear execution count, outputs and error on every cell.
    pub fn reset_execution_state(&mut self) {
        for cell in self.cells.values_mut() {
            cell.clear_execution_state();
        }
    }

    /// Replace every cell at once (used when loading a notebook).
    ///
    /// Ids that are empty or repeat an earlier cell's id are regenerated.
    pub fn replace_cells(&mut self, cells: Vec<Cell>) {
        self.cells.clear();
        self.order.clear();
        for mut cell in cells {
            if cell.id.is_empty() || self.cells.contains_key(&cell.id) {
                cell.id = new_cell_id();
            }
            self.order.push(cell.id.clone());
            self.cells.insert(cell.id.clone(), cell);
        }
    }

    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }

    pub fn bind_kernel(&mut self, kernel_id: impl Into<String>) {
        self.kernel_id = Some(kernel_id.into());
    }

    pub fn unbind_kernel(&mut self) -> Option<String> {
        self.kernel_id.take()
    }

    pub fn notebook_name(&self) -> &str {
        &self.notebook_name
    }

    pub fn set_notebook_name(&mut self, name: impl Into<String>) {
        self.notebook_name = name.into();
    }

    pub fn history(&self) -> &[ConversationEntry] {
        &self.history
    }

    /// Append to the conversation history. History only grows within a
    /// document's lifetime.
    pub fn append_message(&mut self, role: Role, content: impl Into<String>) {
        self.history.push(ConversationEntry {
            role,
            content: content.into(),
        });
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn push_transcript(&mut self, kind: TranscriptKind, text: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            kind,
            text: text.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(codes: &[&str]) -> Document {
        let mut doc = Document::new();
        let first = doc.cell_ids()[0].clone();
        doc.delete(&first);
        for code in codes {
            doc.insert(code, CellType::Code, Position::End);
        }
        doc
    }

    fn codes(doc: &Document) -> Vec<String> {
        doc.cells().map(|c| c.code.clone()).collect()
    }

    #[test]
    fn test_new_creates_single_blank_code_cell() {
        let doc = Document::new();

        assert_eq!(doc.len(), 1);
        let cell = doc.cells().next().unwrap();
        assert_eq!(cell.cell_type, CellType::Code);
        assert!(cell.code.is_empty());
        assert!(cell.execution_count.is_none());
        assert!(doc.kernel_id().is_none());
        assert!(doc.history().is_empty());
        assert_eq!(doc.notebook_name(), UNTITLED);
    }

    #[test]
    fn test_insert_at_index_shifts_later_cells() {
        let mut doc = doc_with(&["a", "b", "c"]);
        let before: Vec<String> = doc.cell_ids().to_vec();

        let new_id = doc.insert("x", CellType::Code, Position::Index(1)).id.clone();

        assert_eq!(doc.len(), 4);
        assert_eq!(doc.position(&new_id), Some(1));
        assert_eq!(codes(&doc), vec!["a", "x", "b", "c"]);
        assert_eq!(doc.position(&before[1]), Some(2));
        assert_eq!(doc.position(&before[2]), Some(3));
    }

    #[test]
    fn test_insert_at_every_valid_index() {
        for i in 0..=3 {
            let mut doc = doc_with(&["a", "b", "c"]);
            let id = doc.insert("x", CellType::Code, Position::Index(i)).id.clone();
            assert_eq!(doc.len(), 4);
            assert_eq!(doc.position(&id), Some(i));
        }
    }

    #[test]
    fn test_insert_out_of_range_appends() {
        let mut doc = doc_with(&["a", "b"]);

        doc.insert("x", CellType::Code, Position::Index(99));
        doc.insert("y", CellType::Markdown, Position::End);

        assert_eq!(codes(&doc), vec!["a", "b", "x", "y"]);
    }

    #[test]
    fn test_insert_generates_unique_ids() {
        let mut doc = Document::new();
        for _ in 0..20 {
            doc.insert("", CellType::Code, Position::Index(0));
        }
        let mut ids = doc.cell_ids().to_vec();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 21);
    }

    #[test]
    fn test_position_from_signed() {
        assert_eq!(Position::from_signed(None), Position::End);
        assert_eq!(Position::from_signed(Some(-1)), Position::End);
        assert_eq!(Position::from_signed(Some(-7)), Position::End);
        assert_eq!(Position::from_signed(Some(0)), Position::Index(0));
        assert_eq!(Position::from_signed(Some(3)), Position::Index(3));
    }

    #[test]
    fn test_delete_missing_id_leaves_document_unchanged() {
        let mut doc = doc_with(&["a", "b"]);
        let before = doc.cell_ids().to_vec();

        assert!(doc.delete("nonexistent").is_none());

        assert_eq!(doc.cell_ids(), before.as_slice());
    }

    #[test]
    fn test_delete_removes_cell() {
        let mut doc = doc_with(&["a", "b", "c"]);
        let id = doc.cell_ids()[1].clone();

        let removed = doc.delete(&id).unwrap();

        assert_eq!(removed.code, "b");
        assert!(doc.get(&id).is_none());
        assert_eq!(codes(&doc), vec!["a", "c"]);
    }

    #[test]
    fn test_delete_allows_removing_last_cell() {
        let mut doc = Document::new();
        let id = doc.cell_ids()[0].clone();

        doc.delete(&id);

        assert!(doc.is_empty());
    }

    #[test]
    fn test_update_missing_id_is_noop() {
        let mut doc = doc_with(&["a"]);
        let before = doc.clone();

        assert!(!doc.update("nonexistent", CellPatch::code("x")));

        assert_eq!(codes(&doc), codes(&before));
    }

    #[test]
    fn test_update_changes_only_targeted_fields() {
        let mut doc = doc_with(&["a"]);
        let id = doc.cell_ids()[0].clone();
        doc.update(
            &id,
            CellPatch::execution(
                Some(3),
                vec![Output::Stream {
                    name: "stdout".into(),
                    text: "hi\n".into(),
                }],
                None,
            ),
        );

        assert!(doc.update(&id, CellPatch::code("b = 2")));

        let cell = doc.get(&id).unwrap();
        assert_eq!(cell.code, "b = 2");
        assert_eq!(cell.execution_count, Some(3));
        assert_eq!(cell.outputs.len(), 1);
        assert_eq!(cell.cell_type, CellType::Code);
    }

    #[test]
    fn test_reset_execution_state_keeps_code() {
        let mut doc = doc_with(&["a", "b"]);
        let ids = doc.cell_ids().to_vec();
        for (n, id) in ids.iter().enumerate() {
            doc.update(
                id,
                CellPatch::execution(
                    Some(n as u32 + 1),
                    vec![],
                    Some(ExecutionError {
                        name: "E".into(),
                        message: "m".into(),
                        traceback: vec![],
                    }),
                ),
            );
        }

        doc.reset_execution_state();

        for cell in doc.cells() {
            assert!(cell.execution_count.is_none());
            assert!(cell.outputs.is_empty());
            assert!(cell.error.is_none());
        }
        assert_eq!(codes(&doc), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_cells_regenerates_duplicate_and_empty_ids() {
        let mut doc = Document::new();
        doc.replace_cells(vec![
            Cell::with_id("cell-0", "a", CellType::Code),
            Cell::with_id("cell-0", "b", CellType::Code),
            Cell::with_id("", "c", CellType::Markdown),
        ]);

        assert_eq!(doc.len(), 3);
        assert_eq!(doc.cell_ids()[0], "cell-0");
        assert_ne!(doc.cell_ids()[1], "cell-0");
        assert!(!doc.cell_ids()[2].is_empty());
        assert_eq!(codes(&doc), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_append_message_grows_history() {
        let mut doc = Document::new();
        doc.append_message(Role::User, "hi");
        doc.append_message(Role::Assistant, "hello");

        assert_eq!(doc.history().len(), 2);
        assert_eq!(doc.history()[0].role, Role::User);
        assert_eq!(doc.history()[1].content, "hello");
    }

    #[test]
    fn test_kernel_binding() {
        let mut doc = Document::new();
        doc.bind_kernel("k-1");
        assert_eq!(doc.kernel_id(), Some("k-1"));
        assert_eq!(doc.unbind_kernel(), Some("k-1".to_string()));
        assert!(doc.kernel_id().is_none());
    }

    #[test]
    fn test_output_from_execute_shape() {
        let out = Output::from_value(json!({"type": "stream", "name": "stdout", "text": "1\n"}));
        assert_eq!(
            out,
            Output::Stream {
                name: "stdout".into(),
                text: "1\n".into()
            }
        );
    }

    #[test]
    fn test_output_from_nbformat_shape_joins_lines() {
        let out = Output::from_value(json!({
            "output_type": "stream",
            "name": "stderr",
            "text": ["a\n", "b\n"],
        }));
        assert_eq!(
            out,
            Output::Stream {
                name: "stderr".into(),
                text: "a\nb\n".into()
            }
        );
    }

    #[test]
    fn test_output_preserves_unknown_mime_types() {
        let raw = json!({
            "type": "display_data",
            "data": {"text/plain": "x", "application/vnd.custom+json": {"k": 1}},
        });
        let out = Output::from_value(raw);

        let data = out.data().unwrap();
        assert_eq!(data["application/vnd.custom+json"], json!({"k": 1}));
        assert_eq!(out.to_value()["data"]["application/vnd.custom+json"]["k"], 1);
    }

    #[test]
    fn test_output_unknown_kind_roundtrips_verbatim() {
        let raw = json!({"output_type": "widget", "payload": [1, 2]});
        let out = Output::from_value(raw.clone());

        assert!(matches!(out, Output::Other(_)));
        assert_eq!(out.to_value(), raw);
    }

    #[test]
    fn test_execution_error_wire_names() {
        let err: ExecutionError = serde_json::from_value(json!({
            "ename": "SyntaxError",
            "evalue": "invalid syntax",
            "traceback": ["line 1"],
        }))
        .unwrap();

        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.message, "invalid syntax");
        assert_eq!(serde_json::to_value(&err).unwrap()["ename"], "SyntaxError");
    }
}
