//! Plain-text projection of a document.
//!
//! Pure functions of state: nothing here mutates or owns the document.

use std::fmt::Write;
use std::sync::OnceLock;

use regex::Regex;

use crate::document::{multiline_text, Cell, Document, ExecutionError, Output, TranscriptKind};
use crate::{CellType, KernelStatus};

static ANSI_ESCAPE: OnceLock<Option<Regex>> = OnceLock::new();

/// Remove terminal color codes (tracebacks from IPython carry them).
pub fn strip_ansi(text: &str) -> String {
    let re = ANSI_ESCAPE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok());
    match re {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Render the whole notebook.
pub fn render_document(doc: &Document, status: KernelStatus) -> String {
    let mut out = String::new();
    let kernel = doc.kernel_id().unwrap_or("none");
    let _ = writeln!(
        out,
        "{} [kernel: {} ({})]",
        doc.notebook_name(),
        kernel,
        status
    );

    for cell in doc.cells() {
        out.push('\n');
        out.push_str(&render_cell(cell));
    }
    out
}

/// Render one cell: header, source, then results.
pub fn render_cell(cell: &Cell) -> String {
    let mut out = String::new();
    match cell.cell_type {
        CellType::Code => {
            let count = cell
                .execution_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| " ".to_string());
            let _ = writeln!(out, "In [{}]:", count);
        }
        CellType::Markdown => out.push_str("Markdown:\n"),
        CellType::Raw => out.push_str("Raw:\n"),
    }

    for line in cell.code.lines() {
        let _ = writeln!(out, "    {}", line);
    }

    for output in &cell.outputs {
        if let Some(text) = render_output(output) {
            out.push_str(&text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
    }

    if let Some(error) = &cell.error {
        out.push_str(&render_error(error));
    }
    out
}

/// Text for one output, or `None` when nothing in it is displayable.
pub fn render_output(output: &Output) -> Option<String> {
    match output {
        Output::Stream { name, text } if name == "stderr" => Some(format!("[stderr] {}", text)),
        Output::Stream { text, .. } => Some(text.clone()),
        Output::ExecuteResult {
            data,
            execution_count,
        } => {
            let text = data.get("text/plain").map(multiline_text)?;
            match execution_count {
                Some(n) => Some(format!("Out[{}]: {}", n, text)),
                None => Some(text),
            }
        }
        Output::DisplayData { data } => {
            if let Some(text) = data.get("text/plain") {
                return Some(multiline_text(text));
            }
            // Rich-only output: name it rather than dump the payload.
            data.keys()
                .find(|mime| mime.starts_with("image/") || mime.as_str() == "text/html")
                .map(|mime| format!("<{}>", mime))
        }
        Output::Other(value) => value
            .get("text")
            .map(multiline_text)
            .filter(|t| !t.is_empty()),
    }
}

pub fn render_error(error: &ExecutionError) -> String {
    let mut out = format!("{}: {}\n", error.name, error.message);
    for line in &error.traceback {
        out.push_str(&strip_ansi(line));
        out.push('\n');
    }
    out
}

/// Render the agent transcript, one entry per paragraph.
pub fn render_transcript(doc: &Document) -> String {
    let mut out = String::new();
    for entry in doc.transcript() {
        let prefix = match entry.kind {
            TranscriptKind::User => "you",
            TranscriptKind::Assistant => "agent",
            TranscriptKind::Tool => "tool",
            TranscriptKind::Notice => "!",
        };
        let _ = writeln!(out, "{}> {}", prefix, entry.text);
    }
    out
}
