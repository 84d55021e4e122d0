//! The session task: one queue for every document mutation.
//!
//! A spawned task owns the [`Document`] and the [`ExecutionController`] and
//! processes [`SessionCommand`]s strictly FIFO. Each command runs to
//! completion before the next is taken, so a manual run that arrives during
//! an agent turn waits for the whole turn (including every `run_cell` it
//! replays). Callers talk to the task through a cloneable [`SessionHandle`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::document::{CellPatch, Document, Position, TranscriptKind};
use crate::execution::{ExecutionController, ExecutionFailure, RunSummary};
use crate::gateway::{GatewayError, NotebookBackend};
use crate::protocol::{CodeSuggestion, ErrorAnalysis, NotebookListing, OptimizeResponse};
use crate::reconciler::{self, TurnOutcome};
use crate::{persistence, CellType, KernelStatus};

/// Commands queued to the session task.
pub enum SessionCommand {
    Insert {
        code: String,
        cell_type: CellType,
        position: Position,
        reply: oneshot::Sender<String>,
    },
    UpdateCode {
        cell_id: String,
        code: String,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        cell_id: String,
        reply: oneshot::Sender<bool>,
    },
    Run {
        cell_id: String,
        reply: oneshot::Sender<Result<RunSummary, ExecutionFailure>>,
    },
    RunAll {
        stop_on_error: bool,
        reply: oneshot::Sender<Result<Vec<RunSummary>, ExecutionFailure>>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), ExecutionFailure>>,
    },
    Interrupt {
        reply: oneshot::Sender<Result<(), ExecutionFailure>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), ExecutionFailure>>,
    },
    Chat {
        message: String,
        model: Option<String>,
        reply: oneshot::Sender<Result<TurnOutcome, GatewayError>>,
    },
    AnalyzeError {
        cell_id: String,
        reply: oneshot::Sender<Result<ErrorAnalysis, GatewayError>>,
    },
    ApplyFixes {
        analysis: ErrorAnalysis,
        reply: oneshot::Sender<Result<usize, ExecutionFailure>>,
    },
    GenerateCode {
        request: String,
        reply: oneshot::Sender<Result<CodeSuggestion, GatewayError>>,
    },
    InsertGenerated {
        suggestion: CodeSuggestion,
        position: Position,
        reply: oneshot::Sender<String>,
    },
    Optimize {
        reply: oneshot::Sender<Result<OptimizeResponse, GatewayError>>,
    },
    Rename {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Save {
        reply: oneshot::Sender<Result<String, GatewayError>>,
    },
    Load {
        filename: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<NotebookListing>, GatewayError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

impl SessionCommand {
    fn label(&self) -> &'static str {
        match self {
            SessionCommand::Insert { .. } => "insert",
            SessionCommand::UpdateCode { .. } => "update",
            SessionCommand::Delete { .. } => "delete",
            SessionCommand::Run { .. } => "run",
            SessionCommand::RunAll { .. } => "run_all",
            SessionCommand::Restart { .. } => "restart",
            SessionCommand::Interrupt { .. } => "interrupt",
            SessionCommand::Shutdown { .. } => "shutdown",
            SessionCommand::Chat { .. } => "chat",
            SessionCommand::AnalyzeError { .. } => "analyze_error",
            SessionCommand::ApplyFixes { .. } => "apply_fixes",
            SessionCommand::GenerateCode { .. } => "generate_code",
            SessionCommand::InsertGenerated { .. } => "insert_generated",
            SessionCommand::Optimize { .. } => "optimize",
            SessionCommand::Rename { .. } => "rename",
            SessionCommand::Save { .. } => "save",
            SessionCommand::Load { .. } => "load",
            SessionCommand::List { .. } => "list",
            SessionCommand::Snapshot { .. } => "snapshot",
        }
    }
}

/// Error type for session handle calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// A copy of the session state at one point in the queue.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub document: Document,
    pub kernel_status: KernelStatus,
}

/// Queue state for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueState {
    /// A command is running or waiting.
    pub processing: bool,
    /// Commands waiting behind the current one.
    pub pending: usize,
    /// Label of the command currently running.
    pub current: Option<String>,
}

/// Events emitted by the session task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { command: String },
    Finished { command: String, ok: bool },
    KernelStatus { status: KernelStatus },
    Notice { message: String },
}

/// Receives session events.
///
/// Implement this to route events to a UI layer.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Log-only event sink.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Started { command } => debug!("[session] Started {}", command),
            SessionEvent::Finished { command, ok } => {
                debug!("[session] Finished {} (ok={})", command, ok)
            }
            SessionEvent::KernelStatus { status } => info!("[session] Kernel {}", status),
            SessionEvent::Notice { message } => warn!("[session] {}", message),
        }
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    pending: Arc<AtomicUsize>,
    current: watch::Receiver<Option<String>>,
    kernel_status: watch::Receiver<KernelStatus>,
}

/// Bound on queued commands before senders wait.
const QUEUE_CAPACITY: usize = 100;

/// Spawn the session task. It runs until every handle is dropped.
pub fn spawn_session<B>(
    document: Document,
    backend: B,
    default_model: impl Into<String>,
    sink: Arc<dyn EventSink>,
) -> SessionHandle
where
    B: NotebookBackend + 'static,
{
    let (tx, mut rx) = mpsc::channel::<SessionCommand>(QUEUE_CAPACITY);
    let (current_tx, current_rx) = watch::channel(None);
    let pending = Arc::new(AtomicUsize::new(0));

    let status_sink = sink.clone();
    let controller = ExecutionController::new(backend).with_status_listener(Arc::new(
        move |status| status_sink.on_event(SessionEvent::KernelStatus { status }),
    ));
    let kernel_status = controller.subscribe();

    let mut session = Session {
        doc: document,
        controller,
        default_model: default_model.into(),
        sink,
    };
    let task_pending = pending.clone();

    tokio::spawn(async move {
        info!("[session] Session started");
        while let Some(cmd) = rx.recv().await {
            task_pending.fetch_sub(1, Ordering::SeqCst);
            let label = cmd.label();
            current_tx.send_replace(Some(label.to_string()));
            session.sink.on_event(SessionEvent::Started {
                command: label.to_string(),
            });

            let ok = session.handle(cmd).await;
            session.sink.on_event(SessionEvent::Finished {
                command: label.to_string(),
                ok,
            });
            current_tx.send_replace(None);
        }
        info!("[session] Session channel closed");
    });

    SessionHandle {
        tx,
        pending,
        current: current_rx,
        kernel_status,
    }
}

struct Session<B> {
    doc: Document,
    controller: ExecutionController<B>,
    default_model: String,
    sink: Arc<dyn EventSink>,
}

/// Send a reply, ignoring callers that stopped waiting.
fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        debug!("[session] Caller dropped before reply");
    }
}

impl<B: NotebookBackend> Session<B> {
    fn notice(&mut self, message: String) {
        self.doc
            .push_transcript(TranscriptKind::Notice, message.clone());
        self.sink.on_event(SessionEvent::Notice { message });
    }

    /// Surface a failure to the user. Returns whether the result was ok.
    fn check<T, E: std::fmt::Display>(&mut self, result: &Result<T, E>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                self.notice(e.to_string());
                false
            }
        }
    }

    async fn handle(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Insert {
                code,
                cell_type,
                position,
                reply: tx,
            } => {
                let id = self.doc.insert(&code, cell_type, position).id.clone();
                reply(tx, id);
                true
            }
            SessionCommand::UpdateCode {
                cell_id,
                code,
                reply: tx,
            } => {
                reply(tx, self.doc.update(&cell_id, CellPatch::code(code)));
                true
            }
            SessionCommand::Delete { cell_id, reply: tx } => {
                reply(tx, self.doc.delete(&cell_id).is_some());
                true
            }
            SessionCommand::Run { cell_id, reply: tx } => {
                let result = self.controller.run_cell(&mut self.doc, &cell_id).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::RunAll {
                stop_on_error,
                reply: tx,
            } => {
                let result = self.controller.run_all(&mut self.doc, stop_on_error).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Restart { reply: tx } => {
                let result = self.controller.restart(&mut self.doc).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Interrupt { reply: tx } => {
                let result = self.controller.interrupt(&self.doc).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Shutdown { reply: tx } => {
                let result = self.controller.shutdown(&mut self.doc).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Chat {
                message,
                model,
                reply: tx,
            } => {
                let model = model.unwrap_or_else(|| self.default_model.clone());
                // The reconciler records its own transcript notice on failure.
                let result =
                    reconciler::run_turn(&mut self.doc, &mut self.controller, &message, &model)
                        .await;
                let ok = result.is_ok();
                reply(tx, result);
                ok
            }
            SessionCommand::AnalyzeError { cell_id, reply: tx } => {
                let result = reconciler::analyze_error(
                    &self.doc,
                    self.controller.backend(),
                    &cell_id,
                    &self.default_model,
                )
                .await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::ApplyFixes { analysis, reply: tx } => {
                let result =
                    reconciler::apply_fixes(&mut self.doc, &mut self.controller, &analysis).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::GenerateCode { request, reply: tx } => {
                let result = reconciler::generate_code(
                    &self.doc,
                    self.controller.backend(),
                    &request,
                    &self.default_model,
                )
                .await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::InsertGenerated {
                suggestion,
                position,
                reply: tx,
            } => {
                reply(
                    tx,
                    reconciler::insert_generated(&mut self.doc, &suggestion, position),
                );
                true
            }
            SessionCommand::Optimize { reply: tx } => {
                let result =
                    reconciler::optimize(&self.doc, self.controller.backend(), &self.default_model)
                        .await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Rename { name, reply: tx } => {
                self.doc.set_notebook_name(name);
                reply(tx, ());
                true
            }
            SessionCommand::Save { reply: tx } => {
                let result = persistence::save(&self.doc, self.controller.backend()).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Load { filename, reply: tx } => {
                let result =
                    persistence::load(&mut self.doc, self.controller.backend(), &filename).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::List { reply: tx } => {
                let result = persistence::list(self.controller.backend()).await;
                let ok = self.check(&result);
                reply(tx, result);
                ok
            }
            SessionCommand::Snapshot { reply: tx } => {
                reply(
                    tx,
                    Snapshot {
                        document: self.doc.clone(),
                        kernel_status: self.controller.status(),
                    },
                );
                true
            }
        }
    }
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(make(tx)).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("[session] Session task is gone");
            return Err(SessionError::Closed);
        }
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current queue state.
    pub fn queue_state(&self) -> QueueState {
        let pending = self.pending.load(Ordering::SeqCst);
        let current = self.current.borrow().clone();
        QueueState {
            processing: current.is_some() || pending > 0,
            pending,
            current,
        }
    }

    /// Kernel status right now, without waiting behind queued commands.
    pub fn kernel_status(&self) -> KernelStatus {
        *self.kernel_status.borrow()
    }

    /// Insert a cell and return its id.
    pub async fn insert(
        &self,
        code: impl Into<String>,
        cell_type: CellType,
        position: Position,
    ) -> Result<String, SessionError> {
        let code = code.into();
        self.request(|reply| SessionCommand::Insert {
            code,
            cell_type,
            position,
            reply,
        })
        .await
    }

    /// Replace a cell's code. Returns false for an unknown id.
    pub async fn update_code(
        &self,
        cell_id: &str,
        code: impl Into<String>,
    ) -> Result<bool, SessionError> {
        let code = code.into();
        self.request(|reply| SessionCommand::UpdateCode {
            cell_id: cell_id.to_string(),
            code,
            reply,
        })
        .await
    }

    pub async fn delete(&self, cell_id: &str) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::Delete {
            cell_id: cell_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn run(&self, cell_id: &str) -> Result<RunSummary, SessionError> {
        Ok(self
            .request(|reply| SessionCommand::Run {
                cell_id: cell_id.to_string(),
                reply,
            })
            .await??)
    }

    pub async fn run_all(&self, stop_on_error: bool) -> Result<Vec<RunSummary>, SessionError> {
        Ok(self
            .request(|reply| SessionCommand::RunAll {
                stop_on_error,
                reply,
            })
            .await??)
    }

    pub async fn restart(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| SessionCommand::Restart { reply }).await??)
    }

    pub async fn interrupt(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| SessionCommand::Interrupt { reply }).await??)
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| SessionCommand::Shutdown { reply }).await??)
    }

    /// Run one agent turn. `model` overrides the session default.
    pub async fn chat(
        &self,
        message: impl Into<String>,
        model: Option<String>,
    ) -> Result<TurnOutcome, SessionError> {
        let message = message.into();
        Ok(self
            .request(|reply| SessionCommand::Chat {
                message,
                model,
                reply,
            })
            .await??)
    }

    pub async fn analyze_error(&self, cell_id: &str) -> Result<ErrorAnalysis, SessionError> {
        Ok(self
            .request(|reply| SessionCommand::AnalyzeError {
                cell_id: cell_id.to_string(),
                reply,
            })
            .await??)
    }

    pub async fn apply_fixes(&self, analysis: ErrorAnalysis) -> Result<usize, SessionError> {
        Ok(self
            .request(|reply| SessionCommand::ApplyFixes { analysis, reply })
            .await??)
    }

    pub async fn generate_code(
        &self,
        request: impl Into<String>,
    ) -> Result<CodeSuggestion, SessionError> {
        let request = request.into();
        Ok(self
            .request(|reply| SessionCommand::GenerateCode { request, reply })
            .await??)
    }

    pub async fn insert_generated(
        &self,
        suggestion: CodeSuggestion,
        position: Position,
    ) -> Result<String, SessionError> {
        self.request(|reply| SessionCommand::InsertGenerated {
            suggestion,
            position,
            reply,
        })
        .await
    }

    pub async fn optimize(&self) -> Result<OptimizeResponse, SessionError> {
        Ok(self.request(|reply| SessionCommand::Optimize { reply }).await??)
    }

    pub async fn rename(&self, name: impl Into<String>) -> Result<(), SessionError> {
        let name = name.into();
        self.request(|reply| SessionCommand::Rename { name, reply })
            .await
    }

    /// Save and return the filename used.
    pub async fn save(&self) -> Result<String, SessionError> {
        Ok(self.request(|reply| SessionCommand::Save { reply }).await??)
    }

    pub async fn load(&self, filename: &str) -> Result<(), SessionError> {
        Ok(self
            .request(|reply| SessionCommand::Load {
                filename: filename.to_string(),
                reply,
            })
            .await??)
    }

    pub async fn list(&self) -> Result<Vec<NotebookListing>, SessionError> {
        Ok(self.request(|reply| SessionCommand::List { reply }).await??)
    }

    /// Await `body`, then shut the kernel down whether or not it succeeded.
    ///
    /// The body's error is returned in preference to a shutdown error.
    pub async fn with_shutdown<T, E>(
        &self,
        body: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        let result = body.await;
        let shutdown = self.shutdown().await;
        match (result, shutdown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_err)) => {
                warn!("[session] Shutdown after a failed command also failed: {}", shutdown_err);
                Err(e)
            }
        }
    }

    /// The state after every command queued before this one.
    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }
}
