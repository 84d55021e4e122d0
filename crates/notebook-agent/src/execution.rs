//! Execution controller: owns the kernel session protocol.
//!
//! ```text
//!   unbound ──create──▶ idle ──run──▶ busy ──ok──▶ idle
//!                                      │
//!                                      └──request failed──▶ error ──next ok──▶ idle
//! ```
//!
//! Callers hold `&mut self` for the whole of a run, so at most one execution
//! is in flight per controller. The session task owns the only controller.
//! Every transition is published on a `watch` channel and passed to the
//! status listener, so `busy` is visible while a run is in flight.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::document::{CellPatch, Document, ExecutionError, Output};
use crate::gateway::{GatewayError, NotebookBackend};
use crate::protocol::ExecuteRequest;
use crate::{CellType, KernelStatus};

/// Error type for controller operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionFailure {
    /// The caller asked to run a cell that is not in the document.
    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Summary of a completed run, for feedback to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cell_id: String,
    pub execution_count: Option<u32>,
    /// The executed code raised (the request itself succeeded).
    pub raised: bool,
}

/// Called on every kernel status transition.
pub type StatusListener = Arc<dyn Fn(KernelStatus) + Send + Sync>;

pub struct ExecutionController<B> {
    backend: B,
    status: watch::Sender<KernelStatus>,
    listener: Option<StatusListener>,
}

impl<B: NotebookBackend> ExecutionController<B> {
    pub fn new(backend: B) -> Self {
        let (status, _) = watch::channel(KernelStatus::Unbound);
        Self {
            backend,
            status,
            listener: None,
        }
    }

    /// Report every status transition to `listener`, in order.
    pub fn with_status_listener(mut self, listener: StatusListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    /// Follow the status without going through the owner of the controller.
    pub fn subscribe(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    fn set_status(&mut self, status: KernelStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!("[exec] Kernel status: {} -> {}", previous, status);
            if let Some(listener) = &self.listener {
                listener(status);
            }
        }
    }

    /// Bind a kernel session if the document has none. Nothing may execute
    /// until this succeeds.
    pub async fn ensure_kernel(&mut self, doc: &mut Document) -> Result<String, ExecutionFailure> {
        if let Some(id) = doc.kernel_id() {
            return Ok(id.to_string());
        }

        info!("[exec] Creating kernel session");
        match self.backend.create_kernel().await {
            Ok(created) => {
                info!("[exec] Bound kernel {}", created.kernel_id);
                doc.bind_kernel(created.kernel_id.clone());
                self.set_status(KernelStatus::Idle);
                Ok(created.kernel_id)
            }
            Err(e) => {
                error!("[exec] Failed to create kernel: {}", e);
                self.set_status(KernelStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Execute one cell and merge the result into the document.
    ///
    /// On a failed request the cell is left exactly as it was. A successful
    /// request whose code raised is a normal result: the error is stored on
    /// the cell.
    pub async fn run_cell(
        &mut self,
        doc: &mut Document,
        cell_id: &str,
    ) -> Result<RunSummary, ExecutionFailure> {
        let kernel_id = self.ensure_kernel(doc).await?;

        let Some(cell) = doc.get(cell_id) else {
            return Err(ExecutionFailure::CellNotFound(cell_id.to_string()));
        };

        if cell.cell_type != CellType::Code {
            debug!("[exec] Cell {} is {}, nothing to execute", cell_id, cell.cell_type);
            return Ok(RunSummary {
                cell_id: cell_id.to_string(),
                execution_count: cell.execution_count,
                raised: false,
            });
        }

        let request = ExecuteRequest {
            kernel_id,
            cell_id: cell_id.to_string(),
            code: cell.code.clone(),
        };

        self.set_status(KernelStatus::Busy);
        info!("[exec] Executing cell {}", cell_id);

        let response = match self.backend.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("[exec] Execution request failed: cell={}, error={}", cell_id, e);
                self.set_status(KernelStatus::Error);
                return Err(e.into());
            }
        };

        let outputs: Vec<Output> = response.outputs.into_iter().map(Output::from_value).collect();
        let error = response.error.map(ExecutionError::from_value);
        let raised = error.is_some();
        if let Some(err) = &error {
            debug!("[exec] Cell {} raised {}: {}", cell_id, err.name, err.message);
        }

        if !doc.update(
            cell_id,
            CellPatch::execution(response.execution_count, outputs, error),
        ) {
            warn!("[exec] Cell {} disappeared during execution", cell_id);
        }
        self.set_status(KernelStatus::Idle);

        Ok(RunSummary {
            cell_id: cell_id.to_string(),
            execution_count: response.execution_count,
            raised,
        })
    }

    /// Run every code cell in document order, one at a time.
    ///
    /// Stops at the first failed request. Cells whose code raises only stop
    /// the sequence when `stop_on_error` is set.
    pub async fn run_all(
        &mut self,
        doc: &mut Document,
        stop_on_error: bool,
    ) -> Result<Vec<RunSummary>, ExecutionFailure> {
        let ids: Vec<String> = doc
            .cells()
            .filter(|c| c.cell_type == CellType::Code)
            .map(|c| c.id.clone())
            .collect();

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let summary = self.run_cell(doc, &id).await?;
            let raised = summary.raised;
            summaries.push(summary);
            if raised && stop_on_error {
                info!("[exec] Stopping run-all at cell {}", id);
                break;
            }
        }
        Ok(summaries)
    }

    /// Restart the kernel and forget every cell's execution state.
    ///
    /// With no session bound this just creates one. Cell state is only
    /// cleared once the backend confirms the restart.
    pub async fn restart(&mut self, doc: &mut Document) -> Result<(), ExecutionFailure> {
        let Some(kernel_id) = doc.kernel_id().map(str::to_string) else {
            self.ensure_kernel(doc).await?;
            return Ok(());
        };

        info!("[exec] Restarting kernel {}", kernel_id);
        match self.backend.restart_kernel(&kernel_id).await {
            Ok(_) => {
                doc.reset_execution_state();
                self.set_status(KernelStatus::Idle);
                Ok(())
            }
            Err(e) => {
                error!("[exec] Failed to restart kernel: {}", e);
                self.set_status(KernelStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Ask the kernel to interrupt. Cell state is untouched.
    pub async fn interrupt(&mut self, doc: &Document) -> Result<(), ExecutionFailure> {
        let Some(kernel_id) = doc.kernel_id() else {
            debug!("[exec] No kernel bound, nothing to interrupt");
            return Ok(());
        };

        match self.backend.interrupt_kernel(kernel_id).await {
            Ok(_) => {
                info!("[exec] Interrupted kernel {}", kernel_id);
                Ok(())
            }
            Err(e) => {
                error!("[exec] Failed to interrupt kernel: {}", e);
                self.set_status(KernelStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Shut the kernel down and unbind it. Cell state is untouched.
    pub async fn shutdown(&mut self, doc: &mut Document) -> Result<(), ExecutionFailure> {
        let Some(kernel_id) = doc.kernel_id().map(str::to_string) else {
            debug!("[exec] No kernel bound, nothing to shut down");
            return Ok(());
        };

        match self.backend.shutdown_kernel(&kernel_id).await {
            Ok(_) => {
                info!("[exec] Shut down kernel {}", kernel_id);
                doc.unbind_kernel();
                self.set_status(KernelStatus::Unbound);
                Ok(())
            }
            Err(e) => {
                error!("[exec] Failed to shut down kernel: {}", e);
                self.set_status(KernelStatus::Error);
                Err(e.into())
            }
        }
    }
}
