//! In-memory backend used by unit tests.
//!
//! Simulates a tiny kernel: `print(x)` writes `x\n` to stdout, unbalanced
//! parentheses raise a `SyntaxError`, everything else runs silently. Every
//! request is recorded so tests can assert on what was sent and in which
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::gateway::{GatewayError, NotebookBackend};
use crate::protocol::{
    AnalyzeErrorRequest, ChatRequest, ChatResponse, CodeSuggestion, CreateKernelResponse,
    ErrorAnalysis, ExecuteRequest, ExecuteResponse, GenerateCodeRequest, HealthResponse,
    KernelAck, ListNotebooksResponse, LoadNotebookResponse, NotebookListing, OptimizeRequest,
    OptimizeResponse, SaveAck, SaveNotebookRequest, WireCell,
};

#[derive(Default)]
pub struct FakeState {
    pub kernels_created: u32,
    pub execution_count: u32,
    /// Operation name -> error returned by every call of that operation.
    pub failures: HashMap<&'static str, GatewayError>,
    /// Every call, in order, as `op` or `op:detail`.
    pub calls: Vec<String>,
    pub executed: Vec<ExecuteRequest>,
    pub chats: Vec<ChatRequest>,
    pub chat_responses: VecDeque<ChatResponse>,
    pub analyses: VecDeque<ErrorAnalysis>,
    pub suggestions: VecDeque<CodeSuggestion>,
    pub saved: Vec<SaveNotebookRequest>,
    pub notebooks: HashMap<String, Vec<WireCell>>,
    /// Hold every chat request this long before answering.
    pub chat_delay: Option<Duration>,
    pub execute_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: &'static str, error: GatewayError) {
        self.state.lock().unwrap().failures.insert(op, error);
    }

    pub fn heal(&self, op: &'static str) {
        self.state.lock().unwrap().failures.remove(op);
    }

    pub fn push_chat(&self, response: ChatResponse) {
        self.state.lock().unwrap().chat_responses.push_back(response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn executed(&self) -> Vec<ExecuteRequest> {
        self.state.lock().unwrap().executed.clone()
    }

    fn begin(&self, op: &'static str, detail: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        if detail.is_empty() {
            state.calls.push(op.to_string());
        } else {
            state.calls.push(format!("{op}:{detail}"));
        }
        match state.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Run `code` against the simulated kernel.
fn simulate(code: &str, count: u32) -> ExecuteResponse {
    let opens = code.matches('(').count();
    let closes = code.matches(')').count();
    if opens != closes {
        return ExecuteResponse {
            cell_id: None,
            execution_count: Some(count),
            outputs: vec![],
            error: Some(json!({
                "ename": "SyntaxError",
                "evalue": "'(' was never closed",
                "traceback": ["  Cell In[1], line 1", "SyntaxError: '(' was never closed"],
            })),
            status: Some("error".into()),
        };
    }

    let outputs = code
        .lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix("print(")
                .and_then(|rest| rest.strip_suffix(')'))
        })
        .map(|arg| {
            json!({
                "type": "stream",
                "name": "stdout",
                "text": format!("{}\n", arg.trim_matches(|c| c == '"' || c == '\'')),
            })
        })
        .collect();

    ExecuteResponse {
        cell_id: None,
        execution_count: Some(count),
        outputs,
        error: None,
        status: Some("success".into()),
    }
}

fn ack(status: &str, kernel_id: &str) -> KernelAck {
    KernelAck {
        status: status.to_string(),
        kernel_id: Some(kernel_id.to_string()),
    }
}

impl NotebookBackend for FakeBackend {
    async fn health(&self) -> Result<HealthResponse, GatewayError> {
        self.begin("health", "")?;
        Ok(HealthResponse {
            status: "ok".into(),
            message: "fake".into(),
            version: "1.0.0".into(),
        })
    }

    async fn create_kernel(&self) -> Result<CreateKernelResponse, GatewayError> {
        self.begin("create_kernel", "")?;
        let mut state = self.state.lock().unwrap();
        state.kernels_created += 1;
        state.execution_count = 0;
        Ok(CreateKernelResponse {
            kernel_id: format!("kernel-{}", state.kernels_created),
            status: "created".into(),
        })
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.begin("restart_kernel", kernel_id)?;
        self.state.lock().unwrap().execution_count = 0;
        Ok(ack("restarted", kernel_id))
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.begin("interrupt_kernel", kernel_id)?;
        Ok(ack("interrupted", kernel_id))
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.begin("shutdown_kernel", kernel_id)?;
        Ok(ack("shutdown", kernel_id))
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, GatewayError> {
        self.begin("execute", &request.cell_id)?;
        let delay = self.state.lock().unwrap().execute_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.execution_count += 1;
        let mut response = simulate(&request.code, state.execution_count);
        response.cell_id = Some(request.cell_id.clone());
        state.executed.push(request);
        Ok(response)
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        self.begin("chat", "")?;
        let delay = self.state.lock().unwrap().chat_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.chats.push(request);
        Ok(state.chat_responses.pop_front().unwrap_or(ChatResponse {
            message: "Nothing to do.".into(),
            tool_calls: vec![],
            finish_reason: Some("stop".into()),
        }))
    }

    async fn analyze_error(
        &self,
        request: AnalyzeErrorRequest,
    ) -> Result<ErrorAnalysis, GatewayError> {
        self.begin("analyze_error", &request.error_cell_id)?;
        let mut state = self.state.lock().unwrap();
        Ok(state.analyses.pop_front().unwrap_or(ErrorAnalysis {
            analysis: "No idea".into(),
            cells_to_fix: vec![request.error_cell_id.clone()],
            fixes: HashMap::new(),
            restart_needed: false,
            continue_from_cell: request.error_cell_id,
            explanation: String::new(),
        }))
    }

    async fn generate_code(
        &self,
        request: GenerateCodeRequest,
    ) -> Result<CodeSuggestion, GatewayError> {
        self.begin("generate_code", &request.user_request)?;
        let mut state = self.state.lock().unwrap();
        Ok(state.suggestions.pop_front().unwrap_or(CodeSuggestion {
            code: "# generated".into(),
            explanation: String::new(),
            cell_type: "code".into(),
            dependencies: vec![],
        }))
    }

    async fn optimize(&self, _request: OptimizeRequest) -> Result<OptimizeResponse, GatewayError> {
        self.begin("optimize", "")?;
        Ok(OptimizeResponse {
            suggestions: vec![],
            overall_assessment: "Looks fine".into(),
        })
    }

    async fn save_notebook(&self, request: SaveNotebookRequest) -> Result<SaveAck, GatewayError> {
        self.begin("save_notebook", &request.filename)?;
        let mut state = self.state.lock().unwrap();
        state
            .notebooks
            .insert(request.filename.clone(), request.cells.clone());
        let filename = request.filename.clone();
        state.saved.push(request);
        Ok(SaveAck {
            status: "saved".into(),
            filename: Some(filename),
        })
    }

    async fn load_notebook(&self, filename: &str) -> Result<LoadNotebookResponse, GatewayError> {
        self.begin("load_notebook", filename)?;
        let state = self.state.lock().unwrap();
        match state.notebooks.get(filename) {
            Some(cells) => Ok(LoadNotebookResponse {
                filename: filename.to_string(),
                cells: cells.clone(),
            }),
            None => Err(GatewayError::Rejected {
                status: 404,
                detail: "Notebook not found".into(),
            }),
        }
    }

    async fn list_notebooks(&self) -> Result<ListNotebooksResponse, GatewayError> {
        self.begin("list_notebooks", "")?;
        let state = self.state.lock().unwrap();
        let mut notebooks: Vec<NotebookListing> = state
            .notebooks
            .keys()
            .map(|name| NotebookListing {
                filename: name.clone(),
                size: None,
                modified: 1_700_000_000.0,
            })
            .collect();
        notebooks.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(ListNotebooksResponse { notebooks })
    }
}
