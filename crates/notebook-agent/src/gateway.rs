//! Client for the notebook backend.
//!
//! The gateway is a stateless request/response adapter: one HTTP call per
//! operation, no retries, no caching. Components above it depend on the
//! [`NotebookBackend`] trait so they can be exercised without a server.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::protocol::{
    AnalyzeErrorRequest, ChatRequest, ChatResponse, CodeSuggestion, CreateKernelResponse,
    ErrorAnalysis, ErrorBody, ExecuteRequest, ExecuteResponse, GenerateCodeRequest,
    HealthResponse, KernelAck, ListNotebooksResponse, LoadNotebookResponse, OptimizeRequest,
    OptimizeResponse, SaveAck, SaveNotebookRequest,
};

/// Error type for gateway operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// No response at all (connection refused, timeout, reset).
    #[error("Could not reach the notebook backend: {0}")]
    Connectivity(String),

    /// The backend answered with a non-success status.
    #[error("{detail}")]
    Rejected { status: u16, detail: String },

    /// The backend answered with something we could not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// The operations the notebook backend offers.
pub trait NotebookBackend: Send + Sync {
    fn health(&self) -> impl Future<Output = Result<HealthResponse, GatewayError>> + Send;

    fn create_kernel(
        &self,
    ) -> impl Future<Output = Result<CreateKernelResponse, GatewayError>> + Send;

    fn restart_kernel(
        &self,
        kernel_id: &str,
    ) -> impl Future<Output = Result<KernelAck, GatewayError>> + Send;

    fn interrupt_kernel(
        &self,
        kernel_id: &str,
    ) -> impl Future<Output = Result<KernelAck, GatewayError>> + Send;

    fn shutdown_kernel(
        &self,
        kernel_id: &str,
    ) -> impl Future<Output = Result<KernelAck, GatewayError>> + Send;

    fn execute(
        &self,
        request: ExecuteRequest,
    ) -> impl Future<Output = Result<ExecuteResponse, GatewayError>> + Send;

    fn chat(
        &self,
        request: ChatRequest,
    ) -> impl Future<Output = Result<ChatResponse, GatewayError>> + Send;

    fn analyze_error(
        &self,
        request: AnalyzeErrorRequest,
    ) -> impl Future<Output = Result<ErrorAnalysis, GatewayError>> + Send;

    fn generate_code(
        &self,
        request: GenerateCodeRequest,
    ) -> impl Future<Output = Result<CodeSuggestion, GatewayError>> + Send;

    fn optimize(
        &self,
        request: OptimizeRequest,
    ) -> impl Future<Output = Result<OptimizeResponse, GatewayError>> + Send;

    fn save_notebook(
        &self,
        request: SaveNotebookRequest,
    ) -> impl Future<Output = Result<SaveAck, GatewayError>> + Send;

    fn load_notebook(
        &self,
        filename: &str,
    ) -> impl Future<Output = Result<LoadNotebookResponse, GatewayError>> + Send;

    fn list_notebooks(
        &self,
    ) -> impl Future<Output = Result<ListNotebooksResponse, GatewayError>> + Send;
}

/// [`NotebookBackend`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base: Url,
    http: reqwest::Client,
}

impl HttpGateway {
    /// Create a gateway for the backend at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        Self::with_timeout(base_url, Duration::from_secs(300))
    }

    /// Set the per-request timeout. Execution requests block until the
    /// kernel finishes, so this bounds the longest cell run.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base = Url::parse(base_url)
            .map_err(|e| GatewayError::Protocol(format!("Invalid backend URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::Protocol(format!(
                "Invalid backend URL {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Protocol(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build an endpoint URL, percent-encoding each path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Protocol("Backend URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<R: DeserializeOwned>(&self, segments: &[&str]) -> Result<R, GatewayError> {
        self.send::<(), R>(Method::GET, segments, None).await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<R, GatewayError> {
        self.send(Method::POST, segments, body).await
    }

    async fn send<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<R, GatewayError> {
        let url = self.endpoint(segments)?;
        debug!("[gateway] {} {}", method, url);

        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!("[gateway] {} {} failed: {}", method, url, e);
            GatewayError::Connectivity(e.to_string())
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Connectivity(e.to_string()))?;

        if !status.is_success() {
            let detail = rejection_detail(status, &bytes);
            warn!("[gateway] {} {} rejected ({}): {}", method, url, status, detail);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Protocol(format!("Failed to parse response: {}", e)))
    }
}

/// Pull the backend's `detail` out of an error body, falling back to the raw
/// body or the status reason.
fn rejection_detail(status: StatusCode, body: &[u8]) -> String {
    if let Ok(err) = serde_json::from_slice::<ErrorBody>(body) {
        return err.message();
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if !text.is_empty() {
        return text;
    }
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

impl NotebookBackend for HttpGateway {
    async fn health(&self) -> Result<HealthResponse, GatewayError> {
        self.get(&[]).await
    }

    async fn create_kernel(&self) -> Result<CreateKernelResponse, GatewayError> {
        self.post::<(), _>(&["kernel", "create"], None).await
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.post::<(), _>(&["kernel", kernel_id, "restart"], None)
            .await
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.post::<(), _>(&["kernel", kernel_id, "interrupt"], None)
            .await
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<KernelAck, GatewayError> {
        self.send::<(), _>(Method::DELETE, &["kernel", kernel_id], None)
            .await
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, GatewayError> {
        self.post(&["execute"], Some(&request)).await
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        self.post(&["agent", "chat"], Some(&request)).await
    }

    async fn analyze_error(
        &self,
        request: AnalyzeErrorRequest,
    ) -> Result<ErrorAnalysis, GatewayError> {
        self.post(&["agent", "analyze-error"], Some(&request)).await
    }

    async fn generate_code(
        &self,
        request: GenerateCodeRequest,
    ) -> Result<CodeSuggestion, GatewayError> {
        self.post(&["agent", "generate-code"], Some(&request)).await
    }

    async fn optimize(&self, request: OptimizeRequest) -> Result<OptimizeResponse, GatewayError> {
        self.post(&["agent", "optimize"], Some(&request)).await
    }

    async fn save_notebook(&self, request: SaveNotebookRequest) -> Result<SaveAck, GatewayError> {
        self.post(&["notebook", "save"], Some(&request)).await
    }

    async fn load_notebook(&self, filename: &str) -> Result<LoadNotebookResponse, GatewayError> {
        self.get(&["notebook", "load", filename]).await
    }

    async fn list_notebooks(&self) -> Result<ListNotebooksResponse, GatewayError> {
        self.get(&["notebook", "list"]).await
    }
}
