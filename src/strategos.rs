use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::types::WorkerTemplate;
use crate::{log_debug, log_warn};

/// Bounded exponential backoff for transient failures: 200ms, 400ms, 800ms.
const RETRY_BACKOFFS_MS: [u64; 3] = [200, 400, 800];

/// Outcome of waiting for a worker to finish, distinguishing "the worker
/// told us it's done" from "we gave up" — the client must never infer
/// success from the mere absence of a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub ok: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl WaitOutcome {
    fn done(output: String) -> Self {
        WaitOutcome {
            ok: true,
            output: Some(output),
            error: None,
            timed_out: false,
        }
    }

    fn failed(error: String) -> Self {
        WaitOutcome {
            ok: false,
            output: None,
            error: Some(error),
            timed_out: false,
        }
    }

    fn timeout() -> Self {
        WaitOutcome {
            ok: false,
            output: None,
            error: Some("timeout".to_string()),
            timed_out: true,
        }
    }

    /// Failure reason surfaced on `worker_done` events. Distinguishes a
    /// timeout from any other worker-reported failure so subscribers don't
    /// have to infer it from `timedOut` plus a missing `error`.
    pub fn reason(&self) -> Option<String> {
        if self.ok {
            None
        } else if self.timed_out {
            Some("timeout".to_string())
        } else {
            self.error.clone()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub project_id: Option<String>,
}

/// Narrow command surface consumed from the external worker-runtime
/// process orchestrator. The engine never reaches past this trait into the
/// runtime's own internals (no direct process/session access).
#[async_trait]
pub trait StrategosClient: Send + Sync {
    async fn spawn(
        &self,
        template: WorkerTemplate,
        label: &str,
        project_path: &Path,
        parent_worker_id: Option<&str>,
        task_description: &str,
    ) -> Result<String, EngineError>;

    async fn wait_for_done(
        &self,
        worker_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, EngineError>;

    async fn read_output(&self, worker_id: &str, strip_ansi: bool) -> Result<String, EngineError>;

    async fn delete(&self, worker_id: &str) -> Result<(), EngineError>;

    async fn list_workers(&self, filter: Option<&WorkerFilter>) -> Result<Vec<String>, EngineError>;
}

/// Strips ANSI CSI escape sequences (`ESC [ ... letter`) from captured
/// worker output. Hand-rolled rather than a regex dependency — the grammar
/// is a short fixed-form scan.
pub fn strip_ansi_codes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[derive(serde::Serialize)]
struct SpawnRequest<'a> {
    template: &'a str,
    label: &'a str,
    project_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_worker_id: Option<&'a str>,
    task_description: &'a str,
}

#[derive(serde::Deserialize)]
struct SpawnResponse {
    worker_id: String,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    done: bool,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation against the worker-runtime's base URL. `WaitForDone`
/// long-polls the status endpoint on a short interval; the poll loop and
/// the caller's cancellation are raced with `tokio::select!` so a pause
/// eagerly unwinds instead of waiting out the full timeout.
pub struct HttpStrategosClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStrategosClient {
    pub fn new(base_url: String) -> Self {
        HttpStrategosClient {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let mut last_err = None;
        for backoff_ms in RETRY_BACKOFFS_MS.iter().chain(std::iter::once(&0)) {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    log_warn!("strategos request failed (retrying): {}", e);
                    last_err = Some(e);
                    if *backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::TransientBackendFailure("exhausted retries".into())))
    }
}

fn worker_template_name(template: WorkerTemplate) -> &'static str {
    match template {
        WorkerTemplate::Research => "research",
        WorkerTemplate::Review => "review",
        WorkerTemplate::Impl => "impl",
    }
}

#[async_trait]
impl StrategosClient for HttpStrategosClient {
    async fn spawn(
        &self,
        template: WorkerTemplate,
        label: &str,
        project_path: &Path,
        parent_worker_id: Option<&str>,
        task_description: &str,
    ) -> Result<String, EngineError> {
        let project_path_str = project_path.to_string_lossy();
        self.with_retry(|| async {
            let body = SpawnRequest {
                template: worker_template_name(template),
                label,
                project_path: &project_path_str,
                parent_worker_id,
                task_description,
            };
            let resp = self
                .client
                .post(self.url("/workers"))
                .json(&body)
                .send()
                .await?;
            let resp = resp.error_for_status()?;
            let parsed: SpawnResponse = resp.json().await?;
            log_debug!("[strategos] spawned worker {}", parsed.worker_id);
            Ok(parsed.worker_id)
        })
        .await
    }

    async fn wait_for_done(
        &self,
        worker_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, EngineError> {
        let poll = async {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(WaitOutcome::timeout());
                }
                let status: StatusResponse = self
                    .with_retry(|| async {
                        let resp = self
                            .client
                            .get(self.url(&format!("/workers/{}", worker_id)))
                            .send()
                            .await?;
                        let resp = resp.error_for_status()?;
                        Ok(resp.json().await?)
                    })
                    .await?;
                if status.done {
                    return Ok(match status.error {
                        Some(e) => WaitOutcome::failed(e),
                        None => WaitOutcome::done(status.output.unwrap_or_default()),
                    });
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };

        tokio::select! {
            result = poll => result,
            _ = cancel.cancelled() => Err(EngineError::Paused),
        }
    }

    async fn read_output(&self, worker_id: &str, strip_ansi: bool) -> Result<String, EngineError> {
        self.with_retry(|| async {
            let resp = self
                .client
                .get(self.url(&format!("/workers/{}/output", worker_id)))
                .send()
                .await?;
            let resp = resp.error_for_status()?;
            Ok(resp.text().await?)
        })
        .await
        .map(|text| if strip_ansi { strip_ansi_codes(&text) } else { text })
    }

    async fn delete(&self, worker_id: &str) -> Result<(), EngineError> {
        let resp = self
            .client
            .delete(self.url(&format!("/workers/{}", worker_id)))
            .send()
            .await?;
        // Idempotent: a 404 on delete is not an error.
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn list_workers(&self, filter: Option<&WorkerFilter>) -> Result<Vec<String>, EngineError> {
        let mut req = self.client.get(self.url("/workers"));
        if let Some(f) = filter {
            if let Some(project_id) = &f.project_id {
                req = req.query(&[("project_id", project_id.as_str())]);
            }
        }
        let resp = req.send().await?;
        let resp = resp.error_for_status()?;
        let ids: Vec<String> = resp.json().await?;
        Ok(ids)
    }
}

/// Canned-response mock for tests. Each call pops the next scripted result
/// from a per-call-kind queue so test setup reads like a script of what the
/// worker runtime will say.
pub struct MockStrategosClient {
    spawn_results: tokio::sync::Mutex<Vec<Result<String, EngineError>>>,
    wait_results: tokio::sync::Mutex<HashMap<String, WaitOutcome>>,
    outputs: tokio::sync::Mutex<HashMap<String, String>>,
    deleted: tokio::sync::Mutex<Vec<String>>,
}

impl MockStrategosClient {
    pub fn new() -> Self {
        MockStrategosClient {
            spawn_results: tokio::sync::Mutex::new(Vec::new()),
            wait_results: tokio::sync::Mutex::new(HashMap::new()),
            outputs: tokio::sync::Mutex::new(HashMap::new()),
            deleted: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn push_spawn(&self, worker_id: impl Into<String>) {
        self.spawn_results
            .lock()
            .await
            .push(Ok(worker_id.into()));
    }

    pub async fn script_wait(&self, worker_id: impl Into<String>, outcome: WaitOutcome) {
        self.wait_results.lock().await.insert(worker_id.into(), outcome);
    }

    pub async fn script_output(&self, worker_id: impl Into<String>, output: impl Into<String>) {
        self.outputs.lock().await.insert(worker_id.into(), output.into());
    }

    pub async fn deleted_workers(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

impl Default for MockStrategosClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategosClient for MockStrategosClient {
    async fn spawn(
        &self,
        _template: WorkerTemplate,
        label: &str,
        _project_path: &Path,
        _parent_worker_id: Option<&str>,
        _task_description: &str,
    ) -> Result<String, EngineError> {
        let mut queue = self.spawn_results.lock().await;
        if let Some(next) = queue.pop() {
            return next;
        }
        Ok(format!("mock-worker-{}", label))
    }

    async fn wait_for_done(
        &self,
        worker_id: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Paused);
        }
        let results = self.wait_results.lock().await;
        Ok(results
            .get(worker_id)
            .cloned()
            .unwrap_or_else(|| WaitOutcome::done(String::new())))
    }

    async fn read_output(&self, worker_id: &str, strip_ansi: bool) -> Result<String, EngineError> {
        let outputs = self.outputs.lock().await;
        let text = outputs.get(worker_id).cloned().unwrap_or_default();
        Ok(if strip_ansi { strip_ansi_codes(&text) } else { text })
    }

    async fn delete(&self, worker_id: &str) -> Result<(), EngineError> {
        self.deleted.lock().await.push(worker_id.to_string());
        Ok(())
    }

    async fn list_workers(&self, _filter: Option<&WorkerFilter>) -> Result<Vec<String>, EngineError> {
        Ok(self.outputs.lock().await.keys().cloned().collect())
    }
}
