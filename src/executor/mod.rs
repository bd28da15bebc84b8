//! Remote executor client
//!
//! Opaque contract for asking an external automation service to start or stop
//! a service on a target machine: `{start, stop, poll}` over a task handle.
//! The default implementation speaks HTTP/JSON to the automation server's
//! task API; the startup orchestrator and idle monitor only see the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Handle to a task created on the automation server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(pub String);

/// Task state reported by the automation server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Success,
    Failed(String),
}

/// Errors from the executor client.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The automation server could not be reached
    #[error("Executor unreachable: {0}")]
    Unreachable(String),

    /// The server answered with an unexpected status or payload
    #[error("Executor protocol error: {0}")]
    Protocol(String),

    /// Waiting for task completion exceeded the caller's budget
    #[error("Executor task {0} timed out after {1:?}")]
    TaskTimeout(String, Duration),

    /// The caller's cancellation token fired while waiting
    #[error("Executor wait cancelled")]
    Cancelled,
}

/// Remote start/stop contract.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn start(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError>;

    async fn stop(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError>;

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskStatus, ExecutorError>;
}

/// Poll a task until it completes, the timeout passes, or `cancel` fires.
pub async fn wait_for_completion(
    executor: &dyn RemoteExecutor,
    handle: &TaskHandle,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<TaskStatus, ExecutorError> {
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(ExecutorError::TaskTimeout(handle.0.clone(), timeout));
        }

        match executor.poll(handle).await? {
            TaskStatus::Running => {}
            done => return Ok(done),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest {
    template_id: i64,
    environment: HashMap<String, String>,
    extra_vars: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(alias = "id")]
    task_id: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation against the automation server's task API:
/// `POST /api/project/{p}/tasks` to create, `GET /api/project/{p}/tasks/{id}`
/// to poll.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
    project_id: i64,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, project_id: i64, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id,
        }
    }

    async fn create_task(
        &self,
        action: &str,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        let url = format!("{}/api/project/{}/tasks", self.base_url, self.project_id);

        let mut environment = HashMap::new();
        environment.insert("SERVICE_ID".to_string(), service_id.to_string());
        environment.insert("MACHINE_ID".to_string(), machine_id.to_string());
        environment.insert("ACTION".to_string(), action.to_string());

        let mut vars = extra_vars.clone();
        vars.insert("service_id".to_string(), service_id.to_string());
        vars.insert("machine_id".to_string(), machine_id.to_string());

        let payload = CreateTaskRequest {
            template_id,
            environment,
            extra_vars: vars,
        };

        tracing::debug!(service_id, machine_id, action, url = %url, "Submitting executor task");

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExecutorError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::Protocol(format!(
                "task creation returned {}",
                response.status()
            )));
        }

        let body: TaskResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        let task_id = match &body.task_id {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(ExecutorError::Protocol(format!(
                    "unexpected task id: {other}"
                )))
            }
        };

        tracing::info!(service_id, machine_id, action, task_id = %task_id, "Executor task created");
        Ok(TaskHandle(task_id))
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn start(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        self.create_task("start", service_id, machine_id, template_id, extra_vars)
            .await
    }

    async fn stop(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        self.create_task("stop", service_id, machine_id, template_id, extra_vars)
            .await
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskStatus, ExecutorError> {
        let url = format!(
            "{}/api/project/{}/tasks/{}",
            self.base_url, self.project_id, handle.0
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExecutorError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::Protocol(format!(
                "task poll returned {}",
                response.status()
            )));
        }

        let body: TaskResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        match body.status.as_deref() {
            Some("success") => Ok(TaskStatus::Success),
            Some("error") | Some("failed") => Ok(TaskStatus::Failed(
                body.message.unwrap_or_else(|| "task failed".to_string()),
            )),
            _ => Ok(TaskStatus::Running),
        }
    }
}

/// Scripted executor for tests: start/stop always succeed with handle
/// `task-N`, and poll walks a fixed list of statuses.
pub struct MockExecutor {
    statuses: std::sync::Mutex<Vec<TaskStatus>>,
    started: std::sync::Mutex<Vec<(String, String, i64)>>,
    stopped: std::sync::Mutex<Vec<(String, String, i64)>>,
}

impl MockExecutor {
    pub fn new(statuses: Vec<TaskStatus>) -> Self {
        Self {
            statuses: std::sync::Mutex::new(statuses),
            started: std::sync::Mutex::new(Vec::new()),
            stopped: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> Vec<(String, String, i64)> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<(String, String, i64)> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn start(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        _extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        let mut started = self.started.lock().unwrap();
        started.push((service_id.to_string(), machine_id.to_string(), template_id));
        Ok(TaskHandle(format!("task-{}", started.len())))
    }

    async fn stop(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: i64,
        _extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        let mut stopped = self.stopped.lock().unwrap();
        stopped.push((service_id.to_string(), machine_id.to_string(), template_id));
        Ok(TaskHandle(format!("task-{}", stopped.len())))
    }

    async fn poll(&self, _handle: &TaskHandle) -> Result<TaskStatus, ExecutorError> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.is_empty() {
            Ok(TaskStatus::Success)
        } else {
            Ok(statuses.remove(0))
        }
    }
}
