// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the twin's shell and submodel repositories.
//!
//! Thin but careful transport: every identifier in a URL segment is unpadded
//! URL-safe Base64; idShort paths are percent-encoded per segment with `/`
//! separators preserved; every request goes through the circuit breaker
//! (HTTP < 500 counts as breaker success, 5xx and transport errors as
//! failure).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use twd_resilience::{BreakerOpen, CircuitBreaker};
use twd_types::{
    ApprovalTask, Shell, Submodel, SubmodelRef, TaskList, TwinSnapshot, b64url_encode,
};

/// Everything percent-encoded except unreserved characters and the `/`
/// separators of an idShort path.
const ID_SHORT_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Errors from twin repository calls.
#[derive(Debug, thiserror::Error)]
pub enum TwinError {
    /// The circuit breaker refused the call.
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),
    /// The request never produced a response.
    #[error("twin request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The repository answered with an unexpected status.
    #[error("twin returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        message: String,
    },
    /// The addressed entity does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },
    /// A response body could not be decoded.
    #[error("twin response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Connection settings for the twin repositories.
#[derive(Debug, Clone)]
pub struct TwinConfig {
    /// Base URL of the shell repository.
    pub aas_base_url: String,
    /// Base URL of the submodel repository, when hosted separately.
    pub submodel_base_url: Option<String>,
    /// Client-side timeout applied to every request.
    pub timeout: Duration,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            aas_base_url: "http://localhost:8081".into(),
            submodel_base_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Breaker-guarded client for shell and submodel repositories.
pub struct TwinClient {
    http: reqwest::Client,
    aas_base: String,
    sm_base: String,
    breaker: Arc<CircuitBreaker>,
}

impl TwinClient {
    /// Create a client from connection settings and a shared breaker.
    ///
    /// # Errors
    ///
    /// Propagates [`reqwest`] builder failures.
    pub fn new(config: TwinConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, TwinError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let aas_base = config.aas_base_url.trim_end_matches('/').to_string();
        let sm_base = config
            .submodel_base_url
            .as_deref()
            .unwrap_or(&config.aas_base_url)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http,
            aas_base,
            sm_base,
            breaker,
        })
    }

    /// The breaker guarding this client.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send a request through the breaker and record the outcome.
    ///
    /// 4xx responses are client errors, not backend failures, so they count
    /// as breaker success.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        query: Option<&[(&str, &str)]>,
    ) -> Result<reqwest::Response, TwinError> {
        self.breaker.ensure_can_execute()?;
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(query) = query {
            request = request.query(query);
        }
        match request.send().await {
            Ok(response) => {
                if response.status().is_server_error() {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                Ok(response)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(TwinError::Transport(err))
            }
        }
    }

    async fn status_error(response: reqwest::Response) -> TwinError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        TwinError::Status { status, message }
    }

    // -- Shell operations ---------------------------------------------------

    /// Fetch a shell by id.
    ///
    /// # Errors
    ///
    /// [`TwinError::NotFound`] on 404, otherwise transport/status errors.
    pub async fn get_shell(&self, aas_id: &str) -> Result<Shell, TwinError> {
        let url = format!("{}/shells/{}", self.aas_base, b64url_encode(aas_id));
        debug!(aas_id, %url, "fetching shell");
        let response = self.send(Method::GET, &url, None, None).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(TwinError::NotFound {
                what: format!("shell {aas_id}"),
            }),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// List every shell in the repository, unwrapping paged results.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn list_shells(&self) -> Result<Vec<Shell>, TwinError> {
        let url = format!("{}/shells", self.aas_base);
        let response = self.send(Method::GET, &url, None, None).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        let body: Value = response.json().await?;
        let items = match body {
            Value::Object(ref map) if map.contains_key("result") => {
                map["result"].clone()
            }
            other => other,
        };
        Ok(serde_json::from_value(items)?)
    }

    /// Fetch the submodel references of a shell.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn get_submodel_refs(&self, aas_id: &str) -> Result<Vec<SubmodelRef>, TwinError> {
        let url = format!(
            "{}/shells/{}/submodel-refs",
            self.aas_base,
            b64url_encode(aas_id)
        );
        let response = self.send(Method::GET, &url, None, None).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        let body: Value = response.json().await?;
        let items = match body {
            Value::Object(ref map) if map.contains_key("result") => map["result"].clone(),
            other => other,
        };
        Ok(serde_json::from_value(items)?)
    }

    // -- Submodel operations ------------------------------------------------

    /// Fetch a submodel by id.
    ///
    /// # Errors
    ///
    /// [`TwinError::NotFound`] on 404, otherwise transport/status errors.
    pub async fn get_submodel(&self, submodel_id: &str) -> Result<Submodel, TwinError> {
        let url = format!("{}/submodels/{}", self.sm_base, b64url_encode(submodel_id));
        debug!(submodel_id, %url, "fetching submodel");
        let response = self.send(Method::GET, &url, None, None).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(TwinError::NotFound {
                what: format!("submodel {submodel_id}"),
            }),
            _ => Err(Self::status_error(response).await),
        }
    }

    fn element_url(&self, submodel_id: &str, id_short_path: &str, suffix: &str) -> String {
        let encoded_path = utf8_percent_encode(id_short_path, ID_SHORT_PATH);
        format!(
            "{}/submodels/{}/submodel-elements/{}{}",
            self.sm_base,
            b64url_encode(submodel_id),
            encoded_path,
            suffix
        )
    }

    /// Fetch one submodel element by idShort path.
    ///
    /// # Errors
    ///
    /// [`TwinError::NotFound`] on 404, otherwise transport/status errors.
    pub async fn get_element(
        &self,
        submodel_id: &str,
        id_short_path: &str,
    ) -> Result<Value, TwinError> {
        let url = self.element_url(submodel_id, id_short_path, "");
        let response = self.send(Method::GET, &url, None, None).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(TwinError::NotFound {
                what: format!("element {id_short_path}"),
            }),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// Read a property value via the `$value` endpoint.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn get_property_value(
        &self,
        submodel_id: &str,
        id_short_path: &str,
    ) -> Result<Value, TwinError> {
        let url = self.element_url(submodel_id, id_short_path, "/$value");
        let response = self.send(Method::GET, &url, None, None).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Write a property value via the `$value` endpoint.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn set_property_value(
        &self,
        submodel_id: &str,
        id_short_path: &str,
        value: &Value,
    ) -> Result<(), TwinError> {
        let url = self.element_url(submodel_id, id_short_path, "/$value");
        let response = self.send(Method::PUT, &url, Some(value), None).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(Self::status_error(response).await),
        }
    }

    // -- Operation invocation -----------------------------------------------

    /// Invoke an operation, async by default.
    ///
    /// # Errors
    ///
    /// Transport/status errors; 200 and 202 are both success.
    pub async fn invoke_operation(
        &self,
        submodel_id: &str,
        operation_path: &str,
        input_arguments: Vec<Value>,
        client_context: Option<Value>,
        async_mode: bool,
    ) -> Result<Value, TwinError> {
        let endpoint = if async_mode { "/$invoke-async" } else { "/$invoke" };
        let url = self.element_url(submodel_id, operation_path, endpoint);
        let mut payload = json!({ "inputArguments": input_arguments });
        if let Some(context) = client_context {
            payload["clientContext"] = context;
        }
        debug!(submodel_id, operation_path, async_mode, "invoking operation");
        let response = self.send(Method::POST, &url, Some(&payload), None).await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(response.json().await?),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// Invoke an operation through its delegation URL.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn invoke_delegated_operation(
        &self,
        delegation_url: &str,
        input_arguments: Vec<Value>,
        simulate: bool,
    ) -> Result<Value, TwinError> {
        let payload = json!({
            "inputArguments": input_arguments,
            "clientContext": { "simulate": simulate },
        });
        debug!(url = delegation_url, simulate, "invoking delegated operation");
        let response = self
            .send(Method::POST, delegation_url, Some(&payload), None)
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(response.json().await?),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// Poll an async job directly over HTTP.
    ///
    /// This is the fallback path the job monitor takes when the shadow
    /// replica stops seeing updates.
    ///
    /// # Errors
    ///
    /// [`TwinError::NotFound`] when the job expired; transport/status errors.
    pub async fn get_job_status(
        &self,
        submodel_id: &str,
        operation_path: &str,
        job_id: &str,
    ) -> Result<Value, TwinError> {
        let url = self.element_url(submodel_id, operation_path, "/$result");
        debug!(submodel_id, operation_path, job_id, "polling job status over HTTP");
        let response = self
            .send(Method::GET, &url, None, Some(&[("jobId", job_id)]))
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(TwinError::NotFound {
                what: format!("job {job_id}"),
            }),
            _ => Err(Self::status_error(response).await),
        }
    }

    // -- Batch --------------------------------------------------------------

    /// Fetch the full twin: shell plus every referenced submodel.
    ///
    /// Referenced submodels that cannot be fetched are logged and skipped,
    /// so a partially-broken repository still yields a usable snapshot.
    ///
    /// # Errors
    ///
    /// Fails only when the shell itself or its reference list cannot be read.
    pub async fn get_full_twin(&self, aas_id: &str) -> Result<TwinSnapshot, TwinError> {
        let shell = self.get_shell(aas_id).await?;
        let refs = self.get_submodel_refs(aas_id).await?;

        let mut submodels = BTreeMap::new();
        for reference in &refs {
            let Some(sm_id) = reference.submodel_id() else {
                continue;
            };
            if sm_id.is_empty() {
                continue;
            }
            match self.get_submodel(sm_id).await {
                Ok(submodel) => {
                    submodels.insert(sm_id.to_string(), submodel);
                }
                Err(err) => {
                    warn!(submodel_id = sm_id, error = %err, "skipping unreachable referenced submodel");
                }
            }
        }
        Ok(TwinSnapshot { shell, submodels })
    }

    // -- Task store ---------------------------------------------------------

    /// Read the task list persisted in the designated twin property.
    ///
    /// Any failure reads as an empty list; the store's canonical copy lives
    /// in the twin and absence is indistinguishable from emptiness there.
    pub async fn get_tasks(&self, submodel_id: &str, property_path: &str) -> Vec<ApprovalTask> {
        let value = match self.get_property_value(submodel_id, property_path).await {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        parse_task_blob(&value).map(|l| l.tasks).unwrap_or_default()
    }

    /// Append a task to the stored list.
    ///
    /// # Errors
    ///
    /// Transport/status errors from the rewrite.
    pub async fn add_task(
        &self,
        submodel_id: &str,
        property_path: &str,
        task: ApprovalTask,
    ) -> Result<(), TwinError> {
        let mut tasks = self.get_tasks(submodel_id, property_path).await;
        tasks.push(task);
        self.update_tasks(submodel_id, property_path, &tasks).await
    }

    /// Replace the entire stored task list.
    ///
    /// The list is rewritten whole to avoid partial updates; see DESIGN.md
    /// for the concurrency caveat.
    ///
    /// # Errors
    ///
    /// Transport/status errors.
    pub async fn update_tasks(
        &self,
        submodel_id: &str,
        property_path: &str,
        tasks: &[ApprovalTask],
    ) -> Result<(), TwinError> {
        let blob = serde_json::to_string(&json!({ "tasks": tasks }))?;
        self.set_property_value(submodel_id, property_path, &Value::String(blob))
            .await
    }

    /// Flip one task's status in the stored list.
    ///
    /// # Errors
    ///
    /// Transport/status errors from the rewrite.
    pub async fn update_task_status(
        &self,
        submodel_id: &str,
        property_path: &str,
        task_id: &str,
        new_status: twd_types::TaskStatus,
        reason: Option<&str>,
    ) -> Result<bool, TwinError> {
        let mut tasks = self.get_tasks(submodel_id, property_path).await;
        let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
            return Ok(false);
        };
        task.status = new_status;
        if let Some(reason) = reason {
            task.rejection_reason = Some(reason.to_string());
        }
        self.update_tasks(submodel_id, property_path, &tasks).await?;
        Ok(true)
    }
}

/// The task property may hold the JSON blob directly or as an encoded string.
fn parse_task_blob(value: &Value) -> Option<TaskList> {
    match value {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}
