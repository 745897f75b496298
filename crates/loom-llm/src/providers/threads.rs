//! Shared REST resource mapping for threaded remote providers.
//!
//! Both remote adapters speak the same threads/messages/runs resource model;
//! they differ only in authentication, query parameters, retry behavior and
//! how agents are registered.

use crate::errors::{ProviderError, ProviderResult};
use crate::retry::RetryPolicy;
use crate::types::{
    Message, Metadata, Role, Run, RunError, RunStatus, Thread, TokenUsage, ToolCall, ToolOutput,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// JSON request/response transport for a threaded provider.
///
/// `path` is relative to the provider base URL and may carry a query string.
#[async_trait]
pub trait ThreadsTransport: Send + Sync {
    async fn send(&self, method: HttpMethod, path: &str, body: Option<Value>)
    -> ProviderResult<Value>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportAuth {
    Bearer(String),
    ApiKeyHeader(String),
}

pub struct ReqwestThreadsTransport {
    client: reqwest::Client,
    base_url: String,
    auth: TransportAuth,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    retry: RetryPolicy,
}

impl ReqwestThreadsTransport {
    pub fn new(base_url: impl Into<String>, auth: TransportAuth) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth,
            headers: Vec::new(),
            query: Vec::new(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        let mut url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        for (index, (name, value)) in self.query.iter().enumerate() {
            let separator = if index == 0 && !url.contains('?') {
                '?'
            } else {
                '&'
            };
            url.push(separator);
            url.push_str(&format!("{name}={value}"));
        }
        url
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> ProviderResult<Value> {
        let mut request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        request = match &self.auth {
            TransportAuth::Bearer(token) => request.bearer_auth(token),
            TransportAuth::ApiKeyHeader(key) => request.header("api-key", key),
        };
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(format!("{} {url} failed: {err}", method.as_str())))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(format!("reading response body failed: {err}")))?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: extract_api_error_message(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| ProviderError::InvalidResponse(format!("json decode failed: {err}")))
    }
}

#[async_trait]
impl ThreadsTransport for ReqwestThreadsTransport {
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> ProviderResult<Value> {
        let url = self.endpoint(path);
        let mut attempt = 1;
        loop {
            debug!(method = method.as_str(), %url, attempt, "provider request");
            match self.send_once(method, &url, body.as_ref()).await {
                Ok(value) => return Ok(value),
                // Only reads are replayed; a replayed POST could create duplicates.
                Err(error)
                    if method == HttpMethod::Get
                        && error.is_transient()
                        && self.retry.allows_retry_after(attempt) =>
                {
                    let delay = self.retry.delay_after_attempt(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(%url, attempt, delay_ms, %error, "retrying provider request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn extract_api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct WireThread {
    id: String,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    thread_id: String,
    role: String,
    #[serde(default)]
    content: Vec<WireContentPart>,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<WireText>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireText {
    Plain(String),
    Annotated { value: String },
}

#[derive(Debug, Deserialize)]
struct WireRun {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default, alias = "agent_id")]
    assistant_id: String,
    status: String,
    #[serde(default)]
    created_at: u64,
    started_at: Option<u64>,
    completed_at: Option<u64>,
    failed_at: Option<u64>,
    cancelled_at: Option<u64>,
    expires_at: Option<u64>,
    last_error: Option<WireRunError>,
    usage: Option<WireUsage>,
    required_action: Option<WireRequiredAction>,
}

#[derive(Debug, Deserialize)]
struct WireRunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireRequiredAction {
    submit_tool_outputs: Option<WireSubmitToolOutputs>,
}

#[derive(Debug, Deserialize)]
struct WireSubmitToolOutputs {
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireList<T> {
    data: Vec<T>,
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> ProviderResult<T> {
    serde_json::from_value(value)
        .map_err(|err| ProviderError::InvalidResponse(format!("malformed {what}: {err}")))
}

pub fn parse_thread(value: Value) -> ProviderResult<Thread> {
    let wire: WireThread = decode(value, "thread")?;
    Ok(Thread {
        id: wire.id,
        created_at: wire.created_at,
        metadata: wire.metadata.unwrap_or_default(),
    })
}

pub fn parse_message(value: Value) -> ProviderResult<Message> {
    let wire: WireMessage = decode(value, "message")?;
    let role = Role::parse(&wire.role).ok_or_else(|| {
        ProviderError::InvalidResponse(format!("unknown message role '{}'", wire.role))
    })?;
    let content = wire
        .content
        .into_iter()
        .filter(|part| part.kind == "text")
        .filter_map(|part| part.text)
        .map(|text| match text {
            WireText::Plain(value) | WireText::Annotated { value } => value,
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Message {
        id: wire.id,
        thread_id: wire.thread_id,
        role,
        content,
        created_at: wire.created_at,
        run_id: wire.run_id.filter(|id| !id.is_empty()),
    })
}

pub fn parse_run(value: Value) -> ProviderResult<Run> {
    let wire: WireRun = decode(value, "run")?;
    let (status, synthesized_error) = match wire.status.as_str() {
        "queued" => (RunStatus::Queued, None),
        "in_progress" | "cancelling" => (RunStatus::InProgress, None),
        "requires_action" => (RunStatus::RequiresAction, None),
        "completed" | "incomplete" => (RunStatus::Completed, None),
        "cancelled" => (RunStatus::Cancelled, None),
        "failed" => (RunStatus::Failed, None),
        "expired" => (
            RunStatus::Failed,
            Some(RunError {
                code: "expired".to_string(),
                message: "run expired before completing".to_string(),
            }),
        ),
        other => {
            return Err(ProviderError::InvalidResponse(format!(
                "unknown run status '{other}'"
            )));
        }
    };

    let last_error = if status == RunStatus::Failed {
        wire.last_error
            .map(|error| RunError {
                code: error.code,
                message: error.message,
            })
            .or(synthesized_error)
            .or_else(|| {
                Some(RunError {
                    code: "unknown".to_string(),
                    message: "run failed without an error payload".to_string(),
                })
            })
    } else {
        None
    };

    let required_action = if status == RunStatus::RequiresAction {
        wire.required_action
            .and_then(|action| action.submit_tool_outputs)
            .map(|submit| {
                submit
                    .tool_calls
                    .into_iter()
                    .map(|call| ToolCall::new(call.id, call.function.name, call.function.arguments))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let failed_at = match status {
        RunStatus::Failed => wire.failed_at.or(wire.expires_at),
        _ => wire.failed_at,
    };

    Ok(Run {
        id: wire.id,
        thread_id: wire.thread_id,
        agent_id: wire.assistant_id,
        status,
        created_at: wire.created_at,
        started_at: wire.started_at,
        completed_at: wire.completed_at,
        failed_at,
        cancelled_at: wire.cancelled_at,
        last_error,
        usage: wire.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
        required_action,
    })
}

fn parse_list<T>(
    value: Value,
    what: &str,
    parse: impl Fn(Value) -> ProviderResult<T>,
) -> ProviderResult<Vec<T>> {
    let list: WireList<Value> = decode(value, what)?;
    list.data.into_iter().map(parse).collect()
}

/// Threads/messages/runs resource operations over a [`ThreadsTransport`].
#[derive(Clone)]
pub struct ThreadsApi {
    transport: Arc<dyn ThreadsTransport>,
}

impl ThreadsApi {
    pub fn new(transport: Arc<dyn ThreadsTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn ThreadsTransport> {
        &self.transport
    }

    pub async fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread> {
        let body = match metadata {
            Some(metadata) if !metadata.is_empty() => json!({ "metadata": metadata }),
            _ => json!({}),
        };
        let value = self
            .transport
            .send(HttpMethod::Post, "threads", Some(body))
            .await?;
        parse_thread(value)
    }

    pub async fn retrieve_thread(&self, thread_id: &str) -> ProviderResult<Thread> {
        let value = self
            .transport
            .send(HttpMethod::Get, &format!("threads/{thread_id}"), None)
            .await
            .map_err(|error| not_found_on_404(error, "thread", thread_id))?;
        parse_thread(value)
    }

    /// Appends a message; `system` is sent as `user` because these providers
    /// reject system messages inside a conversation.
    pub async fn add_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> ProviderResult<Message> {
        let role = match role {
            Role::System => Role::User,
            other => other,
        };
        let value = self
            .transport
            .send(
                HttpMethod::Post,
                &format!("threads/{thread_id}/messages"),
                Some(json!({ "role": role.as_str(), "content": content })),
            )
            .await
            .map_err(|error| not_found_on_404(error, "thread", thread_id))?;
        parse_message(value)
    }

    /// Newest first.
    pub async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>> {
        let limit = limit.unwrap_or(20).clamp(1, 100);
        let value = self
            .transport
            .send(
                HttpMethod::Get,
                &format!("threads/{thread_id}/messages?limit={limit}&order=desc"),
                None,
            )
            .await
            .map_err(|error| not_found_on_404(error, "thread", thread_id))?;
        parse_list(value, "message list", parse_message)
    }

    pub async fn create_run(&self, thread_id: &str, agent_id: &str) -> ProviderResult<Run> {
        let value = self
            .transport
            .send(
                HttpMethod::Post,
                &format!("threads/{thread_id}/runs"),
                Some(json!({ "assistant_id": agent_id })),
            )
            .await?;
        parse_run(value)
    }

    pub async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        let value = self
            .transport
            .send(
                HttpMethod::Get,
                &format!("threads/{thread_id}/runs/{run_id}"),
                None,
            )
            .await
            .map_err(|error| not_found_on_404(error, "run", run_id))?;
        parse_run(value)
    }

    pub async fn list_runs(&self, thread_id: &str, limit: Option<usize>) -> ProviderResult<Vec<Run>> {
        let limit = limit.unwrap_or(20).clamp(1, 100);
        let value = self
            .transport
            .send(
                HttpMethod::Get,
                &format!("threads/{thread_id}/runs?limit={limit}&order=desc"),
                None,
            )
            .await?;
        parse_list(value, "run list", parse_run)
    }

    pub async fn cancel_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        let value = self
            .transport
            .send(
                HttpMethod::Post,
                &format!("threads/{thread_id}/runs/{run_id}/cancel"),
                Some(json!({})),
            )
            .await?;
        parse_run(value)
    }

    pub async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> ProviderResult<Run> {
        let tool_outputs: Vec<Value> = outputs
            .into_iter()
            .map(|output| json!({ "tool_call_id": output.tool_call_id, "output": output.output }))
            .collect();
        let value = self
            .transport
            .send(
                HttpMethod::Post,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                Some(json!({ "tool_outputs": tool_outputs })),
            )
            .await?;
        parse_run(value)
    }
}

fn not_found_on_404(error: ProviderError, resource: &'static str, id: &str) -> ProviderError {
    match error {
        ProviderError::Api { status: 404, .. } => ProviderError::not_found(resource, id),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Serves `failures` 503 responses, then 200 with `{"ok": true}`.
    async fn spawn_flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("stub server should bind");
        let addr = listener.local_addr().expect("stub server addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                read_request(&mut socket).await;
                let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let (status, body) = if hit <= failures {
                    ("503 Service Unavailable", r#"{"error":{"message":"busy"}}"#)
                } else {
                    ("200 OK", r#"{"ok":true}"#)
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            buffer.extend_from_slice(&chunk[..read]);
            let Some(end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buffer[..end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= end + 4 + length {
                return;
            }
        }
    }

    fn flaky_transport(base_url: String) -> ReqwestThreadsTransport {
        ReqwestThreadsTransport::new(base_url, TransportAuth::ApiKeyHeader("k".to_string()))
            .retry_policy(RetryPolicy::exponential(3, 1, 1))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_is_retried_on_service_unavailable() {
        let (base_url, hits) = spawn_flaky_server(2).await;

        let value = flaky_transport(base_url)
            .send(HttpMethod::Get, "threads/t1", None)
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn post_is_never_retried() {
        let (base_url, hits) = spawn_flaky_server(2).await;

        let error = flaky_transport(base_url)
            .send(HttpMethod::Post, "threads", Some(json!({"metadata": {}})))
            .await
            .expect_err("post fails on first 503");

        assert!(matches!(
            error,
            ProviderError::Api { status: 503, ref message } if message == "busy"
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_run_maps_required_tool_calls() {
        let run = parse_run(json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "assistant_id": "asst_1",
            "status": "requires_action",
            "created_at": 10,
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [
                        {"id": "call_a", "type": "function", "function": {"name": "read_file", "arguments": "{\"file_path\":\"a.txt\"}"}},
                        {"id": "call_b", "type": "function", "function": {"name": "list_directory", "arguments": "not json"}}
                    ]
                }
            }
        }))
        .expect("run should parse");

        assert_eq!(run.status, RunStatus::RequiresAction);
        assert_eq!(run.required_action.len(), 2);
        assert_eq!(run.required_action[0].arguments["file_path"], "a.txt");
        assert_eq!(run.required_action[1].arguments, json!({"raw": "not json"}));
        assert!(run.last_error.is_none());
    }

    #[test]
    fn parse_run_failed_carries_error_verbatim() {
        let run = parse_run(json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "assistant_id": "asst_1",
            "status": "failed",
            "last_error": {"code": "rate_limit_exceeded", "message": "slow down"},
            "usage": {"prompt_tokens": 5, "completion_tokens": 0, "total_tokens": 5}
        }))
        .expect("run should parse");

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.last_error.expect("failed run carries an error");
        assert_eq!(error.code, "rate_limit_exceeded");
        assert_eq!(error.message, "slow down");
        assert_eq!(run.usage, Some(TokenUsage::new(5, 0)));
    }

    #[test]
    fn parse_run_expired_becomes_failed_with_code() {
        let run = parse_run(json!({"id": "run_1", "status": "expired"})).expect("parse");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.expect("error").code, "expired");
    }

    #[test]
    fn parse_run_ignores_stale_error_when_not_failed() {
        let run = parse_run(json!({
            "id": "run_1",
            "status": "completed",
            "last_error": {"code": "x", "message": "y"}
        }))
        .expect("parse");
        assert!(run.last_error.is_none());
    }

    #[test]
    fn parse_message_joins_text_parts() {
        let message = parse_message(json!({
            "id": "msg_1",
            "thread_id": "thread_1",
            "role": "assistant",
            "created_at": 3,
            "run_id": "run_1",
            "content": [
                {"type": "text", "text": {"value": "hello", "annotations": []}},
                {"type": "image_file", "image_file": {"file_id": "f"}},
                {"type": "text", "text": {"value": "world", "annotations": []}}
            ]
        }))
        .expect("message should parse");

        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "hello\nworld");
        assert_eq!(message.run_id.as_deref(), Some("run_1"));
    }

    #[test]
    fn unknown_run_status_is_rejected() {
        let error = parse_run(json!({"id": "run_1", "status": "paused"})).expect_err("reject");
        assert!(matches!(error, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn api_error_message_is_extracted_from_json_body() {
        assert_eq!(
            extract_api_error_message(r#"{"error":{"message":"No thread found"}}"#),
            "No thread found"
        );
        assert_eq!(extract_api_error_message("plain failure"), "plain failure");
    }

    #[test]
    fn endpoint_appends_static_query_parameters() {
        let transport = ReqwestThreadsTransport::new(
            "https://example.test/",
            TransportAuth::ApiKeyHeader("k".to_string()),
        )
        .query_param("api-version", "2025-05-01");
        assert_eq!(
            transport.endpoint("threads/t1/messages?limit=5"),
            "https://example.test/threads/t1/messages?limit=5&api-version=2025-05-01"
        );
        assert_eq!(
            transport.endpoint("/threads"),
            "https://example.test/threads?api-version=2025-05-01"
        );
    }
}
