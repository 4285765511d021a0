use crate::config::Config;
use crate::error_handling::AgentError;
use crate::logging::get_logger;
use crate::session::Turn;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// One progress event from a model pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub total: Option<u64>,
    pub completed: Option<u64>,
}

/// Common interface for the local inference service
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Endpoint base URL, for status messages
    fn endpoint(&self) -> &str;

    /// Lightweight probe of the service
    async fn is_reachable(&self) -> bool;

    /// Whether `model` is installed locally
    async fn check_model_available(&self, model: &str) -> Result<bool, AgentError>;

    /// Download `model`, reporting progress events on `progress` while it runs
    async fn pull_model(
        &self,
        model: &str,
        progress: Option<UnboundedSender<PullProgress>>,
    ) -> Result<(), AgentError>;

    /// Send the ordered transcript and return the assistant reply
    async fn converse(&self, turns: &[Turn]) -> Result<String, AgentError>;
}

/// Client for a local Ollama server
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    temperature: Option<f32>,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self::with_timeout(base_url, model, Duration::from_secs(120))
    }

    pub fn with_timeout(base_url: String, model: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            temperature: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut client = Self::with_timeout(
            config.ollama_url.clone(),
            config.model.clone(),
            Duration::from_millis(config.ai_timeout),
        );
        client.temperature = config.temperature;
        client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request_error(&self, e: reqwest::Error) -> AgentError {
        if e.is_decode() {
            return AgentError::InvalidResponse(format!("could not decode reply: {}", e));
        }

        let reason = if e.is_timeout() {
            format!("timed out after {:?}", self.timeout)
        } else if e.is_connect() {
            format!("connection failed: {}", e)
        } else {
            e.to_string()
        };

        AgentError::Unavailable {
            endpoint: self.base_url.clone(),
            reason,
        }
    }

    fn log_call(&self, operation: &str, start: Instant, result: Result<(), &AgentError>) {
        if let Ok(logger) = get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_inference(
                    operation,
                    &self.model,
                    start.elapsed().as_millis() as u64,
                    result.err().and_then(|e| e.kind()).map(|k| k.as_str()),
                );
            }
        }
    }

    async fn chat(&self, turns: &[Turn]) -> Result<String, AgentError> {
        let messages: Vec<_> = turns
            .iter()
            .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.text }))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(temperature) = self.temperature {
            body["options"] = json!({ "temperature": temperature });
        }

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND || error_text.contains("not found") {
                return Err(AgentError::ModelUnavailable {
                    model: self.model.clone(),
                    reason: format!("{} - {}", status, error_text.trim()),
                });
            }
            return Err(AgentError::InvalidResponse(format!(
                "Ollama returned {} - {}",
                status,
                error_text.trim()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(format!("failed to parse reply: {}", e)))?;

        let content = json["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidResponse("no message content in reply".to_string()))?;

        if content.trim().is_empty() {
            return Err(AgentError::InvalidResponse("the model returned an empty reply".to_string()));
        }

        Ok(content.to_string())
    }

    async fn pull(
        &self,
        model: &str,
        progress: Option<UnboundedSender<PullProgress>>,
    ) -> Result<(), AgentError> {
        let unavailable = |reason: String| AgentError::ModelUnavailable {
            model: model.to_string(),
            reason,
        };

        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "name": model, "model": model, "stream": true }))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("pull failed: {} - {}", status, error_text.trim())));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        let mut succeeded = false;

        // NDJSON: events may be split across or packed into chunks
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| unavailable(format!("pull interrupted: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(event) = parse_pull_line(&line) {
                    succeeded |= handle_pull_event(event?, &progress, &unavailable)?;
                }
            }
        }
        if let Some(event) = parse_pull_line(&buffer) {
            succeeded |= handle_pull_event(event?, &progress, &unavailable)?;
        }

        if succeeded {
            Ok(())
        } else {
            Err(unavailable("pull ended before completing".to_string()))
        }
    }
}

fn parse_pull_line(line: &[u8]) -> Option<Result<serde_json::Value, AgentError>> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(text)
            .map_err(|e| AgentError::InvalidResponse(format!("bad pull event: {}", e))),
    )
}

/// Forward one pull event; returns whether it signals completion
fn handle_pull_event(
    event: serde_json::Value,
    progress: &Option<UnboundedSender<PullProgress>>,
    unavailable: &impl Fn(String) -> AgentError,
) -> Result<bool, AgentError> {
    if let Some(error) = event["error"].as_str() {
        return Err(unavailable(error.to_string()));
    }

    let status = event["status"].as_str().unwrap_or_default().to_string();
    let done = status == "success";

    if let Some(tx) = progress {
        let _ = tx.send(PullProgress {
            status,
            total: event["total"].as_u64(),
            completed: event["completed"].as_u64(),
        });
    }

    Ok(done)
}

/// Tag-less model names refer to the `latest` tag
pub fn model_matches(installed: &str, wanted: &str) -> bool {
    if installed == wanted {
        return true;
    }
    match (installed.split_once(':'), wanted.contains(':')) {
        (Some((name, "latest")), false) => name == wanted,
        (None, true) => wanted.strip_suffix(":latest") == Some(installed),
        _ => false,
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn is_reachable(&self) -> bool {
        self.client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn check_model_available(&self, model: &str) -> Result<bool, AgentError> {
        let start = Instant::now();
        let result = async {
            let response = self
                .client
                .get(self.url("/api/tags"))
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| self.request_error(e))?;

            if !response.status().is_success() {
                return Err(AgentError::InvalidResponse(format!(
                    "Ollama returned {} listing models",
                    response.status()
                )));
            }

            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| AgentError::InvalidResponse(format!("failed to parse model list: {}", e)))?;

            Ok(json["models"]
                .as_array()
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m["name"].as_str())
                        .any(|name| model_matches(name, model))
                })
                .unwrap_or(false))
        }
        .await;

        self.log_call("check_model", start, result.as_ref().map(|_| ()));
        result
    }

    async fn pull_model(
        &self,
        model: &str,
        progress: Option<UnboundedSender<PullProgress>>,
    ) -> Result<(), AgentError> {
        let start = Instant::now();
        let result = self.pull(model, progress).await;
        self.log_call("pull", start, result.as_ref().map(|_| ()));
        result
    }

    async fn converse(&self, turns: &[Turn]) -> Result<String, AgentError> {
        let start = Instant::now();
        let result = self.chat(turns).await;
        self.log_call("converse", start, result.as_ref().map(|_| ()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::ErrorKind;
    use crate::session::Role;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    struct Route {
        request_line: &'static str,
        status: u16,
        body: String,
    }

    fn route(request_line: &'static str, status: u16, body: impl Into<String>) -> Route {
        Route {
            request_line,
            status,
            body: body.into(),
        }
    }

    /// Serve canned HTTP responses; returns the base URL and captured request bodies
    async fn serve(routes: Vec<Route>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let seen = captured.clone();
        let routes = Arc::new(routes);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                let seen = seen.clone();

                tokio::spawn(async move {
                    let mut data = Vec::new();
                    let mut buf = [0u8; 4096];
                    let header_end = loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };

                    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    while data.len() < header_end + content_length {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                    }
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&data[header_end..]).to_string());

                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    let (status, body) = routes
                        .iter()
                        .find(|r| request_line.starts_with(r.request_line))
                        .map(|r| (r.status, r.body.clone()))
                        .unwrap_or((404, "{\"error\":\"no route\"}".to_string()));

                    let response = format!(
                        "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), captured)
    }

    async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn turns() -> Vec<Turn> {
        vec![
            Turn::new(Role::System, "You are helpful."),
            Turn::new(Role::User, "list files"),
        ]
    }

    #[test]
    fn test_model_matches_latest_tag() {
        assert!(model_matches("llama3:8b", "llama3:8b"));
        assert!(model_matches("mistral:latest", "mistral"));
        assert!(model_matches("mistral", "mistral:latest"));
        assert!(!model_matches("llama3:70b", "llama3:8b"));
        assert!(!model_matches("llama3:8b", "llama3"));
    }

    #[tokio::test]
    async fn test_converse_sends_ordered_messages() {
        let (url, captured) = serve(vec![route(
            "POST /api/chat",
            200,
            r#"{"message":{"role":"assistant","content":"```bash\nls -la\n```"},"done":true}"#,
        )])
        .await;
        let mut client = OllamaClient::new(url, "llama3:8b".to_string());
        client.temperature = Some(0.2);

        let reply = assert_ok!(client.converse(&turns()).await);

        assert_eq!(reply, "```bash\nls -la\n```");
        let body: serde_json::Value = serde_json::from_str(&captured.lock().unwrap()[0]).unwrap();
        assert_eq!(body["model"], "llama3:8b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "list files");
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_converse_unreachable_is_unavailable() {
        let client = OllamaClient::new(unreachable_url().await, "llama3:8b".to_string());

        let err = assert_err!(client.converse(&turns()).await);

        assert_eq!(err.kind(), Some(ErrorKind::Unavailable));
        assert!(!client.is_reachable().await);
    }

    #[tokio::test]
    async fn test_converse_error_mapping() {
        let (url, _) = serve(vec![route(
            "POST /api/chat",
            404,
            r#"{"error":"model 'llama3:8b' not found"}"#,
        )])
        .await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());
        let err = assert_err!(client.converse(&turns()).await);
        assert_eq!(err.kind(), Some(ErrorKind::ModelUnavailable));

        let (url, _) = serve(vec![route("POST /api/chat", 500, r#"{"error":"boom"}"#)]).await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());
        let err = assert_err!(client.converse(&turns()).await);
        assert_eq!(err.kind(), Some(ErrorKind::InvalidResponse));

        let (url, _) = serve(vec![route(
            "POST /api/chat",
            200,
            r#"{"message":{"role":"assistant","content":"   "}}"#,
        )])
        .await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());
        let err = assert_err!(client.converse(&turns()).await);
        assert_eq!(err.kind(), Some(ErrorKind::InvalidResponse));

        let (url, _) = serve(vec![route("POST /api/chat", 200, "not json")]).await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());
        let err = assert_err!(client.converse(&turns()).await);
        assert_eq!(err.kind(), Some(ErrorKind::InvalidResponse));
    }

    #[tokio::test]
    async fn test_check_model_available() {
        let (url, _) = serve(vec![route(
            "GET /api/tags",
            200,
            r#"{"models":[{"name":"mistral:latest"},{"name":"llama3:8b"}]}"#,
        )])
        .await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());

        assert!(client.is_reachable().await);
        assert!(assert_ok!(client.check_model_available("llama3:8b").await));
        assert!(assert_ok!(client.check_model_available("mistral").await));
        assert!(!assert_ok!(client.check_model_available("phi3").await));
    }

    #[tokio::test]
    async fn test_pull_streams_progress() {
        let events = [
            r#"{"status":"pulling manifest"}"#,
            r#"{"status":"downloading","total":100,"completed":40}"#,
            r#"{"status":"downloading","total":100,"completed":100}"#,
            r#"{"status":"success"}"#,
        ]
        .join("\n");
        let (url, captured) = serve(vec![route("POST /api/pull", 200, events)]).await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        assert_ok!(client.pull_model("llama3:8b", Some(tx)).await);

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(received[1].completed, Some(40));
        assert_eq!(received[1].total, Some(100));
        assert_eq!(received[3].status, "success");

        let body: serde_json::Value = serde_json::from_str(&captured.lock().unwrap()[0]).unwrap();
        assert_eq!(body["name"], "llama3:8b");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_pull_failure_is_model_unavailable() {
        let (url, _) = serve(vec![route(
            "POST /api/pull",
            200,
            "{\"status\":\"pulling manifest\"}\n{\"error\":\"pull model manifest: file does not exist\"}\n",
        )])
        .await;
        let client = OllamaClient::new(url, "nonexistent-model".to_string());

        let err = assert_err!(client.pull_model("nonexistent-model", None).await);

        assert_eq!(err.kind(), Some(ErrorKind::ModelUnavailable));
        assert!(err.to_string().contains("file does not exist"));
    }

    #[tokio::test]
    async fn test_pull_without_success_event_fails() {
        let (url, _) = serve(vec![route("POST /api/pull", 200, r#"{"status":"pulling manifest"}"#)]).await;
        let client = OllamaClient::new(url, "llama3:8b".to_string());

        let err = assert_err!(client.pull_model("llama3:8b", None).await);
        assert_eq!(err.kind(), Some(ErrorKind::ModelUnavailable));
    }
}
