//! Generation Service Boundary
//!
//! The tutor talks to language models only through [`LanguageModel`]. A model
//! is stateless from the caller's point of view: every call receives the full
//! session transcript, and the session adapter owns that transcript.

use crate::{
    error::ServiceError,
    schema::GenerationRequest,
    transcript::{Role, Transcript},
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{pin::Pin, sync::Arc, time::Instant};

/// A stream of text deltas from the model.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ServiceError>> + Send>>;

/// Why the model cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    DeviceNotEligible,
    NotEnabled,
    ModelNotReady,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable(UnavailableReason),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Learner-facing explanation, `None` when the model is available.
    pub fn reason(&self) -> Option<String> {
        let Self::Unavailable(reason) = self else {
            return None;
        };
        let text = match reason {
            UnavailableReason::DeviceNotEligible => {
                "Thiết bị này không đủ điều kiện để chạy mô hình AI.".to_string()
            }
            UnavailableReason::NotEnabled => {
                "Tính năng AI chưa được bật. Hãy bật trong phần Cài đặt.".to_string()
            }
            UnavailableReason::ModelNotReady => {
                "Mô hình AI đang tải xuống. Vui lòng thử lại sau.".to_string()
            }
            UnavailableReason::Other(detail) if !detail.is_empty() => {
                format!("Mô hình ngôn ngữ không khả dụng: {detail}")
            }
            UnavailableReason::Other(_) => "Mô hình ngôn ngữ không khả dụng.".to_string(),
        };
        Some(text)
    }
}

/// Sampling strategy for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum Sampling {
    #[default]
    Default,
    Greedy,
    Temperature(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub sampling: Sampling,
}

impl GenerationOptions {
    pub fn greedy() -> Self {
        Self {
            sampling: Sampling::Greedy,
        }
    }

    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            sampling: Sampling::Temperature(temperature.clamp(0.0, 2.0)),
        }
    }

    /// Temperature to send to the backend, if any.
    pub fn temperature(&self) -> Option<f64> {
        match self.sampling {
            Sampling::Default => None,
            Sampling::Greedy => Some(0.0),
            Sampling::Temperature(t) => Some(t),
        }
    }
}

/// A generic client for a text and structured-output language model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Reports whether the model can serve requests right now.
    async fn availability(&self) -> Availability;

    /// Streams a free-text reply to `prompt`, given the session so far.
    async fn stream_response(
        &self,
        transcript: &Transcript,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, ServiceError>;

    /// Produces a JSON value conforming to the request's response schema.
    async fn respond(
        &self,
        transcript: &Transcript,
        request: &GenerationRequest,
        options: &GenerationOptions,
    ) -> Result<Value, ServiceError>;

    fn model_id(&self) -> &str;
}

/// An implementation of `LanguageModel` for any OpenAI-compatible API.
pub struct OpenAICompatibleModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleModel {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - Model identifier used for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn messages(
        transcript: &Transcript,
        prompt: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        for entry in transcript.entries() {
            let message: ChatCompletionRequestMessage = match entry.role {
                Role::Instructions => ChatCompletionRequestSystemMessageArgs::default()
                    .content(entry.content.clone())
                    .build()?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(entry.content.clone())
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(entry.content.clone())
                    .build()?
                    .into(),
            };
            messages.push(message);
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()?
                .into(),
        );
        Ok(messages)
    }

    fn request(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: &GenerationOptions,
        response_format: Option<ResponseFormat>,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages);
        if stream {
            args.stream(true);
        }
        if let Some(temperature) = options.temperature() {
            args.temperature(temperature as f32);
        }
        if let Some(format) = response_format {
            args.response_format(format);
        }
        args.build()
    }

    /// Sends `messages` as a plain completion and yields the reply as a
    /// single chunk.
    async fn complete_unstreamed(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: &GenerationOptions,
    ) -> Result<TextStream, ServiceError> {
        let request = self
            .request(messages, options, None, false)
            .map_err(classify)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify)?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter([Ok(content)])))
    }
}

/// Maps provider errors onto the service taxonomy. Context-length rejections
/// are reported by OpenAI-compatible APIs as `context_length_exceeded`.
fn classify(err: OpenAIError) -> ServiceError {
    match &err {
        OpenAIError::ApiError(api) => {
            let detail = format!("{api:?}");
            if detail.contains("context_length_exceeded")
                || api.message.contains("maximum context length")
            {
                ServiceError::ContextWindowExceeded
            } else {
                ServiceError::Request(api.message.clone())
            }
        }
        _ => ServiceError::Request(err.to_string()),
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatibleModel {
    async fn availability(&self) -> Availability {
        Availability::Available
    }

    async fn stream_response(
        &self,
        transcript: &Transcript,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, ServiceError> {
        let messages = Self::messages(transcript, prompt).map_err(classify)?;
        let request = self
            .request(messages.clone(), options, None, true)
            .map_err(classify)?;
        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(classify)?;

        // A rejected streaming request only yields the HTTP status line. The
        // error body comes back on a plain request.
        let first = stream.next().await;
        if let Some(Err(OpenAIError::StreamError(reason))) = &first {
            if reason.starts_with("Invalid status code") {
                tracing::debug!(%reason, "Streaming request rejected, replaying without streaming");
                return self.complete_unstreamed(messages, options).await;
            }
        }

        Ok(Box::pin(futures::stream::iter(first).chain(stream).filter_map(
            |result| async move {
                match result {
                    Ok(response) => response
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .filter(|content| !content.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(classify(e))),
                }
            },
        )))
    }

    async fn respond(
        &self,
        transcript: &Transcript,
        request: &GenerationRequest,
        options: &GenerationOptions,
    ) -> Result<Value, ServiceError> {
        let messages = Self::messages(transcript, &request.prompt()).map_err(classify)?;
        let format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: request.schema_name().to_string(),
                schema: Some(request.response_schema()),
                strict: Some(false),
            },
        };
        let chat_request = self
            .request(messages, options, Some(format), false)
            .map_err(classify)?;
        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify)?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or_else(|| ServiceError::Decode("no content in model response".to_string()))?;
        serde_json::from_str(content).map_err(|e| ServiceError::Decode(e.to_string()))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn log_outcome(model: &str, call: &str, started: Instant, error: Option<&ServiceError>) {
    let duration_ms = started.elapsed().as_millis() as u64;
    match error {
        None => tracing::info!(model, call, duration_ms, "Model call completed"),
        Some(ServiceError::ContextWindowExceeded) => {
            tracing::warn!(model, call, duration_ms, "Model context window exceeded")
        }
        Some(e) => {
            tracing::error!(model, call, duration_ms, error = %e, "Model call failed")
        }
    }
}

/// Tracks one streamed reply and logs its outcome once it is known: at the
/// first error, at the end of the stream, or when the caller drops it.
struct StreamLog {
    model: String,
    started: Instant,
    chunks: usize,
    logged: bool,
}

impl StreamLog {
    fn observe(&mut self, item: Option<&Result<String, ServiceError>>) {
        match item {
            Some(Ok(_)) => self.chunks += 1,
            Some(Err(e)) if !self.logged => {
                self.logged = true;
                log_outcome(&self.model, "stream_response", self.started, Some(e));
            }
            Some(Err(_)) => {}
            None if !self.logged => {
                self.logged = true;
                tracing::debug!(model = %self.model, chunks = self.chunks, "Model stream finished");
                log_outcome(&self.model, "stream_response", self.started, None);
            }
            None => {}
        }
    }
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        if !self.logged {
            let duration_ms = self.started.elapsed().as_millis() as u64;
            tracing::info!(
                model = %self.model,
                chunks = self.chunks,
                duration_ms,
                "Model stream dropped before completion"
            );
        }
    }
}

/// Logging wrapper for language models.
pub struct LoggingModel {
    inner: Arc<dyn LanguageModel>,
    model_id: String,
}

impl LoggingModel {
    pub fn new(inner: Arc<dyn LanguageModel>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LanguageModel for LoggingModel {
    async fn availability(&self) -> Availability {
        let availability = self.inner.availability().await;
        if let Some(reason) = availability.reason() {
            tracing::warn!(model = %self.model_id, %reason, "Model unavailable");
        }
        availability
    }

    async fn stream_response(
        &self,
        transcript: &Transcript,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, ServiceError> {
        let started = Instant::now();
        let stream = match self.inner.stream_response(transcript, prompt, options).await {
            Ok(stream) => stream,
            Err(e) => {
                log_outcome(&self.model_id, "stream_response", started, Some(&e));
                return Err(e);
            }
        };
        let log = StreamLog {
            model: self.model_id.clone(),
            started,
            chunks: 0,
            logged: false,
        };
        Ok(Box::pin(futures::stream::unfold(
            (stream, log),
            |(mut stream, mut log)| async move {
                let item = stream.next().await;
                log.observe(item.as_ref());
                item.map(|item| (item, (stream, log)))
            },
        )))
    }

    async fn respond(
        &self,
        transcript: &Transcript,
        request: &GenerationRequest,
        options: &GenerationOptions,
    ) -> Result<Value, ServiceError> {
        let started = Instant::now();
        let result = self.inner.respond(transcript, request, options).await;
        log_outcome(
            &self.model_id,
            request.schema_name(),
            started,
            result.as_ref().err(),
        );
        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::ModelSessionAdapter, error::GenerationError, SessionKind};
    use std::io::Write;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    #[test]
    fn test_options_temperature() {
        assert_eq!(GenerationOptions::default().temperature(), None);
        assert_eq!(GenerationOptions::greedy().temperature(), Some(0.0));
        assert_eq!(GenerationOptions::with_temperature(0.7).temperature(), Some(0.7));
        assert_eq!(GenerationOptions::with_temperature(9.0).temperature(), Some(2.0));
    }

    #[test]
    fn test_availability_reason() {
        assert!(Availability::Available.reason().is_none());
        let reason = Availability::Unavailable(UnavailableReason::ModelNotReady)
            .reason()
            .unwrap();
        assert!(reason.contains("tải xuống"));
        let other = Availability::Unavailable(UnavailableReason::Other("quota".into()));
        assert!(other.reason().unwrap().ends_with("quota"));
    }

    #[test]
    fn test_availability_serialization() {
        let json = serde_json::to_string(&Availability::Unavailable(
            UnavailableReason::DeviceNotEligible,
        ))
        .unwrap();
        assert_eq!(
            json,
            r#"{"status":"unavailable","reason":{"kind":"device_not_eligible"}}"#
        );
        assert_eq!(
            serde_json::to_string(&Availability::Available).unwrap(),
            r#"{"status":"available"}"#
        );
    }

    #[test]
    fn test_messages_follow_transcript_order() {
        let mut transcript = Transcript::with_instructions("be brief");
        transcript.push_exchange("hi", "hello");
        let messages = OpenAICompatibleModel::messages(&transcript, "again").unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::User(_)));
    }

    #[tokio::test]
    async fn test_logging_model_passes_errors_through() {
        let mut inner = MockLanguageModel::new();
        inner.expect_model_id().return_const("mock-model".to_string());
        inner
            .expect_respond()
            .returning(|_, _, _| Err(ServiceError::ContextWindowExceeded));
        let model = LoggingModel::new(Arc::new(inner));
        assert_eq!(model.model_id(), "mock-model");

        let request: GenerationRequest = crate::schema::WordSetRequest {
            topic: crate::topic::Topic::find("home").unwrap(),
        }
        .into();
        let result = model
            .respond(&Transcript::default(), &request, &GenerationOptions::default())
            .await;
        assert_eq!(result.unwrap_err(), ServiceError::ContextWindowExceeded);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_outcome_is_logged_when_the_stream_fails() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut inner = MockLanguageModel::new();
        inner.expect_model_id().return_const("mock-model".to_string());
        inner.expect_stream_response().returning(|_, _, _| {
            let chunks = vec![Ok("Xin".to_string()), Err(ServiceError::ContextWindowExceeded)];
            Ok(Box::pin(futures::stream::iter(chunks)) as TextStream)
        });
        let model = LoggingModel::new(Arc::new(inner));

        let Ok(mut stream) = model
            .stream_response(&Transcript::default(), "hi", &GenerationOptions::default())
            .await
        else {
            panic!("stream should open");
        };
        assert!(logs.text().is_empty());

        assert_eq!(stream.next().await, Some(Ok("Xin".to_string())));
        assert!(logs.text().is_empty());

        assert_eq!(stream.next().await, Some(Err(ServiceError::ContextWindowExceeded)));
        let text = logs.text();
        assert!(text.contains("Model context window exceeded"));
        assert!(!text.contains("Model call completed"));

        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(logs.text().matches("stream_response").count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_logged_once() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut inner = MockLanguageModel::new();
        inner.expect_model_id().return_const("mock-model".to_string());
        inner.expect_stream_response().returning(|_, _, _| {
            let chunks = vec![Ok("Xin".to_string()), Ok(" chào".to_string())];
            Ok(Box::pin(futures::stream::iter(chunks)) as TextStream)
        });
        let model = LoggingModel::new(Arc::new(inner));

        let Ok(mut stream) = model
            .stream_response(&Transcript::default(), "hi", &GenerationOptions::default())
            .await
        else {
            panic!("stream should open");
        };
        assert_eq!(stream.next().await, Some(Ok("Xin".to_string())));
        drop(stream);
        let text = logs.text();
        assert!(text.contains("Model stream dropped before completion"));
        assert!(!text.contains("Model call completed"));
    }

    /// Reads one HTTP request, body included.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    /// Starts a server that rejects every request the way OpenAI rejects an
    /// oversized prompt, and returns its API base URL.
    async fn serve_context_overflow() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    read_request(&mut socket).await;
                    let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens.","type":"invalid_request_error","param":null,"code":"context_length_exceeded"}}"#;
                    let response = format!(
                        "HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn test_streamed_context_overflow_is_classified() {
        let base = serve_context_overflow().await;
        let config = OpenAIConfig::new()
            .with_api_base(base)
            .with_api_key("test-key");
        let model = OpenAICompatibleModel::new(config, "gpt-4o".to_string());

        let Err(err) = model
            .stream_response(
                &Transcript::with_instructions("be brief"),
                "hi",
                &GenerationOptions::default(),
            )
            .await
        else {
            panic!("an oversized prompt must be rejected");
        };
        assert_eq!(err, ServiceError::ContextWindowExceeded);

        let adapter = ModelSessionAdapter::new(Arc::new(model));
        let err = adapter
            .stream_text(SessionKind::General, "hi", &GenerationOptions::default(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::ContextOverflow);
        assert_eq!(adapter.transcript(SessionKind::General).await.len(), 1);
    }
}
