use crate::client::{
    ChatBackend, ChatMessage, ChatTurn, LlmClient, RequestKind, ToolCall, ToolDispatcher,
    ToolSchema,
};
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use scanner_protocol::{IssueReport, LlmSettings};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const BACKEND_NAME: &str = "openai-compatible";

/// Client for OpenAI-compatible servers (LM Studio and friends) via
/// `/v1/models` and `/v1/chat/completions`.
pub struct OpenAiCompatClient {
    settings: LlmSettings,
    http: reqwest::Client,
    model_id: Mutex<Option<String>>,
    // Assume the server accepts response_format; fall back on rejection.
    supports_json_format: AtomicBool,
}

impl OpenAiCompatClient {
    pub fn new(settings: LlmSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .expect("build HTTP client");
        Self {
            settings,
            http,
            model_id: Mutex::new(None),
            supports_json_format: AtomicBool::new(true),
        }
    }

    fn model_id(&self) -> Result<String> {
        self.model_id
            .lock()
            .expect("model_id poisoned")
            .clone()
            .ok_or(LlmError::Protocol {
                backend: BACKEND_NAME,
                message: "not connected".to_string(),
            })
    }

    fn connection_banner(&self, err: &str) -> String {
        let line = "=".repeat(70);
        format!(
            "\n{line}\nCONNECTION ERROR: {BACKEND_NAME}\n{line}\n\n\
             Could not connect to the LLM server.\n\n\
             Connection parameters:\n\
             \x20 Backend:  {BACKEND_NAME}\n\
             \x20 Host:     {}\n\
             \x20 Port:     {}\n\
             \x20 URL:      {}\n\
             \x20 Model:    {}\n\
             \x20 Timeout:  {}s\n\n\
             Please ensure:\n\
             1. The server is running with a model loaded\n\
             2. The local API server is enabled\n\
             3. Host and port match the server settings\n\n\
             Error: {err}\n{line}",
            self.settings.host,
            self.settings.port,
            self.settings.base_url(),
            self.settings.model.as_deref().unwrap_or("(default)"),
            self.settings.timeout.as_secs(),
        )
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("{}/models", self.settings.base_url());
        log::info!("Connecting to {BACKEND_NAME} backend at {}", self.settings.base_url());

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| LlmError::Startup(self.connection_banner(&e.to_string())))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Startup(format!("Invalid /models response: {e}")))?;

        let models: Vec<&Value> = body
            .get("data")
            .and_then(Value::as_array)
            .map(|a| a.iter().collect())
            .unwrap_or_default();
        if models.is_empty() {
            return Err(LlmError::Startup(
                "No models available on the server".to_string(),
            ));
        }

        let entry = match &self.settings.model {
            Some(wanted) => models
                .iter()
                .find(|m| m.get("id").and_then(Value::as_str) == Some(wanted.as_str()))
                .copied()
                .ok_or_else(|| {
                    let available: Vec<&str> = models
                        .iter()
                        .filter_map(|m| m.get("id").and_then(Value::as_str))
                        .collect();
                    LlmError::Startup(format!(
                        "Model '{wanted}' not found. Available: {available:?}"
                    ))
                })?,
            None => models[0],
        };

        let model_id = entry
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        log::info!("Using model: {model_id}");
        *self.model_id.lock().expect("model_id poisoned") = Some(model_id);

        // The /v1/models limit is advisory on these servers; a real
        // mismatch still surfaces as a context-overflow error at request
        // time. Warn either way.
        if let Some(server_limit) = extract_context_limit(entry) {
            if self.settings.context_limit > server_limit {
                log::warn!(
                    "Configured context_limit ({}) exceeds the server-reported window ({server_limit})",
                    self.settings.context_limit
                );
            } else if self.settings.context_limit < server_limit {
                log::warn!(
                    "Configured context_limit ({}) is below the server-reported window ({server_limit}); using the configured value",
                    self.settings.context_limit
                );
            }
        }
        log::info!("Using configured context limit: {} tokens", self.settings.context_limit);

        Ok(())
    }

    fn context_limit(&self) -> usize {
        self.settings.context_limit
    }

    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tools: Option<&dyn ToolDispatcher>,
        max_tool_iterations: usize,
    ) -> Result<IssueReport> {
        crate::client::run_query(self, system_prompt, user_prompt, tools, max_tool_iterations).await
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context_limit(&self) -> usize {
        self.settings.context_limit
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        kind: RequestKind,
    ) -> Result<ChatTurn> {
        let url = format!("{}/chat/completions", self.settings.base_url());
        let model = self.model_id()?;

        loop {
            let mut body = json!({
                "model": model,
                "messages": wire_messages(messages),
                "temperature": kind.temperature(),
                "reasoning_effort": "high",
            });
            if self.supports_json_format.load(Ordering::Relaxed) {
                body["response_format"] = json!({"type": "json_object"});
            }
            if let Some(schemas) = tools {
                body["tools"] = Value::Array(schemas.iter().map(wire_tool).collect());
                body["tool_choice"] = Value::String("auto".to_string());
            }

            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::from_reqwest(BACKEND_NAME, e))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LlmError::from_reqwest(BACKEND_NAME, e))?;

            if !status.is_success() {
                if looks_like_context_overflow(&text) {
                    return Err(LlmError::ContextOverflow(overflow_banner(
                        self.settings.context_limit,
                        &text,
                    )));
                }
                if is_response_format_rejection(&text)
                    && self.supports_json_format.swap(false, Ordering::Relaxed)
                {
                    log::info!(
                        "Server rejected response_format=json_object; falling back to prompt-based JSON"
                    );
                    continue;
                }
                return Err(LlmError::Protocol {
                    backend: BACKEND_NAME,
                    message: format!("HTTP {status}: {}", clip(&text, 500)),
                });
            }

            let parsed: Value = serde_json::from_str(&text).map_err(|e| LlmError::Protocol {
                backend: BACKEND_NAME,
                message: format!("invalid completion JSON: {e}"),
            })?;
            let message = parsed
                .pointer("/choices/0/message")
                .ok_or_else(|| LlmError::Protocol {
                    backend: BACKEND_NAME,
                    message: "completion missing choices[0].message".to_string(),
                })?;

            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let tool_calls = parse_tool_calls(message.get("tool_calls"));

            return Ok(ChatTurn {
                content,
                tool_calls,
                raw_assistant: Some(message.clone()),
            });
        }
    }
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m {
            ChatMessage::System(content) => json!({"role": "system", "content": content}),
            ChatMessage::User(content) => json!({"role": "user", "content": content}),
            ChatMessage::Assistant { content, raw } => raw
                .clone()
                .unwrap_or_else(|| json!({"role": "assistant", "content": content})),
            ChatMessage::ToolResult {
                call_id, content, ..
            } => json!({"role": "tool", "tool_call_id": call_id, "content": content}),
        })
        .collect()
}

fn wire_tool(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters,
        },
    })
}

fn parse_tool_calls(raw: Option<&Value>) -> Vec<ToolCall> {
    let Some(calls) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };

    calls
        .iter()
        .enumerate()
        .filter_map(|(idx, call)| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{idx}"));
            // Arguments arrive as a JSON-encoded string on this wire.
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or(Value::String(s.clone()))
                }
                Some(other) => other.clone(),
                None => Value::Object(Default::default()),
            };
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

fn extract_context_limit(entry: &Value) -> Option<usize> {
    for key in ["context_length", "max_context_length", "n_ctx", "max_tokens"] {
        if let Some(limit) = entry.get(key).and_then(Value::as_u64) {
            return Some(limit as usize);
        }
    }
    entry
        .get("metadata")
        .and_then(|m| m.get("context_length"))
        .and_then(Value::as_u64)
        .map(|l| l as usize)
}

pub(crate) fn looks_like_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context")
        && (lower.contains("overflow")
            || lower.contains("context length")
            || lower.contains("maximum context"))
}

fn is_response_format_rejection(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("response_format") || lower.contains("json_object")
}

fn overflow_banner(configured: usize, body: &str) -> String {
    let line = "=".repeat(70);
    format!(
        "\n{line}\nCONTEXT LENGTH MISMATCH ERROR\n{line}\n\n\
         The server rejected a request that exceeds the loaded model's context\n\
         window, while the scanner is configured for {configured} tokens.\n\n\
         To fix this, do ONE of the following:\n\
         1. Increase the model's context length on the server and reload it\n\
         2. Load a model with a larger context window\n\
         3. Reduce context_limit in config.toml\n\n\
         Server response: {}\n{line}",
        clip(body, 300),
    )
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_arguments_decode_from_string() {
        let raw = json!([{
            "id": "call_abc",
            "function": {"name": "read_file", "arguments": "{\"file_path\":\"src/a.rs\"}"},
        }]);
        let calls = parse_tool_calls(Some(&raw));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["file_path"], "src/a.rs");
    }

    #[test]
    fn missing_tool_call_id_is_synthesized() {
        let raw = json!([{ "function": {"name": "ls", "arguments": "{}"} }]);
        let calls = parse_tool_calls(Some(&raw));
        assert_eq!(calls[0].id, "call_0");
    }

    #[test]
    fn context_overflow_detection() {
        assert!(looks_like_context_overflow(
            "model is loaded with context length of only 4096 tokens"
        ));
        assert!(looks_like_context_overflow("context overflow detected"));
        assert!(!looks_like_context_overflow("some other 400 error"));
    }

    #[test]
    fn server_context_limit_extraction() {
        assert_eq!(
            extract_context_limit(&json!({"id": "m", "context_length": 8192})),
            Some(8192)
        );
        assert_eq!(
            extract_context_limit(&json!({"id": "m", "metadata": {"context_length": 4096}})),
            Some(4096)
        );
        assert_eq!(extract_context_limit(&json!({"id": "m"})), None);
    }

    #[test]
    fn tool_result_messages_carry_call_id() {
        let messages = vec![ChatMessage::ToolResult {
            call_id: "call_9".to_string(),
            name: "read_file".to_string(),
            content: "{}".to_string(),
        }];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_9");
    }
}
