use crate::client::{
    ChatBackend, ChatMessage, ChatTurn, LlmClient, RequestKind, ToolCall, ToolDispatcher,
    ToolSchema,
};
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use scanner_protocol::{IssueReport, LlmSettings};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};

const BACKEND_NAME: &str = "native-chat";

/// Client for native-chat servers (Ollama and compatible) via
/// `/api/tags`, `/api/show` and `/api/chat`.
pub struct NativeChatClient {
    settings: LlmSettings,
    http: reqwest::Client,
    supports_json_format: AtomicBool,
}

impl NativeChatClient {
    pub fn new(settings: LlmSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .expect("build HTTP client");
        Self {
            settings,
            http,
            supports_json_format: AtomicBool::new(true),
        }
    }

    fn model(&self) -> &str {
        // Config validation guarantees the model for this backend.
        self.settings.model.as_deref().unwrap_or_default()
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
             1. The server is running\n\
             2. Host and port match the server settings\n\
             3. The model is pulled and available\n\n\
             Error: {err}\n{line}",
            self.settings.host,
            self.settings.port,
            self.settings.base_url(),
            self.model(),
            self.settings.timeout.as_secs(),
        )
    }

    async fn fetch_server_context_limit(&self) -> Option<usize> {
        let url = format!("{}/api/show", self.settings.base_url());
        let response = self
            .http
            .post(&url)
            .json(&json!({"name": self.model()}))
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;

        for section in ["modelinfo", "details"] {
            if let Some(table) = body.get(section).and_then(Value::as_object) {
                for (key, value) in table {
                    let matches = ["num_ctx", "context_length", "n_ctx"]
                        .iter()
                        .any(|f| key == f || key.ends_with(&format!(".{f}")));
                    if matches {
                        if let Some(limit) = value.as_u64() {
                            return Some(limit as usize);
                        }
                    }
                }
            }
        }

        // Older servers report `num_ctx 4096` inside a parameters blob.
        let parameters = body.get("parameters").and_then(Value::as_str)?;
        for line in parameters.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("num_ctx") {
                if let Some(limit) = fields.next().and_then(|v| v.parse::<usize>().ok()) {
                    return Some(limit);
                }
            }
        }
        None
    }
}

#[async_trait]
impl LlmClient for NativeChatClient {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.settings.base_url());
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
            .map_err(|e| LlmError::Startup(format!("Invalid /api/tags response: {e}")))?;

        let available: Vec<String> = body
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if available.is_empty() {
            return Err(LlmError::Startup(
                "No models available on the server".to_string(),
            ));
        }

        let wanted = self.model();
        if !available.iter().any(|name| model_name_matches(name, wanted)) {
            return Err(LlmError::Startup(format!(
                "Model '{wanted}' not found on the server.\n\
                 Available models: {available:?}\n\
                 Pull the model first, e.g.: ollama pull {wanted}"
            )));
        }
        log::info!("Using model: {wanted}");

        // This backend reports the loaded window authoritatively, so a
        // configured limit above it is a hard startup failure.
        match self.fetch_server_context_limit().await {
            Some(server_limit) if self.settings.context_limit > server_limit => {
                let line = "=".repeat(70);
                return Err(LlmError::Startup(format!(
                    "\n{line}\nCONTEXT LIMIT ERROR\n{line}\n\n\
                     Configuration specifies context_limit = {} tokens,\n\
                     but model '{wanted}' only supports {server_limit} tokens.\n\n\
                     Either reduce context_limit to {server_limit} or less, or use a model\n\
                     with a larger context window.\n{line}",
                    self.settings.context_limit,
                )));
            }
            Some(server_limit) if self.settings.context_limit < server_limit => {
                log::warn!(
                    "Configured context_limit ({}) is below the model window ({server_limit}); using the configured value",
                    self.settings.context_limit
                );
            }
            Some(_) => {}
            None => log::warn!("Could not determine the model's context window from the server"),
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
impl ChatBackend for NativeChatClient {
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
        let url = format!("{}/api/chat", self.settings.base_url());

        loop {
            let mut body = json!({
                "model": self.model(),
                "messages": wire_messages(messages),
                "stream": false,
                "options": {
                    "temperature": kind.temperature(),
                    "num_ctx": self.settings.context_limit,
                },
            });
            if tools.is_none() && self.supports_json_format.load(Ordering::Relaxed) {
                body["format"] = Value::String("json".to_string());
            }
            if let Some(schemas) = tools {
                body["tools"] = Value::Array(schemas.iter().map(wire_tool).collect());
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
                if crate::openai::looks_like_context_overflow(&text) {
                    return Err(LlmError::ContextOverflow(format!(
                        "Request exceeds the model's context window (configured {} tokens): {}",
                        self.settings.context_limit,
                        text.chars().take(300).collect::<String>(),
                    )));
                }
                if text.to_lowercase().contains("format")
                    && self.supports_json_format.swap(false, Ordering::Relaxed)
                {
                    log::info!("Server rejected format=json; falling back to prompt-based JSON");
                    continue;
                }
                return Err(LlmError::Protocol {
                    backend: BACKEND_NAME,
                    message: format!("HTTP {status}: {}", text.chars().take(500).collect::<String>()),
                });
            }

            let parsed: Value = serde_json::from_str(&text).map_err(|e| LlmError::Protocol {
                backend: BACKEND_NAME,
                message: format!("invalid chat response JSON: {e}"),
            })?;
            let message = parsed.get("message").ok_or_else(|| LlmError::Protocol {
                backend: BACKEND_NAME,
                message: "chat response missing 'message'".to_string(),
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
            ChatMessage::ToolResult { content, .. } => {
                json!({"role": "tool", "content": content})
            }
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

/// Native model names may carry a tag (`qwen3:4b`); accept a match in
/// either direction on the tag boundary.
fn model_name_matches(available: &str, wanted: &str) -> bool {
    available == wanted
        || available.starts_with(&format!("{wanted}:"))
        || wanted.starts_with(&format!("{available}:"))
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
            // This wire has no call ids; synthesize stable ones.
            let arguments = function
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            Some(ToolCall {
                id: format!("call_{idx}"),
                name,
                arguments,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_matching_is_tag_tolerant() {
        assert!(model_name_matches("qwen3:4b", "qwen3:4b"));
        assert!(model_name_matches("qwen3:4b", "qwen3"));
        assert!(model_name_matches("qwen3", "qwen3:4b"));
        assert!(!model_name_matches("llama3", "qwen3"));
    }

    #[test]
    fn tool_calls_arrive_as_objects() {
        let raw = json!([{
            "function": {"name": "search_text", "arguments": {"patterns": "foo"}},
        }]);
        let calls = parse_tool_calls(Some(&raw));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search_text");
        assert_eq!(calls[0].arguments["patterns"], "foo");
        assert_eq!(calls[0].id, "call_0");
    }

    #[test]
    fn tool_result_messages_use_tool_role() {
        let messages = vec![ChatMessage::ToolResult {
            call_id: "call_0".to_string(),
            name: "ls".to_string(),
            content: "{}".to_string(),
        }];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "tool");
    }
}
