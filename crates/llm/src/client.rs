use crate::error::{LlmError, Result};
use crate::prompt;
use async_trait::async_trait;
use scanner_protocol::text::{estimate_tokens, strip_code_fences};
use scanner_protocol::IssueReport;
use serde_json::Value;
use std::time::Duration;

/// Total attempts at getting valid JSON out of one query. A reformat
/// request is part of the attempt it repairs, not an extra one.
pub const MAX_QUERY_RETRIES: usize = 3;

/// Bound on model-request / tool-execution round trips in one check.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// Fraction of the context limit at which the tool loop is told to
/// finalize and further tool calls stop being accepted.
const BUDGET_FINALIZE_FRACTION: f64 = 0.85;

/// JSON schema advertisement for one exploration tool.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Executes exploration tools on behalf of the model. Stateless per
/// call; the client owns wire serialization of calls and results.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;
    async fn execute(&self, name: &str, arguments: Value) -> Value;
}

/// The contract both backend variants satisfy.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Establish the connection, resolve the model, and validate the
    /// configured context limit against what the server reports.
    async fn connect(&self) -> Result<()>;

    /// The configured context limit in tokens.
    fn context_limit(&self) -> usize;

    /// Run one check query: send prompts, enforce JSON, drive the tool
    /// loop, and return the parsed issue report.
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tools: Option<&dyn ToolDispatcher>,
        max_tool_iterations: usize,
    ) -> Result<IssueReport>;

    /// Block until the backend accepts connections again, retrying at
    /// the given interval. Used after a mid-session transport failure.
    async fn wait_for_connection(&self, retry_interval: Duration) {
        log::info!("Waiting for {} connection...", self.backend_name());
        loop {
            match self.connect().await {
                Ok(()) => {
                    log::info!("{} connection restored", self.backend_name());
                    return;
                }
                Err(err) => {
                    log::warn!("Connection failed: {err}");
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}

/// Build the client matching the configured backend.
pub fn create_client(settings: &scanner_protocol::LlmSettings) -> Box<dyn LlmClient> {
    match settings.backend {
        scanner_protocol::BackendKind::OpenAiCompatible => {
            Box::new(crate::openai::OpenAiCompatClient::new(settings.clone()))
        }
        scanner_protocol::BackendKind::NativeChat => {
            Box::new(crate::native::NativeChatClient::new(settings.clone()))
        }
    }
}

/// One message in a chat conversation, backend-agnostic. Assistant
/// messages keep the backend-native representation so tool calls can be
/// echoed back verbatim on the next request.
#[derive(Debug, Clone)]
pub(crate) enum ChatMessage {
    System(String),
    User(String),
    Assistant { content: String, raw: Option<Value> },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

/// What one chat request produced.
#[derive(Debug, Clone)]
pub(crate) struct ChatTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Backend-native assistant message for conversation replay.
    pub raw_assistant: Option<Value>,
}

/// Which kind of exchange a chat request belongs to. Check requests
/// run at a low temperature; the reformat repair runs fully
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Check,
    Reformat,
}

impl RequestKind {
    pub(crate) fn temperature(self) -> f64 {
        match self {
            RequestKind::Check => 0.1,
            RequestKind::Reformat => 0.0,
        }
    }
}

/// The variant-specific half of a client: one request/response exchange.
#[async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;
    fn context_limit(&self) -> usize;
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        kind: RequestKind,
    ) -> Result<ChatTurn>;
}

/// The shared query loop: JSON enforcement with a reformat request,
/// bounded retries, the tool loop, and the dynamic token budget.
pub(crate) async fn run_query(
    backend: &dyn ChatBackend,
    system_prompt: &str,
    user_prompt: &str,
    dispatcher: Option<&dyn ToolDispatcher>,
    max_tool_iterations: usize,
) -> Result<IssueReport> {
    let budget_limit =
        (backend.context_limit() as f64 * BUDGET_FINALIZE_FRACTION).floor() as usize;
    let mut used_tokens = estimate_tokens(system_prompt) + estimate_tokens(user_prompt);

    let mut messages = vec![
        ChatMessage::System(system_prompt.to_string()),
        ChatMessage::User(user_prompt.to_string()),
    ];
    let schemas = dispatcher.map(|d| d.schemas());
    let mut tools_enabled = dispatcher.is_some();
    let mut finalize_sent = false;
    let mut attempts = 0usize;
    let mut iterations = 0usize;
    let mut last_raw = String::from("(no response received)");

    loop {
        let tools = if tools_enabled { schemas.as_deref() } else { None };
        let turn = backend.chat(&messages, tools, RequestKind::Check).await?;
        used_tokens += estimate_tokens(&turn.content);

        if tools_enabled && !turn.tool_calls.is_empty() {
            let dispatcher = dispatcher.expect("tool calls without dispatcher");
            iterations += 1;
            messages.push(ChatMessage::Assistant {
                content: turn.content,
                raw: turn.raw_assistant,
            });

            for call in turn.tool_calls {
                log::info!("Executing tool: {}", call.name);
                let result = dispatcher.execute(&call.name, call.arguments).await;
                let content = result.to_string();
                used_tokens += estimate_tokens(&content);
                messages.push(ChatMessage::ToolResult {
                    call_id: call.id,
                    name: call.name,
                    content,
                });
            }

            if iterations >= max_tool_iterations || used_tokens >= budget_limit {
                if used_tokens >= budget_limit {
                    log::warn!(
                        "Tool loop reached {used_tokens} of {budget_limit} budget tokens; finalizing"
                    );
                }
                tools_enabled = false;
                if !finalize_sent {
                    messages.push(ChatMessage::User(prompt::FINALIZE_INSTRUCTION.to_string()));
                    finalize_sent = true;
                }
            }
            continue;
        }

        let content = strip_code_fences(&turn.content);
        if content.is_empty() {
            attempts += 1;
            log::warn!(
                "Empty response from {} (attempt {attempts}/{MAX_QUERY_RETRIES})",
                backend.backend_name()
            );
            if attempts >= MAX_QUERY_RETRIES {
                return Err(LlmError::Protocol {
                    backend: backend.backend_name(),
                    message: "empty response after all retries".to_string(),
                });
            }
            continue;
        }

        match serde_json::from_str::<IssueReport>(&content) {
            Ok(report) => return Ok(report),
            Err(parse_err) => {
                last_raw = content.clone();
                attempts += 1;
                log::info!(
                    "Non-JSON response (attempt {attempts}/{MAX_QUERY_RETRIES}), requesting reformat: {parse_err}"
                );

                if let Some(report) = reformat(backend, &content).await {
                    log::info!("Model reformatted response to valid JSON");
                    return Ok(report);
                }

                if attempts >= MAX_QUERY_RETRIES {
                    let preview: String = last_raw.chars().take(1000).collect();
                    return Err(LlmError::Protocol {
                        backend: backend.backend_name(),
                        message: format!(
                            "failed to get valid JSON after {MAX_QUERY_RETRIES} attempts.\n\
                             --- Last raw response ---\n{preview}\n--- End raw response ---"
                        ),
                    });
                }
            }
        }
    }
}

/// Ask the model to reformat its previous message as strict JSON. A
/// transport failure here propagates; anything else is treated as a
/// failed repair and falls back to the retry loop.
async fn reformat(backend: &dyn ChatBackend, malformed: &str) -> Option<IssueReport> {
    let messages = vec![
        ChatMessage::System(prompt::REFORMAT_SYSTEM_PROMPT.to_string()),
        ChatMessage::User(prompt::build_reformat_prompt(malformed)),
    ];

    match backend.chat(&messages, None, RequestKind::Reformat).await {
        Ok(turn) => {
            let content = strip_code_fences(&turn.content);
            serde_json::from_str::<IssueReport>(&content).ok()
        }
        Err(err) if err.is_transport() => None,
        Err(err) => {
            log::debug!("Reformat attempt failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend scripted with canned turns, recording what it was sent.
    struct ScriptedBackend {
        turns: Mutex<Vec<ChatTurn>>,
        requests: Mutex<Vec<(usize, bool, RequestKind)>>,
        context_limit: usize,
    }

    impl ScriptedBackend {
        fn new(turns: Vec<ChatTurn>) -> Self {
            Self {
                turns: Mutex::new(turns),
                requests: Mutex::new(Vec::new()),
                context_limit: 100_000,
            }
        }

        fn text(content: &str) -> ChatTurn {
            ChatTurn {
                content: content.to_string(),
                tool_calls: Vec::new(),
                raw_assistant: None,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        fn context_limit(&self) -> usize {
            self.context_limit
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: Option<&[ToolSchema]>,
            kind: RequestKind,
        ) -> Result<ChatTurn> {
            self.requests
                .lock()
                .unwrap()
                .push((messages.len(), tools.is_some(), kind));
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(LlmError::Protocol {
                    backend: "scripted",
                    message: "script exhausted".to_string(),
                });
            }
            Ok(turns.remove(0))
        }
    }

    struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        fn schemas(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "read_file".to_string(),
                description: "read".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]
        }

        async fn execute(&self, name: &str, arguments: Value) -> Value {
            serde_json::json!({"tool": name, "args": arguments})
        }
    }

    #[tokio::test]
    async fn clean_json_parses_first_try() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
            r#"{"issues":[{"file":"a.rs","line_number":3,"description":"d","suggested_fix":"f"}]}"#,
        )]);
        let report = run_query(&backend, "sys", "user", None, MAX_TOOL_ITERATIONS)
            .await
            .unwrap();
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn fenced_json_is_stripped() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
            "```json\n{\"issues\":[]}\n```",
        )]);
        let report = run_query(&backend, "sys", "user", None, MAX_TOOL_ITERATIONS)
            .await
            .unwrap();
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn malformed_then_reformat_counts_as_one_retry() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::text("Here is the result: no issues found!"),
            ScriptedBackend::text(r#"{"issues":[]}"#),
        ]);
        let report = run_query(&backend, "sys", "user", None, MAX_TOOL_ITERATIONS)
            .await
            .unwrap();
        assert!(report.issues.is_empty());
        // Original request plus one reformat exchange, the latter
        // running fully deterministic.
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].2, RequestKind::Check);
        assert_eq!(requests[1].2, RequestKind::Reformat);
        assert_eq!(requests[1].2.temperature(), 0.0);
    }

    #[tokio::test]
    async fn persistent_garbage_exhausts_retries() {
        let turns: Vec<ChatTurn> = (0..6)
            .map(|_| ScriptedBackend::text("still not json"))
            .collect();
        let backend = ScriptedBackend::new(turns);
        let err = run_query(&backend, "sys", "user", None, MAX_TOOL_ITERATIONS)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Protocol { .. }));
    }

    #[tokio::test]
    async fn tool_loop_executes_and_returns_final_result() {
        let backend = ScriptedBackend::new(vec![
            ChatTurn {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "read_file".to_string(),
                    arguments: serde_json::json!({"file_path": "src/a.rs"}),
                }],
                raw_assistant: None,
            },
            ScriptedBackend::text(r#"{"issues":[]}"#),
        ]);
        let dispatcher = EchoDispatcher;
        let report = run_query(
            &backend,
            "sys",
            "user",
            Some(&dispatcher),
            MAX_TOOL_ITERATIONS,
        )
        .await
        .unwrap();
        assert!(report.issues.is_empty());

        let requests = backend.requests.lock().unwrap();
        // Second request carries the tool-result message.
        assert_eq!(requests[0].0, 2);
        assert_eq!(requests[1].0, 4);
    }

    #[tokio::test]
    async fn tool_iteration_bound_forces_finalize() {
        let tool_turn = || ChatTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c".to_string(),
                name: "read_file".to_string(),
                arguments: serde_json::json!({}),
            }],
            raw_assistant: None,
        };
        let mut turns: Vec<ChatTurn> = (0..2).map(|_| tool_turn()).collect();
        turns.push(ScriptedBackend::text(r#"{"issues":[]}"#));
        let backend = ScriptedBackend::new(turns);

        let dispatcher = EchoDispatcher;
        let report = run_query(&backend, "sys", "user", Some(&dispatcher), 2)
            .await
            .unwrap();
        assert!(report.issues.is_empty());

        let requests = backend.requests.lock().unwrap();
        // Tools offered on the first two requests, withdrawn after the
        // iteration bound is hit.
        assert!(requests[0].1);
        assert!(requests[1].1);
        assert!(!requests[2].1);
    }

    #[tokio::test]
    async fn transport_error_propagates_immediately() {
        struct DeadBackend;

        #[async_trait]
        impl ChatBackend for DeadBackend {
            fn backend_name(&self) -> &'static str {
                "dead"
            }
            fn context_limit(&self) -> usize {
                1000
            }
            async fn chat(
                &self,
                _: &[ChatMessage],
                _: Option<&[ToolSchema]>,
                _: RequestKind,
            ) -> Result<ChatTurn> {
                Err(LlmError::Transport {
                    backend: "dead",
                    message: "connection refused".to_string(),
                })
            }
        }

        let err = run_query(&DeadBackend, "sys", "user", None, MAX_TOOL_ITERATIONS)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
