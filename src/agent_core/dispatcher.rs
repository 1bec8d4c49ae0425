//! Tool Dispatcher: decides whether model output is a tool call, runs it,
//! and shapes the result (or failure) into text for a `tool` message.
//!
//! Parsing happens once, at the boundary, into [`ModelOutput`]. Anything that
//! is not exactly a `{"tool_name": "...", "arguments": {...}}` object is a
//! plain reply; malformed near-misses are not errors.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use super::tokens::cap_with_marker;
use crate::tools::{call_with_timeout, ToolError, ToolRegistry};

/// Ceiling on a tool result fed back to the model, in characters.
pub const MAX_TOOL_RESULT_CHARS: usize = 4000;

const TRUNCATION_MARKER: &str = "... (truncated)";

// ─── Types ──────────────────────────────────────────────────────────────────

/// A parsed request to run a tool. Never persisted in this form.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// What the model said, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    PlainReply(String),
    ToolCall(ToolInvocation),
}

impl ModelOutput {
    /// Classify raw model text.
    ///
    /// Accepts surrounding whitespace and a single ```` ```json ```` fence.
    /// `arguments` may be omitted (treated as `{}`) but if present must be an
    /// object.
    pub fn parse(text: &str) -> Self {
        match parse_invocation(text) {
            Some(invocation) => ModelOutput::ToolCall(invocation),
            None => ModelOutput::PlainReply(text.to_string()),
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, ModelOutput::ToolCall(_))
    }
}

fn parse_invocation(text: &str) -> Option<ToolInvocation> {
    let body = strip_code_fence(text.trim());
    if !body.starts_with('{') {
        return None;
    }

    let value: Value = serde_json::from_str(body).ok()?;
    let mut object = match value {
        Value::Object(map) => map,
        _ => return None,
    };

    let tool_name = match object.remove("tool_name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(_) => {
            tracing::warn!("json output has a non-string or empty tool_name; treating as reply");
            return None;
        }
        None => return None,
    };

    let arguments = match object.remove("arguments") {
        None => Map::new(),
        Some(Value::Object(args)) => args,
        Some(other) => {
            tracing::warn!(
                tool = %tool_name,
                arguments = %other,
                "tool call arguments are not an object; treating as reply"
            );
            return None;
        }
    };

    Some(ToolInvocation {
        tool_name,
        arguments,
    })
}

/// Strip one surrounding markdown code fence (with optional language tag).
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string line, e.g. `json`.
    match inner.find('\n') {
        Some(idx) if !inner[..idx].contains('{') => inner[idx + 1..].trim(),
        _ => inner.trim(),
    }
}

/// How a dispatched call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Succeeded,
    NotFound,
    Failed,
}

/// A handled tool call. `result` holds the tool output or a descriptive
/// error, and is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub tool_name: String,
    pub result: String,
    pub outcome: ToolOutcome,
}

/// Result of [`ToolDispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Not a tool call; the output is an ordinary reply.
    NotToolCall,
    Executed(ToolExecution),
}

impl Dispatch {
    /// `(tool_name, result)`, both `None` for a plain reply.
    pub fn into_parts(self) -> (Option<String>, Option<String>) {
        match self {
            Dispatch::NotToolCall => (None, None),
            Dispatch::Executed(exec) => (Some(exec.tool_name), Some(exec.result)),
        }
    }
}

// ─── ToolDispatcher ─────────────────────────────────────────────────────────

/// Runs parsed tool calls against a read-only registry.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Parse `model_output` and, if it is a tool call, execute it once.
    pub async fn dispatch(&self, model_output: &str) -> Dispatch {
        match ModelOutput::parse(model_output) {
            ModelOutput::PlainReply(_) => Dispatch::NotToolCall,
            ModelOutput::ToolCall(invocation) => {
                Dispatch::Executed(self.execute(&invocation).await)
            }
        }
    }

    /// Execute one invocation. Tool failures come back as text, never as
    /// an `Err`.
    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolExecution {
        let name = invocation.tool_name.as_str();

        let Some(tool) = self.registry.get(name) else {
            tracing::warn!(tool = %name, "model requested unknown tool");
            return ToolExecution {
                tool_name: name.to_string(),
                result: format!("Error: The tool '{name}' is not available."),
                outcome: ToolOutcome::NotFound,
            };
        };

        tracing::info!(tool = %name, arguments = ?invocation.arguments, "executing tool");
        let start = Instant::now();
        let result = call_with_timeout(tool, invocation.arguments.clone()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (text, outcome) = match result {
            Ok(output) => {
                let chars = output.chars().count();
                if chars > MAX_TOOL_RESULT_CHARS {
                    tracing::warn!(
                        tool = %name,
                        chars,
                        limit = MAX_TOOL_RESULT_CHARS,
                        "tool output truncated"
                    );
                }
                let capped = cap_with_marker(&output, MAX_TOOL_RESULT_CHARS, TRUNCATION_MARKER);
                let text = if capped.is_empty() {
                    format!("Tool '{name}' returned no output.")
                } else {
                    capped
                };
                tracing::info!(tool = %name, elapsed_ms, "tool executed successfully");
                (text, ToolOutcome::Succeeded)
            }
            Err(e) => {
                tracing::error!(tool = %name, elapsed_ms, error = %e, "tool execution failed");
                let text = match &e {
                    ToolError::InvalidArguments { .. } => format!(
                        "Error: Invalid arguments provided for tool '{name}'. \
                         Required arguments might be missing or incorrect. Details: {e}"
                    ),
                    ToolError::ExecutionFailed { .. } | ToolError::Timeout { .. } => {
                        format!("Error: Failed to execute tool '{name}'. Reason: {e}")
                    }
                };
                (
                    cap_with_marker(&text, MAX_TOOL_RESULT_CHARS, TRUNCATION_MARKER),
                    ToolOutcome::Failed,
                )
            }
        };

        ToolExecution {
            tool_name: name.to_string(),
            result: text,
            outcome,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::DateTimeTool;
    use crate::tools::tests::{EchoTool, PanickingTool, SlowTool};
    use crate::tools::{Tool, ToolParam};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed {
                reason: "disk on fire".into(),
            })
        }
    }

    struct BigTool;

    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "Returns a lot."
        }
        async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
            Ok("x".repeat(10_000))
        }
    }

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "count"
        }
        fn description(&self) -> &str {
            "Counts calls."
        }
        fn parameters(&self) -> &[ToolParam] {
            &[]
        }
        async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("call {n}"))
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut builder = ToolRegistry::builder();
        builder.register(DateTimeTool).unwrap();
        builder.register(EchoTool).unwrap();
        builder.register(FailingTool).unwrap();
        builder.register(SlowTool).unwrap();
        builder.register(BigTool).unwrap();
        builder.register(PanickingTool).unwrap();
        ToolDispatcher::new(Arc::new(builder.build()))
    }

    #[test]
    fn test_parse_plain_text() {
        let out = ModelOutput::parse("The weather is nice today.");
        assert_eq!(
            out,
            ModelOutput::PlainReply("The weather is nice today.".into())
        );
    }

    #[test]
    fn test_parse_tool_call() {
        let out = ModelOutput::parse(r#"  {"tool_name":"echo","arguments":{"text":"hi"}} "#);
        let ModelOutput::ToolCall(inv) = out else {
            panic!("expected tool call");
        };
        assert_eq!(inv.tool_name, "echo");
        assert_eq!(inv.arguments["text"], "hi");
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let text = "```json\n{\"tool_name\": \"get_current_datetime\", \"arguments\": {}}\n```";
        assert!(ModelOutput::parse(text).is_tool_call());
        let bare = "```\n{\"tool_name\": \"x\"}\n```";
        assert!(ModelOutput::parse(bare).is_tool_call());
    }

    #[test]
    fn test_parse_missing_arguments_defaults_to_empty() {
        let ModelOutput::ToolCall(inv) = ModelOutput::parse(r#"{"tool_name":"get_current_datetime"}"#)
        else {
            panic!("expected tool call");
        };
        assert!(inv.arguments.is_empty());
    }

    #[test]
    fn test_parse_wrong_shapes_are_plain() {
        for text in [
            r#"{"tool_name": 5, "arguments": {}}"#,
            r#"{"tool_name": "echo", "arguments": "text"}"#,
            r#"{"tool_name": "echo", "arguments": null}"#,
            r#"{"name": "echo"}"#,
            r#"["tool_name"]"#,
            r#"Sure! {"tool_name": "echo", "arguments": {}}"#,
            r#"{"tool_name": "echo", "arguments": {"#,
            "",
        ] {
            assert!(
                !ModelOutput::parse(text).is_tool_call(),
                "should be plain: {text}"
            );
        }
    }

    #[tokio::test]
    async fn test_dispatch_plain_text_is_none_none() {
        let d = dispatcher().dispatch("The weather is nice today.").await;
        assert_eq!(d.into_parts(), (None, None));
    }

    #[tokio::test]
    async fn test_dispatch_datetime() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"get_current_datetime","arguments":{}}"#)
            .await;
        let (name, result) = d.into_parts();
        assert_eq!(name.as_deref(), Some("get_current_datetime"));
        assert!(result.unwrap().starts_with("The current date and time is: "));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"nonexistent_tool","arguments":{}}"#)
            .await;
        assert_eq!(
            d,
            Dispatch::Executed(ToolExecution {
                tool_name: "nonexistent_tool".into(),
                result: "Error: The tool 'nonexistent_tool' is not available.".into(),
                outcome: ToolOutcome::NotFound,
            })
        );
    }

    #[tokio::test]
    async fn test_dispatch_invalid_arguments() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"echo","arguments":{"wrong":"x"}}"#)
            .await;
        let Dispatch::Executed(ToolExecution {
            result, outcome, ..
        }) = d
        else {
            panic!("expected executed");
        };
        assert_eq!(outcome, ToolOutcome::Failed);
        assert!(result.starts_with("Error: Invalid arguments provided for tool 'echo'."));
        assert!(result.contains("missing required argument 'text'"));
    }

    #[tokio::test]
    async fn test_dispatch_tool_failure_is_text() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"broken","arguments":{}}"#)
            .await;
        let (_, result) = d.into_parts();
        assert_eq!(
            result.unwrap(),
            "Error: Failed to execute tool 'broken'. Reason: disk on fire"
        );
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_text() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"slow","arguments":{}}"#)
            .await;
        let Dispatch::Executed(ToolExecution {
            result, outcome, ..
        }) = d
        else {
            panic!("expected executed");
        };
        assert_eq!(outcome, ToolOutcome::Failed);
        assert!(result.starts_with("Error: Failed to execute tool 'slow'. Reason: timed out"));
    }

    #[tokio::test]
    async fn test_dispatch_panicking_tool_is_text() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"panicky","arguments":{}}"#)
            .await;
        let Dispatch::Executed(ToolExecution {
            result, outcome, ..
        }) = d
        else {
            panic!("expected executed");
        };
        assert_eq!(outcome, ToolOutcome::Failed);
        assert_eq!(
            result,
            "Error: Failed to execute tool 'panicky'. Reason: the tool panicked"
        );
    }

    #[tokio::test]
    async fn test_dispatch_truncates_long_output() {
        let d = dispatcher()
            .dispatch(r#"{"tool_name":"big","arguments":{}}"#)
            .await;
        let (_, result) = d.into_parts();
        let result = result.unwrap();
        assert_eq!(
            result.chars().count(),
            MAX_TOOL_RESULT_CHARS + TRUNCATION_MARKER.chars().count()
        );
        assert!(result.ends_with("... (truncated)"));
    }

    #[tokio::test]
    async fn test_dispatch_invokes_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ToolRegistry::builder();
        builder.register(CountingTool(Arc::clone(&calls))).unwrap();
        let dispatcher = ToolDispatcher::new(Arc::new(builder.build()));

        let (_, result) = dispatcher
            .dispatch(r#"{"tool_name":"count","arguments":{}}"#)
            .await
            .into_parts();
        assert_eq!(result.as_deref(), Some("call 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
