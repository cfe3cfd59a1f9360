//! Language model gateway.
//!
//! A gateway turns an ordered prompt into a single-pass stream of text
//! fragments. [`classify_reply`] then decides whether that stream is prose
//! to forward, or a complete structured tool proposal to pause on.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;

use dealchat_core::types::{Role, ToolProposal};

use crate::tools::{ToolExecutor, ToolSpec};

/// Lazy sequence of reply fragments from the model.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// Errors from a model provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("model request failed: {0}")]
    RequestFailed(String),
    #[error("model provider rate limited the request")]
    RateLimited,
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("model returned an empty reply")]
    EmptyReply,
}

/// One prior message in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptTurn {
    pub role: Role,
    pub content: String,
}

/// Everything a gateway needs to produce a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub turns: Vec<PromptTurn>,
    pub tools: Vec<ToolSpec>,
}

impl ModelRequest {
    /// System instruction with the tool catalog appended, for providers that
    /// receive tools as plain text.
    pub fn system_with_tools(&self) -> String {
        if self.tools.is_empty() {
            return self.system.clone();
        }
        let mut out = self.system.clone();
        out.push_str("\n\nAvailable tools:");
        for tool in &self.tools {
            out.push_str(&format!(
                "\n- {}: {}\n  input schema: {}",
                tool.name, tool.description, tool.input_schema
            ));
        }
        out
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Start a streamed reply. Errors here mean nothing was produced.
    async fn stream(&self, request: &ModelRequest) -> Result<TokenStream, GatewayError>;
}

/// A classified model reply: exactly one of prose or proposal.
pub enum ModelReply {
    Text(TokenStream),
    Proposal(ToolProposal),
}

impl std::fmt::Debug for ModelReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelReply::Text(_) => f.write_str("Text(..)"),
            ModelReply::Proposal(p) => f.debug_tuple("Proposal").field(p).finish(),
        }
    }
}

/// Decide whether a reply is prose or a tool proposal.
///
/// Leading whitespace is held back until the first visible character. If
/// that character is not `{` the reply is prose and streams on immediately.
/// Otherwise the whole reply is buffered and accepted as a proposal only if
/// it is exactly `{"toolName", "input"}` naming a known tool with valid
/// input; anything else is returned as a single prose fragment.
pub async fn classify_reply(
    mut stream: TokenStream,
    tools: &dyn ToolExecutor,
) -> Result<ModelReply, GatewayError> {
    let mut head = String::new();
    loop {
        match stream.next().await {
            None => return Err(GatewayError::EmptyReply),
            Some(Err(e)) => return Err(e),
            Some(Ok(chunk)) => {
                head.push_str(&chunk);
                let visible = head.trim_start();
                match visible.chars().next() {
                    None => continue,
                    Some('{') => break,
                    Some(_) => {
                        let first = visible.to_string();
                        let replay = stream::once(async move { Ok(first) });
                        return Ok(ModelReply::Text(Box::pin(replay.chain(stream))));
                    }
                }
            }
        }
    }

    let mut full = head.trim_start().to_string();
    while let Some(item) = stream.next().await {
        full.push_str(&item?);
    }

    match parse_proposal(&full, tools) {
        Some(proposal) => Ok(ModelReply::Proposal(proposal)),
        None => Ok(ModelReply::Text(Box::pin(stream::iter(vec![Ok(full)])))),
    }
}

fn parse_proposal(text: &str, tools: &dyn ToolExecutor) -> Option<ToolProposal> {
    let proposal: ToolProposal = serde_json::from_str(text.trim_end()).ok()?;
    if !tools.knows(&proposal.tool_name) {
        return None;
    }
    tools
        .validate(&proposal.tool_name, &proposal.input)
        .ok()?;
    Some(proposal)
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these items in order.
    Reply(Vec<Result<String, GatewayError>>),
    /// Fail before streaming anything.
    Fail(GatewayError),
}

/// Offline gateway replaying queued scripts, then echoing the user.
///
/// Records every request it receives so tests can inspect the prompt.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply made of these fragments.
    pub fn push_reply(&self, fragments: &[&str]) {
        self.push(Script::Reply(
            fragments.iter().map(|f| Ok(f.to_string())).collect(),
        ));
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn echo(request: &ModelRequest) -> Vec<Result<String, GatewayError>> {
        let reply = match request.last_user_message() {
            Some(content) if !content.trim().is_empty() => format!("You said: {}", content.trim()),
            _ => "Hello! Ask me anything.".to_string(),
        };
        reply
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn stream(&self, request: &ModelRequest) -> Result<TokenStream, GatewayError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front());

        let items = match next {
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Reply(items)) => items,
            None => Self::echo(request),
        };
        Ok(Box::pin(stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::tools::{ToolInput, ToolOutput};

    /// Knows one tool, "search", whose input must only contain `q`.
    struct OneTool;

    #[async_trait]
    impl ToolExecutor for OneTool {
        fn catalog(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "search".to_string(),
                description: "find things".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }]
        }

        fn knows(&self, name: &str) -> bool {
            name == "search"
        }

        fn validate(&self, _name: &str, input: &ToolInput) -> Result<(), ChatError> {
            if input.keys().all(|k| k == "q") {
                Ok(())
            } else {
                Err(ChatError::InvalidToolInput("only q".to_string()))
            }
        }

        async fn execute(&self, _name: &str, _input: &ToolInput) -> Result<ToolOutput, ChatError> {
            Ok(ToolOutput(vec![]))
        }
    }

    fn scripted(items: Vec<Result<&str, GatewayError>>) -> TokenStream {
        Box::pin(stream::iter(
            items
                .into_iter()
                .map(|i| i.map(str::to_string))
                .collect::<Vec<_>>(),
        ))
    }

    async fn collect_text(reply: ModelReply) -> Vec<String> {
        match reply {
            ModelReply::Text(s) => s.map(|r| r.unwrap()).collect().await,
            ModelReply::Proposal(p) => panic!("expected text, got {:?}", p),
        }
    }

    #[tokio::test]
    async fn test_prose_streams_fragments_in_order() {
        let reply = classify_reply(scripted(vec![Ok("Hel"), Ok("lo "), Ok("there")]), &OneTool)
            .await
            .unwrap();
        assert_eq!(collect_text(reply).await, vec!["Hel", "lo ", "there"]);
    }

    #[tokio::test]
    async fn test_leading_whitespace_is_held_then_dropped() {
        let reply = classify_reply(scripted(vec![Ok("\n "), Ok("  Hi"), Ok("!")]), &OneTool)
            .await
            .unwrap();
        assert_eq!(collect_text(reply).await, vec!["Hi", "!"]);
    }

    #[tokio::test]
    async fn test_exact_proposal_is_detected() {
        let reply = classify_reply(
            scripted(vec![Ok(" {\"toolName\": \"search\", "), Ok("\"input\": {\"q\": \"x\"}}\n")]),
            &OneTool,
        )
        .await
        .unwrap();
        match reply {
            ModelReply::Proposal(p) => {
                assert_eq!(p.tool_name, "search");
                assert_eq!(p.input["q"], "x");
            }
            other => panic!("expected proposal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_falls_back_to_prose() {
        let text = r#"{"toolName":"launch","input":{}}"#;
        let reply = classify_reply(scripted(vec![Ok(text)]), &OneTool).await.unwrap();
        assert_eq!(collect_text(reply).await, vec![text]);
    }

    #[tokio::test]
    async fn test_invalid_input_falls_back_to_prose() {
        let text = r#"{"toolName":"search","input":{"nope":1}}"#;
        let reply = classify_reply(scripted(vec![Ok(text)]), &OneTool).await.unwrap();
        assert!(matches!(reply, ModelReply::Text(_)));
    }

    #[tokio::test]
    async fn test_trailing_prose_falls_back_to_prose() {
        let text = r#"{"toolName":"search","input":{}} and that's the query"#;
        let reply = classify_reply(scripted(vec![Ok(text)]), &OneTool).await.unwrap();
        assert_eq!(collect_text(reply).await, vec![text]);
    }

    #[tokio::test]
    async fn test_extra_keys_fall_back_to_prose() {
        let text = r#"{"toolName":"search","input":{},"why":"because"}"#;
        let reply = classify_reply(scripted(vec![Ok(text)]), &OneTool).await.unwrap();
        assert!(matches!(reply, ModelReply::Text(_)));
    }

    #[tokio::test]
    async fn test_empty_and_blank_replies_are_errors() {
        let err = classify_reply(scripted(vec![]), &OneTool).await.unwrap_err();
        assert_eq!(err, GatewayError::EmptyReply);
        let err = classify_reply(scripted(vec![Ok("  "), Ok("\n")]), &OneTool)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::EmptyReply);
    }

    #[tokio::test]
    async fn test_error_before_decision_propagates() {
        let err = classify_reply(
            scripted(vec![Ok(" "), Err(GatewayError::RequestFailed("reset".to_string()))]),
            &OneTool,
        )
        .await
        .unwrap_err();
        assert_eq!(err, GatewayError::RequestFailed("reset".to_string()));
    }

    #[tokio::test]
    async fn test_error_after_prose_starts_reaches_consumer() {
        let reply = classify_reply(
            scripted(vec![Ok("Part"), Err(GatewayError::RequestFailed("cut".to_string()))]),
            &OneTool,
        )
        .await
        .unwrap();
        let ModelReply::Text(stream) = reply else {
            panic!("expected text");
        };
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items[0], Ok("Part".to_string()));
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_scripted_gateway_replays_then_echoes() {
        let gateway = ScriptedGateway::new();
        gateway.push_reply(&["one", "two"]);
        gateway.push(Script::Fail(GatewayError::RateLimited));

        let request = ModelRequest {
            system: "sys".to_string(),
            turns: vec![PromptTurn {
                role: Role::User,
                content: "ping pong".to_string(),
            }],
            tools: vec![],
        };

        let first: Vec<_> = gateway.stream(&request).await.unwrap().collect().await;
        assert_eq!(first, vec![Ok("one".to_string()), Ok("two".to_string())]);

        assert!(matches!(
            gateway.stream(&request).await,
            Err(GatewayError::RateLimited)
        ));

        let echo: Vec<String> = gateway
            .stream(&request)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(echo.concat(), "You said: ping pong");
        assert_eq!(gateway.requests().len(), 3);
    }

    #[test]
    fn test_system_with_tools_lists_catalog() {
        let request = ModelRequest {
            system: "Be brief.".to_string(),
            turns: vec![],
            tools: OneTool.catalog(),
        };
        let system = request.system_with_tools();
        assert!(system.starts_with("Be brief."));
        assert!(system.contains("- search: find things"));

        let bare = ModelRequest {
            tools: vec![],
            ..request
        };
        assert_eq!(bare.system_with_tools(), "Be brief.");
    }
}
