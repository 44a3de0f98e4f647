use anyhow::{bail, Context};
use labscribe_contracts::fence::{extract_json_blocks, BlockPolicy, JsonBlock};
use labscribe_contracts::tools::{ToolOutcome, ToolRegistry};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{ConversionError, TransportError};
use crate::truncate_text;

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 4;

/// One chat-completions exchange: request body in, response body out.
pub trait ChatBackend {
    fn complete(&self, request: &Value) -> Result<Value, ConversionError>;
}

impl<T: ChatBackend + ?Sized> ChatBackend for &T {
    fn complete(&self, request: &Value) -> Result<Value, ConversionError> {
        (**self).complete(request)
    }
}

pub struct OpenAiChatBackend {
    endpoint: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiChatBackend {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("OPENAI_API_KEY is not set");
        };
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build model service HTTP client")?;
        Ok(Self {
            endpoint: config.chat_endpoint(),
            api_key,
            http,
        })
    }
}

impl ChatBackend for OpenAiChatBackend {
    fn complete(&self, request: &Value) -> Result<Value, ConversionError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .map_err(TransportError::from)?;
        let status = response.status();
        let body = response.text().map_err(TransportError::from)?;
        if !status.is_success() {
            return Err(ConversionError::Service {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        serde_json::from_str(&body).map_err(|err| {
            ConversionError::InvalidResponse(format!(
                "{err}: {}",
                truncate_text(&body, 200)
            ))
        })
    }
}

/// Text of an assistant message, whether `content` is a string or a list of parts.
pub fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ToolCall {
    /// Absent for the legacy `function_call` shape.
    id: Option<String>,
    name: String,
    arguments: String,
}

fn tool_calls(message: &Value) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    if let Some(rows) = message.get("tool_calls").and_then(Value::as_array) {
        for row in rows {
            let Some(function) = row.get("function") else {
                continue;
            };
            let Some(name) = function.get("name").and_then(Value::as_str) else {
                continue;
            };
            calls.push(ToolCall {
                id: row.get("id").and_then(Value::as_str).map(str::to_string),
                name: name.to_string(),
                arguments: arguments_text(function.get("arguments")),
            });
        }
    }
    if calls.is_empty() {
        if let Some(function) = message.get("function_call") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                calls.push(ToolCall {
                    id: None,
                    name: name.to_string(),
                    arguments: arguments_text(function.get("arguments")),
                });
            }
        }
    }
    calls
}

fn arguments_text(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub rounds: u32,
    pub tool_outcomes: Vec<ToolOutcome>,
}

/// Conversation with function calling over a fixed tool registry.
pub struct ChatSession<'a, B: ?Sized> {
    backend: &'a B,
    tools: &'a ToolRegistry,
    model: String,
    max_rounds: u32,
    messages: Vec<Value>,
}

impl<'a, B: ChatBackend + ?Sized> ChatSession<'a, B> {
    pub fn new(backend: &'a B, tools: &'a ToolRegistry, model: impl Into<String>) -> Self {
        Self {
            backend,
            tools,
            model: model.into(),
            max_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            messages: Vec::new(),
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn push(&mut self, role: &str, content: impl Into<String>) {
        self.messages
            .push(json!({"role": role, "content": content.into()}));
    }

    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    /// Sends the history, answering tool calls until the model replies with text.
    pub fn send(&mut self) -> Result<ChatReply, ConversionError> {
        let mut tool_outcomes = Vec::new();
        for round in 1..=self.max_rounds {
            let response = self.backend.complete(&self.request())?;
            let message = response
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
                .and_then(|choice| choice.get("message"))
                .filter(|message| message.is_object())
                .cloned()
                .ok_or_else(|| {
                    ConversionError::InvalidResponse(
                        "response has no choices[0].message".to_string(),
                    )
                })?;

            let calls = tool_calls(&message);
            if calls.is_empty() {
                let text = message_text(&message);
                self.push("assistant", text.clone());
                info!(round, tools = tool_outcomes.len(), "chat reply received");
                return Ok(ChatReply {
                    text,
                    rounds: round,
                    tool_outcomes,
                });
            }

            self.messages.push(assistant_turn(&message));
            for call in calls {
                let outcome = self.tools.dispatch(&call.name, &call.arguments);
                debug!(round, tool = %call.name, ok = outcome.ok, "tool dispatched");
                let reply = match &call.id {
                    Some(id) => json!({
                        "role": "tool",
                        "tool_call_id": id,
                        "content": outcome.content_text(),
                    }),
                    None => json!({
                        "role": "function",
                        "name": call.name,
                        "content": outcome.content_text(),
                    }),
                };
                self.messages.push(reply);
                tool_outcomes.push(outcome);
            }
        }
        Err(ConversionError::InvalidResponse(format!(
            "model was still calling tools after {} rounds",
            self.max_rounds
        )))
    }

    fn request(&self) -> Value {
        let mut request = Map::new();
        request.insert("model".to_string(), Value::String(self.model.clone()));
        request.insert("messages".to_string(), Value::Array(self.messages.clone()));
        if !self.tools.is_empty() {
            request.insert("tools".to_string(), Value::Array(self.tools.definitions()));
        }
        Value::Object(request)
    }
}

/// The assistant message as it goes back into history: role, content and
/// whichever call shape the model used.
fn assistant_turn(message: &Value) -> Value {
    let mut turn = Map::new();
    turn.insert("role".to_string(), Value::String("assistant".to_string()));
    turn.insert(
        "content".to_string(),
        message.get("content").cloned().unwrap_or(Value::Null),
    );
    for key in ["tool_calls", "function_call"] {
        if let Some(value) = message.get(key).filter(|value| !value.is_null()) {
            turn.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(turn)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub reply: ChatReply,
    pub blocks: Vec<JsonBlock>,
}

/// Asks the model whether `payload` is valid HL7 FHIR with the validator
/// available as a tool, and collects any corrected payloads from the answer.
pub fn review_payload<B: ChatBackend + ?Sized>(
    backend: &B,
    tools: &ToolRegistry,
    model: &str,
    payload: &str,
    policy: BlockPolicy,
) -> Result<ReviewOutcome, ConversionError> {
    let mut session = ChatSession::new(backend, tools, model);
    session.push(
        "user",
        "Convert this laboratory report to HL7 FHIR laboratory format. \
         Separate JSON for the HL7 FHIR DiagnosticReport and each Observation.",
    );
    session.push("assistant", payload.trim());
    session.push(
        "user",
        "Is the JSON provided valid HL7 FHIR JSON? Check it with the validation tool. \
         If it is not valid, reply with a corrected version in a ```json fenced block.",
    );
    let reply = session.send()?;
    let blocks = extract_json_blocks(&reply.text, policy)
        .into_iter()
        .filter(|block| block.value().map(Value::is_object).unwrap_or(true))
        .collect();
    Ok(ReviewOutcome { reply, blocks })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use labscribe_contracts::fence::BlockPolicy;
    use labscribe_contracts::tools::ToolRegistry;
    use serde_json::{json, Value};

    use super::{message_text, review_payload, ChatBackend, ChatSession};
    use crate::error::ConversionError;

    #[derive(Default)]
    struct ScriptedBackend {
        replies: RefCell<VecDeque<Value>>,
        requests: RefCell<Vec<Value>>,
    }

    impl ScriptedBackend {
        fn then(self, message: Value) -> Self {
            self.replies
                .borrow_mut()
                .push_back(json!({"choices": [{"message": message}]}));
            self
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn complete(&self, request: &Value) -> Result<Value, ConversionError> {
            self.requests.borrow_mut().push(request.clone());
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| ConversionError::InvalidResponse("script exhausted".to_string()))
        }
    }

    fn validate_call(id: &str, payload: &Value) -> Value {
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": id,
                "type": "function",
                "function": {
                    "name": "validate_hl7_fhir_json",
                    "arguments": json!({"fhir_json": payload.to_string()}).to_string(),
                }
            }]
        })
    }

    #[test]
    fn plain_reply_needs_one_round() -> anyhow::Result<()> {
        let backend = ScriptedBackend::default().then(json!({"role": "assistant", "content": "Yes."}));
        let tools = ToolRegistry::with_validator();
        let mut session = ChatSession::new(&backend, &tools, "gpt-4o-mini");
        session.push("user", "Hello");
        let reply = session.send()?;
        assert_eq!(reply.text, "Yes.");
        assert_eq!(reply.rounds, 1);
        assert_eq!(session.messages().len(), 2);

        let request = &backend.requests.borrow()[0];
        assert_eq!(request["tools"][0]["function"]["name"], json!("validate_hl7_fhir_json"));
        Ok(())
    }

    #[test]
    fn tool_calls_append_assistant_and_tool_messages() -> anyhow::Result<()> {
        let backend = ScriptedBackend::default()
            .then(validate_call("call_1", &json!({"resourceType": "Observation"})))
            .then(json!({"role": "assistant", "content": "The Observation is missing status and code."}));
        let tools = ToolRegistry::with_validator();
        let mut session = ChatSession::new(&backend, &tools, "gpt-4o-mini");
        session.push("user", "Is this valid?");
        let reply = session.send()?;

        assert_eq!(reply.rounds, 2);
        assert_eq!(reply.tool_outcomes.len(), 1);
        assert_eq!(reply.tool_outcomes[0].content["valid"], json!(false));

        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["role"], json!("assistant"));
        assert_eq!(messages[1]["tool_calls"][0]["id"], json!("call_1"));
        assert_eq!(messages[2]["role"], json!("tool"));
        assert_eq!(messages[2]["tool_call_id"], json!("call_1"));
        let content: Value = serde_json::from_str(messages[2]["content"].as_str().unwrap_or("{}"))?;
        assert_eq!(content["resource_type"], json!("Observation"));
        assert_eq!(messages[3]["content"], json!("The Observation is missing status and code."));

        // The follow-up request carried the tool result.
        let second = &backend.requests.borrow()[1];
        assert_eq!(second["messages"].as_array().map(Vec::len), Some(3));
        Ok(())
    }

    #[test]
    fn legacy_function_call_replies_with_function_role() -> anyhow::Result<()> {
        let backend = ScriptedBackend::default()
            .then(json!({
                "role": "assistant",
                "content": null,
                "function_call": {"name": "validate_hl7_fhir_json", "arguments": "{\"fhir_json\": \"{}\"}"}
            }))
            .then(json!({"role": "assistant", "content": "Missing resourceType."}));
        let tools = ToolRegistry::with_validator();
        let mut session = ChatSession::new(&backend, &tools, "gpt-4o-mini");
        session.push("user", "Check {}");
        session.send()?;
        let messages = session.messages();
        assert_eq!(messages[1]["function_call"]["name"], json!("validate_hl7_fhir_json"));
        assert_eq!(messages[2]["role"], json!("function"));
        assert_eq!(messages[2]["name"], json!("validate_hl7_fhir_json"));
        assert!(messages[2]["content"]
            .as_str()
            .unwrap_or_default()
            .contains("'resourceType' key is missing"));
        Ok(())
    }

    #[test]
    fn unknown_tool_reaches_the_model_as_an_error() -> anyhow::Result<()> {
        let backend = ScriptedBackend::default()
            .then(json!({
                "role": "assistant",
                "tool_calls": [{"id": "c9", "function": {"name": "rm_rf", "arguments": "{}"}}]
            }))
            .then(json!({"role": "assistant", "content": "Sorry."}));
        let tools = ToolRegistry::with_validator();
        let mut session = ChatSession::new(&backend, &tools, "gpt-4o-mini");
        session.push("user", "go");
        let reply = session.send()?;
        assert!(!reply.tool_outcomes[0].ok);
        assert!(session.messages()[2]["content"]
            .as_str()
            .unwrap_or_default()
            .contains("No local tool named 'rm_rf'"));
        Ok(())
    }

    #[test]
    fn endless_tool_calls_hit_the_round_limit() {
        let call = validate_call("c", &json!({}));
        let backend = ScriptedBackend::default()
            .then(call.clone())
            .then(call.clone())
            .then(call);
        let tools = ToolRegistry::with_validator();
        let mut session = ChatSession::new(&backend, &tools, "gpt-4o-mini").with_max_rounds(2);
        session.push("user", "loop");
        assert!(matches!(session.send(), Err(ConversionError::InvalidResponse(_))));
        assert_eq!(backend.requests.borrow().len(), 2);
    }

    #[test]
    fn review_collects_corrected_blocks() -> anyhow::Result<()> {
        let payload = json!({"resourceType": "DiagnosticReport", "category": {"text": "LAB"}});
        let backend = ScriptedBackend::default()
            .then(validate_call("call_1", &payload))
            .then(json!({
                "role": "assistant",
                "content": "Not valid; category must be a list.\n```json\n{\"resourceType\": \"DiagnosticReport\", \"status\": \"final\", \"code\": {\"text\": \"CBC\"}, \"category\": [{\"text\": \"LAB\"}]}\n```"
            }));
        let tools = ToolRegistry::with_validator();
        let outcome = review_payload(
            &backend,
            &tools,
            "gpt-4o-mini",
            &payload.to_string(),
            BlockPolicy::tolerant(),
        )?;
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(
            outcome.blocks[0].value().map(|value| value["category"].is_array()),
            Some(true)
        );

        let first = &backend.requests.borrow()[0];
        assert_eq!(first["messages"][1]["role"], json!("assistant"));
        assert_eq!(
            first["messages"][2]["content"]
                .as_str()
                .map(|text| text.starts_with("Is the JSON provided valid HL7 FHIR JSON?")),
            Some(true)
        );
        Ok(())
    }

    #[test]
    fn content_parts_are_joined() {
        let message = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(message_text(&message), "a\nb");
        assert_eq!(message_text(&json!({"content": null})), "");
    }
}
