mod validate;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::text::truncate_text;

pub use validate::ValidateResourceTool;

/// A local capability the model may invoke by name.
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    fn invoke(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub name: String,
    pub content: Value,
    pub ok: bool,
}

impl ToolOutcome {
    /// Text form appended to the conversation as the tool's reply.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Fixed, insertion-ordered registry of local tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Box<dyn LocalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the resource validator.
    pub fn with_validator() -> Self {
        let mut registry = Self::new();
        registry.register(ValidateResourceTool);
        registry
    }

    pub fn register<T: LocalTool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn LocalTool> {
        self.tools.get(name).map(|tool| tool.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The `tools` array for a chat-completions request.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Runs the named tool with JSON-encoded arguments. Failures come back as
    /// an error outcome for the model to read.
    pub fn dispatch(&self, name: &str, arguments_json: &str) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return error_outcome(
                name,
                format!(
                    "No local tool named '{name}'. Available: {}",
                    self.names().join(", ")
                ),
            );
        };
        let arguments = match parse_arguments(arguments_json) {
            Ok(arguments) => arguments,
            Err(message) => return error_outcome(name, message),
        };
        match tool.invoke(&arguments) {
            Ok(content) => ToolOutcome {
                name: name.to_string(),
                content,
                ok: true,
            },
            Err(err) => error_outcome(name, format!("{err:#}")),
        }
    }
}

fn parse_arguments(arguments_json: &str) -> Result<Map<String, Value>, String> {
    let trimmed = arguments_json.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(arguments)) => Ok(arguments),
        Ok(other) => Err(format!(
            "Tool arguments must be a JSON object, got: {}",
            truncate_text(&other.to_string(), 120)
        )),
        Err(err) => Err(format!("Tool arguments are not valid JSON: {err}")),
    }
}

fn error_outcome(name: &str, message: String) -> ToolOutcome {
    ToolOutcome {
        name: name.to_string(),
        content: json!({ "error": message }),
        ok: false,
    }
}
