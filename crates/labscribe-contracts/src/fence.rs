use serde_json::Value;

const FENCE: &str = "```";

/// What to do with a fenced block whose body is not valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPolicy {
    /// Drop unparseable blocks silently instead of surfacing them.
    pub tolerate_malformed_blocks: bool,
}

impl BlockPolicy {
    pub fn tolerant() -> Self {
        Self {
            tolerate_malformed_blocks: true,
        }
    }

    pub fn strict() -> Self {
        Self {
            tolerate_malformed_blocks: false,
        }
    }
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self::tolerant()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonBlock {
    pub source: String,
    pub parsed: Result<Value, String>,
}

impl JsonBlock {
    pub fn parsed(source: impl Into<String>, value: Value) -> Self {
        Self {
            source: source.into(),
            parsed: Ok(value),
        }
    }

    pub fn malformed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parsed: Err(error.into()),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.parsed.as_ref().ok()
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.parsed.as_ref().err().map(String::as_str)
    }
}

/// Extracts every fenced JSON block from a model reply.
///
/// Fences tagged `json` or untagged are considered; other languages are
/// skipped. A reply with no fences at all is tried as a single document.
/// Top-level arrays fan out into one block per element.
pub fn extract_json_blocks(text: &str, policy: BlockPolicy) -> Vec<JsonBlock> {
    let sections = fenced_sections(text);
    if sections.is_empty() {
        let trimmed = text.trim();
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => expand_document(trimmed, value, policy),
            Err(_) => Vec::new(),
        };
    }

    let mut blocks = Vec::new();
    for section in sections {
        match serde_json::from_str::<Value>(&section) {
            Ok(value) => blocks.extend(expand_document(&section, value, policy)),
            Err(err) if !policy.tolerate_malformed_blocks => {
                blocks.push(JsonBlock::malformed(section, err.to_string()));
            }
            Err(_) => {}
        }
    }
    blocks
}

fn fenced_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut offset = 0;
    while let Some(found) = text[offset..].find(FENCE) {
        let open = offset + found;
        let after_open = open + FENCE.len();
        // Only a fence that starts its line opens a block; inline mentions are prose.
        if !starts_line(text, open) {
            offset = after_open;
            continue;
        }
        let Some(close) = text[after_open..].find(FENCE) else {
            break;
        };
        let inner = &text[after_open..after_open + close];
        offset = after_open + close + FENCE.len();

        let (tag, body) = split_language_tag(inner);
        if !(tag.is_empty() || tag.eq_ignore_ascii_case("json")) {
            continue;
        }
        let body = body.trim();
        if !body.is_empty() {
            sections.push(body.to_string());
        }
    }
    sections
}

fn starts_line(text: &str, index: usize) -> bool {
    text[..index]
        .rsplit('\n')
        .next()
        .is_some_and(|prefix| prefix.trim().is_empty())
}

fn split_language_tag(inner: &str) -> (&str, &str) {
    let (first, remainder) = match inner.split_once('\n') {
        Some(parts) => parts,
        None => {
            let trimmed = inner.trim_start();
            let rest = trimmed
                .get(..4)
                .filter(|tag| tag.eq_ignore_ascii_case("json"))
                .and_then(|_| trimmed.get(4..))
                .filter(|rest| {
                    !rest.is_empty() && !rest.starts_with(|ch: char| ch.is_ascii_alphanumeric())
                });
            return match rest {
                Some(rest) => ("json", rest),
                None => ("", inner),
            };
        }
    };
    let tag = first.trim();
    if tag.is_empty() {
        return ("", remainder);
    }
    if tag
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return (tag, remainder);
    }
    ("", inner)
}

fn expand_document(source: &str, value: Value, policy: BlockPolicy) -> Vec<JsonBlock> {
    let Value::Array(items) = value else {
        return vec![JsonBlock::parsed(source, value)];
    };
    let mut blocks = Vec::new();
    for item in items {
        match item {
            Value::String(embedded) => match serde_json::from_str::<Value>(&embedded) {
                Ok(inner) => blocks.push(JsonBlock::parsed(embedded.trim(), inner)),
                Err(err) if !policy.tolerate_malformed_blocks => {
                    blocks.push(JsonBlock::malformed(embedded, err.to_string()));
                }
                Err(_) => {}
            },
            other => {
                let source = serde_json::to_string_pretty(&other).unwrap_or_default();
                blocks.push(JsonBlock::parsed(source, other));
            }
        }
    }
    blocks
}
