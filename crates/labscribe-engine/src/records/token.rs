use serde_json::{Map, Value};

const TOKEN_KEYS: &[&str] = &["access_token", "token"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenGrant {
    pub token: String,
    pub expires_in: Option<u64>,
}

/// Pulls a bearer token out of an authentication reply. The authority has
/// been seen answering with a JSON object, with a JSON string holding
/// `key=value` pairs, and with bare `key=value` text.
pub(crate) fn extract_token(body: &str) -> Option<TokenGrant> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => from_object(&obj),
        Ok(Value::String(inner)) => from_pairs(&inner),
        Ok(_) => None,
        Err(_) => from_pairs(trimmed),
    }
}

fn from_object(obj: &Map<String, Value>) -> Option<TokenGrant> {
    let token = TOKEN_KEYS.iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })?;
    let expires_in = obj.get("expires_in").and_then(|value| match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    });
    Some(TokenGrant {
        token: token.to_string(),
        expires_in,
    })
}

fn from_pairs(text: &str) -> Option<TokenGrant> {
    let mut token = None;
    let mut expires_in = None;
    for pair in text.split(|ch: char| ch == '&' || ch == ';' || ch.is_whitespace()) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        if TOKEN_KEYS.contains(&key.as_str()) {
            // access_token wins over token when both appear.
            if token.is_none() || key == TOKEN_KEYS[0] {
                token = Some(value.to_string());
            }
        } else if key == "expires_in" {
            expires_in = value.parse().ok();
        }
    }
    token.map(|token| TokenGrant { token, expires_in })
}
