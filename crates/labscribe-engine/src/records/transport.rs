use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            json_body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// One HTTP exchange with the record authority. A reply with a non-success
/// status is still `Ok`; only failures below HTTP are errors.
pub trait RecordTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError>;
}

pub struct HttpRecordTransport {
    http: HttpClient,
}

impl HttpRecordTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl RecordTransport for HttpRecordTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Post => self.http.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        let response = builder.send()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes()?.to_vec();
        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{HttpMethod, HttpReply, HttpRequest};

    #[test]
    fn request_builder_collects_headers() {
        let request = HttpRequest::post("https://records.example/auth")
            .header("client-id", "abc")
            .json(json!({"k": "v"}));
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.header_value("CLIENT-ID"), Some("abc"));
        assert_eq!(request.json_body, Some(json!({"k": "v"})));
    }

    #[test]
    fn reply_helpers() {
        let reply = HttpReply {
            status: 204,
            content_type: None,
            body: br#"{"id": "q"}"#.to_vec(),
        };
        assert!(reply.is_success());
        assert_eq!(reply.json(), Some(json!({"id": "q"})));
        let failed = HttpReply { status: 401, ..reply };
        assert!(!failed.is_success());
    }
}
