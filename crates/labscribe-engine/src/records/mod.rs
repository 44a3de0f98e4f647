mod token;
mod transport;

use std::time::Duration;

use labscribe_contracts::records::{Artifact, Credential, Query, QueryStatus, SubjectFields};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use transport::{HttpMethod, HttpRecordTransport, HttpReply, HttpRequest, RecordTransport};

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::RecordClientConfig;
use crate::error::RecordError;
use crate::truncate_text;

/// Granularity at which a poll sleep re-checks its cancellation token.
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Shortest gap between two status polls; smaller intervals are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client for the external record authority.
///
/// Holds at most one credential, acquired lazily and reused until the
/// authority-reported lifetime runs out.
pub struct RecordClient<T = HttpRecordTransport, C = SystemClock> {
    config: RecordClientConfig,
    transport: T,
    clock: C,
    credential: Option<Credential>,
}

impl RecordClient {
    pub fn from_config(config: RecordClientConfig) -> Result<Self, RecordError> {
        let transport = HttpRecordTransport::new(config.request_timeout).map_err(|source| {
            RecordError::Transport {
                operation: "client setup",
                source,
            }
        })?;
        Ok(Self::new(config, transport, SystemClock))
    }
}

impl<T: RecordTransport, C: Clock> RecordClient<T, C> {
    pub fn new(config: RecordClientConfig, transport: T, clock: C) -> Self {
        Self {
            config,
            transport,
            clock,
            credential: None,
        }
    }

    pub fn config(&self) -> &RecordClientConfig {
        &self.config
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn authenticate(&mut self) -> Result<Credential, RecordError> {
        if let Some(credential) = &self.credential {
            if !credential.is_expired_at(self.clock.utc_now()) {
                return Ok(credential.clone());
            }
            debug!("record credential expired; re-authenticating");
        }

        let request = HttpRequest::post(self.config.endpoint("auth"))
            .header("client-id", self.config.client_id.clone())
            .header("client-secret", self.config.client_secret.clone());
        let reply = self.send("authenticate", &request)?;
        if !reply.is_success() {
            return Err(RecordError::Auth {
                status: reply.status,
                body: truncate_text(&reply.text(), 512),
            });
        }
        let Some(grant) = token::extract_token(&reply.text()) else {
            return Err(RecordError::Auth {
                status: reply.status,
                body: "access token not found in the response".to_string(),
            });
        };
        let credential = Credential::acquired(grant.token, grant.expires_in, self.clock.utc_now());
        info!(expires_in = ?credential.expires_in, "authenticated with record authority");
        self.credential = Some(credential.clone());
        Ok(credential)
    }

    pub fn submit_query(&mut self, subject: &SubjectFields) -> Result<Query, RecordError> {
        let missing = subject.missing_fields();
        if !missing.is_empty() {
            return Err(RecordError::QuerySubmission {
                status: 0,
                message: format!("subject is missing required fields: {}", missing.join(", ")),
            });
        }
        let body = serde_json::to_value(subject).map_err(|err| RecordError::QuerySubmission {
            status: 0,
            message: format!("subject could not be serialized: {err}"),
        })?;

        let request = self
            .authorized(HttpRequest::post(self.config.endpoint("api/v1/queries")))?
            .json(body);
        let reply = self.send("submit query", &request)?;
        if !reply.is_success() {
            return Err(RecordError::QuerySubmission {
                status: reply.status,
                message: truncate_text(&reply.text(), 512),
            });
        }
        let Some(payload) = reply.json() else {
            return Err(RecordError::QuerySubmission {
                status: reply.status,
                message: format!(
                    "response is not JSON: {}",
                    truncate_text(&reply.text(), 200)
                ),
            });
        };
        let Some(query) = Query::from_wire(&payload) else {
            return Err(RecordError::QuerySubmission {
                status: reply.status,
                message: "query id not found in the response".to_string(),
            });
        };
        info!(query_id = %query.id, status = query.status.as_str(), "query submitted");
        Ok(query)
    }

    /// Polls until the query is terminal. The last poll happens once
    /// `max_wait` has elapsed, so a query that never leaves PENDING sees
    /// `ceil(max_wait / poll_interval) + 1` polls. `poll_interval` is raised
    /// to [`MIN_POLL_INTERVAL`].
    pub fn await_completion(
        &mut self,
        query_id: &str,
        poll_interval: Duration,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<Query, RecordError> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let started = self.clock.now();
        let url = self.config.endpoint(&format!("api/v1/queries/{query_id}"));
        let mut polls = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RecordError::Cancelled {
                    operation: "await completion",
                });
            }
            let request = self.authorized(HttpRequest::get(url.clone()))?;
            let reply = self.send("poll query", &request)?;
            polls += 1;
            if !reply.is_success() {
                warn!(query_id, status = reply.status, "query poll rejected");
                return Err(RecordError::PollRejected {
                    query_id: query_id.to_string(),
                    status: reply.status,
                    body: truncate_text(&reply.text(), 200),
                });
            }
            let payload = poll_payload(query_id, &reply);
            let query = Query::from_wire(&payload).unwrap_or_else(|| Query {
                id: query_id.to_string(),
                status: QueryStatus::Pending,
                files: Vec::new(),
            });
            debug!(query_id, polls, status = query.status.as_str(), "polled query");
            match query.status {
                QueryStatus::Completed => {
                    info!(query_id, polls, files = query.files.len(), "query completed");
                    return Ok(query);
                }
                QueryStatus::Failed => {
                    let raw = payload
                        .get("status")
                        .or_else(|| payload.get("state"))
                        .and_then(Value::as_str)
                        .unwrap_or(QueryStatus::Failed.as_str());
                    return Err(RecordError::QueryFailed {
                        query_id: query_id.to_string(),
                        status: raw.to_string(),
                    });
                }
                QueryStatus::Pending => {}
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed >= max_wait {
                warn!(query_id, polls, "query polling timed out");
                return Err(RecordError::QueryTimeout {
                    query_id: query_id.to_string(),
                    waited: elapsed,
                });
            }
            self.sleep_unless_cancelled(poll_interval.min(max_wait - elapsed), cancel)?;
        }
    }

    pub fn fetch_artifact(&mut self, query: &Query, file_id: &str) -> Result<Artifact, RecordError> {
        if query.status != QueryStatus::Completed {
            return Err(RecordError::ArtifactFetch {
                status: 0,
                message: format!(
                    "query {} is {}, not COMPLETED",
                    query.id,
                    query.status.as_str()
                ),
            });
        }
        let url = self
            .config
            .endpoint(&format!("api/v1/files/{}/{file_id}", query.id));
        let request = self.authorized(HttpRequest::get(url))?;
        let reply = self.send("fetch artifact", &request)?;
        if !reply.is_success() {
            return Err(RecordError::ArtifactFetch {
                status: reply.status,
                message: truncate_text(&reply.text(), 512),
            });
        }
        let content_type = reply
            .content_type
            .as_deref()
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|value| !value.is_empty() && value != "application/octet-stream")
            .or_else(|| sniff_content_type(&reply.body))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        info!(
            query_id = %query.id,
            file_id,
            bytes = reply.body.len(),
            content_type = %content_type,
            "artifact fetched"
        );
        Ok(Artifact {
            query_id: query.id.clone(),
            file_id: file_id.to_string(),
            bytes: reply.body,
            content_type,
        })
    }

    fn authorized(&mut self, request: HttpRequest) -> Result<HttpRequest, RecordError> {
        let credential = self.authenticate()?;
        Ok(request
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", credential.token)))
    }

    fn send(&self, operation: &'static str, request: &HttpRequest) -> Result<HttpReply, RecordError> {
        self.transport
            .send(request)
            .map_err(|source| RecordError::Transport { operation, source })
    }

    fn sleep_unless_cancelled(
        &self,
        duration: Duration,
        cancel: &CancelToken,
    ) -> Result<(), RecordError> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let slice = remaining.min(CANCEL_CHECK_SLICE);
            self.clock.sleep(slice);
            remaining -= slice;
            if cancel.is_cancelled() {
                return Err(RecordError::Cancelled {
                    operation: "await completion",
                });
            }
        }
        Ok(())
    }
}

/// Status payload with the polled id filled in when the authority omits it.
fn poll_payload(query_id: &str, reply: &HttpReply) -> Value {
    let mut payload = reply.json().unwrap_or_else(|| Value::Object(Default::default()));
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("id")
            .or_insert_with(|| Value::String(query_id.to_string()));
    }
    payload
}

fn sniff_content_type(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(b"%PDF") {
        return Some("application/pdf".to_string());
    }
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use labscribe_contracts::records::{Query, QueryStatus, SubjectFields};
    use serde_json::json;

    use super::{HttpMethod, HttpReply, HttpRequest, RecordClient, RecordTransport};
    use crate::cancel::CancelToken;
    use crate::clock::ManualClock;
    use crate::config::RecordClientConfig;
    use crate::error::{RecordError, TransportError};

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    /// Replays canned replies and records every request.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: RefCell<VecDeque<Result<HttpReply, TransportError>>>,
        requests: RefCell<Vec<HttpRequest>>,
        fallback: Option<HttpReply>,
    }

    impl ScriptedTransport {
        fn reply(self, status: u16, body: &str) -> Self {
            self.replies.borrow_mut().push_back(Ok(HttpReply {
                status,
                content_type: Some("application/json".to_string()),
                body: body.as_bytes().to_vec(),
            }));
            self
        }

        fn raw(self, reply: HttpReply) -> Self {
            self.replies.borrow_mut().push_back(Ok(reply));
            self
        }

        fn fail(self, err: TransportError) -> Self {
            self.replies.borrow_mut().push_back(Err(err));
            self
        }

        fn forever(mut self, body: &str) -> Self {
            self.fallback = Some(HttpReply {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: body.as_bytes().to_vec(),
            });
            self
        }
    }

    impl RecordTransport for &ScriptedTransport {
        fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError> {
            self.requests.borrow_mut().push(request.clone());
            match self.replies.borrow_mut().pop_front() {
                Some(reply) => reply,
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| TransportError::new("no scripted reply left")),
            }
        }
    }

    impl ScriptedTransport {
        fn urls(&self) -> Vec<String> {
            self.requests
                .borrow()
                .iter()
                .map(|request| request.url.clone())
                .collect()
        }

        fn count_matching(&self, fragment: &str) -> usize {
            self.urls().iter().filter(|url| url.contains(fragment)).count()
        }
    }

    fn config() -> RecordClientConfig {
        RecordClientConfig {
            api_base: "https://records.example".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            ..RecordClientConfig::default()
        }
    }

    fn client(transport: &ScriptedTransport) -> RecordClient<&ScriptedTransport, Arc<ManualClock>> {
        RecordClient::new(config(), transport, Arc::new(ManualClock::new()))
    }

    fn subject() -> SubjectFields {
        SubjectFields {
            given_name: "Grant".to_string(),
            family_name: "Bogisich".to_string(),
            date_of_birth: "1995-09-05".to_string(),
            address_lines: vec!["710 Batz Estate".to_string()],
            address_city: "Harwich".to_string(),
            address_state: "MA".to_string(),
            postal_code: "02645".to_string(),
            ..SubjectFields::default()
        }
    }

    fn completed_query() -> Query {
        Query {
            id: "query-456".to_string(),
            status: QueryStatus::Completed,
            files: Vec::new(),
        }
    }

    #[test]
    fn authenticates_with_json_token_and_caches() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default().reply(200, r#"{"access_token": "abc"}"#);
        let mut client = client(&transport);
        let first = client.authenticate()?;
        let second = client.authenticate()?;
        assert_eq!(first.token, "abc");
        assert_eq!(second.token, "abc");
        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].url, "https://records.example/auth");
        assert_eq!(requests[0].header_value("client-id"), Some("client"));
        assert_eq!(requests[0].header_value("client-secret"), Some("secret"));
        Ok(())
    }

    #[test]
    fn authenticates_with_key_value_token() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default().reply(200, "access_token=kv-token&expires_in=3600");
        let mut client = client(&transport);
        let credential = client.authenticate()?;
        assert_eq!(credential.token, "kv-token");
        assert_eq!(credential.expires_in, Some(3600));
        client.authenticate()?;
        assert_eq!(transport.requests.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn expired_credential_is_replaced() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "short", "expires_in": 0}"#)
            .reply(200, r#"{"access_token": "fresh"}"#);
        let mut client = client(&transport);
        assert_eq!(client.authenticate()?.token, "short");
        assert_eq!(client.authenticate()?.token, "fresh");
        assert_eq!(transport.requests.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn auth_rejection_carries_status_and_body() {
        let transport = ScriptedTransport::default().reply(401, "invalid client");
        let err = client(&transport).authenticate();
        match err {
            Err(RecordError::Auth { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid client");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn auth_without_token_fails() {
        let transport = ScriptedTransport::default().reply(200, r#"{"expires_in": 10}"#);
        assert!(matches!(
            client(&transport).authenticate(),
            Err(RecordError::Auth { status: 200, .. })
        ));
    }

    #[test]
    fn transport_failure_is_not_an_auth_failure() {
        let transport = ScriptedTransport::default().fail(TransportError::timeout("timed out"));
        let err = client(&transport).authenticate();
        assert!(matches!(
            err,
            Err(RecordError::Transport {
                operation: "authenticate",
                ..
            })
        ));
    }

    #[test]
    fn submit_query_posts_subject_with_bearer() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(200, r#"{"id": "query-456", "state": "PENDING"}"#);
        let mut client = client(&transport);
        let query = client.submit_query(&subject())?;
        assert_eq!(query.id, "query-456");
        assert_eq!(query.status, QueryStatus::Pending);

        let requests = transport.requests.borrow();
        assert_eq!(requests[1].url, "https://records.example/api/v1/queries");
        assert_eq!(requests[1].header_value("authorization"), Some("Bearer abc"));
        let body = requests[1].json_body.clone().unwrap_or_default();
        assert_eq!(body["family_name"], json!("Bogisich"));
        assert_eq!(body["date_of_birth"], json!("1995-09-05"));
        Ok(())
    }

    #[test]
    fn submit_query_rejects_incomplete_subject_locally() {
        let transport = ScriptedTransport::default();
        let mut fields = subject();
        fields.given_name.clear();
        fields.address_lines.clear();
        match client(&transport).submit_query(&fields) {
            Err(RecordError::QuerySubmission { status, message }) => {
                assert_eq!(status, 0);
                assert!(message.contains("given_name"));
                assert!(message.contains("address_lines"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(transport.requests.borrow().is_empty());
    }

    #[test]
    fn submit_query_without_id_fails() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(200, r#"{"status": "PENDING"}"#);
        assert!(matches!(
            client(&transport).submit_query(&subject()),
            Err(RecordError::QuerySubmission { status: 200, .. })
        ));
    }

    #[test]
    fn submit_query_rejection_carries_status() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(422, "bad subject");
        assert!(matches!(
            client(&transport).submit_query(&subject()),
            Err(RecordError::QuerySubmission { status: 422, .. })
        ));
    }

    #[test]
    fn polling_stops_on_completion() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(200, r#"{"id": "query-456", "status": "PENDING"}"#)
            .reply(200, r#"{"id": "query-456", "status": "PENDING"}"#)
            .reply(
                200,
                r#"{"id": "query-456", "status": "COMPLETED", "files": [{"id": "file-123", "type": "image/png"}]}"#,
            );
        let mut client = client(&transport);
        let query = client.await_completion(
            "query-456",
            Duration::ZERO,
            Duration::from_secs(60),
            &CancelToken::new(),
        )?;
        assert_eq!(query.status, QueryStatus::Completed);
        assert_eq!(query.files[0].id, "file-123");
        assert_eq!(transport.count_matching("/api/v1/queries/query-456"), 3);
        Ok(())
    }

    #[test]
    fn polling_times_out_after_bounded_polls() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .forever(r#"{"id": "query-456", "status": "PENDING"}"#);
        let clock = Arc::new(ManualClock::new());
        let mut client = RecordClient::new(config(), &transport, clock.clone());
        let err = client.await_completion(
            "query-456",
            Duration::from_secs(10),
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        match err {
            Err(RecordError::QueryTimeout { query_id, waited }) => {
                assert_eq!(query_id, "query-456");
                assert_eq!(waited, Duration::from_secs(60));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(transport.count_matching("/api/v1/queries/"), 7);
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn uneven_wait_shortens_the_last_sleep() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .forever(r#"{"id": "query-456", "status": "PENDING"}"#);
        let clock = Arc::new(ManualClock::new());
        let mut client = RecordClient::new(config(), &transport, clock.clone());
        let result = client.await_completion(
            "query-456",
            Duration::from_secs(2),
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(RecordError::QueryTimeout { .. })));
        assert_eq!(transport.count_matching("/api/v1/queries/"), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn failed_status_is_terminal() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(200, r#"{"id": "query-456", "status": "PENDING"}"#)
            .reply(200, r#"{"id": "query-456", "status": "FAILED"}"#);
        let err = client(&transport).await_completion(
            "query-456",
            Duration::ZERO,
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        match err {
            Err(RecordError::QueryFailed { query_id, status }) => {
                assert_eq!(query_id, "query-456");
                assert_eq!(status, "FAILED");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejected_poll_is_not_a_failed_query() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(200, r#"{"id": "query-456", "status": "PENDING"}"#)
            .reply(503, "upstream unavailable");
        let err = client(&transport).await_completion(
            "query-456",
            Duration::from_secs(10),
            Duration::from_secs(60),
            &CancelToken::new(),
        );
        let err = match err {
            Err(err) => err,
            Ok(query) => panic!("poll should fail, got {query:?}"),
        };
        assert!(err.is_transient());
        assert!(matches!(
            &err,
            RecordError::PollRejected { query_id, status: 503, body }
                if query_id == "query-456" && body == "upstream unavailable"
        ));
    }

    #[test]
    fn zero_interval_is_raised_to_the_floor() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .forever(r#"{"id": "query-456", "status": "PENDING"}"#);
        let clock = Arc::new(ManualClock::new());
        let mut client = RecordClient::new(config(), &transport, clock.clone());
        let result = client.await_completion(
            "query-456",
            Duration::ZERO,
            Duration::from_secs(1),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(RecordError::QueryTimeout { .. })));
        assert_eq!(transport.count_matching("/api/v1/queries/"), 11);
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn credential_expiry_follows_the_client_clock() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "first", "expires_in": 60}"#)
            .reply(200, r#"{"access_token": "second"}"#);
        let clock = Arc::new(ManualClock::new());
        let mut client = RecordClient::new(config(), &transport, clock.clone());
        assert_eq!(client.authenticate()?.token, "first");

        clock.advance(Duration::from_secs(59));
        assert_eq!(client.authenticate()?.token, "first");
        assert_eq!(transport.requests.borrow().len(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(client.authenticate()?.token, "second");
        assert_eq!(transport.requests.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn cancelled_token_is_not_a_timeout() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .forever(r#"{"id": "query-456", "status": "PENDING"}"#);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = client(&transport).await_completion(
            "query-456",
            Duration::from_secs(10),
            Duration::from_secs(60),
            &cancel,
        );
        assert!(matches!(err, Err(RecordError::Cancelled { .. })));
        assert_eq!(transport.count_matching("/api/v1/queries/"), 0);
    }

    #[test]
    fn fetch_requires_completed_query() {
        let transport = ScriptedTransport::default();
        let pending = Query {
            status: QueryStatus::Pending,
            ..completed_query()
        };
        assert!(matches!(
            client(&transport).fetch_artifact(&pending, "file-123"),
            Err(RecordError::ArtifactFetch { status: 0, .. })
        ));
        assert!(transport.requests.borrow().is_empty());
    }

    #[test]
    fn fetch_returns_bytes_and_declared_type() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .raw(HttpReply {
                status: 200,
                content_type: Some("image/jpeg; charset=binary".to_string()),
                body: vec![0xFF, 0xD8, 0xFF, 0xE0],
            });
        let artifact = client(&transport).fetch_artifact(&completed_query(), "file-123")?;
        assert_eq!(artifact.content_type, "image/jpeg");
        assert_eq!(artifact.bytes, vec![0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(
            transport.urls()[1],
            "https://records.example/api/v1/files/query-456/file-123"
        );
        Ok(())
    }

    #[test]
    fn fetch_sniffs_missing_content_type() -> anyhow::Result<()> {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .raw(HttpReply {
                status: 200,
                content_type: None,
                body: PNG_MAGIC.to_vec(),
            });
        let artifact = client(&transport).fetch_artifact(&completed_query(), "file-123")?;
        assert_eq!(artifact.content_type, "image/png");
        assert!(artifact.is_image());
        Ok(())
    }

    #[test]
    fn fetch_rejection_carries_status() {
        let transport = ScriptedTransport::default()
            .reply(200, r#"{"access_token": "abc"}"#)
            .reply(404, "no such file");
        assert!(matches!(
            client(&transport).fetch_artifact(&completed_query(), "missing"),
            Err(RecordError::ArtifactFetch { status: 404, .. })
        ));
    }
}
