pub mod cancel;
pub mod chat;
pub mod clock;
pub mod config;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod records;
pub mod repair;

use std::env;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub(crate) use labscribe_contracts::text::truncate_text;

pub use cancel::CancelToken;
pub use chat::{review_payload, ChatBackend, ChatReply, ChatSession, OpenAiChatBackend, ReviewOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ModelConfig, PipelineConfig, RecordClientConfig, RepairConfig};
pub use convert::{AttemptInput, ConversionAttempt, Converter, OpenAiConverter};
pub use error::{ConversionError, RecordError, TransportError};
pub use pipeline::{Pipeline, PipelineReport};
pub use records::{HttpRecordTransport, RecordClient, RecordTransport};
pub use repair::{BlockReport, RepairLoop, RepairOutcome, RepairReport, RepairState};

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
