use std::path::PathBuf;
use std::time::Duration;

use labscribe_contracts::fence::BlockPolicy;

use crate::non_empty_env;

pub const DEFAULT_RECORDS_API_BASE: &str = "https://sandbox.particlehealth.com";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IMAGE_MAX_DIM: u32 = 2048;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 4096;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INSTRUCTION: &str = "Convert this laboratory report to HL7 FHIR JSON. \
Return one ```json fenced block for the DiagnosticReport and one ```json fenced block \
for each Observation. Use only fields defined by FHIR R4.";

#[derive(Clone, PartialEq, Eq)]
pub struct RecordClientConfig {
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for RecordClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_RECORDS_API_BASE.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout: DEFAULT_RECORD_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl RecordClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = non_empty_env("RECORDS_API_BASE") {
            config.api_base = base;
        }
        if let Some(id) = non_empty_env("RECORDS_CLIENT_ID") {
            config.client_id = id;
        }
        if let Some(secret) = non_empty_env("RECORDS_CLIENT_SECRET") {
            config.client_secret = secret;
        }
        config
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl std::fmt::Debug for RecordClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordClientConfig")
            .field("api_base", &self.api_base)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    pub image_max_dim: u32,
    pub max_output_tokens: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_MODEL_TIMEOUT,
            image_max_dim: DEFAULT_IMAGE_MAX_DIM,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = non_empty_env("OPENAI_API_BASE") {
            config.api_base = base;
        }
        config.api_key = non_empty_env("OPENAI_API_KEY");
        if let Some(model) = non_empty_env("LABSCRIBE_MODEL") {
            config.model = model;
        }
        config
    }

    pub fn chat_endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.api_base.trim().trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .field("image_max_dim", &self.image_max_dim)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairConfig {
    pub max_attempts: u32,
    pub instruction: String,
    pub block_policy: BlockPolicy,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            block_policy: BlockPolicy::default(),
        }
    }
}

impl RepairConfig {
    /// Budget actually spent; anything below one still runs one attempt.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub records: RecordClientConfig,
    pub model: ModelConfig,
    pub repair: RepairConfig,
    pub out_dir: PathBuf,
    /// File to fetch; the first file the query lists when unset.
    pub file_id: Option<String>,
    /// Event log location; `<out_dir>/events.jsonl` when unset.
    pub events_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            records: RecordClientConfig::default(),
            model: ModelConfig::default(),
            repair: RepairConfig::default(),
            out_dir: PathBuf::from("runs"),
            file_id: None,
            events_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            records: RecordClientConfig::from_env(),
            model: ModelConfig::from_env(),
            ..Self::default()
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.events_path
            .clone()
            .unwrap_or_else(|| self.out_dir.join("events.jsonl"))
    }
}
