//! Request and response bodies for the admission API.

use serde::{Deserialize, Serialize};

/// Kinds of tickets clients may submit.
pub const TICKET_TYPE_BUG: &str = "bug";
pub const TICKET_TYPE_SUGGESTION: &str = "suggestion";

const TITLE_MIN_CHARS: usize = 4;
const TITLE_MAX_CHARS: usize = 120;
const DETAIL_MIN_CHARS: usize = 10;
const DETAIL_MAX_CHARS: usize = 4000;
const MAX_LOG_LINES: usize = 50;

/// A client ticket submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitTicketRequest {
    #[serde(default, rename = "type")]
    pub ticket_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub reproduction_steps: String,
    #[serde(default)]
    pub expected_behavior: String,
    #[serde(default)]
    pub actual_behavior: String,
    #[serde(default)]
    pub extra_context: String,
    #[serde(default)]
    pub environment: EnvironmentSnapshot,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Client-collected environment details. Field casing matches the client
/// payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentSnapshot {
    #[serde(default)]
    pub platform: String,
    #[serde(default, rename = "appVersion")]
    pub app_version: String,
    #[serde(default, rename = "appBuild")]
    pub app_build: String,
    #[serde(default, rename = "osVersion")]
    pub os_version: String,
    #[serde(default, rename = "deviceModel")]
    pub device_model: String,
    #[serde(default, rename = "localeIdentifier")]
    pub locale_identifier: String,
    #[serde(default, rename = "timezoneIdentifier")]
    pub timezone_identifier: String,
}

impl SubmitTicketRequest {
    /// Trim every field, lower-case the enumerated ones, and drop empty log
    /// lines.
    pub fn normalize(&mut self) {
        self.ticket_type = self.ticket_type.trim().to_lowercase();
        self.title = self.title.trim().to_string();
        self.detail = self.detail.trim().to_string();
        self.reproduction_steps = self.reproduction_steps.trim().to_string();
        self.expected_behavior = self.expected_behavior.trim().to_string();
        self.actual_behavior = self.actual_behavior.trim().to_string();
        self.extra_context = self.extra_context.trim().to_string();

        let env = &mut self.environment;
        env.platform = env.platform.trim().to_lowercase();
        env.app_version = env.app_version.trim().to_string();
        env.app_build = env.app_build.trim().to_string();
        env.os_version = env.os_version.trim().to_string();
        env.device_model = env.device_model.trim().to_string();
        env.locale_identifier = env.locale_identifier.trim().to_string();
        env.timezone_identifier = env.timezone_identifier.trim().to_string();

        self.logs = self
            .logs
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
    }

    /// Validate a normalized request. Lengths are measured in characters,
    /// not bytes.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.ticket_type != TICKET_TYPE_BUG && self.ticket_type != TICKET_TYPE_SUGGESTION {
            return Err("type must be bug or suggestion");
        }

        let title_chars = self.title.chars().count();
        if !(TITLE_MIN_CHARS..=TITLE_MAX_CHARS).contains(&title_chars) {
            return Err("title must be between 4 and 120 characters");
        }

        let detail_chars = self.detail.chars().count();
        if !(DETAIL_MIN_CHARS..=DETAIL_MAX_CHARS).contains(&detail_chars) {
            return Err("detail must be between 10 and 4000 characters");
        }

        if self.logs.len() > MAX_LOG_LINES {
            return Err("too many log lines");
        }

        Ok(())
    }
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Health probe response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub time: String,
}

/// Challenge issuance response.
#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub success: bool,
    pub challenge_id: String,
    pub client_secret: String,
    pub nonce: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pow_bits: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pow_salt: Option<String>,
}

/// Successful submission response.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub issue_number: u64,
    pub ticket_token: String,
    pub public_url: String,
    pub status: &'static str,
}

/// Status query parameters.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub ticket_token: String,
}

/// Status query response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub issue_number: u64,
    pub status: String,
    pub title: String,
    pub updated_at: String,
    pub labels: Vec<String>,
    pub public_url: String,
    pub closed: bool,
    pub comments: Vec<CommentView>,
}

/// One comment in a status response.
#[derive(Debug, Serialize)]
pub struct CommentView {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: String,
}
