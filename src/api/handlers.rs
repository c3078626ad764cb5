//! HTTP handlers implementing the admission pipeline.
//!
//! Every inbound action runs the same gauntlet in order: client gate
//! (User-Agent keyword), rate limit, challenge verification (submissions
//! only), then duplicate detection, and only then the business action. The
//! handlers own all transport concerns; the anti-abuse engine never sees
//! headers or status codes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::security::{
    ChallengeManager, DuplicateDetectorBackend, RateLimiterBackend, SubmissionProof, VerifyError,
};
use crate::store::{self, TicketStore};
use crate::tracker::{IssueClient, NewIssue};

use super::render;
use super::types::{
    ChallengeResponse, CommentView, ErrorResponse, HealthResponse, StatusQuery, StatusResponse,
    SubmitResponse, SubmitTicketRequest, TICKET_TYPE_BUG,
};

/// Route of the submission endpoint; also the path clients sign.
pub const ISSUES_PATH: &str = "/v1/feedback/issues";

const HEADER_CHALLENGE_ID: &str = "x-ticket-challenge-id";
const HEADER_TIMESTAMP: &str = "x-ticket-timestamp";
const HEADER_SIGNATURE: &str = "x-ticket-signature";
const HEADER_POW_NONCE: &str = "x-ticket-pow-nonce";
const HEADER_POW_HASH: &str = "x-ticket-pow-hash";

/// Label prefixes never exposed through the status endpoint.
const HIDDEN_LABEL_PREFIXES: [&str; 4] = ["internal/", "security/", "meta/", "source/"];

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    pub challenges: ChallengeManager,
    pub limiter: Arc<dyn RateLimiterBackend>,
    pub dedupe: Arc<dyn DuplicateDetectorBackend>,
    pub tracker: IssueClient,
    pub tickets: TicketStore,
}

/// An HTTP-visible rejection.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Health probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Issue a one-time challenge to the calling client.
pub async fn issue_challenge(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ChallengeResponse>, ApiError> {
    gate_user_agent(&state, &headers)?;

    let client = client_addr(&headers, peer);
    if !allow_rate(&state, "challenge", client, state.config.security.challenge_limit_per_window)
        .await
    {
        return Err(ApiError::too_many_requests("too many challenge requests"));
    }

    let bundle = state
        .challenges
        .issue(client, state.config.security.pow_difficulty_bits);

    Ok(Json(ChallengeResponse {
        success: true,
        challenge_id: bundle.challenge_id,
        client_secret: bundle.client_secret,
        nonce: bundle.nonce,
        expires_at: format_time(bundle.expires_at.into()),
        pow_bits: bundle.pow.as_ref().map(|pow| pow.bits),
        pow_salt: bundle.pow.map(|pow| pow.salt),
    }))
}

/// Accept a signed ticket submission and create the tracker issue.
pub async fn submit_ticket(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    gate_user_agent(&state, &headers)?;

    let client = client_addr(&headers, peer);
    if !allow_rate(&state, "submit", client, state.config.security.submit_limit_per_window).await {
        return Err(ApiError::too_many_requests("too many submissions"));
    }

    let challenge_id = trimmed_header(&headers, HEADER_CHALLENGE_ID);
    let timestamp = trimmed_header(&headers, HEADER_TIMESTAMP);
    let signature = trimmed_header(&headers, HEADER_SIGNATURE);
    let (Some(challenge_id), Some(timestamp), Some(signature)) =
        (challenge_id, timestamp, signature)
    else {
        return Err(ApiError::unauthorized("missing signature headers"));
    };

    let proof = SubmissionProof {
        client_addr: client,
        challenge_id,
        timestamp,
        signature,
        pow_nonce: trimmed_header(&headers, HEADER_POW_NONCE),
        pow_hash: trimmed_header(&headers, HEADER_POW_HASH),
        method: "POST",
        path: ISSUES_PATH,
        body: &body,
    };

    state.challenges.verify_submission(&proof).map_err(|e| {
        debug!(client = %client, error = %e, "Submission rejected");
        match e {
            VerifyError::ClientBlocked => ApiError::too_many_requests(
                "too many failed verifications, client temporarily blocked",
            ),
            other => ApiError::unauthorized(format!("signature verification failed: {other}")),
        }
    })?;

    let mut request: SubmitTicketRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("invalid request body"))?;
    request.normalize();
    request.validate().map_err(ApiError::bad_request)?;

    let fingerprint = dedupe_key(client, &request);
    if state
        .dedupe
        .seen_recently(&fingerprint, state.config.security.duplicate_window())
        .await
    {
        return Err(ApiError::conflict("duplicate submission detected"));
    }

    let labels = submission_labels(&request);
    let issue = NewIssue {
        title: render::issue_title(&request),
        body: render::issue_body(&request, &hash_string(&client.to_string())),
        labels,
    };

    let created = state
        .tracker
        .create_issue(&issue)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("issue creation failed: {e}")))?;

    let ticket_token = store::new_ticket_token();
    state
        .tickets
        .set(created.number, &ticket_token)
        .map_err(|e| ApiError::internal(format!("saving ticket token failed: {e}")))?;

    info!(
        client = %client,
        issue_number = created.number,
        "Ticket created"
    );

    Ok(Json(SubmitResponse {
        success: true,
        issue_number: created.number,
        ticket_token,
        public_url: created.url,
        status: "triage",
    }))
}

/// Report the tracker status of a previously created ticket.
pub async fn ticket_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(issue_number): Path<u64>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    gate_user_agent(&state, &headers)?;

    let client = client_addr(&headers, peer);
    if !allow_rate(&state, "query", client, state.config.security.query_limit_per_window).await {
        return Err(ApiError::too_many_requests("too many status queries"));
    }

    let ticket_token = query.ticket_token.trim();
    if ticket_token.is_empty() {
        return Err(ApiError::forbidden("missing ticket_token"));
    }
    if !state.tickets.validate(issue_number, ticket_token) {
        return Err(ApiError::forbidden("invalid ticket_token"));
    }

    let status = state
        .tracker
        .issue_status(issue_number)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("issue lookup failed: {e}")))?;

    let comments = status
        .comments
        .iter()
        .map(|comment| CommentView {
            id: comment.id.to_string(),
            author: comment.author.clone(),
            body: comment.body.clone(),
            created_at: format_time(comment.created_at),
        })
        .collect();

    Ok(Json(StatusResponse {
        success: true,
        issue_number: status.number,
        status: map_issue_status(&status.state, &status.labels).to_string(),
        title: status.title,
        updated_at: format_time(status.updated_at),
        labels: filter_visible_labels(&status.labels),
        public_url: status.url,
        closed: status.state.eq_ignore_ascii_case("closed"),
        comments,
    }))
}

/// Reject clients whose User-Agent lacks the configured keyword.
fn gate_user_agent(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if ua_allowed(&state.config.server.required_ua_keyword, headers) {
        Ok(())
    } else {
        Err(ApiError::forbidden("unrecognized client"))
    }
}

fn ua_allowed(keyword: &str, headers: &HeaderMap) -> bool {
    let ua = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if ua.is_empty() {
        return false;
    }

    // Some clients percent-encode their product string.
    let decoded = urlencoding::decode(ua)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| ua.to_string());

    decoded.to_lowercase().contains(&keyword.to_lowercase())
}

/// Resolve the client address: first X-Forwarded-For entry, else the peer.
fn client_addr(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

async fn allow_rate(state: &AppState, action: &str, client: IpAddr, limit: u32) -> bool {
    let key = format!("{action}:{client}");
    state
        .limiter
        .allow(&key, limit, state.config.security.rate_window())
        .await
}

fn trimmed_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn submission_labels(request: &SubmitTicketRequest) -> Vec<String> {
    let mut labels = vec![
        "source/app-feedback".to_string(),
        "status/triage".to_string(),
        platform_label(&request.environment.platform).to_string(),
    ];
    if request.ticket_type == TICKET_TYPE_BUG {
        labels.push("type/bug".to_string());
    } else {
        labels.push("type/feature".to_string());
    }
    labels
}

fn platform_label(platform: &str) -> &'static str {
    match platform {
        "ios" => "platform/ios",
        "watchos" => "platform/watchos",
        _ => "platform/unknown",
    }
}

/// Content fingerprint for duplicate detection: the client address plus the
/// fields a resubmission would repeat verbatim.
fn dedupe_key(client: IpAddr, request: &SubmitTicketRequest) -> String {
    hash_string(&format!(
        "{}|{}|{}|{}",
        client, request.ticket_type, request.title, request.detail
    ))
}

fn hash_string(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Map tracker state and labels onto the client-visible status. A closed
/// issue is closed no matter which workflow labels are still attached.
fn map_issue_status(state: &str, labels: &[String]) -> &'static str {
    if state.eq_ignore_ascii_case("closed") {
        return "closed";
    }

    let lowered: Vec<String> = labels.iter().map(|label| label.to_lowercase()).collect();
    let has = |target: &str| lowered.iter().any(|label| label == target);

    if has("status/triage") {
        "triage"
    } else if has("status/in-progress") {
        "in_progress"
    } else if has("status/blocked") {
        "blocked"
    } else if has("status/resolved") {
        "resolved"
    } else {
        "in_progress"
    }
}

fn filter_visible_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .filter(|label| {
            let normalized = label.trim().to_lowercase();
            !normalized.is_empty()
                && !HIDDEN_LABEL_PREFIXES
                    .iter()
                    .any(|prefix| normalized.starts_with(prefix))
        })
        .map(|label| label.trim().to_string())
        .collect()
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_ua(ua: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_str(ua).unwrap());
        headers
    }

    #[test]
    fn ua_gate_is_case_insensitive_and_decodes() {
        assert!(ua_allowed("Ticketgate Client", &headers_with_ua("ticketgate client/1.0")));
        assert!(ua_allowed(
            "Ticketgate Client",
            &headers_with_ua("Ticketgate%20Client/1.0 (iOS)")
        ));
        assert!(!ua_allowed("Ticketgate Client", &headers_with_ua("curl/8.0")));
        assert!(!ua_allowed("Ticketgate Client", &HeaderMap::new()));
    }

    #[test]
    fn client_addr_prefers_first_forwarded_entry() {
        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(
            client_addr(&headers, peer),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );

        // Unparsable or absent forwarding headers fall back to the peer.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_addr(&headers, peer), peer.ip());
        assert_eq!(client_addr(&HeaderMap::new(), peer), peer.ip());
    }

    #[test]
    fn closed_state_wins_over_workflow_labels() {
        let labels = vec![
            "status/triage".to_string(),
            "status/in-progress".to_string(),
        ];
        assert_eq!(map_issue_status("closed", &labels), "closed");
    }

    #[test]
    fn workflow_labels_map_in_precedence_order() {
        let status = |labels: &[&str]| {
            let owned: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
            map_issue_status("open", &owned)
        };

        assert_eq!(status(&["status/triage", "status/blocked"]), "triage");
        assert_eq!(status(&["status/in-progress"]), "in_progress");
        assert_eq!(status(&["status/blocked"]), "blocked");
        assert_eq!(status(&["status/resolved"]), "resolved");
        assert_eq!(status(&["type/bug"]), "in_progress");
    }

    #[test]
    fn hidden_labels_are_filtered() {
        let labels = vec![
            "type/bug".to_string(),
            "source/app-feedback".to_string(),
            "Internal/notes".to_string(),
            "security/cve".to_string(),
            " ".to_string(),
        ];
        assert_eq!(filter_visible_labels(&labels), vec!["type/bug".to_string()]);
    }

    #[test]
    fn dedupe_key_tracks_identifying_fields_only() {
        let client: IpAddr = "127.0.0.1".parse().unwrap();
        let mut request = SubmitTicketRequest {
            ticket_type: "bug".to_string(),
            title: "Crash".to_string(),
            detail: "It crashes on launch.".to_string(),
            ..Default::default()
        };

        let key = dedupe_key(client, &request);
        request.logs = vec!["irrelevant".to_string()];
        assert_eq!(dedupe_key(client, &request), key);

        request.title = "Different crash".to_string();
        assert_ne!(dedupe_key(client, &request), key);
    }

    #[test]
    fn submission_labels_cover_source_status_platform_and_type() {
        let mut request = SubmitTicketRequest {
            ticket_type: "suggestion".to_string(),
            ..Default::default()
        };
        request.environment.platform = "watchos".to_string();

        let labels = submission_labels(&request);
        assert_eq!(
            labels,
            vec![
                "source/app-feedback".to_string(),
                "status/triage".to_string(),
                "platform/watchos".to_string(),
                "type/feature".to_string(),
            ]
        );
    }
}
