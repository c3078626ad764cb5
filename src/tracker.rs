//! Issue tracker REST client (GitHub Issues).
//!
//! The admission layer calls this only after a submission has cleared every
//! anti-abuse gate. Failures are surfaced as [`GatewayError::Tracker`] and
//! mapped to an upstream-error response by the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatewayError, Result};

const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "ticketgate";

/// A new issue to create.
#[derive(Debug, Clone, Serialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Result of creating an issue.
#[derive(Debug, Clone)]
pub struct CreatedIssue {
    pub number: u64,
    pub url: String,
}

/// Current state of an issue, as needed by the status endpoint.
#[derive(Debug, Clone)]
pub struct IssueStatus {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub labels: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
    pub comments: Vec<IssueComment>,
}

/// A single issue comment.
#[derive(Debug, Clone)]
pub struct IssueComment {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CreateIssueResponse {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct IssueResponse {
    number: u64,
    title: String,
    state: String,
    updated_at: Option<String>,
    html_url: String,
    #[serde(default)]
    labels: Vec<LabelResponse>,
    comments_url: Option<String>,
}

#[derive(Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Deserialize)]
struct CommentResponse {
    id: i64,
    body: Option<String>,
    created_at: Option<String>,
    user: Option<CommentUser>,
}

#[derive(Deserialize)]
struct CommentUser {
    login: String,
}

/// REST client for the issue tracker.
pub struct IssueClient {
    http: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
}

impl IssueClient {
    /// Create a client for `owner/repo` authenticated with `token`.
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            http,
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Create an issue and return its number and public URL.
    pub async fn create_issue(&self, issue: &NewIssue) -> Result<CreatedIssue> {
        let endpoint = format!("{}/repos/{}/{}/issues", API_BASE, self.owner, self.repo);

        let response = self
            .request(self.http.post(&endpoint).json(issue))
            .await
            .map_err(|e| GatewayError::Tracker(format!("issue creation failed: {e}")))?;

        let created: CreateIssueResponse = Self::parse_body(response, "issue creation").await?;
        Ok(CreatedIssue {
            number: created.number,
            url: created.html_url,
        })
    }

    /// Fetch the current status of an issue, comments included.
    pub async fn issue_status(&self, number: u64) -> Result<IssueStatus> {
        let endpoint = format!(
            "{}/repos/{}/{}/issues/{}",
            API_BASE, self.owner, self.repo, number
        );

        let response = self
            .request(self.http.get(&endpoint))
            .await
            .map_err(|e| GatewayError::Tracker(format!("issue lookup failed: {e}")))?;

        let issue: IssueResponse = Self::parse_body(response, "issue lookup").await?;

        let comments = match issue.comments_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => self.fetch_comments(url).await?,
            _ => Vec::new(),
        };

        Ok(IssueStatus {
            number: issue.number,
            title: issue.title,
            state: issue.state,
            labels: issue
                .labels
                .into_iter()
                .map(|l| l.name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            updated_at: parse_time(issue.updated_at.as_deref()),
            url: issue.html_url,
            comments,
        })
    }

    async fn fetch_comments(&self, endpoint: &str) -> Result<Vec<IssueComment>> {
        let response = self
            .request(self.http.get(endpoint))
            .await
            .map_err(|e| GatewayError::Tracker(format!("comment lookup failed: {e}")))?;

        let raw: Vec<CommentResponse> = Self::parse_body(response, "comment lookup").await?;

        Ok(raw
            .into_iter()
            .map(|comment| IssueComment {
                id: comment.id,
                author: comment.user.map(|u| u.login).unwrap_or_default(),
                body: comment.body.unwrap_or_default(),
                created_at: parse_time(comment.created_at.as_deref()),
            })
            .collect())
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::Result<reqwest::Response> {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
    }

    async fn parse_body<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Tracker(format!("{context}: reading body failed: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::Tracker(format!(
                "{context}: HTTP {status}, body={body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| GatewayError::Tracker(format!("{context}: unexpected response: {e}")))
    }
}

fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
