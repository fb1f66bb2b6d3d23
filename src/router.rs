//! Webhook event routing
//!
//! Narrows raw `(event type, payload)` deliveries into typed events and
//! dispatches them to the [`PullRequestLinker`]. Anything unrecognized is a
//! silent no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RepositoryError;
use crate::linker::{
    CommentEvent, CrossReferenceEvent, PullRequestEvent, PullRequestLinker, ReferencingItem,
};

/// A delivery as received from GitHub.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Value of the `X-GitHub-Event` header
    pub event_type: String,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
    user: User,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    merge_commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    pull_request: PullRequest,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    /// Present only when the issue is a pull request
    #[serde(default)]
    pull_request: Option<Value>,
    #[serde(default)]
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    user: User,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    issue: Issue,
    comment: Comment,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Source {
    issue: Issue,
}

#[derive(Debug, Deserialize)]
struct CrossReferencePayload {
    issue: Issue,
    repository: Repository,
    source: Source,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Installation {
    account: Account,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    installation: Installation,
}

/// The deliveries the service acts on.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PullRequestOpened(PullRequestEvent),
    PullRequestEdited(PullRequestEvent),
    PullRequestClosed(PullRequestEvent),
    IssueCommentCreated(CommentEvent),
    IssueCrossReferenced(CrossReferenceEvent),
    InstallationCreated { account: String },
}

impl WebhookEvent {
    /// `Ok(None)` for event/action pairs the service does not handle.
    pub fn parse(envelope: &EventEnvelope) -> Result<Option<Self>, serde_json::Error> {
        let action = envelope.action().unwrap_or_default();
        let payload = &envelope.payload;

        let event = match (envelope.event_type.as_str(), action) {
            ("pull_request", "opened") => Self::PullRequestOpened(pull_request(payload)?),
            ("pull_request", "edited") => Self::PullRequestEdited(pull_request(payload)?),
            ("pull_request", "closed") => Self::PullRequestClosed(pull_request(payload)?),
            ("issue_comment", "created") => {
                let p = IssueCommentPayload::deserialize(payload)?;
                Self::IssueCommentCreated(CommentEvent {
                    repo: p.repository.full_name,
                    thread_number: p.issue.number,
                    is_pull_request: p.issue.pull_request.is_some(),
                    author: p.comment.user.login,
                    body: p.comment.body,
                })
            }
            ("issues", "cross_referenced") => {
                let p = CrossReferencePayload::deserialize(payload)?;
                let source = p.source.issue;
                let source_repo = source
                    .repository
                    .map(|r| r.full_name)
                    .unwrap_or_else(|| p.repository.full_name.clone());
                Self::IssueCrossReferenced(CrossReferenceEvent {
                    issue_repo: p.repository.full_name,
                    issue_number: p.issue.number,
                    source: ReferencingItem {
                        repo: source_repo,
                        number: source.number,
                        url: source.html_url,
                        author: source.user.map(|u| u.login).unwrap_or_default(),
                        created_at: source.created_at.unwrap_or_else(Utc::now),
                        is_pull_request: source.pull_request.is_some(),
                    },
                })
            }
            ("installation", "created") => {
                let p = InstallationPayload::deserialize(payload)?;
                Self::InstallationCreated {
                    account: p.installation.account.login,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn pull_request(payload: &Value) -> Result<PullRequestEvent, serde_json::Error> {
    let p = PullRequestPayload::deserialize(payload)?;
    Ok(PullRequestEvent {
        repo: p.repository.full_name,
        number: p.pull_request.number,
        url: p.pull_request.html_url,
        author: p.pull_request.user.login,
        body: p.pull_request.body,
        created_at: p.pull_request.created_at,
        merged: p.pull_request.merged.unwrap_or(false),
        merge_commit_sha: p.pull_request.merge_commit_sha,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Ignored,
}

pub struct EventRouter {
    linker: Arc<PullRequestLinker>,
}

impl EventRouter {
    pub fn new(linker: Arc<PullRequestLinker>) -> Self {
        Self { linker }
    }

    /// Storage failures are returned so the delivery can be retried;
    /// everything else has been handled or logged by the time this returns.
    pub async fn route(&self, envelope: &EventEnvelope) -> Result<Dispatch, RepositoryError> {
        let event = match WebhookEvent::parse(envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    "Ignoring {} event (action: {:?})",
                    envelope.event_type,
                    envelope.action()
                );
                return Ok(Dispatch::Ignored);
            }
            Err(e) => {
                warn!(
                    "Malformed {} payload (action: {:?}): {}",
                    envelope.event_type,
                    envelope.action(),
                    e
                );
                return Ok(Dispatch::Ignored);
            }
        };

        match event {
            WebhookEvent::PullRequestOpened(pr) | WebhookEvent::PullRequestEdited(pr) => {
                self.linker.on_pull_request_opened(&pr).await?;
            }
            WebhookEvent::PullRequestClosed(pr) => {
                self.linker.on_pull_request_closed(&pr).await;
            }
            WebhookEvent::IssueCommentCreated(comment) => {
                self.linker.on_comment_created(&comment).await?;
            }
            WebhookEvent::IssueCrossReferenced(event) => {
                self.linker.on_cross_referenced(&event).await?;
            }
            WebhookEvent::InstallationCreated { account } => {
                info!("App installed on {}", account);
            }
        }
        Ok(Dispatch::Handled)
    }
}
