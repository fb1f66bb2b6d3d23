//! GitHub API client for posting bounty status comments
//!
//! Supports authentication via environment variables:
//! - EXTRA_GITHUB_TOKEN (priority)
//! - GITHUB_TOKEN (fallback)

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::CollaboratorError;
use crate::notification::NotificationGateway;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Get GitHub token from environment (EXTRA_GITHUB_TOKEN takes priority)
pub fn get_github_token() -> Option<String> {
    std::env::var("EXTRA_GITHUB_TOKEN")
        .or_else(|_| std::env::var("GITHUB_TOKEN"))
        .ok()
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct CreatedComment {
    pub id: u64,
    pub html_url: String,
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        if token.is_some() {
            info!("GitHub client initialized with authentication token");
        } else {
            warn!("GitHub client initialized WITHOUT token - comments cannot be posted");
        }
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn build_request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("User-Agent", concat!("gitclaim/", env!("CARGO_PKG_VERSION")))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        req
    }

    pub async fn create_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<CreatedComment, CollaboratorError> {
        if self.token.is_none() {
            return Err(CollaboratorError::Config(
                "GITHUB_TOKEN is not set; cannot post comments".to_string(),
            ));
        }

        let url = format!("{}/repos/{}/issues/{}/comments", self.api_base, repo, number);
        debug!("Posting comment to {}#{}", repo, number);

        let response = self
            .build_request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("GitHub API error {}: {}", status, body);
            return Err(CollaboratorError::Http {
                service: "github",
                status,
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl NotificationGateway for GitHubClient {
    async fn post_comment(
        &self,
        repo: &str,
        thread_number: u64,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        let comment = self.create_comment(repo, thread_number, body).await?;
        info!("Posted comment {} on {}#{}", comment.id, repo, thread_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_comment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/issues/7/comments"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({ "body": "hello" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": 1,
                "html_url": "https://github.com/acme/widget/pull/7#issuecomment-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), Some("secret".to_string()));
        client.post_comment("acme/widget", 7, "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_post_comment_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), Some("secret".to_string()));
        let err = client
            .post_comment("acme/widget", 7, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Http { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_post_comment_without_token_is_config_error() {
        let client = GitHubClient::new("http://127.0.0.1:1", None);
        let err = client
            .post_comment("acme/widget", 7, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Config(_)));
    }
}
