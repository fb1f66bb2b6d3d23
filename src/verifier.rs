//! Remote web proof verification

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CollaboratorError;

/// Words in a verification error that mark the proof as rejected.
const FAILURE_VOCABULARY: [&str; 5] = ["revert", "error", "expired", "fail", "invalid"];

/// What the verifier answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub status: u16,
    pub verification_error: Option<String>,
}

impl VerificationOutcome {
    /// HTTP-level success and no verification error using failure words.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
            && !self
                .verification_error
                .as_deref()
                .is_some_and(is_failure_message)
    }

    pub fn describe(&self) -> String {
        match &self.verification_error {
            Some(err) => format!("status {}: {}", self.status, err),
            None => format!("status {}", self.status),
        }
    }
}

pub fn is_failure_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    FAILURE_VOCABULARY.iter().any(|word| lower.contains(word))
}

#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(
        &self,
        locator: &str,
        prover: &str,
        verifier: &str,
        proof: &Value,
    ) -> Result<VerificationOutcome, CollaboratorError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    url: &'a str,
    prover: &'a str,
    verifier: &'a str,
    proof: &'a Value,
}

pub struct HttpProofVerifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpProofVerifier {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.filter(|e| !e.is_empty()),
        }
    }
}

#[async_trait]
impl ProofVerifier for HttpProofVerifier {
    async fn verify(
        &self,
        locator: &str,
        prover: &str,
        verifier: &str,
        proof: &Value,
    ) -> Result<VerificationOutcome, CollaboratorError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| CollaboratorError::Config("VERIFIER_URL is not set".to_string()))?;

        let response = self
            .client
            .post(endpoint)
            .json(&VerifyRequest {
                url: locator,
                prover,
                verifier,
                proof,
            })
            .send()
            .await?;

        let http_status = response.status().as_u16();
        let body = response.text().await?;
        debug!("Verifier answered HTTP {}: {}", http_status, body);

        Ok(parse_outcome(http_status, &body))
    }
}

fn parse_outcome(http_status: u16, body: &str) -> VerificationOutcome {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let Some(Value::Object(map)) = parsed else {
        if !(200..300).contains(&http_status) {
            warn!("Verifier returned HTTP {} without a JSON body", http_status);
        }
        return VerificationOutcome {
            status: http_status,
            verification_error: None,
        };
    };

    let status = map
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(http_status);
    let verification_error = match map.get("verificationError") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    VerificationOutcome {
        // A 2xx body status never upgrades a failed HTTP exchange
        status: if (200..300).contains(&http_status) {
            status
        } else {
            http_status
        },
        verification_error,
    }
}
