//! Error types shared across the payout pipeline
//!
//! Storage failures, external collaborator failures and pipeline stage
//! failures each get their own enum so callers can tell a retryable
//! transport problem from a missing credential.

use std::time::Duration;

use thiserror::Error;

/// Failures raised by a `BountyRepository` implementation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("bounty {0} not found")]
    NotFound(uuid::Uuid),

    /// A number that does not fit the store's signed 64-bit columns.
    #[error("{0} is out of range")]
    OutOfRange(u64),
}

/// Failures raised by an external collaborator (upload, proof generator,
/// verifier, GitHub).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// A required endpoint or credential is not configured.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("process error: {0}")]
    Process(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The collaborator answered but the answer holds no usable proof.
    #[error("no proof: {0}")]
    NoProof(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// Failures of a single proof pipeline attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("no bounty for {repo_url} issue #{issue}")]
    BountyNotFound { repo_url: String, issue: u64 },

    #[error("bounty for {repo_url} issue #{issue} has no entry for {pr_repo}#{pr_number}")]
    EntryNotFound {
        repo_url: String,
        issue: u64,
        pr_repo: String,
        pr_number: u64,
    },

    #[error("{pr_repo}#{pr_number} has no payment address")]
    MissingAddress { pr_repo: String, pr_number: u64 },

    #[error("{pr_repo}#{pr_number} has no proof source")]
    MissingProofSource { pr_repo: String, pr_number: u64 },

    #[error("verification rejected: {0}")]
    VerificationRejected(String),

    /// Another entry of the same bounty already holds a verified proof.
    #[error("bounty already paid out to {by}")]
    AlreadyPaid { by: String },
}

impl PipelineError {
    /// Whether this failure came from a stage timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PipelineError::Collaborator(CollaboratorError::Timeout(..))
        )
    }
}
