//! Bounty repository interface
//!
//! The linker and the proof pipeline only ever talk to storage through this
//! trait. Implementations give no transactional read-modify-write; callers
//! re-read a bounty right before every state transition instead.

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::model::Bounty;

#[async_trait]
pub trait BountyRepository: Send + Sync {
    /// Bounty for a (canonical repository URL, issue number) pair.
    ///
    /// Uniqueness is not enforced by the store; the oldest match wins.
    async fn find_by_issue(
        &self,
        repo_url: &str,
        issue: u64,
    ) -> Result<Option<Bounty>, RepositoryError>;

    /// Every bounty holding an entry for the given PR identity key
    /// (`owner/name`, number), oldest first. A PR closing several issues is
    /// linked to several bounties.
    async fn find_all_by_linked_pr(
        &self,
        pr_repo: &str,
        pr_number: u64,
    ) -> Result<Vec<Bounty>, RepositoryError>;

    /// Oldest bounty holding an entry for the given PR.
    async fn find_by_linked_pr(
        &self,
        pr_repo: &str,
        pr_number: u64,
    ) -> Result<Option<Bounty>, RepositoryError> {
        Ok(self
            .find_all_by_linked_pr(pr_repo, pr_number)
            .await?
            .into_iter()
            .next())
    }

    /// Persist status and the full entry list. Saving unchanged content is a
    /// no-op.
    async fn save(&self, bounty: &Bounty) -> Result<(), RepositoryError>;

    async fn create(&self, bounty: &Bounty) -> Result<(), RepositoryError>;

    /// Bounties funded by `owner` (case-insensitive), or all of them, newest
    /// first.
    async fn list(&self, owner: Option<&str>) -> Result<Vec<Bounty>, RepositoryError>;
}

/// Issue and PR numbers are stored as signed 64-bit integers; a number past
/// `i64::MAX` cannot match any row.
pub(crate) fn db_number(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}
