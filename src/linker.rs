//! Links pull requests to bounties and collects payout addresses
//!
//! Every handler re-reads the bounty right before it mutates it and sends
//! its notice only after the write went through.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::RepositoryError;
use crate::model::{repo_url, Bounty, ExtractedReference, PullRequestEntry};
use crate::notification::{NotificationGateway, Notice};
use crate::pipeline::{ProofJob, ProofPipeline, ProofScheduler};
use crate::references::{extract_issue_references, extract_valid_address};
use crate::repository::BountyRepository;

/// A pull request as carried by `pull_request` events.
#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    /// `owner/name`
    pub repo: String,
    pub number: u64,
    pub url: String,
    pub author: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
}

impl PullRequestEvent {
    fn entry(&self) -> PullRequestEntry {
        PullRequestEntry::new(
            self.number,
            self.repo.clone(),
            self.url.clone(),
            self.author.clone(),
            self.created_at,
        )
    }

    /// Closing references in the body, first occurrence of each issue only.
    fn references(&self) -> Vec<ExtractedReference> {
        let mut seen = HashSet::new();
        extract_issue_references(self.body.as_deref().unwrap_or_default(), &self.repo)
            .into_iter()
            .filter(|r| seen.insert((r.repo.to_lowercase(), r.issue)))
            .collect()
    }
}

/// A new comment on an issue or PR thread.
#[derive(Debug, Clone)]
pub struct CommentEvent {
    /// `owner/name`
    pub repo: String,
    pub thread_number: u64,
    pub is_pull_request: bool,
    pub author: String,
    pub body: String,
}

/// An issue mentioned from another issue or PR.
#[derive(Debug, Clone)]
pub struct CrossReferenceEvent {
    /// `owner/name` of the referenced issue
    pub issue_repo: String,
    pub issue_number: u64,
    pub source: ReferencingItem,
}

#[derive(Debug, Clone)]
pub struct ReferencingItem {
    pub repo: String,
    pub number: u64,
    pub url: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub is_pull_request: bool,
}

pub struct PullRequestLinker {
    repository: Arc<dyn BountyRepository>,
    notifier: Arc<dyn NotificationGateway>,
    pipeline: Arc<ProofPipeline>,
    scheduler: Arc<dyn ProofScheduler>,
}

impl PullRequestLinker {
    pub fn new(
        repository: Arc<dyn BountyRepository>,
        notifier: Arc<dyn NotificationGateway>,
        pipeline: Arc<ProofPipeline>,
        scheduler: Arc<dyn ProofScheduler>,
    ) -> Self {
        Self {
            repository,
            notifier,
            pipeline,
            scheduler,
        }
    }

    async fn notify(&self, repo: &str, thread_number: u64, notice: Notice) {
        if let Err(e) = self
            .notifier
            .post_comment(repo, thread_number, &notice.render())
            .await
        {
            error!(
                "Failed to post {} notice on {}#{}: {}",
                notice.kind(),
                repo,
                thread_number,
                e
            );
        }
    }

    /// PR opened or edited: link it to every referenced bounty and either
    /// record the address from its body or ask for one. The thread gets at
    /// most one notice per event, however many bounties it closes.
    ///
    /// All references are processed; the first storage failure is returned
    /// afterwards so the delivery can be retried.
    pub async fn on_pull_request_opened(
        &self,
        pr: &PullRequestEvent,
    ) -> Result<usize, RepositoryError> {
        let references = pr.references();
        if references.is_empty() {
            debug!("{}#{} references no issue", pr.repo, pr.number);
            return Ok(0);
        }

        let address = pr.body.as_deref().and_then(extract_valid_address);
        let mut linked = 0;
        let mut notice = None;
        let mut first_error = None;

        for reference in &references {
            match self.link_reference(pr, reference, address.as_deref()).await {
                Ok(Some(pending)) => {
                    linked += 1;
                    notice = notice.or(pending);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Failed to link {}#{} to {}#{}: {}",
                        pr.repo, pr.number, reference.repo, reference.issue, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(notice) = notice {
            self.notify(&pr.repo, pr.number, notice).await;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(linked),
        }
    }

    /// `None` when the issue has no bounty, otherwise the notice this
    /// bounty's entry calls for.
    async fn link_reference(
        &self,
        pr: &PullRequestEvent,
        reference: &ExtractedReference,
        address: Option<&str>,
    ) -> Result<Option<Option<Notice>>, RepositoryError> {
        let Some(mut bounty) = self
            .repository
            .find_by_issue(&reference.repo_url(), reference.issue)
            .await?
        else {
            debug!("No bounty for {}#{}", reference.repo, reference.issue);
            return Ok(None);
        };

        if bounty.link(pr.entry()) {
            info!(
                "Linked {}#{} to bounty {} ({})",
                pr.repo, pr.number, bounty.id, reference.raw
            );
        }

        let notice = match address {
            Some(address) => record_address(&mut bounty, &pr.repo, pr.number, address),
            None => request_address(&mut bounty, &pr.repo, pr.number),
        };
        self.repository.save(&bounty).await?;
        Ok(Some(notice))
    }

    /// A comment from the PR author may carry the payout address. It is
    /// stored on every bounty the PR is linked to that has none yet, and
    /// acknowledged once.
    pub async fn on_comment_created(&self, comment: &CommentEvent) -> Result<bool, RepositoryError> {
        if !comment.is_pull_request {
            return Ok(false);
        }
        let Some(address) = extract_valid_address(&comment.body) else {
            return Ok(false);
        };
        let bounties = self
            .repository
            .find_all_by_linked_pr(&comment.repo, comment.thread_number)
            .await?;
        if bounties.is_empty() {
            debug!(
                "{}#{} is not linked to a bounty",
                comment.repo, comment.thread_number
            );
            return Ok(false);
        }

        let mut notice = None;
        let mut first_error = None;
        for mut bounty in bounties {
            let Some(entry) = bounty.entry(&comment.repo, comment.thread_number) else {
                continue;
            };
            if !entry.is_author(&comment.author) {
                debug!(
                    "Ignoring address from {} on {}#{}: not the PR author",
                    comment.author, comment.repo, comment.thread_number
                );
                continue;
            }
            let Some(recorded) =
                record_address(&mut bounty, &comment.repo, comment.thread_number, &address)
            else {
                continue;
            };
            match self.repository.save(&bounty).await {
                Ok(()) => {
                    notice.get_or_insert(recorded);
                }
                Err(e) => {
                    error!(
                        "Failed to store address for {}#{} on bounty {}: {}",
                        comment.repo, comment.thread_number, bounty.id, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        let recorded = notice.is_some();
        if let Some(notice) = notice {
            self.notify(&comment.repo, comment.thread_number, notice)
                .await;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(recorded),
        }
    }

    /// Link a referencing PR to the bounty of the referenced issue.
    pub async fn on_cross_referenced(
        &self,
        event: &CrossReferenceEvent,
    ) -> Result<bool, RepositoryError> {
        let source = &event.source;
        if !source.is_pull_request {
            return Ok(false);
        }
        let Some(mut bounty) = self
            .repository
            .find_by_issue(&repo_url(&event.issue_repo), event.issue_number)
            .await?
        else {
            return Ok(false);
        };

        let linked = bounty.link(PullRequestEntry::new(
            source.number,
            source.repo.clone(),
            source.url.clone(),
            source.author.clone(),
            source.created_at,
        ));
        if !linked {
            return Ok(false);
        }

        self.repository.save(&bounty).await?;
        info!(
            "Linked {}#{} to bounty {} by cross-reference",
            source.repo, source.number, bounty.id
        );
        Ok(true)
    }

    /// Merged PR: locate the proof source for every referenced bounty and
    /// queue the rest of the pipeline. Returns how many jobs were queued.
    pub async fn on_pull_request_closed(&self, pr: &PullRequestEvent) -> usize {
        if !pr.merged || pr.merge_commit_sha.is_none() {
            debug!("{}#{} closed without merge", pr.repo, pr.number);
            return 0;
        }

        let mut scheduled = 0;
        for reference in pr.references() {
            let job = ProofJob {
                repo_url: reference.repo_url(),
                issue: reference.issue,
                pr_repo: pr.repo.clone(),
                pr_number: pr.number,
            };

            let bounty = match self
                .repository
                .find_by_issue(&job.repo_url, job.issue)
                .await
            {
                Ok(Some(bounty)) => bounty,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to load bounty for {}: {}", job, e);
                    continue;
                }
            };
            match bounty.entry(&pr.repo, pr.number) {
                None => {
                    warn!("Merged {} was never linked, skipping", job);
                    continue;
                }
                Some(entry) if entry.evm_address.is_none() => {
                    warn!("Merged {} has no payout address, skipping", job);
                    continue;
                }
                Some(_) => {}
            }

            match self.pipeline.locate_proof_source(&job).await {
                Ok(_) => {
                    self.scheduler.schedule(job);
                    scheduled += 1;
                }
                Err(e) => error!("Could not locate proof source for {}: {}", job, e),
            }
        }
        scheduled
    }
}

/// Store the address on a linked entry that has none yet. Returns the
/// thank-you notice only on that transition.
fn record_address(bounty: &mut Bounty, repo: &str, number: u64, address: &str) -> Option<Notice> {
    let entry = bounty.entry_mut(repo, number)?;
    if entry.evm_address.is_some() {
        return None;
    }
    entry.evm_address = Some(address.to_string());
    info!("Recorded payout address for {}#{}", repo, number);
    Some(Notice::AddressReceived {
        author: entry.author.clone(),
        address: address.to_string(),
    })
}

/// Ask once for an address on a linked entry that has none.
fn request_address(bounty: &mut Bounty, repo: &str, number: u64) -> Option<Notice> {
    let entry = bounty.entry_mut(repo, number)?;
    if entry.evm_address.is_some() || entry.address_requested_at.is_some() {
        return None;
    }
    entry.address_requested_at = Some(Utc::now());
    Some(Notice::AddressRequest {
        author: entry.author.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::model::{EntryState, NewBounty};
    use crate::pipeline::PipelineSettings;
    use crate::storage::SqliteBountyRepository;
    use crate::upload::JsonUploader;
    use crate::verifier::{ProofVerifier, VerificationOutcome};
    use crate::webproof::WebProofFetcher;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    const ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[derive(Default)]
    struct RecordingNotifier {
        posted: Mutex<Vec<(String, u64, String)>>,
    }

    #[async_trait]
    impl NotificationGateway for RecordingNotifier {
        async fn post_comment(
            &self,
            repo: &str,
            thread_number: u64,
            body: &str,
        ) -> Result<(), CollaboratorError> {
            self.posted
                .lock()
                .push((repo.to_string(), thread_number, body.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<Vec<ProofJob>>,
    }

    impl ProofScheduler for RecordingScheduler {
        fn schedule(&self, job: ProofJob) {
            self.jobs.lock().push(job);
        }
    }

    struct Unused;

    #[async_trait]
    impl JsonUploader for Unused {
        async fn store(&self, _data: &Value) -> Result<String, CollaboratorError> {
            Ok("https://gateway.example/ipfs/source".to_string())
        }
    }

    #[async_trait]
    impl WebProofFetcher for Unused {
        async fn fetch(&self, _locator: &str) -> Result<Value, CollaboratorError> {
            Err(CollaboratorError::NoProof("not used".to_string()))
        }
    }

    #[async_trait]
    impl ProofVerifier for Unused {
        async fn verify(
            &self,
            _locator: &str,
            _prover: &str,
            _verifier: &str,
            _proof: &Value,
        ) -> Result<VerificationOutcome, CollaboratorError> {
            Err(CollaboratorError::InvalidResponse("not used".to_string()))
        }
    }

    struct Harness {
        repository: Arc<SqliteBountyRepository>,
        notifier: Arc<RecordingNotifier>,
        scheduler: Arc<RecordingScheduler>,
        linker: PullRequestLinker,
    }

    fn bounty(issue: u64) -> Bounty {
        NewBounty {
            repo: "acme/widget".to_string(),
            issue,
            amount: 25.0,
            coin: Some("USDC".to_string()),
            chain_id: "8453".to_string(),
            bounty_owner: "funder".to_string(),
            languages: vec![],
        }
        .into_bounty()
        .unwrap()
    }

    async fn harness() -> Harness {
        let repository = Arc::new(SqliteBountyRepository::in_memory().unwrap());
        repository.create(&bounty(42)).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Arc::new(ProofPipeline::new(
            repository.clone(),
            Arc::new(Unused),
            Arc::new(Unused),
            Arc::new(Unused),
            notifier.clone(),
            PipelineSettings::default(),
        ));
        let linker = PullRequestLinker::new(
            repository.clone(),
            notifier.clone(),
            pipeline,
            scheduler.clone(),
        );
        Harness {
            repository,
            notifier,
            scheduler,
            linker,
        }
    }

    fn pr(body: &str) -> PullRequestEvent {
        PullRequestEvent {
            repo: "acme/widget".to_string(),
            number: 7,
            url: "https://github.com/acme/widget/pull/7".to_string(),
            author: "dev".to_string(),
            body: Some(body.to_string()),
            created_at: Utc::now(),
            merged: false,
            merge_commit_sha: None,
        }
    }

    fn comment(author: &str, body: &str) -> CommentEvent {
        CommentEvent {
            repo: "acme/widget".to_string(),
            thread_number: 7,
            is_pull_request: true,
            author: author.to_string(),
            body: body.to_string(),
        }
    }

    async fn entry_on(h: &Harness, issue: u64) -> Option<PullRequestEntry> {
        h.repository
            .find_by_issue("https://github.com/acme/widget", issue)
            .await
            .unwrap()
            .unwrap()
            .entry("acme/widget", 7)
            .cloned()
    }

    async fn entry(h: &Harness) -> Option<PullRequestEntry> {
        entry_on(h, 42).await
    }

    #[tokio::test]
    async fn test_opened_with_address_records_and_thanks() {
        let h = harness().await;
        let linked = h
            .linker
            .on_pull_request_opened(&pr(&format!("Fixes #42\n\npay to {}", ADDRESS)))
            .await
            .unwrap();
        assert_eq!(linked, 1);

        let entry = entry(&h).await.unwrap();
        assert_eq!(entry.evm_address.as_deref(), Some(ADDRESS));
        let posted = h.notifier.posted.lock().clone();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].2.contains(ADDRESS));
    }

    #[tokio::test]
    async fn test_opened_without_address_requests_once() {
        let h = harness().await;
        let event = pr("Closes #42");
        h.linker.on_pull_request_opened(&event).await.unwrap();
        // Redelivery and a later edit must not ask again
        h.linker.on_pull_request_opened(&event).await.unwrap();

        let entry = entry(&h).await.unwrap();
        assert_eq!(entry.state(), EntryState::Linked);
        assert!(entry.address_requested_at.is_some());
        assert_eq!(h.notifier.posted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unreferenced_or_unknown_issue_is_noop() {
        let h = harness().await;
        assert_eq!(
            h.linker
                .on_pull_request_opened(&pr("Refactors things"))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            h.linker.on_pull_request_opened(&pr("Fixes #43")).await.unwrap(),
            0
        );
        assert!(entry(&h).await.is_none());
        assert!(h.notifier.posted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_comment_from_author_collects_address_once() {
        let h = harness().await;
        h.linker
            .on_pull_request_opened(&pr("Fixes #42"))
            .await
            .unwrap();

        let stranger = comment("mallory", &format!("send it to {}", ADDRESS));
        assert!(!h.linker.on_comment_created(&stranger).await.unwrap());
        assert_eq!(entry(&h).await.unwrap().state(), EntryState::Linked);

        let invalid = comment("dev", "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD");
        assert!(!h.linker.on_comment_created(&invalid).await.unwrap());

        let valid = comment("DEV", &format!("here: {}", ADDRESS));
        assert!(h.linker.on_comment_created(&valid).await.unwrap());
        assert!(!h.linker.on_comment_created(&valid).await.unwrap());

        assert_eq!(
            entry(&h).await.unwrap().evm_address.as_deref(),
            Some(ADDRESS)
        );
        // Address request plus a single thank-you
        assert_eq!(h.notifier.posted.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_pr_closing_two_bounties_is_asked_once_and_paid_on_both() {
        let h = harness().await;
        h.repository.create(&bounty(43)).await.unwrap();

        let linked = h
            .linker
            .on_pull_request_opened(&pr("Fixes #42 and fixes #43"))
            .await
            .unwrap();
        assert_eq!(linked, 2);
        assert_eq!(h.notifier.posted.lock().len(), 1);
        for issue in [42, 43] {
            assert!(entry_on(&h, issue)
                .await
                .unwrap()
                .address_requested_at
                .is_some());
        }

        let reply = comment("dev", &format!("use {}", ADDRESS));
        assert!(h.linker.on_comment_created(&reply).await.unwrap());
        for issue in [42, 43] {
            let entry = entry_on(&h, issue).await.unwrap();
            assert_eq!(entry.evm_address.as_deref(), Some(ADDRESS));
            assert_eq!(entry.state(), EntryState::AddressCollected);
        }
        // One request, one thank-you
        let posted = h.notifier.posted.lock().clone();
        assert_eq!(posted.len(), 2);
        assert!(posted[1].2.contains(ADDRESS));

        let mut merged = pr("Fixes #42 and fixes #43");
        merged.merged = true;
        merged.merge_commit_sha = Some("abc123".to_string());
        assert_eq!(h.linker.on_pull_request_closed(&merged).await, 2);
    }

    #[tokio::test]
    async fn test_cross_reference_links_pull_requests_only() {
        let h = harness().await;
        let mut event = CrossReferenceEvent {
            issue_repo: "acme/widget".to_string(),
            issue_number: 42,
            source: ReferencingItem {
                repo: "acme/widget".to_string(),
                number: 7,
                url: "https://github.com/acme/widget/pull/7".to_string(),
                author: "dev".to_string(),
                created_at: Utc::now(),
                is_pull_request: false,
            },
        };
        assert!(!h.linker.on_cross_referenced(&event).await.unwrap());

        event.source.is_pull_request = true;
        assert!(h.linker.on_cross_referenced(&event).await.unwrap());
        assert!(!h.linker.on_cross_referenced(&event).await.unwrap());
        assert_eq!(entry(&h).await.unwrap().state(), EntryState::Linked);
        assert!(h.notifier.posted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_merge_locates_source_and_schedules() {
        let h = harness().await;
        let mut event = pr(&format!("Fixes #42 and fixes #42\n{}", ADDRESS));
        h.linker.on_pull_request_opened(&event).await.unwrap();

        // Closed without merge
        assert_eq!(h.linker.on_pull_request_closed(&event).await, 0);

        event.merged = true;
        event.merge_commit_sha = Some("abc123".to_string());
        assert_eq!(h.linker.on_pull_request_closed(&event).await, 1);

        assert_eq!(
            entry(&h).await.unwrap().state(),
            EntryState::ProofSourced
        );
        let jobs = h.scheduler.jobs.lock().clone();
        assert_eq!(
            jobs,
            vec![ProofJob {
                repo_url: "https://github.com/acme/widget".to_string(),
                issue: 42,
                pr_repo: "acme/widget".to_string(),
                pr_number: 7,
            }]
        );
    }

    #[tokio::test]
    async fn test_merge_without_address_is_skipped() {
        let h = harness().await;
        let mut event = pr("Fixes #42");
        h.linker.on_pull_request_opened(&event).await.unwrap();
        event.merged = true;
        event.merge_commit_sha = Some("abc123".to_string());

        assert_eq!(h.linker.on_pull_request_closed(&event).await, 0);
        assert!(h.scheduler.jobs.lock().is_empty());
        assert_eq!(entry(&h).await.unwrap().state(), EntryState::Linked);
    }
}
