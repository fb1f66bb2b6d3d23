//! Proof and payout pipeline
//!
//! Once a linked PR is merged, its entry walks through four stages:
//!
//! 1. Locate the proof source: upload a document naming the issue, recipient
//!    and author, and store its URL on the entry (inline with the event).
//! 2. Fetch the raw web proof for that URL (background, bounded by a timeout).
//! 3. Verify the proof remotely (background, bounded by a timeout).
//! 4. Persist the verified proof and post the payout notice.
//!
//! No stage is retried. The bounty is re-read before every write, so
//! replaying a job is always safe: stages that already committed are
//! skipped. Within one process a job runs at most once at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{CollaboratorError, PipelineError};
use crate::model::{Bounty, BountyStatus, EntryState, PullRequestEntry};
use crate::notification::{NotificationGateway, Notice, DEFAULT_SITE_URL};
use crate::repository::BountyRepository;
use crate::upload::JsonUploader;
use crate::verifier::ProofVerifier;
use crate::webproof::WebProofFetcher;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies one (bounty, PR) pair to push through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProofJob {
    /// Canonical URL of the bounty's repository
    pub repo_url: String,
    pub issue: u64,
    /// `owner/name` of the PR's repository
    pub pr_repo: String,
    pub pr_number: u64,
}

impl std::fmt::Display for ProofJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{} for {} issue #{}",
            self.pr_repo, self.pr_number, self.repo_url, self.issue
        )
    }
}

/// How a pipeline run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofOutcome {
    /// Proof verified and persisted, payout notice posted.
    Notified,
    /// Proof verified and persisted, but the payout notice could not be
    /// posted. A replay of the job only re-sends the notice.
    NotificationFailed,
    /// Nothing left to do.
    AlreadyNotified,
    /// Another run of the same job was still in flight.
    InProgress,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub prover_id: String,
    pub verifier_id: String,
    pub fetch_timeout: Duration,
    pub verify_timeout: Duration,
    pub site_url: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            prover_id: String::new(),
            verifier_id: String::new(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            site_url: DEFAULT_SITE_URL.to_string(),
        }
    }
}

pub struct ProofPipeline {
    repository: Arc<dyn BountyRepository>,
    uploader: Arc<dyn JsonUploader>,
    fetcher: Arc<dyn WebProofFetcher>,
    verifier: Arc<dyn ProofVerifier>,
    notifier: Arc<dyn NotificationGateway>,
    settings: PipelineSettings,
    in_flight: Mutex<HashSet<ProofJob>>,
}

/// Marks a job as running until dropped.
struct InFlight<'a> {
    jobs: &'a Mutex<HashSet<ProofJob>>,
    job: ProofJob,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.job);
    }
}

impl ProofPipeline {
    pub fn new(
        repository: Arc<dyn BountyRepository>,
        uploader: Arc<dyn JsonUploader>,
        fetcher: Arc<dyn WebProofFetcher>,
        verifier: Arc<dyn ProofVerifier>,
        notifier: Arc<dyn NotificationGateway>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repository,
            uploader,
            fetcher,
            verifier,
            notifier,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, job: &ProofJob) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(job.clone()) {
            return None;
        }
        Some(InFlight {
            jobs: &self.in_flight,
            job: job.clone(),
        })
    }

    /// Fresh copy of the bounty and the job's entry.
    async fn load(&self, job: &ProofJob) -> Result<(Bounty, PullRequestEntry), PipelineError> {
        let bounty = self
            .repository
            .find_by_issue(&job.repo_url, job.issue)
            .await?
            .ok_or_else(|| PipelineError::BountyNotFound {
                repo_url: job.repo_url.clone(),
                issue: job.issue,
            })?;
        let entry = bounty
            .entry(&job.pr_repo, job.pr_number)
            .cloned()
            .ok_or_else(|| PipelineError::EntryNotFound {
                repo_url: job.repo_url.clone(),
                issue: job.issue,
                pr_repo: job.pr_repo.clone(),
                pr_number: job.pr_number,
            })?;
        Ok((bounty, entry))
    }

    /// Re-read, apply `update` to the job's entry and save.
    async fn commit<F>(&self, job: &ProofJob, update: F) -> Result<PullRequestEntry, PipelineError>
    where
        F: FnOnce(&mut Bounty, &PullRequestEntry) -> PullRequestEntry,
    {
        let (mut bounty, entry) = self.load(job).await?;
        let original = bounty.clone();
        let updated = update(&mut bounty, &entry);
        if let Some(slot) = bounty.entry_mut(&job.pr_repo, job.pr_number) {
            *slot = updated.clone();
        }
        if bounty != original {
            self.repository.save(&bounty).await?;
        }
        Ok(updated)
    }

    /// Fails when another entry of the same bounty already holds a verified
    /// proof.
    fn ensure_unpaid(bounty: &Bounty, job: &ProofJob) -> Result<(), PipelineError> {
        match bounty
            .pull_requests
            .iter()
            .find(|pr| !pr.matches(&job.pr_repo, job.pr_number) && pr.webproof.is_some())
        {
            Some(pr) => Err(PipelineError::AlreadyPaid {
                by: format!("{}#{}", pr.repo, pr.number),
            }),
            None => Ok(()),
        }
    }

    /// Stage 1: make sure the entry has a proof source and return it.
    pub async fn locate_proof_source(&self, job: &ProofJob) -> Result<String, PipelineError> {
        let (bounty, entry) = self.load(job).await?;
        if let Some(source) = entry.webproof_source {
            debug!("Proof source for {} already set: {}", job, source);
            return Ok(source);
        }
        Self::ensure_unpaid(&bounty, job)?;
        let recipient = entry
            .evm_address
            .clone()
            .ok_or_else(|| PipelineError::MissingAddress {
                pr_repo: job.pr_repo.clone(),
                pr_number: job.pr_number,
            })?;

        let document = json!({
            "issue_url": bounty.issue_url(),
            "recipient": recipient,
            "author": entry.author,
            "pr_url": entry.url,
            "amount": bounty.amount,
            "coin": bounty.coin,
            "chain_id": bounty.chain_id,
        });
        let locator = self.uploader.store(&document).await?;

        let stored = self
            .commit(job, |_, fresh| {
                let mut updated = fresh.clone();
                // A concurrent delivery may have won the race
                if updated.webproof_source.is_none() {
                    updated.webproof_source = Some(locator.clone());
                }
                updated
            })
            .await?;

        let source = stored.webproof_source.unwrap_or(locator);
        info!("Proof source for {} located at {}", job, source);
        Ok(source)
    }

    /// Stages 2 to 4. Meant to run off the event path.
    pub async fn run(&self, job: &ProofJob) -> Result<ProofOutcome, PipelineError> {
        let Some(_running) = self.claim(job) else {
            debug!("{} is already running", job);
            return Ok(ProofOutcome::InProgress);
        };
        let (bounty, entry) = self.load(job).await?;

        match entry.state() {
            EntryState::Notified => return Ok(ProofOutcome::AlreadyNotified),
            EntryState::Verified => return Ok(self.notify_payout(job).await),
            EntryState::ProofSourced => {}
            EntryState::AddressCollected => {
                return Err(PipelineError::MissingProofSource {
                    pr_repo: job.pr_repo.clone(),
                    pr_number: job.pr_number,
                })
            }
            EntryState::Linked => {
                return Err(PipelineError::MissingAddress {
                    pr_repo: job.pr_repo.clone(),
                    pr_number: job.pr_number,
                })
            }
        }
        Self::ensure_unpaid(&bounty, job)?;

        // Stage 2
        let locator = entry.webproof_source.clone().unwrap_or_default();
        let proof = self.fetch_proof(&locator).await?;
        info!("Fetched web proof for {}", job);

        // Stage 3, against a fresh read of the entry
        let (bounty, fresh) = self.load(job).await?;
        match fresh.state() {
            EntryState::Notified => return Ok(ProofOutcome::AlreadyNotified),
            EntryState::Verified => {
                debug!("{} was verified concurrently", job);
                return Ok(self.notify_payout(job).await);
            }
            _ => {}
        }
        Self::ensure_unpaid(&bounty, job)?;
        let locator = fresh.webproof_source.clone().unwrap_or(locator);
        self.verify_proof(job, &locator, &proof).await?;
        info!("Web proof verified for {}", job);

        // Stage 4
        let verified = self
            .commit(job, |bounty, fresh| {
                let mut updated = fresh.clone();
                if updated.webproof.is_none() {
                    updated.webproof = Some(proof.clone());
                }
                bounty.status = BountyStatus::Closed;
                updated
            })
            .await?;
        info!("Stored verified web proof for {}", job);
        if verified.payout_notified_at.is_some() {
            return Ok(ProofOutcome::AlreadyNotified);
        }

        Ok(self.notify_payout(job).await)
    }

    async fn fetch_proof(&self, locator: &str) -> Result<Value, PipelineError> {
        let timeout = self.settings.fetch_timeout;
        match tokio::time::timeout(timeout, self.fetcher.fetch(locator)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CollaboratorError::Timeout("web proof fetch", timeout).into()),
        }
    }

    async fn verify_proof(
        &self,
        job: &ProofJob,
        locator: &str,
        proof: &Value,
    ) -> Result<(), PipelineError> {
        let timeout = self.settings.verify_timeout;
        let verification = self.verifier.verify(
            locator,
            &self.settings.prover_id,
            &self.settings.verifier_id,
            proof,
        );
        let outcome = match tokio::time::timeout(timeout, verification).await {
            Ok(result) => result?,
            Err(_) => return Err(CollaboratorError::Timeout("verification", timeout).into()),
        };

        if !outcome.is_success() {
            warn!("Verification rejected proof for {}: {}", job, outcome.describe());
            return Err(PipelineError::VerificationRejected(outcome.describe()));
        }
        Ok(())
    }

    /// Post the payout notice unless the entry already records one.
    /// Failures are logged only.
    async fn notify_payout(&self, job: &ProofJob) -> ProofOutcome {
        let entry = match self.load(job).await {
            Ok((_, entry)) => entry,
            Err(e) => {
                error!("Could not re-read {} before the payout notice: {}", job, e);
                return ProofOutcome::NotificationFailed;
            }
        };
        if entry.payout_notified_at.is_some() {
            return ProofOutcome::AlreadyNotified;
        }

        let body = Notice::Payout {
            author: entry.author.clone(),
            site_url: self.settings.site_url.clone(),
        }
        .render();

        if let Err(e) = self
            .notifier
            .post_comment(&job.pr_repo, job.pr_number, &body)
            .await
        {
            error!("Failed to post payout notice for {}: {}", job, e);
            return ProofOutcome::NotificationFailed;
        }

        let recorded = self
            .commit(job, |_, fresh| {
                let mut updated = fresh.clone();
                if updated.payout_notified_at.is_none() {
                    updated.payout_notified_at = Some(Utc::now());
                }
                updated
            })
            .await;
        if let Err(e) = recorded {
            error!("Payout notice for {} posted but not recorded: {}", job, e);
        }
        ProofOutcome::Notified
    }
}

/// Hands stage 2 to 4 work to something that runs it later.
pub trait ProofScheduler: Send + Sync {
    fn schedule(&self, job: ProofJob);
}

/// Unbounded in-process queue feeding a [`ProofWorker`].
#[derive(Clone)]
pub struct ProofQueue {
    tx: mpsc::UnboundedSender<ProofJob>,
}

impl ProofQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProofJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProofScheduler for ProofQueue {
    fn schedule(&self, job: ProofJob) {
        debug!("Scheduling proof job {}", job);
        if let Err(e) = self.tx.send(job) {
            error!("Proof worker is gone, dropping job {}", e.0);
        }
    }
}

/// Result of one background job, published for observers.
#[derive(Debug)]
pub struct ProofReport {
    pub job: ProofJob,
    pub result: Result<ProofOutcome, PipelineError>,
}

pub struct ProofWorker {
    pipeline: Arc<ProofPipeline>,
    jobs: mpsc::UnboundedReceiver<ProofJob>,
    reports: Option<mpsc::UnboundedSender<ProofReport>>,
}

impl ProofWorker {
    pub fn new(pipeline: Arc<ProofPipeline>, jobs: mpsc::UnboundedReceiver<ProofJob>) -> Self {
        Self {
            pipeline,
            jobs,
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<ProofReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Run every job as its own task until all queue handles are dropped.
    pub async fn run(mut self) {
        info!("Proof worker started");
        while let Some(job) = self.jobs.recv().await {
            let pipeline = self.pipeline.clone();
            let reports = self.reports.clone();
            tokio::spawn(async move {
                let report = process(&pipeline, job).await;
                publish(reports.as_ref(), report);
            });
        }
        info!("Proof worker stopped");
    }

    /// Process whatever is queued right now, one job after another.
    pub async fn drain(&mut self) -> Vec<ProofReport> {
        let mut done = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            done.push(process(&self.pipeline, job).await);
        }
        done
    }
}

async fn process(pipeline: &ProofPipeline, job: ProofJob) -> ProofReport {
    let result = pipeline.run(&job).await;
    match &result {
        Ok(outcome) => info!("Proof job {} finished: {:?}", job, outcome),
        Err(e) => error!("Proof job {} failed: {}", job, e),
    }
    ProofReport { job, result }
}

fn publish(reports: Option<&mpsc::UnboundedSender<ProofReport>>, report: ProofReport) {
    if let Some(tx) = reports {
        // Observers are optional; a closed channel is not an error
        let _ = tx.send(report);
    }
}
