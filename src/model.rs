//! Bounty records and the pull-request entries attached to them

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const GITHUB_BASE_URL: &str = "https://github.com/";

/// Canonical repository URL for an `owner/name` slug.
pub fn repo_url(slug: &str) -> String {
    format!("{}{}", GITHUB_BASE_URL, slug.trim_matches('/'))
}

/// `owner/name` slug for a canonical repository URL.
///
/// Returns `None` for anything that is not a github.com repository URL.
pub fn repo_slug(url: &str) -> Option<String> {
    let rest = url.trim_end_matches('/').strip_prefix(GITHUB_BASE_URL)?;
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Some(format!("{}/{}", owner, name))
        }
        _ => None,
    }
}

/// GitHub treats repository identifiers case-insensitively.
pub fn same_repo(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "bounty_status")]
pub enum BountyStatus {
    #[default]
    #[postgres(name = "open")]
    Open,
    #[postgres(name = "closed")]
    Closed,
}

impl BountyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BountyStatus::Open => "open",
            BountyStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(BountyStatus::Open),
            "closed" => Some(BountyStatus::Closed),
            _ => None,
        }
    }
}

/// One line of a repository's language breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub language: String,
    pub percentage: f64,
}

/// A funding commitment attached to one repository issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounty {
    pub id: Uuid,
    /// Canonical repository URL, e.g. `https://github.com/acme/widget`
    pub repo: String,
    pub issue: u64,
    pub amount: f64,
    /// Coin ticker, e.g. USDC
    pub coin: String,
    pub chain_id: String,
    /// GitHub handle of whoever funded the bounty
    #[serde(rename = "bountyOwner")]
    pub bounty_owner: String,
    #[serde(default)]
    pub status: BountyStatus,
    #[serde(default)]
    pub languages: Vec<LanguageShare>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when a bounty is funded.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBounty {
    pub repo: String,
    pub issue: u64,
    pub amount: f64,
    #[serde(default)]
    pub coin: Option<String>,
    pub chain_id: String,
    #[serde(rename = "bountyOwner")]
    pub bounty_owner: String,
    #[serde(default)]
    pub languages: Vec<LanguageShare>,
}

impl NewBounty {
    pub fn into_bounty(self) -> Result<Bounty, String> {
        let coin = self
            .coin
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| "coin is required".to_string())?;
        let repo = match repo_slug(&self.repo) {
            Some(slug) => repo_url(&slug),
            None if self.repo.split('/').count() == 2 => repo_url(&self.repo),
            None => return Err(format!("not a GitHub repository: {}", self.repo)),
        };
        let now = Utc::now();
        let bounty = Bounty {
            id: Uuid::new_v4(),
            repo,
            issue: self.issue,
            amount: self.amount,
            coin,
            chain_id: self.chain_id,
            bounty_owner: self.bounty_owner,
            status: BountyStatus::Open,
            languages: self.languages,
            pull_requests: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        bounty.validate()?;
        Ok(bounty)
    }
}

impl Bounty {
    pub fn validate(&self) -> Result<(), String> {
        if i64::try_from(self.issue).is_err() {
            return Err(format!("issue number {} is out of range", self.issue));
        }
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err("amount must be positive".to_string());
        }
        if self.coin.trim().is_empty() {
            return Err("coin is required".to_string());
        }
        if self.chain_id.trim().is_empty() {
            return Err("chain_id is required".to_string());
        }
        if self.bounty_owner.trim().is_empty() {
            return Err("bountyOwner is required".to_string());
        }
        let mut total = 0.0;
        for share in &self.languages {
            if !(0.0..=100.0).contains(&share.percentage) {
                return Err(format!(
                    "language {} has percentage {} outside [0, 100]",
                    share.language, share.percentage
                ));
            }
            total += share.percentage;
        }
        // Tolerate rounding noise from upstream language statistics
        if total > 100.0 + 1e-6 {
            return Err(format!("language percentages sum to {}", total));
        }
        Ok(())
    }

    /// `owner/name` of the bounty's repository
    pub fn slug(&self) -> Option<String> {
        repo_slug(&self.repo)
    }

    pub fn issue_url(&self) -> String {
        format!("{}/issues/{}", self.repo.trim_end_matches('/'), self.issue)
    }

    pub fn entry(&self, pr_repo: &str, number: u64) -> Option<&PullRequestEntry> {
        self.pull_requests
            .iter()
            .find(|pr| pr.matches(pr_repo, number))
    }

    pub fn entry_mut(&mut self, pr_repo: &str, number: u64) -> Option<&mut PullRequestEntry> {
        self.pull_requests
            .iter_mut()
            .find(|pr| pr.matches(pr_repo, number))
    }

    /// Insert the entry unless one with the same (number, repo) key exists.
    ///
    /// Returns true when the entry was inserted.
    pub fn link(&mut self, entry: PullRequestEntry) -> bool {
        if self.entry(&entry.repo, entry.number).is_some() {
            return false;
        }
        self.pull_requests.push(entry);
        true
    }
}

/// Derived lifecycle position of a pull-request entry. Transitions only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryState {
    Linked,
    AddressCollected,
    /// Proof source is uploaded; a proof fetch can be attempted.
    ProofSourced,
    Verified,
    Notified,
}

/// One candidate fix for a bounty's issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestEntry {
    pub number: u64,
    /// `owner/name` of the repository the PR lives in
    pub repo: String,
    pub url: String,
    pub author: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evm_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webproof_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webproof: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_notified_at: Option<DateTime<Utc>>,
}

impl PullRequestEntry {
    pub fn new(
        number: u64,
        repo: impl Into<String>,
        url: impl Into<String>,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            repo: repo.into(),
            url: url.into(),
            author: author.into(),
            created_at,
            evm_address: None,
            webproof_source: None,
            webproof: None,
            address_requested_at: None,
            payout_notified_at: None,
        }
    }

    pub fn matches(&self, repo: &str, number: u64) -> bool {
        self.number == number && same_repo(&self.repo, repo)
    }

    pub fn is_author(&self, login: &str) -> bool {
        self.author.eq_ignore_ascii_case(login)
    }

    pub fn state(&self) -> EntryState {
        if self.payout_notified_at.is_some() {
            EntryState::Notified
        } else if self.webproof.is_some() {
            EntryState::Verified
        } else if self.webproof_source.is_some() {
            EntryState::ProofSourced
        } else if self.evm_address.is_some() {
            EntryState::AddressCollected
        } else {
            EntryState::Linked
        }
    }
}

/// A closing reference recovered from free text. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedReference {
    pub issue: u64,
    /// `owner/name`
    pub repo: String,
    pub raw: String,
}

impl ExtractedReference {
    pub fn repo_url(&self) -> String {
        repo_url(&self.repo)
    }
}
