//! Local SQLite storage for bounties
//!
//! Used when no DATABASE_URL is configured and by the test suite. The entry
//! list and language breakdown are stored as JSON text columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::model::{Bounty, BountyStatus, LanguageShare, PullRequestEntry};
use crate::repository::{db_number, BountyRepository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bounties (
    id TEXT PRIMARY KEY,
    repo TEXT NOT NULL,
    issue INTEGER NOT NULL,
    amount REAL NOT NULL,
    coin TEXT NOT NULL,
    chain_id TEXT NOT NULL,
    bounty_owner TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    languages TEXT NOT NULL DEFAULT '[]',
    pull_requests TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bounties_repo_issue ON bounties (repo COLLATE NOCASE, issue);
CREATE INDEX IF NOT EXISTS idx_bounties_owner ON bounties (bounty_owner COLLATE NOCASE);
"#;

const SELECT_COLUMNS: &str = "SELECT id, repo, issue, amount, coin, chain_id, bounty_owner, status, \
     languages, pull_requests, created_at, updated_at FROM bounties";

/// Raw column values, converted to a [`Bounty`] outside the row callback so
/// conversion failures surface as [`RepositoryError`].
struct BountyRow {
    id: String,
    repo: String,
    issue: i64,
    amount: f64,
    coin: String,
    chain_id: String,
    bounty_owner: String,
    status: String,
    languages: String,
    pull_requests: String,
    created_at: String,
    updated_at: String,
}

impl BountyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            issue: row.get(2)?,
            amount: row.get(3)?,
            coin: row.get(4)?,
            chain_id: row.get(5)?,
            bounty_owner: row.get(6)?,
            status: row.get(7)?,
            languages: row.get(8)?,
            pull_requests: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_bounty(self) -> Result<Bounty, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Corrupt(format!("bounty id {}: {}", self.id, e)))?;
        let status = BountyStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Corrupt(format!("bounty status {}", self.status)))?;
        let issue = u64::try_from(self.issue)
            .map_err(|_| RepositoryError::Corrupt(format!("issue number {}", self.issue)))?;
        let languages: Vec<LanguageShare> = serde_json::from_str(&self.languages)?;
        let pull_requests: Vec<PullRequestEntry> = serde_json::from_str(&self.pull_requests)?;

        Ok(Bounty {
            id,
            repo: self.repo,
            issue,
            amount: self.amount,
            coin: self.coin,
            chain_id: self.chain_id,
            bounty_owner: self.bounty_owner,
            status,
            languages,
            pull_requests,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("timestamp {}: {}", value, e)))
}

pub struct SqliteBountyRepository {
    conn: Mutex<Connection>,
}

impl SqliteBountyRepository {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<(), RepositoryError> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn query_one(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Bounty>, RepositoryError> {
        let row = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(sql)?;
            stmt.query_row(params, BountyRow::from_row).optional()?
        };
        row.map(BountyRow::into_bounty).transpose()
    }

    fn query_all(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Bounty>, RepositoryError> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, BountyRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(BountyRow::into_bounty).collect()
    }
}

#[async_trait]
impl BountyRepository for SqliteBountyRepository {
    async fn find_by_issue(
        &self,
        repo_url: &str,
        issue: u64,
    ) -> Result<Option<Bounty>, RepositoryError> {
        let Some(issue) = db_number(issue) else {
            return Ok(None);
        };
        let sql = format!(
            "{} WHERE LOWER(repo) = LOWER(?1) AND issue = ?2 ORDER BY created_at ASC LIMIT 1",
            SELECT_COLUMNS
        );
        self.query_one(&sql, &[&repo_url.trim_end_matches('/'), &issue])
    }

    async fn find_all_by_linked_pr(
        &self,
        pr_repo: &str,
        pr_number: u64,
    ) -> Result<Vec<Bounty>, RepositoryError> {
        let Some(pr_number) = db_number(pr_number) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "{} WHERE EXISTS (
                SELECT 1 FROM json_each(bounties.pull_requests) pr
                WHERE json_extract(pr.value, '$.number') = ?2
                  AND LOWER(json_extract(pr.value, '$.repo')) = LOWER(?1)
            ) ORDER BY created_at ASC",
            SELECT_COLUMNS
        );
        self.query_all(&sql, &[&pr_repo, &pr_number])
    }

    async fn save(&self, bounty: &Bounty) -> Result<(), RepositoryError> {
        let pull_requests = serde_json::to_string(&bounty.pull_requests)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE bounties SET status = ?2, pull_requests = ?3, updated_at = ?4
             WHERE id = ?1 AND (status IS NOT ?2 OR pull_requests IS NOT ?3)",
            params![
                bounty.id.to_string(),
                bounty.status.as_str(),
                pull_requests,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM bounties WHERE id = ?1)",
                params![bounty.id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(RepositoryError::NotFound(bounty.id));
            }
            debug!("Bounty {} unchanged, save skipped", bounty.id);
        }
        Ok(())
    }

    async fn create(&self, bounty: &Bounty) -> Result<(), RepositoryError> {
        let issue = db_number(bounty.issue).ok_or(RepositoryError::OutOfRange(bounty.issue))?;
        let languages = serde_json::to_string(&bounty.languages)?;
        let pull_requests = serde_json::to_string(&bounty.pull_requests)?;
        self.conn.lock().execute(
            "INSERT INTO bounties (id, repo, issue, amount, coin, chain_id, bounty_owner, status,
                                   languages, pull_requests, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                bounty.id.to_string(),
                bounty.repo,
                issue,
                bounty.amount,
                bounty.coin,
                bounty.chain_id,
                bounty.bounty_owner,
                bounty.status.as_str(),
                languages,
                pull_requests,
                bounty.created_at.to_rfc3339(),
                bounty.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Bounty>, RepositoryError> {
        match owner {
            Some(owner) => self.query_all(
                &format!(
                    "{} WHERE LOWER(bounty_owner) = LOWER(?1) ORDER BY created_at DESC",
                    SELECT_COLUMNS
                ),
                &[&owner],
            ),
            None => self.query_all(&format!("{} ORDER BY created_at DESC", SELECT_COLUMNS), &[]),
        }
    }
}
