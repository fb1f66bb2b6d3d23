//! PostgreSQL storage for bounties
//!
//! Production `BountyRepository`. Connects with DATABASE_URL through a
//! deadpool pool; entries and language breakdowns live in JSONB columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::model::{Bounty, BountyStatus, LanguageShare, PullRequestEntry};
use crate::repository::{db_number, BountyRepository};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

const SELECT_COLUMNS: &str = "SELECT id, repo, issue, amount, coin, chain_id, bounty_owner, status, \
     languages, pull_requests, created_at, updated_at FROM bounties";

#[derive(Clone)]
pub struct PgBountyRepository {
    pool: Pool,
}

impl PgBountyRepository {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            let migration_sql = include_str!("../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        Ok(())
    }

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<Bounty>, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(sql, params).await?;
        row.as_ref().map(bounty_from_row).transpose()
    }
}

fn bounty_from_row(row: &Row) -> Result<Bounty, RepositoryError> {
    let issue: i64 = row.try_get("issue")?;
    let Json(languages): Json<Vec<LanguageShare>> = row.try_get("languages")?;
    let Json(pull_requests): Json<Vec<PullRequestEntry>> = row.try_get("pull_requests")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let status: BountyStatus = row.try_get("status")?;
    let id: Uuid = row.try_get("id")?;

    Ok(Bounty {
        id,
        repo: row.try_get("repo")?,
        issue: u64::try_from(issue)
            .map_err(|_| RepositoryError::Corrupt(format!("issue number {}", issue)))?,
        amount: row.try_get("amount")?,
        coin: row.try_get("coin")?,
        chain_id: row.try_get("chain_id")?,
        bounty_owner: row.try_get("bounty_owner")?,
        status,
        languages,
        pull_requests,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl BountyRepository for PgBountyRepository {
    async fn find_by_issue(
        &self,
        repo_url: &str,
        issue: u64,
    ) -> Result<Option<Bounty>, RepositoryError> {
        let Some(issue) = db_number(issue) else {
            return Ok(None);
        };
        let sql = format!(
            "{} WHERE LOWER(repo) = LOWER($1) AND issue = $2 ORDER BY created_at ASC LIMIT 1",
            SELECT_COLUMNS
        );
        let repo_url = repo_url.trim_end_matches('/');
        self.query_opt(&sql, &[&repo_url, &issue]).await
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
                SELECT 1 FROM jsonb_array_elements(bounties.pull_requests) pr
                WHERE (pr->>'number')::BIGINT = $2 AND LOWER(pr->>'repo') = LOWER($1)
            ) ORDER BY created_at ASC",
            SELECT_COLUMNS
        );
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[&pr_repo, &pr_number]).await?;
        rows.iter().map(bounty_from_row).collect()
    }

    async fn save(&self, bounty: &Bounty) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE bounties SET status = $2, pull_requests = $3, updated_at = NOW()
                 WHERE id = $1
                   AND (status IS DISTINCT FROM $2 OR pull_requests IS DISTINCT FROM $3)",
                &[&bounty.id, &bounty.status, &Json(&bounty.pull_requests)],
            )
            .await?;

        if changed == 0 {
            let exists: bool = client
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM bounties WHERE id = $1)",
                    &[&bounty.id],
                )
                .await?
                .get(0);
            if !exists {
                return Err(RepositoryError::NotFound(bounty.id));
            }
            debug!("Bounty {} unchanged, save skipped", bounty.id);
        }
        Ok(())
    }

    async fn create(&self, bounty: &Bounty) -> Result<(), RepositoryError> {
        let issue = db_number(bounty.issue).ok_or(RepositoryError::OutOfRange(bounty.issue))?;
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO bounties (id, repo, issue, amount, coin, chain_id, bounty_owner, status,
                                       languages, pull_requests, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &bounty.id,
                    &bounty.repo,
                    &issue,
                    &bounty.amount,
                    &bounty.coin,
                    &bounty.chain_id,
                    &bounty.bounty_owner,
                    &bounty.status,
                    &Json(&bounty.languages),
                    &Json(&bounty.pull_requests),
                    &bounty.created_at,
                    &bounty.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Bounty>, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = match owner {
            Some(owner) => {
                let sql = format!(
                    "{} WHERE LOWER(bounty_owner) = LOWER($1) ORDER BY created_at DESC",
                    SELECT_COLUMNS
                );
                client.query(&sql, &[&owner]).await?
            }
            None => {
                let sql = format!("{} ORDER BY created_at DESC", SELECT_COLUMNS);
                client.query(&sql, &[]).await?
            }
        };
        rows.iter().map(bounty_from_row).collect()
    }
}
