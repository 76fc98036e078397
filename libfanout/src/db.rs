//! Database operations for Fanout
//!
//! Every job status change is a conditional UPDATE guarded by the status it
//! moves away from. That is what keeps `completed` and `failed` absorbing and
//! lets two workers race on the same job without both winning. Transitions
//! out of `processing` update the job and its target record in one
//! transaction, so the two never disagree.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::types::{
    Connection, JobStatus, Platform, Publication, PublicationStatus, PublishJob, TargetAccount,
    TargetOutcome, TargetStatus,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // Forward slashes work for SQLite URLs on both Windows and Unix
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqlxError)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub async fn create_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (
                id, client_id, user_id, platform, external_account_id, external_page_id,
                account_name, access_token, refresh_token, token_expires_at, is_active,
                last_error, last_used_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.client_id)
        .bind(&connection.user_id)
        .bind(connection.platform.as_str())
        .bind(&connection.external_account_id)
        .bind(&connection.external_page_id)
        .bind(&connection.account_name)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.token_expires_at)
        .bind(connection.is_active as i64)
        .bind(&connection.last_error)
        .bind(connection.last_used_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, user_id, platform, external_account_id, external_page_id,
                   account_name, access_token, refresh_token, token_expires_at, is_active,
                   last_error, last_used_at, created_at, updated_at
            FROM connections WHERE id = ?
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| connection_from_row(&r)).transpose()
    }

    /// Replace the stored credentials after a successful refresh
    ///
    /// Reactivates the connection and clears its error in the same statement.
    /// A `None` refresh token keeps the one already stored.
    pub async fn update_connection_tokens(
        &self,
        connection_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connections
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = ?,
                is_active = 1,
                last_error = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_at)
        .bind(now())
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Record that the connection was just used to publish
    pub async fn touch_connection(&self, connection_id: &str) -> Result<()> {
        let now = now();
        sqlx::query("UPDATE connections SET last_used_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(connection_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Activate or deactivate a connection, recording why
    pub async fn set_connection_active(
        &self,
        connection_id: &str,
        active: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE connections SET is_active = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(active as i64)
        .bind(error)
        .bind(now())
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // Publications
    // ========================================================================

    pub async fn create_publication(&self, publication: &Publication) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publications (id, user_id, client_id, status, published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&publication.id)
        .bind(&publication.user_id)
        .bind(&publication.client_id)
        .bind(publication.status.as_str())
        .bind(publication.published_at)
        .bind(publication.created_at)
        .bind(publication.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_publication(&self, publication_id: &str) -> Result<Option<Publication>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, client_id, status, published_at, created_at, updated_at
            FROM publications WHERE id = ?
            "#,
        )
        .bind(publication_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| {
            Ok(Publication {
                id: r.get("id"),
                user_id: r.get("user_id"),
                client_id: r.get("client_id"),
                status: PublicationStatus::from_str(&r.get::<String, _>("status"))?,
                published_at: r.get("published_at"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    /// Write the aggregate status, returning whether it actually changed
    ///
    /// `published_at` only overwrites the stored value when given.
    pub async fn settle_publication(
        &self,
        publication_id: &str,
        status: PublicationStatus,
        published_at: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publications
            SET status = ?, published_at = COALESCE(?, published_at), updated_at = ?
            WHERE id = ? AND status != ?
            "#,
        )
        .bind(status.as_str())
        .bind(published_at)
        .bind(now())
        .bind(publication_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Status of every target-account record of a publication, with its platform
    pub async fn publication_outcomes(&self, publication_id: &str) -> Result<Vec<TargetOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT pp.id, pp.status, pp.error_message, c.platform
            FROM platform_publications pp
            JOIN connections c ON c.id = pp.connection_id
            WHERE pp.publication_id = ?
            ORDER BY pp.created_at, pp.id
            "#,
        )
        .bind(publication_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(TargetOutcome {
                    target_id: r.get("id"),
                    platform: Platform::from_str(&r.get::<String, _>("platform"))?,
                    status: TargetStatus::from_str(&r.get::<String, _>("status"))?,
                    error_message: r.get("error_message"),
                })
            })
            .collect()
    }

    // ========================================================================
    // Target-account records
    // ========================================================================

    pub async fn create_target(&self, target: &TargetAccount) -> Result<()> {
        let hashtags = serde_json::to_string(&target.hashtags)
            .map_err(|e| DbError::InvalidValue(e.to_string()))?;
        let media_urls = serde_json::to_string(&target.media_urls)
            .map_err(|e| DbError::InvalidValue(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO platform_publications (
                id, publication_id, connection_id, content, hashtags, media_urls, status,
                external_post_id, external_post_url, error_message, published_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&target.id)
        .bind(&target.publication_id)
        .bind(&target.connection_id)
        .bind(&target.content)
        .bind(hashtags)
        .bind(media_urls)
        .bind(target.status.as_str())
        .bind(&target.external_post_id)
        .bind(&target.external_post_url)
        .bind(&target.error_message)
        .bind(target.published_at)
        .bind(target.created_at)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_target(&self, target_id: &str) -> Result<Option<TargetAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, publication_id, connection_id, content, hashtags, media_urls, status,
                   external_post_id, external_post_url, error_message, published_at,
                   created_at, updated_at
            FROM platform_publications WHERE id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| target_from_row(&r)).transpose()
    }

    /// Load a target-account record together with its connection
    pub async fn get_target_with_connection(
        &self,
        target_id: &str,
    ) -> Result<Option<(TargetAccount, Connection)>> {
        let Some(target) = self.get_target(target_id).await? else {
            return Ok(None);
        };
        let Some(connection) = self.get_connection(&target.connection_id).await? else {
            return Ok(None);
        };
        Ok(Some((target, connection)))
    }

    pub async fn set_target_status(&self, target_id: &str, status: TargetStatus) -> Result<()> {
        sqlx::query("UPDATE platform_publications SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(target_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn create_job(&self, job: &PublishJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_jobs (
                id, platform_publication_id, status, attempts, max_attempts, last_error,
                next_retry_at, processed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.target_id)
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(&job.last_error)
        .bind(job.next_retry_at)
        .bind(job.processed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<PublishJob>> {
        let row = sqlx::query(&format!("{} WHERE j.id = ?", JOB_SELECT))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Pending jobs whose retry time has come, oldest first
    pub async fn due_jobs(&self, now: i64, limit: u32) -> Result<Vec<PublishJob>> {
        let rows = sqlx::query(&format!(
            r#"{}
            WHERE j.status = 'pending' AND (j.next_retry_at IS NULL OR j.next_retry_at <= ?)
            ORDER BY COALESCE(j.next_retry_at, j.created_at), j.id
            LIMIT ?"#,
            JOB_SELECT
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Move a pending job to `processing` and count the attempt
    ///
    /// Returns `false` when the job was no longer pending (another worker
    /// claimed it first, or it already finished).
    pub async fn claim_job(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'processing', attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Complete a processing job and mark its record published, atomically
    ///
    /// Returns `false`, writing nothing, when the job was no longer processing.
    pub async fn complete_job_and_publish_target(
        &self,
        job_id: &str,
        target_id: &str,
        external_post_id: Option<&str>,
        external_post_url: Option<&str>,
    ) -> Result<bool> {
        let now = now();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'completed', last_error = NULL, next_retry_at = NULL,
                processed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE platform_publications
            SET status = 'published', external_post_id = ?, external_post_url = ?,
                error_message = NULL, published_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(external_post_id)
        .bind(external_post_url)
        .bind(now)
        .bind(now)
        .bind(target_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Re-arm a processing job for a later attempt and put its record back to `pending`
    pub async fn reschedule_job_and_target(
        &self,
        job_id: &str,
        target_id: &str,
        error: &str,
        next_retry_at: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'pending', last_error = ?, next_retry_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(next_retry_at)
        .bind(now())
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        set_target_error(&mut *tx, target_id, TargetStatus::Pending, error).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Fail a processing job and its record with the same error
    pub async fn fail_job_and_target(&self, job_id: &str, target_id: &str, error: &str) -> Result<bool> {
        let now = now();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'failed', last_error = ?, next_retry_at = NULL,
                processed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        set_target_error(&mut *tx, target_id, TargetStatus::Failed, error).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }
}

async fn set_target_error(
    conn: &mut SqliteConnection,
    target_id: &str,
    status: TargetStatus,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE platform_publications
        SET status = ?, error_message = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now())
    .bind(target_id)
    .execute(conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

const JOB_SELECT: &str = r#"
    SELECT j.id, j.platform_publication_id, pp.publication_id, j.status, j.attempts,
           j.max_attempts, j.last_error, j.next_retry_at, j.processed_at,
           j.created_at, j.updated_at
    FROM publish_jobs j
    JOIN platform_publications pp ON pp.id = j.platform_publication_id
"#;

fn connection_from_row(r: &SqliteRow) -> Result<Connection> {
    Ok(Connection {
        id: r.get("id"),
        client_id: r.get("client_id"),
        user_id: r.get("user_id"),
        platform: Platform::from_str(&r.get::<String, _>("platform"))?,
        external_account_id: r.get("external_account_id"),
        external_page_id: r.get("external_page_id"),
        account_name: r.get("account_name"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        token_expires_at: r.get("token_expires_at"),
        is_active: r.get::<i64, _>("is_active") != 0,
        last_error: r.get("last_error"),
        last_used_at: r.get("last_used_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn target_from_row(r: &SqliteRow) -> Result<TargetAccount> {
    let hashtags: Vec<String> = serde_json::from_str(&r.get::<String, _>("hashtags"))
        .map_err(|e| DbError::InvalidValue(format!("hashtags: {}", e)))?;
    let media_urls: Vec<String> = serde_json::from_str(&r.get::<String, _>("media_urls"))
        .map_err(|e| DbError::InvalidValue(format!("media_urls: {}", e)))?;

    Ok(TargetAccount {
        id: r.get("id"),
        publication_id: r.get("publication_id"),
        connection_id: r.get("connection_id"),
        content: r.get("content"),
        hashtags,
        media_urls,
        status: TargetStatus::from_str(&r.get::<String, _>("status"))?,
        external_post_id: r.get("external_post_id"),
        external_post_url: r.get("external_post_url"),
        error_message: r.get("error_message"),
        published_at: r.get("published_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn job_from_row(r: &SqliteRow) -> Result<PublishJob> {
    Ok(PublishJob {
        id: r.get("id"),
        target_id: r.get("platform_publication_id"),
        publication_id: r.get("publication_id"),
        status: JobStatus::from_str(&r.get::<String, _>("status"))?,
        attempts: r.get::<i64, _>("attempts") as u32,
        max_attempts: r.get::<i64, _>("max_attempts") as u32,
        last_error: r.get("last_error"),
        next_retry_at: r.get("next_retry_at"),
        processed_at: r.get("processed_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
