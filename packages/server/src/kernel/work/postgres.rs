//! Postgres work queue.
//!
//! Claiming is a single CTE update over `FOR UPDATE SKIP LOCKED`, so two
//! workers can never hold the same item. Per-workspace concurrency caps are
//! enforced inside the claim statement itself.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::common::{OrchestratorError, OrchestratorResult, WorkId, WorkspaceId};
use crate::config::OrchestratorConfig;

use super::item::{
    NewWorkItem, QueueHealth, WorkErrorRecord, WorkItem, WorkResult, WorkState, WorkType,
};
use super::queue::WorkQueue;

const COLUMNS: &str = r#"id, work_type, work_payload, state, priority, workspace_id, basket_id,
           user_id, parent_work_id, attempts, max_attempts, claim_lease_expires_at,
           worker_id, next_attempt_at, dedupe_key, cascade_metadata, work_result,
           created_at, updated_at"#;

pub struct PostgresWorkQueue {
    pool: PgPool,
    workspace_cap: i64,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, config: &OrchestratorConfig) -> Self {
        Self {
            pool,
            workspace_cap: config.workspace_concurrency_cap as i64,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn enqueue(&self, item: NewWorkItem) -> OrchestratorResult<WorkItem> {
        let row = item.into_item()?;
        let sql = format!(
            r#"
            INSERT INTO work_queue (
                id, work_type, work_payload, state, priority, workspace_id, basket_id,
                user_id, parent_work_id, attempts, max_attempts, dedupe_key,
                next_attempt_at, cascade_metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    NOW(), NOW())
            ON CONFLICT (dedupe_key)
                WHERE state IN ('pending', 'claimed', 'processing', 'cascading')
                DO UPDATE SET updated_at = NOW()
            RETURNING {COLUMNS}
            "#
        );

        let item = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(row.id)
            .bind(row.work_type)
            .bind(&row.work_payload)
            .bind(row.priority)
            .bind(row.workspace_id)
            .bind(row.basket_id)
            .bind(row.user_id)
            .bind(row.parent_work_id)
            .bind(row.attempts)
            .bind(row.max_attempts)
            .bind(&row.dedupe_key)
            .bind(row.next_attempt_at)
            .bind(&row.cascade_metadata)
            .fetch_one(&self.pool)
            .await?;

        debug!(work_id = %item.id, work_type = %item.work_type, "work enqueued");
        Ok(item)
    }

    async fn claim(
        &self,
        work_types: &[WorkType],
        worker_id: &str,
        lease: Duration,
    ) -> OrchestratorResult<Option<WorkItem>> {
        let sql = format!(
            r#"
            WITH busy AS (
                SELECT workspace_id, COUNT(*) AS held
                FROM work_queue
                WHERE state IN ('claimed', 'processing', 'cascading')
                GROUP BY workspace_id
            ),
            next_item AS (
                SELECT w.id
                FROM work_queue w
                LEFT JOIN busy b ON b.workspace_id = w.workspace_id
                WHERE w.work_type = ANY($1)
                  AND w.state = 'pending'
                  AND (w.next_attempt_at IS NULL OR w.next_attempt_at <= NOW())
                  AND COALESCE(b.held, 0) < $4
                ORDER BY w.priority DESC, w.created_at ASC
                LIMIT 1
                FOR UPDATE OF w SKIP LOCKED
            )
            UPDATE work_queue
            SET state = 'claimed',
                worker_id = $2,
                claim_lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_item)
            RETURNING {COLUMNS}
            "#
        );

        let item = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_types)
            .bind(worker_id)
            .bind(lease.as_secs_f64())
            .bind(self.workspace_cap)
            .fetch_optional(&self.pool)
            .await?;

        Ok(item)
    }

    async fn mark_processing(&self, work_id: WorkId) -> OrchestratorResult<()> {
        let updated = sqlx::query(
            "UPDATE work_queue SET state = 'processing', updated_at = NOW()
             WHERE id = $1 AND state = 'claimed'",
        )
        .bind(work_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "work item {work_id} is not claimed"
            )));
        }
        Ok(())
    }

    async fn mark_cascading(&self, work_id: WorkId) -> OrchestratorResult<()> {
        sqlx::query(
            "UPDATE work_queue SET state = 'cascading', updated_at = NOW()
             WHERE id = $1 AND state = 'processing'",
        )
        .bind(work_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, work_id: WorkId, lease: Duration) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE work_queue
            SET claim_lease_expires_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = $1 AND state IN ('claimed', 'processing', 'cascading')
            "#,
        )
        .bind(work_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, work_id: WorkId, result: WorkResult) -> OrchestratorResult<WorkItem> {
        let result_json = serde_json::to_value(&result)?;
        let sql = format!(
            r#"
            UPDATE work_queue
            SET state = 'completed',
                work_result = $2,
                claim_lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state IN ('claimed', 'processing', 'cascading')
            RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_id)
            .bind(&result_json)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!("work item {work_id} is not held"))
            })
    }

    async fn resolve_manual(
        &self,
        work_id: WorkId,
        result: WorkResult,
    ) -> OrchestratorResult<WorkItem> {
        let result_json = serde_json::to_value(&result)?;
        let sql = format!(
            r#"
            UPDATE work_queue
            SET state = 'completed',
                work_result = $2,
                claim_lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state IN ('pending', 'claimed', 'processing', 'cascading')
            RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_id)
            .bind(&result_json)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!("work item {work_id} is already terminal"))
            })
    }

    async fn fail(
        &self,
        work_id: WorkId,
        error: WorkErrorRecord,
        retryable: bool,
    ) -> OrchestratorResult<WorkItem> {
        let current = self
            .get(work_id)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown work item {work_id}")))?;

        let next_attempts = current.attempts + 1;
        let requeue = retryable && next_attempts < current.max_attempts;
        let backoff =
            super::queue::retry_backoff(self.backoff_base, self.backoff_max, current.attempts);

        let mut result = current.result().unwrap_or_default();
        result.error = Some(error);
        let result_json = serde_json::to_value(&result)?;

        let sql = format!(
            r#"
            UPDATE work_queue
            SET state = $2,
                attempts = $3,
                next_attempt_at = $4,
                work_result = $5,
                claim_lease_expires_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );

        let state = if requeue { WorkState::Pending } else { WorkState::Failed };
        let next_attempt_at = requeue.then(|| {
            chrono::Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero())
        });

        let item = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_id)
            .bind(state)
            .bind(next_attempts)
            .bind(next_attempt_at)
            .bind(&result_json)
            .fetch_one(&self.pool)
            .await?;

        Ok(item)
    }

    async fn reap_expired(&self) -> OrchestratorResult<Vec<WorkItem>> {
        let sql = format!(
            r#"
            UPDATE work_queue
            SET attempts = attempts + 1,
                state = CASE WHEN attempts + 1 < max_attempts
                             THEN 'pending'::work_state
                             ELSE 'failed'::work_state END,
                next_attempt_at = CASE WHEN attempts + 1 < max_attempts
                                       THEN NOW() + make_interval(
                                           secs => LEAST($2, $1 * power(2, attempts)))
                                       ELSE NULL END,
                work_result = CASE WHEN attempts + 1 < max_attempts
                                   THEN work_result
                                   ELSE jsonb_build_object('error', jsonb_build_object(
                                       'code', 'transient_error',
                                       'message', 'lease expired past retry cap',
                                       'recovery_actions', '[]'::jsonb)) END,
                claim_lease_expires_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE state IN ('claimed', 'processing', 'cascading')
              AND claim_lease_expires_at < NOW()
            RETURNING {COLUMNS}
            "#
        );

        let items = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(self.backoff_base.as_secs_f64())
            .bind(self.backoff_max.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        Ok(items)
    }

    async fn get(&self, work_id: WorkId) -> OrchestratorResult<Option<WorkItem>> {
        let sql = format!("SELECT {COLUMNS} FROM work_queue WHERE id = $1");
        let item = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn find_by_dedupe_key(&self, key: &str) -> OrchestratorResult<Option<WorkItem>> {
        let sql = format!(
            r#"SELECT {COLUMNS} FROM work_queue
               WHERE dedupe_key = $1
                 AND state IN ('pending', 'claimed', 'processing', 'cascading')
               LIMIT 1"#
        );
        let item = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn children_of(&self, work_id: WorkId) -> OrchestratorResult<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM work_queue WHERE parent_work_id = $1 ORDER BY created_at ASC"
        );
        let items = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(work_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn active_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> OrchestratorResult<Vec<WorkItem>> {
        let sql = format!(
            r#"SELECT {COLUMNS} FROM work_queue
               WHERE workspace_id = $1 AND state NOT IN ('completed', 'failed')
               ORDER BY created_at ASC"#
        );
        let items = sqlx::query_as::<_, WorkItem>(&sql)
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn health(&self) -> OrchestratorResult<QueueHealth> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE state = 'pending'),
                   COUNT(*) FILTER (WHERE state IN ('claimed', 'processing')),
                   COUNT(*) FILTER (WHERE state = 'completed'),
                   COUNT(*) FILTER (WHERE state = 'failed'),
                   COUNT(*) FILTER (WHERE state = 'cascading')
            FROM work_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueHealth {
            total_items: row.0,
            pending_items: row.1,
            processing_items: row.2,
            completed_items: row.3,
            failed_items: row.4,
            active_cascades: row.5,
        })
    }
}
