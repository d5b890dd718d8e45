//! SurrealDB-backed shard store.
//!
//! Executions are stored as JSON documents next to their `next_event_id`;
//! timer tasks carry their sort key (`visibility_ns`, `task_id`) as plain
//! integers so range reads and ordering happen in the database. Conditional
//! updates run as a single transaction that throws on a version mismatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourglass_core::{ExecutionKey, TimerSequenceId, TimerTask};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use tracing::debug;

use super::client::{StoreConfig, connect};
use super::error::{
    CONDITION_FAILED_MARKER, PersistenceError, PersistenceResult, from_surrealdb_error,
};
use super::{
    ExecutionStore, GetTimerTasksRequest, GetTimerTasksResponse, TimerTaskStore,
    UpdateWorkflowExecutionRequest,
};
use crate::error::EXECUTION_ENTITY;
use crate::mutable_state::MutableState;

const EXECUTION_TABLE: &str = "workflow_execution";
const TIMER_TABLE: &str = "timer_task";
const META_TABLE: &str = "shard_meta";
const NOT_FOUND_MARKER: &str = "hourglass:execution_not_found";

const SCHEMA: &str = r"
    DEFINE TABLE IF NOT EXISTS workflow_execution SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS timer_task SCHEMALESS;
    DEFINE FIELD IF NOT EXISTS task_id ON timer_task TYPE int;
    DEFINE FIELD IF NOT EXISTS visibility_ns ON timer_task TYPE int;
    DEFINE FIELD IF NOT EXISTS payload ON timer_task TYPE string;
    DEFINE INDEX IF NOT EXISTS timer_task_order ON timer_task FIELDS visibility_ns, task_id;
    DEFINE TABLE IF NOT EXISTS shard_meta SCHEMALESS;
";

const CREATE_EXECUTION: &str = r"
    BEGIN TRANSACTION;
    CREATE type::thing('workflow_execution', $key) SET next_event_id = $next_event_id, state = $state;
    FOR $task IN $tasks {
        CREATE type::thing('timer_task', $task.task_id) CONTENT $task;
    };
    LET $prev = (SELECT VALUE max_task_id FROM shard_meta:counters)[0] ?? 0;
    UPSERT shard_meta:counters SET max_task_id = math::max([$prev, $max_task_id]);
    COMMIT TRANSACTION;
";

const UPDATE_EXECUTION: &str = r"
    BEGIN TRANSACTION;
    LET $actual = (SELECT VALUE next_event_id FROM type::thing('workflow_execution', $key))[0];
    IF $actual = NONE {
        THROW 'hourglass:execution_not_found';
    };
    IF $actual != $condition {
        THROW string::concat('hourglass:condition_failed:', <string>$condition, ':', <string>$actual);
    };
    UPDATE type::thing('workflow_execution', $key) SET next_event_id = $next_event_id, state = $state;
    FOR $task IN $tasks {
        CREATE type::thing('timer_task', $task.task_id) CONTENT $task;
    };
    LET $prev = (SELECT VALUE max_task_id FROM shard_meta:counters)[0] ?? 0;
    UPSERT shard_meta:counters SET max_task_id = math::max([$prev, $max_task_id]);
    COMMIT TRANSACTION;
";

const READ_TIMERS: &str = r"
    SELECT task_id, visibility_ns, payload FROM timer_task
    WHERE visibility_ns <= $max_visibility
      AND (visibility_ns > $after_visibility
           OR (visibility_ns = $after_visibility AND task_id > $after_task_id))
    ORDER BY visibility_ns ASC, task_id ASC
    LIMIT $limit;
";

const EARLIEST_FUTURE: &str = r"
    SELECT visibility_ns FROM timer_task
    WHERE visibility_ns > $after
    ORDER BY visibility_ns ASC
    LIMIT 1;
";

/// Nanoseconds since the epoch; saturates outside the representable range.
fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(if at.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// A timer task as stored in the `timer_task` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimerTaskRecord {
    task_id: i64,
    visibility_ns: i64,
    payload: String,
}

impl TimerTaskRecord {
    fn from_task(task: &TimerTask) -> PersistenceResult<Self> {
        Ok(Self {
            task_id: task.task_id,
            visibility_ns: to_nanos(task.visibility_timestamp),
            payload: serde_json::to_string(task)?,
        })
    }

    fn into_task(self) -> PersistenceResult<TimerTask> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionRecord {
    state: String,
}

#[derive(Debug, Deserialize)]
struct VisibilityRow {
    visibility_ns: i64,
}

#[derive(Debug, Deserialize)]
struct CountersRecord {
    max_task_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckRecord {
    visibility: DateTime<Utc>,
    task_id: i64,
}

fn timer_records(tasks: &[TimerTask]) -> PersistenceResult<Vec<TimerTaskRecord>> {
    tasks.iter().map(TimerTaskRecord::from_task).collect()
}

/// Pick the most specific error a failed transaction reported.
///
/// Statements cancelled by a failed transaction all report a generic error;
/// the one carrying a marker explains why.
fn transaction_error<E: std::fmt::Display>(
    errors: impl IntoIterator<Item = (usize, E)>,
    key: &str,
) -> Option<PersistenceError> {
    let messages: Vec<(usize, String)> = errors
        .into_iter()
        .map(|(index, err)| (index, err.to_string()))
        .sorted_by_key(|(index, _)| *index)
        .collect();

    if messages.iter().any(|(_, msg)| msg.contains(NOT_FOUND_MARKER)) {
        return Some(PersistenceError::not_found(EXECUTION_ENTITY, key));
    }
    messages
        .iter()
        .find(|(_, msg)| msg.contains(CONDITION_FAILED_MARKER))
        .or_else(|| messages.first())
        .map(|(_, msg)| from_surrealdb_error(msg))
}

/// Shard store over a SurrealDB connection.
#[derive(Debug, Clone)]
pub struct SurrealShardStore {
    db: Surreal<Any>,
}

impl SurrealShardStore {
    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema setup fails.
    pub async fn connect(config: &StoreConfig) -> PersistenceResult<Self> {
        let db = connect(config).await?;
        let store = Self { db };
        store.initialize_schema().await?;
        debug!(url = %config.url, database = %config.database, "shard store connected");
        Ok(store)
    }

    /// Create the tables and indexes used by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn initialize_schema(&self) -> PersistenceResult<()> {
        self.db
            .query(SCHEMA)
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(|e| PersistenceError::schema(e.to_string()))?;
        Ok(())
    }

    /// Check the database responds.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub async fn health_check(&self) -> PersistenceResult<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(from_surrealdb_error)?;
        Ok(())
    }

    async fn write_execution(
        &self,
        statement: &'static str,
        state: &MutableState,
        condition: Option<i64>,
        tasks: &[TimerTask],
    ) -> PersistenceResult<()> {
        let key = state.key().storage_key();
        let records = timer_records(tasks)?;
        let max_task_id = tasks.iter().map(|t| t.task_id).max().unwrap_or(0);

        let mut query = self
            .db
            .query(statement)
            .bind(("key", key.clone()))
            .bind(("next_event_id", state.next_event_id()))
            .bind(("state", serde_json::to_string(state)?))
            .bind(("tasks", records))
            .bind(("max_task_id", max_task_id));
        if let Some(condition) = condition {
            query = query.bind(("condition", condition));
        }

        let mut response = query.await.map_err(from_surrealdb_error)?;
        match transaction_error(response.take_errors(), &key) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TimerTaskStore for SurrealShardStore {
    async fn get_timer_tasks(
        &self,
        request: GetTimerTasksRequest,
    ) -> PersistenceResult<GetTimerTasksResponse> {
        let (after_visibility, after_task_id) = request
            .next_page_token
            .map_or((i64::MIN, i64::MIN), |token| {
                (to_nanos(token.0.visibility_timestamp), token.0.task_id)
            });

        let records: Vec<TimerTaskRecord> = self
            .db
            .query(READ_TIMERS)
            .bind(("max_visibility", to_nanos(request.max_visibility)))
            .bind(("after_visibility", after_visibility))
            .bind(("after_task_id", after_task_id))
            .bind(("limit", i64::try_from(request.page_size).unwrap_or(i64::MAX)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let timers = records
            .into_iter()
            .map(TimerTaskRecord::into_task)
            .collect::<PersistenceResult<Vec<_>>>()?;
        Ok(GetTimerTasksResponse::from_page(timers, request.page_size))
    }

    async fn delete_timer_task(&self, task_id: i64) -> PersistenceResult<bool> {
        let deleted: Option<TimerTaskRecord> = self
            .db
            .delete((TIMER_TABLE, task_id))
            .await
            .map_err(from_surrealdb_error)?;
        Ok(deleted.is_some())
    }

    async fn earliest_future_deadline(
        &self,
        after: DateTime<Utc>,
    ) -> PersistenceResult<Option<DateTime<Utc>>> {
        let rows: Vec<VisibilityRow> = self
            .db
            .query(EARLIEST_FUTURE)
            .bind(("after", to_nanos(after)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        Ok(rows
            .first()
            .map(|row| DateTime::from_timestamp_nanos(row.visibility_ns)))
    }

    async fn max_task_id(&self) -> PersistenceResult<i64> {
        let counters: Option<CountersRecord> = self
            .db
            .select((META_TABLE, "counters"))
            .await
            .map_err(from_surrealdb_error)?;
        Ok(counters.map_or(0, |c| c.max_task_id))
    }

    async fn update_timer_ack_level(&self, level: TimerSequenceId) -> PersistenceResult<()> {
        // Single writer per shard, so read-then-write cannot interleave.
        if self
            .timer_ack_level()
            .await?
            .is_some_and(|current| current >= level)
        {
            return Ok(());
        }
        let _: Option<AckRecord> = self
            .db
            .upsert((META_TABLE, "ack"))
            .content(AckRecord {
                visibility: level.visibility_timestamp,
                task_id: level.task_id,
            })
            .await
            .map_err(from_surrealdb_error)?;
        Ok(())
    }

    async fn timer_ack_level(&self) -> PersistenceResult<Option<TimerSequenceId>> {
        let record: Option<AckRecord> = self
            .db
            .select((META_TABLE, "ack"))
            .await
            .map_err(from_surrealdb_error)?;
        Ok(record.map(|r| TimerSequenceId::new(r.visibility, r.task_id)))
    }
}

#[async_trait]
impl ExecutionStore for SurrealShardStore {
    async fn create_workflow_execution(
        &self,
        state: &MutableState,
        timer_tasks: &[TimerTask],
    ) -> PersistenceResult<()> {
        self.write_execution(CREATE_EXECUTION, state, None, timer_tasks)
            .await
    }

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> PersistenceResult<Option<MutableState>> {
        let record: Option<ExecutionRecord> = self
            .db
            .select((EXECUTION_TABLE, key.storage_key()))
            .await
            .map_err(from_surrealdb_error)?;
        record
            .map(|r| serde_json::from_str(&r.state).map_err(PersistenceError::from))
            .transpose()
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> PersistenceResult<()> {
        self.write_execution(
            UPDATE_EXECUTION,
            &request.state,
            Some(request.condition),
            &request.timer_tasks,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::arithmetic_side_effects, clippy::indexing_slicing)]

    use super::*;

    #[test]
    fn test_nanos_preserve_order() {
        let a = Utc::now();
        let b = a + chrono::Duration::nanoseconds(1);
        assert!(to_nanos(a) < to_nanos(b));
        assert_eq!(DateTime::from_timestamp_nanos(to_nanos(a)), a);
    }

    #[test]
    fn test_transaction_error_prefers_marker() {
        let err = transaction_error(
            vec![
                (0, "The query was not executed due to a failed transaction".to_string()),
                (2, format!("An error occurred: {CONDITION_FAILED_MARKER}:4:6")),
            ],
            "d:wf:run",
        );
        assert_eq!(err, Some(PersistenceError::condition_failed(4, 6)));

        let missing = transaction_error(
            vec![(1, format!("An error occurred: {NOT_FOUND_MARKER}"))],
            "d:wf:run",
        );
        assert!(matches!(missing, Some(PersistenceError::NotFound { .. })));
        assert!(transaction_error(Vec::<(usize, String)>::new(), "d:wf:run").is_none());
    }
}
