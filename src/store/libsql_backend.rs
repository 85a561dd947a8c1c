//! libSQL backend: async `Database` trait implementation.
//!
//! All access goes through one connection behind a mutex so a transaction
//! never interleaves with statements from another task. Supports local file
//! and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::model::{ChatCompletionJob, ChatCompletionResult, ToolRun};
use crate::jobs::queue::JobKind;
use crate::runs::events::{EventName, EventPayload, RunEvent};
use crate::runs::model::{
    Assistant, Message, Run, RunStep, RunnerType, Thread, unix_now,
};
use crate::runs::state::{MessageStatus, RunStatus, StepStatus, SystemStatus, join_statuses};
use crate::store::batch::{RunBatch, WriteOp};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE constraint") {
            DatabaseError::Constraint(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Serialize an optional value into a nullable JSON column.
fn opt_json<T: serde::Serialize>(v: Option<&T>) -> Result<libsql::Value, DatabaseError> {
    Ok(match v {
        Some(v) => libsql::Value::Text(serde_json::to_string(v)?),
        None => libsql::Value::Null,
    })
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(
    s: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    match s {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: libsql::Transaction,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                debug!(error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

async fn begin(conn: &Connection) -> Result<libsql::Transaction, DatabaseError> {
    conn.transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))
}

// ── Row mapping ─────────────────────────────────────────────────────

const ASSISTANT_COLUMNS: &str = "id, created_at, name, model, instructions, tools";

const THREAD_COLUMNS: &str = "id, created_at, locked_by_run_id, metadata";

const MESSAGE_COLUMNS: &str =
    "id, created_at, thread_id, role, content, assistant_id, run_id, status, completed_at, incomplete_at";

const RUN_COLUMNS: &str = "id, created_at, thread_id, assistant_id, model, instructions, additional_instructions, tools, status, system_status, claimed_by, system_claimed_by, event_index, required_action, last_error, started_at, completed_at, cancelled_at, failed_at, expires_at";

const STEP_COLUMNS: &str = "id, created_at, run_id, thread_id, assistant_id, step_type, status, step_details, runner_type, last_error, completed_at, cancelled_at, failed_at, expired_at";

const TOOL_RUN_COLUMNS: &str = "id, created_at, run_id, step_id, tool_call_id, program, env, input, output, error, confirmed";

fn row_to_assistant(row: &libsql::Row) -> Result<Assistant, DatabaseError> {
    let tools: String = row.get(5).map_err(row_err)?;
    Ok(Assistant {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        model: row.get(3).map_err(row_err)?,
        instructions: row.get(4).map_err(row_err)?,
        tools: serde_json::from_str(&tools)?,
    })
}

fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let metadata: String = row.get(3).map_err(row_err)?;
    Ok(Thread {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        locked_by_run_id: row.get(2).map_err(row_err)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let role: String = row.get(3).map_err(row_err)?;
    let status: String = row.get(7).map_err(row_err)?;
    Ok(Message {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        thread_id: row.get(2).map_err(row_err)?,
        role: parse_enum(&role)?,
        content: row.get(4).map_err(row_err)?,
        assistant_id: row.get(5).map_err(row_err)?,
        run_id: row.get(6).map_err(row_err)?,
        status: parse_enum::<MessageStatus>(&status)?,
        completed_at: row.get(8).map_err(row_err)?,
        incomplete_at: row.get(9).map_err(row_err)?,
    })
}

fn row_to_run(row: &libsql::Row) -> Result<Run, DatabaseError> {
    let tools: String = row.get(7).map_err(row_err)?;
    let status: String = row.get(8).map_err(row_err)?;
    let system_status: Option<String> = row.get(9).map_err(row_err)?;
    Ok(Run {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        thread_id: row.get(2).map_err(row_err)?,
        assistant_id: row.get(3).map_err(row_err)?,
        model: row.get(4).map_err(row_err)?,
        instructions: row.get(5).map_err(row_err)?,
        additional_instructions: row.get(6).map_err(row_err)?,
        tools: serde_json::from_str(&tools)?,
        status: parse_enum::<RunStatus>(&status)?,
        system_status: system_status.as_deref().map(parse_enum::<SystemStatus>).transpose()?,
        claimed_by: row.get(10).map_err(row_err)?,
        system_claimed_by: row.get(11).map_err(row_err)?,
        event_index: row.get(12).map_err(row_err)?,
        required_action: parse_opt_json(row.get(13).map_err(row_err)?)?,
        last_error: parse_opt_json(row.get(14).map_err(row_err)?)?,
        started_at: row.get(15).map_err(row_err)?,
        completed_at: row.get(16).map_err(row_err)?,
        cancelled_at: row.get(17).map_err(row_err)?,
        failed_at: row.get(18).map_err(row_err)?,
        expires_at: row.get(19).map_err(row_err)?,
    })
}

fn row_to_step(row: &libsql::Row) -> Result<RunStep, DatabaseError> {
    let step_type: String = row.get(5).map_err(row_err)?;
    let status: String = row.get(6).map_err(row_err)?;
    let details: String = row.get(7).map_err(row_err)?;
    let runner_type: Option<String> = row.get(8).map_err(row_err)?;
    Ok(RunStep {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        run_id: row.get(2).map_err(row_err)?,
        thread_id: row.get(3).map_err(row_err)?,
        assistant_id: row.get(4).map_err(row_err)?,
        step_type: parse_enum(&step_type)?,
        status: parse_enum::<StepStatus>(&status)?,
        step_details: serde_json::from_str(&details)?,
        runner_type: runner_type.filter(|r| r == "tools").map(|_| RunnerType::Tools),
        last_error: parse_opt_json(row.get(9).map_err(row_err)?)?,
        completed_at: row.get(10).map_err(row_err)?,
        cancelled_at: row.get(11).map_err(row_err)?,
        failed_at: row.get(12).map_err(row_err)?,
        expired_at: row.get(13).map_err(row_err)?,
    })
}

fn row_to_event(row: &libsql::Row) -> Result<RunEvent, DatabaseError> {
    let payload: String = row.get(4).map_err(row_err)?;
    let done: i64 = row.get(5).map_err(row_err)?;
    Ok(RunEvent {
        request_id: row.get(0).map_err(row_err)?,
        response_idx: row.get(1).map_err(row_err)?,
        created_at: row.get(2).map_err(row_err)?,
        event_name: row.get(3).map_err(row_err)?,
        payload: serde_json::from_str::<EventPayload>(&payload)?,
        done: done != 0,
    })
}

fn row_to_tool_run(row: &libsql::Row) -> Result<ToolRun, DatabaseError> {
    let env: String = row.get(6).map_err(row_err)?;
    let confirmed: Option<i64> = row.get(10).map_err(row_err)?;
    Ok(ToolRun {
        id: row.get(0).map_err(row_err)?,
        created_at: row.get(1).map_err(row_err)?,
        run_id: row.get(2).map_err(row_err)?,
        step_id: row.get(3).map_err(row_err)?,
        tool_call_id: row.get(4).map_err(row_err)?,
        program: row.get(5).map_err(row_err)?,
        env: serde_json::from_str(&env)?,
        input: row.get(7).map_err(row_err)?,
        output: row.get(8).map_err(row_err)?,
        error: row.get(9).map_err(row_err)?,
        confirmed: confirmed.map(|v| v != 0),
    })
}

// ── Statements shared by transactions ───────────────────────────────

async fn get_run_in(conn: &Connection, id: &str) -> Result<Option<Run>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("get_run"))?;
    match rows.next().await.map_err(query_err("get_run"))? {
        Some(row) => Ok(Some(row_to_run(&row)?)),
        None => Ok(None),
    }
}

async fn get_thread_in(conn: &Connection, id: &str) -> Result<Option<Thread>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("get_thread"))?;
    match rows.next().await.map_err(query_err("get_thread"))? {
        Some(row) => Ok(Some(row_to_thread(&row)?)),
        None => Ok(None),
    }
}

async fn list_steps_in(conn: &Connection, run_id: &str) -> Result<Vec<RunStep>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            params![run_id],
        )
        .await
        .map_err(query_err("list_run_steps"))?;
    let mut steps = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("list_run_steps"))? {
        steps.push(row_to_step(&row)?);
    }
    Ok(steps)
}

async fn run_messages_in(
    conn: &Connection,
    run_id: &str,
    status: MessageStatus,
) -> Result<Vec<Message>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE run_id = ?1 AND status = ?2 ORDER BY created_at ASC, rowid ASC"
            ),
            params![run_id, status.as_str()],
        )
        .await
        .map_err(query_err("run_messages"))?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("run_messages"))? {
        messages.push(row_to_message(&row)?);
    }
    Ok(messages)
}

/// Claim one row of `kind` for `worker_id` inside the caller's transaction.
async fn dequeue_in(
    conn: &Connection,
    kind: JobKind,
    worker_id: &str,
) -> Result<Option<String>, DatabaseError> {
    let mut rows = conn
        .query(&kind.select_sql(), params![worker_id])
        .await
        .map_err(query_err("dequeue select"))?;
    let id: String = match rows.next().await.map_err(query_err("dequeue select"))? {
        Some(row) => row.get(0).map_err(row_err)?,
        None => return Ok(None),
    };
    drop(rows);

    conn.execute(&kind.claim_sql(), params![worker_id, id.as_str()])
        .await
        .map_err(query_err("dequeue claim"))?;
    Ok(Some(id))
}

/// The claimed run's thread must already be locked by that run.
async fn check_thread_lock(conn: &Connection, run: &Run) -> Result<(), DatabaseError> {
    let found = get_thread_in(conn, &run.thread_id)
        .await?
        .and_then(|t| t.locked_by_run_id);
    if found.as_deref() != Some(run.id.as_str()) {
        return Err(DatabaseError::LockMismatch {
            thread_id: run.thread_id.clone(),
            run_id: run.id.clone(),
            found,
        });
    }
    Ok(())
}

async fn put_run_in(conn: &Connection, run: &Run) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO runs (id, created_at, thread_id, assistant_id, model, instructions, additional_instructions, tools, status, system_status, claimed_by, system_claimed_by, required_action, last_error, started_at, completed_at, cancelled_at, failed_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(id) DO UPDATE SET
            model = excluded.model,
            instructions = excluded.instructions,
            additional_instructions = excluded.additional_instructions,
            tools = excluded.tools,
            status = excluded.status,
            system_status = excluded.system_status,
            claimed_by = excluded.claimed_by,
            system_claimed_by = excluded.system_claimed_by,
            required_action = excluded.required_action,
            last_error = excluded.last_error,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            cancelled_at = excluded.cancelled_at,
            failed_at = excluded.failed_at,
            expires_at = excluded.expires_at",
        params![
            run.id.as_str(),
            run.created_at,
            run.thread_id.as_str(),
            run.assistant_id.as_str(),
            run.model.as_str(),
            opt_text(run.instructions.as_deref()),
            opt_text(run.additional_instructions.as_deref()),
            serde_json::to_string(&run.tools)?,
            run.status.as_str(),
            opt_text(run.system_status.map(|s| s.as_str())),
            opt_text(run.claimed_by.as_deref()),
            opt_text(run.system_claimed_by.as_deref()),
            opt_json(run.required_action.as_ref())?,
            opt_json(run.last_error.as_ref())?,
            opt_int(run.started_at),
            opt_int(run.completed_at),
            opt_int(run.cancelled_at),
            opt_int(run.failed_at),
            opt_int(run.expires_at),
        ],
    )
    .await
    .map_err(query_err("put_run"))?;
    Ok(())
}

async fn put_step_in(conn: &Connection, step: &RunStep) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO run_steps (id, created_at, run_id, thread_id, assistant_id, step_type, status, step_details, runner_type, last_error, completed_at, cancelled_at, failed_at, expired_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            step_details = excluded.step_details,
            runner_type = excluded.runner_type,
            last_error = excluded.last_error,
            completed_at = excluded.completed_at,
            cancelled_at = excluded.cancelled_at,
            failed_at = excluded.failed_at,
            expired_at = excluded.expired_at",
        params![
            step.id.as_str(),
            step.created_at,
            step.run_id.as_str(),
            step.thread_id.as_str(),
            step.assistant_id.as_str(),
            step.step_type.as_str(),
            step.status.as_str(),
            serde_json::to_string(&step.step_details)?,
            opt_text(step.runner_type.map(|_| "tools")),
            opt_json(step.last_error.as_ref())?,
            opt_int(step.completed_at),
            opt_int(step.cancelled_at),
            opt_int(step.failed_at),
            opt_int(step.expired_at),
        ],
    )
    .await
    .map_err(query_err("put_step"))?;
    Ok(())
}

async fn put_message_in(conn: &Connection, message: &Message) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO messages (id, created_at, thread_id, role, content, assistant_id, run_id, status, completed_at, incomplete_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            status = excluded.status,
            completed_at = excluded.completed_at,
            incomplete_at = excluded.incomplete_at",
        params![
            message.id.as_str(),
            message.created_at,
            message.thread_id.as_str(),
            message.role.as_str(),
            message.content.as_str(),
            opt_text(message.assistant_id.as_deref()),
            opt_text(message.run_id.as_deref()),
            message.status.as_str(),
            opt_int(message.completed_at),
            opt_int(message.incomplete_at),
        ],
    )
    .await
    .map_err(query_err("put_message"))?;
    Ok(())
}

async fn lock_thread_in(conn: &Connection, thread_id: &str, run_id: &str) -> Result<(), DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE threads SET locked_by_run_id = ?2
             WHERE id = ?1 AND (locked_by_run_id IS NULL OR locked_by_run_id = ?2)",
            params![thread_id, run_id],
        )
        .await
        .map_err(query_err("lock_thread"))?;
    if changed > 0 {
        return Ok(());
    }
    match get_thread_in(conn, thread_id).await? {
        None => Err(DatabaseError::NotFound {
            entity: "thread".into(),
            id: thread_id.into(),
        }),
        Some(thread) => Err(DatabaseError::ThreadLocked {
            thread_id: thread_id.into(),
            locked_by: thread.locked_by_run_id.unwrap_or_default(),
        }),
    }
}

async fn unlock_thread_in(conn: &Connection, thread_id: &str, run_id: &str) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE threads SET locked_by_run_id = NULL WHERE id = ?1 AND locked_by_run_id = ?2",
            params![thread_id, run_id],
        )
        .await
        .map_err(query_err("unlock_thread"))?;
    Ok(changed > 0)
}

/// Bump the run's `event_index` and append the event at the new value.
async fn emit_in(
    conn: &Connection,
    run_id: &str,
    name: EventName,
    payload: &EventPayload,
) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(
            "UPDATE runs SET event_index = event_index + 1 WHERE id = ?1 RETURNING event_index",
            params![run_id],
        )
        .await
        .map_err(query_err("emit index"))?;
    let idx: i64 = match rows.next().await.map_err(query_err("emit index"))? {
        Some(row) => row.get(0).map_err(row_err)?,
        None => {
            return Err(DatabaseError::NotFound {
                entity: "run".into(),
                id: run_id.into(),
            });
        }
    };
    drop(rows);

    conn.execute(
        "INSERT INTO run_events (request_id, response_idx, created_at, event_name, payload, done)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            idx,
            unix_now(),
            name.as_str(),
            serde_json::to_string(payload)?,
            i64::from(name.is_done()),
        ],
    )
    .await
    .map_err(query_err("emit insert"))?;

    debug!(run_id, idx, event = name.as_str(), "Run event appended");
    Ok(idx)
}

async fn expect_status_in(
    conn: &Connection,
    run_id: &str,
    expected: &[RunStatus],
) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query("SELECT status FROM runs WHERE id = ?1", params![run_id])
        .await
        .map_err(query_err("expect_status"))?;
    let status: String = match rows.next().await.map_err(query_err("expect_status"))? {
        Some(row) => row.get(0).map_err(row_err)?,
        None => {
            return Err(DatabaseError::NotFound {
                entity: "run".into(),
                id: run_id.into(),
            });
        }
    };
    let current: RunStatus = parse_enum(&status)?;
    if expected.contains(&current) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTransition {
            entity: "run".into(),
            id: run_id.into(),
            status,
            expected: join_statuses(expected),
        })
    }
}

async fn apply_batch_in(conn: &Connection, batch: &RunBatch) -> Result<i64, DatabaseError> {
    let run_id = batch.run_id.as_str();
    let mut last_idx = 0;
    for op in &batch.ops {
        match op {
            WriteOp::ExpectRunStatus(expected) => expect_status_in(conn, run_id, expected).await?,
            WriteOp::PutRun(run) => put_run_in(conn, run).await?,
            WriteOp::PutStep(step) => put_step_in(conn, step).await?,
            WriteOp::PutMessage(message) => put_message_in(conn, message).await?,
            WriteOp::LockThread { thread_id } => lock_thread_in(conn, thread_id, run_id).await?,
            WriteOp::UnlockThread { thread_id } => {
                unlock_thread_in(conn, thread_id, run_id).await?;
            }
            WriteOp::Emit { name, payload } => {
                last_idx = emit_in(conn, run_id, *name, payload).await?;
            }
        }
    }
    Ok(last_idx)
}

async fn claim_run_in(conn: &Connection, worker_id: &str) -> Result<Option<Run>, DatabaseError> {
    let Some(id) = dequeue_in(conn, JobKind::Run, worker_id).await? else {
        return Ok(None);
    };
    let mut run = get_run_in(conn, &id).await?.ok_or_else(|| DatabaseError::NotFound {
        entity: "run".into(),
        id: id.clone(),
    })?;
    check_thread_lock(conn, &run).await?;

    let now = unix_now();
    run.status = RunStatus::InProgress;
    run.system_status = None;
    run.claimed_by = Some(worker_id.to_string());
    run.started_at.get_or_insert(now);

    let batch = RunBatch::new(&run.id).run_event(EventName::RunInProgress, &run);
    run.event_index = apply_batch_in(conn, &batch).await?;
    Ok(Some(run))
}

async fn claim_tool_step_in(conn: &Connection, worker_id: &str) -> Result<Option<Run>, DatabaseError> {
    let Some(id) = dequeue_in(conn, JobKind::RunToolStep, worker_id).await? else {
        return Ok(None);
    };
    let run = get_run_in(conn, &id).await?.ok_or_else(|| DatabaseError::NotFound {
        entity: "run".into(),
        id: id.clone(),
    })?;
    check_thread_lock(conn, &run).await?;
    Ok(Some(run))
}

async fn cancel_run_in(conn: &Connection, run_id: &str) -> Result<Run, DatabaseError> {
    let mut run = get_run_in(conn, run_id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "run".into(),
            id: run_id.into(),
        })?;
    let now = unix_now();
    let mut batch = RunBatch::new(run_id).expect_status(RunStatus::CANCELLABLE);

    for mut step in list_steps_in(conn, run_id).await? {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Cancelled;
            step.cancelled_at = Some(now);
            batch = batch.step_event(EventName::StepCancelled, &step);
        }
    }
    for mut message in run_messages_in(conn, run_id, MessageStatus::InProgress).await? {
        message.status = MessageStatus::Incomplete;
        message.incomplete_at = Some(now);
        batch = batch.message_event(EventName::MessageIncomplete, &message);
    }

    run.status = RunStatus::Cancelled;
    run.cancelled_at = Some(now);
    run.system_status = None;
    run.required_action = None;
    let batch = batch
        .run_event(EventName::RunCancelled, &run)
        .unlock_thread(&run.thread_id);
    run.event_index = apply_batch_in(conn, &batch).await?;
    Ok(run)
}

async fn expire_run_in(conn: &Connection, mut run: Run, now: i64) -> Result<(), DatabaseError> {
    let mut batch = RunBatch::new(&run.id)
        .expect_status(&[RunStatus::Queued, RunStatus::RequiresAction]);
    for mut step in list_steps_in(conn, &run.id).await? {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Expired;
            step.expired_at = Some(now);
            batch = batch.put_step(&step);
        }
    }
    run.status = RunStatus::Expired;
    run.system_status = None;
    run.required_action = None;
    let batch = batch
        .run_event(EventName::RunExpired, &run)
        .unlock_thread(&run.thread_id);
    apply_batch_in(conn, &batch).await?;
    Ok(())
}

async fn take_confirmation_in(conn: &Connection, id: &str) -> Result<Option<bool>, DatabaseError> {
    let mut rows = conn
        .query("SELECT confirmed FROM tool_runs WHERE id = ?1", params![id])
        .await
        .map_err(query_err("take_tool_confirmation"))?;
    let confirmed: Option<i64> = match rows
        .next()
        .await
        .map_err(query_err("take_tool_confirmation"))?
    {
        Some(row) => row.get(0).map_err(row_err)?,
        None => {
            return Err(DatabaseError::NotFound {
                entity: "tool_run".into(),
                id: id.into(),
            });
        }
    };
    drop(rows);

    let Some(value) = confirmed else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE tool_runs SET confirmed = NULL WHERE id = ?1",
        params![id],
    )
    .await
    .map_err(query_err("take_tool_confirmation"))?;
    Ok(Some(value != 0))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Assistants, threads, messages ───────────────────────────────

    async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO assistants (id, created_at, name, model, instructions, tools) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assistant.id.as_str(),
                assistant.created_at,
                opt_text(assistant.name.as_deref()),
                assistant.model.as_str(),
                opt_text(assistant.instructions.as_deref()),
                serde_json::to_string(&assistant.tools)?,
            ],
        )
        .await
        .map_err(query_err("insert_assistant"))?;
        Ok(())
    }

    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ASSISTANT_COLUMNS} FROM assistants WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_assistant"))?;
        match rows.next().await.map_err(query_err("get_assistant"))? {
            Some(row) => Ok(Some(row_to_assistant(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO threads (id, created_at, locked_by_run_id, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![
                thread.id.as_str(),
                thread.created_at,
                opt_text(thread.locked_by_run_id.as_deref()),
                serde_json::to_string(&thread.metadata)?,
            ],
        )
        .await
        .map_err(query_err("insert_thread"))?;
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, DatabaseError> {
        let conn = self.conn.lock().await;
        get_thread_in(&conn, id).await
    }

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = async {
            let thread = get_thread_in(&tx, &message.thread_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "thread".into(),
                    id: message.thread_id.clone(),
                })?;
            if let Some(locked_by) = thread.locked_by_run_id {
                return Err(DatabaseError::ThreadLocked {
                    thread_id: thread.id,
                    locked_by,
                });
            }
            put_message_in(&tx, message).await
        }
        .await;
        finish(tx, result).await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
                ),
                params![thread_id, limit as i64],
            )
            .await
            .map_err(query_err("list_messages"))?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_messages"))? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn get_run(&self, id: &str) -> Result<Option<Run>, DatabaseError> {
        let conn = self.conn.lock().await;
        get_run_in(&conn, id).await
    }

    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<RunStep>, DatabaseError> {
        let conn = self.conn.lock().await;
        list_steps_in(&conn, run_id).await
    }

    async fn list_thread_tool_steps(
        &self,
        thread_id: &str,
    ) -> Result<Vec<RunStep>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM run_steps
                     WHERE thread_id = ?1 AND step_type = 'tool_calls' AND status = 'completed'
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![thread_id],
            )
            .await
            .map_err(query_err("list_thread_tool_steps"))?;
        let mut steps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("list_thread_tool_steps"))?
        {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    async fn apply_run_batch(&self, batch: RunBatch) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = apply_batch_in(&tx, &batch).await;
        finish(tx, result).await
    }

    async fn cancel_run(&self, run_id: &str) -> Result<Run, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = cancel_run_in(&tx, run_id).await;
        finish(tx, result).await
    }

    async fn claim_run(&self, worker_id: &str) -> Result<Option<Run>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = claim_run_in(&tx, worker_id).await;
        finish(tx, result).await
    }

    async fn claim_run_tool_step(&self, worker_id: &str) -> Result<Option<Run>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = claim_tool_step_in(&tx, worker_id).await;
        finish(tx, result).await
    }

    async fn force_unlock_thread(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        unlock_thread_in(&conn, thread_id, run_id).await
    }

    async fn list_run_events(
        &self,
        run_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<RunEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT request_id, response_idx, created_at, event_name, payload, done
                 FROM run_events WHERE request_id = ?1 AND response_idx > ?2
                 ORDER BY response_idx ASC LIMIT ?3",
                params![run_id, after, limit as i64],
            )
            .await
            .map_err(query_err("list_run_events"))?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_run_events"))? {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn expire_runs(&self, now: i64) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE status IN ('queued', 'requires_action')
                       AND expires_at IS NOT NULL AND expires_at < ?1"
                ),
                params![now],
            )
            .await
            .map_err(query_err("expire_runs"))?;
        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("expire_runs"))? {
            due.push(row_to_run(&row)?);
        }
        drop(rows);

        let mut expired = Vec::new();
        for run in due {
            let run_id = run.id.clone();
            let tx = begin(&conn).await?;
            let result = expire_run_in(&tx, run, now).await;
            match finish(tx, result).await {
                Ok(()) => {
                    info!(run_id = %run_id, "Run expired");
                    expired.push(run_id);
                }
                Err(e) => debug!(run_id = %run_id, error = %e, "Run not expired"),
            }
        }
        Ok(expired)
    }

    // ── Job queue ───────────────────────────────────────────────────

    async fn dequeue(
        &self,
        kind: JobKind,
        worker_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = dequeue_in(&tx, kind, worker_id).await;
        finish(tx, result).await
    }

    async fn insert_chat_completion_request(
        &self,
        job: &ChatCompletionJob,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_completion_requests (id, created_at, claimed_by, done, response_id, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.as_str(),
                job.created_at,
                opt_text(job.claimed_by.as_deref()),
                i64::from(job.done),
                opt_text(job.response_id.as_deref()),
                serde_json::to_string(&job.body)?,
            ],
        )
        .await
        .map_err(query_err("insert_chat_completion_request"))?;
        Ok(())
    }

    async fn get_chat_completion_request(
        &self,
        id: &str,
    ) -> Result<Option<ChatCompletionJob>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, created_at, claimed_by, done, response_id, body FROM chat_completion_requests WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(query_err("get_chat_completion_request"))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(query_err("get_chat_completion_request"))?
        else {
            return Ok(None);
        };
        let done: i64 = row.get(3).map_err(row_err)?;
        let body: String = row.get(5).map_err(row_err)?;
        Ok(Some(ChatCompletionJob {
            id: row.get(0).map_err(row_err)?,
            created_at: row.get(1).map_err(row_err)?,
            claimed_by: row.get(2).map_err(row_err)?,
            done: done != 0,
            response_id: row.get(4).map_err(row_err)?,
            body: serde_json::from_str(&body)?,
        }))
    }

    async fn complete_chat_completion_request(
        &self,
        result: &ChatCompletionResult,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let outcome = async {
            tx.execute(
                "INSERT INTO chat_completion_responses (id, created_at, request_id, status_code, error, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    result.id.as_str(),
                    result.created_at,
                    result.request_id.as_str(),
                    i64::from(result.status_code),
                    opt_text(result.error.as_deref()),
                    opt_json(result.body.as_ref())?,
                ],
            )
            .await
            .map_err(query_err("insert_chat_completion_response"))?;
            let changed = tx
                .execute(
                    "UPDATE chat_completion_requests SET done = 1, response_id = ?2 WHERE id = ?1",
                    params![result.request_id.as_str(), result.id.as_str()],
                )
                .await
                .map_err(query_err("complete_chat_completion_request"))?;
            if changed == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "chat_completion_request".into(),
                    id: result.request_id.clone(),
                });
            }
            Ok(())
        }
        .await;
        finish(tx, outcome).await
    }

    async fn get_chat_completion_response(
        &self,
        request_id: &str,
    ) -> Result<Option<ChatCompletionResult>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, created_at, request_id, status_code, error, body FROM chat_completion_responses WHERE request_id = ?1",
                params![request_id],
            )
            .await
            .map_err(query_err("get_chat_completion_response"))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(query_err("get_chat_completion_response"))?
        else {
            return Ok(None);
        };
        let status_code: i64 = row.get(3).map_err(row_err)?;
        Ok(Some(ChatCompletionResult {
            id: row.get(0).map_err(row_err)?,
            created_at: row.get(1).map_err(row_err)?,
            request_id: row.get(2).map_err(row_err)?,
            status_code: u16::try_from(status_code).unwrap_or(500),
            error: row.get(4).map_err(row_err)?,
            body: parse_opt_json(row.get(5).map_err(row_err)?)?,
        }))
    }

    // ── Tool runs ───────────────────────────────────────────────────

    async fn ensure_tool_run(&self, tool_run: &ToolRun) -> Result<ToolRun, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO tool_runs (id, created_at, run_id, step_id, tool_call_id, program, env, input, output, error, confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                tool_run.id.as_str(),
                tool_run.created_at,
                tool_run.run_id.as_str(),
                tool_run.step_id.as_str(),
                tool_run.tool_call_id.as_str(),
                tool_run.program.as_str(),
                serde_json::to_string(&tool_run.env)?,
                tool_run.input.as_str(),
                opt_text(tool_run.output.as_deref()),
                opt_text(tool_run.error.as_deref()),
                opt_int(tool_run.confirmed.map(i64::from)),
            ],
        )
        .await
        .map_err(query_err("ensure_tool_run"))?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TOOL_RUN_COLUMNS} FROM tool_runs WHERE run_id = ?1 AND tool_call_id = ?2"
                ),
                params![tool_run.run_id.as_str(), tool_run.tool_call_id.as_str()],
            )
            .await
            .map_err(query_err("ensure_tool_run"))?;
        match rows.next().await.map_err(query_err("ensure_tool_run"))? {
            Some(row) => row_to_tool_run(&row),
            None => Err(DatabaseError::NotFound {
                entity: "tool_run".into(),
                id: tool_run.id.clone(),
            }),
        }
    }

    async fn finish_tool_run(
        &self,
        id: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tool_runs SET output = ?2, error = ?3 WHERE id = ?1",
            params![id, opt_text(output), opt_text(error)],
        )
        .await
        .map_err(query_err("finish_tool_run"))?;
        Ok(())
    }

    async fn set_tool_confirmation(
        &self,
        run_id: &str,
        tool_call_id: &str,
        approved: bool,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE tool_runs SET confirmed = ?3 WHERE run_id = ?1 AND tool_call_id = ?2",
                params![run_id, tool_call_id, i64::from(approved)],
            )
            .await
            .map_err(query_err("set_tool_confirmation"))?;
        Ok(changed > 0)
    }

    async fn take_tool_confirmation(
        &self,
        tool_run_id: &str,
    ) -> Result<Option<bool>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = take_confirmation_in(&tx, tool_run_id).await;
        finish(tx, result).await
    }

    // ── Retention ───────────────────────────────────────────────────

    async fn delete_expired_chat_completions(&self, cutoff: i64) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = async {
            tx.execute(
                "DELETE FROM chat_completion_requests WHERE id IN
                    (SELECT request_id FROM chat_completion_responses WHERE created_at < ?1)",
                params![cutoff],
            )
            .await
            .map_err(query_err("delete_expired_chat_requests"))?;
            let deleted = tx
                .execute(
                    "DELETE FROM chat_completion_responses WHERE created_at < ?1",
                    params![cutoff],
                )
                .await
                .map_err(query_err("delete_expired_chat_responses"))?;
            Ok(deleted as usize)
        }
        .await;
        finish(tx, result).await
    }

    async fn delete_expired_run_events(&self, cutoff: i64) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM run_events WHERE created_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(query_err("delete_expired_run_events"))?;
        Ok(deleted as usize)
    }

    async fn delete_expired_runs(&self, cutoff: i64) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;
        let result = async {
            let steps = tx
                .execute(
                    "DELETE FROM run_steps WHERE id IS NULL AND created_at < ?1",
                    params![cutoff],
                )
                .await
                .map_err(query_err("delete_expired_run_steps"))?;
            let runs = tx
                .execute(
                    "DELETE FROM runs WHERE id IS NULL AND created_at < ?1",
                    params![cutoff],
                )
                .await
                .map_err(query_err("delete_expired_runs"))?;
            Ok((steps + runs) as usize)
        }
        .await;
        finish(tx, result).await
    }
}
