//! Durable job store on Postgres.
//!
//! Every write path runs inside an explicit transaction opened by the
//! caller through [`Store::with_transaction`]; the per-job dense event-id
//! check makes replays and reorderings fail the transaction instead of
//! corrupting the log.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

use recodex_config::DatabaseConfig;
use recodex_model::{
    EventKind, Job, NotificationKind, Status, TaskEvent, TaskEvents, VocabularyError, Worker,
};

const SCHEMA: &str = include_str!("../schema.sql");
const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("element not found")]
    NotFound,

    #[error("job already exists for source path")]
    Conflict,

    #[error("event id gap for job {job_id}: expected {expected}, got {got}")]
    EventGap {
        job_id: Uuid,
        expected: i32,
        got: i32,
    },

    #[error("notification event missing kind, status, or job id")]
    IncompleteEvent,

    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source_path: String,
    destination_path: String,
}

#[derive(Debug, sqlx::FromRow)]
struct JobListRow {
    id: Uuid,
    source_path: String,
    destination_path: String,
    status: Option<String>,
    message: Option<String>,
    event_time: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    job_id: Uuid,
    job_event_id: i32,
    worker_name: String,
    event_time: chrono::DateTime<Utc>,
    event_type: String,
    notification_type: String,
    status: String,
    message: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    job_id: Uuid,
    job_event_id: i32,
    worker_name: String,
    event_time: chrono::DateTime<Utc>,
    notification_type: String,
    status: String,
    message: String,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    name: String,
    ip: String,
    queue_name: String,
    last_seen: chrono::DateTime<Utc>,
}

impl TryFrom<EventRow> for TaskEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(TaskEvent {
            id: Some(row.job_id),
            event_id: row.job_event_id,
            event_type: EventKind::from_str(&row.event_type)?,
            worker_name: row.worker_name,
            worker_queue: String::new(),
            event_time: row.event_time,
            ip: String::new(),
            notification_type: Some(NotificationKind::from_str(&row.notification_type)?),
            status: Some(Status::from_str(&row.status)?),
            message: row.message,
        })
    }
}

impl TryFrom<StatusRow> for TaskEvent {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(TaskEvent {
            id: Some(row.job_id),
            event_id: row.job_event_id,
            event_type: EventKind::Notification,
            worker_name: row.worker_name,
            worker_queue: String::new(),
            event_time: row.event_time,
            ip: String::new(),
            notification_type: Some(NotificationKind::from_str(&row.notification_type)?),
            status: Some(Status::from_str(&row.status)?),
            message: row.message,
        })
    }
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            name: row.name,
            ip: row.ip,
            queue_name: row.queue_name,
            last_seen: row.last_seen,
        }
    }
}

impl Store {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&config.connect_url())
            .await?;
        Ok(Self { pool })
    }

    /// Create tables and the status view. Safe to run on every startup.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        match sqlx::raw_sql(SCHEMA).execute(&mut *tx).await {
            Ok(_) => {
                tx.commit().await.map_err(StoreError::from)?;
                Ok(())
            }
            Err(err) => {
                let err = StoreError::from(err);
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, StoreError> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let mut conn = self.acquire().await?;
        get_job(&mut conn, id).await
    }

    pub async fn get_jobs(&self, page: u32, page_size: u32) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.acquire().await?;
        get_jobs(&mut conn, page, page_size).await
    }

    pub async fn get_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let mut conn = self.acquire().await?;
        get_workers(&mut conn).await
    }

    pub async fn get_worker(&self, name: &str) -> Result<Worker, StoreError> {
        let mut conn = self.acquire().await?;
        get_worker(&mut conn, name).await
    }

    pub async fn get_timeout_jobs(&self, timeout: Duration) -> Result<Vec<TaskEvent>, StoreError> {
        let mut conn = self.acquire().await?;
        get_timeout_jobs(&mut conn, timeout).await
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_transaction(|conn: &mut PgConnection| Box::pin(delete_job(conn, id)))
            .await
    }
}

/// Insert a new job row; an existing job for the same source path is a
/// conflict.
pub async fn add_job(conn: &mut PgConnection, job: &Job) -> Result<(), StoreError> {
    let result = sqlx::query(
        "INSERT INTO jobs (id, source_path, destination_path) VALUES ($1, $2, $3)",
    )
    .bind(job.id)
    .bind(&job.source_path)
    .bind(&job.destination_path)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict),
        Err(err) => Err(err.into()),
    }
}

/// Append an event, enforcing the dense per-job sequence: the new id must
/// be exactly `max(existing) + 1` (or 0 for the first event).
pub async fn add_event(conn: &mut PgConnection, event: &TaskEvent) -> Result<(), StoreError> {
    let job_id = event.id.ok_or(StoreError::IncompleteEvent)?;
    let (kind, status) = match (event.notification_type, event.status) {
        (Some(kind), Some(status)) => (kind, status),
        _ => return Err(StoreError::IncompleteEvent),
    };

    let last: Option<i32> =
        sqlx::query_scalar("SELECT max(job_event_id) FROM job_events WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&mut *conn)
            .await?;
    let expected = last.map_or(0, |id| id + 1);
    if event.event_id != expected {
        return Err(StoreError::EventGap {
            job_id,
            expected,
            got: event.event_id,
        });
    }

    sqlx::query(
        "INSERT INTO job_events \
         (job_id, job_event_id, worker_name, event_time, event_type, notification_type, status, message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(job_id)
    .bind(event.event_id)
    .bind(&event.worker_name)
    .bind(Utc::now())
    .bind(event.event_type.as_str())
    .bind(kind.as_str())
    .bind(status.as_str())
    .bind(&event.message)
    .execute(conn)
    .await?;
    Ok(())
}

/// Upsert a worker's liveness row.
pub async fn ping_upsert(
    conn: &mut PgConnection,
    name: &str,
    ip: &str,
    queue_name: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO workers (name, ip, queue_name, last_seen) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (name) DO UPDATE SET ip = $2, queue_name = $3, last_seen = $4",
    )
    .bind(name)
    .bind(ip)
    .bind(queue_name)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a decoded worker event: pings update liveness, notifications
/// append to the job's log.
pub async fn process_event(conn: &mut PgConnection, event: &TaskEvent) -> Result<(), StoreError> {
    match event.event_type {
        EventKind::Ping => {
            ping_upsert(conn, &event.worker_name, &event.ip, &event.worker_queue).await
        }
        EventKind::Notification => add_event(conn, event).await,
    }
}

pub async fn get_job(conn: &mut PgConnection, id: Uuid) -> Result<Job, StoreError> {
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let row = row.ok_or(StoreError::NotFound)?;
    hydrate_job(conn, row).await
}

pub async fn get_job_by_path(
    conn: &mut PgConnection,
    source_path: &str,
) -> Result<Option<Job>, StoreError> {
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE source_path = $1")
        .bind(source_path)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(hydrate_job(conn, row).await?)),
        None => Ok(None),
    }
}

async fn hydrate_job(conn: &mut PgConnection, row: JobRow) -> Result<Job, StoreError> {
    let events: Vec<EventRow> = sqlx::query_as(
        "SELECT * FROM job_events WHERE job_id = $1 ORDER BY job_event_id ASC",
    )
    .bind(row.id)
    .fetch_all(conn)
    .await?;

    let mut job = Job::new(row.id, row.source_path, row.destination_path);
    job.events = events
        .into_iter()
        .map(TaskEvent::try_from)
        .collect::<Result<TaskEvents, _>>()?;
    job.status = job.events.current_status();
    job.last_update = job.events.latest().map(|event| event.event_time);
    Ok(job)
}

/// One page of jobs with the denormalized latest `Job`-event columns.
pub async fn get_jobs(
    conn: &mut PgConnection,
    page: u32,
    page_size: u32,
) -> Result<Vec<Job>, StoreError> {
    let page = page.max(1);
    let offset = i64::from(page - 1) * i64::from(page_size);
    let rows: Vec<JobListRow> = sqlx::query_as(
        "SELECT j.id, j.source_path, j.destination_path, s.status, s.message, s.event_time \
         FROM jobs j LEFT JOIN job_status s ON s.job_id = j.id \
         ORDER BY s.event_time DESC NULLS LAST \
         LIMIT $1 OFFSET $2",
    )
    .bind(i64::from(page_size))
    .bind(offset)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            let mut job = Job::new(row.id, row.source_path, row.destination_path);
            job.status = row.status.as_deref().map(Status::from_str).transpose()?;
            job.status_message = row.message;
            job.last_update = row.event_time;
            Ok(job)
        })
        .collect()
}

pub async fn get_worker(conn: &mut PgConnection, name: &str) -> Result<Worker, StoreError> {
    let row: Option<WorkerRow> = sqlx::query_as("SELECT * FROM workers WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await?;
    row.map(Worker::from).ok_or(StoreError::NotFound)
}

pub async fn get_workers(conn: &mut PgConnection) -> Result<Vec<Worker>, StoreError> {
    let rows: Vec<WorkerRow> = sqlx::query_as("SELECT * FROM workers ORDER BY name")
        .fetch_all(conn)
        .await?;
    Ok(rows.into_iter().map(Worker::from).collect())
}

/// Latest `Job`-kind events of jobs still `progressing` past the timeout.
pub async fn get_timeout_jobs(
    conn: &mut PgConnection,
    timeout: Duration,
) -> Result<Vec<TaskEvent>, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(timeout.as_secs() as i64);
    let rows: Vec<StatusRow> = sqlx::query_as(
        "SELECT * FROM job_status WHERE status = 'progressing' AND event_time < $1",
    )
    .bind(cutoff)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(TaskEvent::try_from).collect()
}

pub async fn delete_job(conn: &mut PgConnection, id: Uuid) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM job_events WHERE job_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}
