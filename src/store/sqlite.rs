use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{QueueError, Result, StoreError};
use crate::queue::{Job, JobState, Run, RunOutcome};
use crate::store::{JobFilter, JobStore, MetricsSummary};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, timeout_secs, run_at_ms, \
                           last_error, created_at_ms, updated_at_ms, last_run_at_ms";

/// SQLite-backed store.
///
/// Claims run inside `BEGIN IMMEDIATE` transactions, so they are exclusive
/// both between workers of one process and between processes sharing the
/// database file.
#[derive(Debug)]
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            path,
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!(path = ?store.path, "Opened job store");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Store(StoreError::Poisoned))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              command TEXT NOT NULL,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL,
              timeout_secs REAL,
              run_at_ms INTEGER,
              last_error TEXT,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              last_run_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS jobs_ready_idx
              ON jobs(state, run_at_ms, created_at_ms);

            CREATE TABLE IF NOT EXISTS job_runs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id TEXT NOT NULL,
              attempt INTEGER NOT NULL,
              outcome TEXT NOT NULL,
              exit_code INTEGER,
              started_at_ms INTEGER NOT NULL,
              finished_at_ms INTEGER NOT NULL,
              output TEXT
            );

            CREATE INDEX IF NOT EXISTS job_runs_job_idx ON job_runs(job_id, id);

            CREATE TABLE IF NOT EXISTS config (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                JobRow::read,
            )
            .optional()?;
        row.map(Job::try_from).transpose()
    }
}

impl JobStore for SqliteStore {
    fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
               (id, command, state, attempts, max_retries, timeout_secs, run_at_ms,
                last_error, created_at_ms, updated_at_ms, last_run_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.command,
                job.state.as_str(),
                job.attempts,
                job.max_retries,
                job.timeout_secs,
                job.run_at.map(dt_to_ms),
                job.last_error,
                dt_to_ms(job.created_at),
                dt_to_ms(job.updated_at),
                job.last_run_at.map(dt_to_ms),
            ],
        )?;
        if inserted == 0 {
            return Err(QueueError::Validation(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        Self::fetch_job(&conn, id)
    }

    fn claim_next_ready_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let now_ms = dt_to_ms(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<(String, String)> = tx
            .query_row(
                "SELECT id, state FROM jobs
                 WHERE (state IN ('pending', 'scheduled')
                        OR (state = 'failed' AND attempts <= max_retries))
                   AND (run_at_ms IS NULL OR run_at_ms <= ?1)
                 ORDER BY created_at_ms ASC, rowid ASC
                 LIMIT 1",
                params![now_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, observed)) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE jobs SET state = 'processing', updated_at_ms = ?3
             WHERE id = ?1 AND state = ?2",
            params![id, observed, now_ms],
        )?;
        if claimed != 1 {
            return Ok(None);
        }

        let job = Self::fetch_job(&tx, &id)?;
        tx.commit()?;
        Ok(job)
    }

    fn update_job_state(&self, job: &Job, expected: JobState) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs
             SET state = ?3, attempts = ?4, run_at_ms = ?5, last_error = ?6, updated_at_ms = ?7
             WHERE id = ?1 AND state = ?2",
            params![
                job.id,
                expected.as_str(),
                job.state.as_str(),
                job.attempts,
                job.run_at.map(dt_to_ms),
                job.last_error,
                dt_to_ms(job.updated_at),
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![job.id], |row| {
                row.get(0)
            })
            .optional()?;
        Err(match current {
            Some(state) => QueueError::NotFound(format!(
                "job {} is {}, expected {}",
                job.id, state, expected
            )),
            None => QueueError::NotFound(format!("job {}", job.id)),
        })
    }

    fn record_run(&self, run: &Run) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO job_runs
               (job_id, attempt, outcome, exit_code, started_at_ms, finished_at_ms, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.job_id,
                run.attempt,
                run.outcome.as_str(),
                run.exit_code,
                dt_to_ms(run.started_at),
                dt_to_ms(run.finished_at),
                run.output,
            ],
        )?;
        tx.execute(
            "UPDATE jobs SET last_run_at_ms = ?2 WHERE id = ?1",
            params![run.job_id, dt_to_ms(run.finished_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR state = ?1)
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![filter.state.map(|s| s.as_str()), limit_param(filter.limit)],
            JobRow::read,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(Job::try_from(row?)?);
        }
        Ok(jobs)
    }

    fn counts_by_state(&self) -> Result<BTreeMap<JobState, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            counts.insert(parse_column::<JobState>(&state)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn list_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, attempt, outcome, exit_code, started_at_ms, finished_at_ms, output
             FROM job_runs
             WHERE (?1 IS NULL OR job_id = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_id, limit_param(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i32>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut runs = Vec::new();
        for row in rows {
            let (job_id, attempt, outcome, exit_code, started_at_ms, finished_at_ms, output) = row?;
            runs.push(Run {
                job_id,
                attempt: to_u32(attempt, "attempt")?,
                outcome: parse_column::<RunOutcome>(&outcome)?,
                exit_code,
                started_at: ms_to_dt(started_at_ms)?,
                finished_at: ms_to_dt(finished_at_ms)?,
                output,
            });
        }
        Ok(runs)
    }

    fn metrics(&self) -> Result<MetricsSummary> {
        let conn = self.lock()?;
        let (total_jobs, avg_attempts_per_job): (i64, Option<f64>) =
            conn.query_row("SELECT COUNT(*), AVG(attempts) FROM jobs", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        let (success_runs, failed_runs, timeout_runs): (i64, i64, i64) = conn.query_row(
            "SELECT
               COALESCE(SUM(outcome = 'success'), 0),
               COALESCE(SUM(outcome = 'failure'), 0),
               COALESCE(SUM(outcome = 'timeout'), 0)
             FROM job_runs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(MetricsSummary {
            total_jobs: total_jobs.max(0) as u64,
            success_runs: success_runs.max(0) as u64,
            failed_runs: failed_runs.max(0) as u64,
            timeout_runs: timeout_runs.max(0) as u64,
            avg_attempts_per_job,
        })
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// A `jobs` row as stored, before validation.
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    timeout_secs: Option<f64>,
    run_at_ms: Option<i64>,
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    last_run_at_ms: Option<i64>,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command: row.get(1)?,
            state: row.get(2)?,
            attempts: row.get(3)?,
            max_retries: row.get(4)?,
            timeout_secs: row.get(5)?,
            run_at_ms: row.get(6)?,
            last_error: row.get(7)?,
            created_at_ms: row.get(8)?,
            updated_at_ms: row.get(9)?,
            last_run_at_ms: row.get(10)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            state: parse_column(&row.state)?,
            attempts: to_u32(row.attempts, "attempts")?,
            max_retries: to_u32(row.max_retries, "max_retries")?,
            timeout_secs: row.timeout_secs,
            run_at: row.run_at_ms.map(ms_to_dt).transpose()?,
            last_error: row.last_error,
            created_at: ms_to_dt(row.created_at_ms)?,
            updated_at: ms_to_dt(row.updated_at_ms)?,
            last_run_at: row.last_run_at_ms.map(ms_to_dt).transpose()?,
            id: row.id,
            command: row.command,
        })
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")).into())
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")).into())
}

fn parse_column<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| StoreError::Corrupt(format!("unexpected value {raw:?}")).into())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
