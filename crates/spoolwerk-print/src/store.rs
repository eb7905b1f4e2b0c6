// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device and job repositories backed by SQLite.
//
// The store keeps device records and job metadata (but NOT the document
// bytes) in a local SQLite database.  Payloads live in the spool directory
// and are referenced by path and SHA-256 hash.  Job ids are integer
// autoincrement keys, so ascending id order is creation order.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument, warn};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{
    Device, DeviceId, Job, JobId, MacAddress, NewDevice, NewJob, TransportKind,
};

use crate::spool::SpooledPayload;

/// SQLite schema for both tables.
const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        alias TEXT NOT NULL UNIQUE COLLATE NOCASE,
        ip TEXT NOT NULL,
        port INTEGER,
        transport TEXT NOT NULL,
        mac TEXT,
        model TEXT,
        location TEXT,
        shared INTEGER NOT NULL DEFAULT 0,
        ipp_port INTEGER UNIQUE,
        device_uri TEXT
    );
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL REFERENCES devices(id),
        file_name TEXT NOT NULL,
        owner TEXT NOT NULL,
        spool_path TEXT,
        payload_hash TEXT,
        payload_len INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS jobs_by_device ON jobs (device_id, id);
"#;

const DEVICE_COLUMNS: &str =
    "id, alias, ip, port, transport, mac, model, location, shared, ipp_port, device_uri";

const JOB_COLUMNS: &str =
    "id, device_id, file_name, owner, spool_path, payload_hash, payload_len, created_at";

// ---------------------------------------------------------------------------
// Repository traits
// ---------------------------------------------------------------------------

/// Query shapes the print pipeline needs from device persistence.
///
/// Methods are synchronous; async callers run them on the blocking pool.
pub trait DeviceRepository: Send + Sync {
    fn create_device(&self, device: &NewDevice) -> Result<Device>;
    fn device(&self, id: DeviceId) -> Result<Option<Device>>;
    /// Case-insensitive alias lookup.
    fn device_by_alias(&self, alias: &str) -> Result<Option<Device>>;
    fn device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>>;
    /// All devices in ascending id order.
    fn list_devices(&self) -> Result<Vec<Device>>;
    /// Rewrite a device's address and endpoint string in one transaction.
    fn update_address(&self, id: DeviceId, ip: IpAddr, device_uri: &str) -> Result<()>;
    fn set_mac(&self, id: DeviceId, mac: Option<MacAddress>) -> Result<()>;
    /// Hand out (or return the existing) dedicated listening port.
    fn assign_ipp_port(&self, id: DeviceId, base_port: u16) -> Result<u16>;
    /// Delete a device and its job rows. Returns whether it existed.
    fn delete_device(&self, id: DeviceId) -> Result<bool>;

    /// The lowest-id device, which receives raw submissions on the shared
    /// port.
    fn default_device(&self) -> Result<Option<Device>> {
        Ok(self.list_devices()?.into_iter().next())
    }
}

/// Query shapes the print pipeline needs from job persistence.
pub trait JobRepository: Send + Sync {
    /// Insert a job and spool its payload as one unit.
    ///
    /// `spool` receives the allocated id and must put the payload in place,
    /// ideally by renaming an already written file since it runs under the
    /// store lock. If it fails, no job row survives.
    fn create_job(
        &self,
        job: &NewJob,
        spool: &mut dyn FnMut(JobId) -> Result<SpooledPayload>,
    ) -> Result<Job>;
    fn job(&self, id: JobId) -> Result<Option<Job>>;
    /// The lowest-id job queued for `device`.
    fn oldest_pending(&self, device: DeviceId) -> Result<Option<Job>>;
    /// Devices with at least one queued job, ascending.
    fn devices_with_jobs(&self) -> Result<Vec<DeviceId>>;
    fn jobs_for_device(&self, device: DeviceId) -> Result<Vec<Job>>;
    fn list_jobs(&self) -> Result<Vec<Job>>;
    /// Returns whether the row existed.
    fn delete_job(&self, id: JobId) -> Result<bool>;
    fn count_jobs(&self) -> Result<u64>;
}

/// Run a synchronous repository call on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SpoolwerkError::Database(format!("blocking task: {e}")))?
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// Device and job store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    ///
    /// Applies WAL journal mode and creates the tables if they do not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SpoolwerkError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SpoolwerkError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| SpoolwerkError::Database(format!("create tables: {e}")))?;

        info!("print store database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SpoolwerkError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| SpoolwerkError::Database(format!("create tables: {e}")))?;

        debug!("in-memory print store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SpoolwerkError::Database("connection lock poisoned".into()))
    }

    fn query_devices(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| SpoolwerkError::Database(format!("prepare devices: {e}")))?;
        let rows = stmt
            .query_map(args, row_to_device)
            .map_err(|e| SpoolwerkError::Database(format!("query devices: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolwerkError::Database(format!("collect rows: {e}")))?;
        Ok(rows)
    }

    fn query_jobs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| SpoolwerkError::Database(format!("prepare jobs: {e}")))?;
        let rows = stmt
            .query_map(args, row_to_job)
            .map_err(|e| SpoolwerkError::Database(format!("query jobs: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolwerkError::Database(format!("collect rows: {e}")))?;
        Ok(rows)
    }
}

impl DeviceRepository for SqliteStore {
    #[instrument(skip(self, device), fields(alias = %device.alias))]
    fn create_device(&self, device: &NewDevice) -> Result<Device> {
        let device_uri = Device::endpoint_for(device.transport, device.ip, device.port);
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO devices (alias, ip, port, transport, mac, model, location, shared, device_uri)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    device.alias,
                    device.ip.to_string(),
                    device.port,
                    device.transport.as_str(),
                    device.mac.map(|m| m.to_string()),
                    device.model,
                    device.location,
                    device.shared,
                    device_uri,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    SpoolwerkError::DuplicateAlias(device.alias.clone())
                }
                other => SpoolwerkError::Database(format!("insert device: {other}")),
            })?;
            DeviceId(conn.last_insert_rowid())
        };

        info!(device = %id, alias = %device.alias, ip = %device.ip, "device registered");
        self.device(id)?
            .ok_or_else(|| SpoolwerkError::DeviceNotFound(id.to_string()))
    }

    fn device(&self, id: DeviceId) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1");
        Ok(self.query_devices(&sql, params![id.0])?.into_iter().next())
    }

    fn device_by_alias(&self, alias: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE alias = ?1");
        Ok(self.query_devices(&sql, params![alias])?.into_iter().next())
    }

    fn device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE mac = ?1 ORDER BY id LIMIT 1");
        Ok(self
            .query_devices(&sql, params![mac.to_string()])?
            .into_iter()
            .next())
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id ASC");
        self.query_devices(&sql, [])
    }

    #[instrument(skip(self), fields(device = %id))]
    fn update_address(&self, id: DeviceId, ip: IpAddr, device_uri: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SpoolwerkError::Database(format!("begin: {e}")))?;

        let rows = tx
            .execute(
                "UPDATE devices SET ip = ?1, device_uri = ?2 WHERE id = ?3",
                params![ip.to_string(), device_uri, id.0],
            )
            .map_err(|e| SpoolwerkError::Database(format!("update address: {e}")))?;
        if rows == 0 {
            return Err(SpoolwerkError::DeviceNotFound(id.to_string()));
        }

        tx.commit()
            .map_err(|e| SpoolwerkError::Database(format!("commit address: {e}")))?;

        info!(device = %id, ip = %ip, uri = device_uri, "device address updated");
        Ok(())
    }

    fn set_mac(&self, id: DeviceId, mac: Option<MacAddress>) -> Result<()> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE devices SET mac = ?1 WHERE id = ?2",
                params![mac.map(|m| m.to_string()), id.0],
            )
            .map_err(|e| SpoolwerkError::Database(format!("set mac: {e}")))?;
        if rows == 0 {
            return Err(SpoolwerkError::DeviceNotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(device = %id))]
    fn assign_ipp_port(&self, id: DeviceId, base_port: u16) -> Result<u16> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SpoolwerkError::Database(format!("begin: {e}")))?;

        let existing: Option<Option<u16>> = tx
            .query_row(
                "SELECT ipp_port FROM devices WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SpoolwerkError::Database(format!("read ipp_port: {e}")))?;

        let port = match existing {
            None => return Err(SpoolwerkError::DeviceNotFound(id.to_string())),
            Some(Some(port)) => return Ok(port),
            Some(None) => {
                let max: Option<u16> = tx
                    .query_row("SELECT MAX(ipp_port) FROM devices", [], |row| row.get(0))
                    .map_err(|e| SpoolwerkError::Database(format!("max ipp_port: {e}")))?;
                match max {
                    Some(max) if max >= base_port => max.checked_add(1).ok_or_else(|| {
                        SpoolwerkError::Config("dedicated port range exhausted".into())
                    })?,
                    _ => base_port,
                }
            }
        };

        tx.execute(
            "UPDATE devices SET ipp_port = ?1 WHERE id = ?2",
            params![port, id.0],
        )
        .map_err(|e| SpoolwerkError::Database(format!("assign ipp_port: {e}")))?;
        tx.commit()
            .map_err(|e| SpoolwerkError::Database(format!("commit ipp_port: {e}")))?;

        info!(device = %id, port, "dedicated port assigned");
        Ok(port)
    }

    #[instrument(skip(self), fields(device = %id))]
    fn delete_device(&self, id: DeviceId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SpoolwerkError::Database(format!("begin: {e}")))?;
        tx.execute("DELETE FROM jobs WHERE device_id = ?1", params![id.0])
            .map_err(|e| SpoolwerkError::Database(format!("delete device jobs: {e}")))?;
        let rows = tx
            .execute("DELETE FROM devices WHERE id = ?1", params![id.0])
            .map_err(|e| SpoolwerkError::Database(format!("delete device: {e}")))?;
        tx.commit()
            .map_err(|e| SpoolwerkError::Database(format!("commit delete: {e}")))?;

        if rows > 0 {
            info!(device = %id, "device deleted");
        }
        Ok(rows > 0)
    }
}

impl JobRepository for SqliteStore {
    #[instrument(skip(self, job, spool), fields(device = %job.device_id, file = %job.file_name))]
    fn create_job(
        &self,
        job: &NewJob,
        spool: &mut dyn FnMut(JobId) -> Result<SpooledPayload>,
    ) -> Result<Job> {
        let created_at = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SpoolwerkError::Database(format!("begin: {e}")))?;

        tx.execute(
            "INSERT INTO jobs (device_id, file_name, owner, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                job.device_id.0,
                job.file_name,
                job.owner,
                created_at.to_rfc3339()
            ],
        )
        .map_err(|e| SpoolwerkError::Database(format!("insert job: {e}")))?;
        let id = JobId(tx.last_insert_rowid());

        // Dropping `tx` on any early return rolls the insert back.
        let payload = spool(id)?;

        let recorded = tx
            .execute(
                "UPDATE jobs SET spool_path = ?1, payload_hash = ?2, payload_len = ?3 WHERE id = ?4",
                params![
                    payload.path.to_string_lossy().into_owned(),
                    payload.sha256,
                    payload.len as i64,
                    id.0
                ],
            )
            .map_err(|e| SpoolwerkError::Database(format!("record spool path: {e}")))
            .and_then(|_| {
                tx.commit()
                    .map_err(|e| SpoolwerkError::Database(format!("commit job: {e}")))
            });
        if let Err(e) = recorded {
            if let Err(rm) = std::fs::remove_file(&payload.path) {
                warn!(job_id = %id, error = %rm, "orphaned spool file after failed insert");
            }
            return Err(e);
        }

        info!(job_id = %id, device = %job.device_id, bytes = payload.len, "job queued");
        Ok(Job {
            id,
            device_id: job.device_id,
            file_name: job.file_name.clone(),
            owner: job.owner.clone(),
            spool_path: Some(payload.path),
            payload_hash: Some(payload.sha256),
            payload_len: payload.len,
            created_at,
        })
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        Ok(self.query_jobs(&sql, params![id.0])?.into_iter().next())
    }

    fn oldest_pending(&self, device: DeviceId) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE device_id = ?1 ORDER BY id ASC LIMIT 1"
        );
        Ok(self.query_jobs(&sql, params![device.0])?.into_iter().next())
    }

    fn devices_with_jobs(&self) -> Result<Vec<DeviceId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT device_id FROM jobs ORDER BY device_id ASC")
            .map_err(|e| SpoolwerkError::Database(format!("prepare devices_with_jobs: {e}")))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(DeviceId))
            .map_err(|e| SpoolwerkError::Database(format!("query devices_with_jobs: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolwerkError::Database(format!("collect rows: {e}")))?;
        Ok(ids)
    }

    fn jobs_for_device(&self, device: DeviceId) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE device_id = ?1 ORDER BY id ASC");
        self.query_jobs(&sql, params![device.0])
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC");
        self.query_jobs(&sql, [])
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn delete_job(&self, id: JobId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.0])
            .map_err(|e| SpoolwerkError::Database(format!("delete job: {e}")))?;
        debug!(job_id = %id, existed = rows > 0, "job row deleted");
        Ok(rows > 0)
    }

    fn count_jobs(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .map_err(|e| SpoolwerkError::Database(format!("count jobs: {e}")))?;
        Ok(count.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

/// Map a SQLite row to a `Device`. Column order follows `DEVICE_COLUMNS`.
fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let ip_str: String = row.get(2)?;
    let transport_str: String = row.get(4)?;
    let mac_str: Option<String> = row.get(5)?;

    let ip: IpAddr = ip_str.parse().map_err(|e| conversion_error(2, e))?;
    let transport: TransportKind = transport_str.parse().map_err(|e| conversion_error(4, e))?;
    let mac = mac_str
        .map(|s| s.parse::<MacAddress>())
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    Ok(Device {
        id: DeviceId(row.get(0)?),
        alias: row.get(1)?,
        ip,
        port: row.get(3)?,
        transport,
        mac,
        model: row.get(6)?,
        location: row.get(7)?,
        shared: row.get(8)?,
        ipp_port: row.get(9)?,
        device_uri: row.get(10)?,
    })
}

/// Map a SQLite row to a `Job`. Column order follows `JOB_COLUMNS`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let spool_path: Option<String> = row.get(4)?;
    let created_at_str: String = row.get(7)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(7, e))?;

    Ok(Job {
        id: JobId(row.get(0)?),
        device_id: DeviceId(row.get(1)?),
        file_name: row.get(2)?,
        owner: row.get(3)?,
        spool_path: spool_path.map(PathBuf::from),
        payload_hash: row.get(5)?,
        payload_len: row.get::<_, i64>(6)?.max(0) as u64,
        created_at,
    })
}
