use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;

use super::{check_transition, Ledger, LogEntry, LogStatus, NewLogEntry, Vehicle};
use crate::error::IngestError;
use crate::{open_db_connection, shared_memory_uri};

/// Attempts at allocating a sequence number before giving up. Another writer can
/// only win the race between our read and insert if it bypassed the immediate
/// transaction, so this only matters for foreign writers.
const MAX_ALLOC_ATTEMPTS: usize = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const ENTRY_COLUMNS: &str = "id, unit_number, sequence, start_time, end_time, length_secs, samples, \
     content_hash, status, original_file_name, upload_time";

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open (and create) the ledger. `:memory:` maps to a private shared-cache URI.
    pub fn open(db_path: &str) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_db_connection(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS vehicle (
              unit_number TEXT PRIMARY KEY,
              vehicle_type TEXT NOT NULL,
              serial_number TEXT,
              status TEXT
            );

            CREATE TABLE IF NOT EXISTS log_file (
              id TEXT PRIMARY KEY,
              unit_number TEXT NOT NULL,
              sequence INTEGER NOT NULL,
              start_time TEXT NOT NULL,
              end_time TEXT,
              length_secs REAL,
              samples INTEGER,
              content_hash TEXT,
              status TEXT NOT NULL,
              original_file_name TEXT NOT NULL DEFAULT '',
              upload_time TEXT NOT NULL,
              UNIQUE (unit_number, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_log_file_hash ON log_file(unit_number, content_hash);
            CREATE INDEX IF NOT EXISTS idx_log_file_original ON log_file(original_file_name);
            CREATE INDEX IF NOT EXISTS idx_log_file_status ON log_file(status);
            "#,
        )?;
        Ok(())
    }

    fn query_entries(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<LogEntry>> {
        let sql = format!("SELECT {} FROM log_file {}", ENTRY_COLUMNS, clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = {
            let mut rows = stmt.query(args)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(EntryRow::from_row(row)?);
            }
            out
        };
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    fn query_entry(&self, clause: &str, args: impl rusqlite::Params) -> Result<Option<LogEntry>> {
        Ok(self.query_entries(clause, args)?.into_iter().next())
    }

    fn expect_updated(id: &str, changed: usize) -> Result<()> {
        if changed == 0 {
            return Err(IngestError::UnknownEntry(id.to_string()).into());
        }
        Ok(())
    }
}

impl Ledger for SqliteLedger {
    fn find_by_hash(&mut self, hash: &str, unit_number: &str) -> Result<Option<LogEntry>> {
        self.query_entry(
            "WHERE unit_number = ?1 AND content_hash = ?2 ORDER BY sequence ASC LIMIT 1",
            params![unit_number, hash],
        )
    }

    fn create_with_id(&mut self, id: &str, entry: NewLogEntry<'_>) -> Result<LogEntry> {
        let upload_time = Utc::now();
        for attempt in 1..=MAX_ALLOC_ATTEMPTS {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: Option<String> = tx
                .query_row("SELECT id FROM log_file WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(IngestError::AlreadyAccepted(id.to_string()).into());
            }
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM log_file WHERE unit_number = ?1",
                params![entry.unit_number],
                |row| row.get(0),
            )?;
            let inserted = tx.execute(
                r#"
                INSERT INTO log_file(id, unit_number, sequence, start_time, content_hash,
                                     status, original_file_name, upload_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    id,
                    entry.unit_number,
                    next,
                    format_time(entry.start_time),
                    entry.content_hash,
                    entry.status.as_str(),
                    entry.original_file_name,
                    format_time(upload_time),
                ],
            );
            match inserted {
                Ok(_) => {
                    tx.commit()?;
                    log::debug!(
                        "allocated sequence {} for unit {} (entry {})",
                        next,
                        entry.unit_number,
                        id
                    );
                    return self
                        .get(id)?
                        .ok_or_else(|| anyhow!("entry {} vanished after insert", id));
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    log::debug!(
                        "sequence {} for unit {} taken, retrying (attempt {})",
                        next,
                        entry.unit_number,
                        attempt
                    );
                    drop(tx);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!(
            "could not allocate a sequence number for unit {} after {} attempts",
            entry.unit_number,
            MAX_ALLOC_ATTEMPTS
        ))
    }

    fn update_status(&mut self, id: &str, status: LogStatus) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM log_file WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(IngestError::UnknownEntry(id.to_string()).into());
        };
        check_transition(id, current.parse()?, status)?;
        tx.execute(
            "UPDATE log_file SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_length(&mut self, id: &str, length_secs: f64, samples: u64) -> Result<()> {
        let samples = i64::try_from(samples).map_err(|_| anyhow!("sample count exceeds i64"))?;
        let changed = self.conn.execute(
            "UPDATE log_file SET length_secs = ?1, samples = ?2 WHERE id = ?3",
            params![length_secs, samples, id],
        )?;
        Self::expect_updated(id, changed)
    }

    fn update_end_time(&mut self, id: &str, end_time: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE log_file SET end_time = ?1 WHERE id = ?2",
            params![format_time(end_time), id],
        )?;
        Self::expect_updated(id, changed)
    }

    fn get(&mut self, id: &str) -> Result<Option<LogEntry>> {
        self.query_entry("WHERE id = ?1", params![id])
    }

    fn find_by_original_name(
        &mut self,
        unit_number: Option<&str>,
        original_file_name: &str,
    ) -> Result<Option<LogEntry>> {
        self.query_entry(
            "WHERE original_file_name = ?1 AND (?2 IS NULL OR unit_number = ?2) \
             ORDER BY upload_time DESC LIMIT 1",
            params![original_file_name, unit_number],
        )
    }

    fn bind_content(&mut self, id: &str, start_time: DateTime<Utc>, hash: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE log_file SET start_time = ?1, content_hash = ?2 WHERE id = ?3",
            params![format_time(start_time), hash, id],
        )?;
        Self::expect_updated(id, changed)
    }

    fn entries_for_unit(&mut self, unit_number: &str) -> Result<Vec<LogEntry>> {
        self.query_entries(
            "WHERE unit_number = ?1 ORDER BY sequence ASC",
            params![unit_number],
        )
    }

    fn entries_with_status(&mut self, status: LogStatus) -> Result<Vec<LogEntry>> {
        self.query_entries(
            "WHERE status = ?1 ORDER BY unit_number ASC, sequence ASC",
            params![status.as_str()],
        )
    }

    fn ensure_vehicle(&mut self, unit_number: &str, vehicle_type: &str) -> Result<Vehicle> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO vehicle(unit_number, vehicle_type) VALUES (?1, ?2)",
            params![unit_number, vehicle_type],
        )?;
        if inserted > 0 {
            log::info!("registered vehicle {} ({})", unit_number, vehicle_type);
        }
        self.vehicle(unit_number)?
            .ok_or_else(|| anyhow!("vehicle {} missing after insert", unit_number))
    }

    fn vehicle(&mut self, unit_number: &str) -> Result<Option<Vehicle>> {
        let vehicle = self
            .conn
            .query_row(
                "SELECT unit_number, vehicle_type, serial_number, status FROM vehicle WHERE unit_number = ?1",
                params![unit_number],
                |row| {
                    Ok(Vehicle {
                        unit_number: row.get(0)?,
                        vehicle_type: row.get(1)?,
                        serial_number: row.get(2)?,
                        status: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(vehicle)
    }
}

/// Column values as stored, converted to a `LogEntry` outside the row borrow.
struct EntryRow {
    id: String,
    unit_number: String,
    sequence: i64,
    start_time: String,
    end_time: Option<String>,
    length_secs: Option<f64>,
    samples: Option<i64>,
    content_hash: Option<String>,
    status: String,
    original_file_name: String,
    upload_time: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            unit_number: row.get(1)?,
            sequence: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            length_secs: row.get(5)?,
            samples: row.get(6)?,
            content_hash: row.get(7)?,
            status: row.get(8)?,
            original_file_name: row.get(9)?,
            upload_time: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            sequence: u32::try_from(self.sequence)
                .map_err(|_| anyhow!("corrupt ledger: sequence {} of {}", self.sequence, self.id))?,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            length_secs: self.length_secs,
            samples: self
                .samples
                .map(|n| u64::try_from(n).map_err(|_| anyhow!("corrupt ledger: samples {}", n)))
                .transpose()?,
            content_hash: self.content_hash,
            status: self.status.parse()?,
            original_file_name: self.original_file_name,
            upload_time: parse_time(&self.upload_time)?,
            id: self.id,
            unit_number: self.unit_number,
        })
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow!("corrupt ledger timestamp {:?}: {}", raw, e))?
        .with_timezone(&Utc))
}
