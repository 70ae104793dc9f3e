//! Durable SQLite store for wake-protocol state.
//!
//! # Schema
//! - `wake_events`: one row per device wake attempt, append-only.
//! - `image_transfers`: reassembly tracking, keyed (device_id, artifact_name).
//! - `fragments`: raw fragment bytes, keyed (device_id, artifact_name, frag_index).
//! - `device_state`: schedule expression, last/next wake, last-seen telemetry.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Idempotency
//! Fragment writes are `INSERT OR IGNORE`: a second write with the same key
//! is a no-op, which is what makes transport redelivery safe.  `clear_fragments`
//! is the sole finalize guard: once cleared, a second finalize pass finds
//! nothing to assemble.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::str::FromStr;

use crate::state_machine::ProtocolState;
use wake_protocol::{TelemetryReadings, failure_codes};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A wake event retrieved from the store.
#[derive(Debug, Clone)]
pub struct WakeEventRow {
    pub wake_id: i64,
    pub device_id: String,
    pub artifact_name: Option<String>,
    pub state: ProtocolState,
    pub images_requested: i64,
    pub images_completed: i64,
    pub ack_sent_at: Option<String>,
    pub capture_requested_at: Option<String>,
    pub sleep_issued_at: Option<String>,
    pub is_complete: bool,
    pub failure_code: Option<String>,
    pub created_at: String,
}

/// Lifecycle status of an image transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Receiving,
    Complete,
    Failed,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Receiving => "receiving",
            TransferStatus::Complete => "complete",
            TransferStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        match s {
            "receiving" => Ok(TransferStatus::Receiving),
            "complete" => Ok(TransferStatus::Complete),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(StoreError::InvalidData(format!(
                "unknown transfer status '{other}'"
            ))),
        }
    }
}

/// An image transfer retrieved from the store.
#[derive(Debug, Clone)]
pub struct TransferRow {
    pub device_id: String,
    pub artifact_name: String,
    pub wake_id: Option<i64>,
    pub declared_total: i64,
    pub received_count: i64,
    pub status: TransferStatus,
    pub failure_code: Option<String>,
    pub storage_location: Option<String>,
    pub created_at: String,
}

/// Device-level schedule and telemetry state.
#[derive(Debug, Clone)]
pub struct DeviceStateRow {
    pub device_id: String,
    pub schedule_expr: Option<String>,
    pub last_wake_at: Option<DateTime<Utc>>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub gas_resistance: Option<f64>,
}

/// A transfer abandoned by the TTL sweep.
///
/// Returned exactly once: the sweep flips the row to `failed` in the same
/// pass, so later passes do not see it again.
#[derive(Debug, Clone)]
pub struct ExpiredTransfer {
    pub device_id: String,
    pub artifact_name: String,
    pub wake_id: Option<i64>,
}

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("fragment {index} absent while assembling '{artifact}'")]
    MissingFragment { artifact: String, index: u32 },
}

// ---------------------------------------------------------------------------
// WakeStore
// ---------------------------------------------------------------------------

/// The durable store backing the wake-protocol engine.
///
/// All protocol state lives here; a restart mid-transfer must not lose dedup
/// guarantees, so there is no process-local cache in front of this store.
pub struct WakeStore {
    conn: Connection,
}

impl WakeStore {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(WakeStore { conn })
    }

    // -----------------------------------------------------------------------
    // Wake events
    // -----------------------------------------------------------------------

    /// Create a wake event in `hello_received` and return its id.
    pub fn create_wake_event(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO wake_events (device_id, state, created_at) VALUES (?1, ?2, ?3)",
            params![
                device_id,
                ProtocolState::HelloReceived.as_str(),
                fmt_ts(now)
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Fetch a wake event by id.
    pub fn wake_event(&self, wake_id: i64) -> Result<Option<WakeEventRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT wake_id, device_id, artifact_name, state, images_requested,
                        images_completed, ack_sent_at, capture_requested_at,
                        sleep_issued_at, is_complete, failure_code, created_at
                 FROM wake_events WHERE wake_id = ?1",
                params![wake_id],
                map_wake_event,
            )
            .optional()?;
        row.map(parse_wake_event).transpose()
    }

    /// The most recent wake event for a device that has not reached a
    /// terminal state.
    pub fn latest_open_wake(&self, device_id: &str) -> Result<Option<WakeEventRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT wake_id, device_id, artifact_name, state, images_requested,
                        images_completed, ack_sent_at, capture_requested_at,
                        sleep_issued_at, is_complete, failure_code, created_at
                 FROM wake_events
                 WHERE device_id = ?1 AND state NOT IN ('complete', 'sleep_only', 'failed')
                 ORDER BY wake_id DESC LIMIT 1",
                params![device_id],
                map_wake_event,
            )
            .optional()?;
        row.map(parse_wake_event).transpose()
    }

    /// The wake event that requested a given artifact, if any.
    pub fn find_wake_for_artifact(
        &self,
        device_id: &str,
        artifact_name: &str,
    ) -> Result<Option<WakeEventRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT wake_id, device_id, artifact_name, state, images_requested,
                        images_completed, ack_sent_at, capture_requested_at,
                        sleep_issued_at, is_complete, failure_code, created_at
                 FROM wake_events
                 WHERE device_id = ?1 AND artifact_name = ?2
                 ORDER BY wake_id DESC LIMIT 1",
                params![device_id, artifact_name],
                map_wake_event,
            )
            .optional()?;
        row.map(parse_wake_event).transpose()
    }

    /// Persist a state transition.  Legality is checked by the caller via
    /// [`ProtocolState::advance`]; the store records whatever it is given.
    pub fn set_wake_state(&mut self, wake_id: i64, state: ProtocolState) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events SET state = ?2 WHERE wake_id = ?1",
            params![wake_id, state.as_str()],
        )?;
        Ok(())
    }

    pub fn set_wake_artifact(&mut self, wake_id: i64, artifact_name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events SET artifact_name = ?2 WHERE wake_id = ?1",
            params![wake_id, artifact_name],
        )?;
        Ok(())
    }

    pub fn mark_ack_sent(&mut self, wake_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events SET ack_sent_at = ?2 WHERE wake_id = ?1",
            params![wake_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub fn mark_capture_requested(
        &mut self,
        wake_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events
             SET capture_requested_at = ?2, images_requested = images_requested + 1
             WHERE wake_id = ?1",
            params![wake_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub fn mark_sleep_issued(&mut self, wake_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events SET sleep_issued_at = ?2 WHERE wake_id = ?1",
            params![wake_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub fn mark_wake_complete(&mut self, wake_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events
             SET is_complete = 1, images_completed = images_completed + 1
             WHERE wake_id = ?1",
            params![wake_id],
        )?;
        Ok(())
    }

    pub fn set_wake_failure(&mut self, wake_id: i64, code: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE wake_events SET failure_code = ?2 WHERE wake_id = ?1",
            params![wake_id, code],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Image transfers
    // -----------------------------------------------------------------------

    /// Create the transfer for (device, artifact), or reuse the existing row.
    ///
    /// Metadata redelivery for an in-flight transfer must not create a
    /// duplicate; the composite primary key plus `INSERT OR IGNORE` enforces
    /// that structurally.  Returns the row and whether this call created it.
    pub fn create_or_get_transfer(
        &mut self,
        device_id: &str,
        artifact_name: &str,
        declared_total: u32,
        wake_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(TransferRow, bool), StoreError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO image_transfers
                 (device_id, artifact_name, wake_id, declared_total, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device_id,
                artifact_name,
                wake_id,
                i64::from(declared_total),
                fmt_ts(now)
            ],
        )?;
        if inserted == 0 {
            // Redelivered metadata may correct the declared total while the
            // transfer is still receiving.
            self.conn.execute(
                "UPDATE image_transfers
                 SET declared_total = ?3, wake_id = COALESCE(wake_id, ?4)
                 WHERE device_id = ?1 AND artifact_name = ?2 AND status = 'receiving'",
                params![
                    device_id,
                    artifact_name,
                    i64::from(declared_total),
                    wake_id
                ],
            )?;
        } else {
            // Fragments may have outrun the metadata; pick up any already
            // stored for this key.
            self.conn.execute(
                "UPDATE image_transfers
                 SET received_count = (SELECT COUNT(*) FROM fragments
                                       WHERE device_id = ?1 AND artifact_name = ?2)
                 WHERE device_id = ?1 AND artifact_name = ?2",
                params![device_id, artifact_name],
            )?;
        }
        let row = self
            .transfer(device_id, artifact_name)?
            .ok_or_else(|| StoreError::InvalidData("transfer vanished after insert".to_owned()))?;
        Ok((row, inserted > 0))
    }

    /// Fetch a transfer by key.
    pub fn transfer(
        &self,
        device_id: &str,
        artifact_name: &str,
    ) -> Result<Option<TransferRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT device_id, artifact_name, wake_id, declared_total, received_count,
                        status, failure_code, storage_location, created_at
                 FROM image_transfers WHERE device_id = ?1 AND artifact_name = ?2",
                params![device_id, artifact_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(device_id, artifact_name, wake_id, declared_total, received_count, status, failure_code, storage_location, created_at)| {
                Ok(TransferRow {
                    device_id,
                    artifact_name,
                    wake_id,
                    declared_total,
                    received_count,
                    status: status.parse()?,
                    failure_code,
                    storage_location,
                    created_at,
                })
            },
        )
        .transpose()
    }

    pub fn set_transfer_status(
        &mut self,
        device_id: &str,
        artifact_name: &str,
        status: TransferStatus,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE image_transfers SET status = ?3
             WHERE device_id = ?1 AND artifact_name = ?2",
            params![device_id, artifact_name, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_transfer_location(
        &mut self,
        device_id: &str,
        artifact_name: &str,
        location: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE image_transfers SET storage_location = ?3
             WHERE device_id = ?1 AND artifact_name = ?2",
            params![device_id, artifact_name, location],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fragments
    // -----------------------------------------------------------------------

    /// Write-if-absent fragment storage.
    ///
    /// Returns whether this call newly stored data.  The return value is for
    /// logging only; behavior is identical either way.
    pub fn store_fragment(
        &mut self,
        device_id: &str,
        artifact_name: &str,
        frag_index: u32,
        bytes: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidData(
                "fragment bytes must not be empty".to_owned(),
            ));
        }
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO fragments
                 (device_id, artifact_name, frag_index, bytes, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device_id,
                artifact_name,
                i64::from(frag_index),
                bytes,
                fmt_ts(expires_at)
            ],
        )?;
        if inserted > 0 {
            // Keep the transfer's received counter in lockstep with the
            // distinct-index count, whichever order metadata and fragments
            // arrive in.
            self.conn.execute(
                "UPDATE image_transfers
                 SET received_count = (SELECT COUNT(*) FROM fragments
                                       WHERE device_id = ?1 AND artifact_name = ?2)
                 WHERE device_id = ?1 AND artifact_name = ?2",
                params![device_id, artifact_name],
            )?;
        }
        Ok(inserted > 0)
    }

    /// Count of distinct stored fragment indices for an artifact.
    pub fn stored_fragment_count(
        &self,
        device_id: &str,
        artifact_name: &str,
    ) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fragments WHERE device_id = ?1 AND artifact_name = ?2",
            params![device_id, artifact_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// True iff the count of distinct stored indices equals `declared_total`.
    pub fn is_complete(
        &self,
        device_id: &str,
        artifact_name: &str,
        declared_total: u32,
    ) -> Result<bool, StoreError> {
        Ok(self.stored_fragment_count(device_id, artifact_name)? == i64::from(declared_total))
    }

    /// Ascending list of indices in `[0, declared_total)` not yet stored.
    ///
    /// Used to build a single targeted retransmission request, never a
    /// full-image restart.
    pub fn missing_indices(
        &self,
        device_id: &str,
        artifact_name: &str,
        declared_total: u32,
    ) -> Result<Vec<u32>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT frag_index FROM fragments
             WHERE device_id = ?1 AND artifact_name = ?2
             ORDER BY frag_index ASC",
        )?;
        let rows = stmt.query_map(params![device_id, artifact_name], |row| {
            row.get::<_, i64>(0)
        })?;
        let mut present = std::collections::BTreeSet::new();
        for r in rows {
            present.insert(r?);
        }
        let missing = (0..i64::from(declared_total))
            .filter(|i| !present.contains(i))
            .map(|i| u32::try_from(i).unwrap_or(u32::MAX))
            .collect();
        Ok(missing)
    }

    /// True if any fragment rows remain for the artifact.
    ///
    /// The finalize guard: once `clear_fragments` ran, this is false and a
    /// second finalize pass becomes a no-op.
    pub fn has_fragments(&self, device_id: &str, artifact_name: &str) -> Result<bool, StoreError> {
        Ok(self.stored_fragment_count(device_id, artifact_name)? > 0)
    }

    /// Concatenate fragments strictly in index order.
    ///
    /// Fails if any index in range is absent.  Should not occur when
    /// `is_complete` was checked first, but must be defensive.
    pub fn assemble(
        &self,
        device_id: &str,
        artifact_name: &str,
        declared_total: u32,
    ) -> Result<Vec<u8>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT frag_index, bytes FROM fragments
             WHERE device_id = ?1 AND artifact_name = ?2
             ORDER BY frag_index ASC",
        )?;
        let rows = stmt.query_map(params![device_id, artifact_name], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut assembled = Vec::new();
        let mut expected: i64 = 0;
        for r in rows {
            let (index, bytes) = r?;
            if index != expected {
                return Err(StoreError::MissingFragment {
                    artifact: artifact_name.to_owned(),
                    index: u32::try_from(expected).unwrap_or(u32::MAX),
                });
            }
            assembled.extend_from_slice(&bytes);
            expected += 1;
        }
        if expected != i64::from(declared_total) {
            return Err(StoreError::MissingFragment {
                artifact: artifact_name.to_owned(),
                index: u32::try_from(expected).unwrap_or(u32::MAX),
            });
        }
        Ok(assembled)
    }

    /// Delete all fragment rows for an artifact.  Returns rows removed.
    pub fn clear_fragments(
        &mut self,
        device_id: &str,
        artifact_name: &str,
    ) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM fragments WHERE device_id = ?1 AND artifact_name = ?2",
            params![device_id, artifact_name],
        )?;
        Ok(removed)
    }

    /// TTL sweep pass.
    ///
    /// Deletes fragments whose expiry has passed, then fails any still-
    /// receiving transfer that is older than `ttl` and has no live fragments
    /// left.  Each abandoned transfer is returned exactly once; the status
    /// flip happens in the same pass, so later sweeps skip it.
    pub fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(Vec<ExpiredTransfer>, usize), StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM fragments WHERE expires_at <= ?1",
            params![fmt_ts(now)],
        )?;

        let cutoff = fmt_ts(now - ttl);
        let mut expired = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT device_id, artifact_name, wake_id FROM image_transfers t
                 WHERE status = 'receiving'
                   AND created_at <= ?1
                   AND NOT EXISTS (SELECT 1 FROM fragments f
                                   WHERE f.device_id = t.device_id
                                     AND f.artifact_name = t.artifact_name)",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(ExpiredTransfer {
                    device_id: row.get(0)?,
                    artifact_name: row.get(1)?,
                    wake_id: row.get(2)?,
                })
            })?;
            for r in rows {
                expired.push(r?);
            }
        }
        for t in &expired {
            self.conn.execute(
                "UPDATE image_transfers SET status = 'failed', failure_code = ?3
                 WHERE device_id = ?1 AND artifact_name = ?2",
                params![
                    t.device_id,
                    t.artifact_name,
                    failure_codes::TRANSFER_EXPIRED
                ],
            )?;
        }
        Ok((expired, removed))
    }

    // -----------------------------------------------------------------------
    // Device schedule state
    // -----------------------------------------------------------------------

    /// Record that a device was heard from, merging in any telemetry.
    pub fn touch_device_seen(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
        telemetry: Option<&TelemetryReadings>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO device_state (device_id, last_seen_at) VALUES (?1, ?2)
             ON CONFLICT (device_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![device_id, fmt_ts(now)],
        )?;
        if let Some(t) = telemetry {
            self.conn.execute(
                "UPDATE device_state
                 SET temperature    = COALESCE(?2, temperature),
                     humidity       = COALESCE(?3, humidity),
                     pressure       = COALESCE(?4, pressure),
                     gas_resistance = COALESCE(?5, gas_resistance)
                 WHERE device_id = ?1",
                params![device_id, t.temperature, t.humidity, t.pressure, t.gas_resistance],
            )?;
        }
        Ok(())
    }

    /// Fetch device schedule/telemetry state.
    pub fn device_state(&self, device_id: &str) -> Result<Option<DeviceStateRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT device_id, schedule_expr, last_wake_at, next_wake_at, last_seen_at,
                        temperature, humidity, pressure, gas_resistance
                 FROM device_state WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<f64>>(8)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(device_id, schedule_expr, last_wake, next_wake, last_seen, temperature, humidity, pressure, gas_resistance)| {
                Ok(DeviceStateRow {
                    device_id,
                    schedule_expr,
                    last_wake_at: last_wake.as_deref().map(parse_ts).transpose()?,
                    next_wake_at: next_wake.as_deref().map(parse_ts).transpose()?,
                    last_seen_at: last_seen.as_deref().map(parse_ts).transpose()?,
                    temperature,
                    humidity,
                    pressure,
                    gas_resistance,
                })
            },
        )
        .transpose()
    }

    /// Set a device's own schedule expression (operator-driven).
    pub fn set_device_schedule(
        &mut self,
        device_id: &str,
        schedule_expr: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO device_state (device_id, schedule_expr) VALUES (?1, ?2)
             ON CONFLICT (device_id) DO UPDATE SET schedule_expr = excluded.schedule_expr",
            params![device_id, schedule_expr],
        )?;
        Ok(())
    }

    /// Commit the device's wake timing after a successful wake.
    ///
    /// Advance-only: the update applies only when `last_wake_at` moves the
    /// stored value forward.  Next-wake is always derived from the most
    /// recent *actual* wake, so a stale commit must never rewind it.
    /// Returns whether the commit applied.
    pub fn commit_wake_schedule(
        &mut self,
        device_id: &str,
        last_wake_at: DateTime<Utc>,
        next_wake_at: DateTime<Utc>,
        schedule_expr: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO device_state (device_id) VALUES (?1)",
            params![device_id],
        )?;
        let changed = self.conn.execute(
            "UPDATE device_state
             SET last_wake_at = ?2,
                 next_wake_at = ?3,
                 schedule_expr = COALESCE(?4, schedule_expr)
             WHERE device_id = ?1
               AND (last_wake_at IS NULL OR last_wake_at < ?2)",
            params![device_id, fmt_ts(last_wake_at), fmt_ts(next_wake_at), schedule_expr],
        )?;
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

type RawWakeEvent = (
    i64,
    String,
    Option<String>,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    Option<String>,
    String,
);

fn map_wake_event(row: &rusqlite::Row<'_>) -> Result<RawWakeEvent, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn parse_wake_event(raw: RawWakeEvent) -> Result<WakeEventRow, StoreError> {
    let (
        wake_id,
        device_id,
        artifact_name,
        state,
        images_requested,
        images_completed,
        ack_sent_at,
        capture_requested_at,
        sleep_issued_at,
        is_complete,
        failure_code,
        created_at,
    ) = raw;
    Ok(WakeEventRow {
        wake_id,
        device_id,
        artifact_name,
        state: state
            .parse()
            .map_err(|e: crate::state_machine::UnknownState| StoreError::InvalidData(e.to_string()))?,
        images_requested,
        images_completed,
        ack_sent_at,
        capture_requested_at,
        sleep_issued_at,
        is_complete,
        failure_code,
        created_at,
    })
}

/// Timestamps are stored as second-precision RFC 3339 UTC strings, which
/// sort lexicographically in SQL comparisons.
fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{s}': {e}")))
}
