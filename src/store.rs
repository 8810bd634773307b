/**
 * ============================================================================
 * EVENT STORE MODULE
 * ============================================================================
 *
 * PURPOSE: SQLite-backed persistence for sessions, input events, action
 * codes, frame timings and health samples
 *
 * DESIGN:
 * - One connection plus the action-code cache behind a single lock. Every
 *   check-then-insert sequence runs under that lock, so the first writer of
 *   an action code wins and concurrent callers observe the winning row.
 * - Action codes are contiguous from 0 within each device class and are
 *   never renumbered once assigned.
 * - Bulk writes (event batches, frame timings) go through one transaction.
 * - Timestamps are stored as RFC 3339 text in UTC.
 *
 * ============================================================================
 */

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::types::{
    ActionCode, DeviceClass, FrameTiming, HealthSample, RawInputEvent, SessionRecord,
    SessionStatus, StoreStatistics, StoredInputEvent,
};

// Final fields written when a session ends normally
#[derive(Debug, Clone, Default)]
pub struct SessionCompletion {
    pub end_time: Option<DateTime<Utc>>,
    pub video_path: Option<String>,
    pub system_audio_path: Option<String>,
    pub microphone_audio_path: Option<String>,
    pub notes: Option<String>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub video_codec: Option<String>,
    pub total_frames: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

struct StoreInner {
    conn: Connection,
    code_cache: HashMap<(DeviceClass, String), ActionCode>,
}

pub struct EventStore {
    inner: Mutex<StoreInner>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    game_name             TEXT NOT NULL,
    start_time            TEXT NOT NULL,
    end_time              TEXT,
    duration_seconds      INTEGER,
    video_path            TEXT,
    system_audio_path     TEXT,
    microphone_audio_path TEXT,
    input_type            TEXT NOT NULL,
    fps                   INTEGER NOT NULL,
    latency_offset_ms     INTEGER NOT NULL DEFAULT 0,
    status                TEXT NOT NULL DEFAULT 'recording',
    monitor_index         INTEGER NOT NULL DEFAULT 0,
    notes                 TEXT,
    video_width           INTEGER,
    video_height          INTEGER,
    video_codec           TEXT,
    total_frames          INTEGER,
    file_size_bytes       INTEGER
);

CREATE TABLE IF NOT EXISTS action_codes (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    input_device  TEXT NOT NULL,
    raw_input     TEXT NOT NULL,
    encoded_value INTEGER NOT NULL,
    description   TEXT,
    category      TEXT,
    created_at    TEXT NOT NULL,
    UNIQUE (input_device, raw_input)
);

CREATE TABLE IF NOT EXISTS input_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    timestamp_ms INTEGER NOT NULL,
    input_device TEXT NOT NULL,
    button_key   TEXT NOT NULL,
    action       TEXT NOT NULL,
    value        REAL,
    x_position   REAL,
    y_position   REAL,
    action_code  INTEGER NOT NULL REFERENCES action_codes(id)
);

CREATE INDEX IF NOT EXISTS idx_input_events_session_time
    ON input_events (session_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS frame_timestamps (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id           INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    frame_number         INTEGER NOT NULL,
    capture_timestamp_ms INTEGER NOT NULL,
    write_timestamp_ms   INTEGER,
    dropped              INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS session_health (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    check_time      TEXT NOT NULL,
    disk_space_gb   REAL NOT NULL,
    cpu_percent     REAL NOT NULL,
    memory_mb       REAL NOT NULL,
    frames_captured INTEGER NOT NULL,
    frames_dropped  INTEGER NOT NULL
);
";

impl EventStore {
    pub fn open(path: &Path) -> Result<EventStore> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    // In-memory store for tests and tooling
    pub fn open_in_memory() -> Result<EventStore> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<EventStore> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(EventStore {
            inner: Mutex::new(StoreInner {
                conn,
                code_cache: HashMap::new(),
            }),
        })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn create_session(
        &self,
        game_name: &str,
        input_type: DeviceClass,
        fps: u32,
        latency_offset_ms: i64,
        monitor_index: u32,
    ) -> Result<i64> {
        let inner = self.inner.lock();
        inner.conn.execute(
            "INSERT INTO sessions (game_name, start_time, input_type, fps, latency_offset_ms, status, monitor_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                game_name,
                Utc::now().to_rfc3339(),
                input_type.as_str(),
                fps,
                latency_offset_ms,
                SessionStatus::Recording.as_str(),
                monitor_index,
            ],
        )?;
        let id = inner.conn.last_insert_rowid();
        log::info!("Created session {} for '{}'", id, game_name);
        Ok(id)
    }

    // Write the final fields and flip the status to completed. The stored
    // duration is end - start rounded to whole seconds.
    pub fn complete_session(&self, session_id: i64, completion: &SessionCompletion) -> Result<()> {
        let inner = self.inner.lock();

        let start_text: String = inner
            .conn
            .query_row(
                "SELECT start_time FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::Config(format!("session {} does not exist", session_id)))?;
        let start_time = parse_timestamp(&start_text)?;

        let end_time = completion.end_time.unwrap_or_else(Utc::now);
        let duration_seconds =
            ((end_time - start_time).num_milliseconds() as f64 / 1000.0).round() as i64;

        inner.conn.execute(
            "UPDATE sessions SET
                end_time = ?1,
                duration_seconds = ?2,
                video_path = COALESCE(?3, video_path),
                system_audio_path = COALESCE(?4, system_audio_path),
                microphone_audio_path = COALESCE(?5, microphone_audio_path),
                notes = COALESCE(?6, notes),
                video_width = COALESCE(?7, video_width),
                video_height = COALESCE(?8, video_height),
                video_codec = COALESCE(?9, video_codec),
                total_frames = COALESCE(?10, total_frames),
                file_size_bytes = COALESCE(?11, file_size_bytes),
                status = ?12
             WHERE id = ?13",
            params![
                end_time.to_rfc3339(),
                duration_seconds,
                completion.video_path,
                completion.system_audio_path,
                completion.microphone_audio_path,
                completion.notes,
                completion.video_width,
                completion.video_height,
                completion.video_codec,
                completion.total_frames,
                completion.file_size_bytes,
                SessionStatus::Completed.as_str(),
                session_id,
            ],
        )?;
        Ok(())
    }

    // Terminal failure path; the reason lands in `notes` for operators.
    // Failed sessions get end_time and duration too, same as completed ones.
    pub fn mark_session_failed(&self, session_id: i64, reason: &str) -> Result<()> {
        let inner = self.inner.lock();

        let start_text: String = inner
            .conn
            .query_row(
                "SELECT start_time FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::Config(format!("session {} does not exist", session_id)))?;
        let start_time = parse_timestamp(&start_text)?;

        let end_time = Utc::now();
        let duration_seconds =
            ((end_time - start_time).num_milliseconds() as f64 / 1000.0).round() as i64;

        inner.conn.execute(
            "UPDATE sessions SET status = ?1, end_time = ?2, duration_seconds = ?3, notes = ?4
             WHERE id = ?5",
            params![
                SessionStatus::Failed.as_str(),
                end_time.to_rfc3339(),
                duration_seconds,
                reason,
                session_id,
            ],
        )?;
        log::warn!("Session {} marked failed: {}", session_id, reason);
        Ok(())
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock();
        let record = inner
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_SESSION),
                params![session_id],
                row_to_session,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_sessions_by_game(&self, game_name: &str) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "{} WHERE game_name = ?1 ORDER BY start_time DESC",
            SELECT_SESSION
        ))?;
        let rows = stmt.query_map(params![game_name], row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn get_all_sessions(&self, limit: Option<u32>) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "{} ORDER BY start_time DESC LIMIT ?1",
            SELECT_SESSION
        ))?;
        let rows = stmt.query_map(params![limit.map(i64::from).unwrap_or(-1)], row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // Sessions still marked recording, typically survivors of a crash
    pub fn get_incomplete_sessions(&self) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY start_time ASC",
            SELECT_SESSION
        ))?;
        let rows = stmt.query_map(params![SessionStatus::Recording.as_str()], row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // Remove a session and, via cascade, its events, timings and health rows.
    // Returns whether a row existed.
    pub fn delete_session(&self, session_id: i64) -> Result<bool> {
        let inner = self.inner.lock();
        let affected = inner
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(affected > 0)
    }

    // =========================================================================
    // Action codes
    // =========================================================================

    pub fn get_or_create_action_code(
        &self,
        device: DeviceClass,
        raw_input: &str,
    ) -> Result<ActionCode> {
        self.get_or_create_action_code_with_details(device, raw_input, None, None)
    }

    pub fn get_or_create_action_code_with_details(
        &self,
        device: DeviceClass,
        raw_input: &str,
        description: Option<&str>,
        category: Option<&str>,
    ) -> Result<ActionCode> {
        let mut inner = self.inner.lock();
        get_or_create_code_locked(&mut *inner, device, raw_input, description, category)
    }

    // raw_input -> encoded_value for one device class
    pub fn get_action_mapping(&self, device: DeviceClass) -> Result<HashMap<String, i64>> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT raw_input, encoded_value FROM action_codes WHERE input_device = ?1")?;
        let rows = stmt.query_map(params![device.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut mapping = HashMap::new();
        for row in rows {
            let (raw, code) = row?;
            mapping.insert(raw, code);
        }
        Ok(mapping)
    }

    // Drop the in-process cache; rows are re-read on next use
    pub fn invalidate_code_cache(&self) {
        self.inner.lock().code_cache.clear();
    }

    // =========================================================================
    // Input events
    // =========================================================================

    // Resolve an action code per event and insert the whole batch in one
    // transaction. Returns the number of rows written.
    pub fn add_events_batch(&self, session_id: i64, events: &[RawInputEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock();

        // Resolve codes before opening the insert transaction so code
        // creation commits even if the batch fails
        let mut code_ids = Vec::with_capacity(events.len());
        for event in events {
            let code =
                get_or_create_code_locked(&mut *inner, event.device, &event.control, None, None)?;
            code_ids.push(code.id);
        }

        let tx = inner.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO input_events
                    (session_id, timestamp_ms, input_device, button_key, action, value, x_position, y_position, action_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (event, code_id) in events.iter().zip(&code_ids) {
                stmt.execute(params![
                    session_id,
                    event.timestamp_ms,
                    event.device.as_str(),
                    event.control,
                    event.action.as_str(),
                    event.value,
                    event.x_position,
                    event.y_position,
                    code_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    pub fn get_input_events(&self, session_id: i64) -> Result<Vec<StoredInputEvent>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&format!(
            "{} WHERE session_id = ?1 ORDER BY timestamp_ms ASC",
            SELECT_EVENT
        ))?;
        let rows = stmt.query_map(params![session_id], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // Events within [start_frame, end_frame], converted to a millisecond
    // window using the session's recorded frame rate
    pub fn get_input_events_in_frame_range(
        &self,
        session_id: i64,
        start_frame: u64,
        end_frame: u64,
    ) -> Result<Vec<StoredInputEvent>> {
        let inner = self.inner.lock();

        let fps: u32 = inner
            .conn
            .query_row(
                "SELECT fps FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::Config(format!("session {} does not exist", session_id)))?;
        if fps == 0 {
            return Err(Error::Config(format!(
                "session {} has fps=0, cannot map frames to time",
                session_id
            )));
        }

        let frame_ms = 1000.0 / f64::from(fps);
        let start_ms = (start_frame as f64 * frame_ms).floor() as i64;
        let end_ms = ((end_frame + 1) as f64 * frame_ms).ceil() as i64;

        let mut stmt = inner.conn.prepare(&format!(
            "{} WHERE session_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
             ORDER BY timestamp_ms ASC",
            SELECT_EVENT
        ))?;
        let rows = stmt.query_map(params![session_id, start_ms, end_ms], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // =========================================================================
    // Frame timings and health samples
    // =========================================================================

    pub fn add_frame_timings_batch(&self, session_id: i64, timings: &[FrameTiming]) -> Result<usize> {
        if timings.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        let tx = inner.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO frame_timestamps
                    (session_id, frame_number, capture_timestamp_ms, write_timestamp_ms, dropped)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for timing in timings {
                stmt.execute(params![
                    session_id,
                    timing.frame_number,
                    timing.capture_timestamp_ms,
                    timing.write_timestamp_ms,
                    timing.dropped,
                ])?;
            }
        }
        tx.commit()?;
        Ok(timings.len())
    }

    pub fn get_frame_timings(&self, session_id: i64) -> Result<Vec<FrameTiming>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT frame_number, capture_timestamp_ms, write_timestamp_ms, dropped
             FROM frame_timestamps WHERE session_id = ?1 ORDER BY frame_number ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(FrameTiming {
                frame_number: row.get::<_, i64>(0)? as u64,
                capture_timestamp_ms: row.get(1)?,
                write_timestamp_ms: row.get(2)?,
                dropped: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn add_health_sample(&self, session_id: i64, sample: &HealthSample) -> Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            "INSERT INTO session_health
                (session_id, check_time, disk_space_gb, cpu_percent, memory_mb, frames_captured, frames_dropped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                sample.check_time.to_rfc3339(),
                sample.disk_space_gb,
                sample.cpu_percent,
                sample.memory_mb,
                sample.frames_captured,
                sample.frames_dropped,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let inner = self.inner.lock();
        let stats = inner.conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COUNT(DISTINCT game_name),
                COALESCE(SUM(duration_seconds), 0),
                COALESCE(SUM(total_frames), 0),
                COALESCE(SUM(file_size_bytes), 0)
             FROM sessions",
            [],
            |row| {
                Ok(StoreStatistics {
                    total_sessions: row.get::<_, i64>(0)? as u64,
                    completed_sessions: row.get::<_, i64>(1)? as u64,
                    unique_games: row.get::<_, i64>(2)? as u64,
                    total_duration_seconds: row.get(3)?,
                    total_input_events: 0,
                    total_frames: row.get::<_, i64>(4)? as u64,
                    total_storage_bytes: row.get::<_, i64>(5)? as u64,
                })
            },
        )?;
        let total_input_events: i64 =
            inner
                .conn
                .query_row("SELECT COUNT(*) FROM input_events", [], |row| row.get(0))?;
        Ok(StoreStatistics {
            total_input_events: total_input_events as u64,
            ..stats
        })
    }
}

// Check-then-insert for one action code, caller holds the store lock.
// The new encoded_value is max(existing for this device) + 1, or 0.
fn get_or_create_code_locked(
    inner: &mut StoreInner,
    device: DeviceClass,
    raw_input: &str,
    description: Option<&str>,
    category: Option<&str>,
) -> Result<ActionCode> {
    let key = (device, raw_input.to_string());
    if let Some(code) = inner.code_cache.get(&key) {
        return Ok(code.clone());
    }

    let existing = inner
        .conn
        .query_row(
            "SELECT id, input_device, raw_input, encoded_value, description, category
             FROM action_codes WHERE input_device = ?1 AND raw_input = ?2",
            params![device.as_str(), raw_input],
            row_to_code,
        )
        .optional()?;
    if let Some(code) = existing {
        inner.code_cache.insert(key, code.clone());
        return Ok(code);
    }

    let next_value: i64 = inner.conn.query_row(
        "SELECT COALESCE(MAX(encoded_value) + 1, 0) FROM action_codes WHERE input_device = ?1",
        params![device.as_str()],
        |row| row.get(0),
    )?;

    inner.conn.execute(
        "INSERT INTO action_codes (input_device, raw_input, encoded_value, description, category, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            device.as_str(),
            raw_input,
            next_value,
            description,
            category,
            Utc::now().to_rfc3339(),
        ],
    )?;

    let code = ActionCode {
        id: inner.conn.last_insert_rowid(),
        device,
        raw_input: raw_input.to_string(),
        encoded_value: next_value,
        description: description.map(str::to_string),
        category: category.map(str::to_string),
    };
    log::debug!(
        "Assigned action code {} to {}/{}",
        next_value,
        device,
        raw_input
    );
    inner.code_cache.insert(key, code.clone());
    Ok(code)
}

// =============================================================================
// Row mapping
// =============================================================================

const SELECT_SESSION: &str = "SELECT id, game_name, start_time, end_time, duration_seconds,
    video_path, system_audio_path, microphone_audio_path, input_type, fps, latency_offset_ms,
    status, monitor_index, notes, video_width, video_height, video_codec, total_frames,
    file_size_bytes FROM sessions";

const SELECT_EVENT: &str = "SELECT id, session_id, timestamp_ms, input_device, button_key,
    action, value, x_position, y_position, action_code FROM input_events";

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("malformed timestamp '{}': {}", text, e)))
}

fn column_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn column_device(row: &Row<'_>, idx: usize) -> rusqlite::Result<DeviceClass> {
    let text: String = row.get(idx)?;
    DeviceClass::from_str(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown device class '{}'", text).into(),
        )
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let end_text: Option<String> = row.get(3)?;
    let end_time = match end_text {
        Some(_) => Some(column_timestamp(row, 3)?),
        None => None,
    };
    let status_text: String = row.get(11)?;
    let status = SessionStatus::from_str(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            rusqlite::types::Type::Text,
            format!("unknown session status '{}'", status_text).into(),
        )
    })?;

    Ok(SessionRecord {
        id: row.get(0)?,
        game_name: row.get(1)?,
        start_time: column_timestamp(row, 2)?,
        end_time,
        duration_seconds: row.get(4)?,
        video_path: row.get(5)?,
        system_audio_path: row.get(6)?,
        microphone_audio_path: row.get(7)?,
        input_type: column_device(row, 8)?,
        fps: row.get(9)?,
        latency_offset_ms: row.get(10)?,
        status,
        monitor_index: row.get(12)?,
        notes: row.get(13)?,
        video_width: row.get(14)?,
        video_height: row.get(15)?,
        video_codec: row.get(16)?,
        total_frames: row.get::<_, Option<i64>>(17)?.map(|v| v as u64),
        file_size_bytes: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredInputEvent> {
    let action_text: String = row.get(5)?;
    let action = crate::types::ActionKind::from_str(&action_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown action '{}'", action_text).into(),
        )
    })?;

    Ok(StoredInputEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event: RawInputEvent {
            timestamp_ms: row.get(2)?,
            device: column_device(row, 3)?,
            control: row.get(4)?,
            action,
            value: row.get(6)?,
            x_position: row.get(7)?,
            y_position: row.get(8)?,
        },
        action_code_id: row.get(9)?,
    })
}

fn row_to_code(row: &Row<'_>) -> rusqlite::Result<ActionCode> {
    Ok(ActionCode {
        id: row.get(0)?,
        device: column_device(row, 1)?,
        raw_input: row.get(2)?,
        encoded_value: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;
    use std::sync::Arc;

    fn store() -> EventStore {
        EventStore::open_in_memory().unwrap()
    }

    fn event(timestamp_ms: i64, control: &str, action: ActionKind) -> RawInputEvent {
        RawInputEvent {
            timestamp_ms,
            device: DeviceClass::Keyboard,
            control: control.to_string(),
            action,
            value: Some(1.0),
            x_position: None,
            y_position: None,
        }
    }

    #[test]
    fn test_action_codes_are_idempotent_and_contiguous() {
        let store = store();

        let w = store
            .get_or_create_action_code(DeviceClass::Keyboard, "KeyW")
            .unwrap();
        let a = store
            .get_or_create_action_code(DeviceClass::Keyboard, "KeyA")
            .unwrap();
        let s = store
            .get_or_create_action_code(DeviceClass::Keyboard, "KeyS")
            .unwrap();
        assert_eq!(w.encoded_value, 0);
        assert_eq!(a.encoded_value, 1);
        assert_eq!(s.encoded_value, 2);

        for _ in 0..5 {
            let again = store
                .get_or_create_action_code(DeviceClass::Keyboard, "KeyW")
                .unwrap();
            assert_eq!(again, w);
        }

        // Each device class numbers independently from 0
        let south = store
            .get_or_create_action_code(DeviceClass::Xbox, "South")
            .unwrap();
        assert_eq!(south.encoded_value, 0);
    }

    #[test]
    fn test_action_code_survives_cache_invalidation() {
        let store = store();
        let first = store
            .get_or_create_action_code(DeviceClass::Mouse, "Left")
            .unwrap();
        store.invalidate_code_cache();
        let second = store
            .get_or_create_action_code(DeviceClass::Mouse, "Left")
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_code() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .get_or_create_action_code(DeviceClass::Keyboard, "KeyW")
                    .unwrap()
            }));
        }
        let codes: Vec<ActionCode> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for code in &codes {
            assert_eq!(code, &codes[0]);
        }

        let mapping = store.get_action_mapping(DeviceClass::Keyboard).unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping["KeyW"], 0);
    }

    #[test]
    fn test_batch_insert_yields_exactly_n_rows() {
        let store = store();
        let session = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();

        let events: Vec<RawInputEvent> = (0..250)
            .map(|i| event(i * 10, if i % 2 == 0 { "KeyW" } else { "Space" }, ActionKind::Press))
            .collect();
        let written = store.add_events_batch(session, &events).unwrap();
        assert_eq!(written, 250);

        let stored = store.get_input_events(session).unwrap();
        assert_eq!(stored.len(), 250);
        for row in &stored {
            assert!(row.action_code_id > 0);
        }
    }

    #[test]
    fn test_press_release_share_action_code() {
        let store = store();
        let session = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();

        let events = vec![
            event(100, "KeyW", ActionKind::Press),
            event(150, "KeyW", ActionKind::Release),
        ];
        store.add_events_batch(session, &events).unwrap();

        let stored = store.get_input_events(session).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].action_code_id, stored[1].action_code_id);
        assert_eq!(
            stored[1].event.timestamp_ms - stored[0].event.timestamp_ms,
            50
        );
    }

    #[test]
    fn test_frame_range_query_uses_session_fps() {
        let store = store();
        let session = store
            .create_session("Celeste", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();

        // At 60 fps a frame is ~16.67ms; frames 6..=12 cover ~100ms..216ms
        let events = vec![
            event(50, "KeyA", ActionKind::Press),
            event(120, "KeyB", ActionKind::Press),
            event(200, "KeyC", ActionKind::Press),
            event(400, "KeyD", ActionKind::Press),
        ];
        store.add_events_batch(session, &events).unwrap();

        let window = store
            .get_input_events_in_frame_range(session, 6, 12)
            .unwrap();
        let controls: Vec<&str> = window.iter().map(|e| e.event.control.as_str()).collect();
        assert_eq!(controls, vec!["KeyB", "KeyC"]);
    }

    #[test]
    fn test_session_completion_sets_duration_and_status() {
        let store = store();
        let session = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();

        let before = store.get_session(session).unwrap().unwrap();
        assert_eq!(before.status, SessionStatus::Recording);
        assert!(before.end_time.is_none());

        let end_time = before.start_time + chrono::Duration::milliseconds(90_400);
        store
            .complete_session(
                session,
                &SessionCompletion {
                    end_time: Some(end_time),
                    video_path: Some("video.mp4".to_string()),
                    total_frames: Some(5424),
                    file_size_bytes: Some(12_345_678),
                    ..Default::default()
                },
            )
            .unwrap();

        let after = store.get_session(session).unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert_eq!(after.duration_seconds, Some(90));
        assert!(after.end_time.unwrap() >= after.start_time);
        assert_eq!(after.video_path.as_deref(), Some("video.mp4"));
        assert_eq!(after.total_frames, Some(5424));
    }

    #[test]
    fn test_mark_failed_and_incomplete_listing() {
        let store = store();
        let a = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();
        let b = store
            .create_session("Celeste", DeviceClass::Xbox, 30, 0, 0)
            .unwrap();

        let incomplete = store.get_incomplete_sessions().unwrap();
        assert_eq!(incomplete.len(), 2);

        store.mark_session_failed(a, "sink could not be opened").unwrap();
        let incomplete = store.get_incomplete_sessions().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, b);

        let failed = store.get_session(a).unwrap().unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.notes.as_deref(), Some("sink could not be opened"));
    }

    #[test]
    fn test_failed_session_has_end_time_and_duration() {
        let store = store();
        let session = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();

        store.mark_session_failed(session, "encoder died").unwrap();

        // Terminal states carry both end_time and duration
        let record = store.get_session(session).unwrap().unwrap();
        assert!(record.end_time.is_some());
        assert!(record.duration_seconds.is_some());
        assert!(record.end_time.unwrap() >= record.start_time);
        assert!(record.duration_seconds.unwrap() >= 0);
    }

    #[test]
    fn test_delete_session_cascades() {
        let store = store();
        let session = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();
        store
            .add_events_batch(session, &[event(10, "KeyW", ActionKind::Press)])
            .unwrap();
        store
            .add_frame_timings_batch(
                session,
                &[FrameTiming {
                    frame_number: 0,
                    capture_timestamp_ms: 0,
                    write_timestamp_ms: Some(4),
                    dropped: false,
                }],
            )
            .unwrap();

        assert!(store.delete_session(session).unwrap());
        assert!(store.get_session(session).unwrap().is_none());
        assert!(store.get_input_events(session).unwrap().is_empty());
        assert!(!store.delete_session(session).unwrap());

        // Action codes are global and survive session deletion
        let mapping = store.get_action_mapping(DeviceClass::Keyboard).unwrap();
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_statistics_aggregates() {
        let store = store();
        let a = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();
        let _b = store
            .create_session("Hades", DeviceClass::Keyboard, 60, 0, 0)
            .unwrap();
        let c = store
            .create_session("Celeste", DeviceClass::Xbox, 30, 0, 0)
            .unwrap();

        for id in [a, c] {
            store
                .complete_session(
                    id,
                    &SessionCompletion {
                        total_frames: Some(100),
                        file_size_bytes: Some(1000),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        store
            .add_events_batch(a, &[event(1, "KeyW", ActionKind::Press)])
            .unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.completed_sessions, 2);
        assert_eq!(stats.unique_games, 2);
        assert_eq!(stats.total_input_events, 1);
        assert_eq!(stats.total_frames, 200);
        assert_eq!(stats.total_storage_bytes, 2000);
    }
}
