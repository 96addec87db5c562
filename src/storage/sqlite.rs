//! SQLite implementation of [`Store`]
//!
//! Uses `Mutex` to ensure thread-safety for the SQLite connection.
//! Timestamps are stored as fixed-width RFC3339 UTC text so they compare
//! correctly as strings.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{InvalidUnit, Occupancy, StorageError, StorageResult, Store};
use crate::models::{
    AuditRecord, ButtonLayout, ContentBody, ContentId, ContentItem, DeletePolicy, Destination,
    DestinationId, DestinationStatus, GroupId, MessageRef, NewContent, NewDestination, NewUnit,
    Placement, PlacementDraft, PlacementId, RemovalTarget, ScheduleUnit, UnitId,
};
use crate::scheduler::cron::CronSchedule;

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS destination_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS destinations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        permissions_ok INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS group_members (
        group_id INTEGER NOT NULL REFERENCES destination_groups(id) ON DELETE CASCADE,
        destination_id INTEGER NOT NULL REFERENCES destinations(id) ON DELETE CASCADE,
        PRIMARY KEY (group_id, destination_id)
    );

    CREATE TABLE IF NOT EXISTS schedule_units (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES destination_groups(id) ON DELETE CASCADE,
        ordinal INTEGER NOT NULL,
        name TEXT,
        mode TEXT NOT NULL DEFAULT 'fixed',
        enabled INTEGER NOT NULL DEFAULT 1,
        publish_cron TEXT NOT NULL,
        delete_mode TEXT NOT NULL DEFAULT 'none',
        delete_after_secs INTEGER,
        delete_cron TEXT,
        rotation_offset INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (group_id, ordinal)
    );

    CREATE TABLE IF NOT EXISTS content_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        unit_id INTEGER REFERENCES schedule_units(id) ON DELETE SET NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        kind TEXT NOT NULL,
        source_chat TEXT,
        source_message INTEGER,
        text TEXT,
        media_kind TEXT,
        file_id TEXT,
        caption TEXT,
        buttons_json TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_content_items_unit
        ON content_items(unit_id, enabled);

    CREATE TABLE IF NOT EXISTS placements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        destination_id INTEGER NOT NULL REFERENCES destinations(id),
        unit_id INTEGER NOT NULL REFERENCES schedule_units(id) ON DELETE CASCADE,
        content_id INTEGER REFERENCES content_items(id) ON DELETE SET NULL,
        message_id INTEGER,
        pinned INTEGER NOT NULL DEFAULT 0,
        published_at TEXT,
        scheduled_delete_at TEXT,
        deleted_at TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE (destination_id, unit_id)
    );

    CREATE INDEX IF NOT EXISTS idx_placements_active
        ON placements(destination_id, deleted_at);

    CREATE INDEX IF NOT EXISTS idx_placements_expiry
        ON placements(scheduled_delete_at);

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        op TEXT NOT NULL,
        status TEXT NOT NULL,
        unit_id INTEGER,
        destination_id INTEGER,
        content_id INTEGER,
        message_id INTEGER,
        error TEXT,
        created_at TEXT NOT NULL
    );
"#;

const PLACEMENT_COLUMNS: &str = "id, destination_id, unit_id, content_id, message_id, pinned, \
     published_at, scheduled_delete_at, deleted_at";

const UNIT_COLUMNS: &str = "id, group_id, ordinal, name, mode, enabled, publish_cron, \
     delete_mode, delete_after_secs, delete_cron, rotation_offset";

const CONTENT_COLUMNS: &str = "id, unit_id, enabled, kind, source_chat, source_message, text, \
     media_kind, file_id, caption, buttons_json";

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> StorageResult<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn placement_from_row(row: &Row<'_>) -> rusqlite::Result<Placement> {
    Ok(Placement {
        id: row.get(0)?,
        destination_id: row.get(1)?,
        unit_id: row.get(2)?,
        content_id: row.get(3)?,
        message: row.get::<_, Option<i64>>(4)?.map(MessageRef),
        pinned: row.get(5)?,
        published_at: parse_ts(6, row.get(6)?)?,
        scheduled_delete_at: parse_ts(7, row.get(7)?)?,
        deleted_at: parse_ts(8, row.get(8)?)?,
    })
}

/// Reads `id, address, title, status, permissions_ok` starting at `offset`
fn destination_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Destination> {
    let status: String = row.get(offset + 3)?;
    Ok(Destination {
        id: row.get(offset)?,
        address: row.get(offset + 1)?,
        title: row.get(offset + 2)?,
        status: status.parse().map_err(|e| conversion_error(offset + 3, e))?,
        permissions_ok: row.get(offset + 4)?,
    })
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<RemovalTarget> {
    Ok(RemovalTarget {
        placement_id: row.get(0)?,
        unit_id: row.get(1)?,
        content_id: row.get(2)?,
        message: MessageRef(row.get(3)?),
        destination: destination_from_row(row, 4)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let op: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created_at = parse_ts(8, Some(row.get(8)?))?.unwrap_or_default();

    Ok(AuditRecord {
        id: Some(row.get(0)?),
        op: op.parse().map_err(|e| conversion_error(1, e))?,
        status: status.parse().map_err(|e| conversion_error(2, e))?,
        unit_id: row.get(3)?,
        destination_id: row.get(4)?,
        content_id: row.get(5)?,
        message: row.get::<_, Option<i64>>(6)?.map(MessageRef),
        error: row.get(7)?,
        created_at,
    })
}

/// Raw `schedule_units` row, validated separately so one bad unit does not
/// hide the others
struct UnitRow {
    id: UnitId,
    group_id: GroupId,
    ordinal: i64,
    name: Option<String>,
    mode: String,
    enabled: bool,
    publish_cron: String,
    delete_mode: String,
    delete_after_secs: Option<i64>,
    delete_cron: Option<String>,
    rotation_offset: i64,
}

impl UnitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            ordinal: row.get(2)?,
            name: row.get(3)?,
            mode: row.get(4)?,
            enabled: row.get(5)?,
            publish_cron: row.get(6)?,
            delete_mode: row.get(7)?,
            delete_after_secs: row.get(8)?,
            delete_cron: row.get(9)?,
            rotation_offset: row.get(10)?,
        })
    }

    fn into_unit(self) -> Result<ScheduleUnit, InvalidUnit> {
        let id = self.id;
        let invalid = |reason: String| InvalidUnit { unit_id: id, reason };

        let mode = self.mode.parse().map_err(|e| invalid(format!("{e}")))?;
        let publish_cron = CronSchedule::parse(&self.publish_cron).map_err(|e| invalid(e.to_string()))?;

        let delete_policy = match self.delete_mode.as_str() {
            "none" => DeletePolicy::None,
            "after_duration" => match self.delete_after_secs {
                Some(secs) if secs > 0 => DeletePolicy::AfterDuration(Duration::from_secs(secs as u64)),
                other => return Err(invalid(format!("after_duration needs positive seconds, got {other:?}"))),
            },
            "cron" => {
                let expr = self
                    .delete_cron
                    .ok_or_else(|| invalid("cron delete mode without expression".to_string()))?;
                DeletePolicy::Cron(CronSchedule::parse(&expr).map_err(|e| invalid(e.to_string()))?)
            }
            other => return Err(invalid(format!("unknown delete mode '{other}'"))),
        };

        Ok(ScheduleUnit {
            id,
            group_id: self.group_id,
            ordinal: u32::try_from(self.ordinal).map_err(|_| invalid(format!("bad ordinal {}", self.ordinal)))?,
            name: self.name,
            mode,
            enabled: self.enabled,
            publish_cron,
            delete_policy,
            rotation_offset: u32::try_from(self.rotation_offset).unwrap_or(0),
        })
    }
}

/// Raw `content_items` row
struct ContentRow {
    id: ContentId,
    unit_id: Option<UnitId>,
    enabled: bool,
    kind: String,
    source_chat: Option<String>,
    source_message: Option<i64>,
    text: Option<String>,
    media_kind: Option<String>,
    file_id: Option<String>,
    caption: Option<String>,
    buttons_json: Option<String>,
}

impl ContentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            unit_id: row.get(1)?,
            enabled: row.get(2)?,
            kind: row.get(3)?,
            source_chat: row.get(4)?,
            source_message: row.get(5)?,
            text: row.get(6)?,
            media_kind: row.get(7)?,
            file_id: row.get(8)?,
            caption: row.get(9)?,
            buttons_json: row.get(10)?,
        })
    }

    fn into_item(self) -> StorageResult<ContentItem> {
        let id = self.id;
        let invalid = |reason: &str| StorageError::InvalidRow {
            table: "content_items",
            id,
            reason: reason.to_string(),
        };

        let body = match self.kind.as_str() {
            "copy" => ContentBody::Copy {
                source_chat: self.source_chat.ok_or_else(|| invalid("copy without source_chat"))?,
                source_message: self
                    .source_message
                    .ok_or_else(|| invalid("copy without source_message"))?,
            },
            "text" => ContentBody::Text {
                text: self.text.ok_or_else(|| invalid("text item without text"))?,
            },
            "media" => ContentBody::Media {
                kind: self
                    .media_kind
                    .as_deref()
                    .ok_or_else(|| invalid("media without kind"))?
                    .parse()
                    .map_err(|_| invalid("unknown media kind"))?,
                file_id: self.file_id.ok_or_else(|| invalid("media without file_id"))?,
                caption: self.caption,
            },
            _ => return Err(invalid("unknown content kind")),
        };

        let buttons = match self.buttons_json.as_deref() {
            None | Some("") => None,
            Some(json) => match ButtonLayout::from_json(json) {
                Ok(layout) => Some(layout),
                Err(reason) => {
                    warn!(content_id = id, reason = %reason, "Dropping invalid button layout");
                    None
                }
            },
        };

        Ok(ContentItem {
            id,
            unit_id: self.unit_id,
            enabled: self.enabled,
            body,
            buttons,
        })
    }
}

/// Active placements with a remote message matching `filter`, joined with
/// their destinations
fn collect_targets<P: Params>(conn: &Connection, filter: &str, params: P) -> StorageResult<Vec<RemovalTarget>> {
    let query = format!(
        "SELECT p.id, p.unit_id, p.content_id, p.message_id,
                d.id, d.address, d.title, d.status, d.permissions_ok
         FROM placements p JOIN destinations d ON d.id = p.destination_id
         WHERE p.deleted_at IS NULL AND p.message_id IS NOT NULL AND {filter}
         ORDER BY p.id"
    );
    let mut stmt = conn.prepare(&query)?;
    let targets = stmt
        .query_map(params, target_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(targets)
}

fn policy_columns(policy: &DeletePolicy) -> (&'static str, Option<i64>, Option<String>) {
    match policy {
        DeletePolicy::None => ("none", None, None),
        DeletePolicy::AfterDuration(d) => ("after_duration", Some(d.as_secs() as i64), None),
        DeletePolicy::Cron(cron) => ("cron", None, Some(cron.expression().to_string())),
    }
}

// ============================================================================
// Store implementation
// ============================================================================

impl Occupancy for SqliteStore {
    fn occupied_by_others(
        &self,
        destination_id: DestinationId,
        unit_id: UnitId,
    ) -> StorageResult<HashSet<ContentId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT content_id FROM placements
             WHERE destination_id = ?1 AND unit_id != ?2
               AND deleted_at IS NULL AND content_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![destination_id, unit_id], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<ContentId>>>()?;
        Ok(ids)
    }
}

impl Store for SqliteStore {
    fn create_group(&self, name: &str) -> StorageResult<GroupId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO destination_groups (name, created_at) VALUES (?1, ?2)",
            params![name, ts(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn create_destination(&self, destination: &NewDestination) -> StorageResult<DestinationId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO destinations (address, title, status, permissions_ok, created_at)
             VALUES (?1, ?2, 'active', ?3, ?4)",
            params![
                destination.address,
                destination.title,
                destination.permissions_ok,
                ts(&Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn add_group_member(&self, group_id: GroupId, destination_id: DestinationId) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, destination_id) VALUES (?1, ?2)",
            params![group_id, destination_id],
        )?;
        Ok(())
    }

    fn set_destination_status(
        &self,
        destination_id: DestinationId,
        status: DestinationStatus,
        permissions_ok: bool,
    ) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE destinations SET status = ?2, permissions_ok = ?3 WHERE id = ?1",
            params![destination_id, status.as_str(), permissions_ok],
        )?;
        Ok(changed > 0)
    }

    fn destination(&self, destination_id: DestinationId) -> StorageResult<Option<Destination>> {
        let conn = self.conn()?;
        let destination = conn
            .query_row(
                "SELECT id, address, title, status, permissions_ok FROM destinations WHERE id = ?1",
                params![destination_id],
                |row| destination_from_row(row, 0),
            )
            .optional()?;
        Ok(destination)
    }

    fn create_unit(&self, unit: &NewUnit) -> StorageResult<UnitId> {
        let (delete_mode, delete_after_secs, delete_cron) = policy_columns(&unit.delete_policy);
        let now = ts(&Utc::now());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedule_units
                (group_id, ordinal, name, mode, enabled, publish_cron,
                 delete_mode, delete_after_secs, delete_cron, rotation_offset, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)",
            params![
                unit.group_id,
                unit.ordinal,
                unit.name,
                unit.mode.as_str(),
                unit.enabled,
                unit.publish_cron.expression(),
                delete_mode,
                delete_after_secs,
                delete_cron,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn set_unit_enabled(&self, unit_id: UnitId, enabled: bool) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE schedule_units SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![unit_id, enabled, ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    fn set_unit_schedule(&self, unit_id: UnitId, schedule: &CronSchedule) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE schedule_units SET publish_cron = ?2, updated_at = ?3 WHERE id = ?1",
            params![unit_id, schedule.expression(), ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    fn delete_unit(&self, unit_id: UnitId, at: DateTime<Utc>) -> StorageResult<Option<Vec<RemovalTarget>>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM schedule_units WHERE id = ?1)",
            params![unit_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }

        let targets = collect_targets(&tx, "p.unit_id = ?1", params![unit_id])?;
        tx.execute(
            "UPDATE placements SET deleted_at = ?2, updated_at = ?2
             WHERE unit_id = ?1 AND deleted_at IS NULL",
            params![unit_id, ts(&at)],
        )?;
        tx.execute("DELETE FROM schedule_units WHERE id = ?1", params![unit_id])?;
        tx.commit()?;

        Ok(Some(targets))
    }

    fn create_content(&self, content: &NewContent) -> StorageResult<ContentId> {
        let (kind, source_chat, source_message, text, media_kind, file_id, caption) = match &content.body {
            ContentBody::Copy {
                source_chat,
                source_message,
            } => ("copy", Some(source_chat.as_str()), Some(*source_message), None, None, None, None),
            ContentBody::Text { text } => ("text", None, None, Some(text.as_str()), None, None, None),
            ContentBody::Media {
                kind,
                file_id,
                caption,
            } => (
                "media",
                None,
                None,
                None,
                Some(kind.as_str()),
                Some(file_id.as_str()),
                caption.as_deref(),
            ),
        };
        let buttons_json = content.buttons.as_ref().map(ButtonLayout::to_json);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO content_items
                (unit_id, enabled, kind, source_chat, source_message, text,
                 media_kind, file_id, caption, buttons_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                content.unit_id,
                content.enabled,
                kind,
                source_chat,
                source_message,
                text,
                media_kind,
                file_id,
                caption,
                buttons_json,
                ts(&Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn bind_content(&self, content_id: ContentId, unit_id: Option<UnitId>) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE content_items SET unit_id = ?2 WHERE id = ?1",
            params![content_id, unit_id],
        )?;
        Ok(changed > 0)
    }

    fn set_content_enabled(&self, content_id: ContentId, enabled: bool) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE content_items SET enabled = ?2 WHERE id = ?1",
            params![content_id, enabled],
        )?;
        Ok(changed > 0)
    }

    fn unit(&self, unit_id: UnitId) -> StorageResult<Option<ScheduleUnit>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM schedule_units WHERE id = ?1"),
                params![unit_id],
                UnitRow::from_row,
            )
            .optional()?;

        row.map(|row| {
            row.into_unit().map_err(|invalid| StorageError::InvalidRow {
                table: "schedule_units",
                id: invalid.unit_id,
                reason: invalid.reason,
            })
        })
        .transpose()
    }

    fn enabled_units(&self) -> StorageResult<Vec<Result<ScheduleUnit, InvalidUnit>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM schedule_units WHERE enabled = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], UnitRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    fn content_pool(&self, unit_id: UnitId) -> StorageResult<Vec<ContentItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items
             WHERE unit_id = ?1 AND enabled = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![unit_id], ContentRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut pool = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_item() {
                Ok(item) => pool.push(item),
                Err(e) => error!(unit_id, error = %e, "Skipping unpublishable content item"),
            }
        }
        Ok(pool)
    }

    fn unit_destinations(&self, unit: &ScheduleUnit) -> StorageResult<Vec<Destination>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.address, d.title, d.status, d.permissions_ok
             FROM destinations d JOIN group_members m ON m.destination_id = d.id
             WHERE m.group_id = ?1 AND d.status = 'active' AND d.permissions_ok = 1
             ORDER BY d.id",
        )?;
        let destinations = stmt
            .query_map(params![unit.group_id], |row| destination_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(destinations)
    }

    fn active_placements(
        &self,
        destination_id: DestinationId,
        unit_id: UnitId,
    ) -> StorageResult<Vec<Placement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACEMENT_COLUMNS} FROM placements
             WHERE destination_id = ?1 AND unit_id = ?2 AND deleted_at IS NULL"
        ))?;
        let placements = stmt
            .query_map(params![destination_id, unit_id], placement_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(placements)
    }

    fn placement(&self, destination_id: DestinationId, unit_id: UnitId) -> StorageResult<Option<Placement>> {
        let conn = self.conn()?;
        let placement = conn
            .query_row(
                &format!(
                    "SELECT {PLACEMENT_COLUMNS} FROM placements WHERE destination_id = ?1 AND unit_id = ?2"
                ),
                params![destination_id, unit_id],
                placement_from_row,
            )
            .optional()?;
        Ok(placement)
    }

    fn unit_placements(&self, unit_id: UnitId) -> StorageResult<Vec<Placement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACEMENT_COLUMNS} FROM placements WHERE unit_id = ?1 ORDER BY destination_id"
        ))?;
        let placements = stmt
            .query_map(params![unit_id], placement_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(placements)
    }

    fn mark_deleted(&self, placement_id: PlacementId, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE placements SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![placement_id, ts(&at)],
        )?;
        Ok(())
    }

    fn upsert_placement(&self, draft: &PlacementDraft) -> StorageResult<PlacementId> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO placements
                (destination_id, unit_id, content_id, message_id, pinned,
                 published_at, scheduled_delete_at, deleted_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?6)
             ON CONFLICT (destination_id, unit_id) DO UPDATE SET
                content_id = excluded.content_id,
                message_id = excluded.message_id,
                pinned = excluded.pinned,
                published_at = excluded.published_at,
                scheduled_delete_at = excluded.scheduled_delete_at,
                deleted_at = NULL,
                updated_at = excluded.updated_at
             RETURNING id",
            params![
                draft.destination_id,
                draft.unit_id,
                draft.content_id,
                draft.message.0,
                draft.pinned,
                ts(&draft.published_at),
                draft.scheduled_delete_at.as_ref().map(ts)
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn set_rotation_offset(&self, unit_id: UnitId, offset: u32) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE schedule_units SET rotation_offset = ?2 WHERE id = ?1",
            params![unit_id, offset],
        )?;
        Ok(())
    }

    fn clear_unit(&self, unit_id: UnitId, at: DateTime<Utc>) -> StorageResult<Vec<RemovalTarget>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let targets = collect_targets(&tx, "p.unit_id = ?1", params![unit_id])?;
        tx.execute(
            "UPDATE placements SET deleted_at = ?2, updated_at = ?2
             WHERE unit_id = ?1 AND deleted_at IS NULL",
            params![unit_id, ts(&at)],
        )?;
        tx.commit()?;

        Ok(targets)
    }

    fn take_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<RemovalTarget>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cutoff = ts(&now);

        let targets = collect_targets(
            &tx,
            "p.scheduled_delete_at IS NOT NULL AND p.scheduled_delete_at <= ?1",
            params![cutoff],
        )?;
        tx.execute(
            "UPDATE placements SET deleted_at = ?1, updated_at = ?1
             WHERE deleted_at IS NULL AND scheduled_delete_at IS NOT NULL
               AND scheduled_delete_at <= ?1",
            params![cutoff],
        )?;
        tx.commit()?;

        Ok(targets)
    }

    fn append_audit(&self, record: &AuditRecord) -> StorageResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log
                (op, status, unit_id, destination_id, content_id, message_id, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.op.as_str(),
                record.status.as_str(),
                record.unit_id,
                record.destination_id,
                record.content_id,
                record.message.map(|m| m.0),
                record.error,
                ts(&record.created_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent_audit(&self, limit: usize) -> StorageResult<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, op, status, unit_id, destination_id, content_id, message_id, error, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit as i64], audit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
