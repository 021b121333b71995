use aoc_core::insight_contracts::{MessageRecord, SessionDetail, SessionRecord, UsageRecord};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params_from_iter, types::ValueRef, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Tables the agent writes. The store never creates them outside of fixtures.
pub const SESSION_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS session (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now')),
    status TEXT
);
CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT REFERENCES session(id),
    role TEXT,
    content TEXT,
    timestamp INTEGER DEFAULT (strftime('%s', 'now'))
);
CREATE TABLE IF NOT EXISTS usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT REFERENCES session(id),
    input_tokens INTEGER,
    output_tokens INTEGER,
    total_tokens INTEGER,
    timestamp INTEGER DEFAULT (strftime('%s', 'now'))
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid table name: {0}")]
    InvalidTable(String),
    #[error("store task failed: {0}")]
    Join(String),
}

pub type QueryRow = Map<String, Value>;

pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Opens the agent database without write access.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Writable in-memory store with the session schema, for fixtures.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SESSION_SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn recent_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, title, created_at, updated_at, status
            FROM session
            ORDER BY updated_at DESC, id ASC
            LIMIT ?1 OFFSET ?2
            ",
        )?;
        let rows = statement.query_map([limit as i64, offset as i64], session_from_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let session = self
            .conn
            .query_row(
                "
                SELECT id, title, created_at, updated_at, status
                FROM session
                WHERE id = ?1
                LIMIT 1
                ",
                [session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn session_detail(&self, session_id: &str) -> Result<Option<SessionDetail>, StorageError> {
        let Some(session) = self.session(session_id)? else {
            return Ok(None);
        };
        let messages = self
            .messages_for_sessions(&[session_id.to_string()])?
            .remove(session_id)
            .unwrap_or_default();
        Ok(Some(SessionDetail { session, messages }))
    }

    /// Messages for every listed session in one round trip, oldest first per session.
    pub fn messages_for_sessions(
        &self,
        session_ids: &[String],
    ) -> Result<HashMap<String, Vec<MessageRecord>>, StorageError> {
        let mut grouped: HashMap<String, Vec<MessageRecord>> = HashMap::new();
        if session_ids.is_empty() {
            return Ok(grouped);
        }

        let sql = format!(
            "
            SELECT id, session_id, role, content, timestamp
            FROM message
            WHERE session_id IN ({})
            ORDER BY session_id ASC, timestamp ASC, id ASC
            ",
            placeholders(session_ids.len())
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(session_ids.iter()), message_from_row)?;

        for row in rows {
            let message = row?;
            if let Some(session_id) = message.session_id.clone() {
                grouped.entry(session_id).or_default().push(message);
            }
        }
        Ok(grouped)
    }

    /// Latest usage row per listed session in one round trip.
    pub fn latest_usage_for_sessions(
        &self,
        session_ids: &[String],
    ) -> Result<HashMap<String, UsageRecord>, StorageError> {
        let mut latest = HashMap::new();
        if session_ids.is_empty() {
            return Ok(latest);
        }

        let sql = format!(
            "
            SELECT id, session_id, input_tokens, output_tokens, total_tokens, timestamp
            FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY session_id
                    ORDER BY timestamp DESC, id DESC
                ) AS usage_rank
                FROM usage
                WHERE session_id IN ({})
            )
            WHERE usage_rank = 1
            ",
            placeholders(session_ids.len())
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(session_ids.iter()), usage_from_row)?;

        for row in rows {
            let usage = row?;
            if let Some(session_id) = usage.session_id.clone() {
                latest.insert(session_id, usage);
            }
        }
        Ok(latest)
    }

    pub fn table_names(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT name
            FROM sqlite_master
            WHERE type='table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            ",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// First rows of a table that exists in the schema.
    pub fn browse_table(&self, table: &str, limit: u64) -> Result<Vec<QueryRow>, StorageError> {
        if !self.table_names()?.iter().any(|name| name == table) {
            return Err(StorageError::InvalidTable(table.to_string()));
        }
        let sql = format!(
            "SELECT * FROM \"{}\" LIMIT {limit}",
            table.replace('"', "\"\"")
        );
        self.readonly_query(&sql)
    }

    /// Runs already-guarded query text and returns rows as JSON objects.
    pub fn readonly_query(&self, sql: &str) -> Result<Vec<QueryRow>, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = statement.query([])?;
        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                object.insert(column.clone(), json_value(row.get_ref(index)?));
            }
            output.push(object);
        }
        Ok(output)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

/// Columns hold unix seconds, but rows written by hand may carry text.
fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let seconds = match row.get_ref(index)? {
        ValueRef::Integer(seconds) => Some(seconds),
        ValueRef::Real(seconds) => Some(seconds as i64),
        ValueRef::Text(text) => {
            let text = String::from_utf8_lossy(text);
            let text = text.trim();
            match text.parse::<i64>() {
                Ok(seconds) => Some(seconds),
                Err(_) => {
                    return Ok(DateTime::parse_from_rfc3339(text)
                        .ok()
                        .map(|parsed| parsed.with_timezone(&Utc)))
                }
            }
        }
        ValueRef::Null | ValueRef::Blob(_) => None,
    };
    Ok(seconds.and_then(|seconds| Utc.timestamp_opt(seconds, 0).single()))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: timestamp_at(row, 2)?,
        updated_at: timestamp_at(row, 3)?,
        status: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        timestamp: timestamp_at(row, 4)?,
    })
}

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        input_tokens: row.get(2)?,
        output_tokens: row.get(3)?,
        total_tokens: row.get(4)?,
        timestamp: timestamp_at(row, 5)?,
    })
}
