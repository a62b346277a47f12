//! SQLite-backed store.
//!
//! Connections come from an `r2d2` pool in WAL mode and every query runs on
//! the blocking thread pool. Writes that allocate message ids use immediate
//! transactions, so ids are committed in the order they are assigned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::Store;
use crate::call::{CallId, CallStatus, NewCall, VoiceCall};
use crate::chat::{Attachment, MediaKind, Message, MessageId, NewMessage, ReactionToggle};
use crate::error::{ChatError, Result};
use crate::moderation::{ModerationVerdict, VerdictStatus};
use crate::room::{NewRoom, Room, RoomId, RoomKind};

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_reactions",
        sql: include_str!("migrations/001_reactions.sql"),
    },
];

const POOL_MAX_SIZE: u32 = 8;
const BUSY_TIMEOUT_MS: u64 = 5_000;

const MESSAGE_COLUMNS: &str = "id, room_id, sender, content, created_at, is_read, reply_to, delivery_id";
const CALL_COLUMNS: &str = "id, room_id, initiator, participants, declined, status, start_time, end_time";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and applies pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_flags(flags)
            .with_init(|conn| {
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get::<_, String>(0))?;
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
                ))
            });
        let pool = Pool::builder().max_size(POOL_MAX_SIZE).build(manager)?;

        let conn = pool.get()?;
        let applied = run_migrations(&conn)?;
        if applied > 0 {
            info!("Applied {} storage migration(s) to {}", applied, path.as_ref().display());
        }

        Ok(SqliteStore { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

fn run_migrations(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _room_chat_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;
    let mut applied = 0;
    for migration in MIGRATIONS {
        let done: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM _room_chat_migrations WHERE name = ?1)",
            [migration.name],
            |row| row.get(0),
        )?;
        if done {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO _room_chat_migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, to_db_time(Utc::now())],
        )?;
        tx.commit()?;
        applied += 1;
    }
    Ok(applied)
}

fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn unknown_value(idx: usize, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected value {value:?}")),
    )
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn name_set_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn map_room(conn: &Connection, row: &Row<'_>) -> rusqlite::Result<Room> {
    let id: RoomId = row.get(0)?;
    let kind: String = row.get(2)?;
    let kind = match kind.as_str() {
        "direct" => RoomKind::Direct,
        "group" => RoomKind::Group,
        other => return Err(unknown_value(2, other)),
    };
    let mut stmt = conn.prepare_cached("SELECT user FROM room_members WHERE room_id = ?1")?;
    let members = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(Room {
        id,
        name: row.get(1)?,
        kind,
        members,
        created_at: time_at(row, 3)?,
    })
}

fn load_room(conn: &Connection, id: RoomId) -> Result<Room> {
    conn.query_row(
        "SELECT id, name, kind, created_at FROM rooms WHERE id = ?1",
        [id],
        |row| map_room(conn, row),
    )
    .optional()?
    .ok_or(ChatError::RoomNotFound(id))
}

fn insert_room(conn: &Connection, room: NewRoom) -> rusqlite::Result<Room> {
    let created_at = Utc::now();
    let kind = match room.kind {
        RoomKind::Direct => "direct",
        RoomKind::Group => "group",
    };
    conn.execute(
        "INSERT INTO rooms (name, kind, created_at) VALUES (?1, ?2, ?3)",
        params![room.name, kind, to_db_time(created_at)],
    )?;
    let id = conn.last_insert_rowid();
    for member in &room.members {
        conn.execute(
            "INSERT INTO room_members (room_id, user) VALUES (?1, ?2)",
            params![id, member],
        )?;
    }
    Ok(Room {
        id,
        name: room.name,
        kind: room.kind,
        members: room.members,
        created_at,
    })
}

fn direct_room_id(conn: &Connection, a: &str, b: &str) -> rusqlite::Result<Option<RoomId>> {
    conn.query_row(
        "SELECT r.id FROM rooms r
         JOIN room_members ma ON ma.room_id = r.id AND ma.user = ?1
         JOIN room_members mb ON mb.room_id = r.id AND mb.user = ?2
         WHERE r.kind = 'direct'
         ORDER BY r.id LIMIT 1",
        params![a, b],
        |row| row.get(0),
    )
    .optional()
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let delivery_id = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(Uuid::parse_str(&raw).map_err(|e| conversion_error(7, e))?),
        None => None,
    };
    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        media: Vec::new(),
        created_at: time_at(row, 4)?,
        is_read: row.get(5)?,
        reply_to: row.get(6)?,
        delivery_id,
    })
}

fn map_attachment(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let kind: String = row.get(0)?;
    let kind = MediaKind::parse(&kind).ok_or_else(|| unknown_value(0, &kind))?;
    let verdict = match row.get::<_, Option<String>>(2)? {
        None => None,
        Some(status) => {
            let status = VerdictStatus::parse(&status).ok_or_else(|| unknown_value(2, &status))?;
            let categories = match row.get::<_, Option<String>>(4)? {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(4, e))?,
                None => Default::default(),
            };
            Some(ModerationVerdict {
                status,
                confidence: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                categories,
                detail: row.get(5)?,
                moderated_at: optional_time_at(row, 6)?,
            })
        }
    };
    Ok(Attachment {
        kind,
        reference: row.get(1)?,
        verdict,
    })
}

fn attach_media(conn: &Connection, message: &mut Message) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT kind, reference, verdict_status, confidence, categories, detail, moderated_at
         FROM attachments WHERE message_id = ?1 ORDER BY rowid",
    )?;
    message.media = stmt
        .query_map([message.id], map_attachment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

fn map_call(row: &Row<'_>) -> rusqlite::Result<VoiceCall> {
    let status: String = row.get(5)?;
    Ok(VoiceCall {
        id: row.get(0)?,
        room_id: row.get(1)?,
        initiator: row.get(2)?,
        participants: name_set_at(row, 3)?,
        declined: name_set_at(row, 4)?,
        status: CallStatus::parse(&status).ok_or_else(|| unknown_value(5, &status))?,
        start_time: time_at(row, 6)?,
        end_time: optional_time_at(row, 7)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_room(&self, room: NewRoom) -> Result<Room> {
        room.validate()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created = insert_room(&tx, room)?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn room(&self, id: RoomId) -> Result<Room> {
        self.with_conn(move |conn| load_room(conn, id)).await
    }

    async fn find_direct_room(&self, a: &str, b: &str) -> Result<Option<Room>> {
        let (a, b) = (a.to_string(), b.to_string());
        self.with_conn(move |conn| {
            let id = direct_room_id(conn, &a, &b)?;
            id.map(|id| load_room(conn, id)).transpose()
        })
        .await
    }

    async fn open_direct_room(&self, a: &str, b: &str) -> Result<Room> {
        let room = NewRoom::direct(a, b)?;
        let (a, b) = (a.to_string(), b.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(id) = direct_room_id(&tx, &a, &b)? {
                return load_room(&tx, id);
            }
            let created = insert_room(&tx, room)?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let message = message.normalize()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let room_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM rooms WHERE id = ?1)",
                [message.room_id],
                |row| row.get(0),
            )?;
            if !room_exists {
                return Err(ChatError::RoomNotFound(message.room_id));
            }
            let reply_to = match message.reply_to {
                Some(id) => tx
                    .query_row(
                        "SELECT id FROM messages WHERE id = ?1 AND room_id = ?2",
                        params![id, message.room_id],
                        |row| row.get::<_, MessageId>(0),
                    )
                    .optional()?,
                None => None,
            };

            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO messages (room_id, sender, content, created_at, is_read, reply_to, delivery_id)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    message.room_id,
                    message.sender,
                    message.content,
                    to_db_time(created_at),
                    reply_to,
                    message.delivery_id.map(|d| d.to_string()),
                ],
            )?;
            let id = tx.last_insert_rowid();

            let media = message.attachments();
            for attachment in &media {
                tx.execute(
                    "INSERT INTO attachments (message_id, kind, reference, verdict_status)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        attachment.kind.as_str(),
                        attachment.reference,
                        attachment.verdict.as_ref().map(|v| v.status.as_str()),
                    ],
                )?;
            }
            tx.commit()?;

            Ok(Message {
                id,
                room_id: message.room_id,
                sender: message.sender,
                content: message.content,
                media,
                created_at,
                is_read: false,
                reply_to,
                delivery_id: message.delivery_id,
            })
        })
        .await
    }

    async fn message(&self, id: MessageId) -> Result<Message> {
        self.with_conn(move |conn| {
            let mut message = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    map_message,
                )
                .optional()?
                .ok_or(ChatError::MessageNotFound(id))?;
            attach_media(conn, &mut message)?;
            Ok(message)
        })
        .await
    }

    async fn list_messages(&self, room_id: RoomId, since: Option<MessageId>, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND id > ?2
                 ORDER BY id ASC LIMIT ?3"
            ))?;
            let mut messages = stmt
                .query_map(params![room_id, since.unwrap_or(0), limit], map_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for message in &mut messages {
                attach_media(conn, message)?;
            }
            Ok(messages)
        })
        .await
    }

    async fn mark_read(&self, room_id: RoomId, viewer: &str) -> Result<u64> {
        let viewer = viewer.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1 WHERE room_id = ?1 AND is_read = 0 AND sender != ?2",
                params![room_id, viewer],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn record_verdict(&self, message_id: MessageId, kind: MediaKind, verdict: &ModerationVerdict) -> Result<()> {
        let verdict = verdict.clone();
        self.with_conn(move |conn| {
            let categories = serde_json::to_string(&verdict.categories)?;
            let changed = conn.execute(
                "UPDATE attachments
                 SET verdict_status = ?3, confidence = ?4, categories = ?5, detail = ?6, moderated_at = ?7
                 WHERE message_id = ?1 AND kind = ?2",
                params![
                    message_id,
                    kind.as_str(),
                    verdict.status.as_str(),
                    verdict.confidence,
                    categories,
                    verdict.detail,
                    verdict.moderated_at.map(to_db_time),
                ],
            )?;
            if changed == 0 {
                return Err(ChatError::Storage(format!(
                    "message {message_id} has no {} attachment",
                    kind.as_str()
                )));
            }
            Ok(())
        })
        .await
    }

    async fn toggle_reaction(&self, message_id: MessageId, user: &str, reaction: &str) -> Result<ReactionToggle> {
        let (user, reaction) = (user.to_string(), reaction.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
                [message_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(ChatError::MessageNotFound(message_id));
            }
            let removed = tx.execute(
                "DELETE FROM message_reactions WHERE message_id = ?1 AND user = ?2 AND reaction = ?3",
                params![message_id, user, reaction],
            )?;
            if removed == 0 {
                tx.execute(
                    "INSERT INTO message_reactions (message_id, user, reaction, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![message_id, user, reaction, to_db_time(Utc::now())],
                )?;
            }
            let reactions = {
                let mut stmt = tx.prepare_cached(
                    "SELECT reaction, COUNT(*) FROM message_reactions
                     WHERE message_id = ?1 GROUP BY reaction",
                )?;
                let counts = stmt
                    .query_map([message_id], |row| {
                        let count: i64 = row.get(1)?;
                        Ok((row.get::<_, String>(0)?, u64::try_from(count).unwrap_or_default()))
                    })?
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
                counts
            };
            tx.commit()?;
            Ok(ReactionToggle {
                added: removed == 0,
                reactions,
            })
        })
        .await
    }

    async fn create_call(&self, call: NewCall) -> Result<VoiceCall> {
        self.with_conn(move |conn| {
            let room_exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM rooms WHERE id = ?1)",
                [call.room_id],
                |row| row.get(0),
            )?;
            if !room_exists {
                return Err(ChatError::RoomNotFound(call.room_id));
            }
            let draft = VoiceCall::new(0, call);
            conn.execute(
                "INSERT INTO voice_calls (room_id, initiator, participants, declined, status, start_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.room_id,
                    draft.initiator,
                    serde_json::to_string(&draft.participants)?,
                    serde_json::to_string(&draft.declined)?,
                    draft.status.as_str(),
                    to_db_time(draft.start_time),
                ],
            )?;
            Ok(VoiceCall {
                id: conn.last_insert_rowid(),
                ..draft
            })
        })
        .await
    }

    async fn call(&self, id: CallId) -> Result<VoiceCall> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {CALL_COLUMNS} FROM voice_calls WHERE id = ?1"),
                [id],
                map_call,
            )
            .optional()?
            .ok_or(ChatError::CallNotFound(id))
        })
        .await
    }

    async fn save_call(&self, call: &VoiceCall) -> Result<()> {
        let call = call.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE voice_calls
                 SET participants = ?2, declined = ?3, status = ?4, end_time = ?5
                 WHERE id = ?1",
                params![
                    call.id,
                    serde_json::to_string(&call.participants)?,
                    serde_json::to_string(&call.declined)?,
                    call.status.as_str(),
                    call.end_time.map(to_db_time),
                ],
            )?;
            if changed == 0 {
                return Err(ChatError::CallNotFound(call.id));
            }
            Ok(())
        })
        .await
    }

    async fn active_call(&self, room_id: RoomId) -> Result<Option<VoiceCall>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {CALL_COLUMNS} FROM voice_calls
                         WHERE room_id = ?1 AND status IN ('initiated', 'ongoing')
                         ORDER BY id ASC LIMIT 1"
                    ),
                    [room_id],
                    map_call,
                )
                .optional()?)
        })
        .await
    }
}
