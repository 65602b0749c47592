//! Read-only access to the macOS Messages store (`~/Library/Messages/chat.db`).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::{MessageSource, SourceRecord};
use crate::conversation::{Cursor, Event, EventId, EventKind, ReactionGlyph};
use crate::error::{ConfigurationError, MalformedEventError, SourceError};

/// Seconds between the Unix epoch and 2001-01-01, where Apple dates start.
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;
const POLL_BATCH_LIMIT: i64 = 500;
/// Sender recorded for rows sent from this account.
pub const SELF_SENDER: &str = "me";

const SELECT_MESSAGES: &str = "
    SELECT m.ROWID, h.id, m.text, m.date, m.is_from_me, m.attributedBody,
           m.associated_message_guid, m.associated_message_type
    FROM message m
    JOIN chat_message_join cmj ON m.ROWID = cmj.message_id
    LEFT JOIN handle h ON m.handle_id = h.ROWID
    WHERE cmj.chat_id = ?1";

pub struct ChatDbSource {
    conn: Mutex<Connection>,
    chat_rowid: i64,
}

impl ChatDbSource {
    /// Opens the store read-only and resolves `chat_name` by display name or
    /// chat identifier.
    pub fn open(path: &Path, chat_name: &str) -> Result<Self, ConfigurationError> {
        let unavailable = |reason: String| ConfigurationError::SourceUnavailable {
            path: path.display().to_string(),
            reason,
        };
        if !path.exists() {
            return Err(unavailable("file does not exist".to_string()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| unavailable(e.to_string()))?;

        let chat_rowid: Option<i64> = conn
            .query_row(
                "SELECT ROWID FROM chat WHERE display_name = ?1 OR chat_identifier = ?1 LIMIT 1",
                params![chat_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unavailable(format!("{} (the terminal may need Full Disk Access)", e)))?;
        let chat_rowid =
            chat_rowid.ok_or_else(|| ConfigurationError::ChatNotFound(chat_name.to_string()))?;

        tracing::info!("Opened message store {:?}, chat '{}' (row {})", path, chat_name, chat_rowid);
        Ok(Self {
            conn: Mutex::new(conn),
            chat_rowid,
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, SourceError> {
        self.conn.lock().map_err(|_| SourceError::Poisoned)
    }

    fn fetch<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<SourceRecord>, SourceError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|raw| raw.into_event(&conn)).collect())
    }
}

#[async_trait]
impl MessageSource for ChatDbSource {
    async fn latest_cursor(&self) -> Result<Cursor, SourceError> {
        let conn = self.lock_conn()?;
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(message_id), 0) FROM chat_message_join WHERE chat_id = ?1",
            params![self.chat_rowid],
            |row| row.get(0),
        )?;
        Ok(Cursor::at(seq))
    }

    async fn bootstrap_tail(&self, n: usize) -> Result<Vec<SourceRecord>, SourceError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let sql = format!("{} ORDER BY m.ROWID DESC LIMIT ?2", SELECT_MESSAGES);
        let mut records = self.fetch(&sql, params![self.chat_rowid, limit])?;
        records.reverse();
        Ok(records)
    }

    async fn poll(&self, since: Cursor) -> Result<Vec<SourceRecord>, SourceError> {
        let sql = format!("{} AND m.ROWID > ?2 ORDER BY m.ROWID ASC LIMIT ?3", SELECT_MESSAGES);
        self.fetch(&sql, params![self.chat_rowid, since.seq(), POLL_BATCH_LIMIT])
    }
}

struct RawRow {
    rowid: i64,
    handle: Option<String>,
    text: Option<String>,
    date: Option<i64>,
    is_from_me: bool,
    attributed_body: Option<Vec<u8>>,
    associated_guid: Option<String>,
    associated_type: Option<i64>,
}

impl RawRow {
    // Only the row id is mandatory. Columns with unexpected types read as
    // NULL so one odd row cannot fail the whole batch.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rowid: row.get(0)?,
            handle: row.get::<_, Option<String>>(1).ok().flatten(),
            text: row.get::<_, Option<String>>(2).ok().flatten(),
            date: row.get::<_, Option<i64>>(3).ok().flatten(),
            is_from_me: row.get::<_, Option<i64>>(4).ok().flatten().unwrap_or(0) != 0,
            attributed_body: row.get::<_, Option<Vec<u8>>>(5).ok().flatten(),
            associated_guid: row.get::<_, Option<String>>(6).ok().flatten(),
            associated_type: row.get::<_, Option<i64>>(7).ok().flatten(),
        })
    }

    fn into_event(self, conn: &Connection) -> SourceRecord {
        let id = EventId::source(self.rowid);
        let malformed = |reason: String| MalformedEventError::new(Some(self.rowid), reason);

        let timestamp = self
            .date
            .and_then(apple_timestamp)
            .ok_or_else(|| malformed("missing or invalid date".to_string()))?;
        let sender = if self.is_from_me {
            SELF_SENDER.to_string()
        } else {
            self.handle.clone().unwrap_or_default()
        };

        match self.associated_type.unwrap_or(0) {
            0 => {
                let text = self
                    .text
                    .as_deref()
                    .and_then(normalize_text)
                    .or_else(|| self.attributed_body.as_deref().and_then(decode_attributed_body))
                    .ok_or_else(|| malformed("no readable text".to_string()))?;
                Ok(Event::text(id, sender, text, self.is_from_me, timestamp))
            }
            code @ (2000..=2005 | 3000..=3005) => {
                let glyph = ReactionGlyph::from_tapback_index(code % 1000)
                    .ok_or_else(|| malformed(format!("unknown tapback {}", code)))?;
                let target = self
                    .associated_guid
                    .as_deref()
                    .and_then(|guid| resolve_target(conn, guid));
                Ok(Event {
                    id,
                    sender,
                    kind: EventKind::Reaction {
                        glyph,
                        removed: code >= 3000,
                        target,
                    },
                    is_self: self.is_from_me,
                    timestamp,
                })
            }
            other => Err(malformed(format!("unsupported associated message type {}", other))),
        }
    }
}

/// Reaction rows point at their target as `p:0/<guid>` or `bp:<guid>`.
fn resolve_target(conn: &Connection, raw_guid: &str) -> Option<EventId> {
    let guid = match raw_guid.split_once('/') {
        Some((_, guid)) => guid,
        None => raw_guid.strip_prefix("bp:").unwrap_or(raw_guid),
    };
    conn.query_row(
        "SELECT ROWID FROM message WHERE guid = ?1",
        params![guid],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .ok()
    .flatten()
    .map(EventId::source)
}

/// Converts an Apple date (seconds, or nanoseconds on newer systems, since
/// 2001-01-01 UTC).
pub fn apple_timestamp(raw: i64) -> Option<DateTime<Utc>> {
    if raw <= 0 {
        return None;
    }
    let (secs, nanos) = if raw > 1_000_000_000_000 {
        (raw / 1_000_000_000, (raw % 1_000_000_000) as u32)
    } else {
        (raw, 0)
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET_SECS, nanos).single()
}

fn normalize_text(raw: &str) -> Option<String> {
    let text = raw.replace('\u{FFFC}', "[Attachment]");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Extracts the plain string from an `attributedBody` typedstream blob.
pub fn decode_attributed_body(blob: &[u8]) -> Option<String> {
    decode_typedstream_string(blob).or_else(|| longest_readable_segment(blob))
}

fn decode_typedstream_string(blob: &[u8]) -> Option<String> {
    const MARKER: &[u8] = b"NSString";
    let start = blob.windows(MARKER.len()).position(|w| w == MARKER)? + MARKER.len();
    let rest = &blob[start..];
    let plus = rest.iter().take(16).position(|&b| b == b'+')?;
    let rest = &rest[plus + 1..];

    let (len, offset) = match *rest.first()? {
        0x81 => (u16::from_le_bytes([*rest.get(1)?, *rest.get(2)?]) as usize, 3),
        0x82 => (
            u32::from_le_bytes([*rest.get(1)?, *rest.get(2)?, *rest.get(3)?, *rest.get(4)?]) as usize,
            5,
        ),
        n => (n as usize, 1),
    };
    let bytes = rest.get(offset..offset + len)?;
    std::str::from_utf8(bytes).ok().and_then(normalize_text)
}

fn longest_readable_segment(blob: &[u8]) -> Option<String> {
    const NOISE_PREFIXES: [&str; 4] = ["NS", "__kIM", "streamtyped", "DDScannerResult"];
    let decoded = String::from_utf8_lossy(blob);
    decoded
        .split(|c: char| c.is_control() || c == '\u{FFFD}')
        .map(str::trim)
        .filter(|seg| seg.chars().count() > 1)
        .filter(|seg| !NOISE_PREFIXES.iter().any(|p| seg.starts_with(p)))
        .max_by_key(|seg| seg.chars().filter(|c| c.is_alphanumeric()).count())
        .and_then(normalize_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14T22:13:20Z in Apple nanoseconds.
    const BASE_DATE_NS: i64 = (1_700_000_000 - APPLE_EPOCH_OFFSET_SECS) * 1_000_000_000;

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, display_name TEXT, chat_identifier TEXT);
             CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);
             CREATE TABLE message (
                 ROWID INTEGER PRIMARY KEY, guid TEXT, text TEXT, date INTEGER,
                 is_from_me INTEGER, handle_id INTEGER, attributedBody BLOB,
                 associated_message_guid TEXT, associated_message_type INTEGER);
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             INSERT INTO chat VALUES (1, 'Family', 'chat100'), (2, 'Work', 'chat200');
             INSERT INTO handle VALUES (1, 'mom@example.com'), (2, '+15550002222');",
        )
        .unwrap();

        let body = b"\x04\x0bstreamtyped\x81\xe8\x03\x84\x01@\x84\x84\x84\x08NSString\x01\x94\x84\x01+\x10hi from mom \xf0\x9f\x91\x8b\x86\x84".to_vec();
        let rows: Vec<(i64, &str, Option<&str>, i64, i64, i64, Option<Vec<u8>>, Option<&str>, i64)> = vec![
            (1, "G1", Some("dinner at 7?"), 1, 0, 1, None, None, 0),
            (2, "G2", Some("sure"), 2, 1, 0, None, None, 0),
            (3, "G3", None, 3, 0, 1, Some(body), None, 0),
            (4, "G4", Some("Loved “sure”"), 4, 0, 2, None, Some("p:0/G2"), 2000),
            (5, "G5", None, 5, 0, 2, None, None, 0),
            (6, "G6", Some("sticker"), 6, 0, 2, None, None, 1000),
            (7, "G7", Some("other chat"), 7, 0, 1, None, None, 0),
        ];
        for (rowid, guid, text, offset, from_me, handle, blob, assoc, kind) in rows {
            conn.execute(
                "INSERT INTO message VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rowid,
                    guid,
                    text,
                    BASE_DATE_NS + offset * 1_000_000_000,
                    from_me,
                    handle,
                    blob,
                    assoc,
                    kind
                ],
            )
            .unwrap();
            let chat = if rowid == 7 { 2 } else { 1 };
            conn.execute(
                "INSERT INTO chat_message_join VALUES (?1, ?2)",
                params![chat, rowid],
            )
            .unwrap();
        }
        (dir, path)
    }

    #[test]
    fn unknown_chat_is_a_configuration_error() {
        let (_dir, path) = fixture();
        let err = ChatDbSource::open(&path, "Nope").err().unwrap();
        assert!(matches!(err, ConfigurationError::ChatNotFound(name) if name == "Nope"));

        let err = ChatDbSource::open(Path::new("/nonexistent/chat.db"), "Family").err().unwrap();
        assert!(matches!(err, ConfigurationError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn cursor_and_tail_are_scoped_to_the_chat() {
        let (_dir, path) = fixture();
        let source = ChatDbSource::open(&path, "chat100").unwrap();
        assert_eq!(source.latest_cursor().await.unwrap(), Cursor::at(6));

        let tail = source.bootstrap_tail(2).await.unwrap();
        let seqs: Vec<Option<i64>> = tail.iter().map(crate::source::record_seq).collect();
        assert_eq!(seqs, vec![Some(5), Some(6)]);
    }

    #[tokio::test]
    async fn poll_decodes_text_bodies_reactions_and_bad_rows() {
        let (_dir, path) = fixture();
        let source = ChatDbSource::open(&path, "Family").unwrap();
        let records = source.poll(Cursor::at(0)).await.unwrap();
        assert_eq!(records.len(), 6);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.body(), Some("dinner at 7?"));
        assert_eq!(first.sender, "mom@example.com");
        assert_eq!(first.timestamp.timestamp(), 1_700_000_001);

        let mine = records[1].as_ref().unwrap();
        assert!(mine.is_self);
        assert_eq!(mine.sender, SELF_SENDER);

        assert_eq!(records[2].as_ref().unwrap().body(), Some("hi from mom 👋"));

        let reaction = records[3].as_ref().unwrap();
        assert_eq!(
            reaction.kind,
            EventKind::Reaction {
                glyph: ReactionGlyph::Love,
                removed: false,
                target: Some(EventId::source(2)),
            }
        );

        let empty = records[4].as_ref().unwrap_err();
        assert_eq!(empty.record_id, Some(5));
        let sticker = records[5].as_ref().unwrap_err();
        assert!(sticker.reason.contains("1000"));

        let later = source.poll(Cursor::at(4)).await.unwrap();
        assert_eq!(later.len(), 2);
    }

    #[test]
    fn apple_dates_accept_seconds_and_nanoseconds() {
        let secs = apple_timestamp(700_000_000).unwrap();
        let nanos = apple_timestamp(700_000_000_000_000_000).unwrap();
        assert_eq!(secs, nanos);
        assert_eq!(secs.timestamp(), 700_000_000 + APPLE_EPOCH_OFFSET_SECS);
        assert!(apple_timestamp(0).is_none());
    }

    #[test]
    fn attributed_body_falls_back_to_readable_text() {
        let blob = b"\x04\x0bstreamtyped\x00NSAttributedString\x00see you soon\x00\x01";
        assert_eq!(decode_attributed_body(blob).as_deref(), Some("see you soon"));
    }
}
