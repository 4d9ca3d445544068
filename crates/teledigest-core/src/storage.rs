//! SQLite message store.
//!
//! One row per collected message in `messages`, mirrored into the FTS5 table
//! `messages_fts` for relevance retrieval. When the SQLite build has no FTS5
//! every query transparently falls back to plain range scans.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::{
    domain::{ChannelMessage, StoredMessage, TimeWindow, UserId},
    Error, Result,
};

pub const DEFAULT_MAX_DOCS: usize = 200;

/// FTS5 query tuned for "important news" (war, politics, economy) in
/// Ukrainian, Russian and English.
pub const DEFAULT_RELEVANCE_QUERY: &str = concat!(
    // Ukrainian
    "війна OR наступ* OR контрнаступ* OR фронт OR лінія OR оборон* ",
    "OR штурм* OR артилер* OR обстріл* OR удар* OR ракета* OR безпілотн* ",
    "OR дрон* OR ППО OR мобілізац* OR призов* OR резерв* OR втрат* ",
    "OR збройн* OR ЗСУ OR Сили OR Оборони OR Генштаб OR Міноборони ",
    "OR санкц* OR економік* OR енергетик* OR ринок* OR бюджет* ",
    "OR НАТО OR ЄС OR Європейськ* OR допомог* OR підтримк* ",
    "OR переговор* OR дипломат* ",
    "OR Зеленськ* OR Умеров OR Умєров ",
    // Russian
    "OR войн* OR наступлен* OR контрнаступ* OR фронт OR линия ",
    "OR оборон* OR штурм* OR артилл* OR обстрел* OR удар* OR ракет* ",
    "OR беспилотн* OR дрон* OR ПВО OR мобилизац* OR призыв OR резерв* ",
    "OR потерь OR армия OR ВСУ OR Минобороны ",
    "OR санкц* OR экономик* OR энергетик* OR бюджет* OR рынок* ",
    "OR НАТО OR ЕС OR Европейск* OR помощ* OR поддержк* ",
    "OR переговор* OR дипломат* ",
    "OR Зеленск* OR Умеров ",
    // English
    "OR war OR offensive OR counteroffensive OR front OR frontline ",
    "OR defense OR assault OR artillery OR shell* OR strike* OR attack* ",
    "OR missile* OR drone* OR UAV OR air OR defense OR mobilization ",
    "OR draft OR reserve OR casualties OR military OR armed OR forces ",
    "OR sanctions OR economy OR energy OR market OR budget ",
    "OR NATO OR EU OR European OR aid OR support ",
    "OR negotiations OR diplomacy ",
    "OR Zelensky OR Zelenskiy OR Zelenskyy OR Umerov",
);

/// Fixed-width UTC timestamp: lexicographic order equals chronological order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `[00:00:00, 23:59:59.999999]` of `day` in UTC.
pub fn day_window(day: NaiveDate) -> TimeWindow {
    let start = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
    let end = start + chrono::Duration::days(1) - chrono::Duration::microseconds(1);
    TimeWindow::new(start, end)
}

pub struct MessageStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    fts: AtomicBool,
    relevance_query: String,
}

impl MessageStore {
    /// Open (creating parent directories) and initialize the database at `path`.
    pub fn open(path: impl AsRef<Path>, relevance_query: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let store = Self {
            path,
            conn: Mutex::new(conn),
            fts: AtomicBool::new(false),
            relevance_query: relevance_query.into(),
        };
        store.init_db()?;
        Ok(store)
    }

    /// In-memory store (tests, dry runs).
    pub fn open_in_memory(relevance_query: impl Into<String>) -> Result<Self> {
        let store = Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(Connection::open_in_memory()?),
            fts: AtomicBool::new(false),
            relevance_query: relevance_query.into(),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts.load(Ordering::SeqCst)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::External("message store lock poisoned".to_string()))
    }

    pub fn init_db(&self) -> Result<()> {
        info!("Initializing SQLite database at {}", self.path.display());
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                channel TEXT,
                date TEXT,
                text TEXT
            );
            CREATE INDEX IF NOT EXISTS messages_date_idx ON messages(date);
            CREATE TABLE IF NOT EXISTS authorized_users (
                user_id INTEGER PRIMARY KEY,
                authorized_at TEXT NOT NULL
            );",
        )?;

        match conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
             USING fts5(id, channel, date, text);",
        ) {
            Ok(()) => {
                self.fts.store(true, Ordering::SeqCst);
                info!("FTS5 virtual table messages_fts initialized.");
            }
            Err(e) => {
                self.fts.store(false, Ordering::SeqCst);
                error!("Failed to create FTS5 table (does your SQLite support FTS5?): {e}");
            }
        }

        Ok(())
    }

    /// Store a message. Returns `false` for empty text and duplicates.
    pub fn save_message(&self, msg: &ChannelMessage) -> Result<bool> {
        if msg.text.trim().is_empty() {
            return Ok(false);
        }
        let id = msg.source.storage_id();
        let iso = format_timestamp(&msg.date);

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (id, channel, date, text) VALUES (?1, ?2, ?3, ?4)",
            params![id, msg.channel, iso, msg.text],
        )?;
        if inserted == 0 {
            debug!("message {id} already stored");
            return Ok(false);
        }

        if self.fts_enabled() {
            if let Err(e) = conn.execute(
                "INSERT INTO messages_fts (id, channel, date, text) VALUES (?1, ?2, ?3, ?4)",
                params![id, msg.channel, iso, msg.text],
            ) {
                warn!("Failed to insert into messages_fts (FTS disabled?): {e}");
            }
        }

        Ok(true)
    }

    /// All messages with `start <= date <= end`, oldest first.
    pub fn get_messages_for_range(
        &self,
        window: TimeWindow,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel, text FROM messages
             WHERE date BETWEEN ?1 AND ?2
             ORDER BY date ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![
                    format_timestamp(&window.start),
                    format_timestamp(&window.end),
                    sql_limit(limit)
                ],
                row_to_message,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_messages_for_day(
        &self,
        day: NaiveDate,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.get_messages_for_range(day_window(day), limit)
    }

    /// FTS relevance retrieval for `window`; falls back to a plain range scan
    /// when FTS is unavailable, fails, or finds nothing.
    pub fn get_relevant_messages_for_range(
        &self,
        window: TimeWindow,
        max_docs: usize,
    ) -> Result<Vec<StoredMessage>> {
        let start_iso = format_timestamp(&window.start);
        let end_iso = format_timestamp(&window.end);

        if self.fts_enabled() {
            match self.query_fts(&start_iso, &end_iso, max_docs) {
                Ok(rows) if !rows.is_empty() => {
                    info!(
                        "FTS retrieval for {start_iso} - {end_iso} returned {} messages (max {max_docs}).",
                        rows.len()
                    );
                    return Ok(rows);
                }
                Ok(_) => info!(
                    "FTS retrieval returned 0 rows for {start_iso} - {end_iso} - falling back to simple range."
                ),
                Err(e) => warn!("FTS retrieval failed ({e}). Falling back to full range scan."),
            }
        } else {
            debug!("FTS disabled, using simple range scan");
        }

        self.get_messages_for_range(window, Some(max_docs))
    }

    fn query_fts(&self, start_iso: &str, end_iso: &str, max_docs: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel, text FROM messages_fts
             WHERE messages_fts MATCH ?1
               AND date BETWEEN ?2 AND ?3
             ORDER BY date ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![self.relevance_query, start_iso, end_iso, sql_limit(Some(max_docs))],
                row_to_message,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_relevant_messages_for_day(
        &self,
        day: NaiveDate,
        max_docs: usize,
    ) -> Result<Vec<StoredMessage>> {
        self.get_relevant_messages_for_range(day_window(day), max_docs)
    }

    /// Rolling 24h window ending now (UTC).
    pub fn get_messages_last_24h(&self, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        self.get_messages_for_range(TimeWindow::last_hours(24), limit)
    }

    pub fn get_relevant_messages_last_24h(&self, max_docs: usize) -> Result<Vec<StoredMessage>> {
        self.get_relevant_messages_for_range(TimeWindow::last_hours(24), max_docs)
    }

    pub fn count_messages_for_range(&self, window: TimeWindow) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE date BETWEEN ?1 AND ?2",
            params![format_timestamp(&window.start), format_timestamp(&window.end)],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn count_messages(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Persist a runtime grant from `/auth`. Idempotent.
    pub fn authorize_user(&self, user_id: UserId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO authorized_users (user_id, authorized_at) VALUES (?1, ?2)",
            params![user_id.0, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn is_user_authorized(&self, user_id: UserId) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM authorized_users WHERE user_id = ?1",
                params![user_id.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        channel: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
        text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
    })
}

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit
        .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, MessageRef};

    fn msg(chat: i64, id: i32, date: DateTime<Utc>, text: &str) -> ChannelMessage {
        ChannelMessage {
            source: MessageRef {
                chat_id: ChatId(chat),
                message_id: MessageId(id),
            },
            channel: format!("@chan{}", chat.abs()),
            date,
            text: text.to_string(),
        }
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn store() -> MessageStore {
        MessageStore::open_in_memory(DEFAULT_RELEVANCE_QUERY).unwrap()
    }

    #[test]
    fn timestamps_are_fixed_width() {
        assert_eq!(format_timestamp(&at(1, 12, 0)), "2026-03-01T12:00:00.000000Z");
        let with_micros = at(1, 12, 0) + chrono::Duration::microseconds(5);
        assert_eq!(format_timestamp(&with_micros), "2026-03-01T12:00:00.000005Z");
    }

    #[test]
    fn day_window_covers_whole_day() {
        let w = day_window(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(format_timestamp(&w.start), "2026-03-01T00:00:00.000000Z");
        assert_eq!(format_timestamp(&w.end), "2026-03-01T23:59:59.999999Z");
    }

    #[test]
    fn empty_text_is_not_stored() {
        let s = store();
        assert!(!s.save_message(&msg(1, 1, at(1, 10, 0), "   ")).unwrap());
        assert_eq!(s.count_messages().unwrap(), 0);
    }

    #[test]
    fn duplicates_are_ignored_in_both_tables() {
        let s = store();
        let m = msg(1, 7, at(1, 10, 0), "missile strike reported");
        assert!(s.save_message(&m).unwrap());
        assert!(!s.save_message(&m).unwrap());
        assert_eq!(s.count_messages().unwrap(), 1);

        let fts_rows: i64 = s
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[test]
    fn same_message_id_in_different_chats_is_distinct() {
        let s = store();
        assert!(s.save_message(&msg(1, 7, at(1, 10, 0), "a")).unwrap());
        assert!(s.save_message(&msg(2, 7, at(1, 10, 0), "b")).unwrap());
        assert_eq!(s.count_messages().unwrap(), 2);
    }

    #[test]
    fn range_is_inclusive_ordered_and_limited() {
        let s = store();
        s.save_message(&msg(1, 3, at(1, 12, 0), "third")).unwrap();
        s.save_message(&msg(1, 1, at(1, 10, 0), "first")).unwrap();
        s.save_message(&msg(1, 2, at(1, 11, 0), "second")).unwrap();
        s.save_message(&msg(1, 4, at(2, 10, 0), "next day")).unwrap();

        let window = TimeWindow::new(at(1, 10, 0), at(1, 12, 0));
        let texts = s
            .get_messages_for_range(window, None)
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let limited = s.get_messages_for_range(window, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].channel, "@chan1");

        assert_eq!(s.count_messages_for_range(window).unwrap(), 3);
    }

    #[test]
    fn day_query_uses_calendar_day() {
        let s = store();
        s.save_message(&msg(1, 1, at(1, 0, 0), "midnight")).unwrap();
        s.save_message(&msg(1, 2, at(1, 23, 59), "late")).unwrap();
        s.save_message(&msg(1, 3, at(2, 0, 0), "tomorrow")).unwrap();

        let rows = s
            .get_messages_for_day(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), None)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn relevance_prefers_fts_matches() {
        let s = store();
        s.save_message(&msg(1, 1, at(1, 10, 0), "cat pictures of the day")).unwrap();
        s.save_message(&msg(1, 2, at(1, 11, 0), "New sanctions package announced")).unwrap();
        s.save_message(&msg(1, 3, at(1, 12, 0), "Drone attack on the port")).unwrap();

        let window = TimeWindow::new(at(1, 0, 0), at(1, 23, 0));
        let rows = s.get_relevant_messages_for_range(window, DEFAULT_MAX_DOCS).unwrap();
        let texts = rows.iter().map(|m| m.text.as_str()).collect::<Vec<_>>();
        assert_eq!(
            texts,
            vec!["New sanctions package announced", "Drone attack on the port"]
        );
    }

    #[test]
    fn relevance_falls_back_when_nothing_matches() {
        let s = store();
        s.save_message(&msg(1, 1, at(1, 10, 0), "cat pictures of the day")).unwrap();
        s.save_message(&msg(1, 2, at(1, 11, 0), "recipe of the week")).unwrap();

        let window = TimeWindow::new(at(1, 0, 0), at(1, 23, 0));
        let rows = s.get_relevant_messages_for_range(window, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "cat pictures of the day");
    }

    #[test]
    fn relevance_falls_back_on_fts_query_error() {
        let s = MessageStore::open_in_memory("AND OR (").unwrap();
        s.save_message(&msg(1, 1, at(1, 10, 0), "anything")).unwrap();

        let window = TimeWindow::new(at(1, 0, 0), at(1, 23, 0));
        let rows = s.get_relevant_messages_for_range(window, 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn last_24h_window_excludes_old_messages() {
        let s = store();
        let now = Utc::now();
        s.save_message(&msg(1, 1, now - chrono::Duration::hours(30), "old war news")).unwrap();
        s.save_message(&msg(1, 2, now - chrono::Duration::hours(2), "fresh war news")).unwrap();

        let rows = s.get_messages_last_24h(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "fresh war news");

        let relevant = s.get_relevant_messages_last_24h(DEFAULT_MAX_DOCS).unwrap();
        assert_eq!(relevant.len(), 1);
    }

    #[test]
    fn runtime_authorizations_persist() {
        let s = store();
        assert!(!s.is_user_authorized(UserId(5)).unwrap());
        s.authorize_user(UserId(5)).unwrap();
        s.authorize_user(UserId(5)).unwrap();
        assert!(s.is_user_authorized(UserId(5)).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/messages.db");
        {
            let s = MessageStore::open(&path, DEFAULT_RELEVANCE_QUERY).unwrap();
            s.save_message(&msg(1, 1, at(1, 10, 0), "persisted")).unwrap();
        }
        let s = MessageStore::open(&path, DEFAULT_RELEVANCE_QUERY).unwrap();
        assert_eq!(s.count_messages().unwrap(), 1);
        assert!(s.fts_enabled());
    }
}
