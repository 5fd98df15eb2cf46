//! SQLite storage for accounts, sessions and saved transcripts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;

use crate::extract::MessagePair;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("failed to create data directory: {0}")]
    CreateDir(std::io::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Owner {
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredConversation {
    pub prompt: String,
    pub response: String,
    pub pp_prompt: String,
    pub pp_response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredLink {
    pub id: i64,
    pub user: Owner,
    pub title: String,
    pub link: String,
    pub updated_at: String,
    pub conversations: Vec<StoredConversation>,
}

// ── Schema ───────────────────────────────────────────────────────────────────

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id            INTEGER PRIMARY KEY,
        name          TEXT NOT NULL,
        username      TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        token      TEXT PRIMARY KEY,
        user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS links (
        id         INTEGER PRIMARY KEY,
        user_id    INTEGER NOT NULL REFERENCES users(id),
        title      TEXT NOT NULL,
        link       TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_links_user ON links(user_id, updated_at);

    CREATE TABLE IF NOT EXISTS conversations (
        id          INTEGER PRIMARY KEY,
        link_id     INTEGER NOT NULL REFERENCES links(id) ON DELETE CASCADE,
        position    INTEGER NOT NULL,
        prompt      TEXT NOT NULL,
        response    TEXT NOT NULL,
        pp_prompt   TEXT NOT NULL,
        pp_response TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_link ON conversations(link_id, position);
";

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Map UNIQUE violations to [`DbError::Conflict`].
fn unique(what: &'static str) -> impl Fn(rusqlite::Error) -> DbError {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            DbError::Conflict(what)
        }
        _ => DbError::Sqlite(e),
    }
}

// ── Database handle ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let mut conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&mut conn)
    }

    // ── Users ────────────────────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, username: &str, password_hash: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO users (name, username, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, username, password_hash, now],
            )
            .map_err(unique("username"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DbError> {
        self.find_user_where("username = ?1", username)
    }

    pub fn find_user(&self, id: i64) -> Result<Option<User>, DbError> {
        self.find_user_where("id = ?1", id)
    }

    fn find_user_where(
        &self,
        clause: &str,
        value: impl rusqlite::ToSql,
    ) -> Result<Option<User>, DbError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, name, username, password_hash FROM users WHERE {}",
                clause
            );
            let user = conn
                .query_row(&sql, params![value], |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        username: row.get(2)?,
                        password_hash: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(user)
        })
    }

    pub fn username_exists(&self, username: &str) -> Result<bool, DbError> {
        Ok(self.find_user_by_username(username)?.is_some())
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn create_session(&self, token: &str, user_id: i64, expires_at: i64) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, expires_at],
            )?;
            Ok(())
        })
    }

    /// Resolve a token to its user id. Expired sessions are removed.
    pub fn session_user(&self, token: &str, now: i64) -> Result<Option<i64>, DbError> {
        self.with_conn(|conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
                    params![token],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((user_id, expires_at)) if expires_at > now => Ok(Some(user_id)),
                Some(_) => {
                    conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    pub fn delete_session(&self, token: &str) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
            Ok(())
        })
    }

    // ── Links ────────────────────────────────────────────────────────────────

    pub fn link_exists(&self, link: &str) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM links WHERE link = ?1", params![link], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn link_owned_by(&self, link_id: i64, user_id: i64) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM links WHERE id = ?1 AND user_id = ?2",
                    params![link_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Store a link together with its conversation, in pairing order.
    pub fn insert_link(
        &self,
        user_id: i64,
        title: &str,
        link: &str,
        pairs: &[MessagePair],
    ) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO links (user_id, title, link, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![user_id, title, link, now],
            )
            .map_err(unique("link"))?;
            let link_id = tx.last_insert_rowid();
            insert_conversations(&tx, link_id, pairs)?;
            tx.commit()?;
            Ok(link_id)
        })
    }

    /// Swap title, link and conversation of an owned link.
    /// Returns `false` when the link does not exist or is not owned by `user_id`.
    pub fn replace_link(
        &self,
        link_id: i64,
        user_id: i64,
        title: &str,
        link: &str,
        pairs: &[MessagePair],
    ) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let updated = tx
                .execute(
                    "UPDATE links SET title = ?1, link = ?2, updated_at = ?3
                     WHERE id = ?4 AND user_id = ?5",
                    params![title, link, now_rfc3339(), link_id, user_id],
                )
                .map_err(unique("link"))?;
            if updated == 0 {
                return Ok(false);
            }
            tx.execute(
                "DELETE FROM conversations WHERE link_id = ?1",
                params![link_id],
            )?;
            insert_conversations(&tx, link_id, pairs)?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn delete_link(&self, link_id: i64, user_id: i64) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM links WHERE id = ?1 AND user_id = ?2",
                params![link_id, user_id],
            )?;
            Ok(deleted > 0)
        })
    }

    /// All links of a user, most recently updated first.
    pub fn list_links(&self, user_id: i64) -> Result<Vec<StoredLink>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT l.id, u.name, u.username, l.title, l.link, l.updated_at
                 FROM links l JOIN users u ON u.id = l.user_id
                 WHERE l.user_id = ?1
                 ORDER BY l.updated_at DESC, l.id DESC",
            )?;
            let mut links = stmt
                .query_map(params![user_id], |row| {
                    Ok(StoredLink {
                        id: row.get(0)?,
                        user: Owner {
                            name: row.get(1)?,
                            username: row.get(2)?,
                        },
                        title: row.get(3)?,
                        link: row.get(4)?,
                        updated_at: row.get(5)?,
                        conversations: Vec::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut conv_stmt = conn.prepare(
                "SELECT prompt, response, pp_prompt, pp_response
                 FROM conversations WHERE link_id = ?1 ORDER BY position",
            )?;
            for link in &mut links {
                link.conversations = conv_stmt
                    .query_map(params![link.id], |row| {
                        Ok(StoredConversation {
                            prompt: row.get(0)?,
                            response: row.get(1)?,
                            pp_prompt: row.get(2)?,
                            pp_response: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
            }
            Ok(links)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

fn insert_conversations(
    conn: &Connection,
    link_id: i64,
    pairs: &[MessagePair],
) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO conversations (link_id, position, prompt, response, pp_prompt, pp_response)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (position, pair) in pairs.iter().enumerate() {
        stmt.execute(params![
            link_id,
            position as i64,
            pair.prompt_raw,
            pair.response_raw,
            pair.prompt_normalized,
            pair.response_normalized,
        ])?;
    }
    Ok(())
}
