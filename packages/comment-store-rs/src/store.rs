//! SQLite-backed persistence for comment threads.
//!
//! One row per thread (anchor columns inline), one row per comment with a
//! `position` ordinal preserving conversation order, and a per-file tag
//! dictionary. Comment tags are stored as JSON text; rows whose tags fail to
//! parse are skipped with a warning rather than failing the whole load.

use napi_derive::napi;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
      version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS threads (
      thread_id TEXT PRIMARY KEY,
      file_path TEXT NOT NULL,
      anchor_text TEXT NOT NULL,
      context_before TEXT NOT NULL,
      context_after TEXT NOT NULL,
      anchor_offset INTEGER NOT NULL,
      anchor_length INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS comments (
      comment_id TEXT PRIMARY KEY,
      thread_id TEXT NOT NULL,
      position INTEGER NOT NULL,
      content TEXT NOT NULL,
      author TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      status TEXT,
      tags TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS file_tags (
      file_path TEXT NOT NULL,
      tag TEXT NOT NULL,
      UNIQUE(file_path, tag)
    );

    CREATE INDEX IF NOT EXISTS idx_threads_file ON threads(file_path);
    CREATE INDEX IF NOT EXISTS idx_comments_thread ON comments(thread_id, position);
    "#,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create db directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted anchor fields, round-tripped losslessly.
#[napi(object)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRecord {
    pub text: String,
    #[napi(js_name = "contextBefore")]
    pub context_before: String,
    #[napi(js_name = "contextAfter")]
    pub context_after: String,
    pub offset: u32,
    pub length: u32,
}

/// One comment in a thread. `status` is only meaningful on the thread root
/// (position 0); replies never carry one. Timestamps are RFC 3339 strings.
#[napi(object)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub id: String,
    pub content: String,
    pub author: String,
    #[napi(js_name = "createdAt")]
    pub created_at: String,
    #[napi(js_name = "updatedAt")]
    pub updated_at: String,
    pub status: Option<String>,
    pub tags: Vec<String>,
}

/// A comment thread: its anchor plus the ordered conversation.
#[napi(object)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    #[napi(js_name = "filePath")]
    pub file_path: String,
    pub anchor: AnchorRecord,
    pub comments: Vec<CommentRecord>,
}

pub struct CommentStore {
    db_path: PathBuf,
}

impl CommentStore {
    /// Open (creating if needed) the store at `db_path` and apply migrations.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let conn = store.connection()?;
        apply_migrations(&conn)?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Upsert a thread and rewrite its comment rows in conversation order.
    pub fn save_thread(&self, thread: &ThreadRecord) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO threads (
              thread_id, file_path, anchor_text, context_before, context_after,
              anchor_offset, anchor_length
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(thread_id) DO UPDATE SET
              file_path = excluded.file_path,
              anchor_text = excluded.anchor_text,
              context_before = excluded.context_before,
              context_after = excluded.context_after,
              anchor_offset = excluded.anchor_offset,
              anchor_length = excluded.anchor_length
            "#,
            params![
                thread.id,
                thread.file_path,
                thread.anchor.text,
                thread.anchor.context_before,
                thread.anchor.context_after,
                thread.anchor.offset,
                thread.anchor.length,
            ],
        )?;

        tx.execute("DELETE FROM comments WHERE thread_id = ?1", params![thread.id])?;
        for (position, comment) in thread.comments.iter().enumerate() {
            let tags = serde_json::to_string(&comment.tags).unwrap_or_else(|_| "[]".to_string());
            tx.execute(
                r#"
                INSERT INTO comments (
                  comment_id, thread_id, position, content, author,
                  created_at, updated_at, status, tags
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    comment.id,
                    thread.id,
                    position as i64,
                    comment.content,
                    comment.author,
                    comment.created_at,
                    comment.updated_at,
                    comment.status,
                    tags,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_thread(&self, file_path: &str, thread_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM comments WHERE thread_id = ?1", params![thread_id])?;
        tx.execute(
            "DELETE FROM threads WHERE thread_id = ?1 AND file_path = ?2",
            params![thread_id, file_path],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load all threads for a file, anchors at their last persisted offsets.
    ///
    /// Malformed comment rows are skipped; a thread left with no readable
    /// comments is dropped from the result, never from storage.
    pub fn find_by_file_path(&self, file_path: &str) -> Result<Vec<ThreadRecord>, StoreError> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(
            r#"
            SELECT thread_id, file_path, anchor_text, context_before, context_after,
                   anchor_offset, anchor_length
            FROM threads
            WHERE file_path = ?1
            ORDER BY anchor_offset, thread_id
            "#,
        )?;
        let heads = statement
            .query_map(params![file_path], |row| {
                Ok(ThreadRecord {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    anchor: AnchorRecord {
                        text: row.get(2)?,
                        context_before: row.get(3)?,
                        context_after: row.get(4)?,
                        offset: row.get::<_, i64>(5)? as u32,
                        length: row.get::<_, i64>(6)? as u32,
                    },
                    comments: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut threads = Vec::with_capacity(heads.len());
        for mut thread in heads {
            thread.comments = load_comments(&conn, &thread.id)?;
            if thread.comments.is_empty() {
                warn!(thread_id = %thread.id, "thread has no readable comments, skipping");
                continue;
            }
            threads.push(thread);
        }
        Ok(threads)
    }

    pub fn get_tags(&self, file_path: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut statement =
            conn.prepare("SELECT tag FROM file_tags WHERE file_path = ?1 ORDER BY rowid")?;
        let tags = statement
            .query_map(params![file_path], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Replace the tag dictionary for a file.
    pub fn save_tags(&self, file_path: &str, tags: &[String]) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM file_tags WHERE file_path = ?1", params![file_path])?;
        for tag in tags {
            tx.execute(
                "INSERT OR IGNORE INTO file_tags (file_path, tag) VALUES (?1, ?2)",
                params![file_path, tag],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn thread_exists(&self, thread_id: &str) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Wipe every table. Test support.
    pub fn reset(&self) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            DELETE FROM threads;
            DELETE FROM comments;
            DELETE FROM file_tags;
            "#,
        )?;
        Ok(())
    }
}

fn apply_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(MIGRATIONS[0])?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version) VALUES (1)",
        [],
    )?;
    Ok(())
}

fn load_comments(conn: &Connection, thread_id: &str) -> Result<Vec<CommentRecord>, StoreError> {
    let mut statement = conn.prepare(
        r#"
        SELECT comment_id, content, author, created_at, updated_at, status, tags
        FROM comments
        WHERE thread_id = ?1
        ORDER BY position
        "#,
    )?;
    let rows = statement.query_map(params![thread_id], |row| {
        let tags_text: String = row.get(6)?;
        Ok((
            CommentRecord {
                id: row.get(0)?,
                content: row.get(1)?,
                author: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
                status: row.get(5)?,
                tags: Vec::new(),
            },
            tags_text,
        ))
    })?;

    let mut comments = Vec::new();
    for row in rows {
        let (mut comment, tags_text) = row?;
        match serde_json::from_str::<Vec<String>>(&tags_text) {
            Ok(tags) => {
                comment.tags = tags;
                comments.push(comment);
            }
            Err(error) => {
                warn!(comment_id = %comment.id, %error, "malformed tags, skipping comment");
            }
        }
    }
    Ok(comments)
}
