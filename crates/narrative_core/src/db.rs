use crate::error::Result;
use crate::schema::{Engagement, RawPost};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

pub fn open(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    init(&conn)?;
    Ok(conn)
}

/// In-memory store, used by tests and dry runs.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS raw_posts (
          id TEXT PRIMARY KEY,
          author_id TEXT NOT NULL,
          handle TEXT NOT NULL,
          created_at TEXT NOT NULL,
          text TEXT NOT NULL,
          conversation_id TEXT,
          reply_count INTEGER,
          repost_count INTEGER,
          like_count INTEGER,
          quote_count INTEGER,
          raw_json TEXT NOT NULL,
          inserted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );

        CREATE INDEX IF NOT EXISTS idx_raw_posts_handle ON raw_posts(handle);

        CREATE TABLE IF NOT EXISTS collection_progress (
          handle TEXT PRIMARY KEY,
          status TEXT NOT NULL,
          cursor TEXT,
          pages INTEGER NOT NULL DEFAULT 0,
          posts INTEGER NOT NULL DEFAULT 0,
          error TEXT,
          updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );
        "#,
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    InProgress,
    Complete,
    Failed,
}

impl HandleStatus {
    fn as_str(self) -> &'static str {
        match self {
            HandleStatus::InProgress => "in_progress",
            HandleStatus::Complete => "complete",
            HandleStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "complete" => HandleStatus::Complete,
            "failed" => HandleStatus::Failed,
            _ => HandleStatus::InProgress,
        }
    }
}

/// Where retrieval for one handle stands.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleProgress {
    pub handle: String,
    pub status: HandleStatus,
    pub cursor: Option<String>,
    pub pages: u64,
    pub posts: u64,
    pub error: Option<String>,
}

pub fn upsert_post(conn: &Connection, post: &RawPost, raw_json: &Value) -> Result<()> {
    let raw_json_str = serde_json::to_string(raw_json)?;
    let engagement = post.engagement.clone().unwrap_or_default();

    conn.execute(
        r#"
        INSERT INTO raw_posts (
          id, author_id, handle, created_at, text, conversation_id,
          reply_count, repost_count, like_count, quote_count, raw_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
          author_id=excluded.author_id,
          handle=excluded.handle,
          created_at=excluded.created_at,
          text=excluded.text,
          conversation_id=excluded.conversation_id,
          reply_count=excluded.reply_count,
          repost_count=excluded.repost_count,
          like_count=excluded.like_count,
          quote_count=excluded.quote_count,
          raw_json=excluded.raw_json
        "#,
        params![
            post.id,
            post.author_id,
            post.handle,
            post.created_at,
            post.text,
            post.conversation_id,
            engagement.reply_count.map(|v| v as i64),
            engagement.repost_count.map(|v| v as i64),
            engagement.like_count.map(|v| v as i64),
            engagement.quote_count.map(|v| v as i64),
            raw_json_str
        ],
    )?;

    Ok(())
}

/// Persist one retrieved page and advance the handle's cursor atomically, so
/// an interrupted run resumes at the first page it did not store.
pub fn record_page(
    conn: &Connection,
    handle: &str,
    posts: &[(RawPost, Value)],
    next_cursor: Option<&str>,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (post, raw) in posts {
        upsert_post(&tx, post, raw)?;
    }
    tx.execute(
        r#"
        INSERT INTO collection_progress (handle, status, cursor, pages, posts, error)
        VALUES (?1, 'in_progress', ?2, 1, ?3, NULL)
        ON CONFLICT(handle) DO UPDATE SET
          status='in_progress',
          cursor=excluded.cursor,
          pages=collection_progress.pages + 1,
          posts=collection_progress.posts + excluded.posts,
          error=NULL,
          updated_at=strftime('%Y-%m-%dT%H:%M:%fZ','now')
        "#,
        params![handle, next_cursor, posts.len() as i64],
    )?;
    tx.commit()?;
    Ok(())
}

/// Store posts without touching the handle's progress, for a page cut short
/// so that a later run refetches it from the stored cursor.
pub fn store_posts(conn: &Connection, posts: &[(RawPost, Value)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (post, raw) in posts {
        upsert_post(&tx, post, raw)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn mark_complete(conn: &Connection, handle: &str) -> Result<()> {
    set_status(conn, handle, HandleStatus::Complete, None)
}

/// Failed handles keep their cursor so a later run retries from where they stopped.
pub fn mark_failed(conn: &Connection, handle: &str, error: &str) -> Result<()> {
    set_status(conn, handle, HandleStatus::Failed, Some(error))
}

fn set_status(
    conn: &Connection,
    handle: &str,
    status: HandleStatus,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO collection_progress (handle, status, error)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(handle) DO UPDATE SET
          status=excluded.status,
          error=excluded.error,
          updated_at=strftime('%Y-%m-%dT%H:%M:%fZ','now')
        "#,
        params![handle, status.as_str(), error],
    )?;
    Ok(())
}

pub fn progress(conn: &Connection, handle: &str) -> Result<Option<HandleProgress>> {
    let row = conn
        .query_row(
            r#"
            SELECT handle, status, cursor, pages, posts, error
            FROM collection_progress
            WHERE handle = ?1
            "#,
            params![handle],
            |row| {
                let status: String = row.get(1)?;
                Ok(HandleProgress {
                    handle: row.get(0)?,
                    status: HandleStatus::parse(&status),
                    cursor: row.get(2)?,
                    pages: row.get::<_, i64>(3)? as u64,
                    posts: row.get::<_, i64>(4)? as u64,
                    error: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn failed_handles(conn: &Connection) -> Result<Vec<HandleProgress>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT handle FROM collection_progress
        WHERE status = 'failed'
        ORDER BY handle
        "#,
    )?;
    let handles = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Some(p) = progress(conn, &handle)? {
            out.push(p);
        }
    }
    Ok(out)
}

pub fn post_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM raw_posts", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// All stored posts in retrieval order.
pub fn load_posts(conn: &Connection) -> Result<Vec<RawPost>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, author_id, handle, created_at, text, conversation_id,
               reply_count, repost_count, like_count, quote_count
        FROM raw_posts
        ORDER BY rowid ASC
        "#,
    )?;

    let rows = stmt.query_map([], |row| {
        let counts: [Option<i64>; 4] = [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?];
        let engagement = if counts.iter().all(Option::is_none) {
            None
        } else {
            Some(Engagement {
                reply_count: counts[0].map(|v| v.max(0) as u64),
                repost_count: counts[1].map(|v| v.max(0) as u64),
                like_count: counts[2].map(|v| v.max(0) as u64),
                quote_count: counts[3].map(|v| v.max(0) as u64),
            })
        };
        Ok(RawPost {
            id: row.get(0)?,
            author_id: row.get(1)?,
            handle: row.get(2)?,
            created_at: row.get(3)?,
            text: row.get(4)?,
            conversation_id: row.get(5)?,
            engagement,
        })
    })?;

    let mut posts = Vec::new();
    for r in rows {
        posts.push(r?);
    }
    Ok(posts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str, handle: &str) -> RawPost {
        RawPost {
            id: id.to_string(),
            author_id: "42".to_string(),
            handle: handle.to_string(),
            created_at: "2022-06-24T15:00:00Z".to_string(),
            text: format!("post {id}"),
            conversation_id: Some(id.to_string()),
            engagement: Some(Engagement {
                reply_count: Some(3),
                repost_count: None,
                like_count: Some(10),
                quote_count: Some(0),
            }),
        }
    }

    #[test]
    fn record_page_advances_cursor_and_counts() {
        let conn = open_in_memory().unwrap();
        let page = vec![(post("1", "alice"), json!({"id": "1"})), (post("2", "alice"), json!({"id": "2"}))];
        record_page(&conn, "alice", &page, Some("next-1")).unwrap();
        record_page(&conn, "alice", &[(post("3", "alice"), json!({}))], None).unwrap();

        let p = progress(&conn, "alice").unwrap().unwrap();
        assert_eq!(p.status, HandleStatus::InProgress);
        assert_eq!(p.cursor, None);
        assert_eq!(p.pages, 2);
        assert_eq!(p.posts, 3);
    }

    #[test]
    fn load_posts_keeps_retrieval_order_across_upserts() {
        let conn = open_in_memory().unwrap();
        record_page(&conn, "b", &[(post("9", "b"), json!({}))], None).unwrap();
        record_page(&conn, "a", &[(post("1", "a"), json!({}))], None).unwrap();
        record_page(&conn, "b", &[(post("9", "b"), json!({}))], None).unwrap();

        let ids: Vec<String> = load_posts(&conn).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["9", "1"]);
        assert_eq!(post_count(&conn).unwrap(), 2);
    }

    #[test]
    fn failed_handles_are_listed_with_their_error() {
        let conn = open_in_memory().unwrap();
        mark_failed(&conn, "carol", "API error (status 503)").unwrap();
        mark_complete(&conn, "dave").unwrap();

        let failed = failed_handles(&conn).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].handle, "carol");
        assert_eq!(failed[0].error.as_deref(), Some("API error (status 503)"));
    }
}
