//! Issue and issue comment repository.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw issue row from the database. `tags` holds a JSON array.
#[derive(Debug, Clone)]
pub struct IssueRow {
    pub id: String,
    pub no: u32,
    pub title: String,
    pub status: String,
    pub workspace_id: String,
    pub created_by_id: String,
    pub tags: String,
    pub created_at: String,
    pub updated_at: String,
}

impl IssueRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            no: row.get("no")?,
            title: row.get("title")?,
            status: row.get("status")?,
            workspace_id: row.get("workspace_id")?,
            created_by_id: row.get("created_by_id")?,
            tags: row.get("tags")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A raw comment row.
#[derive(Debug, Clone)]
pub struct CommentRow {
    pub id: String,
    pub issue_id: String,
    pub content: String,
    pub created_by_id: String,
    pub is_deletable: bool,
    pub created_at: String,
}

impl CommentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            issue_id: row.get("issue_id")?,
            content: row.get("content")?,
            created_by_id: row.get("created_by_id")?,
            is_deletable: row.get("is_deletable")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Highest issue number in a workspace, 0 when it has none.
pub fn max_no(conn: &Connection, workspace_id: &str) -> Result<u32, DatabaseError> {
    let max: u32 = conn.query_row(
        "SELECT COALESCE(MAX(no), 0) FROM issues WHERE workspace_id = ?1",
        params![workspace_id],
        |r| r.get(0),
    )?;
    Ok(max)
}

/// Inserts an issue.
pub fn insert(conn: &Connection, issue: &IssueRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO issues (id, no, title, status, workspace_id, created_by_id, tags,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            issue.id,
            issue.no,
            issue.title,
            issue.status,
            issue.workspace_id,
            issue.created_by_id,
            issue.tags,
            issue.created_at,
            issue.updated_at,
        ],
    )?;
    Ok(())
}

/// Inserts a comment.
pub fn insert_comment(conn: &Connection, comment: &CommentRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO issue_comments (id, issue_id, content, created_by_id, is_deletable, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            comment.id,
            comment.issue_id,
            comment.content,
            comment.created_by_id,
            comment.is_deletable,
            comment.created_at,
        ],
    )?;
    Ok(())
}

/// Finds an issue by ID.
pub fn find(conn: &Connection, id: &str) -> Result<Option<IssueRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM issues WHERE id = ?1",
            params![id],
            IssueRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists a workspace's issues ordered by number.
pub fn list(conn: &Connection, workspace_id: &str) -> Result<Vec<IssueRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM issues WHERE workspace_id = ?1 ORDER BY no")?;
    let rows = stmt
        .query_map(params![workspace_id], IssueRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists an issue's comments, oldest first.
pub fn list_comments(conn: &Connection, issue_id: &str) -> Result<Vec<CommentRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM issue_comments WHERE issue_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![issue_id], CommentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
