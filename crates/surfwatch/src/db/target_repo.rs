//! Target and workspace repository.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw target row from the database.
#[derive(Debug, Clone)]
pub struct TargetRow {
    pub id: String,
    pub value: String,
    pub last_discovered_at: Option<String>,
    pub is_rescan: bool,
    pub scan_schedule: String,
    pub rescan_started_at: Option<String>,
    pub created_at: String,
}

impl TargetRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            value: row.get("value")?,
            last_discovered_at: row.get("last_discovered_at")?,
            is_rescan: row.get("is_rescan")?,
            scan_schedule: row.get("scan_schedule")?,
            rescan_started_at: row.get("rescan_started_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a workspace.
pub fn insert_workspace(
    conn: &Connection,
    id: &str,
    name: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, now],
    )?;
    Ok(())
}

/// Whether a workspace exists.
pub fn workspace_exists(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM workspaces WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Inserts a target and links it to a workspace.
pub fn insert(
    conn: &Connection,
    workspace_id: &str,
    target: &TargetRow,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO targets (id, value, last_discovered_at, is_rescan, scan_schedule,
         rescan_started_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            target.id,
            target.value,
            target.last_discovered_at,
            target.is_rescan,
            target.scan_schedule,
            target.rescan_started_at,
            target.created_at,
        ],
    )?;
    conn.execute(
        "INSERT INTO workspace_targets (workspace_id, target_id, created_at) VALUES (?1, ?2, ?3)",
        params![workspace_id, target.id, target.created_at],
    )?;
    Ok(())
}

/// Finds a target by ID.
pub fn find(conn: &Connection, id: &str) -> Result<Option<TargetRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM targets WHERE id = ?1",
            params![id],
            TargetRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds several targets, skipping IDs that no longer exist. Order follows
/// `ids`.
pub fn find_many(conn: &Connection, ids: &[String]) -> Result<Vec<TargetRow>, DatabaseError> {
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = find(conn, id)? {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Deletes a target (workspace links, assets and vulnerabilities cascade).
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

/// Sets the scan schedule of a target.
pub fn set_schedule(conn: &Connection, id: &str, schedule: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE targets SET scan_schedule = ?2 WHERE id = ?1",
        params![id, schedule],
    )?;
    Ok(changed == 1)
}

/// Targets with a schedule and no scan in flight.
pub fn list_schedulable(conn: &Connection) -> Result<Vec<TargetRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM targets WHERE scan_schedule != 'disabled' AND is_rescan = 0
         ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map([], TargetRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Idle → Scanning. Only one caller can flip the flag; returns whether this
/// one did.
pub fn claim_rescan(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE targets SET is_rescan = 1, rescan_started_at = ?2 WHERE id = ?1 AND is_rescan = 0",
        params![id, now],
    )?;
    Ok(changed == 1)
}

/// Scanning → Idle. `discovered_at` is set on success and left alone when
/// the scan gave up.
pub fn finish_rescan(
    conn: &Connection,
    id: &str,
    discovered_at: Option<&str>,
) -> Result<bool, DatabaseError> {
    let changed = match discovered_at {
        Some(at) => conn.execute(
            "UPDATE targets SET is_rescan = 0, rescan_started_at = NULL, last_discovered_at = ?2
             WHERE id = ?1",
            params![id, at],
        )?,
        None => conn.execute(
            "UPDATE targets SET is_rescan = 0, rescan_started_at = NULL WHERE id = ?1",
            params![id],
        )?,
    };
    Ok(changed == 1)
}

/// Clears flags set before `started_before` that no live job backs.
/// Returns the IDs of the re-armed targets.
pub fn rearm_stale(conn: &Connection, started_before: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "UPDATE targets SET is_rescan = 0, rescan_started_at = NULL
         WHERE is_rescan = 1
           AND (rescan_started_at IS NULL OR rescan_started_at < ?1)
           AND NOT EXISTS (
               SELECT 1 FROM jobs
               WHERE jobs.target_id = targets.id AND jobs.status IN ('queued', 'in_progress')
           )
         RETURNING id",
    )?;
    let ids = stmt
        .query_map(params![started_before], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const NOW: &str = "2026-01-01T00:00:00.000000Z";

    fn target(id: &str, value: &str) -> TargetRow {
        TargetRow {
            id: id.to_string(),
            value: value.to_string(),
            last_discovered_at: None,
            is_rescan: false,
            scan_schedule: "0_0_*_*_*".to_string(),
            rescan_started_at: None,
            created_at: NOW.to_string(),
        }
    }

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_workspace(conn, "ws", "Workspace", NOW)?;
            insert(conn, "ws", &target("t1", "example.com"))
        })
        .unwrap();
        db
    }

    #[test]
    fn test_insert_and_find() {
        let db = seeded();
        db.with_conn(|conn| {
            let found = find(conn, "t1")?.unwrap();
            assert_eq!(found.value, "example.com");
            assert!(!found.is_rescan);
            assert!(workspace_exists(conn, "ws")?);
            assert!(!workspace_exists(conn, "nope")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = seeded();
        db.with_conn(|conn| {
            assert!(claim_rescan(conn, "t1", NOW)?);
            assert!(!claim_rescan(conn, "t1", NOW)?);
            assert!(list_schedulable(conn)?.is_empty());

            let t = find(conn, "t1")?.unwrap();
            assert!(t.is_rescan);
            assert_eq!(t.rescan_started_at.as_deref(), Some(NOW));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_finish_rescan() {
        let db = seeded();
        db.with_conn(|conn| {
            claim_rescan(conn, "t1", NOW)?;
            finish_rescan(conn, "t1", None)?;
            let t = find(conn, "t1")?.unwrap();
            assert!(!t.is_rescan);
            assert!(t.last_discovered_at.is_none());

            claim_rescan(conn, "t1", NOW)?;
            finish_rescan(conn, "t1", Some("2026-01-02T00:00:00.000000Z"))?;
            let t = find(conn, "t1")?.unwrap();
            assert_eq!(
                t.last_discovered_at.as_deref(),
                Some("2026-01-02T00:00:00.000000Z")
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_disabled_targets_are_not_schedulable() {
        let db = seeded();
        db.with_conn(|conn| {
            assert_eq!(list_schedulable(conn)?.len(), 1);
            set_schedule(conn, "t1", "disabled")?;
            assert!(list_schedulable(conn)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rearm_skips_targets_with_live_jobs() {
        let db = seeded();
        db.with_conn(|conn| {
            insert(conn, "ws", &target("t2", "example.org"))?;
            claim_rescan(conn, "t1", NOW)?;
            claim_rescan(conn, "t2", NOW)?;
            conn.execute(
                "INSERT INTO jobs (id, queue_name, payload, created_at, updated_at, available_at, target_id)
                 VALUES ('j', 'rescans', '{}', ?1, ?1, ?1, 't2')",
                params![NOW],
            )?;

            // Not stale yet.
            assert!(rearm_stale(conn, "2025-12-31T00:00:00.000000Z")?.is_empty());

            let rearmed = rearm_stale(conn, "2026-01-01T06:00:00.000000Z")?;
            assert_eq!(rearmed, vec!["t1".to_string()]);
            assert!(find(conn, "t2")?.unwrap().is_rescan);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_cascades_links() {
        let db = seeded();
        db.with_conn(|conn| {
            assert!(delete(conn, "t1")?);
            assert!(find(conn, "t1")?.is_none());
            let links: u32 =
                conn.query_row("SELECT COUNT(*) FROM workspace_targets", [], |r| r.get(0))?;
            assert_eq!(links, 0);
            assert!(find_many(conn, &["t1".to_string()])?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
