//! Asset and vulnerability repository.
//!
//! Both tables are written with upserts: a repeated finding only moves
//! `last_seen_at` (and refreshes severity/detail for vulnerabilities).

use rusqlite::{params, Connection, Row};

use super::DatabaseError;

/// A raw asset row.
#[derive(Debug, Clone)]
pub struct AssetRow {
    pub id: String,
    pub target_id: String,
    pub value: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

impl AssetRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            target_id: row.get("target_id")?,
            value: row.get("value")?,
            first_seen_at: row.get("first_seen_at")?,
            last_seen_at: row.get("last_seen_at")?,
        })
    }
}

/// A raw vulnerability row.
#[derive(Debug, Clone)]
pub struct VulnerabilityRow {
    pub id: String,
    pub asset_id: String,
    pub name: String,
    pub severity: String,
    pub detail: Option<String>,
    pub tool_id: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

impl VulnerabilityRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            asset_id: row.get("asset_id")?,
            name: row.get("name")?,
            severity: row.get("severity")?,
            detail: row.get("detail")?,
            tool_id: row.get("tool_id")?,
            first_seen_at: row.get("first_seen_at")?,
            last_seen_at: row.get("last_seen_at")?,
        })
    }
}

/// Inserts or touches an asset. Returns the stored asset ID and whether the
/// row is new.
pub fn upsert_asset(
    conn: &Connection,
    new_id: &str,
    target_id: &str,
    value: &str,
    now: &str,
) -> Result<(String, bool), DatabaseError> {
    let id: String = conn.query_row(
        "INSERT INTO assets (id, target_id, value, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (target_id, value) DO UPDATE SET last_seen_at = excluded.last_seen_at
         RETURNING id",
        params![new_id, target_id, value, now],
        |r| r.get(0),
    )?;
    let created = id == new_id;
    Ok((id, created))
}

/// Inserts or refreshes a vulnerability on an asset. Returns whether the row
/// is new.
#[allow(clippy::too_many_arguments)]
pub fn upsert_vulnerability(
    conn: &Connection,
    new_id: &str,
    asset_id: &str,
    name: &str,
    severity: &str,
    detail: Option<&str>,
    tool_id: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let id: String = conn.query_row(
        "INSERT INTO vulnerabilities (id, asset_id, name, severity, detail, tool_id,
         first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT (asset_id, name) DO UPDATE SET
             severity = excluded.severity,
             detail = excluded.detail,
             tool_id = excluded.tool_id,
             last_seen_at = excluded.last_seen_at
         RETURNING id",
        params![new_id, asset_id, name, severity, detail, tool_id, now],
        |r| r.get(0),
    )?;
    Ok(id == new_id)
}

/// Lists a target's assets.
pub fn list_assets(conn: &Connection, target_id: &str) -> Result<Vec<AssetRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM assets WHERE target_id = ?1 ORDER BY value")?;
    let rows = stmt
        .query_map(params![target_id], AssetRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists an asset's vulnerabilities.
pub fn list_vulnerabilities(
    conn: &Connection,
    asset_id: &str,
) -> Result<Vec<VulnerabilityRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM vulnerabilities WHERE asset_id = ?1 ORDER BY name")?;
    let rows = stmt
        .query_map(params![asset_id], VulnerabilityRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::target_repo::{self, TargetRow};
    use crate::db::Database;

    const T0: &str = "2026-01-01T00:00:00.000000Z";
    const T1: &str = "2026-01-02T00:00:00.000000Z";

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            target_repo::insert_workspace(conn, "ws", "Workspace", T0)?;
            target_repo::insert(
                conn,
                "ws",
                &TargetRow {
                    id: "t1".to_string(),
                    value: "example.com".to_string(),
                    last_discovered_at: None,
                    is_rescan: false,
                    scan_schedule: "disabled".to_string(),
                    rescan_started_at: None,
                    created_at: T0.to_string(),
                },
            )
        })
        .unwrap();
        db
    }

    #[test]
    fn test_upsert_asset_touches_existing() {
        let db = seeded();
        db.with_conn(|conn| {
            let (id, created) = upsert_asset(conn, "a1", "t1", "api.example.com", T0)?;
            assert!(created);
            assert_eq!(id, "a1");

            let (id, created) = upsert_asset(conn, "a2", "t1", "api.example.com", T1)?;
            assert!(!created);
            assert_eq!(id, "a1");

            let assets = list_assets(conn, "t1")?;
            assert_eq!(assets.len(), 1);
            assert_eq!(assets[0].first_seen_at, T0);
            assert_eq!(assets[0].last_seen_at, T1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_upsert_vulnerability_refreshes_severity() {
        let db = seeded();
        db.with_conn(|conn| {
            upsert_asset(conn, "a1", "t1", "example.com", T0)?;
            assert!(upsert_vulnerability(conn, "v1", "a1", "open-redirect", "low", None, "probe", T0)?);
            assert!(!upsert_vulnerability(
                conn,
                "v2",
                "a1",
                "open-redirect",
                "high",
                Some("confirmed"),
                "probe",
                T1
            )?);

            let vulns = list_vulnerabilities(conn, "a1")?;
            assert_eq!(vulns.len(), 1);
            assert_eq!(vulns[0].severity, "high");
            assert_eq!(vulns[0].detail.as_deref(), Some("confirmed"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_assets_removed_with_target() {
        let db = seeded();
        db.with_conn(|conn| {
            upsert_asset(conn, "a1", "t1", "example.com", T0)?;
            target_repo::delete(conn, "t1")?;
            assert!(list_assets(conn, "t1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
