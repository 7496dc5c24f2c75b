//! Asset and vulnerability ingestion from parsed tool output.

use chrono::Utc;
use serde::Serialize;

use super::IngestionPipeline;
use crate::db::target_repo::{self, TargetRow};
use crate::db::{asset_repo, format_timestamp};
use crate::error::IngestError;
use crate::tool::parser::normalize_host;
use crate::tool::Finding;

const DEFAULT_SEVERITY: &str = "info";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingsSummary {
    pub assets_seen: usize,
    pub assets_new: usize,
    pub vulnerabilities_seen: usize,
    pub vulnerabilities_new: usize,
    /// Findings whose host matched none of the run's targets.
    pub unattributed: usize,
}

impl FindingsSummary {
    fn absorb(&mut self, other: FindingsSummary) {
        self.assets_seen += other.assets_seen;
        self.assets_new += other.assets_new;
        self.vulnerabilities_seen += other.vulnerabilities_seen;
        self.vulnerabilities_new += other.vulnerabilities_new;
        self.unattributed += other.unattributed;
    }
}

/// Picks the target a host belongs to: the longest target value that is
/// the host itself or one of its parent domains.
pub fn attribute<'a>(host: &str, targets: &'a [TargetRow]) -> Option<&'a TargetRow> {
    let host = normalize_host(host);
    targets
        .iter()
        .filter(|t| {
            let value = normalize_host(&t.value);
            !value.is_empty()
                && (host == value
                    || host
                        .strip_suffix(value.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.')))
        })
        .max_by_key(|t| t.value.len())
}

impl IngestionPipeline {
    /// Records findings as assets (and vulnerabilities) of one target.
    ///
    /// A target deleted while its scan was running is not an error: the
    /// findings are dropped and an empty summary returned.
    pub fn ingest_findings(
        &self,
        target_id: &str,
        tool_id: &str,
        findings: &[Finding],
    ) -> Result<FindingsSummary, IngestError> {
        let summary = self.db.with_tx(|tx| -> Result<_, IngestError> {
            if target_repo::find(tx, target_id)?.is_none() {
                log::info!(
                    "Target {} no longer exists, dropping {} findings from {}",
                    target_id,
                    findings.len(),
                    tool_id
                );
                return Ok(FindingsSummary::default());
            }
            Ok(store(tx, target_id, tool_id, findings)?)
        })?;

        log::debug!(
            "Ingested {} findings for target {}: {:?}",
            findings.len(),
            target_id,
            summary
        );
        Ok(summary)
    }

    /// Attributes findings across a run's targets and stores them in a
    /// single transaction. Targets that no longer exist are skipped.
    pub fn ingest_for_targets(
        &self,
        target_ids: &[String],
        tool_id: &str,
        findings: &[Finding],
    ) -> Result<FindingsSummary, IngestError> {
        self.db.with_tx(|tx| -> Result<_, IngestError> {
            let targets = target_repo::find_many(tx, target_ids)?;
            let mut summary = FindingsSummary::default();
            let mut grouped: Vec<(&TargetRow, Vec<Finding>)> = Vec::new();

            for finding in findings {
                let Some(target) = attribute(&finding.host, &targets) else {
                    summary.unattributed += 1;
                    continue;
                };
                match grouped.iter_mut().find(|(t, _)| t.id == target.id) {
                    Some((_, group)) => group.push(finding.clone()),
                    None => grouped.push((target, vec![finding.clone()])),
                }
            }

            for (target, group) in grouped {
                summary.absorb(store(tx, &target.id, tool_id, &group)?);
            }
            if summary.unattributed > 0 {
                log::debug!(
                    "{} findings from {} matched no target",
                    summary.unattributed,
                    tool_id
                );
            }
            Ok(summary)
        })
    }
}

fn store(
    conn: &rusqlite::Connection,
    target_id: &str,
    tool_id: &str,
    findings: &[Finding],
) -> Result<FindingsSummary, crate::db::DatabaseError> {
    let now = format_timestamp(Utc::now());
    let mut summary = FindingsSummary::default();

    for finding in findings {
        let host = normalize_host(&finding.host);
        if host.is_empty() {
            summary.unattributed += 1;
            continue;
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let (asset_id, created) = asset_repo::upsert_asset(conn, &new_id, target_id, &host, &now)?;
        summary.assets_seen += 1;
        if created {
            summary.assets_new += 1;
        }

        if let Some(name) = finding.name.as_deref() {
            let created = asset_repo::upsert_vulnerability(
                conn,
                &uuid::Uuid::new_v4().to_string(),
                &asset_id,
                name,
                finding.severity.as_deref().unwrap_or(DEFAULT_SEVERITY),
                finding.detail.as_deref(),
                tool_id,
                &now,
            )?;
            summary.vulnerabilities_seen += 1;
            if created {
                summary.vulnerabilities_new += 1;
            }
        }
    }
    Ok(summary)
}
