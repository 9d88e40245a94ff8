//! Per-run audit output under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

use crate::merge::{CodeConflict, Collision};
use crate::normalize::Rejection;
use crate::outcome::RunOutcome;

/// Rejections listed individually; the rest are only counted.
pub const REJECTION_DETAIL_LIMIT: usize = 10_000;

#[derive(Debug, Default, Serialize)]
pub struct RunAudit<'a> {
    pub collisions: &'a [Collision],
    pub code_conflicts: &'a [CodeConflict],
    pub rejections: &'a [Rejection],
}

async fn write_json(path: PathBuf, value: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub async fn write_reports(
    reports_root: &Path,
    outcome: &RunOutcome,
    audit: &RunAudit<'_>,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(outcome.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    write_json(reports_dir.join("outcome.json"), outcome).await?;
    write_json(
        reports_dir.join("collisions.json"),
        &serde_json::json!({
            "collisions": audit.collisions,
            "code_conflicts": audit.code_conflicts,
        }),
    )
    .await?;
    let shown = audit.rejections.len().min(REJECTION_DETAIL_LIMIT);
    write_json(
        reports_dir.join("rejections.json"),
        &serde_json::json!({
            "total": outcome.counts.rejected,
            "by_kind": outcome.quality.rejections_by_kind,
            "rejections": &audit.rejections[..shown],
        }),
    )
    .await?;

    fs::write(reports_dir.join("daily_brief.md"), daily_brief(outcome, audit))
        .await
        .context("writing daily_brief.md")?;

    Ok(reports_dir)
}

fn daily_brief(outcome: &RunOutcome, audit: &RunAudit<'_>) -> String {
    let counts = &outcome.counts;
    let quality = &outcome.quality;
    let window = outcome
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "full snapshot".to_string());
    let dates = match (quality.first_date, quality.last_date) {
        (Some(first), Some(last)) => format!("{first} .. {last}"),
        _ => "none".to_string(),
    };

    let mut lines = vec![
        "# Mandi Archive Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", outcome.run_id),
        format!("- Source: {}", outcome.source),
        format!("- Status: {:?}", outcome.status),
        format!("- Window: {window}"),
        format!("- Started: {}", outcome.started_at),
        format!("- Finished: {}", outcome.finished_at),
        format!("- Generation: {} ({} rows archived)", outcome.generation, outcome.total_rows),
        String::new(),
        "## Counts".to_string(),
        format!("- fetched: {}", counts.fetched),
        format!("- accepted: {}", counts.accepted),
        format!("- rejected: {}", counts.rejected),
        format!("- duplicates: {}", counts.duplicates),
        format!("- collisions: {}", counts.collisions),
        format!("- code conflicts: {}", counts.code_conflicts),
        format!("- appended: {}", counts.appended),
        String::new(),
        "## Batch".to_string(),
        format!("- arrival dates: {dates}"),
        format!(
            "- states: {}, markets: {}, commodities: {}",
            quality.states, quality.markets, quality.commodities
        ),
    ];
    if !quality.rejections_by_kind.is_empty() {
        lines.push(String::new());
        lines.push("## Rejections".to_string());
        lines.extend(
            quality
                .rejections_by_kind
                .iter()
                .map(|(kind, n)| format!("- {kind}: {n}")),
        );
    }
    if !audit.collisions.is_empty() {
        lines.push(String::new());
        lines.push("## Collisions (stored value kept)".to_string());
        lines.extend(audit.collisions.iter().take(50).map(|c| {
            format!(
                "- {}: kept {}/{}/{}, incoming {}/{}/{}",
                c.key,
                c.kept.prices.min,
                c.kept.prices.modal,
                c.kept.prices.max,
                c.incoming.prices.min,
                c.incoming.prices.modal,
                c.incoming.prices.max
            )
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown summary of the `runs` most recent run reports.
pub fn report_daily_markdown(runs: usize, archive_root: &Path) -> Result<String> {
    let reports_root = archive_root.join("reports");
    let mut outcomes = Vec::new();
    let entries = match std::fs::read_dir(&reports_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok("# Mandi Archive Report\n\nNo runs recorded yet.\n".to_string())
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()))
        }
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join("outcome.json");
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let outcome: RunOutcome = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        outcomes.push((outcome, entry.path()));
    }
    outcomes.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Mandi Archive Report".to_string(), String::new()];
    for (outcome, dir) in outcomes.into_iter().take(runs.max(1)) {
        let c = &outcome.counts;
        lines.push(format!("## Run `{}`", outcome.run_id));
        lines.push(format!("- status: {:?} (exit {})", outcome.status, outcome.exit_code));
        lines.push(format!("- finished: {}", outcome.finished_at));
        if let Some(window) = outcome.window {
            lines.push(format!("- window: {window}"));
        }
        lines.push(format!(
            "- fetched {} / accepted {} / rejected {} / duplicates {} / collisions {} / appended {}",
            c.fetched, c.accepted, c.rejected, c.duplicates, c.collisions, c.appended
        ));
        if let Some(error) = &outcome.error {
            lines.push(format!("- error: {error}"));
        }
        let brief = dir.join("daily_brief.md");
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{QualitySummary, RunCounts, RunStatus};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn outcome(minutes_ago: i64, appended: usize) -> RunOutcome {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        RunOutcome {
            run_id: Uuid::new_v4(),
            source: "fixture".into(),
            status: RunStatus::Success,
            exit_code: 0,
            window: None,
            started_at: at,
            finished_at: at,
            elapsed_ms: 3,
            counts: RunCounts {
                fetched: appended,
                accepted: appended,
                appended,
                ..RunCounts::default()
            },
            quality: QualitySummary::default(),
            partitions_rewritten: vec![2024],
            generation: 1,
            total_rows: appended as u64,
            error: None,
        }
    }

    #[tokio::test]
    async fn reports_are_written_and_summarized_newest_first() {
        let dir = tempdir().unwrap();
        let reports_root = dir.path().join("reports");
        let older = outcome(60, 7);
        let newer = outcome(1, 3);
        for o in [&older, &newer] {
            let written = write_reports(&reports_root, o, &RunAudit::default())
                .await
                .expect("reports");
            for file in ["outcome.json", "collisions.json", "rejections.json", "daily_brief.md"] {
                assert!(written.join(file).exists(), "{file}");
            }
        }

        let markdown = report_daily_markdown(1, dir.path()).unwrap();
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(!markdown.contains(&older.run_id.to_string()));

        let both = report_daily_markdown(5, dir.path()).unwrap();
        let newer_at = both.find(&newer.run_id.to_string()).unwrap();
        let older_at = both.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);
    }

    #[test]
    fn empty_archive_has_no_runs() {
        let dir = tempdir().unwrap();
        let markdown = report_daily_markdown(3, dir.path()).unwrap();
        assert!(markdown.contains("No runs"));
    }
}
