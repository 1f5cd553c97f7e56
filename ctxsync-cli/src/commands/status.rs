//! `ctxsync status`: offline comparison of source docs and artifact sections.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ctxsync_core::{ComponentKey, SyncConfig};
use ctxsync_store::{content_hash, ArtifactStore};

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        let report = build_report(&config)?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SectionState {
    Current,
    Stale,
    /// Source file does not exist.
    Missing,
    NeverSynced,
}

#[derive(Debug, Serialize)]
struct SectionReport {
    key: ComponentKey,
    state: SectionState,
    source: PathBuf,
    source_hash: Option<String>,
    artifact_hash: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    artifact: PathBuf,
    artifact_exists: bool,
    sections: Vec<SectionReport>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "component")]
    key: String,
    #[tabled(rename = "status")]
    state: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
}

fn build_report(config: &SyncConfig) -> Result<StatusReport> {
    let artifact_path = config.artifact_path();
    let artifact = ArtifactStore::new(&artifact_path)
        .load()
        .with_context(|| format!("cannot read artifact '{}'", artifact_path.display()))?;

    let mut sections = Vec::new();
    for binding in config.bindings() {
        let source_hash = match std::fs::read_to_string(&binding.path) {
            Ok(content) => Some(content_hash(&content)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read '{}'", binding.path.display()))
            }
        };
        let entry = artifact
            .as_ref()
            .and_then(|a| a.get(binding.key))
            .filter(|entry| !entry.content.is_empty());

        sections.push(SectionReport {
            key: binding.key,
            state: classify(source_hash.as_deref(), entry.map(|e| e.hash.as_str())),
            source: binding.path,
            source_hash,
            artifact_hash: entry.map(|e| e.hash.clone()),
            updated_at: entry.map(|e| e.updated_at),
        });
    }

    Ok(StatusReport {
        artifact_exists: artifact.is_some(),
        artifact: artifact_path,
        sections,
    })
}

fn classify(source_hash: Option<&str>, artifact_hash: Option<&str>) -> SectionState {
    match (source_hash, artifact_hash) {
        (None, _) => SectionState::Missing,
        (Some(_), None) => SectionState::NeverSynced,
        (Some(source), Some(stored)) if source == stored => SectionState::Current,
        (Some(_), Some(_)) => SectionState::Stale,
    }
}

fn print_table(report: &StatusReport) {
    let stale = report
        .sections
        .iter()
        .filter(|s| matches!(s.state, SectionState::Stale | SectionState::NeverSynced))
        .count();
    println!(
        "ctxsync v{} | {} | {} sections | {} need sync",
        env!("CARGO_PKG_VERSION"),
        report.artifact.display(),
        report.sections.len(),
        stale,
    );
    if !report.artifact_exists {
        println!("{}", "artifact has not been created yet".yellow());
    }

    let rows: Vec<StatusTableRow> = report
        .sections
        .iter()
        .map(|section| StatusTableRow {
            key: section.key.to_string(),
            state: state_label(section.state),
            source: section.source.display().to_string(),
            last_sync: section
                .updated_at
                .map(format_age)
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if stale > 0 {
        println!("Run 'ctxsync sync' to update stale sections.");
    }
}

fn state_label(state: SectionState) -> String {
    match state {
        SectionState::Current => "CURRENT".green().bold().to_string(),
        SectionState::Stale => "STALE".yellow().bold().to_string(),
        SectionState::Missing => "MISSING".red().bold().to_string(),
        SectionState::NeverSynced => "NEVER SYNCED".bright_black().bold().to_string(),
    }
}

fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    match seconds {
        s if s < 60 => format!("{s}s ago"),
        s if s < 60 * 60 => format!("{}m ago", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h ago", s / (60 * 60)),
        s => format!("{}d ago", s / (60 * 60 * 24)),
    }
}
