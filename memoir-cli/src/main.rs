// Copyright 2025 Memoir (https://github.com/memoir-mem/memoir)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Memoir ops CLI.
//!
//! Thin wrappers over the core: `export` snapshots databases, `git-sync`
//! drives the replication workspace, `migrate` imports foreign records
//! through the schema adapter. Exit code 0 on success, 1 on failure.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use memoir_core::adapter::{
    EmbeddingFormat, FactsFormat, FieldPaths, SchemaAdapter, SchemaAdapterConfig, TimestampFormat,
    Transforms,
};
use memoir_core::{settings, Settings};
use memoir_server::ReplicationExporter;
use memoir_storage::{MemoryStore, MigrateOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "memoir", version, about = "Memoir memory service CLI", long_about = None)]
struct Cli {
    /// Data directory (overrides the resolved default)
    #[arg(long, env = "MEMOIR_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Sqlite,
    Full,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TimestampFormatArg {
    EpochMs,
    EpochS,
    Iso8601,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmbeddingFormatArg {
    Array,
    Base64,
    JsonArray,
    Binary,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FactsFormatArg {
    Array,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot databases into the replication workspace or a JSON file
    Export {
        #[arg(long, value_enum, default_value = "sqlite")]
        format: ExportFormat,

        /// Destination override (directory for sqlite/full, file for json)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Restrict a JSON export to one project
        #[arg(long)]
        project: Option<String>,

        /// Skip the vector database
        #[arg(long)]
        no_vectors: bool,
    },

    /// Manage the replication workspace
    GitSync {
        #[command(subcommand)]
        action: GitSyncAction,
    },

    /// Import foreign records through the schema adapter
    Migrate {
        /// Source file path or HTTP URL holding a JSON array of records
        #[arg(long)]
        source: String,

        /// Project assigned to imported observations
        #[arg(long)]
        project: String,

        /// Memory session attributed to the import
        #[arg(long)]
        memory_session_id: Option<String>,

        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        #[arg(long)]
        dry_run: bool,

        // Field-path overrides (dot notation supported).
        #[arg(long)]
        field_id: Option<String>,
        #[arg(long)]
        field_title: Option<String>,
        #[arg(long)]
        field_subtitle: Option<String>,
        #[arg(long)]
        field_narrative: Option<String>,
        #[arg(long)]
        field_facts: Option<String>,
        #[arg(long)]
        field_type: Option<String>,
        #[arg(long)]
        field_project: Option<String>,
        #[arg(long)]
        field_timestamp: Option<String>,
        #[arg(long)]
        field_embedding: Option<String>,

        #[arg(long, value_enum, default_value = "epoch-ms")]
        timestamp_format: TimestampFormatArg,
        #[arg(long, value_enum, default_value = "array")]
        embedding_format: EmbeddingFormatArg,
        #[arg(long, value_enum, default_value = "array")]
        facts_format: FactsFormatArg,
    },
}

#[derive(Subcommand)]
enum GitSyncAction {
    /// Show workspace status
    Status,
    /// Initialize the workspace
    Init {
        #[arg(long)]
        remote: Option<String>,
    },
    /// Snapshot and push (initializes if needed)
    Push {
        /// Include the relational database
        #[arg(long)]
        full: bool,
    },
    /// Pull the latest snapshot from the remote
    Pull,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => settings::resolve_data_dir()?,
    };
    let config = Settings::load(&data_dir)?;

    match cli.command {
        Commands::Export { format, output, project, no_vectors } => {
            run_export(&data_dir, &config, format, output, project, no_vectors)
        }
        Commands::GitSync { action } => run_git_sync(&data_dir, &config, action),
        Commands::Migrate {
            source,
            project,
            memory_session_id,
            batch_size,
            dry_run,
            field_id,
            field_title,
            field_subtitle,
            field_narrative,
            field_facts,
            field_type,
            field_project,
            field_timestamp,
            field_embedding,
            timestamp_format,
            embedding_format,
            facts_format,
        } => {
            let mut fields = FieldPaths::default();
            if let Some(path) = field_id {
                fields.id = path;
            }
            if let Some(path) = field_title {
                fields.title = path;
            }
            if let Some(path) = field_subtitle {
                fields.subtitle = path;
            }
            if let Some(path) = field_narrative {
                fields.narrative = path;
            }
            if let Some(path) = field_facts {
                fields.facts = path;
            }
            if let Some(path) = field_type {
                fields.kind = path;
            }
            if let Some(path) = field_project {
                fields.project = path;
            }
            if let Some(path) = field_timestamp {
                fields.timestamp = path;
            }
            if let Some(path) = field_embedding {
                fields.embedding = path;
            }

            let transforms = Transforms {
                timestamp: match timestamp_format {
                    TimestampFormatArg::EpochMs => TimestampFormat::EpochMs,
                    TimestampFormatArg::EpochS => TimestampFormat::EpochS,
                    TimestampFormatArg::Iso8601 => TimestampFormat::Iso8601,
                },
                embedding: match embedding_format {
                    EmbeddingFormatArg::Array => EmbeddingFormat::Array,
                    EmbeddingFormatArg::Base64 => EmbeddingFormat::Base64,
                    EmbeddingFormatArg::JsonArray => EmbeddingFormat::JsonArray,
                    EmbeddingFormatArg::Binary => EmbeddingFormat::Binary,
                },
                facts: match facts_format {
                    FactsFormatArg::Array => FactsFormat::Array,
                    FactsFormatArg::Json => FactsFormat::Json,
                    FactsFormatArg::Csv => FactsFormat::Csv,
                },
            };

            run_migrate(
                &data_dir,
                source,
                project,
                memory_session_id,
                batch_size,
                dry_run,
                fields,
                transforms,
            )
            .await
        }
    }
}

fn run_export(
    data_dir: &PathBuf,
    config: &Settings,
    format: ExportFormat,
    output: Option<PathBuf>,
    project: Option<String>,
    no_vectors: bool,
) -> Result<()> {
    let vectors_db = settings::paths::vectors_db(data_dir);
    let store_db = settings::paths::store_db(data_dir);

    match format {
        ExportFormat::Json => {
            let store = MemoryStore::open(&store_db)?;
            let observations: Vec<_> = store
                .all_observations()?
                .into_iter()
                .filter(|o| project.as_deref().map_or(true, |p| o.project == p))
                .collect();

            let target = output
                .unwrap_or_else(|| settings::paths::export_dir(data_dir).join("observations.json"));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, serde_json::to_string_pretty(&observations)?)?;
            println!("exported {} observations to {}", observations.len(), target.display());
        }

        ExportFormat::Sqlite | ExportFormat::Full => {
            let export_dir = output.unwrap_or_else(|| settings::paths::export_dir(data_dir));
            let exporter = ReplicationExporter::new(export_dir, config.replication.clone());

            let include_full = matches!(format, ExportFormat::Full);
            let vectors = (!no_vectors).then_some(vectors_db.as_path());
            let full = include_full.then_some(store_db.as_path());
            if vectors.is_none() && full.is_none() {
                bail!("--no-vectors with --format=sqlite leaves nothing to export");
            }

            let report = exporter.export_snapshot(vectors, full)?;
            println!(
                "snapshot written to {} ({} files, committed: {}, pushed: {})",
                report.export_dir.display(),
                report.files.len(),
                report.committed,
                report.pushed
            );
        }
    }
    Ok(())
}

fn run_git_sync(data_dir: &PathBuf, config: &Settings, action: GitSyncAction) -> Result<()> {
    let mut replication = config.replication.clone();
    let exporter_dir = settings::paths::export_dir(data_dir);

    match action {
        GitSyncAction::Status => {
            let exporter = ReplicationExporter::new(exporter_dir, replication);
            println!("{}", serde_json::to_string_pretty(&exporter.status())?);
        }
        GitSyncAction::Init { remote } => {
            if let Some(remote) = remote {
                replication.remote_url = Some(remote);
            }
            let exporter = ReplicationExporter::new(exporter_dir, replication);
            exporter.ensure_initialized()?;
            println!("replication workspace ready at {}", exporter.export_dir().display());
        }
        GitSyncAction::Push { full } => {
            let exporter = ReplicationExporter::new(exporter_dir, replication);
            let vectors_db = settings::paths::vectors_db(data_dir);
            let store_db = settings::paths::store_db(data_dir);

            // Push auto-initializes and snapshots before sending.
            let report = exporter.export_snapshot(
                vectors_db.exists().then_some(vectors_db.as_path()),
                (full && store_db.exists()).then_some(store_db.as_path()),
            )?;
            exporter.push().context("push failed")?;
            println!("pushed snapshot ({} files)", report.files.len());
        }
        GitSyncAction::Pull => {
            let exporter = ReplicationExporter::new(exporter_dir, replication);
            exporter.pull().context("pull failed")?;
            println!("pulled latest snapshot");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_migrate(
    data_dir: &PathBuf,
    source: String,
    project: String,
    memory_session_id: Option<String>,
    batch_size: usize,
    dry_run: bool,
    fields: FieldPaths,
    transforms: Transforms,
) -> Result<()> {
    let raw = if source.starts_with("http://") || source.starts_with("https://") {
        reqwest::get(&source)
            .await
            .with_context(|| format!("fetching {source}"))?
            .text()
            .await?
    } else {
        std::fs::read_to_string(&source).with_context(|| format!("reading {source}"))?
    };

    let records: Vec<serde_json::Value> =
        serde_json::from_str(&raw).context("source must be a JSON array of records")?;

    let adapter = SchemaAdapter::new(SchemaAdapterConfig {
        id: "cli".into(),
        name: source.clone(),
        url: None,
        fields,
        transforms,
    });

    let store = MemoryStore::open(&settings::paths::store_db(data_dir))?;
    let options = MigrateOptions {
        target_project: project,
        memory_session_id,
        batch_size,
        continue_on_error: true,
        dry_run,
    };

    let report = store.migrate_batch(&adapter, &records, &options)?;
    println!(
        "{}migrated: total {}, imported {}, duplicates {}, errors {} ({} ms)",
        if dry_run { "[dry run] " } else { "" },
        report.total,
        report.imported,
        report.duplicates,
        report.errors,
        report.duration_ms
    );

    if report.errors > 0 {
        bail!("{} records failed to import", report.errors);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_export_flag_parsing() {
        let cli = Cli::try_parse_from([
            "memoir", "export", "--format", "json", "--project", "memoir",
        ])
        .unwrap();
        match cli.command {
            Commands::Export { format: ExportFormat::Json, project, .. } => {
                assert_eq!(project.as_deref(), Some("memoir"));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_migrate_field_overrides_parse() {
        let cli = Cli::try_parse_from([
            "memoir",
            "migrate",
            "--source",
            "/tmp/export.json",
            "--project",
            "legacy",
            "--field-title",
            "doc.heading",
            "--timestamp-format",
            "iso8601",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Migrate { field_title, timestamp_format, dry_run, .. } => {
                assert_eq!(field_title.as_deref(), Some("doc.heading"));
                assert!(matches!(timestamp_format, TimestampFormatArg::Iso8601));
                assert!(dry_run);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_git_sync_push_parses() {
        let cli = Cli::try_parse_from(["memoir", "git-sync", "push", "--full"]).unwrap();
        match cli.command {
            Commands::GitSync { action: GitSyncAction::Push { full } } => assert!(full),
            _ => panic!("wrong subcommand"),
        }
    }
}
