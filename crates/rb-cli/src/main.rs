mod commands;
mod manifest;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rb_core::config::Config;
use rb_telemetry::LogFormat;
use tracing::Instrument;
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// runbox CLI -- run coding agents against a repository in containers.
#[derive(Parser)]
#[command(name = "rb", version, about)]
struct Cli {
    /// Config file (defaults to ~/.runbox/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON logs regardless of the configured format.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one run of a task described by a manifest.
    Run {
        /// Manifest with [user], [project], [agent] and [task] tables.
        #[arg(short, long, required_unless_present = "task", conflicts_with = "task")]
        manifest: Option<PathBuf>,
        /// Prompt handed to the agent.
        #[arg(short, long)]
        prompt: String,
        /// Continue an existing task from the database instead of creating one.
        #[arg(long)]
        task: Option<Uuid>,
        /// SQLite database (defaults to <data_dir>/runbox.db).
        #[arg(long)]
        db: Option<PathBuf>,
        /// Print the timeline as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a manifest without running anything.
    Check {
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Print the stored steps of a run.
    Steps {
        #[arg(long)]
        run: Uuid,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Rebuild a task's dev image from the project's Dockerfile.
    Rebuild {
        #[arg(long)]
        task: Uuid,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        config.general.log_format
    };
    format.init("rb", &config.general.log_level);

    let (span, trace_id) = rb_telemetry::tracing_setup::create_operation_span("rb");
    tracing::debug!(trace_id = %trace_id, "starting");

    async move {
        match cli.command {
            Commands::Run {
                manifest,
                prompt,
                task,
                db,
                json,
            } => {
                let source = match (task, manifest) {
                    (Some(id), _) => commands::run::TaskSource::Stored(id),
                    (None, Some(path)) => commands::run::TaskSource::Manifest(path),
                    (None, None) => anyhow::bail!("either --manifest or --task is required"),
                };
                commands::run::run(&config, source, &prompt, db, json).await
            }
            Commands::Check { manifest } => commands::check::run(&manifest),
            Commands::Steps { run, db, json } => {
                commands::steps::run(&config, run, db, json).await
            }
            Commands::Rebuild { task, db } => commands::rebuild::run(&config, task, db).await,
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_a_stored_task_without_manifest() {
        let id = Uuid::new_v4();
        let id_arg = id.to_string();
        let cli =
            Cli::try_parse_from(["rb", "run", "--task", id_arg.as_str(), "--prompt", "again"])
                .unwrap();
        match cli.command {
            Commands::Run {
                manifest,
                task,
                prompt,
                ..
            } => {
                assert!(manifest.is_none());
                assert_eq!(task, Some(id));
                assert_eq!(prompt, "again");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_accepts_a_manifest() {
        let cli = Cli::try_parse_from(["rb", "run", "-m", "task.toml", "-p", "hi"]).unwrap();
        match cli.command {
            Commands::Run { manifest, task, .. } => {
                assert_eq!(manifest, Some(PathBuf::from("task.toml")));
                assert!(task.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_needs_a_manifest_or_a_task() {
        assert!(Cli::try_parse_from(["rb", "run", "--prompt", "hi"]).is_err());
    }

    #[test]
    fn run_rejects_both_manifest_and_task() {
        let id = Uuid::new_v4().to_string();
        let args = ["rb", "run", "-m", "task.toml", "--task", id.as_str(), "-p", "hi"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
