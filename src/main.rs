use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use healthsync::cli::{run_quest_ingest, run_whoop_auth, run_whoop_ingest, QuestArgs, WhoopArgs};
use healthsync::Config;

#[derive(Parser)]
#[command(name = "healthsync")]
#[command(about = "Cross-source health data ingestion and normalization")]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// WHOOP wearable data
    Whoop {
        #[command(subcommand)]
        command: WhoopCommands,
    },
    /// Quest lab reports
    Quest {
        #[command(subcommand)]
        command: QuestCommands,
    },
}

#[derive(Subcommand)]
enum WhoopCommands {
    /// Run the browser authorization flow and store the credential
    Auth,
    /// Fetch records into the raw layer (and optionally the unified layer)
    Ingest {
        /// Resources to ingest (default: all)
        resources: Vec<String>,

        /// Comma-separated resource list, overrides positional names
        #[arg(long = "resources", value_delimiter = ',')]
        resource_list: Option<Vec<String>>,

        /// Window start (ISO-8601, inclusive)
        #[arg(long)]
        since: Option<String>,

        /// Window end (ISO-8601, exclusive)
        #[arg(long)]
        until: Option<String>,

        /// Also project records into the unified schema
        #[arg(long)]
        canonical: bool,

        /// Clear and re-ingest the previous UTC day
        #[arg(long)]
        daily_refresh: bool,
    },
}

#[derive(Subcommand)]
enum QuestCommands {
    /// Ingest FHIR lab exports from a file or directory
    Ingest {
        /// File or directory of .json/.ndjson/.pdf exports
        #[arg(long)]
        path: Option<PathBuf>,

        /// Force all records onto this patient id
        #[arg(long)]
        patient_id: Option<String>,

        /// Window start (ISO-8601, inclusive)
        #[arg(long)]
        since: Option<String>,

        /// Window end (ISO-8601, exclusive)
        #[arg(long)]
        until: Option<String>,

        /// Also project records into the unified schema
        #[arg(long)]
        canonical: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Whoop { command } => match command {
            WhoopCommands::Auth => run_whoop_auth(&config).await,
            WhoopCommands::Ingest {
                resources,
                resource_list,
                since,
                until,
                canonical,
                daily_refresh,
            } => {
                let resources = resource_list.unwrap_or(resources);
                run_whoop_ingest(
                    &config,
                    WhoopArgs {
                        resources,
                        since,
                        until,
                        canonical,
                        daily_refresh,
                    },
                )
                .await
            }
        },
        Commands::Quest { command } => match command {
            QuestCommands::Ingest {
                path,
                patient_id,
                since,
                until,
                canonical,
            } => {
                run_quest_ingest(
                    &config,
                    QuestArgs {
                        path,
                        patient_id,
                        since,
                        until,
                        canonical,
                    },
                )
                .await
            }
        },
    }
}
