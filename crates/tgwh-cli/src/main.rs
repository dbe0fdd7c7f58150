use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tgwh_sync::logging::{init_logging, LogConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tgwh")]
#[command(about = "Telegram channel warehouse: scrape, stage and load raw messages")]
struct Cli {
    /// Keep loaded rows in memory instead of writing to PostgreSQL.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured channel, stage and load each one.
    Scrape,
    /// Load staged JSON files into the raw warehouse tables.
    Load {
        /// Only load `telegram_messages/{YYYY-MM-DD}`.
        #[arg(long)]
        date_folder: Option<String>,
    },
    /// Scrape, then reload all staged files.
    Both,
    /// Print the data lake inventory.
    Summary,
    /// Poll the staging directory and load when new files appear.
    Watch,
    /// Create the raw schema.
    Migrate,
    /// Run the read-only analytics API.
    Serve,
    /// List staged images awaiting object detection.
    Images {
        #[arg(long)]
        date_folder: Option<String>,
    },
    /// Append detector output to `raw.image_detections`.
    LoadDetections { file: PathBuf },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_env()?)?;
    let dry_run = cli.dry_run;

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let report = tgwh_sync::run_scrape_from_env(dry_run).await?;
            print_json(&report)?;
        }
        Commands::Load { date_folder } => {
            let report = tgwh_sync::run_load_from_env(date_folder.as_deref(), dry_run).await?;
            print_json(&report)?;
        }
        Commands::Both => {
            let (scrape, load) = tgwh_sync::run_both_from_env(dry_run).await?;
            print_json(&serde_json::json!({ "scrape": scrape, "load": load }))?;
        }
        Commands::Summary => {
            print_json(&tgwh_sync::summary_from_env()?)?;
        }
        Commands::Watch => {
            tgwh_sync::run_watch_from_env(dry_run).await?;
        }
        Commands::Migrate => {
            tgwh_sync::migrate_from_env().await?;
            info!("raw schema is up to date");
        }
        Commands::Serve => {
            tgwh_web::serve_from_env().await?;
        }
        Commands::Images { date_folder } => {
            print_json(&tgwh_sync::images_from_env(date_folder.as_deref())?)?;
        }
        Commands::LoadDetections { file } => {
            let rows = tgwh_sync::load_detections_from_env(&file, dry_run).await?;
            print_json(&serde_json::json!({ "file": file.display().to_string(), "rows": rows }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_scrape() {
        let cli = Cli::parse_from(["tgwh"]);
        assert!(cli.command.is_none());
        assert!(!cli.dry_run);
    }

    #[test]
    fn parses_load_with_date_folder_and_global_dry_run() {
        let cli = Cli::parse_from(["tgwh", "load", "--date-folder", "2025-01-02", "--dry-run"]);
        assert!(cli.dry_run);
        assert!(matches!(
            cli.command,
            Some(Commands::Load { date_folder: Some(ref d) }) if d == "2025-01-02"
        ));
    }

    #[test]
    fn parses_load_detections_path() {
        let cli = Cli::parse_from(["tgwh", "load-detections", "detections.json"]);
        assert!(matches!(
            cli.command,
            Some(Commands::LoadDetections { ref file }) if file == &PathBuf::from("detections.json")
        ));
    }
}
