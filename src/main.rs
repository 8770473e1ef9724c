// src/main.rs
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use resolution_lib::models::{Record, TenantPairKey};
use resolution_lib::utils::env::load_env;
use resolution_lib::{IntelligenceService, ResolutionConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a JSON record from one tenant's vocabulary into another's
    Resolve {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        /// Record as a JSON object, e.g. '{"product": "WPC 80"}'
        record: String,
    },
    /// Submit a user correction
    Feedback {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        source_field: String,
        #[arg(long)]
        source_value: String,
        #[arg(long)]
        target_field: String,
        #[arg(long)]
        corrected_value: String,
    },
    /// Show model and training statistics for a tenant pair
    Stats {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
    },
    /// Retrain a tenant pair now, ignoring the minimum sample count
    Retrain {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
    },
    /// Report component health
    Health,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_record(raw: &str) -> Result<Record> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("Record must be valid JSON")?;
    match value {
        serde_json::Value::Object(record) => Ok(record),
        _ => bail!("Record must be a JSON object"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    load_env();
    let cli = Cli::parse();

    let config = ResolutionConfig::from_env();
    config.log_config();
    let service = IntelligenceService::initialize(config).await;

    match cli.command {
        Command::Resolve {
            source,
            target,
            record,
        } => {
            let record = parse_record(&record)?;
            let output = service.resolve_entities(&record, &source, &target).await?;
            print_json(&output)?;
        }
        Command::Feedback {
            source,
            target,
            source_field,
            source_value,
            target_field,
            corrected_value,
        } => {
            let outcome = service
                .submit_feedback(
                    &source,
                    &target,
                    &source_field,
                    &source_value,
                    &target_field,
                    &corrected_value,
                )
                .await?;
            print_json(&outcome)?;
        }
        Command::Stats { source, target } => {
            let training = service.get_training_stats(&source, &target).await?;
            let key = TenantPairKey::new(&source, &target)?;
            let model = service.get_model_stats(&key.as_str()).await?;
            print_json(&serde_json::json!({
                "training": training,
                "model": model,
            }))?;
        }
        Command::Retrain { source, target } => {
            let outcome = service.force_retrain(&source, &target).await?;
            info!("Retraining {} -> {}: {}", source, target, outcome.message);
            print_json(&outcome)?;
        }
        Command::Health => {
            print_json(&service.health().await)?;
        }
    }
    Ok(())
}
