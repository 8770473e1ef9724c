// src/bin/retrain_all.rs
use anyhow::Result;
use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

use resolution_lib::models::{RetrainOutcome, TenantPairKey};
use resolution_lib::utils::env::load_env;
use resolution_lib::{IntelligenceService, ResolutionConfig};

#[derive(Parser)]
#[command(author, version, about = "Force-retrain every tenant pair with pending feedback")]
struct RetrainAllArgs {
    /// Number of tenant pairs retrained at the same time
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// List the tenant pairs that would be retrained and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    load_env();
    let args = RetrainAllArgs::parse();

    let config = ResolutionConfig::from_env();
    config.log_config();
    let service = Arc::new(IntelligenceService::initialize(config).await);

    let keys = service.pending_tenant_pairs().await?;
    if keys.is_empty() {
        info!("No pending feedback to retrain on.");
        return Ok(());
    }
    info!("Found {} tenant pairs with pending feedback", keys.len());
    if args.dry_run {
        for key in &keys {
            println!("{}", key);
        }
        return Ok(());
    }

    let start = Instant::now();
    let pb = ProgressBar::new(keys.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )?
            .progress_chars("#>-"),
    );

    let results: Vec<(TenantPairKey, resolution_lib::Result<RetrainOutcome>)> =
        stream::iter(keys)
            .map(|key| {
                let service = Arc::clone(&service);
                let pb = pb.clone();
                async move {
                    let outcome = service.force_retrain(key.source(), key.target()).await;
                    pb.set_message(key.to_string());
                    pb.inc(1);
                    (key, outcome)
                }
            })
            .buffer_unordered(args.concurrency.max(1))
            .collect()
            .await;
    pb.finish_with_message("Retraining complete.");

    let mut retrained = 0;
    let mut samples = 0;
    for (key, result) in &results {
        match result {
            Ok(outcome) if outcome.success => {
                retrained += 1;
                samples += outcome.samples_used;
            }
            Ok(outcome) => warn!("{}: {}", key, outcome.message),
            Err(e) => warn!("{}: {}", key, e),
        }
    }

    println!("\n=== RETRAINING SUMMARY ===");
    println!("Tenant pairs: {}", results.len());
    println!("Retrained: {}", retrained);
    println!("Failed/Skipped: {}", results.len() - retrained);
    println!("Samples used: {}", samples);
    println!("Elapsed: {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
