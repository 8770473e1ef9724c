// src/bin/report_model_weights.rs
use anyhow::{Context, Result};
use clap::Parser;

use resolution_lib::models::TenantPairKey;
use resolution_lib::storage::{ModelStore, TrainedModel};
use resolution_lib::utils::env::load_env;
use resolution_lib::ResolutionConfig;

const FEATURE_NAMES: [&str; 4] = [
    "jaro_winkler",
    "levenshtein",
    "token_jaccard",
    "sorensen_dice",
];

#[derive(Parser)]
#[command(author, version, about = "Print the learned field weights of stored models")]
struct ReportArgs {
    /// Only report this tenant pair, as `SOURCE__TARGET`
    #[arg(long)]
    pair: Option<String>,
}

fn print_model_report(model: &TrainedModel) {
    let settings = &model.settings;
    println!("==================================================");
    println!("  Tenant pair: {}", model.key);
    println!("==================================================");
    println!("  Trained at: {}", model.trained_at.to_rfc3339());
    println!(
        "  Samples: {} matches, {} distinct ({} updates)",
        settings.match_count,
        settings.distinct_count,
        settings.training_updates()
    );
    println!("  Bias: {:+.4}", settings.bias());
    for (field, weights) in settings.field_weights() {
        println!("  Field: {}", field);
        for (name, weight) in FEATURE_NAMES.iter().zip(weights.iter()) {
            println!("    {:<16} {:+.4}", name, weight);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = ReportArgs::parse();

    let config = ResolutionConfig::from_env();
    let store = ModelStore::new(&config.model_path);

    let keys = match &args.pair {
        Some(pair) => vec![TenantPairKey::parse(pair)?],
        None => store.list_keys().await?,
    };

    println!("--- Gazetteer Model Weight Report ---\n");
    if keys.is_empty() {
        println!("No trained models under {}", config.model_path.display());
    }
    for key in keys {
        let model = store
            .try_load(&key)
            .await?
            .with_context(|| format!("No model stored for {}", key))?;
        print_model_report(&model);
    }
    println!("--- End of Report ---");
    Ok(())
}
