// src/utils/config.rs
use log::info;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::matching::gazetteer::{DEFAULT_MATCH_THRESHOLD, DEFAULT_MIN_TRAINING_SAMPLES};
use crate::matching::knowledge_base::DEFAULT_FUZZY_THRESHOLD;
use crate::rl::DEFAULT_RETRAIN_THRESHOLD;

/// Runtime configuration for the resolution engine and retraining loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionConfig {
    /// Directory holding one settings blob per tenant pair
    pub model_path: PathBuf,
    /// Directory holding feedback logs and their `archive/`
    pub training_data_path: PathBuf,
    pub min_training_samples: usize,
    pub fuzzy_threshold: f64,
    /// Retrain after this many new feedback entries
    pub retrain_threshold: usize,
    /// Minimum gazetteer score for a probabilistic match
    pub match_threshold: f64,
    /// Optional JSON object of extra knowledge base variants
    pub knowledge_base_path: Option<PathBuf>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("./models"),
            training_data_path: PathBuf::from("./training_data"),
            min_training_samples: DEFAULT_MIN_TRAINING_SAMPLES,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            retrain_threshold: DEFAULT_RETRAIN_THRESHOLD,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            knowledge_base_path: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl ResolutionConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_path: env::var("DEDUPE_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            training_data_path: env::var("TRAINING_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.training_data_path),
            min_training_samples: env_or("MIN_TRAINING_SAMPLES", defaults.min_training_samples),
            fuzzy_threshold: env_or("FUZZY_MATCH_THRESHOLD", defaults.fuzzy_threshold)
                .clamp(0.0, 1.0),
            retrain_threshold: env_or("RETRAIN_THRESHOLD", defaults.retrain_threshold).max(1),
            match_threshold: env_or("MATCH_THRESHOLD", defaults.match_threshold).clamp(0.0, 1.0),
            knowledge_base_path: env::var("KNOWLEDGE_BASE_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn log_config(&self) {
        info!("⚙️  Resolution configuration:");
        info!("   Model path: {}", self.model_path.display());
        info!("   Training data path: {}", self.training_data_path.display());
        info!(
            "   Min training samples: {}, retrain every {} corrections",
            self.min_training_samples, self.retrain_threshold
        );
        info!(
            "   Fuzzy threshold: {:.2}, match threshold: {:.2}",
            self.fuzzy_threshold, self.match_threshold
        );
        match &self.knowledge_base_path {
            Some(path) => info!("   Knowledge base seed: {}", path.display()),
            None => info!("   Knowledge base seed: built-in only"),
        }
    }
}
