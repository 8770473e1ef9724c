// src/rl/mod.rs
pub mod orchestrator;
pub mod training_data;

pub use orchestrator::{
    RetrainPhase, RetrainReport, RetrainingOrchestrator, TriggerOutcome,
    DEFAULT_RETRAIN_THRESHOLD,
};
pub use training_data::{build_training_pairs, is_trainable};
