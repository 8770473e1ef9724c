// src/models/mod.rs
pub mod core;
pub mod stats;

pub use self::core::{
    single_field_record, FeedbackEntry, LabeledPairs, MatchResult, Record, TenantPairKey,
    TrainingPair,
};
pub use self::stats::{
    FeedbackOutcome, HealthStatus, ModelStats, ResolutionOutput, RetrainOutcome, TrainingStats,
};
