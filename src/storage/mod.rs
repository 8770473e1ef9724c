// src/storage/mod.rs
pub mod feedback_ledger;
pub mod model_store;

pub use feedback_ledger::FeedbackLedger;
pub use model_store::{ModelStore, TrainedModel};
