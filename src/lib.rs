// src/lib.rs
pub mod error;
pub mod matching;
pub mod models;
pub mod rl;
pub mod service;
pub mod storage;
pub mod utils;

pub use error::{ResolutionError, Result};
pub use service::IntelligenceService;
pub use utils::config::ResolutionConfig;
