// src/matching/mod.rs
pub mod gazetteer;
pub mod knowledge_base;
pub mod resolver;
pub mod similarity;

pub use gazetteer::{Gazetteer, GazetteerSettings, GazetteerTrainer, RankedMatch};
pub use knowledge_base::KnowledgeBase;
pub use resolver::ResolutionEngine;
