// src/service.rs
//! Request-facing facade over the resolution engine, the feedback ledger and
//! the retraining orchestrator. Handlers hold an `Arc<IntelligenceService>`.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ResolutionError, Result};
use crate::matching::knowledge_base::KnowledgeBase;
use crate::matching::resolver::{ResolutionEngine, PRODUCT_FIELD};
use crate::models::{
    FeedbackEntry, FeedbackOutcome, HealthStatus, ModelStats, Record, ResolutionOutput,
    RetrainOutcome, TenantPairKey, TrainingStats,
};
use crate::rl::{is_trainable, RetrainingOrchestrator, TriggerOutcome};
use crate::storage::{FeedbackLedger, ModelStore};
use crate::utils::config::ResolutionConfig;

const OPERATIONAL: &str = "operational";
const UNAVAILABLE: &str = "unavailable";

struct Backend {
    engine: ResolutionEngine,
    ledger: Arc<FeedbackLedger>,
    orchestrator: RetrainingOrchestrator,
}

pub struct IntelligenceService {
    config: ResolutionConfig,
    backend: Option<Backend>,
}

impl IntelligenceService {
    /// Builds the engine from `config`. A storage failure during startup is
    /// logged and leaves the service without a backend; every request then
    /// fails with `ServiceUnavailable`.
    pub async fn initialize(config: ResolutionConfig) -> Self {
        let backend = match Self::build_backend(&config).await {
            Ok(backend) => {
                info!("✅ Resolution service initialized");
                Some(backend)
            }
            Err(e) => {
                error!("❌ Resolution backend failed to initialize: {}", e);
                None
            }
        };
        Self { config, backend }
    }

    async fn build_backend(config: &ResolutionConfig) -> Result<Backend> {
        tokio::fs::create_dir_all(&config.model_path).await?;
        tokio::fs::create_dir_all(&config.training_data_path).await?;

        let knowledge_base = Arc::new(KnowledgeBase::seeded(config.fuzzy_threshold));
        if let Some(seed_path) = &config.knowledge_base_path {
            let added = knowledge_base.load_seed_file(seed_path).await?;
            info!(
                "Knowledge base extended with {} variants from {}",
                added,
                seed_path.display()
            );
        }

        let model_store = Arc::new(ModelStore::new(&config.model_path));
        let ledger = Arc::new(FeedbackLedger::new(&config.training_data_path));
        let orchestrator = RetrainingOrchestrator::new(
            model_store.clone(),
            ledger.clone(),
            knowledge_base.clone(),
            config.retrain_threshold,
            config.min_training_samples,
        );
        let engine = ResolutionEngine::new(knowledge_base, model_store, config.match_threshold);

        Ok(Backend {
            engine,
            ledger,
            orchestrator,
        })
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Backend> {
        self.backend.as_ref().ok_or_else(|| {
            ResolutionError::ServiceUnavailable("resolution backend not initialized".to_string())
        })
    }

    pub async fn resolve_entities(
        &self,
        record: &Record,
        source_tenant: &str,
        target_tenant: &str,
    ) -> Result<ResolutionOutput> {
        let backend = self.backend()?;
        let key = TenantPairKey::new(source_tenant, target_tenant)?;
        debug!("Resolving {} fields for {}", record.len(), key);
        Ok(backend.engine.resolve(record, &key).await)
    }

    /// Records a correction and retrains when enough feedback has piled up.
    /// Normal processing failures come back as `success == false`.
    pub async fn submit_feedback(
        &self,
        source_tenant: &str,
        target_tenant: &str,
        source_field: &str,
        source_value: &str,
        target_field: &str,
        corrected_value: &str,
    ) -> Result<FeedbackOutcome> {
        let backend = self.backend()?;
        let key = match TenantPairKey::new(source_tenant, target_tenant) {
            Ok(key) => key,
            Err(e) => return Ok(FeedbackOutcome::rejected(e.to_string())),
        };

        let entry = FeedbackEntry::new(
            &key,
            source_field,
            source_value,
            target_field,
            corrected_value,
        );
        if let Err(e) = backend.ledger.append(&entry).await {
            error!("Failed to store feedback for {}: {}", key, e);
            return Ok(FeedbackOutcome::rejected(format!(
                "Failed to store feedback: {}",
                e
            )));
        }

        if target_field == PRODUCT_FIELD {
            backend
                .engine
                .knowledge_base()
                .add_entry(source_value, corrected_value);
        }

        let count = match backend.ledger.count(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    "Feedback for {} stored but could not be counted: {}",
                    key, e
                );
                return Ok(FeedbackOutcome::accepted(false));
            }
        };

        let retrained = match backend.orchestrator.on_feedback(&key, count).await {
            TriggerOutcome::Retrained(_) => true,
            TriggerOutcome::NotTriggered => false,
            TriggerOutcome::Failed(e) => {
                debug!("Feedback for {} kept after failed retraining: {}", key, e);
                false
            }
        };
        Ok(FeedbackOutcome::accepted(retrained))
    }

    /// Stats for the persisted model of a `"{source}__{target}"` key.
    pub async fn get_model_stats(&self, tenant_pair_key: &str) -> Result<ModelStats> {
        let backend = self.backend()?;
        let key = TenantPairKey::parse(tenant_pair_key)?;
        Ok(backend.engine.model_store().stats(&key).await)
    }

    pub async fn get_training_stats(
        &self,
        source_tenant: &str,
        target_tenant: &str,
    ) -> Result<TrainingStats> {
        let backend = self.backend()?;
        let key = TenantPairKey::new(source_tenant, target_tenant)?;
        let feedback_count = backend.ledger.count(&key).await?;
        // Entries with empty values are stored but never become samples.
        let samples = backend
            .ledger
            .entries(&key)
            .await?
            .iter()
            .filter(|e| is_trainable(e))
            .count();
        let last_updated = backend.ledger.last_updated(&key).await;
        let model = backend.engine.model_store().stats(&key).await;
        let min_samples = self.config.min_training_samples;

        Ok(TrainingStats {
            feedback_count,
            last_updated,
            ready_for_training: samples >= min_samples,
            samples_needed: min_samples.saturating_sub(samples),
            model_exists: Some(model.exists),
            model_cached: Some(model.cached),
        })
    }

    /// Retrains regardless of the minimum sample count. Training failures
    /// are reported in the outcome rather than as an error.
    pub async fn force_retrain(
        &self,
        source_tenant: &str,
        target_tenant: &str,
    ) -> Result<RetrainOutcome> {
        let backend = self.backend()?;
        let key = TenantPairKey::new(source_tenant, target_tenant)?;
        match backend.orchestrator.force_retrain(&key).await {
            Ok(report) => Ok(RetrainOutcome {
                success: true,
                message: format!(
                    "Model retrained with {} samples ({} positive, {} negative)",
                    report.samples_used, report.positives, report.negatives
                ),
                samples_used: report.samples_used,
            }),
            Err(e) => Ok(RetrainOutcome {
                success: false,
                message: format!("Retraining failed: {}", e),
                samples_used: 0,
            }),
        }
    }

    /// Tenant pairs that currently have feedback waiting to be trained on.
    pub async fn pending_tenant_pairs(&self) -> Result<Vec<TenantPairKey>> {
        self.backend()?.ledger.list_keys().await
    }

    pub async fn health(&self) -> HealthStatus {
        let mut components = BTreeMap::new();
        match &self.backend {
            Some(backend) => {
                let kb = backend.engine.knowledge_base();
                components.insert(
                    "knowledge_base".to_string(),
                    if kb.is_empty() { "empty" } else { OPERATIONAL }.to_string(),
                );
                components.insert(
                    "model_store".to_string(),
                    dir_status(backend.engine.model_store().model_dir()).await,
                );
                components.insert(
                    "feedback_ledger".to_string(),
                    dir_status(backend.ledger.data_dir()).await,
                );
            }
            None => {
                for name in ["knowledge_base", "model_store", "feedback_ledger"] {
                    components.insert(name.to_string(), UNAVAILABLE.to_string());
                }
            }
        }
        HealthStatus::from_components(components)
    }
}

async fn dir_status(path: &Path) -> String {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => OPERATIONAL.to_string(),
        Ok(_) => "not a directory".to_string(),
        Err(_) => "missing".to_string(),
    }
}
