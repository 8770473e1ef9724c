// src/rl/orchestrator.rs
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::training_data::build_training_pairs;
use crate::error::{ResolutionError, Result};
use crate::matching::gazetteer::GazetteerTrainer;
use crate::matching::knowledge_base::KnowledgeBase;
use crate::models::TenantPairKey;
use crate::storage::{FeedbackLedger, ModelStore, TrainedModel};

pub const DEFAULT_RETRAIN_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainPhase {
    Idle,
    Accumulating,
    Retraining,
}

#[derive(Debug, Clone, Copy)]
struct PairState {
    phase: RetrainPhase,
    // Ledger count at the last triggered attempt; zero after a successful cycle.
    last_attempt_count: usize,
}

impl Default for PairState {
    fn default() -> Self {
        Self {
            phase: RetrainPhase::Idle,
            last_attempt_count: 0,
        }
    }
}

/// Summary of one successful retraining cycle.
#[derive(Debug, Clone)]
pub struct RetrainReport {
    pub run_id: Uuid,
    pub samples_used: usize,
    pub positives: usize,
    pub negatives: usize,
    pub model: Arc<TrainedModel>,
    pub archived_to: Option<PathBuf>,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    NotTriggered,
    Retrained(RetrainReport),
    Failed(ResolutionError),
}

/// Lowers the sample gate for one tenant pair until dropped, on every exit
/// path. Only taken while holding the pair's flight lock, so overrides never
/// nest.
pub struct SampleGateOverride<'a> {
    overrides: &'a Mutex<HashMap<TenantPairKey, usize>>,
    key: TenantPairKey,
}

impl<'a> SampleGateOverride<'a> {
    fn lower(
        overrides: &'a Mutex<HashMap<TenantPairKey, usize>>,
        key: &TenantPairKey,
        min_samples: usize,
    ) -> Self {
        overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), min_samples);
        Self {
            overrides,
            key: key.clone(),
        }
    }
}

impl Drop for SampleGateOverride<'_> {
    fn drop(&mut self) {
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        debug!("Sample gate restored for {}", self.key);
    }
}

/// Turns accumulated feedback into trained models.
///
/// Per tenant pair: `Idle`/`Accumulating` -> `Retraining` once the ledger has
/// grown by `retrain_threshold` entries since the last attempt; back to
/// `Idle` after the model is saved and the feedback archived, or to
/// `Accumulating` if training fails (feedback is kept).
pub struct RetrainingOrchestrator {
    model_store: Arc<ModelStore>,
    ledger: Arc<FeedbackLedger>,
    knowledge_base: Arc<KnowledgeBase>,
    retrain_threshold: usize,
    min_training_samples: usize,
    states: Mutex<HashMap<TenantPairKey, PairState>>,
    gate_overrides: Mutex<HashMap<TenantPairKey, usize>>,
    flights: Mutex<HashMap<TenantPairKey, Arc<AsyncMutex<()>>>>,
}

impl RetrainingOrchestrator {
    pub fn new(
        model_store: Arc<ModelStore>,
        ledger: Arc<FeedbackLedger>,
        knowledge_base: Arc<KnowledgeBase>,
        retrain_threshold: usize,
        min_training_samples: usize,
    ) -> Self {
        Self {
            model_store,
            ledger,
            knowledge_base,
            retrain_threshold: retrain_threshold.max(1),
            min_training_samples,
            states: Mutex::new(HashMap::new()),
            gate_overrides: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn retrain_threshold(&self) -> usize {
        self.retrain_threshold
    }

    /// Configured minimum number of training samples.
    pub fn min_training_samples(&self) -> usize {
        self.min_training_samples
    }

    /// Sample gate in force for `key` right now.
    pub fn effective_min_samples(&self, key: &TenantPairKey) -> usize {
        self.gate_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(self.min_training_samples)
    }

    pub fn phase(&self, key: &TenantPairKey) -> RetrainPhase {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|s| s.phase)
            .unwrap_or(RetrainPhase::Idle)
    }

    fn set_phase(&self, key: &TenantPairKey, phase: RetrainPhase) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_default();
        state.phase = phase;
        if phase == RetrainPhase::Idle {
            state.last_attempt_count = 0;
        }
    }

    fn flight_for(&self, key: &TenantPairKey) -> Arc<AsyncMutex<()>> {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Check-and-fire, atomic per tenant pair. Returns whether this call
    /// claimed the retraining slot.
    fn claim_trigger(&self, key: &TenantPairKey, feedback_count: usize) -> bool {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_default();
        if state.phase == RetrainPhase::Retraining {
            debug!("Retraining already in flight for {}; not triggering again", key);
            return false;
        }
        if feedback_count > 0
            && feedback_count >= state.last_attempt_count + self.retrain_threshold
        {
            state.phase = RetrainPhase::Retraining;
            state.last_attempt_count = feedback_count;
            true
        } else {
            if feedback_count > 0 {
                state.phase = RetrainPhase::Accumulating;
            }
            false
        }
    }

    /// Called after every accepted feedback entry with the fresh ledger count.
    pub async fn on_feedback(&self, key: &TenantPairKey, feedback_count: usize) -> TriggerOutcome {
        if !self.claim_trigger(key, feedback_count) {
            return TriggerOutcome::NotTriggered;
        }
        info!(
            "🔁 Feedback for {} reached {} entries; retraining",
            key, feedback_count
        );
        match self.execute(key, false).await {
            Ok(report) => TriggerOutcome::Retrained(report),
            Err(e) => TriggerOutcome::Failed(e),
        }
    }

    /// Runs one cycle with the configured sample gate.
    pub async fn retrain(&self, key: &TenantPairKey) -> Result<RetrainReport> {
        self.execute(key, false).await
    }

    /// Administrator retraining: the sample gate drops to 1 for this pair
    /// while the cycle runs and is restored whether or not training succeeds.
    pub async fn force_retrain(&self, key: &TenantPairKey) -> Result<RetrainReport> {
        info!("Forced retraining requested for {}", key);
        self.execute(key, true).await
    }

    async fn execute(&self, key: &TenantPairKey, forced: bool) -> Result<RetrainReport> {
        let flight = self.flight_for(key);
        let _in_flight = flight.lock().await;
        let _gate = forced.then(|| SampleGateOverride::lower(&self.gate_overrides, key, 1));
        let min_samples = self.effective_min_samples(key);

        self.set_phase(key, RetrainPhase::Retraining);
        let result = self.run_cycle(key, min_samples).await;
        match &result {
            Ok(report) => {
                self.set_phase(key, RetrainPhase::Idle);
                info!(
                    "✅ Retraining {} for {} finished: {} samples ({} positive, {} negative)",
                    report.run_id, key, report.samples_used, report.positives, report.negatives
                );
            }
            Err(ResolutionError::Training(e)) => {
                self.set_phase(key, RetrainPhase::Accumulating);
                warn!("Retraining for {} skipped: {}. Feedback kept.", key, e);
            }
            Err(e) => {
                self.set_phase(key, RetrainPhase::Accumulating);
                error!("Retraining for {} failed: {}. Feedback kept.", key, e);
            }
        }
        result
    }

    async fn run_cycle(&self, key: &TenantPairKey, min_samples: usize) -> Result<RetrainReport> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();

        let entries = self.ledger.checkout(key).await?;
        let pairs = build_training_pairs(&entries, &self.knowledge_base.canonical_values());
        let samples_used = pairs.samples();
        let (positives, negatives) = (samples_used, pairs.distinct.len());
        info!(
            "Retraining {} for {}: {} feedback entries -> {} samples",
            run_id,
            key,
            entries.len(),
            samples_used
        );

        let trainer = GazetteerTrainer::new(min_samples);
        let settings = tokio::task::spawn_blocking(move || trainer.train(&pairs))
            .await
            .map_err(|e| ResolutionError::Internal(format!("training task failed: {}", e)))??;

        let model = self.model_store.save(key, settings).await?;
        let archived_to = self.ledger.archive(key).await?;

        debug!(
            "Retraining {} for {} took {:.2}s",
            run_id,
            key,
            start.elapsed().as_secs_f64()
        );
        Ok(RetrainReport {
            run_id,
            samples_used,
            positives,
            negatives,
            model,
            archived_to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::knowledge_base::DEFAULT_FUZZY_THRESHOLD;
    use crate::models::FeedbackEntry;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ModelStore>,
        ledger: Arc<FeedbackLedger>,
        orchestrator: RetrainingOrchestrator,
    }

    fn fixture(threshold: usize, min_samples: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path().join("models")));
        let ledger = Arc::new(FeedbackLedger::new(dir.path().join("training_data")));
        let orchestrator = RetrainingOrchestrator::new(
            store.clone(),
            ledger.clone(),
            Arc::new(KnowledgeBase::seeded(DEFAULT_FUZZY_THRESHOLD)),
            threshold,
            min_samples,
        );
        Fixture {
            _dir: dir,
            store,
            ledger,
            orchestrator,
        }
    }

    fn key() -> TenantPairKey {
        TenantPairKey::new("A", "B").unwrap()
    }

    async fn add_feedback(f: &Fixture, n: usize) -> usize {
        for i in 0..n {
            let entry = FeedbackEntry::new(
                &key(),
                "product",
                &format!("WPC 80 lot {}", i),
                "product",
                "Whey Protein Concentrate 80%",
            );
            f.ledger.append(&entry).await.unwrap();
        }
        f.ledger.count(&key()).await.unwrap()
    }

    #[tokio::test]
    async fn test_below_threshold_accumulates() {
        let f = fixture(10, 5);
        let count = add_feedback(&f, 3).await;
        assert!(matches!(
            f.orchestrator.on_feedback(&key(), count).await,
            TriggerOutcome::NotTriggered
        ));
        assert_eq!(f.orchestrator.phase(&key()), RetrainPhase::Accumulating);
    }

    #[tokio::test]
    async fn test_insufficient_samples_keeps_feedback() {
        let f = fixture(10, 50);
        let count = add_feedback(&f, 10).await;
        match f.orchestrator.on_feedback(&key(), count).await {
            TriggerOutcome::Failed(ResolutionError::Training(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(f.orchestrator.phase(&key()), RetrainPhase::Accumulating);
        assert_eq!(f.ledger.count(&key()).await.unwrap(), 10);
        assert!(!f.store.stats(&key()).await.exists);

        // The same count does not fire twice; the next threshold step does.
        assert!(!f.orchestrator.claim_trigger(&key(), 10));
        assert!(!f.orchestrator.claim_trigger(&key(), 19));
        assert!(f.orchestrator.claim_trigger(&key(), 20));
    }

    #[tokio::test]
    async fn test_burst_past_threshold_still_triggers() {
        let f = fixture(10, 50);
        assert!(!f.orchestrator.claim_trigger(&key(), 9));
        assert!(f.orchestrator.claim_trigger(&key(), 13));
        assert_eq!(f.orchestrator.phase(&key()), RetrainPhase::Retraining);
        // A concurrent submission sees the slot taken.
        assert!(!f.orchestrator.claim_trigger(&key(), 30));
    }

    #[tokio::test]
    async fn test_successful_cycle_saves_and_archives() {
        let f = fixture(10, 10);
        let count = add_feedback(&f, 10).await;
        let report = match f.orchestrator.on_feedback(&key(), count).await {
            TriggerOutcome::Retrained(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(report.samples_used, 10);
        assert_eq!(report.positives, 10);
        // Consistent corrections borrow the other knowledge base products.
        assert_eq!(report.negatives, 10);
        assert!(report.model.settings.can_discriminate());
        assert!(report.archived_to.is_some());
        assert_eq!(f.orchestrator.phase(&key()), RetrainPhase::Idle);
        assert_eq!(f.ledger.count(&key()).await.unwrap(), 0);
        let stats = f.store.stats(&key()).await;
        assert!(stats.exists && stats.cached);
    }

    #[tokio::test]
    async fn test_force_retrain_restores_gate_on_success_and_failure() {
        let f = fixture(10, 50);

        // Nothing to train on: fails, gate still restored.
        assert!(f.orchestrator.force_retrain(&key()).await.is_err());
        assert_eq!(f.orchestrator.effective_min_samples(&key()), 50);

        add_feedback(&f, 1).await;
        let report = f.orchestrator.force_retrain(&key()).await.unwrap();
        assert_eq!(report.samples_used, 1);
        assert_eq!(f.orchestrator.effective_min_samples(&key()), 50);
        assert_eq!(f.orchestrator.min_training_samples(), 50);
    }

    #[tokio::test]
    async fn test_overlapping_force_retrains_restore_gate() {
        let f = fixture(10, 50);
        add_feedback(&f, 1).await;

        let (k1, k2) = (key(), key());
        let (first, second) = tokio::join!(
            f.orchestrator.force_retrain(&k1),
            f.orchestrator.force_retrain(&k2)
        );
        // The second call finds the feedback already archived.
        let reports: Vec<_> = [first, second].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].samples_used, 1);
        assert_eq!(f.orchestrator.effective_min_samples(&key()), 50);

        // A regular trigger afterwards uses the configured gate again.
        let count = add_feedback(&f, 10).await;
        match f.orchestrator.on_feedback(&key(), count).await {
            TriggerOutcome::Failed(ResolutionError::Training(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(f.ledger.count(&key()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_force_retrain_on_other_field_archives() {
        let f = fixture(10, 50);
        let entry = FeedbackEntry::new(&key(), "incoterm", "fob", "incoterm", "FOB");
        f.ledger.append(&entry).await.unwrap();

        let report = f.orchestrator.force_retrain(&key()).await.unwrap();
        assert_eq!(report.samples_used, 1);
        assert_eq!(report.negatives, 0);
        assert!(!report.model.settings.can_discriminate());
        assert!(report.archived_to.is_some());
        assert_eq!(f.ledger.count(&key()).await.unwrap(), 0);
    }

    #[test]
    fn test_gate_override_is_removed_on_drop() {
        let overrides = Mutex::new(HashMap::new());
        {
            let _gate = SampleGateOverride::lower(&overrides, &key(), 1);
            assert_eq!(overrides.lock().unwrap().get(&key()), Some(&1));
        }
        assert!(overrides.lock().unwrap().is_empty());
    }
}
