//! The tension engine: detection, arbitration, collapse and vault storage
//! wired into one pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::arbiter::{Arbitration, Decision, GradientState, ResolutionArbiter, StabilityMetrics};
use crate::backend::{NullBackend, VaultBackend};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::geoid::{EntropyRecord, Geoid, GeoidId, GeoidInput};
use crate::registry::GeoidStore;
use crate::router::{RebalanceReport, VaultCoordinator};
use crate::scar::{Scar, ScarDraft, ScarId, VaultId, cls_angle, semantic_polarity};
use crate::tension::{TensionDetector, TensionGradient, pair_key};
use crate::thermo::{DecayEnvironment, EntropyDelta, ThermodynamicValidator, blend_toward};
use crate::time::{now_iso8601, now_unix_f64};
use crate::vault::VaultStatus;

/// Outcome of one [`TensionEngine::run_cycle`] tick.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Gradients above threshold, fresh and re-submitted.
    pub gradients: usize,
    /// Buffered pairs from the previous cycle that were scored again.
    pub resubmitted: usize,
    pub scars: Vec<Scar>,
    pub surged: Vec<(GeoidId, GeoidId)>,
    pub buffered: Vec<(GeoidId, GeoidId)>,
    /// Pairs skipped because detection, arbitration or collapse failed.
    pub errors: usize,
}

pub struct TensionEngine {
    config: EngineConfig,
    geoids: GeoidStore,
    detector: TensionDetector,
    arbiter: ResolutionArbiter,
    validator: ThermodynamicValidator,
    vaults: VaultCoordinator,
    cycle: AtomicU64,
    buffered: Mutex<Vec<(GeoidId, GeoidId)>>,
}

impl TensionEngine {
    /// In-memory engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(NullBackend))
    }

    /// Engine writing scars through `backend`, starting with empty vaults.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn VaultBackend>) -> Result<Self> {
        config.validate()?;
        let vaults = VaultCoordinator::new(config.vault.clone(), backend);
        Ok(Self::assemble(config, vaults))
    }

    /// Engine whose vaults are reloaded from `backend`.
    pub fn restore(config: EngineConfig, backend: Arc<dyn VaultBackend>) -> Result<Self> {
        config.validate()?;
        let vaults = VaultCoordinator::restore(config.vault.clone(), backend)?;
        Ok(Self::assemble(config, vaults))
    }

    fn assemble(config: EngineConfig, vaults: VaultCoordinator) -> Self {
        Self {
            geoids: GeoidStore::new(),
            detector: TensionDetector::new(config.tension.clone()),
            arbiter: ResolutionArbiter::new(config.arbiter.clone()),
            validator: ThermodynamicValidator::new(config.thermo.clone()),
            vaults,
            cycle: AtomicU64::new(0),
            buffered: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn geoids(&self) -> &GeoidStore {
        &self.geoids
    }

    pub fn vaults(&self) -> &VaultCoordinator {
        &self.vaults
    }

    pub fn ingest(&self, input: GeoidInput) -> Result<GeoidId> {
        self.geoids.ingest(input)
    }

    /// Last completed cycle number.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Resume cycle numbering after a restart.
    pub fn set_cycle(&self, cycle: u64) {
        self.cycle.store(cycle, Ordering::SeqCst);
    }

    pub fn detect_tensions(&self, geoids: &[Geoid], threshold: f64) -> Vec<TensionGradient> {
        self.detector.detect(geoids, threshold)
    }

    pub fn arbitrate(
        &self,
        gradient: &TensionGradient,
        stability: &StabilityMetrics,
    ) -> Result<Arbitration> {
        let a = self.geoids.snapshot(gradient.geoid_a)?;
        let b = self.geoids.snapshot(gradient.geoid_b)?;
        Ok(self
            .arbiter
            .arbitrate(gradient, &a, &b, self.cycle(), stability))
    }

    /// Blend the pair toward each other, validate both sides and store the
    /// scar. Geoids change only if both validations and the vault insert
    /// succeed.
    pub fn resolve_collapse(&self, gradient: &TensionGradient) -> Result<Scar> {
        let cycle = self.cycle();
        let window = self.arbiter.mutation_window();
        let blend = self.validator.config().collapse_blend;

        self.geoids
            .with_pair_mut(gradient.geoid_a, gradient.geoid_b, |a, b| {
                let pulse = self.arbiter.assess(gradient, a, b, cycle).pulse_strength;
                let alpha = blend * pulse;

                let mut after_a = a.clone();
                after_a.set_semantic_state(blend_toward(a.semantic_state(), b.semantic_state(), alpha))?;
                let mut after_b = b.clone();
                after_b.set_semantic_state(blend_toward(b.semantic_state(), a.semantic_state(), alpha))?;

                let va = self.validator.validate_and_apply(a, after_a)?;
                let vb = self.validator.validate_and_apply(b, after_b)?;

                let (h_a, h_b) = (va.entropy.pre, vb.entropy.pre);
                let pre = h_a + h_b;
                let post = va.entropy.post + vb.entropy.post;
                let delta = va.entropy.delta + vb.entropy.delta;
                debug_assert!(delta >= 0.0, "validated collapse lowered entropy by {delta}");
                let draft = ScarDraft {
                    id: ScarId::new(),
                    geoid_refs: vec![a.id, b.id],
                    reason: format!("collapse:{}", gradient.gradient_type),
                    pre_entropy: pre,
                    post_entropy: post,
                    delta_entropy: delta,
                    cls_angle: cls_angle(a.semantic_state(), b.semantic_state(), h_a, h_b),
                    semantic_polarity: semantic_polarity(
                        a.semantic_state(),
                        b.semantic_state(),
                        gradient.components.symbolic_opposition,
                    ),
                    mutation_frequency: (a.mutation_frequency(cycle, window)
                        + b.mutation_frequency(cycle, window))
                        / 2.0,
                    weight: 1.0,
                    tension_score: gradient.tension_score,
                    created_at: now_iso8601(),
                };

                let inserted = self.vaults.insert(draft.clone())?;

                *a = va.geoid;
                a.record_mutation(record(cycle, va.entropy), window);
                *b = vb.geoid;
                b.record_mutation(record(cycle, vb.entropy), window);

                tracing::debug!(
                    scar = %inserted.scar_id,
                    vault = %inserted.vault,
                    delta = draft.delta_entropy,
                    "collapse resolved"
                );
                Ok(draft.into_scar(inserted.vault, inserted.quarantined))
            })
    }

    pub fn vault_status(&self, vault: VaultId) -> VaultStatus {
        self.vaults.status(vault)
    }

    pub fn rebalance(&self) -> Result<RebalanceReport> {
        self.vaults.rebalance()
    }

    pub fn overflow_len(&self) -> usize {
        self.vaults.overflow_len()
    }

    pub fn set_decay_environment(&self, env: DecayEnvironment) {
        self.validator
            .set_environment(&self.geoids, env, now_unix_f64());
    }

    pub fn decay_environment(&self) -> DecayEnvironment {
        self.validator.environment()
    }

    /// Semantic energy of a geoid right now.
    pub fn energy(&self, id: GeoidId) -> Result<f64> {
        let geoid = self.geoids.snapshot(id)?;
        Ok(self.validator.energy_at(&geoid, now_unix_f64()))
    }

    /// Pairs waiting for the next cycle.
    pub fn buffered_pairs(&self) -> Vec<(GeoidId, GeoidId)> {
        self.buffered.lock().clone()
    }

    /// Queue pairs saved by a previous process for the next cycle.
    pub fn restore_buffered(&self, pairs: Vec<(GeoidId, GeoidId)>) {
        let mut buffered = self.buffered.lock();
        for (a, b) in pairs {
            let key = pair_key(a, b);
            if !buffered.contains(&key) {
                buffered.push(key);
            }
        }
    }

    /// One pipeline tick over `ids`: re-submit last cycle's buffered pairs,
    /// detect, arbitrate, then collapse, surge or re-buffer each gradient.
    pub fn run_cycle(
        &self,
        ids: &[GeoidId],
        threshold: f64,
        stability: &StabilityMetrics,
    ) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let pending = std::mem::take(&mut *self.buffered.lock());
        let mut resubmit = Vec::with_capacity(pending.len());
        for (a, b) in pending {
            match (self.geoids.snapshot(a), self.geoids.snapshot(b)) {
                (Ok(ga), Ok(gb)) => resubmit.push((ga, gb)),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "dropping buffered pair");
                    report.errors += 1;
                }
            }
        }
        report.resubmitted = resubmit.len();

        let mut seen = HashSet::new();
        let mut gradients = Vec::new();
        for g in self.detector.detect_pairs(&resubmit, threshold) {
            if seen.insert(g.pair_key()) {
                gradients.push(g);
            }
        }

        let mut snapshots = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.geoids.snapshot(id) {
                Ok(g) => snapshots.push(g),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping geoid");
                    report.errors += 1;
                }
            }
        }
        for g in self.detector.detect(&snapshots, threshold) {
            if seen.insert(g.pair_key()) {
                gradients.push(g);
            }
        }
        report.gradients = gradients.len();

        let mut requeue = Vec::new();
        for gradient in &gradients {
            let arbitration = match self.arbitrate(gradient, stability) {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping gradient");
                    report.errors += 1;
                    continue;
                }
            };
            let Some(state) = GradientState::Pending.decide(arbitration.decision) else {
                continue;
            };
            match arbitration.decision {
                Decision::Collapse => match self.resolve_collapse(gradient) {
                    Ok(scar) => report.scars.push(scar),
                    Err(e) => {
                        tracing::warn!(
                            a = %gradient.geoid_a,
                            b = %gradient.geoid_b,
                            error = %e,
                            "collapse failed"
                        );
                        report.errors += 1;
                    }
                },
                Decision::Surge => report.surged.push(gradient.pair_key()),
                Decision::Buffer => {
                    if state.requeue().is_some() {
                        requeue.push(gradient.pair_key());
                    }
                }
            }
        }

        report.buffered = requeue.clone();
        self.restore_buffered(requeue);

        tracing::info!(
            cycle,
            gradients = report.gradients,
            scars = report.scars.len(),
            surged = report.surged.len(),
            buffered = report.buffered.len(),
            errors = report.errors,
            "cycle complete"
        );
        report
    }
}

fn record(cycle: u64, entropy: EntropyDelta) -> EntropyRecord {
    EntropyRecord {
        cycle,
        pre: entropy.pre,
        post: entropy.post,
        delta: entropy.delta,
    }
}
