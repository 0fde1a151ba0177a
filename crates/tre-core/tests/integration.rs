//! Integration tests exercising the full pipeline:
//! ingest → detect → arbitrate → collapse → route → vault.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tre_core::geoid::normalize;
use tre_core::{
    Decision, EngineConfig, GeoidInput, GradientType, ScarDraft, ScarId, StabilityMetrics,
    TensionEngine, ThermoConfig, ThermodynamicValidator, VaultConfig, VaultCoordinator, VaultId,
};

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(42)
}

fn input(weights: &[(&str, f64)], claim: Option<&str>) -> GeoidInput {
    GeoidInput {
        semantic_state: weights.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
        symbolic_state: claim
            .map(|c| [("claim".to_string(), json!(c))].into())
            .unwrap_or_default(),
        ..GeoidInput::default()
    }
}

fn high_stability() -> StabilityMetrics {
    StabilityMetrics {
        axis_convergence: 0.9,
        vault_resonance: 0.9,
        contradiction_lineage_ambiguity: 0.1,
    }
}

fn random_draft(rng: &mut SmallRng) -> ScarDraft {
    ScarDraft {
        id: ScarId::new(),
        geoid_refs: Vec::new(),
        reason: "collapse:embedding".into(),
        pre_entropy: 0.0,
        post_entropy: 0.0,
        delta_entropy: 0.0,
        cls_angle: rng.random_range(0.0..360.0),
        semantic_polarity: rng.random_range(-1.0..1.0),
        mutation_frequency: rng.random_range(0.0..1.0),
        weight: 1.0,
        tension_score: rng.random_range(0.0..1.0),
        created_at: String::new(),
    }
}

/// Test 1: a directly contradicting pair collapses into exactly one scar.
#[test]
fn contradiction_collapses_into_scar() {
    let engine = TensionEngine::new(EngineConfig::default()).unwrap();
    let a = engine.ingest(input(&[("a", 1.0)], Some("a"))).unwrap();
    let b = engine
        .ingest(input(&[("a", 0.0), ("not_a", 1.0)], Some("not a")))
        .unwrap();

    let snaps = engine.geoids().snapshots(&[a, b]);
    let gradients = engine.detect_tensions(&snaps, 0.5);
    assert_eq!(gradients.len(), 1);
    let gradient = &gradients[0];
    assert!(gradient.tension_score > 0.75);
    assert_eq!(gradient.gradient_type, GradientType::Embedding);

    let arbitration = engine.arbitrate(gradient, &high_stability()).unwrap();
    assert_eq!(arbitration.decision, Decision::Collapse);

    let report = engine.run_cycle(&[a, b], 0.5, &high_stability());
    assert_eq!(report.scars.len(), 1);
    let scar = &report.scars[0];
    assert!(scar.post_entropy - scar.pre_entropy >= 0.0);
    assert!((scar.delta_entropy - (scar.post_entropy - scar.pre_entropy)).abs() < 1e-9);

    let total = engine.vault_status(VaultId::A).count + engine.vault_status(VaultId::B).count;
    assert_eq!(total, 1);
    for id in [a, b] {
        assert!(engine.geoids().snapshot(id).unwrap().is_normalized());
    }
}

/// Test 2: the ninth insert into a ten-slot vault fractures it.
#[test]
fn fracture_on_ninth_insert() {
    let coordinator = VaultCoordinator::in_memory(VaultConfig {
        capacity: 10,
        balance_bound: None,
        ..VaultConfig::default()
    });
    let mut rng = rng();
    for _ in 0..8 {
        let mut d = random_draft(&mut rng);
        d.semantic_polarity = 0.9;
        let r = coordinator.insert(d).unwrap();
        assert_eq!(r.vault, VaultId::A);
        assert!(!r.quarantined);
    }
    assert!((coordinator.status(VaultId::A).stress_index - 0.8).abs() < 1e-12);

    let mut d = random_draft(&mut rng);
    d.semantic_polarity = 0.9;
    let r = coordinator.insert(d).unwrap();
    assert!(r.quarantined);
    assert_eq!(r.evicted, 2);
    assert_eq!(coordinator.overflow_len(), 2);
    assert_eq!(coordinator.count(VaultId::A), 7);
}

/// Test 3: concurrent writers keep the vaults balanced.
#[test]
fn concurrent_inserts_stay_balanced() {
    let coordinator = VaultCoordinator::in_memory(VaultConfig {
        capacity: 10_000,
        ..VaultConfig::default()
    });
    std::thread::scope(|s| {
        for worker in 0..16u64 {
            let coordinator = &coordinator;
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(worker);
                let n = if worker < 8 { 63 } else { 62 };
                for _ in 0..n {
                    coordinator.insert(random_draft(&mut rng)).unwrap();
                }
            });
        }
    });
    let a = coordinator.count(VaultId::A);
    let b = coordinator.count(VaultId::B);
    assert_eq!(a + b, 1000);
    assert!(a.abs_diff(b) <= 1, "a = {a}, b = {b}");
    assert_eq!(coordinator.overflow_len(), 0);
}

/// Test 4: a weak pulse surges whatever the stability signals say.
#[test]
fn weak_pulse_surges() {
    let engine = TensionEngine::new(EngineConfig::default()).unwrap();
    // orthogonal distributions, no symbolic content: tension 0.4, pulse 0.4
    let a = engine.ingest(input(&[("x", 1.0)], None)).unwrap();
    let b = engine.ingest(input(&[("y", 1.0)], None)).unwrap();
    let snaps = engine.geoids().snapshots(&[a, b]);
    let gradients = engine.detect_tensions(&snaps, 0.1);
    assert_eq!(gradients.len(), 1);

    for stability in [
        high_stability(),
        StabilityMetrics::default(),
        StabilityMetrics {
            axis_convergence: 1.0,
            vault_resonance: 1.0,
            contradiction_lineage_ambiguity: 0.0,
        },
    ] {
        let arbitration = engine.arbitrate(&gradients[0], &stability).unwrap();
        assert!(arbitration.assessment.pulse_strength < 0.5);
        assert_eq!(arbitration.decision, Decision::Surge);
    }

    let report = engine.run_cycle(&[a, b], 0.1, &high_stability());
    assert_eq!(report.surged.len(), 1);
    assert!(report.scars.is_empty());
    assert_eq!(engine.vault_status(VaultId::A).count, 0);
}

/// Test 5: rebalance restores the bound after content routing skews it.
#[test]
fn rebalance_after_skewed_routing() {
    let engine = TensionEngine::new(EngineConfig {
        vault: VaultConfig {
            balance_bound: None,
            ..VaultConfig::default()
        },
        ..EngineConfig::default()
    })
    .unwrap();
    let mut rng = rng();
    for _ in 0..20 {
        let mut d = random_draft(&mut rng);
        d.mutation_frequency = 0.9;
        engine.vaults().insert(d).unwrap();
    }
    assert_eq!(engine.vault_status(VaultId::A).count, 20);

    let report = engine.rebalance().unwrap();
    assert_eq!(report.moved_count, 10);
    assert_eq!(engine.vault_status(VaultId::A).count, 10);
    assert_eq!(engine.vault_status(VaultId::B).count, 10);
}

/// Test 6: many random geoids through several cycles keep every invariant.
#[test]
fn random_population_keeps_invariants() {
    let engine = TensionEngine::new(EngineConfig::default()).unwrap();
    let mut rng = rng();
    let features = ["a", "b", "c", "d", "e", "not_a", "not_b"];
    let claims = ["a", "not a", "b", "not b"];
    let mut ids = Vec::new();
    for _ in 0..24 {
        let mut weights: Vec<(&str, f64)> = Vec::new();
        for f in features {
            if rng.random_bool(0.5) {
                weights.push((f, rng.random_range(0.1..5.0)));
            }
        }
        let weights = if weights.is_empty() { vec![("a", 1.0)] } else { weights };
        let claim = claims[rng.random_range(0..claims.len())];
        ids.push(engine.ingest(input(&weights, Some(claim))).unwrap());
    }

    for _ in 0..5 {
        let report = engine.run_cycle(&ids, 0.3, &high_stability());
        for scar in &report.scars {
            assert!(scar.delta_entropy >= 0.0);
            assert!((0.0..360.0).contains(&scar.cls_angle));
            assert!((-1.0..=1.0).contains(&scar.semantic_polarity));
            assert!((0.0..=1.0).contains(&scar.mutation_frequency));
        }
    }
    for id in &ids {
        let geoid = engine.geoids().snapshot(*id).unwrap();
        assert!(geoid.is_normalized());
        for record in &geoid.metadata.entropy_history {
            assert!(record.delta >= 0.0);
        }
    }
}

fn weight_map() -> impl Strategy<Value = BTreeMap<String, f64>> {
    prop::collection::btree_map("[a-f]", 0.0f64..10.0, 1..6)
        .prop_filter("positive mass", |m| m.values().sum::<f64>() > 1e-6)
}

proptest! {
    #[test]
    fn normalized_weights_sum_to_one(state in weight_map()) {
        let normalized = normalize(state).unwrap();
        let sum: f64 = normalized.values().sum();
        prop_assert!((sum - 1.0).abs() <= 1e-6);
        prop_assert!(normalized.values().all(|w| *w >= 0.0));
    }

    #[test]
    fn validated_transformations_never_lower_entropy(
        before in weight_map(),
        after in weight_map(),
    ) {
        let validator = ThermodynamicValidator::new(ThermoConfig::default());
        let before = GeoidInput { semantic_state: before, ..GeoidInput::default() }
            .into_geoid()
            .unwrap();
        let after = GeoidInput { semantic_state: after, ..GeoidInput::default() }
            .into_geoid()
            .unwrap();
        match validator.validate_and_apply(&before, after) {
            Ok(v) => {
                prop_assert!(v.entropy.delta >= 0.0);
                prop_assert!(v.geoid.entropy() >= before.entropy() - 1e-12);
                prop_assert!(v.geoid.is_normalized());
            }
            Err(rejected) => prop_assert!(rejected.post < rejected.pre),
        }
    }
}
