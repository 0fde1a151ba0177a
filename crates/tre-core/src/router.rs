//! Vault routing and the two-vault coordinator.
//!
//! Routing is a pure function of the draft and the two running cls-angle
//! averages. The coordinator owns both vaults: normal inserts take the read
//! side of its gate plus one vault mutex, so A and B accept writes in
//! parallel. Fracture and rebalance take the write side, then A, then B.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::{NullBackend, VaultBackend};
use crate::config::VaultConfig;
use crate::constants::{ROUTE_MUTATION_FREQUENCY, ROUTE_POLARITY};
use crate::error::{EngineError, Result};
use crate::scar::{Scar, ScarDraft, ScarId, VaultId};
use crate::vault::{Vault, VaultStatus};

const RESTORE_PAGE: usize = 1000;

/// Which routing rule placed the scar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStage {
    MutationFrequency,
    Polarity,
    ClsAngle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAssignment {
    pub vault: VaultId,
    pub stage: RouteStage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertResult {
    pub scar_id: ScarId,
    pub vault: VaultId,
    pub stage: RouteStage,
    /// The balance guard overrode the routed vault.
    pub spilled: bool,
    pub quarantined: bool,
    pub evicted: usize,
    pub stress_index: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub moved_count: usize,
    pub count_a: usize,
    pub count_b: usize,
}

/// Distance between two angles on the circle, in degrees.
fn angular_distance(x: f64, y: f64) -> f64 {
    let d = (x - y).abs() % 360.0;
    d.min(360.0 - d)
}

/// Deterministic routing, first match wins.
pub fn route(draft: &ScarDraft, avg_a: Option<f64>, avg_b: Option<f64>) -> VaultAssignment {
    if draft.mutation_frequency > ROUTE_MUTATION_FREQUENCY {
        return VaultAssignment {
            vault: VaultId::A,
            stage: RouteStage::MutationFrequency,
        };
    }
    if draft.semantic_polarity.abs() >= ROUTE_POLARITY {
        let vault = if draft.semantic_polarity > 0.0 {
            VaultId::A
        } else {
            VaultId::B
        };
        return VaultAssignment {
            vault,
            stage: RouteStage::Polarity,
        };
    }
    let vault = match (avg_a, avg_b) {
        (None, _) => VaultId::A,
        (Some(_), None) => VaultId::B,
        (Some(a), Some(b)) => {
            if angular_distance(draft.cls_angle, b) < angular_distance(draft.cls_angle, a) {
                VaultId::B
            } else {
                VaultId::A
            }
        }
    };
    VaultAssignment {
        vault,
        stage: RouteStage::ClsAngle,
    }
}

fn skew_delta(vault: VaultId) -> i64 {
    match vault {
        VaultId::A => 1,
        VaultId::B => -1,
    }
}

/// Keep `routed` unless that pushes `|skew|` past `bound`.
fn balance_target(skew: i64, routed: VaultId, bound: i64) -> VaultId {
    let kept = skew + skew_delta(routed);
    let spilled = skew - skew_delta(routed);
    if kept.abs() <= bound || spilled.abs() >= kept.abs() {
        routed
    } else {
        routed.other()
    }
}

/// Counting semaphore bounding concurrent writers.
struct Admission {
    limit: usize,
    in_flight: Mutex<usize>,
    freed: Condvar,
}

struct Permit<'a> {
    admission: &'a Admission,
}

impl Admission {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut n = self.in_flight.lock();
        while *n >= self.limit {
            self.freed.wait(&mut n);
        }
        *n += 1;
        Permit { admission: self }
    }

    fn try_acquire(&self) -> std::result::Result<Permit<'_>, usize> {
        let mut n = self.in_flight.lock();
        if *n >= self.limit {
            return Err(*n);
        }
        *n += 1;
        Ok(Permit { admission: self })
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut n = self.admission.in_flight.lock();
        *n -= 1;
        self.admission.freed.notify_one();
    }
}

pub struct VaultCoordinator {
    config: VaultConfig,
    gate: RwLock<()>,
    vaults: [Mutex<Vault>; 2],
    /// `count(A) - count(B)` including in-flight reservations.
    skew: AtomicI64,
    overflow: Mutex<Vec<Scar>>,
    admission: Admission,
    backend: Arc<dyn VaultBackend>,
}

impl VaultCoordinator {
    pub fn new(config: VaultConfig, backend: Arc<dyn VaultBackend>) -> Self {
        Self {
            gate: RwLock::new(()),
            vaults: [
                Mutex::new(Vault::new(VaultId::A, config.capacity)),
                Mutex::new(Vault::new(VaultId::B, config.capacity)),
            ],
            skew: AtomicI64::new(0),
            overflow: Mutex::new(Vec::new()),
            admission: Admission::new(config.max_concurrent_writers),
            backend,
            config,
        }
    }

    pub fn in_memory(config: VaultConfig) -> Self {
        Self::new(config, Arc::new(NullBackend))
    }

    /// Rebuild both vaults and the overflow log from `backend`, preserving
    /// insertion order.
    pub fn restore(config: VaultConfig, backend: Arc<dyn VaultBackend>) -> Result<Self> {
        let coordinator = Self::new(config, backend);
        for id in [VaultId::A, VaultId::B] {
            let mut vault = coordinator.vaults[id.index()].lock();
            let mut offset = 0;
            loop {
                let page = coordinator.backend.get_range(id, offset, RESTORE_PAGE)?;
                let fetched = page.len();
                for scar in page {
                    vault.push(scar);
                }
                offset += fetched;
                if fetched < RESTORE_PAGE {
                    break;
                }
            }
            if vault.len() > vault.capacity() {
                tracing::warn!(
                    vault = %id,
                    count = vault.len(),
                    capacity = vault.capacity(),
                    "restored vault exceeds capacity"
                );
            }
        }
        {
            let mut overflow = coordinator.overflow.lock();
            let mut offset = 0;
            loop {
                let page = coordinator.backend.get_overflow_range(offset, RESTORE_PAGE)?;
                let fetched = page.len();
                overflow.extend(page);
                offset += fetched;
                if fetched < RESTORE_PAGE {
                    break;
                }
            }
        }
        let (a, b) = (coordinator.count(VaultId::A), coordinator.count(VaultId::B));
        coordinator.skew.store(a as i64 - b as i64, Ordering::SeqCst);
        tracing::info!(a, b, overflow = coordinator.overflow_len(), "vaults restored");
        Ok(coordinator)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn count(&self, vault: VaultId) -> usize {
        self.vaults[vault.index()].lock().len()
    }

    pub fn status(&self, vault: VaultId) -> VaultStatus {
        self.vaults[vault.index()].lock().status()
    }

    /// Contents of `vault` in insertion order.
    pub fn scars(&self, vault: VaultId) -> Vec<Scar> {
        self.vaults[vault.index()].lock().scars().to_vec()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.lock().len()
    }

    pub fn overflow(&self) -> Vec<Scar> {
        self.overflow.lock().clone()
    }

    /// Route `draft` against the current vault averages.
    pub fn route(&self, draft: &ScarDraft) -> VaultAssignment {
        let avg_a = self.vaults[0].lock().average_cls_angle();
        let avg_b = self.vaults[1].lock().average_cls_angle();
        route(draft, avg_a, avg_b)
    }

    /// Insert, blocking while the writer ceiling is reached.
    pub fn insert(&self, draft: ScarDraft) -> Result<InsertResult> {
        let _permit = self.admission.acquire();
        self.admit(draft)
    }

    /// Insert, failing with [`EngineError::Backpressure`] at the writer ceiling.
    pub fn try_insert(&self, draft: ScarDraft) -> Result<InsertResult> {
        let _permit = self
            .admission
            .try_acquire()
            .map_err(EngineError::Backpressure)?;
        self.admit(draft)
    }

    fn admit(&self, draft: ScarDraft) -> Result<InsertResult> {
        {
            let _gate = self.gate.read();
            let assignment = self.route(&draft);
            let (target, spilled) = self.reserve(assignment.vault);
            let mut vault = self.vaults[target.index()].lock();
            if vault.prospective_stress() <= self.config.fracture_threshold {
                let scar = draft.into_scar(target, false);
                if let Err(e) = self.backend.put(&scar, target) {
                    self.release(target);
                    return Err(e);
                }
                let scar_id = scar.id;
                vault.push(scar);
                return Ok(InsertResult {
                    scar_id,
                    vault: target,
                    stage: assignment.stage,
                    spilled,
                    quarantined: false,
                    evicted: 0,
                    stress_index: vault.stress_index(),
                });
            }
            drop(vault);
            self.release(target);
        }
        self.fracture_insert(draft)
    }

    fn reserve(&self, routed: VaultId) -> (VaultId, bool) {
        let Some(bound) = self.config.balance_bound else {
            self.skew.fetch_add(skew_delta(routed), Ordering::AcqRel);
            return (routed, false);
        };
        let bound = bound as i64;
        let mut current = self.skew.load(Ordering::Acquire);
        loop {
            let target = balance_target(current, routed, bound);
            match self.skew.compare_exchange_weak(
                current,
                current + skew_delta(target),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (target, target != routed),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, vault: VaultId) {
        self.skew.fetch_sub(skew_delta(vault), Ordering::AcqRel);
    }

    /// Exclusive path: re-route, evict the highest-priority scars of a
    /// stressed target to overflow and insert the newcomer quarantined.
    fn fracture_insert(&self, draft: ScarDraft) -> Result<InsertResult> {
        let _gate = self.gate.write();
        let mut a = self.vaults[0].lock();
        let mut b = self.vaults[1].lock();

        let assignment = route(&draft, a.average_cls_angle(), b.average_cls_angle());
        let target = match self.config.balance_bound {
            Some(bound) => balance_target(
                a.len() as i64 - b.len() as i64,
                assignment.vault,
                bound as i64,
            ),
            None => assignment.vault,
        };
        let vault: &mut Vault = match target {
            VaultId::A => &mut *a,
            VaultId::B => &mut *b,
        };

        // Another fracture may have already made room.
        let quarantined = vault.prospective_stress() > self.config.fracture_threshold;
        let mut evicted = 0;
        if quarantined {
            let n = self.config.eviction_count(vault.len());
            let victims = vault.peek_top(n);
            if vault.len() - victims.len() >= vault.capacity() {
                return Err(EngineError::RoutingFallbackExhausted(format!(
                    "vault {target} holds {} of {} after evicting {}",
                    vault.len(),
                    vault.capacity(),
                    victims.len()
                )));
            }
            if !victims.is_empty() {
                self.backend.evict_to_overflow(&victims, target)?;
                let removed = vault.evict_top(n);
                evicted = removed.len();
                self.overflow.lock().extend(removed);
            }
            tracing::info!(
                vault = %target,
                evicted,
                remaining = vault.len(),
                "vault fractured"
            );
        }

        let scar = draft.into_scar(target, quarantined);
        let scar_id = scar.id;
        let put = self.backend.put(&scar, target);
        if put.is_ok() {
            vault.push(scar);
        }
        let stress_index = vault.stress_index();
        self.skew
            .store(a.len() as i64 - b.len() as i64, Ordering::SeqCst);
        put?;

        Ok(InsertResult {
            scar_id,
            vault: target,
            stage: assignment.stage,
            spilled: target != assignment.vault,
            quarantined,
            evicted,
            stress_index,
        })
    }

    /// Move lowest-priority scars from the larger vault to the smaller one
    /// until the imbalance is within bound.
    pub fn rebalance(&self) -> Result<RebalanceReport> {
        let _gate = self.gate.write();
        let mut a = self.vaults[0].lock();
        let mut b = self.vaults[1].lock();
        let bound = self.config.rebalance_bound();

        let mut moved_count = 0;
        let mut failure = None;
        while a.len().abs_diff(b.len()) > bound {
            let (from, to) = if a.len() > b.len() {
                (&mut *a, &mut *b)
            } else {
                (&mut *b, &mut *a)
            };
            let Some(id) = from.lowest().map(|s| s.id) else {
                break;
            };
            if let Err(e) = self.backend.relocate(id, to.id()) {
                failure = Some(e);
                break;
            }
            if let Some(scar) = from.take_lowest() {
                to.push(scar);
            }
            moved_count += 1;
        }

        self.skew
            .store(a.len() as i64 - b.len() as i64, Ordering::SeqCst);
        if let Some(e) = failure {
            return Err(e);
        }
        if moved_count > 0 {
            tracing::info!(moved_count, a = a.len(), b = b.len(), "vaults rebalanced");
        }
        Ok(RebalanceReport {
            moved_count,
            count_a: a.len(),
            count_b: b.len(),
        })
    }
}
