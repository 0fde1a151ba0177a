//! A single bounded, insertion-ordered scar vault.

use serde::{Deserialize, Serialize};

use crate::scar::{Scar, VaultId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub vault: VaultId,
    pub count: usize,
    pub capacity: usize,
    pub stress_index: f64,
    pub average_cls_angle: Option<f64>,
    pub quarantined: usize,
}

#[derive(Debug)]
pub struct Vault {
    id: VaultId,
    capacity: usize,
    scars: Vec<Scar>,
    cls_sum: f64,
}

impl Vault {
    pub fn new(id: VaultId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            scars: Vec::new(),
            cls_sum: 0.0,
        }
    }

    pub fn id(&self) -> VaultId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.scars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scars.is_empty()
    }

    pub fn stress_index(&self) -> f64 {
        self.scars.len() as f64 / self.capacity as f64
    }

    /// Stress the vault would be under after accepting one more scar.
    pub fn prospective_stress(&self) -> f64 {
        (self.scars.len() + 1) as f64 / self.capacity as f64
    }

    pub fn average_cls_angle(&self) -> Option<f64> {
        (!self.scars.is_empty()).then(|| self.cls_sum / self.scars.len() as f64)
    }

    pub fn scars(&self) -> &[Scar] {
        &self.scars
    }

    pub fn push(&mut self, scar: Scar) {
        self.cls_sum += scar.cls_angle;
        self.scars.push(scar);
    }

    /// Indices of the `n` highest-priority scars, ascending. Ties prefer
    /// the older scar.
    fn top_indices(&self, n: usize) -> Vec<usize> {
        let n = n.min(self.scars.len());
        let mut order: Vec<usize> = (0..self.scars.len()).collect();
        order.sort_by(|&i, &j| {
            self.scars[j]
                .priority()
                .total_cmp(&self.scars[i].priority())
                .then(i.cmp(&j))
        });
        order.truncate(n);
        order.sort_unstable();
        order
    }

    /// Clones of the scars [`Vault::evict_top`] would remove.
    pub fn peek_top(&self, n: usize) -> Vec<Scar> {
        self.top_indices(n)
            .into_iter()
            .map(|i| self.scars[i].clone())
            .collect()
    }

    /// Remove the `n` highest-priority scars. Remaining scars keep their
    /// insertion order.
    pub fn evict_top(&mut self, n: usize) -> Vec<Scar> {
        let chosen = self.top_indices(n);
        if chosen.is_empty() {
            return Vec::new();
        }
        let mut evicted = Vec::with_capacity(chosen.len());
        // back to front so earlier indices stay valid
        for &idx in chosen.iter().rev() {
            evicted.push(self.scars.remove(idx));
        }
        evicted.reverse();
        self.recompute_sum();
        evicted
    }

    /// The lowest-priority scar. Ties take the newest.
    pub fn lowest(&self) -> Option<&Scar> {
        self.lowest_index().map(|i| &self.scars[i])
    }

    fn lowest_index(&self) -> Option<usize> {
        self.scars
            .iter()
            .enumerate()
            .min_by(|(i, a), (j, b)| a.priority().total_cmp(&b.priority()).then(j.cmp(i)))
            .map(|(i, _)| i)
    }

    pub fn take_lowest(&mut self) -> Option<Scar> {
        let idx = self.lowest_index()?;
        let scar = self.scars.remove(idx);
        self.recompute_sum();
        Some(scar)
    }

    pub fn status(&self) -> VaultStatus {
        VaultStatus {
            vault: self.id,
            count: self.len(),
            capacity: self.capacity,
            stress_index: self.stress_index(),
            average_cls_angle: self.average_cls_angle(),
            quarantined: self.scars.iter().filter(|s| s.quarantined).count(),
        }
    }

    fn recompute_sum(&mut self) {
        self.cls_sum = self.scars.iter().map(|s| s.cls_angle).sum();
    }
}
