//! Semantic unit store: the single owner of every active geoid.
//!
//! Geoids live in an arena of slots, each behind its own mutex. Readers get
//! clones; writers lock a slot by index for the duration of one mutation,
//! which serializes concurrent collapses touching the same geoid.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::geoid::{Geoid, GeoidId, GeoidInput};

type Slot = Arc<Mutex<Geoid>>;

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    index: HashMap<GeoidId, usize>,
}

#[derive(Default)]
pub struct GeoidStore {
    arena: RwLock<Arena>,
}

impl GeoidStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, normalize and register an ingested geoid.
    pub fn ingest(&self, input: GeoidInput) -> Result<GeoidId> {
        self.insert(input.into_geoid()?)
    }

    /// Register an already-built geoid (e.g. reloaded from persistence).
    pub fn insert(&self, geoid: Geoid) -> Result<GeoidId> {
        if !geoid.is_normalized() {
            return Err(EngineError::MalformedGeoidInput(format!(
                "geoid {} is not a normalized distribution",
                geoid.id
            )));
        }
        let mut arena = self.arena.write();
        let id = geoid.id;
        if arena.index.contains_key(&id) {
            return Err(EngineError::MalformedGeoidInput(format!(
                "duplicate geoid id {id}"
            )));
        }
        let idx = arena.slots.len();
        arena.slots.push(Arc::new(Mutex::new(geoid)));
        arena.index.insert(id, idx);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.arena.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<GeoidId> {
        let arena = self.arena.read();
        arena.slots.iter().map(|s| s.lock().id).collect()
    }

    fn slot(&self, id: GeoidId) -> Result<(usize, Slot)> {
        let arena = self.arena.read();
        let idx = *arena.index.get(&id).ok_or(EngineError::UnknownGeoid(id))?;
        Ok((idx, Arc::clone(&arena.slots[idx])))
    }

    /// Immutable copy of one geoid.
    pub fn snapshot(&self, id: GeoidId) -> Result<Geoid> {
        let (_, slot) = self.slot(id)?;
        let geoid = slot.lock().clone();
        Ok(geoid)
    }

    /// Copies of the requested geoids; unknown ids are skipped.
    pub fn snapshots(&self, ids: &[GeoidId]) -> Vec<Geoid> {
        ids.iter().filter_map(|id| self.snapshot(*id).ok()).collect()
    }

    pub fn all_snapshots(&self) -> Vec<Geoid> {
        let slots: Vec<Slot> = self.arena.read().slots.clone();
        slots.iter().map(|s| s.lock().clone()).collect()
    }

    /// Run `f` with exclusive access to two distinct geoids. Slots are locked
    /// in ascending arena index so opposite-order callers cannot deadlock.
    pub fn with_pair_mut<R>(
        &self,
        a: GeoidId,
        b: GeoidId,
        f: impl FnOnce(&mut Geoid, &mut Geoid) -> Result<R>,
    ) -> Result<R> {
        if a == b {
            return Err(EngineError::MalformedGeoidInput(format!(
                "pair refers to geoid {a} twice"
            )));
        }
        let (ia, sa) = self.slot(a)?;
        let (ib, sb) = self.slot(b)?;
        if ia < ib {
            let mut ga = sa.lock();
            let mut gb = sb.lock();
            f(&mut ga, &mut gb)
        } else {
            let mut gb = sb.lock();
            let mut ga = sa.lock();
            f(&mut ga, &mut gb)
        }
    }

    /// Visit every geoid mutably, one slot at a time.
    pub(crate) fn for_each_mut(&self, mut f: impl FnMut(&mut Geoid)) {
        let slots: Vec<Slot> = self.arena.read().slots.clone();
        for slot in slots {
            f(&mut slot.lock());
        }
    }
}
