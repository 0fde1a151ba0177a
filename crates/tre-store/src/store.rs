use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use tre_core::{Geoid, GeoidId, Scar, ScarId, VaultBackend, VaultId};

use crate::error::{Result, StoreError};
use crate::schema;

const CYCLE_KEY: &str = "cycle";
const BUFFERED_KEY: &str = "buffered_pairs";

/// SQLite store for geoids, both vaults and the overflow log.
pub struct Store {
    conn: Mutex<Connection>,
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn parse_vault(s: &str) -> rusqlite::Result<VaultId> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(StoreError::InvalidData(e)),
        )
    })
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn load_cycle(&self) -> Result<u64> {
        match self.get_metadata(CYCLE_KEY)? {
            Some(v) => v
                .parse()
                .map_err(|_| StoreError::InvalidData(format!("bad cycle counter {v:?}"))),
            None => Ok(0),
        }
    }

    pub fn save_cycle(&self, cycle: u64) -> Result<()> {
        self.set_metadata(CYCLE_KEY, &cycle.to_string())
    }

    pub fn load_buffered(&self) -> Result<Vec<(GeoidId, GeoidId)>> {
        match self.get_metadata(BUFFERED_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_buffered(&self, pairs: &[(GeoidId, GeoidId)]) -> Result<()> {
        self.set_metadata(BUFFERED_KEY, &serde_json::to_string(pairs)?)
    }

    // --- Geoids ---

    /// Insert or replace geoids. New ids are appended after existing ones;
    /// replaced ids keep their position.
    pub fn save_geoids(&self, geoids: &[Geoid]) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO geoids (id, seq, created_at, data)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM geoids), ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            )?;
            for geoid in geoids {
                upsert.execute(params![
                    geoid.id.to_string(),
                    geoid.metadata.created_at,
                    serde_json::to_string(geoid)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All geoids in first-saved order.
    pub fn load_geoids(&self) -> Result<Vec<Geoid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM geoids ORDER BY seq")?;
        let rows: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    // --- Scars ---

    pub fn put_scar(&self, scar: &Scar, vault: VaultId) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO scars (id, vault, seq, origin_vault, quarantined, priority, created_at, data)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM scars), ?3, ?4, ?5, ?6, ?7)",
            params![
                scar.id.to_string(),
                vault.as_str(),
                scar.vault_id.as_str(),
                scar.quarantined as i32,
                scar.priority(),
                scar.created_at,
                serde_json::to_string(scar)?,
            ],
        )?;
        Ok(())
    }

    /// Move `scars` from their vault into the overflow log in one transaction.
    pub fn evict_scars(&self, scars: &[Scar], from: VaultId) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM scars WHERE id = ?1 AND vault = ?2")?;
            let mut append =
                tx.prepare("INSERT INTO overflow (id, from_vault, data) VALUES (?1, ?2, ?3)")?;
            for scar in scars {
                let id = scar.id.to_string();
                if delete.execute(params![id, from.as_str()])? == 0 {
                    return Err(StoreError::InvalidData(format!(
                        "scar {id} not in vault {from}"
                    )));
                }
                append.execute(params![id, from.as_str(), serde_json::to_string(scar)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Move one scar to the end of `to`. The stored record is unchanged.
    pub fn relocate_scar(&self, id: ScarId, to: VaultId) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE scars SET vault = ?1, seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM scars)
             WHERE id = ?2",
            params![to.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidData(format!("unknown scar {id}")));
        }
        Ok(())
    }

    pub fn scars_in(&self, vault: VaultId, offset: usize, limit: usize) -> Result<Vec<Scar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM scars WHERE vault = ?1 ORDER BY seq LIMIT ?2 OFFSET ?3",
        )?;
        let rows: Vec<String> = stmt
            .query_map(
                params![vault.as_str(), sql_limit(limit), sql_limit(offset)],
                |row| row.get(0),
            )?
            .collect::<std::result::Result<_, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    pub fn scar_count(&self, vault: VaultId) -> Result<usize> {
        let n: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM scars WHERE vault = ?1",
            [vault.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Current vault of a stored scar, if any.
    pub fn scar_vault(&self, id: ScarId) -> Result<Option<VaultId>> {
        let conn = self.conn.lock();
        let vault = conn
            .query_row(
                "SELECT vault FROM scars WHERE id = ?1",
                [id.to_string()],
                |row| {
                    let v: String = row.get(0)?;
                    parse_vault(&v)
                },
            )
            .optional()?;
        Ok(vault)
    }

    pub fn overflow_len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM overflow", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn overflow_range(&self, offset: usize, limit: usize) -> Result<Vec<Scar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM overflow ORDER BY seq LIMIT ?1 OFFSET ?2")?;
        let rows: Vec<String> = stmt
            .query_map(params![sql_limit(limit), sql_limit(offset)], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

impl VaultBackend for Store {
    fn put(&self, scar: &Scar, vault: VaultId) -> tre_core::Result<()> {
        Ok(self.put_scar(scar, vault)?)
    }

    fn evict_to_overflow(&self, scars: &[Scar], from: VaultId) -> tre_core::Result<()> {
        Ok(self.evict_scars(scars, from)?)
    }

    fn relocate(&self, scar: ScarId, to: VaultId) -> tre_core::Result<()> {
        Ok(self.relocate_scar(scar, to)?)
    }

    fn get_range(&self, vault: VaultId, offset: usize, limit: usize) -> tre_core::Result<Vec<Scar>> {
        Ok(self.scars_in(vault, offset, limit)?)
    }

    fn count(&self, vault: VaultId) -> tre_core::Result<usize> {
        Ok(self.scar_count(vault)?)
    }

    fn overflow_count(&self) -> tre_core::Result<usize> {
        Ok(self.overflow_len()?)
    }

    fn get_overflow_range(&self, offset: usize, limit: usize) -> tre_core::Result<Vec<Scar>> {
        Ok(self.overflow_range(offset, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use tre_core::{
        EngineConfig, GeoidInput, ScarDraft, TensionEngine, VaultConfig, VaultCoordinator,
    };

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn draft(rng: &mut SmallRng, polarity: f64) -> ScarDraft {
        ScarDraft {
            id: ScarId::new(),
            geoid_refs: vec![GeoidId::new(), GeoidId::new()],
            reason: "collapse:layer".into(),
            pre_entropy: 0.2,
            post_entropy: 0.4,
            delta_entropy: 0.2,
            cls_angle: rng.random_range(0.0..360.0),
            semantic_polarity: polarity,
            mutation_frequency: 0.0,
            weight: 1.0,
            tension_score: rng.random_range(0.0..1.0),
            created_at: "2026-10-14T00:00:00Z".into(),
        }
    }

    fn geoid(weights: &[(&str, f64)]) -> Geoid {
        GeoidInput {
            semantic_state: weights.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
            provenance: Some("test".into()),
            ..GeoidInput::default()
        }
        .into_geoid()
        .unwrap()
    }

    #[test]
    fn test_metadata_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_metadata("missing").unwrap(), None);
        store.set_metadata("k", "v").unwrap();
        assert_eq!(store.get_metadata("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.load_cycle().unwrap(), 0);
        store.save_cycle(7).unwrap();
        assert_eq!(store.load_cycle().unwrap(), 7);
    }

    #[test]
    fn test_geoids_keep_order_on_update() {
        let store = Store::open_in_memory().unwrap();
        let first = geoid(&[("a", 1.0)]);
        let second = geoid(&[("b", 1.0)]);
        store.save_geoids(&[first.clone(), second.clone()]).unwrap();

        let mut updated = first.clone();
        updated.metadata.provenance = Some("edited".into());
        store.save_geoids(&[updated]).unwrap();

        let loaded = store.load_geoids().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[0].metadata.provenance.as_deref(), Some("edited"));
        assert_eq!(loaded[1].id, second.id);
        assert!(loaded[1].is_normalized());
    }

    #[test]
    fn test_buffered_pairs_persist() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_buffered().unwrap().is_empty());
        let pairs = vec![(GeoidId::new(), GeoidId::new())];
        store.save_buffered(&pairs).unwrap();
        assert_eq!(store.load_buffered().unwrap(), pairs);
    }

    #[test]
    fn test_coordinator_writes_through() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let coordinator = VaultCoordinator::new(
            VaultConfig {
                capacity: 10,
                balance_bound: None,
                ..VaultConfig::default()
            },
            store.clone(),
        );
        let mut rng = rng();
        for _ in 0..9 {
            coordinator.insert(draft(&mut rng, 0.9)).unwrap();
        }
        assert_eq!(store.scar_count(VaultId::A).unwrap(), 7);
        assert_eq!(store.overflow_len().unwrap(), 2);

        let report = coordinator.rebalance().unwrap();
        assert_eq!(report.moved_count, 3);
        assert_eq!(store.scar_count(VaultId::A).unwrap(), 4);
        assert_eq!(store.scar_count(VaultId::B).unwrap(), 3);
    }

    #[test]
    fn test_restore_preserves_insertion_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = VaultConfig {
            balance_bound: None,
            ..VaultConfig::default()
        };
        let coordinator = VaultCoordinator::new(config.clone(), store.clone());
        let mut rng = rng();
        for i in 0..6 {
            let polarity = if i % 3 == 0 { -0.9 } else { 0.9 };
            coordinator.insert(draft(&mut rng, polarity)).unwrap();
        }
        let restored = VaultCoordinator::restore(config, store.clone()).unwrap();
        for vault in [VaultId::A, VaultId::B] {
            let ids = |c: &VaultCoordinator| c.scars(vault).iter().map(|s| s.id).collect::<Vec<_>>();
            assert_eq!(ids(&restored), ids(&coordinator));
        }
        assert_eq!(restored.count(VaultId::A), 4);
        assert_eq!(restored.count(VaultId::B), 2);
        let before = coordinator.status(VaultId::A).average_cls_angle.unwrap();
        let after = restored.status(VaultId::A).average_cls_angle.unwrap();
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn test_relocated_scar_moves_to_end() {
        let store = Store::open_in_memory().unwrap();
        let mut rng = rng();
        let first = draft(&mut rng, 0.9).into_scar(VaultId::A, false);
        let second = draft(&mut rng, 0.9).into_scar(VaultId::B, false);
        store.put_scar(&first, VaultId::A).unwrap();
        store.put_scar(&second, VaultId::B).unwrap();

        store.relocate_scar(first.id, VaultId::B).unwrap();
        assert_eq!(store.scar_vault(first.id).unwrap(), Some(VaultId::B));
        let b = store.scars_in(VaultId::B, 0, 10).unwrap();
        assert_eq!(b.iter().map(|s| s.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        // origin is kept
        assert_eq!(b[1].vault_id, VaultId::A);
        assert!(store.relocate_scar(ScarId::new(), VaultId::A).is_err());
    }

    #[test]
    fn test_evicting_unknown_scar_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let mut rng = rng();
        let kept = draft(&mut rng, 0.9).into_scar(VaultId::A, false);
        let ghost = draft(&mut rng, 0.9).into_scar(VaultId::A, false);
        store.put_scar(&kept, VaultId::A).unwrap();

        assert!(store.evict_scars(&[kept.clone(), ghost], VaultId::A).is_err());
        assert_eq!(store.scar_count(VaultId::A).unwrap(), 1);
        assert_eq!(store.overflow_len().unwrap(), 0);
    }

    #[test]
    fn test_engine_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tre.db");
        let store = Arc::new(Store::open(&path).unwrap());
        let engine = TensionEngine::with_backend(EngineConfig::default(), store.clone()).unwrap();
        let id = engine
            .ingest(GeoidInput {
                semantic_state: [("x".to_string(), 1.0)].into(),
                ..GeoidInput::default()
            })
            .unwrap();
        store.save_geoids(&engine.geoids().all_snapshots()).unwrap();
        drop(engine);
        drop(store);

        let reopened = Store::open(&path).unwrap();
        let geoids = reopened.load_geoids().unwrap();
        assert_eq!(geoids.len(), 1);
        assert_eq!(geoids[0].id, id);
    }
}
