//! Persistence seam for the vault coordinator.
//!
//! The coordinator calls the backend while holding the relevant vault lock,
//! before changing its in-memory state, so a failed write leaves both sides
//! unchanged.

use crate::error::Result;
use crate::scar::{Scar, ScarId, VaultId};

pub trait VaultBackend: Send + Sync {
    /// Append `scar` to `vault`. Atomic per record.
    fn put(&self, scar: &Scar, vault: VaultId) -> Result<()>;

    /// Move `scars` out of `from` into the overflow log.
    fn evict_to_overflow(&self, scars: &[Scar], from: VaultId) -> Result<()>;

    /// Move one scar to the end of another vault.
    fn relocate(&self, scar: ScarId, to: VaultId) -> Result<()>;

    /// Scars of `vault` in insertion order.
    fn get_range(&self, vault: VaultId, offset: usize, limit: usize) -> Result<Vec<Scar>>;

    fn count(&self, vault: VaultId) -> Result<usize>;

    fn overflow_count(&self) -> Result<usize>;

    /// Overflow log in eviction order.
    fn get_overflow_range(&self, offset: usize, limit: usize) -> Result<Vec<Scar>>;
}

/// Backend for purely in-memory engines.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBackend;

impl VaultBackend for NullBackend {
    fn put(&self, _scar: &Scar, _vault: VaultId) -> Result<()> {
        Ok(())
    }

    fn evict_to_overflow(&self, _scars: &[Scar], _from: VaultId) -> Result<()> {
        Ok(())
    }

    fn relocate(&self, _scar: ScarId, _to: VaultId) -> Result<()> {
        Ok(())
    }

    fn get_range(&self, _vault: VaultId, _offset: usize, _limit: usize) -> Result<Vec<Scar>> {
        Ok(Vec::new())
    }

    fn count(&self, _vault: VaultId) -> Result<usize> {
        Ok(0)
    }

    fn overflow_count(&self) -> Result<usize> {
        Ok(0)
    }

    fn get_overflow_range(&self, _offset: usize, _limit: usize) -> Result<Vec<Scar>> {
        Ok(Vec::new())
    }
}
