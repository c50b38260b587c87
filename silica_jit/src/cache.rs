//! Cache of compiled units.
//!
//! Maps unit identity to its JIT state and answers the reverse question:
//! which unit owns a given instruction address? The reverse lookup is a
//! linear scan; the cache stays small and every buffer occupies a
//! disjoint mapping. Entries are shared, so a state stays alive while
//! anything still holds it; dropping the last handle unmaps its code.

use crate::JitState;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use silica_vcode::UnitId;
use std::sync::Arc;

/// Cache of compiled units, keyed by unit identity.
#[derive(Default)]
pub struct JitCache {
    entries: RwLock<FxHashMap<u64, Arc<JitState>>>,
}

impl JitCache {
    /// An empty cache.
    pub fn new() -> Self {
        JitCache {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Insert a compiled unit, replacing any previous state for it.
    pub fn insert(&self, state: Arc<JitState>) -> Option<Arc<JitState>> {
        self.entries
            .write()
            .insert(state.unit_id().as_u64(), state)
    }

    /// Look up a unit's state by identity.
    pub fn get(&self, unit: UnitId) -> Option<Arc<JitState>> {
        self.entries.read().get(&unit.as_u64()).cloned()
    }

    /// Find the state whose code region contains `addr`.
    pub fn find_by_addr(&self, addr: *const u8) -> Option<Arc<JitState>> {
        let entries = self.entries.read();
        entries
            .values()
            .find(|state| state.contains(addr))
            .cloned()
    }

    /// Remove a unit's state. The caller gets the last cache-held
    /// reference; its code is unmapped when the final handle drops.
    pub fn remove(&self, unit: UnitId) -> Option<Arc<JitState>> {
        self.entries.write().remove(&unit.as_u64())
    }

    /// Number of cached units.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Jit;
    use silica_vcode::{UnitBuilder, UnitKind, VType};

    fn compile_one(jit: &Jit, name: &str) -> (UnitId, *const u8) {
        let mut b = UnitBuilder::new(UnitKind::Function, name);
        let c = b.emit_const(VType::INT64, 7);
        b.emit_return(Some(c));
        let u = b.finish();
        let base = jit.compile(&u);
        (u.id(), base)
    }

    #[test]
    fn test_insert_get_remove() {
        let jit = Jit::new();
        let (id, base) = compile_one(&jit, "cached");

        let state = jit.cache().get(id).expect("unit should be cached");
        assert_eq!(state.code_base(), base);
        assert_eq!(jit.cache().len(), 1);

        jit.cache().remove(id);
        assert!(jit.cache().get(id).is_none());
        assert!(jit.cache().is_empty());
    }

    #[test]
    fn test_reverse_lookup_covers_whole_region() {
        let jit = Jit::new();
        let (id, base) = compile_one(&jit, "span");
        let len = jit.cache().get(id).unwrap().code_len();

        for k in [0, 1, len / 2, len - 1] {
            let addr = unsafe { base.add(k) };
            let found = jit.cache().find_by_addr(addr).expect("inside the region");
            assert_eq!(found.unit_id(), id);
        }
        assert!(jit
            .cache()
            .find_by_addr(unsafe { base.add(len) })
            .is_none());
    }

    #[test]
    fn test_reverse_lookup_distinguishes_units() {
        let jit = Jit::new();
        let (id_a, base_a) = compile_one(&jit, "first");
        let (id_b, base_b) = compile_one(&jit, "second");

        assert_eq!(jit.cache().find_by_addr(base_a).unwrap().unit_id(), id_a);
        assert_eq!(jit.cache().find_by_addr(base_b).unwrap().unit_id(), id_b);
    }
}
