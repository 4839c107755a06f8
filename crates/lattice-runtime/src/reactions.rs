//! reactions.rs — callbacks déclenchés par une transition de phase (C5, §4.5).
//!
//! `on_phase(name, phase, native)` enregistre un natif à invoquer chaque
//! fois que `name` transite vers `phase`. Plusieurs réactions peuvent
//! s'accumuler sur le même couple nom/phase ; elles se déclenchent dans
//! l'ordre d'enregistrement.

use parking_lot::RwLock;

use lattice_core::value::{NativeId, Phase, Value};

use crate::error::RResult;
use crate::registry::NativeRegistry;
use crate::runtime::Runtime;

#[derive(Default)]
pub struct ReactionTable {
    reactions: RwLock<Vec<(String, Phase, NativeId)>>,
}

impl ReactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre une réaction : quand `name` atteint `phase`, `native` est
    /// appelé avec la nouvelle valeur.
    pub fn on_phase(&self, name: &str, phase: Phase, native: NativeId) {
        self.reactions.write().push((name.to_string(), phase, native));
    }

    /// Déclenche toutes les réactions enregistrées pour `(name, phase)`,
    /// dans l'ordre. Les erreurs d'un natif interrompent la cascade et
    /// remontent à l'appelant.
    pub fn fire(&self, registry: &NativeRegistry, rt: &Runtime, name: &str, phase: Phase, value: &Value) -> RResult<()> {
        let matches: Vec<NativeId> = self
            .reactions
            .read()
            .iter()
            .filter(|(n, p, _)| n == name && *p == phase)
            .map(|(_, _, id)| *id)
            .collect();
        for id in matches {
            tracing::debug!(target: "lattice_runtime::reactions", name, phase = %phase, "firing reaction");
            registry.call(id, std::slice::from_ref(value), rt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::Value;

    fn noop(_args: &[Value], _rt: &Runtime) -> RResult<Value> {
        Ok(Value::Nil)
    }

    #[test]
    fn fires_only_matching_reactions() {
        let mut registry = NativeRegistry::new();
        let id = registry.register("r", "r.noop", None, noop);
        let table = ReactionTable::new();
        table.on_phase("x", Phase::Crystal, id);
        table.on_phase("y", Phase::Crystal, id);

        let rt = Runtime::new();
        assert!(table.fire(&registry, &rt, "x", Phase::Crystal, &Value::Int(1)).is_ok());
        assert!(table.fire(&registry, &rt, "x", Phase::Fluid, &Value::Int(1)).is_ok());
    }
}
