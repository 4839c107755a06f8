//! tracking.rs — historique des valeurs suivies (C5, §4.5).
//!
//! Suivre une variable (`track`) lui ouvre un journal d'instantanés
//! (`Phased`, donc valeur + phase) consulté par `history`/`phases` et
//! consommable par `rewind`. Ne rien suivre ne coûte rien : la plupart des
//! variables d'un programme n'ont jamais d'entrée ici.

use parking_lot::RwLock;

use lattice_core::value::{Phased, Value};

use crate::error::{RResult, RuntimeError};

/// Journal d'historique d'une variable suivie.
#[derive(Default)]
pub struct Tracker {
    logs: RwLock<ahash::AHashMap<String, Vec<Phased>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commence à suivre `name`. Idempotent : suivre deux fois ne perd pas
    /// l'historique déjà accumulé.
    pub fn track(&self, name: &str) {
        let mut logs = self.logs.write();
        logs.entry(name.to_string()).or_default();
    }

    /// Ce nom est-il suivi ?
    pub fn is_tracked(&self, name: &str) -> bool {
        self.logs.read().contains_key(name)
    }

    /// Ajoute un instantané à l'historique de `name`.
    pub fn record_history(&self, name: &str, snapshot: Phased) -> RResult<()> {
        let mut logs = self.logs.write();
        let log = logs.get_mut(name).ok_or_else(|| RuntimeError::NotTracked(name.to_string()))?;
        log.push(snapshot);
        Ok(())
    }

    /// Historique complet de `name`, du plus ancien au plus récent.
    pub fn history(&self, name: &str) -> RResult<Vec<Phased>> {
        let logs = self.logs.read();
        logs.get(name).cloned().ok_or_else(|| RuntimeError::NotTracked(name.to_string()))
    }

    /// Juste les étiquettes de phase de l'historique, dans l'ordre.
    pub fn phases(&self, name: &str) -> RResult<Vec<lattice_core::value::Phase>> {
        Ok(self.history(name)?.into_iter().map(|p| p.phase).collect())
    }

    /// Valeur de `name` telle qu'elle était `steps` instantanés avant le
    /// plus récent, sans y toucher (§4.5 : `rewind` lit l'historique, il
    /// ne le consomme pas). `Nil` si l'historique ne remonte pas si loin.
    pub fn rewind(&self, name: &str, steps: usize) -> RResult<Value> {
        let logs = self.logs.read();
        let log = logs.get(name).ok_or_else(|| RuntimeError::NotTracked(name.to_string()))?;
        let len = log.len();
        if steps >= len {
            return Ok(Value::Nil);
        }
        Ok(log[len - 1 - steps].value.deep_clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::{Phase, Value};

    #[test]
    fn untracked_name_errors() {
        let t = Tracker::new();
        assert!(matches!(t.history("x"), Err(RuntimeError::NotTracked(_))));
    }

    #[test]
    fn records_and_reads_back_in_order() {
        let t = Tracker::new();
        t.track("x");
        t.record_history("x", Phased::with_phase(Value::Int(1), Phase::Fluid)).unwrap();
        t.record_history("x", Phased::with_phase(Value::Int(2), Phase::Crystal)).unwrap();

        let hist = t.history("x").unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].value, Value::Int(1));
        assert_eq!(hist[1].phase, Phase::Crystal);
    }

    #[test]
    fn rewind_reads_without_consuming_history() {
        let t = Tracker::new();
        t.track("x");
        t.record_history("x", Phased::new(Value::Int(1))).unwrap();
        t.record_history("x", Phased::new(Value::Int(2))).unwrap();

        assert_eq!(t.rewind("x", 0).unwrap(), Value::Int(2));
        assert_eq!(t.rewind("x", 1).unwrap(), Value::Int(1));
        assert_eq!(t.history("x").unwrap().len(), 2);
    }

    #[test]
    fn rewind_past_the_start_of_history_is_nil() {
        let t = Tracker::new();
        t.track("x");
        t.record_history("x", Phased::new(Value::Int(1))).unwrap();
        assert_eq!(t.rewind("x", 5).unwrap(), Value::Nil);
    }
}
