//! seeds.rs — préconditions de croissance (C5, §4.5/§8).
//!
//! `seed(name, guard)` attache un ou plusieurs natifs-précondition à `name`
//! (plusieurs graines peuvent s'accumuler sur le même nom, §8 : chaque
//! appel à `seed` en ajoute une de plus, il ne remplace pas les
//! précédentes). `grow` les évalue toutes, dans l'ordre de plantation,
//! contre la valeur courante : la première qui échoue fait échouer la
//! croissance. Dans tous les cas — succès ou échec — les graines évaluées
//! sont consommées (§8 : "seeds are one-shot", comme les liens). Une
//! variable sans graine plantée pousse toujours. Sur un succès, `grow` ne
//! se contente pas de laisser passer : elle gèle `name` via
//! [`Runtime::freeze_named`], donc avec historique/réactions/cascade de
//! liens exactement comme un `FREEZE` direct — "pousser" une graine, c'est
//! la faire éclore en cristal.

use parking_lot::RwLock;

use lattice_core::value::{NativeId, Phased, Value};

use crate::bonds::CascadeEffect;
use crate::error::{RResult, RuntimeError};
use crate::registry::NativeRegistry;
use crate::runtime::Runtime;

#[derive(Default)]
pub struct SeedTable {
    guards: RwLock<ahash::AHashMap<String, Vec<NativeId>>>,
}

impl SeedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plante une graine de plus sur `name` : `guard` doit renvoyer une
    /// valeur "truthy" pour que `grow` laisse passer. S'accumule avec les
    /// graines déjà plantées sur ce nom.
    pub fn seed(&self, name: &str, guard: NativeId) {
        self.guards.write().entry(name.to_string()).or_default().push(guard);
    }

    pub fn is_seeded(&self, name: &str) -> bool {
        self.guards.read().get(name).is_some_and(|g| !g.is_empty())
    }

    /// Évalue, dans l'ordre, toutes les préconditions plantées sur `name`
    /// contre `current`, puis — si elles passent toutes — gèle `name` via
    /// [`Runtime::freeze_named`]. Consomme les graines évaluées que la
    /// croissance réussisse ou échoue. Pas de graine plantée ⇒ toujours
    /// permis (et `name` gèle quand même).
    pub fn grow(
        &self,
        registry: &NativeRegistry,
        rt: &Runtime,
        name: &str,
        current: &Phased,
        lookup: &dyn Fn(&str) -> Option<Phased>,
    ) -> RResult<(Phased, Vec<(String, CascadeEffect)>)> {
        let guards = self.guards.write().remove(name).unwrap_or_default();
        for guard in guards {
            let verdict = registry.call(guard, std::slice::from_ref(&current.value), rt)?;
            if !verdict.is_truthy() {
                return Err(RuntimeError::SeedFailure(name.to_string()));
            }
        }
        rt.freeze_named(name, current, lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::Phase;

    fn only_positive(args: &[Value], _rt: &Runtime) -> RResult<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Bool(*i > 0)),
            _ => Ok(Value::Bool(false)),
        }
    }

    fn under_ten(args: &[Value], _rt: &Runtime) -> RResult<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Bool(*i < 10)),
            _ => Ok(Value::Bool(false)),
        }
    }

    fn no_lookup(_: &str) -> Option<Phased> {
        None
    }

    #[test]
    fn unseeded_names_always_grow_and_freeze() {
        let registry = NativeRegistry::new();
        let seeds = SeedTable::new();
        let rt = Runtime::new();
        let current = Phased::with_phase(Value::Int(-5), Phase::Fluid);
        let (frozen, cascades) = seeds.grow(&registry, &rt, "x", &current, &no_lookup).unwrap();
        assert_eq!(frozen.phase, Phase::Crystal);
        assert!(cascades.is_empty());
    }

    #[test]
    fn seeded_guards_accumulate_and_all_must_pass() {
        let mut registry = NativeRegistry::new();
        let positive = registry.register("g", "g.only_positive", Some(1), only_positive);
        let under10 = registry.register("g", "g.under_ten", Some(1), under_ten);
        let seeds = SeedTable::new();
        seeds.seed("x", positive);
        seeds.seed("x", under10);
        let rt = Runtime::new();

        let passing = Phased::with_phase(Value::Int(3), Phase::Fluid);
        let (frozen, _) = seeds.grow(&registry, &rt, "x", &passing, &no_lookup).unwrap();
        assert_eq!(frozen.phase, Phase::Crystal);
    }

    #[test]
    fn failing_guard_rejects_growth() {
        let mut registry = NativeRegistry::new();
        let positive = registry.register("g", "g.only_positive", Some(1), only_positive);
        let seeds = SeedTable::new();
        seeds.seed("x", positive);
        let rt = Runtime::new();

        let failing = Phased::with_phase(Value::Int(-1), Phase::Fluid);
        assert!(matches!(
            seeds.grow(&registry, &rt, "x", &failing, &no_lookup),
            Err(RuntimeError::SeedFailure(_))
        ));
    }

    #[test]
    fn guards_are_consumed_on_both_success_and_failure() {
        let mut registry = NativeRegistry::new();
        let positive = registry.register("g", "g.only_positive", Some(1), only_positive);
        let seeds = SeedTable::new();
        seeds.seed("x", positive);
        assert!(seeds.is_seeded("x"));
        let rt = Runtime::new();

        let failing = Phased::with_phase(Value::Int(-1), Phase::Fluid);
        assert!(seeds.grow(&registry, &rt, "x", &failing, &no_lookup).is_err());
        assert!(!seeds.is_seeded("x"));

        // Once consumed, a second attempt on the same name is unseeded and
        // always succeeds — even with a value that would have failed.
        let (frozen, _) = seeds.grow(&registry, &rt, "x", &failing, &no_lookup).unwrap();
        assert_eq!(frozen.phase, Phase::Crystal);
    }
}
