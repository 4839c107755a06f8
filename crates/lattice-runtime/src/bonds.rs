//! bonds.rs — cascades de gel à usage unique entre deux variables (C5, §4.5/§8).
//!
//! `bond(a, b, strategy)` relie `a` à `b` : la prochaine fois que `a` gèle,
//! la cascade se déclenche une seule fois puis le lien est consommé
//! (§8 : "bonds are one-shot"). Trois stratégies :
//! - `Mirror`  : la valeur propre de `b` (pas une copie de celle de `a`)
//!   gèle à son tour, via [`Runtime::freeze_named`] — donc avec sa propre
//!   cascade, son propre historique, ses propres réactions, exactement
//!   comme si `b` avait gelé directement.
//! - `Inverse` : la valeur propre de `b` dégèle (redevient fluide).
//! - `Gate`    : si `b` est actuellement dans une phase mutable, on lui
//!   pose un budget de pression `ReadHeavy` (plus aucune mutation tant
//!   qu'on ne la `depressurize` pas) ; sinon (déjà `Crystal`/`Sublimated`,
//!   ou `b` introuvable) il n'y a rien à bloquer et la cascade échoue.

use parking_lot::RwLock;

use lattice_core::value::{Phase, Phased};

use crate::error::RResult;
use crate::pressure::PressureMode;
use crate::runtime::Runtime;

/// Stratégie de cascade appliquée à la variable liée quand la source gèle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondStrategy {
    Mirror,
    Inverse,
    Gate,
}

struct Bond {
    target: String,
    strategy: BondStrategy,
}

#[derive(Default)]
pub struct BondTable {
    bonds: RwLock<ahash::AHashMap<String, Vec<Bond>>>,
}

/// Effet concret d'une cascade, déjà appliqué par `trigger_freeze` pour ce
/// qui est des services C5 (historique/réactions/pression) — ce qui reste à
/// faire porter à l'appelant est l'écriture de la nouvelle valeur (qu'il
/// possède l'environnement pour faire), ou la propagation d'un échec.
pub enum CascadeEffect {
    /// `target` doit devenir cette valeur, à cette phase.
    SetPhased(Phased),
    /// La cascade `Gate` sur `target` n'a rien trouvé à bloquer.
    GateFailed(String),
}

impl BondTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lie `source` à `target` avec `strategy`. Plusieurs liens peuvent
    /// partir de la même source ; chacun se consomme indépendamment.
    pub fn bond(&self, source: &str, target: &str, strategy: BondStrategy) {
        self.bonds
            .write()
            .entry(source.to_string())
            .or_default()
            .push(Bond { target: target.to_string(), strategy });
    }

    /// `source` vient de geler. Consomme (et retire) tous les liens
    /// partant de `source`, renvoyant la liste des `(cible, effet)` à
    /// appliquer par l'appelant, qui possède l'environnement (pour écrire
    /// la valeur de `target`) — `lookup` est la façon dont ce même
    /// appelant nous laisse lire la valeur *courante* de `target`, dont le
    /// bond a besoin (Mirror/Inverse/Gate portent tous sur la valeur
    /// propre de la cible, jamais sur celle de `source`).
    pub fn trigger_freeze(
        &self,
        source: &str,
        rt: &Runtime,
        lookup: &dyn Fn(&str) -> Option<Phased>,
    ) -> RResult<Vec<(String, CascadeEffect)>> {
        let bonds = self.bonds.write().remove(source).unwrap_or_default();
        let mut effects = Vec::new();
        for b in bonds {
            match b.strategy {
                BondStrategy::Mirror => {
                    if let Some(current) = lookup(&b.target) {
                        let (frozen, nested) = rt.freeze_named(&b.target, &current, lookup)?;
                        effects.push((b.target, CascadeEffect::SetPhased(frozen)));
                        effects.extend(nested);
                    }
                }
                BondStrategy::Inverse => {
                    if let Some(current) = lookup(&b.target) {
                        let thawed = lattice_core::value::thaw(&current);
                        effects.push((b.target, CascadeEffect::SetPhased(thawed)));
                    }
                }
                BondStrategy::Gate => {
                    let can_gate = lookup(&b.target).is_some_and(|p| p.phase.is_mutable() || p.phase == Phase::Unphased);
                    if can_gate {
                        rt.pressure.pressurize(&b.target, PressureMode::ReadHeavy);
                    } else {
                        effects.push((b.target.clone(), CascadeEffect::GateFailed(b.target)));
                    }
                }
            }
        }
        Ok(effects)
    }

    /// Nombre de liens encore actifs partant de `source`.
    pub fn pending_for(&self, source: &str) -> usize {
        self.bonds.read().get(source).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::Value;
    use std::collections::HashMap;

    fn lookup_from(env: &HashMap<String, Phased>) -> impl Fn(&str) -> Option<Phased> + '_ {
        move |name: &str| env.get(name).cloned()
    }

    #[test]
    fn mirror_bond_freezes_the_dependents_own_value() {
        let table = BondTable::new();
        let rt = Runtime::new();
        table.bond("a", "b", BondStrategy::Mirror);
        assert_eq!(table.pending_for("a"), 1);

        let mut env = HashMap::new();
        env.insert("b".to_string(), Phased::with_phase(Value::Int(99), Phase::Fluid));

        let effects = table.trigger_freeze("a", &rt, &lookup_from(&env)).unwrap();
        assert_eq!(effects.len(), 1);
        assert_eq!(table.pending_for("a"), 0);

        match &effects[0].1 {
            CascadeEffect::SetPhased(p) => {
                assert_eq!(p.phase, Phase::Crystal);
                assert_eq!(p.value, Value::Int(99));
            }
            CascadeEffect::GateFailed(_) => panic!("expected SetPhased"),
        }
    }

    #[test]
    fn gate_bond_pressurizes_a_mutable_dependent() {
        let table = BondTable::new();
        let rt = Runtime::new();
        table.bond("a", "b", BondStrategy::Gate);

        let mut env = HashMap::new();
        env.insert("b".to_string(), Phased::with_phase(Value::Int(1), Phase::Fluid));

        let effects = table.trigger_freeze("a", &rt, &lookup_from(&env)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(rt.pressure.pressure_of("b"), Some(PressureMode::ReadHeavy));
    }

    #[test]
    fn gate_bond_fails_when_the_dependent_is_already_crystal() {
        let table = BondTable::new();
        let rt = Runtime::new();
        table.bond("a", "b", BondStrategy::Gate);

        let mut env = HashMap::new();
        env.insert("b".to_string(), Phased::with_phase(Value::Int(1), Phase::Crystal));

        let effects = table.trigger_freeze("a", &rt, &lookup_from(&env)).unwrap();
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0].1, CascadeEffect::GateFailed(name) if name == "b"));
    }

    #[test]
    fn second_freeze_has_nothing_left_to_cascade() {
        let table = BondTable::new();
        let rt = Runtime::new();
        table.bond("a", "b", BondStrategy::Inverse);

        let mut env = HashMap::new();
        env.insert("b".to_string(), Phased::with_phase(Value::Int(1), Phase::Crystal));

        table.trigger_freeze("a", &rt, &lookup_from(&env)).unwrap();
        let second = table.trigger_freeze("a", &rt, &lookup_from(&env)).unwrap();
        assert!(second.is_empty());
    }
}
