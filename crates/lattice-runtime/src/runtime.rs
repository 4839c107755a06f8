//! runtime.rs — le contexte runtime de Lattice (C5, §4.5).
//!
//! `Runtime` regroupe les services que la VM consulte à chaque opcode de
//! phase (`FREEZE`, `THAW`, `REQUIRE`, `CALL` sur un natif) : suivi
//! d'historique, pression, réactions, liens de gel, graines de croissance,
//! caches de modules/extensions et table de dispatch natif (C6).
//!
//! La VM (`lattice-vm`) n'a normalement qu'un seul `Runtime` par
//! exécution et se le passe explicitement ; le pointeur thread-local ci-
//! dessous n'existe que pour les natifs qui n'ont pas accès à leur
//! appelant autrement (cf. le commentaire de conception §9 : "confined to
//! a single documented accessor").

use std::cell::RefCell;
use std::sync::Arc;

use crate::bonds::BondTable;
use crate::cache::ModuleCache;
use crate::error::RResult;
use crate::pressure::PressureTable;
use crate::reactions::ReactionTable;
use crate::registry::NativeRegistry;
use crate::seeds::SeedTable;
use crate::tracking::Tracker;

use lattice_core::value::{NativeId, Phase, Phased, Value};

/// Le contexte runtime partagé par une exécution de VM et toutes les
/// tâches qu'elle lance.
#[derive(Default)]
pub struct Runtime {
    pub natives: NativeRegistry,
    pub tracker: Tracker,
    pub pressure: PressureTable,
    pub reactions: ReactionTable,
    pub bonds: BondTable,
    pub seeds: SeedTable,
    pub cache: ModuleCache,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appelle le natif `id`, en propageant les erreurs de C6.
    pub fn call_native(&self, id: NativeId, args: &[Value]) -> RResult<Value> {
        self.natives.call(id, args, self)
    }

    /// Gèle `phased` et déclenche la cascade de tout lien partant de
    /// `name`, puis les réactions enregistrées sur `(name, Crystal)`.
    /// `lookup` donne à la cascade de liens (C5) accès à la valeur
    /// *courante* des variables dépendantes — elles ne vivent pas dans le
    /// `Runtime` mais dans l'environnement/la pile de l'appelant. Renvoie
    /// la nouvelle valeur gelée et les effets de cascade à appliquer par
    /// l'appelant sur les variables liées (une cascade `Mirror` peut elle-
    /// même en déclencher d'autres, donc la liste peut contenir des
    /// cibles au-delà des liens directs de `name`).
    pub fn freeze_named(
        &self,
        name: &str,
        phased: &Phased,
        lookup: &dyn Fn(&str) -> Option<Phased>,
    ) -> RResult<(Phased, Vec<(String, crate::bonds::CascadeEffect)>)> {
        let frozen = lattice_core::value::freeze(phased);
        if self.tracker.is_tracked(name) {
            self.tracker.record_history(name, frozen.clone())?;
        }
        self.reactions.fire(&self.natives, self, name, Phase::Crystal, &frozen.value)?;
        let cascades = self.bonds.trigger_freeze(name, self, lookup)?;
        tracing::debug!(target: "lattice_runtime::runtime", name, cascades = cascades.len(), "freeze cascaded");
        Ok((frozen, cascades))
    }

    /// Dégèle `phased` et enregistre l'historique/réactions de `name`.
    /// Contrairement à `freeze_named`, ne déclenche aucune cascade de
    /// liens : seul un gel propage (§4.5, §8 — les liens ne se consomment
    /// que sur `FREEZE`).
    pub fn thaw_named(&self, name: &str, phased: &Phased) -> RResult<Phased> {
        let thawed = lattice_core::value::thaw(phased);
        if self.tracker.is_tracked(name) {
            self.tracker.record_history(name, thawed.clone())?;
        }
        self.reactions.fire(&self.natives, self, name, Phase::Fluid, &thawed.value)?;
        Ok(thawed)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Runtime>>> = const { RefCell::new(None) };
}

/// Installe `rt` comme runtime courant du thread appelant, pour la durée
/// de l'appel à `f`. Restaure l'ancien runtime (s'il y en avait un) en
/// sortant, y compris si `f` panique.
pub fn with_current<R>(rt: Arc<Runtime>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(rt));
    struct Restore(Option<Arc<Runtime>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|cell| *cell.borrow_mut() = self.0.take());
        }
    }
    let _guard = Restore(previous);
    f()
}

/// Le runtime courant du thread appelant, s'il y en a un. Seul accesseur
/// documenté du pointeur thread-local (§9) — les natifs qui ont besoin du
/// `Runtime` le reçoivent normalement en paramètre ; ceci n'est qu'un
/// filet pour le code d'extension C7 qui ne peut pas porter ce paramètre
/// à travers l'ABI opaque.
pub fn current() -> Option<Arc<Runtime>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_none_outside_with_current() {
        assert!(current().is_none());
    }

    #[test]
    fn with_current_installs_and_restores() {
        let rt = Arc::new(Runtime::new());
        with_current(rt.clone(), || {
            assert!(current().is_some());
        });
        assert!(current().is_none());
    }

    #[test]
    fn nested_with_current_restores_outer() {
        let outer = Arc::new(Runtime::new());
        let inner = Arc::new(Runtime::new());
        with_current(outer.clone(), || {
            with_current(inner.clone(), || {
                assert!(Arc::ptr_eq(&current().unwrap(), &inner));
            });
            assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        });
    }
}
