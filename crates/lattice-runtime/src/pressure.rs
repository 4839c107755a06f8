//! pressure.rs — modes de pression sur une variable suivie (C5, §4.5).
//!
//! `pressurize(name, mode)` pose un mode de pression sur une variable ;
//! chaque mutation qui passe par le runtime (plutôt que directement par
//! `Environment::set_existing`) est classée (`MutationKind`) et comparée
//! au mode en vigueur par `guard`. La variable reste toujours lisible,
//! seules certaines formes d'écriture sont bloquées selon le mode.

use parking_lot::RwLock;

use crate::error::{RResult, RuntimeError};

/// Mode de pression posé sur une variable (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureMode {
    /// Refuse toute mutation qui ferait grandir le conteneur (nouvelle clé,
    /// nouvel élément). Écraser une entrée existante reste permis.
    NoGrow,
    /// Refuse toute mutation qui ferait rétrécir le conteneur.
    NoShrink,
    /// Refuse croissance ET rétrécissement ; seul l'écrasement en place
    /// d'une entrée existante est permis.
    NoResize,
    /// Lecture seule de fait : toute mutation, même un simple écrasement,
    /// est refusée.
    ReadHeavy,
}

/// Catégorie de mutation qu'une écriture s'apprête à effectuer, déterminée
/// par l'appelant (la VM sait si la clé existait déjà).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Ajoute une entrée/élément qui n'existait pas.
    Grow,
    /// Retire une entrée/élément existant.
    Shrink,
    /// Remplace la valeur d'une entrée/élément déjà présent.
    Overwrite,
}

#[derive(Default)]
pub struct PressureTable {
    modes: RwLock<ahash::AHashMap<String, PressureMode>>,
}

impl PressureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pose (ou remplace) le mode de pression sur `name`.
    pub fn pressurize(&self, name: &str, mode: PressureMode) {
        self.modes.write().insert(name.to_string(), mode);
    }

    /// Retire toute contrainte de pression sur `name`.
    pub fn depressurize(&self, name: &str) {
        self.modes.write().remove(name);
    }

    /// Mode en vigueur sur `name`, `None` si `name` n'est pas sous pression.
    pub fn pressure_of(&self, name: &str) -> Option<PressureMode> {
        self.modes.read().get(name).copied()
    }

    /// Vérifie qu'une mutation de nature `kind` sur `name` est permise par
    /// le mode en vigueur. Pas de mode posé ⇒ toujours permis.
    pub fn guard(&self, name: &str, kind: MutationKind) -> RResult<()> {
        let Some(mode) = self.pressure_of(name) else { return Ok(()) };
        let blocked = match mode {
            PressureMode::NoGrow => kind == MutationKind::Grow,
            PressureMode::NoShrink => kind == MutationKind::Shrink,
            PressureMode::NoResize => matches!(kind, MutationKind::Grow | MutationKind::Shrink),
            PressureMode::ReadHeavy => true,
        };
        if blocked {
            return Err(RuntimeError::PressureExhausted(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_names_always_pass() {
        let p = PressureTable::new();
        assert!(p.guard("x", MutationKind::Grow).is_ok());
    }

    #[test]
    fn no_grow_blocks_growth_but_allows_overwrite() {
        let p = PressureTable::new();
        p.pressurize("x", PressureMode::NoGrow);
        assert!(p.guard("x", MutationKind::Grow).is_err());
        assert!(p.guard("x", MutationKind::Shrink).is_ok());
        assert!(p.guard("x", MutationKind::Overwrite).is_ok());
    }

    #[test]
    fn no_resize_blocks_both_directions() {
        let p = PressureTable::new();
        p.pressurize("x", PressureMode::NoResize);
        assert!(p.guard("x", MutationKind::Grow).is_err());
        assert!(p.guard("x", MutationKind::Shrink).is_err());
        assert!(p.guard("x", MutationKind::Overwrite).is_ok());
    }

    #[test]
    fn read_heavy_blocks_everything() {
        let p = PressureTable::new();
        p.pressurize("x", PressureMode::ReadHeavy);
        assert!(p.guard("x", MutationKind::Overwrite).is_err());
    }

    #[test]
    fn depressurize_lifts_the_constraint() {
        let p = PressureTable::new();
        p.pressurize("x", PressureMode::ReadHeavy);
        assert!(p.guard("x", MutationKind::Overwrite).is_err());
        p.depressurize("x");
        assert!(p.guard("x", MutationKind::Overwrite).is_ok());
    }
}
