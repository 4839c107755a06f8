//! env.rs — environnement lexical à chaîne de parents (C2).
//!
//! Une portée est une table de bindings plus un pointeur optionnel vers son
//! parent. La recherche remonte la chaîne ; l'écriture sur un nom existant
//! (`set_existing`) remonte aussi, mais ne crée jamais de binding en
//! l'absence d'un `define` préalable (pas d'auto-vivification, §3.2).
//!
//! Les fermetures qui capturent un environnement retiennent un `Arc` vers
//! la portée de définition (voir `Closure::env` dans [`crate::value`]),
//! qui peut donc survivre à la portée qui l'a créée.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::{LatStr, Phased};

/// Erreurs de résolution de nom (C2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvError {
    #[error("undefined variable '{0}'")]
    Undefined(String),

    #[error("'{0}' is already defined in this scope")]
    AlreadyDefinedHere(String),
}

/// Portée lexicale. Toujours manipulée derrière un `Arc` une fois capturée
/// par une fermeture ; les scopes non capturés peuvent rester sur la pile
/// d'appel de l'interpréteur arbre.
#[derive(Debug)]
pub struct Environment {
    bindings: RwLock<Vec<(LatStr, Phased)>>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    /// Portée racine, sans parent.
    pub fn root() -> Arc<Self> {
        Arc::new(Self { bindings: RwLock::new(Vec::new()), parent: None })
    }

    /// Nouvelle portée enfant de `parent`.
    pub fn new(parent: Arc<Environment>) -> Arc<Self> {
        Arc::new(Self { bindings: RwLock::new(Vec::new()), parent: Some(parent) })
    }

    /// Introduit (ou masque, si `name` existe déjà dans un parent) un
    /// binding dans *cette* portée. Redéfinir deux fois le même nom dans la
    /// même portée est une erreur (pas de double-`define` silencieux).
    pub fn define(&self, name: LatStr, value: Phased) -> Result<(), EnvError> {
        let mut bindings = self.bindings.write();
        if bindings.iter().any(|(n, _)| *n == name) {
            return Err(EnvError::AlreadyDefinedHere(name.to_string()));
        }
        bindings.push((name, value));
        Ok(())
    }

    /// Lecture, en remontant la chaîne de parents si nécessaire.
    pub fn get(&self, name: &str) -> Option<Phased> {
        let bindings = self.bindings.read();
        if let Some((_, v)) = bindings.iter().rev().find(|(n, _)| n.as_ref() == name) {
            return Some(v.clone());
        }
        drop(bindings);
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Écrit sur un binding existant (recherché le long de la chaîne de
    /// parents) ; échoue si `name` n'a jamais été défini — pas de création
    /// implicite.
    pub fn set_existing(&self, name: &str, value: Phased) -> Result<(), EnvError> {
        {
            let mut bindings = self.bindings.write();
            if let Some(slot) = bindings.iter_mut().rev().find(|(n, _)| n.as_ref() == name) {
                slot.1 = value;
                return Ok(());
            }
        }
        match &self.parent {
            Some(p) => p.set_existing(name, value),
            None => Err(EnvError::Undefined(name.to_string())),
        }
    }

    /// Vide cette portée (pas ses parents) — utilisé quand un cadre
    /// d'interprétation arbre se termine et qu'aucune fermeture ne l'a
    /// capturée, pour relâcher les `Value` qu'elle retenait au plus tôt.
    pub fn free(&self) {
        self.bindings.write().clear();
    }

    /// Ce nom est-il visible depuis cette portée (locale ou héritée) ?
    pub fn is_defined(&self, name: &str) -> bool {
        if self.bindings.read().iter().any(|(n, _)| n.as_ref() == name) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_defined(name))
    }

    /// Nombre de bindings dans la portée locale (hors parents).
    pub fn local_len(&self) -> usize {
        self.bindings.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Phase, Value};

    fn phased(i: i64) -> Phased {
        Phased::with_phase(Value::Int(i), Phase::Fluid)
    }

    #[test]
    fn shadowing_in_child_does_not_affect_parent() {
        let root = Environment::root();
        root.define(LatStr::from("x"), phased(1)).unwrap();
        let child = Environment::new(root.clone());
        child.define(LatStr::from("x"), phased(2)).unwrap();

        assert_eq!(child.get("x").unwrap().value, Value::Int(2));
        assert_eq!(root.get("x").unwrap().value, Value::Int(1));
    }

    #[test]
    fn set_existing_walks_up_to_parent() {
        let root = Environment::root();
        root.define(LatStr::from("x"), phased(1)).unwrap();
        let child = Environment::new(root.clone());

        child.set_existing("x", phased(9)).unwrap();
        assert_eq!(root.get("x").unwrap().value, Value::Int(9));
    }

    #[test]
    fn no_auto_vivification() {
        let root = Environment::root();
        assert!(matches!(root.set_existing("missing", phased(1)), Err(EnvError::Undefined(_))));
    }

    #[test]
    fn redefine_in_same_scope_errors() {
        let root = Environment::root();
        root.define(LatStr::from("x"), phased(1)).unwrap();
        assert!(matches!(
            root.define(LatStr::from("x"), phased(2)),
            Err(EnvError::AlreadyDefinedHere(_))
        ));
    }

    #[test]
    fn free_drops_local_bindings_only() {
        let root = Environment::root();
        root.define(LatStr::from("x"), phased(1)).unwrap();
        let child = Environment::new(root.clone());
        child.define(LatStr::from("y"), phased(2)).unwrap();

        child.free();
        assert_eq!(child.local_len(), 0);
        assert_eq!(root.get("x").unwrap().value, Value::Int(1));
    }
}
