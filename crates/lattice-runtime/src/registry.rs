//! registry.rs — table de fonctions natives (C6).
//!
//! Généralisation directe de la table `Runtime`/`NativeEntry` de la
//! référence du corpus (`register_fn`/`register_all`/`call`), avec une
//! résolution par [`lattice_core::value::NativeId`] plutôt que par nom au
//! site d'appel — la VM résout le nom une fois, au moment de `MakeClosure`,
//! et ne porte plus ensuite qu'un entier.

use lattice_core::value::{NativeId, Value};

use crate::error::{RResult, RuntimeError};
use crate::runtime::Runtime;

/// Signature d'une fonction native (§4.6). Reçoit les arguments déjà
/// évalués et une référence au `Runtime` courant pour les natifs qui ont
/// besoin d'accéder aux services C5 (ex: `freeze`/`bond`/`channel`).
pub type NativeFn = fn(&[Value], &Runtime) -> RResult<Value>;

/// Une entrée de la table native : nom pleinement qualifié, arité attendue
/// (`None` = variadique) et pointeur de fonction.
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub fqname: &'static str,
    pub arity: Option<usize>,
    pub func: NativeFn,
}

/// Table des natifs enregistrés, indexée à la fois par nom (enregistrement)
/// et par [`NativeId`] (résolution à l'exécution).
#[derive(Default)]
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
    by_name: ahash::AHashMap<&'static str, NativeId>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un natif sous `module.name`, renvoyant son [`NativeId`] stable.
    pub fn register(&mut self, module: &str, name: &'static str, arity: Option<usize>, func: NativeFn) -> NativeId {
        let _ = module; // le nom pleinement qualifié est déjà porté par `name` à l'appel
        let id = NativeId(self.entries.len() as u32);
        self.entries.push(NativeEntry { fqname: name, arity, func });
        self.by_name.insert(name, id);
        id
    }

    pub fn register_all(&mut self, module: &str, entries: &[(&'static str, Option<usize>, NativeFn)]) {
        for (name, arity, func) in entries {
            self.register(module, name, *arity, *func);
        }
    }

    pub fn resolve(&self, fqname: &str) -> Option<NativeId> {
        self.by_name.get(fqname).copied()
    }

    pub fn entry(&self, id: NativeId) -> Option<&NativeEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Appelle le natif `id` après vérification de l'arité.
    pub fn call(&self, id: NativeId, args: &[Value], rt: &Runtime) -> RResult<Value> {
        let entry = self.entry(id).ok_or_else(|| RuntimeError::NotFound(format!("native#{}", id.0)))?;
        if let Some(expected) = entry.arity {
            if expected != args.len() {
                return Err(RuntimeError::Arity { expected, got: args.len() });
            }
        }
        (entry.func)(args, rt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
