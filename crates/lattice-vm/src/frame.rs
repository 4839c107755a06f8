//! frame.rs — cadre d'appel de la VM à pile (C4, §4.4).

use std::sync::Arc;

use lattice_core::bytecode::Chunk;
use lattice_core::value::Closure;

/// Un cadre d'appel actif : le chunk en cours d'exécution, le compteur
/// d'instruction, l'indice de base des locales sur la pile d'opérandes
/// partagée, et la fermeture qui l'a ouvert (pour `LOAD_UPVALUE`/
/// `STORE_UPVALUE`/`MAKE_CLOSURE`, absente au niveau du programme racine).
pub struct CallFrame {
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    pub base: usize,
    pub closure: Option<Arc<Closure>>,
}

impl CallFrame {
    pub fn new(chunk: Arc<Chunk>, base: usize) -> Self {
        Self { chunk, ip: 0, base, closure: None }
    }

    pub fn with_closure(chunk: Arc<Chunk>, base: usize, closure: Arc<Closure>) -> Self {
        Self { chunk, ip: 0, base, closure: Some(closure) }
    }
}

/// Un gestionnaire `TRY_BEGIN` actif, prêt à intercepter un `THROW`.
pub struct TryHandler {
    pub target_ip: usize,
    pub frame_depth: usize,
    pub stack_depth: usize,
}
