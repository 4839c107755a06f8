//! lattice-vm — la VM à pile canonique pour le bytecode Lattice (C4).
//!
//! Exécute un [`lattice_core::bytecode::Chunk`] en consultant les services
//! partagés d'un [`lattice_runtime::Runtime`] (dispatch natif, pression,
//! gel/dégel, graines, cache de modules) à chaque opcode qui en a besoin.

pub mod error;
pub mod frame;
pub mod options;
pub mod vm;

pub use error::{VmError, VmResult};
pub use frame::{CallFrame, TryHandler};
pub use options::VmOptions;
pub use vm::Vm;
