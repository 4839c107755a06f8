//! lattice-runtime — services d'exécution de Lattice (C5, C6, C8).
//!
//! Ce crate ne sait pas exécuter de bytecode : il fournit le contexte que
//! `lattice-vm` consulte à chaque opcode qui touche au système de phases
//! (suivi/historique, pression, réactions, liens de gel, graines), la
//! table de dispatch natif (C6), les caches de `require`/extension, et la
//! primitive de canal (C8).
//!
//! ## Modules
//! - [`runtime`]   : `Runtime`, le contexte partagé, et l'accesseur
//!   thread-local documenté par la conception (§9).
//! - [`registry`]  : table de fonctions natives (C6).
//! - [`tracking`]  : historique des valeurs suivies.
//! - [`pressure`]  : budgets de mutation.
//! - [`reactions`] : callbacks de transition de phase.
//! - [`bonds`]     : cascades de gel à usage unique.
//! - [`seeds`]     : préconditions de croissance.
//! - [`builtins`]  : natifs C5 exposés au langage (track/history/bond/...).
//! - [`cache`]     : déduplication `require`/extensions.
//! - [`channel`]   : primitive de canal MPMC et `select` (C8).
//! - [`error`]     : `RuntimeError`.

#![deny(rust_2018_idioms, unused_must_use)]

pub mod bonds;
pub mod builtins;
pub mod cache;
pub mod channel;
pub mod error;
pub mod pressure;
pub mod reactions;
pub mod registry;
pub mod runtime;
pub mod seeds;
pub mod tracking;

pub use bonds::{BondStrategy, BondTable, CascadeEffect};
pub use builtins::BuiltinIds;
pub use cache::ModuleCache;
pub use channel::{new_channel, select, Channel, SelectCase, SelectOutcome};
pub use error::{RResult, RuntimeError};
pub use pressure::{MutationKind, PressureMode, PressureTable};
pub use reactions::ReactionTable;
pub use registry::{NativeEntry, NativeFn, NativeRegistry};
pub use runtime::{current, with_current, Runtime};
pub use seeds::SeedTable;
pub use tracking::Tracker;
