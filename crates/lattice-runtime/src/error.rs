//! error.rs — erreurs des services runtime (C5/C6).
//!
//! Même forme que l'`Error` natif de la référence du corpus
//! (`NotFound`, `Arity { expected, got }`, `Type(String)`, `Io`, `Msg`),
//! étendue avec les familles d'erreurs propres au système de phases.

/// Erreur renvoyée par les services runtime (tracking, pressure,
/// reactions, bonds, seeds, caches, dispatch natif).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("arity mismatch: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("type error: {0}")]
    Type(String),

    #[error("'{0}' is not tracked — call track() first")]
    NotTracked(String),

    #[error("pressure exhausted for '{0}': no mutation budget left")]
    PressureExhausted(String),

    #[error("seed '{0}' refused to grow: precondition failed")]
    SeedFailure(String),

    #[error("bond gate on '{0}' blocked this mutation")]
    GateFailure(String),

    #[error("{0}")]
    Msg(String),
}

pub type RResult<T> = Result<T, RuntimeError>;
