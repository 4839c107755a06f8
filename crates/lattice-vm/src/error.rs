//! error.rs — erreurs de la VM à pile (C4, §4.4 [AMBIENT]).
//!
//! Même ensemble de variantes que `vitte_vm::VmError`, étendu avec les
//! familles d'erreurs propres au système de phases et à `lattice-runtime`.

use lattice_core::value::ValueError;
use lattice_runtime::RuntimeError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("call stack overflow")]
    CallStackOverflow,

    #[error("call stack underflow")]
    CallStackUnderflow,

    #[error("type error: {0}")]
    TypeError(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("out of gas")]
    OutOfGas,

    #[error("phase violation: {0}")]
    PhaseViolation(String),

    #[error("arity mismatch: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("uncaught error: {0}")]
    Uncaught(String),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type VmResult<T> = Result<T, VmError>;
