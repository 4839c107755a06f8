//! options.rs — configuration de la VM (§4.4 [AMBIENT]).
//!
//! Même charpente que `vitte_vm::VmOptions` : un seul struct de limites,
//! construit par méthodes chaînables plutôt que par un constructeur à
//! dix paramètres positionnels.

/// Limites et réglages d'une exécution de VM.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    pub stack_limit: usize,
    pub call_stack_limit: usize,
    /// `None` = pas de limite de "gas" (mesure de pas d'exécution).
    pub gas_limit: Option<u64>,
    pub trace: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { stack_limit: 4096, call_stack_limit: 256, gas_limit: None, trace: false }
    }
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn with_call_stack_limit(mut self, limit: usize) -> Self {
        self.call_stack_limit = limit;
        self
    }

    pub fn with_gas_limit(mut self, limit: u64) -> Self {
        self.gas_limit = Some(limit);
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}
