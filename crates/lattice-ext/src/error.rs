//! error.rs — erreurs du chargeur d'extensions (C7, §4.7).

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtError {
    #[error("extension '{0}' not found on the search path")]
    NotFound(String),

    #[error("failed to load '{path}': {message}")]
    LoadFailed { path: String, message: String },

    #[error("extension is missing its init symbol")]
    MissingInitSymbol,

    #[error("extension '{0}' is already loaded")]
    AlreadyLoaded(String),
}

pub type ExtResult<T> = Result<T, ExtError>;
