//! lattice-ext — chargeur d'extensions dynamiques et ABI de valeur opaque (C7).
//!
//! Une extension est une bibliothèque partagée exportant un symbole fixe
//! (voir [`loader::INIT_SYMBOL`]) qui enregistre ses fonctions auprès d'un
//! [`loader::RegistrationContext`]. Le chargeur les transfère ensuite dans
//! la [`lattice_runtime::NativeRegistry`] de l'hôte : une fonction
//! d'extension est appelée exactement comme un natif C6, par
//! [`lattice_core::value::NativeId`], sans table d'indirection séparée.

pub mod abi;
pub mod error;
pub mod loader;

pub use abi::{
    ext_array, ext_array_get, ext_array_len, ext_as_bool, ext_as_float, ext_as_int, ext_as_str,
    ext_bool, ext_error, ext_float, ext_free, ext_int, ext_into_value, ext_map_get, ext_map_new,
    ext_map_set, ext_nil, ext_str, ext_wrap, ExtType, ExtValue, ERROR_PREFIX,
};
pub use error::{ExtError, ExtResult};
pub use loader::{ExtensionLoader, InitFn, RegistrationContext, INIT_SYMBOL};
