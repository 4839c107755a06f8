//! abi.rs — ABI de valeur opaque vue par une extension (C7, §4.7).
//!
//! Une extension ne voit jamais un `lattice_core::value::Value` nu : elle
//! manipule des [`ExtValue`] construits et lus via cette poignée d'accesseurs
//! et de constructeurs. Le chargeur déconstruit/reconstruit le `Value` hôte
//! aux deux bords de l'appel, comme décrit par §4.7 ("the loader deep-clones
//! the wrapper's contents into the host Value on return and frees the
//! wrapper").
//!
//! Convention d'erreur : une extension signale une erreur en renvoyant un
//! [`ExtValue`] construit par [`ext_error`], dont le contenu commence par
//! `EVAL_ERROR:` ; [`crate::loader`] reconnaît ce préfixe et le convertit en
//! propagation d'erreur côté VM, préfixe retiré.

use lattice_core::value::{lat_str, OrderedMap, Value};

pub const ERROR_PREFIX: &str = "EVAL_ERROR:";

/// Wrapper opaque autour d'une valeur hôte. Les champs de `Value` restent
/// privés au crate : une extension ne peut agir qu'à travers les fonctions
/// ci-dessous.
#[derive(Debug, Clone)]
pub struct ExtValue(pub(crate) Value);

/// Étiquette de type interrogeable sans démonter le wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtType {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Array,
    Map,
    Other,
}

impl ExtValue {
    /// Interroge le type sans extraire le contenu.
    pub fn kind(&self) -> ExtType {
        match &self.0 {
            Value::Nil => ExtType::Nil,
            Value::Bool(_) => ExtType::Bool,
            Value::Int(_) => ExtType::Int,
            Value::Float(_) => ExtType::Float,
            Value::Str(_) => ExtType::Str,
            Value::Array(_) => ExtType::Array,
            Value::Map(_) => ExtType::Map,
            _ => ExtType::Other,
        }
    }
}

// --- Accesseurs -------------------------------------------------------

pub fn ext_as_int(v: &ExtValue) -> Option<i64> {
    match v.0 {
        Value::Int(i) => Some(i),
        _ => None,
    }
}

pub fn ext_as_float(v: &ExtValue) -> Option<f64> {
    match v.0 {
        Value::Float(f) => Some(f),
        Value::Int(i) => Some(i as f64),
        _ => None,
    }
}

pub fn ext_as_bool(v: &ExtValue) -> Option<bool> {
    match v.0 {
        Value::Bool(b) => Some(b),
        _ => None,
    }
}

pub fn ext_as_str(v: &ExtValue) -> Option<&str> {
    match &v.0 {
        Value::Str(s) => Some(s),
        _ => None,
    }
}

pub fn ext_array_len(v: &ExtValue) -> Option<usize> {
    match &v.0 {
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

pub fn ext_array_get(v: &ExtValue, index: usize) -> Option<ExtValue> {
    match &v.0 {
        Value::Array(items) => items.get(index).map(|item| ExtValue(item.deep_clone())),
        _ => None,
    }
}

pub fn ext_map_get(v: &ExtValue, key: &str) -> Option<ExtValue> {
    match &v.0 {
        Value::Map(m) => m.get(key).map(|item| ExtValue(item.deep_clone())),
        _ => None,
    }
}

// --- Constructeurs -----------------------------------------------------

pub fn ext_nil() -> ExtValue {
    ExtValue(Value::Nil)
}

pub fn ext_int(i: i64) -> ExtValue {
    ExtValue(Value::Int(i))
}

pub fn ext_float(f: f64) -> ExtValue {
    ExtValue(Value::Float(f))
}

pub fn ext_bool(b: bool) -> ExtValue {
    ExtValue(Value::Bool(b))
}

pub fn ext_str(s: &str) -> ExtValue {
    ExtValue(Value::Str(lat_str(s)))
}

pub fn ext_array(children: Vec<ExtValue>) -> ExtValue {
    ExtValue(Value::Array(children.into_iter().map(ext_into_value).collect()))
}

/// Enveloppe une valeur hôte reçue en argument (§4.7) pour usage avec les
/// accesseurs ci-dessus.
pub fn ext_wrap(value: &Value) -> ExtValue {
    ExtValue(value.deep_clone())
}

/// Dernière étape avant de renvoyer le résultat d'une fonction d'extension :
/// déconstruit le wrapper en la valeur hôte qu'il porte (§4.7, "the loader
/// deep-clones the wrapper's contents into the host Value on return and
/// frees the wrapper" — ici la déconstruction et le clonage coïncident,
/// puisque l'extension et l'hôte partagent le même type `Value`).
pub fn ext_into_value(v: ExtValue) -> Value {
    v.0
}

pub fn ext_map_new() -> ExtValue {
    ExtValue(Value::Map(OrderedMap::new()))
}

/// Pose `key` dans une valeur déjà construite par [`ext_map_new`]. Sans effet
/// (silencieusement ignoré) si `map` n'est pas un wrapper de map — une
/// extension mal écrite ne peut pas ainsi corrompre une autre valeur.
pub fn ext_map_set(map: &mut ExtValue, key: &str, value: ExtValue) {
    if let Value::Map(m) = &mut map.0 {
        m.insert(lat_str(key), value.0);
    }
}

/// Construit une valeur d'erreur reconnue par le chargeur (§4.7).
pub fn ext_error(message: &str) -> ExtValue {
    ExtValue(Value::Str(lat_str(format!("{ERROR_PREFIX}{message}"))))
}

/// Relâche un wrapper explicitement. En Rust, `Drop` s'en charge déjà ; cette
/// fonction existe pour la symétrie avec l'API décrite par §4.7 et pour les
/// extensions qui préfèrent une libération explicite au point d'usage.
pub fn ext_free(_v: ExtValue) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        assert_eq!(ext_as_int(&ext_int(41)), Some(41));
        assert_eq!(ext_as_bool(&ext_bool(true)), Some(true));
        assert_eq!(ext_as_str(&ext_str("hi")), Some("hi"));
    }

    #[test]
    fn array_accessors_read_children() {
        let arr = ext_array(vec![ext_int(1), ext_int(2)]);
        assert_eq!(ext_array_len(&arr), Some(2));
        assert_eq!(ext_as_int(&ext_array_get(&arr, 1).unwrap()), Some(2));
    }

    #[test]
    fn map_set_then_get_round_trips() {
        let mut map = ext_map_new();
        ext_map_set(&mut map, "x", ext_int(9));
        assert_eq!(ext_as_int(&ext_map_get(&map, "x").unwrap()), Some(9));
    }

    #[test]
    fn error_carries_the_recognized_prefix() {
        let e = ext_error("bad argument");
        assert_eq!(ext_as_str(&e), Some("EVAL_ERROR:bad argument"));
    }
}
