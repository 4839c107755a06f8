//! value.rs — Le modèle de valeurs dynamique de Lattice.
//!
//! Toute valeur porte deux étiquettes orthogonales à son contenu :
//! - une [`Phase`] (cycle de vie de mutabilité : fluide / cristal / sublimé),
//! - un [`RegionId`] (appartenance à une arène, `None` = tas classique).
//!
//! Les conteneurs (`Array`, `Map`, `Set`, `Struct`, `Buffer`) sont possédés
//! directement — pas de `Rc<RefCell<_>>` façon `Gc<T>` — parce que le
//! contrat observable de Lattice est la **copie sémantique** : deux
//! bindings distincts ne partagent jamais un même conteneur. Seuls
//! `Channel` et `Ref` sont partagés par comptage de références, comme le
//! précise §3.1 de la spécification.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::env::Environment;

/// Étiquette de phase portée par toute valeur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    /// Défaut pour les scalaires non suivis ; équivalent à `Fluid` pour la mutation.
    Unphased,
    /// Mutable en place.
    Fluid,
    /// Immuable ; toute mutation échoue avec une violation de phase.
    Crystal,
    /// Terminal, en lecture seule, exclu des cascades de gel.
    Sublimated,
}

impl Phase {
    /// Nom stable utilisé dans les diagnostics, l'historique et les réactions.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Unphased => "unphased",
            Phase::Fluid => "fluid",
            Phase::Crystal => "crystal",
            Phase::Sublimated => "sublimated",
        }
    }

    /// Une valeur dans cette phase peut-elle être mutée en place ?
    pub fn is_mutable(self) -> bool {
        matches!(self, Phase::Fluid | Phase::Unphased)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifiant d'arène. `None` signifie "tas classique" (pas de libération en bloc).
pub type RegionId = Option<u32>;

/// Chaîne possédée, bon marché à cloner (utilisée pour les clés de struct/map
/// et pour le contenu de `Value::Str`/`Value::Symbol`-like usages).
pub type LatStr = Arc<str>;

/// Construit une [`LatStr`] à partir de n'importe quelle source textuelle.
pub fn lat_str(s: impl AsRef<str>) -> LatStr {
    Arc::from(s.as_ref())
}

/// Table d'internement pour les chaînes courtes du pool de constantes.
///
/// Pas un singleton global : chaque `Runtime`/`Vm` en possède une, pour
/// rester testable et pour ne pas fuir entre exécutions indépendantes.
#[derive(Default)]
pub struct Interner {
    table: Mutex<HashSet<LatStr>>,
}

/// Longueur, en octets, en-deçà de laquelle une chaîne constante est internée.
pub const INTERN_MAX_LEN: usize = 32;

impl Interner {
    /// Crée une table vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interne `s` si elle est courte ; sinon alloue une [`LatStr`] fraîche.
    pub fn intern(&self, s: &str) -> LatStr {
        if s.len() > INTERN_MAX_LEN {
            return lat_str(s);
        }
        let table = self.table.lock();
        if let Some(existing) = table.get(s) {
            return existing.clone();
        }
        drop(table);
        let mut table = self.table.lock();
        let fresh = lat_str(s);
        table.insert(fresh.clone());
        fresh
    }

    /// Nombre de chaînes actuellement internées.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Aucune chaîne internée.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Carte ordonnée clé-chaîne → valeur, ordre d'insertion préservé.
///
/// Implémentée comme `vitte_core::bytecode::chunk::ConstPool` gère son
/// index de dédoublonnage : un vecteur pour l'ordre, une table pour la
/// recherche O(1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedMap {
    entries: Vec<(LatStr, Value)>,
}

impl OrderedMap {
    /// Carte vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insère ou remplace `key`. Conserve la position d'origine sur remplacement.
    pub fn insert(&mut self, key: LatStr, value: Value) -> Option<Value> {
        for entry in &mut self.entries {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    /// Retire `key`, renvoyant sa valeur si présente.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k.as_ref() == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Lecture par clé.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    /// Lecture mutable par clé (pour les stores en place sur valeur fluide).
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    /// Nombre d'entrées.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Carte vide ?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Itère dans l'ordre d'insertion.
    pub fn iter(&self) -> impl Iterator<Item = (&LatStr, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

/// Ensemble ordonné, dédoublonné par la forme `display()` de ses éléments
/// (voir l'Open Question de §9 : la clé reste stable même pour `NaN`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedSet {
    items: Vec<Value>,
    keys: HashSet<String>,
}

impl OrderedSet {
    /// Ensemble vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insère `v`, renvoie `false` si une valeur de même forme d'affichage existait déjà.
    pub fn insert(&mut self, v: Value) -> bool {
        let key = display(&v);
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key);
        self.items.push(v);
        true
    }

    /// Contient-il une valeur de même forme d'affichage que `v` ?
    pub fn contains(&self, v: &Value) -> bool {
        self.keys.contains(&display(v))
    }

    /// Retire la première valeur dont l'affichage correspond à `v`.
    pub fn remove(&mut self, v: &Value) -> bool {
        let key = display(v);
        if !self.keys.remove(&key) {
            return false;
        }
        if let Some(pos) = self.items.iter().position(|it| display(it) == key) {
            self.items.remove(pos);
        }
        true
    }

    /// Nombre d'éléments.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Ensemble vide ?
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Itère dans l'ordre d'insertion.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }
}

/// Struct Lattice : nom + champs parallèles (la recherche est un scan linéaire,
/// les structs sont censées rester petites — voir §3.1).
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub name: LatStr,
    pub field_names: Vec<LatStr>,
    pub field_values: Vec<Value>,
}

impl StructValue {
    /// Construit une struct à partir de paires nom/valeur.
    pub fn new(name: LatStr, fields: Vec<(LatStr, Value)>) -> Self {
        let (field_names, field_values) = fields.into_iter().unzip();
        Self { name, field_names, field_values }
    }

    /// Index du champ `name`, si présent.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|n| n.as_ref() == name)
    }

    /// Lecture d'un champ.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.field_index(name).map(|i| &self.field_values[i])
    }

    /// Écriture mutable d'un champ existant.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        let idx = self.field_index(name)?;
        Some(&mut self.field_values[idx])
    }
}

/// Référence vers un corps compilé. Le crate `lattice-vm` fournit le type
/// concret de chunk ; ici on ne connaît que la forme opaque partagée.
pub type ChunkRef = Arc<dyn std::any::Any + Send + Sync>;

/// Identifiant d'une fonction native enregistrée dans un `Runtime` (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// Identifiant d'une fonction d'extension enregistrée par le loader (C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionId(pub u32);

/// Remplace le sentinel "marker" de la référence (§9, REDESIGN FLAG) par une
/// variante explicite : plus de punning sur le champ "valeurs par défaut".
#[derive(Clone)]
pub enum Dispatch {
    /// Fermeture compilée : le corps est un chunk du front-end.
    Compiled(ChunkRef),
    /// Fonction native C6, résolue via la table du `Runtime`.
    Native(NativeId),
    /// Fonction d'extension C7, résolue via le cache d'extensions.
    Extension(ExtensionId),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Compiled(_) => write!(f, "Compiled(..)"),
            Dispatch::Native(id) => write!(f, "Native({:?})", id),
            Dispatch::Extension(id) => write!(f, "Extension({:?})", id),
        }
    }
}

/// Capture d'une variable qui s'échappe de son cadre d'origine (§3.5).
///
/// Toujours partagée derrière une [`UpvalueCell`] : deux fermetures qui
/// capturent le même emplacement de pile voient la même cellule, donc la
/// même transition `Open` → `Closed` quand le cadre d'origine rend la main.
#[derive(Clone)]
pub enum Upvalue {
    /// Pointe encore vers un emplacement vivant de la pile d'opérandes.
    Open(usize),
    /// Instantané figé, une fois le cadre d'origine revenu.
    Closed(Value),
}

/// Cellule partagée d'upvalue : la VM en garde un exemplaire par emplacement
/// de pile capturé, et toute fermeture qui capture ce même emplacement clone
/// le même `Arc`.
pub type UpvalueCell = Arc<Mutex<Upvalue>>;

impl fmt::Debug for Upvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upvalue::Open(slot) => write!(f, "Open({slot})"),
            Upvalue::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

/// Fermeture : la seule valeur "appelable" de Lattice, qu'elle enveloppe du
/// bytecode compilé, un natif ou une extension (§3.1, §4.6).
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<LatStr>,
    pub defaults: Vec<Value>,
    pub variadic: bool,
    pub dispatch: Dispatch,
    pub upvalues: Vec<UpvalueCell>,
    /// Contrainte de phase déclarée par paramètre, si le chunk en porte une.
    pub param_phases: Option<Vec<Phase>>,
    /// Environnement capturé (utilisé par les back-ends à environnement,
    /// cf. l'interpréteur arbre) ; la VM à pile s'appuie sur `upvalues`.
    pub env: Option<Arc<Environment>>,
    pub name: Option<LatStr>,
}

/// État interne partagé d'un canal (C8). Voir `lattice-runtime::channel` pour
/// les opérations `send`/`recv`/`select` de haut niveau.
pub struct ChannelData {
    pub(crate) queue: Mutex<VecDeque<Value>>,
    pub(crate) capacity: Option<usize>,
    pub(crate) closed: Mutex<bool>,
    pub(crate) not_empty: Condvar,
    pub(crate) not_full: Condvar,
}

/// Erreur renvoyée par une opération de canal (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("send on a closed channel")]
    Closed,
}

impl ChannelData {
    /// Crée un canal, borné si `capacity` est `Some`.
    pub fn new(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            closed: Mutex::new(false),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Envoi bloquant : attend qu'une place se libère si le canal est
    /// borné et plein. Échoue si le canal est (ou devient) fermé.
    pub fn send(&self, value: Value) -> Result<(), ChannelError> {
        let mut queue = self.queue.lock();
        loop {
            if *self.closed.lock() {
                return Err(ChannelError::Closed);
            }
            match self.capacity {
                Some(cap) if queue.len() >= cap => {
                    self.not_full.wait(&mut queue);
                }
                _ => break,
            }
        }
        queue.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Envoi non bloquant : `Ok(Some(()))`-like via `bool` fait moins de
    /// bruit ; renvoie `Ok(())` si accepté, `Err` si fermé ou plein.
    pub fn try_send(&self, value: Value) -> Result<(), TrySendError> {
        if *self.closed.lock() {
            return Err(TrySendError::Closed);
        }
        let mut queue = self.queue.lock();
        if let Some(cap) = self.capacity {
            if queue.len() >= cap {
                return Err(TrySendError::Full);
            }
        }
        queue.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Réception bloquante : `None` une fois le canal fermé et vidé.
    pub fn recv(&self) -> Option<Value> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(v) = queue.pop_front() {
                self.not_full.notify_one();
                return Some(v);
            }
            if *self.closed.lock() {
                return None;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    /// Réception non bloquante.
    pub fn try_recv(&self) -> Option<Value> {
        let mut queue = self.queue.lock();
        let item = queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Ferme le canal : les envois ultérieurs échouent, les lectures
    /// drainent ce qui reste puis renvoient `None`.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Erreur d'un envoi non bloquant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError {
    #[error("channel is full")]
    Full,
    #[error("channel is closed")]
    Closed,
}

impl fmt::Debug for ChannelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.queue.lock().len();
        write!(f, "Channel(len={len}, capacity={:?})", self.capacity)
    }
}

/// Valeur dynamique de Lattice (§3.1).
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(LatStr),
    Array(Vec<Value>),
    Map(OrderedMap),
    Set(OrderedSet),
    Buffer(Vec<u8>),
    Struct(Box<StructValue>),
    Closure(Arc<Closure>),
    Channel(Arc<ChannelData>),
    Ref(Arc<Mutex<Value>>),
    Error(Box<Value>),
}

/// Une valeur avec son étiquette de phase et sa région d'appartenance.
///
/// Le cœur des opérations (`deep_clone`, `equals`, `display`...) porte sur
/// [`Value`] seul ; `Phased` est ce que l'environnement et la VM stockent
/// réellement pour appliquer les invariants de phase de §3.1.
#[derive(Debug, Clone)]
pub struct Phased {
    pub value: Value,
    pub phase: Phase,
    pub region: RegionId,
}

impl Phased {
    /// Construit une valeur non suivie (phase par défaut).
    pub fn new(value: Value) -> Self {
        Self { value, phase: Phase::Unphased, region: None }
    }

    /// Construit avec une phase explicite.
    pub fn with_phase(value: Value, phase: Phase) -> Self {
        Self { value, phase, region: None }
    }
}

/// Erreurs internes au modèle de valeurs (conversions, mutations de phase).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValueError {
    #[error("type error: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: &'static str },

    #[error("phase violation: cannot mutate a {0} value")]
    PhaseViolation(Phase),

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("no field named '{0}'")]
    NoSuchField(String),

    #[error("division by zero")]
    DivisionByZero,
}

impl Value {
    /// Nom de variante pour les messages d'erreur et `repr`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Buffer(_) => "buffer",
            Value::Struct(_) => "struct",
            Value::Closure(_) => "closure",
            Value::Channel(_) => "channel",
            Value::Ref(_) => "ref",
            Value::Error(_) => "error",
        }
    }

    /// `is_truthy` (§4.1) : faux pour Nil, `false`, `0`, `NaN`, et les
    /// conteneurs vides ; vrai sinon.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => !x.is_nan() && *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Set(s) => !s.is_empty(),
            Value::Buffer(b) => !b.is_empty(),
            Value::Struct(_) | Value::Closure(_) | Value::Channel(_) | Value::Ref(_) | Value::Error(_) => true,
        }
    }

    /// Clonage profond (§4.1). Les conteneurs sont recréés récursivement ;
    /// `Channel`/`Ref` partagent par comptage de références ; une `Closure`
    /// conserve son corps et son environnement capturé à l'identique.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Nil => Value::Nil,
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Int(*i),
            Value::Float(x) => Value::Float(*x),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Array(items) => Value::Array(items.iter().map(Value::deep_clone).collect()),
            Value::Map(m) => {
                let mut out = OrderedMap::new();
                for (k, v) in m.iter() {
                    out.insert(k.clone(), v.deep_clone());
                }
                Value::Map(out)
            }
            Value::Set(s) => {
                let mut out = OrderedSet::new();
                for v in s.iter() {
                    out.insert(v.deep_clone());
                }
                Value::Set(out)
            }
            Value::Buffer(b) => Value::Buffer(b.clone()),
            Value::Struct(s) => Value::Struct(Box::new(StructValue {
                name: s.name.clone(),
                field_names: s.field_names.clone(),
                field_values: s.field_values.iter().map(Value::deep_clone).collect(),
            })),
            Value::Closure(c) => Value::Closure(c.clone()),
            Value::Channel(c) => Value::Channel(c.clone()),
            Value::Ref(r) => Value::Ref(r.clone()),
            Value::Error(e) => Value::Error(Box::new(e.deep_clone())),
        }
    }

    /// Égalité structurelle (§4.1) : scalaires par valeur, conteneurs
    /// élément par élément, `Closure`/`Channel`/`Ref` par identité,
    /// `Float` suit IEEE-754 (`NaN != NaN`).
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.equals(bv)))
            }
            (Value::Set(a), Value::Set(b)) => {
                a.len() == b.len() && a.iter().all(|v| b.contains(v))
            }
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => {
                a.name == b.name
                    && a.field_names == b.field_names
                    && a.field_values.len() == b.field_values.len()
                    && a.field_values.iter().zip(&b.field_values).all(|(x, y)| x.equals(y))
            }
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a.equals(b),
            _ => false,
        }
    }
}

/// `display(v)` (§4.1) : forme humaine, sans guillemets sur les chaînes internes.
pub fn display(v: &Value) -> String {
    let mut out = String::new();
    write_display(v, &mut out);
    out
}

fn write_display(v: &Value, out: &mut String) {
    use std::fmt::Write as _;
    match v {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => { let _ = write!(out, "{b}"); }
        Value::Int(i) => { let _ = write!(out, "{i}"); }
        Value::Float(x) => {
            if x.is_nan() {
                out.push_str("NaN");
            } else if x.is_infinite() {
                out.push_str(if *x > 0.0 { "Inf" } else { "-Inf" });
            } else {
                let _ = write!(out, "{x}");
            }
        }
        Value::Str(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 { out.push_str(", "); }
                write_repr(item, out);
            }
            out.push(']');
        }
        Value::Map(m) => {
            out.push('{');
            for (i, (k, val)) in m.iter().enumerate() {
                if i > 0 { out.push_str(", "); }
                let _ = write!(out, "{k}: ");
                write_repr(val, out);
            }
            out.push('}');
        }
        Value::Set(s) => {
            out.push_str("Set{");
            for (i, item) in s.iter().enumerate() {
                if i > 0 { out.push_str(", "); }
                write_repr(item, out);
            }
            out.push('}');
        }
        Value::Buffer(b) => { let _ = write!(out, "buffer[{}]", b.len()); }
        Value::Struct(s) => {
            let _ = write!(out, "{}{{", s.name);
            for (i, (name, val)) in s.field_names.iter().zip(&s.field_values).enumerate() {
                if i > 0 { out.push_str(", "); }
                let _ = write!(out, "{name}: ");
                write_repr(val, out);
            }
            out.push('}');
        }
        Value::Closure(c) => {
            match c.name.as_deref() {
                Some(name) => { let _ = write!(out, "<closure {name}>"); }
                None => out.push_str("<closure>"),
            }
        }
        Value::Channel(_) => out.push_str("<channel>"),
        Value::Ref(r) => {
            out.push_str("ref(");
            let inner = r.lock();
            write_display(&inner, out);
            out.push(')');
        }
        Value::Error(e) => { let _ = write!(out, "error({})", display(e)); }
    }
}

/// `repr(v)` (§4.1) : forme pour programmeur, chaînes entre guillemets.
pub fn repr(v: &Value) -> String {
    let mut out = String::new();
    write_repr(v, &mut out);
    out
}

fn write_repr(v: &Value, out: &mut String) {
    if let Value::Str(s) = v {
        out.push('"');
        for ch in s.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                c => out.push(c),
            }
        }
        out.push('"');
    } else {
        write_display(v, out);
    }
}

/// `freeze(v)` (§3.1) : valeur cristal dont le contenu est un clone profond
/// de `v`. Idempotent sur une valeur déjà cristal (Open Question §9,
/// tranchée côté "no-op").
pub fn freeze(phased: &Phased) -> Phased {
    if phased.phase == Phase::Crystal {
        return phased.clone();
    }
    Phased { value: phased.value.deep_clone(), phase: Phase::Crystal, region: phased.region }
}

/// `thaw(v)` (§3.1) : valeur fluide, toujours un clone profond.
pub fn thaw(phased: &Phased) -> Phased {
    Phased { value: phased.value.deep_clone(), phase: Phase::Fluid, region: phased.region }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_clone_arrays_share_no_storage() {
        let mut a = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        let b = a.deep_clone();
        if let Value::Array(items) = &mut a {
            items.push(Value::Int(3));
        }
        assert_eq!(b, Value::Array(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Float(f64::NAN);
        assert!(!nan.equals(&nan));
    }

    #[test]
    fn freeze_then_thaw_round_trips() {
        let v = Phased::new(Value::Array(vec![Value::Int(1)]));
        let frozen = freeze(&v);
        assert_eq!(frozen.phase, Phase::Crystal);
        let thawed = thaw(&frozen);
        assert_eq!(thawed.phase, Phase::Fluid);
        assert!(thawed.value.equals(&v.value));
    }

    #[test]
    fn freeze_is_idempotent_on_crystal() {
        let v = Phased::with_phase(Value::Int(1), Phase::Crystal);
        let frozen = freeze(&v);
        assert_eq!(frozen.phase, Phase::Crystal);
        assert!(frozen.value.equals(&v.value));
    }

    #[test]
    fn display_has_no_quotes_repr_does() {
        let s = Value::Str(lat_str("hi"));
        assert_eq!(display(&s), "hi");
        assert_eq!(repr(&s), "\"hi\"");
    }

    #[test]
    fn set_dedupes_by_display_form() {
        let mut set = OrderedSet::new();
        assert!(set.insert(Value::Int(1)));
        assert!(!set.insert(Value::Int(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn closure_deep_clone_keeps_identity() {
        let closure = Arc::new(Closure {
            params: vec![],
            defaults: vec![],
            variadic: false,
            dispatch: Dispatch::Native(NativeId(0)),
            upvalues: vec![],
            param_phases: None,
            env: None,
            name: None,
        });
        let v = Value::Closure(closure.clone());
        let cloned = v.deep_clone();
        if let (Value::Closure(a), Value::Closure(b)) = (&v, &cloned) {
            assert!(Arc::ptr_eq(a, b));
        } else {
            panic!("expected closures");
        }
    }
}

// PartialEq delegates to the structural `equals` defined above so that
// `assert_eq!` in tests reads naturally; this is NOT `equals()` itself,
// callers needing Lattice's NaN-sensitive equality should call `equals`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn leaf_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,8}".prop_map(|s| Value::Str(lat_str(s))),
        ]
    }

    fn any_value() -> impl Strategy<Value = Value> {
        leaf_value().prop_recursive(3, 16, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn deep_clone_is_structurally_equal_but_independent(v in any_value()) {
            let cloned = v.deep_clone();
            prop_assert!(v.equals(&cloned));
            if let (Value::Array(mut a), Value::Array(b)) = (v.clone(), cloned) {
                a.push(Value::Int(0));
                prop_assert_ne!(a.len(), b.len());
            }
        }

        #[test]
        fn freeze_then_thaw_preserves_value_and_lands_fluid(v in any_value()) {
            let phased = Phased::new(v.clone());
            let frozen = freeze(&phased);
            prop_assert_eq!(frozen.phase, Phase::Crystal);
            let thawed = thaw(&frozen);
            prop_assert_eq!(thawed.phase, Phase::Fluid);
            prop_assert!(thawed.value.equals(&v));
        }

        #[test]
        fn freeze_is_idempotent(v in any_value()) {
            let once = freeze(&Phased::new(v));
            let twice = freeze(&once);
            prop_assert_eq!(twice.phase, Phase::Crystal);
            prop_assert!(twice.value.equals(&once.value));
        }
    }
}
