//! chunk.rs — format de chunk persistable (C3, §3.3/§6).
//!
//! Reprend la charpente de `vitte_core::bytecode::chunk::Chunk` : un en-tête
//! avec magie + version + hachage de contenu, un pool de constantes
//! dédoublonnant les chaînes, une table de lignes en RLE, et un
//! `to_bytes`/`from_bytes` via `bincode` qui refuse tout fichier dont le
//! hachage ou la version ne correspond pas.

use std::fmt;
use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options as _;
use serde::{Deserialize, Serialize};

use crate::bytecode::op::Op;
use crate::value::Phase;

pub const CHUNK_MAGIC: [u8; 4] = *b"LATC";
pub const CHUNK_VERSION: u16 = 1;

/// Marqueurs optionnels portés par un chunk persisté.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFlags {
    /// Les tables de debug (noms de locales, fichier source) ont été retirées.
    pub stripped: bool,
}

/// Décrit comment une fonction imbriquée capture une upvalue (§3.5) : soit
/// une locale du cadre englobant (`is_local = true`, `index` = emplacement
/// relatif à la base de ce cadre), soit une upvalue déjà capturée par la
/// fermeture englobante elle-même (`is_local = false`, `index` dans son
/// propre tableau `upvalues`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u8,
}

/// Une constante du pool (§3.3). Les chaînes sont dédoublonnées par
/// [`ConstPool`] avant d'être poussées ici.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Nil => write!(f, "nil"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Int(i) => write!(f, "{i}"),
            ConstValue::Float(x) => {
                if x.is_nan() {
                    write!(f, "NaN")
                } else if x.is_infinite() {
                    write!(f, "{}Inf", if *x < 0.0 { "-" } else { "" })
                } else {
                    write!(f, "{x}")
                }
            }
            ConstValue::Str(s) => write!(f, "{s:?}"),
            ConstValue::Bytes(b) => write!(f, "bytes[{}]", b.len()),
        }
    }
}

/// Pool de constantes, chaînes dédoublonnées via un index auxiliaire non
/// sérialisé (reconstruit au chargement, exactement comme
/// `vitte_core::ConstPool::rebuild_string_index`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstPool {
    values: Vec<ConstValue>,
    #[serde(skip)]
    str_index: ahash::AHashMap<String, u32>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute une constante, dédoublonnant les chaînes identiques.
    pub fn add(&mut self, value: ConstValue) -> u32 {
        if let ConstValue::Str(s) = &value {
            if let Some(&ix) = self.str_index.get(s) {
                return ix;
            }
            let ix = self.values.len() as u32;
            self.str_index.insert(s.clone(), ix);
            self.values.push(value);
            return ix;
        }
        let ix = self.values.len() as u32;
        self.values.push(value);
        ix
    }

    pub fn get(&self, ix: u32) -> Option<&ConstValue> {
        self.values.get(ix as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstValue> {
        self.values.iter()
    }

    /// Reconstruit l'index de dédoublonnage des chaînes après désérialisation.
    pub fn rebuild_string_index(&mut self) {
        self.str_index.clear();
        for (ix, v) in self.values.iter().enumerate() {
            if let ConstValue::Str(s) = v {
                self.str_index.insert(s.clone(), ix as u32);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LineRun {
    start_pc: u32,
    line: u32,
    len: u32,
}

/// Table ligne-de-code ↔ position, encodée en runs pour rester compacte
/// même sur de gros chunks générés ligne par ligne.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre que l'instruction au `pc` courant provient de `line`.
    pub fn push_line(&mut self, pc: u32, line: u32) {
        if let Some(last) = self.runs.last_mut() {
            if last.line == line && last.start_pc + last.len == pc {
                last.len += 1;
                return;
            }
        }
        self.runs.push(LineRun { start_pc: pc, line, len: 1 });
    }

    /// Ligne source associée à `pc`, si connue.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.runs
            .iter()
            .find(|r| pc >= r.start_pc && pc < r.start_pc + r.len)
            .map(|r| r.line)
    }

    pub fn iter_ranges(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.runs.iter().map(|r| (r.start_pc, r.start_pc + r.len, r.line))
    }
}

/// Table de débogage optionnelle (noms de locales, fichier d'origine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub source_file: Option<String>,
    /// `(slot, nom)` pour les locales nommées — absent si `ChunkFlags::stripped`.
    pub local_names: Vec<(u16, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkHeader {
    magic: [u8; 4],
    version: u16,
    flags: ChunkFlags,
    created_unix_secs: u64,
    hash_fnv1a_64: u64,
}

/// Le corps d'une fonction compilée, prêt à être exécuté par la VM ou
/// persisté sur disque (§3.3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    header: ChunkHeader,
    ops: Vec<Op>,
    consts: ConstPool,
    lines: LineTable,
    debug: DebugInfo,
    pub name: Option<String>,
    pub arity: u8,
    /// Valeurs par défaut pour les derniers `defaults.len()` paramètres.
    pub defaults: Vec<ConstValue>,
    pub variadic: bool,
    /// Contrainte de phase par paramètre, alignée sur `arity` (+1 si `variadic`).
    pub param_phases: Vec<Option<Phase>>,
    /// Fonctions imbriquées, indexées par `FuncIx` (`MAKE_CLOSURE`, §3.5).
    functions: Vec<Chunk>,
    /// Descripteurs de capture, un par upvalue que CE chunk capture de son
    /// cadre englobant quand il est instancié en fermeture.
    pub upvalues: Vec<UpvalueDesc>,
}

/// Erreurs de chargement d'un chunk persisté (§6).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChunkLoadError {
    #[error("malformed chunk bytes: {0}")]
    Bincode(String),

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported chunk version: expected {expected}, found {found}")]
    BadVersion { expected: u16, found: u16 },

    #[error("content hash mismatch: expected {expected:016x}, found {found:016x}")]
    BadHash { expected: u64, found: u64 },
}

struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self { state: Self::OFFSET_BASIS }
    }
}

impl Hasher for Fnv1a64 {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= u64::from(b);
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Vue sérialisable du contenu hachable d'un chunk (tout sauf l'en-tête).
#[derive(Serialize)]
struct HashableView<'a> {
    ops: &'a [Op],
    consts: &'a [ConstValue],
    lines: &'a [(u32, u32, u32)],
    debug: &'a DebugInfo,
    functions: &'a [Chunk],
    upvalues: &'a [UpvalueDesc],
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding().with_little_endian()
}

impl Chunk {
    /// Chunk vide, sans paramètres, prêt à recevoir des opcodes.
    pub fn new(name: Option<String>) -> Self {
        Self {
            header: ChunkHeader {
                magic: CHUNK_MAGIC,
                version: CHUNK_VERSION,
                flags: ChunkFlags::default(),
                created_unix_secs: now_unix(),
                hash_fnv1a_64: 0,
            },
            ops: Vec::new(),
            consts: ConstPool::new(),
            lines: LineTable::new(),
            debug: DebugInfo::default(),
            name,
            arity: 0,
            defaults: Vec::new(),
            variadic: false,
            param_phases: Vec::new(),
            functions: Vec::new(),
            upvalues: Vec::new(),
        }
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn flags(&self) -> ChunkFlags {
        self.header.flags
    }

    pub fn set_flags(&mut self, flags: ChunkFlags) {
        self.header.flags = flags;
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn consts(&self) -> &ConstPool {
        &self.consts
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    pub fn debug(&self) -> &DebugInfo {
        &self.debug
    }

    pub fn debug_mut(&mut self) -> &mut DebugInfo {
        &mut self.debug
    }

    /// Ajoute une instruction à la position `line` du fichier source.
    pub fn push_op(&mut self, op: Op, line: u32) -> u32 {
        let pc = self.ops.len() as u32;
        self.lines.push_line(pc, line);
        self.ops.push(op);
        pc
    }

    pub fn add_const(&mut self, value: ConstValue) -> u32 {
        self.consts.add(value)
    }

    pub fn const_at(&self, ix: u32) -> Option<&ConstValue> {
        self.consts.get(ix)
    }

    /// Ajoute une fonction imbriquée, renvoyant le `FuncIx` à utiliser dans
    /// `MAKE_CLOSURE`.
    pub fn add_function(&mut self, function: Chunk) -> u32 {
        let ix = self.functions.len() as u32;
        self.functions.push(function);
        ix
    }

    pub fn function_at(&self, ix: u32) -> Option<&Chunk> {
        self.functions.get(ix as usize)
    }

    /// Déclare une capture, dans l'ordre où `MAKE_CLOSURE` les attend.
    pub fn add_upvalue(&mut self, desc: UpvalueDesc) -> u8 {
        let ix = self.upvalues.len() as u8;
        self.upvalues.push(desc);
        ix
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn hashable_lines(&self) -> Vec<(u32, u32, u32)> {
        self.lines.iter_ranges().collect()
    }

    /// Calcule le hachage FNV-1a du contenu (hors en-tête) du chunk.
    pub fn compute_hash(&self) -> u64 {
        let view = HashableView {
            ops: &self.ops,
            consts: &self.consts.values,
            lines: &self.hashable_lines(),
            debug: &self.debug,
            functions: &self.functions,
            upvalues: &self.upvalues,
        };
        let bytes = bincode_options().serialize(&view).expect("chunk content always serializes");
        let mut hasher = Fnv1a64::new();
        hasher.write(&bytes);
        hasher.finish()
    }

    /// Fige l'en-tête avant sérialisation (hachage, horodatage).
    pub fn finalize_header(&mut self) {
        self.header.created_unix_secs = now_unix();
        self.header.hash_fnv1a_64 = self.compute_hash();
    }

    /// Sérialise le chunk. Appelle [`Chunk::finalize_header`] d'abord si le
    /// hachage n'a encore jamais été calculé.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut me = self.clone();
        me.finalize_header();
        bincode_options().serialize(&me).expect("chunk always serializes")
    }

    /// Désérialise et vérifie magie, version et hachage de contenu.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkLoadError> {
        let mut chunk: Chunk =
            bincode_options().deserialize(bytes).map_err(|e| ChunkLoadError::Bincode(e.to_string()))?;
        if chunk.header.magic != CHUNK_MAGIC {
            return Err(ChunkLoadError::BadMagic);
        }
        if chunk.header.version != CHUNK_VERSION {
            return Err(ChunkLoadError::BadVersion { expected: CHUNK_VERSION, found: chunk.header.version });
        }
        let expected = chunk.header.hash_fnv1a_64;
        let found = chunk.compute_hash();
        if expected != found {
            return Err(ChunkLoadError::BadHash { expected, found });
        }
        chunk.consts.rebuild_string_index();
        Ok(chunk)
    }

    /// Désassemblage texte lisible, utilisé par les tests et les outils de diagnostic.
    pub fn disassemble(&self, title: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("== {title} ==\n"));
        for (pc, op) in self.ops.iter().enumerate() {
            let pc = pc as u32;
            let line = self.lines.line_for_pc(pc).unwrap_or(0);
            out.push_str(&format!("{pc:04} L{line:<4} {}\n", fmt_op(op, &self.consts)));
        }
        out
    }
}

fn fmt_op(op: &Op, consts: &ConstPool) -> String {
    use crate::bytecode::op::OperandKind;
    match op.operand_kind() {
        OperandKind::Const => {
            let ix = extract_const_index(op);
            match consts.get(ix) {
                Some(c) => format!("{:<14} {ix:>4} ; {c}", op.mnemonic()),
                None => format!("{:<14} {ix:>4} ; <invalid>", op.mnemonic()),
            }
        }
        _ => format!("{op}"),
    }
}

fn extract_const_index(op: &Op) -> u32 {
    match op {
        Op::LoadConst(i) | Op::LoadGlobal(i) | Op::StoreGlobal(i) | Op::GetField(i) | Op::SetField(i)
        | Op::Require(i) | Op::Freeze(i) | Op::Thaw(i) | Op::IndexSet(i) | Op::DefineGlobal(i) => *i,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut chunk = Chunk::new(Some("main".into()));
        let k = chunk.add_const(ConstValue::Int(41));
        chunk.push_op(Op::LoadConst(k), 1);
        chunk.push_op(Op::Return, 1);

        let bytes = chunk.to_bytes();
        let back = Chunk::from_bytes(&bytes).expect("valid chunk round-trips");
        assert_eq!(back.ops(), chunk.ops());
        assert_eq!(back.const_at(k), Some(&ConstValue::Int(41)));
    }

    #[test]
    fn corrupted_hash_is_rejected() {
        let mut chunk = Chunk::new(None);
        chunk.push_op(Op::Return, 1);
        let mut bytes = chunk.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(Chunk::from_bytes(&bytes).is_err());
    }

    #[test]
    fn string_consts_are_deduped() {
        let mut pool = ConstPool::new();
        let a = pool.add(ConstValue::Str("hi".into()));
        let b = pool.add(ConstValue::Str("hi".into()));
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn disassemble_mentions_mnemonics() {
        let mut chunk = Chunk::new(None);
        chunk.push_op(Op::LoadNil, 3);
        let text = chunk.disassemble("t");
        assert!(text.contains("LOAD_NIL"));
    }
}
