//! disasm.rs — désassembleur lisible pour [`crate::bytecode::Chunk`].
//!
//! `Chunk::disassemble` couvre le flux d'instructions ; ce module ajoute la
//! vue "résumé" utilisée par les outils de diagnostic (inspection d'un
//! fichier `.latc`, tests d'intégration) : pool de constantes, métadonnées
//! d'arité/variadique, et empreinte de contenu.

use crate::bytecode::chunk::Chunk;

/// Désassemble `chunk` avec son pool de constantes et ses métadonnées de
/// fonction, au-delà du simple flux d'opcodes de `Chunk::disassemble`.
pub fn disassemble_full(chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    out.push_str(&chunk.disassemble(title));
    out.push_str("-- consts --\n");
    for (ix, c) in chunk.consts().iter().enumerate() {
        out.push_str(&format!("  [{ix:>3}] {c}\n"));
    }
    out.push_str(&format!(
        "-- meta -- name={:?} arity={} variadic={} defaults={} params_with_phase={}\n",
        chunk.name,
        chunk.arity,
        chunk.variadic,
        chunk.defaults.len(),
        chunk.param_phases.iter().filter(|p| p.is_some()).count(),
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ConstValue;
    use crate::bytecode::op::Op;

    #[test]
    fn full_dump_contains_consts_and_meta() {
        let mut chunk = Chunk::new(Some("f".into()));
        let k = chunk.add_const(ConstValue::Str("hi".into()));
        chunk.push_op(Op::LoadConst(k), 1);
        chunk.push_op(Op::Return, 1);

        let out = disassemble_full(&chunk, "f");
        assert!(out.contains("LOAD_CONST"));
        assert!(out.contains("\"hi\""));
        assert!(out.contains("name=Some(\"f\")"));
    }
}
