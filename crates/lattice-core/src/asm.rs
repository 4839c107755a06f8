//! asm.rs — petit assembleur texte → [`Chunk`] (outillage de test/diagnostic).
//!
//! Il n'implémente ni lexer ni grammaire de surface pour Lattice : c'est un
//! format d'instructions une-par-ligne qui permet aux tests de `lattice-vm`
//! de construire des chunks sans dépendre d'un compilateur, dans le même
//! esprit que `vitte_core::asm` (résolution d'étiquettes en deux passes,
//! directives `.xxx` pour les métadonnées du chunk).
//!
//! Grammaire, une instruction par ligne (commentaires `;` jusqu'à fin de ligne) :
//!
//! ```text
//! .name add_one
//! .arity 1
//! load_local 0
//! load_const 0   ; index dans le pool de constantes déclaré via .const
//! add
//! return
//! ```

use crate::bytecode::chunk::{Chunk, ConstValue};
use crate::bytecode::op::Op;

/// Erreur d'assemblage, avec la ligne source en cause.
#[derive(Debug, Clone, thiserror::Error)]
#[error("asm error at line {line}: {msg}")]
pub struct AsmError {
    pub line: usize,
    pub msg: String,
}

fn err(line: usize, msg: impl Into<String>) -> AsmError {
    AsmError { line, msg: msg.into() }
}

/// Assemble un programme texte en [`Chunk`] exécutable.
pub fn assemble(source: &str) -> Result<Chunk, AsmError> {
    let mut chunk = Chunk::new(None);
    let mut labels = std::collections::HashMap::new();
    let mut pending_jumps = Vec::new();

    let lines: Vec<&str> = source.lines().collect();

    // Première passe : repère les étiquettes `label:` et leur pc.
    let mut pc = 0u32;
    for raw in &lines {
        let line = strip_comment(raw).trim();
        if line.is_empty() || line.starts_with('.') {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            labels.insert(label.trim().to_string(), pc);
            continue;
        }
        pc += 1;
    }

    // Seconde passe : émet les opcodes, résout les constantes et directives.
    for (lineno, raw) in lines.iter().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() || line.ends_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('.') {
            apply_directive(&mut chunk, rest, lineno)?;
            continue;
        }

        let mut parts = line.split_whitespace();
        let mnemonic = parts.next().unwrap();
        let arg = parts.next();

        let op = match mnemonic {
            "nop" => Op::Nop,
            "return" => Op::Return,
            "return_void" => Op::ReturnVoid,
            "load_nil" => Op::LoadNil,
            "load_true" => Op::LoadTrue,
            "load_false" => Op::LoadFalse,
            "pop" => Op::Pop,
            "dup" => Op::Dup,
            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "div" => Op::Div,
            "mod" => Op::Mod,
            "neg" => Op::Neg,
            "not" => Op::Not,
            "eq" => Op::Eq,
            "ne" => Op::Ne,
            "lt" => Op::Lt,
            "le" => Op::Le,
            "gt" => Op::Gt,
            "ge" => Op::Ge,
            "index" => Op::Index,
            "index_set" => Op::IndexSet(parse_u32(arg, lineno)?),
            "freeze" => Op::Freeze(parse_u32(arg, lineno)?),
            "thaw" => Op::Thaw(parse_u32(arg, lineno)?),
            "try_end" => Op::TryEnd,
            "throw" => Op::Throw,
            "print" => Op::Print,
            "load_const" => Op::LoadConst(parse_u32(arg, lineno)?),
            "load_local" => Op::LoadLocal(parse_u16(arg, lineno)?),
            "store_local" => Op::StoreLocal(parse_u16(arg, lineno)?),
            "load_upvalue" => Op::LoadUpvalue(parse_u16(arg, lineno)?),
            "store_upvalue" => Op::StoreUpvalue(parse_u16(arg, lineno)?),
            "load_global" => Op::LoadGlobal(parse_u32(arg, lineno)?),
            "store_global" => Op::StoreGlobal(parse_u32(arg, lineno)?),
            "define_global" => Op::DefineGlobal(parse_u32(arg, lineno)?),
            "get_field" => Op::GetField(parse_u32(arg, lineno)?),
            "set_field" => Op::SetField(parse_u32(arg, lineno)?),
            "require" => Op::Require(parse_u32(arg, lineno)?),
            "new_array" => Op::NewArray(parse_u16(arg, lineno)?),
            "new_map" => Op::NewMap(parse_u16(arg, lineno)?),
            "new_set" => Op::NewSet(parse_u16(arg, lineno)?),
            "call" => Op::Call(parse_u8(arg, lineno)?),
            "tail_call" => Op::TailCall(parse_u8(arg, lineno)?),
            "close_upvalue" => Op::CloseUpvalue(parse_u16(arg, lineno)?),
            "jump" => Op::Jump(resolve_jump(&labels, arg, chunk.len() as u32, lineno)?),
            "jump_if_false" => Op::JumpIfFalse(resolve_jump(&labels, arg, chunk.len() as u32, lineno)?),
            "jump_if_true" => Op::JumpIfTrue(resolve_jump(&labels, arg, chunk.len() as u32, lineno)?),
            "try_begin" => Op::TryBegin(resolve_jump(&labels, arg, chunk.len() as u32, lineno)?),
            "make_closure" => {
                let func = parse_u32(arg, lineno)?;
                let n = parse_u8(parts.next(), lineno)?;
                Op::MakeClosure(func, n)
            }
            other => return Err(err(lineno, format!("unknown mnemonic '{other}'"))),
        };
        if matches!(op, Op::Jump(_) | Op::JumpIfFalse(_) | Op::JumpIfTrue(_) | Op::TryBegin(_)) {
            pending_jumps.push(chunk.len() as u32);
        }
        chunk.push_op(op, lineno as u32);
    }

    Ok(chunk)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(ix) => &line[..ix],
        None => line,
    }
}

fn resolve_jump(
    labels: &std::collections::HashMap<String, u32>,
    arg: Option<&str>,
    current_pc: u32,
    lineno: usize,
) -> Result<i32, AsmError> {
    let name = arg.ok_or_else(|| err(lineno, "missing jump target"))?;
    let target = *labels.get(name).ok_or_else(|| err(lineno, format!("undefined label '{name}'")))?;
    Ok(target as i64 as i32 - current_pc as i64 as i32)
}

fn parse_u32(arg: Option<&str>, lineno: usize) -> Result<u32, AsmError> {
    arg.ok_or_else(|| err(lineno, "missing integer operand"))?
        .parse()
        .map_err(|_| err(lineno, "expected an integer operand"))
}

fn parse_u16(arg: Option<&str>, lineno: usize) -> Result<u16, AsmError> {
    arg.ok_or_else(|| err(lineno, "missing integer operand"))?
        .parse()
        .map_err(|_| err(lineno, "expected an integer operand"))
}

fn parse_u8(arg: Option<&str>, lineno: usize) -> Result<u8, AsmError> {
    arg.ok_or_else(|| err(lineno, "missing integer operand"))?
        .parse()
        .map_err(|_| err(lineno, "expected an integer operand"))
}

fn apply_directive(chunk: &mut Chunk, rest: &str, lineno: usize) -> Result<(), AsmError> {
    let mut parts = rest.split_whitespace();
    let name = parts.next().ok_or_else(|| err(lineno, "empty directive"))?;
    match name {
        "name" => {
            chunk.name = Some(parts.collect::<Vec<_>>().join(" "));
        }
        "arity" => {
            chunk.arity = parts
                .next()
                .ok_or_else(|| err(lineno, "missing arity value"))?
                .parse()
                .map_err(|_| err(lineno, "expected an integer arity"))?;
        }
        "variadic" => chunk.variadic = true,
        "const_int" => {
            let v: i64 = parts
                .next()
                .ok_or_else(|| err(lineno, "missing int constant"))?
                .parse()
                .map_err(|_| err(lineno, "expected an integer constant"))?;
            chunk.add_const(ConstValue::Int(v));
        }
        "const_float" => {
            let v: f64 = parts
                .next()
                .ok_or_else(|| err(lineno, "missing float constant"))?
                .parse()
                .map_err(|_| err(lineno, "expected a float constant"))?;
            chunk.add_const(ConstValue::Float(v));
        }
        "const_str" => {
            let text = rest.trim_start_matches("const_str").trim();
            let unquoted = text.trim_matches('"').to_string();
            chunk.add_const(ConstValue::Str(unquoted));
        }
        "const_nil" => {
            chunk.add_const(ConstValue::Nil);
        }
        other => return Err(err(lineno, format!("unknown directive '.{other}'"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_simple_arithmetic() {
        let src = ".name add_one\n.arity 1\n.const_int 1\nload_local 0\nload_const 0\nadd\nreturn\n";
        let chunk = assemble(src).expect("assembles");
        assert_eq!(chunk.name.as_deref(), Some("add_one"));
        assert_eq!(chunk.arity, 1);
        assert_eq!(chunk.ops().len(), 4);
    }

    #[test]
    fn resolves_forward_and_backward_labels() {
        let src = "loop:\nload_true\njump_if_false end\njump loop\nend:\nreturn\n";
        let chunk = assemble(src).expect("assembles");
        assert!(matches!(chunk.ops()[1], Op::JumpIfFalse(_)));
        assert!(matches!(chunk.ops()[2], Op::Jump(_)));
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        assert!(assemble("bogus_op\n").is_err());
    }
}
