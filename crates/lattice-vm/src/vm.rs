//! vm.rs — la VM à pile, moteur d'exécution canonique de Lattice (C4, §4.4).
//!
//! Généralisation de la boucle `vitte_vm::Vm::run` (pile d'opérandes,
//! `CallFrame`, `push`/`pop`/`peek` bornés, gas limiting) vers le jeu
//! d'instructions fixe de Lattice (§4.3) : dispatch explicite sur
//! `Compiled`/`Native`/`Extension` (C6), arité + valeurs par défaut +
//! variadique, contraintes de phase par paramètre, `TRY_BEGIN`/`THROW`,
//! et les opcodes propres au système de phases (`FREEZE`/`THAW`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use lattice_core::bytecode::{Chunk, ConstValue, Op};
use lattice_core::value::{self, Closure, Dispatch, NativeId, Phase, Phased, Upvalue, UpvalueCell, Value};
use lattice_runtime::{BuiltinIds, CascadeEffect, MutationKind, Runtime, RuntimeError};

use crate::error::{VmError, VmResult};
use crate::frame::{CallFrame, TryHandler};
use crate::options::VmOptions;

/// La VM à pile. Porte son propre état d'exécution (pile, cadres,
/// gestionnaires `try`, globales) ; les services de phase vivent dans le
/// [`Runtime`] partagé qu'on lui fournit à la construction.
pub struct Vm {
    stack: Vec<Phased>,
    frames: Vec<CallFrame>,
    handlers: Vec<TryHandler>,
    globals: HashMap<String, Phased>,
    /// Upvalues encore ouvertes, par emplacement absolu de pile (§3.5). Deux
    /// fermetures qui capturent le même emplacement se partagent la même
    /// cellule tant qu'elle n'a pas été fermée.
    open_upvalues: Vec<(usize, UpvalueCell)>,
    runtime: Arc<Runtime>,
    options: VmOptions,
    gas_left: Option<u64>,
}

/// Construit la valeur-fermeture qui expose un natif `id` sous `name`,
/// pour `define_builtin_globals`.
fn native_closure(name: &str, params: &[&str], id: NativeId) -> Phased {
    Phased::new(Value::Closure(Arc::new(Closure {
        params: params.iter().map(|p| value::lat_str(*p)).collect(),
        defaults: vec![],
        variadic: false,
        dispatch: Dispatch::Native(id),
        upvalues: vec![],
        param_phases: None,
        env: None,
        name: Some(value::lat_str(name)),
    })))
}

fn const_to_value(c: &ConstValue) -> Value {
    match c {
        ConstValue::Nil => Value::Nil,
        ConstValue::Bool(b) => Value::Bool(*b),
        ConstValue::Int(i) => Value::Int(*i),
        ConstValue::Float(f) => Value::Float(*f),
        ConstValue::Str(s) => Value::Str(value::lat_str(s)),
        ConstValue::Bytes(b) => Value::Buffer(b.clone()),
    }
}

enum StepOutcome {
    Continue,
    Returned(Phased),
}

impl Vm {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_options(runtime, VmOptions::default())
    }

    pub fn with_options(runtime: Arc<Runtime>, options: VmOptions) -> Self {
        let gas_left = options.gas_limit;
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            runtime,
            options,
            gas_left,
        }
    }

    pub fn define_global(&mut self, name: impl Into<String>, value: Phased) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<&Phased> {
        self.globals.get(name)
    }

    /// Expose les natifs de service C5 (`track`, `history`, `phases`,
    /// `rewind`, `pressurize`, `depressurize`, `pressure_of`, `on_phase`,
    /// `bond`, `seed`, `grow`) comme globales appelables, une fois
    /// enregistrés dans la table native du runtime par [`lattice_runtime::builtins::register`].
    pub fn define_builtin_globals(&mut self, ids: &BuiltinIds) {
        self.define_global("track", native_closure("track", &["name"], ids.track));
        self.define_global("history", native_closure("history", &["name"], ids.history));
        self.define_global("phases", native_closure("phases", &["name"], ids.phases));
        self.define_global("rewind", native_closure("rewind", &["name", "steps"], ids.rewind));
        self.define_global("pressurize", native_closure("pressurize", &["name", "mode"], ids.pressurize));
        self.define_global("depressurize", native_closure("depressurize", &["name"], ids.depressurize));
        self.define_global("pressure_of", native_closure("pressure_of", &["name"], ids.pressure_of));
        self.define_global("on_phase", native_closure("on_phase", &["name", "phase", "reaction"], ids.on_phase));
        self.define_global("bond", native_closure("bond", &["source", "target", "strategy"], ids.bond));
        self.define_global("seed", native_closure("seed", &["name", "guard"], ids.seed));
        self.define_global("grow", native_closure("grow", &["name", "current"], ids.grow));
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Empile une valeur de départ avant `run` (utilisé par les tests et par
    /// les appelants qui préparent des arguments de plus haut niveau).
    pub fn push(&mut self, value: Phased) -> VmResult<()> {
        if self.stack.len() >= self.options.stack_limit {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Phased> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self, back: usize) -> VmResult<&Phased> {
        let len = self.stack.len();
        if back >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(&self.stack[len - 1 - back])
    }

    fn tick_gas(&mut self) -> VmResult<()> {
        if let Some(left) = &mut self.gas_left {
            if *left == 0 {
                return Err(VmError::OutOfGas);
            }
            *left -= 1;
        }
        Ok(())
    }

    /// Exécute `chunk` comme programme de plus haut niveau et renvoie sa
    /// dernière valeur (ou `Nil` si le chunk se termine par `RETURN_VOID`).
    pub fn run(&mut self, chunk: Arc<Chunk>) -> VmResult<Phased> {
        tracing::debug!(target: "lattice_vm", name = ?chunk.name, "starting chunk execution");
        if self.frames.len() >= self.options.call_stack_limit {
            return Err(VmError::CallStackOverflow);
        }
        let base = self.stack.len();
        self.frames.push(CallFrame::new(chunk, base));
        self.run_loop()
    }

    fn run_loop(&mut self) -> VmResult<Phased> {
        let entry_frame_depth = self.frames.len() - 1;
        loop {
            self.tick_gas()?;
            let op = {
                let frame = self.frames.last().ok_or(VmError::CallStackUnderflow)?;
                let Some(op) = frame.chunk.ops().get(frame.ip).cloned() else {
                    return Err(VmError::Unsupported("ip ran past end of chunk".into()));
                };
                if self.options.trace {
                    let line = frame.chunk.lines().line_for_pc(frame.ip as u32).unwrap_or(0);
                    tracing::trace!(target: "lattice_vm", %op, line, "step");
                }
                op
            };
            self.frames.last_mut().ok_or(VmError::CallStackUnderflow)?.ip += 1;

            match self.step(&op) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Returned(value)) => {
                    if self.frames.len() == entry_frame_depth + 1 {
                        self.frames.pop();
                        return Ok(value);
                    }
                    self.frames.pop();
                    self.push(value)?;
                }
                Err(e) => {
                    if let Some(handled) = self.unwind_to_handler(&e)? {
                        self.push(handled)?;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn unwind_to_handler(&mut self, e: &VmError) -> VmResult<Option<Phased>> {
        let Some(handler) = self.handlers.pop() else { return Ok(None) };
        self.frames.truncate(handler.frame_depth);
        self.stack.truncate(handler.stack_depth);
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = handler.target_ip;
        } else {
            return Ok(None);
        }
        let err_value = Value::Error(Box::new(Value::Str(value::lat_str(e.to_string()))));
        Ok(Some(Phased::new(err_value)))
    }

    fn current_chunk(&self) -> VmResult<&Arc<Chunk>> {
        Ok(&self.frames.last().ok_or(VmError::CallStackUnderflow)?.chunk)
    }

    fn step(&mut self, op: &Op) -> VmResult<StepOutcome> {
        match op {
            Op::Nop => {}
            Op::Return => {
                let v = self.pop()?;
                let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
                self.close_upvalues_from(base);
                self.stack.truncate(base);
                return Ok(StepOutcome::Returned(v));
            }
            Op::ReturnVoid => {
                let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
                self.close_upvalues_from(base);
                self.stack.truncate(base);
                return Ok(StepOutcome::Returned(Phased::new(Value::Nil)));
            }
            Op::LoadConst(ix) => {
                let c = self
                    .current_chunk()?
                    .const_at(*ix)
                    .ok_or_else(|| VmError::Unsupported(format!("bad const index {ix}")))?
                    .clone();
                self.push(Phased::new(const_to_value(&c)))?;
            }
            Op::LoadNil => self.push(Phased::new(Value::Nil))?,
            Op::LoadTrue => self.push(Phased::new(Value::Bool(true)))?,
            Op::LoadFalse => self.push(Phased::new(Value::Bool(false)))?,
            Op::LoadLocal(slot) => {
                let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
                let v = self.stack.get(base + *slot as usize).cloned().ok_or(VmError::StackUnderflow)?;
                self.push(v)?;
            }
            Op::StoreLocal(slot) => {
                let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
                let v = self.pop()?;
                let idx = base + *slot as usize;
                if idx >= self.stack.len() {
                    return Err(VmError::StackUnderflow);
                }
                if !self.stack[idx].phase.is_mutable() {
                    return Err(VmError::PhaseViolation(format!("cannot store into a {} local", self.stack[idx].phase)));
                }
                self.stack[idx] = v.clone();
                self.push(v)?;
            }
            Op::LoadUpvalue(ix) => {
                let v = self.read_upvalue(*ix)?;
                self.push(v)?;
            }
            Op::StoreUpvalue(ix) => {
                let v = self.pop()?;
                self.write_upvalue(*ix, v)?;
            }
            Op::LoadGlobal(ix) => {
                let name = self.const_str(*ix)?;
                let v = self.globals.get(&name).cloned().ok_or_else(|| VmError::Unsupported(format!("undefined global '{name}'")))?;
                self.push(v)?;
            }
            Op::StoreGlobal(ix) => {
                let name = self.const_str(*ix)?;
                if !self.globals.contains_key(&name) {
                    return Err(VmError::Unsupported(format!("undefined global '{name}'")));
                }
                let v = self.pop()?;
                let prev_phase = self.globals[&name].phase;
                if !prev_phase.is_mutable() {
                    return Err(VmError::PhaseViolation(format!("cannot store into a {prev_phase} global '{name}'")));
                }
                self.globals.insert(name, v.clone());
                self.push(v)?;
            }
            Op::DefineGlobal(ix) => {
                let name = self.const_str(*ix)?;
                let v = self.pop()?;
                self.globals.insert(name, v);
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let v = self.peek(0)?.clone();
                self.push(v)?;
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => self.binary_arith(op)?,
            Op::Neg => {
                let v = self.pop()?;
                let out = match v.value {
                    Value::Int(i) => Value::Int(-i),
                    Value::Float(f) => Value::Float(-f),
                    other => return Err(VmError::TypeError(format!("cannot negate {}", other.type_name()))),
                };
                self.push(Phased::new(out))?;
            }
            Op::Not => {
                let v = self.pop()?;
                self.push(Phased::new(Value::Bool(!v.value.is_truthy())))?;
            }
            Op::Eq | Op::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.value.equals(&b.value);
                let want_eq = matches!(op, Op::Eq);
                self.push(Phased::new(Value::Bool(if want_eq { eq } else { !eq })))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => self.comparison(op)?,
            Op::Jump(offset) => self.jump_by(*offset)?,
            Op::JumpIfFalse(offset) => {
                let v = self.pop()?;
                if !v.value.is_truthy() {
                    self.jump_by(*offset)?;
                }
            }
            Op::JumpIfTrue(offset) => {
                let v = self.pop()?;
                if v.value.is_truthy() {
                    self.jump_by(*offset)?;
                }
            }
            Op::Call(argc) => return self.do_call(*argc, false),
            Op::TailCall(argc) => return self.do_call(*argc, true),
            Op::MakeClosure(func_ix, n) => self.do_make_closure(*func_ix, *n)?,
            Op::CloseUpvalue(slot) => {
                let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
                self.close_upvalues_from(base + *slot as usize);
            }
            Op::NewArray(n) => {
                let mut items = Vec::with_capacity(*n as usize);
                for _ in 0..*n {
                    items.push(self.pop()?.value);
                }
                items.reverse();
                self.push(Phased::with_phase(Value::Array(items), Phase::Fluid))?;
            }
            Op::NewMap(n) => {
                let mut pairs = Vec::with_capacity(*n as usize);
                for _ in 0..*n {
                    let v = self.pop()?.value;
                    let k = self.pop()?.value;
                    pairs.push((k, v));
                }
                pairs.reverse();
                let mut map = value::OrderedMap::new();
                for (k, v) in pairs {
                    let Value::Str(key) = k else {
                        return Err(VmError::TypeError("map keys must be strings".into()));
                    };
                    map.insert(key, v);
                }
                self.push(Phased::with_phase(Value::Map(map), Phase::Fluid))?;
            }
            Op::NewSet(n) => {
                let mut items = Vec::with_capacity(*n as usize);
                for _ in 0..*n {
                    items.push(self.pop()?.value);
                }
                let mut set = value::OrderedSet::new();
                for v in items.into_iter().rev() {
                    set.insert(v);
                }
                self.push(Phased::with_phase(Value::Set(set), Phase::Fluid))?;
            }
            Op::Index => self.do_index()?,
            Op::IndexSet(ix) => self.do_index_set(*ix)?,
            Op::GetField(ix) => self.do_get_field(*ix)?,
            Op::SetField(ix) => self.do_set_field(*ix)?,
            Op::Freeze(ix) => self.do_freeze(*ix)?,
            Op::Thaw(ix) => self.do_thaw(*ix)?,
            Op::TryBegin(offset) => {
                let target = self.resolve_target(*offset)?;
                self.handlers.push(TryHandler { target_ip: target as usize, frame_depth: self.frames.len(), stack_depth: self.stack.len() });
            }
            Op::TryEnd => {
                self.handlers.pop();
            }
            Op::Throw => {
                let v = self.pop()?;
                return Err(VmError::Uncaught(value::display(&v.value)));
            }
            Op::Require(ix) => {
                let path = self.const_str(*ix)?;
                let exports = self.runtime.cache.get_required(&path).unwrap_or(Value::Nil);
                self.push(Phased::new(exports))?;
            }
            Op::Print => {
                let v = self.pop()?;
                println!("{}", value::display(&v.value));
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn const_str(&self, ix: u32) -> VmResult<String> {
        match self.current_chunk()?.const_at(ix) {
            Some(ConstValue::Str(s)) => Ok(s.clone()),
            Some(_) => Err(VmError::TypeError("expected a string constant".into())),
            None => Err(VmError::Unsupported(format!("bad const index {ix}"))),
        }
    }

    fn resolve_target(&self, offset: i32) -> VmResult<u32> {
        let ip = self.frames.last().ok_or(VmError::CallStackUnderflow)?.ip as i64;
        Ok((ip + offset as i64 - 1) as u32)
    }

    fn jump_by(&mut self, offset: i32) -> VmResult<()> {
        let target = self.resolve_target(offset)? as usize;
        self.frames.last_mut().ok_or(VmError::CallStackUnderflow)?.ip = target;
        Ok(())
    }

    fn binary_arith(&mut self, op: &Op) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let out = match (a.value, b.value) {
            (Value::Int(x), Value::Int(y)) => match op {
                Op::Add => Value::Int(x.wrapping_add(y)),
                Op::Sub => Value::Int(x.wrapping_sub(y)),
                Op::Mul => Value::Int(x.wrapping_mul(y)),
                Op::Div => {
                    if y == 0 {
                        return Err(VmError::TypeError("division by zero".into()));
                    }
                    Value::Int(x / y)
                }
                Op::Mod => {
                    if y == 0 {
                        return Err(VmError::TypeError("division by zero".into()));
                    }
                    Value::Int(x % y)
                }
                _ => unreachable!(),
            },
            (Value::Str(x), Value::Str(y)) if matches!(op, Op::Add) => Value::Str(value::lat_str(format!("{x}{y}"))),
            (x, y) => {
                let (xf, yf) = (as_f64(&x)?, as_f64(&y)?);
                match op {
                    Op::Add => Value::Float(xf + yf),
                    Op::Sub => Value::Float(xf - yf),
                    Op::Mul => Value::Float(xf * yf),
                    Op::Div => Value::Float(xf / yf),
                    Op::Mod => Value::Float(xf % yf),
                    _ => unreachable!(),
                }
            }
        };
        self.push(Phased::new(out))
    }

    fn comparison(&mut self, op: &Op) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (af, bf) = (as_f64(&a.value)?, as_f64(&b.value)?);
        let result = match op {
            Op::Lt => af < bf,
            Op::Le => af <= bf,
            Op::Gt => af > bf,
            Op::Ge => af >= bf,
            _ => unreachable!(),
        };
        self.push(Phased::new(Value::Bool(result)))
    }

    fn do_index(&mut self) -> VmResult<()> {
        let index = self.pop()?;
        let target = self.pop()?;
        let out = match (&target.value, &index.value) {
            (Value::Array(items), Value::Int(i)) => {
                let i = normalize_index(*i, items.len())
                    .ok_or_else(|| VmError::Unsupported(format!("index {i} out of range (len {})", items.len())))?;
                items[i].deep_clone()
            }
            (Value::Map(m), Value::Str(k)) => m.get(k).cloned().unwrap_or(Value::Nil),
            (Value::Buffer(b), Value::Int(i)) => {
                let i = normalize_index(*i, b.len()).ok_or_else(|| VmError::Unsupported("buffer index out of range".into()))?;
                Value::Int(i64::from(b[i]))
            }
            _ => return Err(VmError::TypeError("value is not indexable with this key".into())),
        };
        self.push(Phased::new(out))
    }

    /// `name` est la variable syntaxiquement indexée (§4.3) ; elle ne sert
    /// qu'à consulter la pression en vigueur, jamais à localiser la valeur
    /// elle-même (déjà sur la pile, comme avant).
    fn do_index_set(&mut self, ix: u32) -> VmResult<()> {
        let name = self.const_str(ix)?;
        let new_value = self.pop()?;
        let index = self.pop()?;
        let mut target = self.pop()?;
        if !target.phase.is_mutable() {
            return Err(VmError::PhaseViolation(format!("cannot mutate a {} value", target.phase)));
        }
        match (&mut target.value, &index.value) {
            (Value::Array(items), Value::Int(i)) => {
                let len = items.len();
                let i = normalize_index(*i, len).ok_or_else(|| VmError::Unsupported("index out of range".into()))?;
                self.runtime.pressure.guard(&name, MutationKind::Overwrite)?;
                items[i] = new_value.value;
            }
            (Value::Map(m), Value::Str(k)) => {
                let kind = if m.get(k).is_some() { MutationKind::Overwrite } else { MutationKind::Grow };
                self.runtime.pressure.guard(&name, kind)?;
                m.insert(k.clone(), new_value.value);
            }
            _ => return Err(VmError::TypeError("value does not support indexed assignment".into())),
        }
        self.push(target)
    }

    /// Gèle la globale `name` via les services de runtime (C5) : historique,
    /// réactions, puis cascade de liens. `lookup` referme sur un instantané
    /// des globales pour que la cascade puisse lire la valeur courante des
    /// variables liées sans se heurter à l'emprunt mutable de `self`.
    fn do_freeze(&mut self, ix: u32) -> VmResult<()> {
        let name = self.const_str(ix)?;
        let current = self
            .globals
            .get(&name)
            .cloned()
            .ok_or_else(|| VmError::Unsupported(format!("undefined global '{name}'")))?;
        let snapshot = self.globals.clone();
        let lookup = move |n: &str| snapshot.get(n).cloned();
        let (frozen, cascades) = self.runtime.freeze_named(&name, &current, &lookup)?;
        self.globals.insert(name, frozen);
        self.apply_cascades(cascades)
    }

    /// Dégèle la globale `name` via les services de runtime ; aucune
    /// cascade de liens ne se déclenche sur un dégel (§8).
    fn do_thaw(&mut self, ix: u32) -> VmResult<()> {
        let name = self.const_str(ix)?;
        let current = self
            .globals
            .get(&name)
            .cloned()
            .ok_or_else(|| VmError::Unsupported(format!("undefined global '{name}'")))?;
        let thawed = self.runtime.thaw_named(&name, &current)?;
        self.globals.insert(name, thawed);
        Ok(())
    }

    /// Applique les effets de cascade renvoyés par `Runtime::freeze_named`
    /// (ou `SeedTable::grow`) sur les globales de la VM.
    fn apply_cascades(&mut self, cascades: Vec<(String, CascadeEffect)>) -> VmResult<()> {
        for (target, effect) in cascades {
            match effect {
                CascadeEffect::SetPhased(p) => {
                    self.globals.insert(target, p);
                }
                CascadeEffect::GateFailed(name) => return Err(VmError::Runtime(RuntimeError::GateFailure(name))),
            }
        }
        Ok(())
    }

    fn do_get_field(&mut self, ix: u32) -> VmResult<()> {
        let name = self.const_str(ix)?;
        let target = self.pop()?;
        let Value::Struct(s) = &target.value else {
            return Err(VmError::TypeError("only structs have fields".into()));
        };
        let v = s.get(&name).cloned().ok_or_else(|| VmError::Unsupported(format!("no such field '{name}'")))?;
        self.push(Phased::new(v))
    }

    fn do_set_field(&mut self, ix: u32) -> VmResult<()> {
        let name = self.const_str(ix)?;
        let new_value = self.pop()?;
        let mut target = self.pop()?;
        if !target.phase.is_mutable() {
            return Err(VmError::PhaseViolation(format!("cannot mutate a {} struct", target.phase)));
        }
        let Value::Struct(s) = &mut target.value else {
            return Err(VmError::TypeError("only structs have fields".into()));
        };
        let slot = s.get_mut(&name).ok_or_else(|| VmError::Unsupported(format!("no such field '{name}'")))?;
        *slot = new_value.value;
        self.push(target)
    }

    /// Trouve ou crée la cellule partagée pour l'emplacement de pile absolu
    /// `slot` (§3.5) : deux fermetures qui capturent la même locale la
    /// partagent tant qu'elle reste ouverte.
    fn capture_upvalue(&mut self, slot: usize) -> UpvalueCell {
        if let Some((_, cell)) = self.open_upvalues.iter().find(|(s, _)| *s == slot) {
            return cell.clone();
        }
        let cell: UpvalueCell = Arc::new(Mutex::new(Upvalue::Open(slot)));
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Ferme toute upvalue ouverte sur un emplacement `>= threshold`,
    /// recopiant la valeur vivante de la pile dans la cellule avant que le
    /// cadre qui la possédait ne disparaisse.
    fn close_upvalues_from(&mut self, threshold: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|(slot, cell)| {
            if *slot < threshold {
                return true;
            }
            let value = stack[*slot].value.clone();
            *cell.lock() = Upvalue::Closed(value);
            false
        });
    }

    fn current_closure(&self) -> VmResult<&Arc<Closure>> {
        self.frames
            .last()
            .ok_or(VmError::CallStackUnderflow)?
            .closure
            .as_ref()
            .ok_or_else(|| VmError::Unsupported("no enclosing closure for an upvalue access".into()))
    }

    fn read_upvalue(&self, ix: u16) -> VmResult<Phased> {
        let closure = self.current_closure()?;
        let cell = closure
            .upvalues
            .get(ix as usize)
            .ok_or_else(|| VmError::Unsupported(format!("bad upvalue index {ix}")))?;
        let guard = cell.lock();
        Ok(match &*guard {
            Upvalue::Open(slot) => self.stack.get(*slot).cloned().ok_or(VmError::StackUnderflow)?,
            Upvalue::Closed(v) => Phased::with_phase(v.clone(), Phase::Fluid),
        })
    }

    fn write_upvalue(&mut self, ix: u16, v: Phased) -> VmResult<()> {
        let closure = self.current_closure()?.clone();
        let cell = closure
            .upvalues
            .get(ix as usize)
            .ok_or_else(|| VmError::Unsupported(format!("bad upvalue index {ix}")))?;
        let slot = {
            let guard = cell.lock();
            match &*guard {
                Upvalue::Open(slot) => Some(*slot),
                Upvalue::Closed(_) => None,
            }
        };
        match slot {
            Some(slot) => {
                *self.stack.get_mut(slot).ok_or(VmError::StackUnderflow)? = v;
            }
            None => {
                *cell.lock() = Upvalue::Closed(v.value);
            }
        }
        Ok(())
    }

    /// Construit une fermeture depuis la fonction imbriquée `func_ix` du
    /// chunk courant, capturant ses upvalues d'après les descripteurs que ce
    /// chunk imbriqué porte lui-même (§3.5).
    fn do_make_closure(&mut self, func_ix: u32, n: u8) -> VmResult<()> {
        let current_chunk = self.current_chunk()?.clone();
        let inner = current_chunk
            .function_at(func_ix)
            .ok_or_else(|| VmError::Unsupported(format!("bad function index {func_ix}")))?
            .clone();
        if inner.upvalues.len() != n as usize {
            return Err(VmError::Unsupported(format!(
                "MAKE_CLOSURE expected {n} upvalues, function declares {}",
                inner.upvalues.len()
            )));
        }
        let base = self.frames.last().ok_or(VmError::CallStackUnderflow)?.base;
        let enclosing = self.frames.last().and_then(|f| f.closure.clone());
        let mut upvalues = Vec::with_capacity(inner.upvalues.len());
        for desc in &inner.upvalues {
            let cell = if desc.is_local {
                self.capture_upvalue(base + desc.index as usize)
            } else {
                let enclosing = enclosing
                    .as_ref()
                    .ok_or_else(|| VmError::Unsupported("no enclosing closure to inherit an upvalue from".into()))?;
                enclosing
                    .upvalues
                    .get(desc.index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::Unsupported(format!("bad upvalue index {}", desc.index)))?
            };
            upvalues.push(cell);
        }
        let arity = inner.arity;
        let variadic = inner.variadic;
        let name = inner.name.clone();
        let defaults = inner.defaults.iter().map(const_to_value).collect();
        let param_phases = if inner.param_phases.iter().any(Option::is_some) {
            Some(inner.param_phases.iter().map(|p| p.unwrap_or(Phase::Unphased)).collect())
        } else {
            None
        };
        let closure = Closure {
            params: (0..arity).map(|i| value::lat_str(format!("arg{i}"))).collect(),
            defaults,
            variadic,
            dispatch: Dispatch::Compiled(Arc::new(inner) as value::ChunkRef),
            upvalues,
            param_phases,
            env: None,
            name: name.map(value::lat_str),
        };
        self.push(Phased::new(Value::Closure(Arc::new(closure))))
    }

    fn do_call(&mut self, argc: u8, tail: bool) -> VmResult<StepOutcome> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let callee = self.pop()?;
        let Value::Closure(closure) = callee.value else {
            return Err(VmError::TypeError("only closures are callable".into()));
        };

        let final_args = bind_arguments(&closure, args)?;

        match &closure.dispatch {
            Dispatch::Compiled(chunk_ref) => {
                let chunk = chunk_ref
                    .clone()
                    .downcast::<Chunk>()
                    .map_err(|_| VmError::Unsupported("compiled dispatch did not carry a Chunk".into()))?;
                if tail {
                    if let Some(frame) = self.frames.pop() {
                        self.stack.truncate(frame.base);
                    }
                } else if self.frames.len() >= self.options.call_stack_limit {
                    return Err(VmError::CallStackOverflow);
                }
                let base = self.stack.len();
                for a in final_args {
                    self.push(a)?;
                }
                self.frames.push(CallFrame::with_closure(chunk, base, closure));
                Ok(StepOutcome::Continue)
            }
            Dispatch::Native(id) => {
                let id = *id;
                let values: Vec<Value> = final_args.into_iter().map(|p| p.value).collect();
                let result = self.runtime.call_native(id, &values)?;
                self.push(Phased::new(result))?;
                Ok(StepOutcome::Continue)
            }
            Dispatch::Extension(ext_id) => {
                let native_id = NativeId(ext_id.0);
                let values: Vec<Value> = final_args.into_iter().map(|p| p.value).collect();
                let result = self
                    .runtime
                    .call_native(native_id, &values)
                    .map_err(|e| VmError::Uncaught(format!("EVAL_ERROR: {e}")))?;
                self.push(Phased::new(result))?;
                Ok(StepOutcome::Continue)
            }
        }
    }
}

fn bind_arguments(closure: &Arc<Closure>, mut args: Vec<Phased>) -> VmResult<Vec<Phased>> {
    let arity = closure.params.len();
    let required = arity.saturating_sub(closure.defaults.len());

    if args.len() < required || (args.len() > arity && !closure.variadic) {
        return Err(VmError::Arity { expected: arity, got: args.len() });
    }

    let mut extra = Vec::new();
    if closure.variadic && args.len() > arity {
        extra = args.split_off(arity);
    }

    while args.len() < arity {
        let default_ix = args.len() - required;
        let default = closure.defaults.get(default_ix).ok_or(VmError::Arity { expected: arity, got: args.len() })?;
        args.push(Phased::new(default.deep_clone()));
    }

    if let Some(constraints) = &closure.param_phases {
        for (i, required_phase) in constraints.iter().enumerate() {
            if let Some(actual) = args.get(i) {
                if actual.phase != *required_phase {
                    return Err(VmError::PhaseViolation(format!("parameter {i} requires {required_phase}, got {}", actual.phase)));
                }
            }
        }
    }

    if closure.variadic {
        let rest: Vec<Value> = extra.into_iter().map(|p| p.value).collect();
        args.push(Phased::with_phase(Value::Array(rest), Phase::Fluid));
    }

    Ok(args)
}

fn as_f64(v: &Value) -> VmResult<f64> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(VmError::TypeError(format!("expected a number, got {}", other.type_name()))),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::Closure;
    use lattice_runtime::{PressureMode, RResult, RuntimeError};

    fn run_chunk(chunk: Chunk) -> Phased {
        let rt = Arc::new(Runtime::new());
        let mut vm = Vm::new(rt);
        vm.run(Arc::new(chunk)).expect("chunk runs")
    }

    #[test]
    fn arithmetic_adds_two_constants() {
        let mut chunk = Chunk::new(Some("main".into()));
        let a = chunk.add_const(ConstValue::Int(2));
        let b = chunk.add_const(ConstValue::Int(3));
        chunk.push_op(Op::LoadConst(a), 1);
        chunk.push_op(Op::LoadConst(b), 1);
        chunk.push_op(Op::Add, 1);
        chunk.push_op(Op::Return, 1);

        let result = run_chunk(chunk);
        assert_eq!(result.value, Value::Int(5));
    }

    #[test]
    fn store_local_rejects_crystal_phase() {
        let mut chunk = Chunk::new(Some("main".into()));
        let name = chunk.add_const(ConstValue::Str("g".into()));
        let initial = chunk.add_const(ConstValue::Int(1));
        let overwrite = chunk.add_const(ConstValue::Int(99));
        chunk.push_op(Op::LoadConst(initial), 1);
        chunk.push_op(Op::DefineGlobal(name), 1);
        chunk.push_op(Op::Freeze(name), 1);
        chunk.push_op(Op::LoadGlobal(name), 1); // slot 0: a crystal value
        chunk.push_op(Op::LoadConst(overwrite), 1);
        chunk.push_op(Op::StoreLocal(0), 1); // rejected: slot 0 is crystal
        chunk.push_op(Op::ReturnVoid, 1);

        let rt = Arc::new(Runtime::new());
        let mut vm = Vm::new(rt);
        let err = vm.run(Arc::new(chunk)).unwrap_err();
        assert!(matches!(err, VmError::PhaseViolation(_)));
    }

    #[test]
    fn store_local_pushes_the_stored_value_back() {
        let mut chunk = Chunk::new(Some("main".into()));
        let one = chunk.add_const(ConstValue::Int(1));
        let two = chunk.add_const(ConstValue::Int(2));
        chunk.push_op(Op::LoadConst(one), 1); // slot 0
        chunk.push_op(Op::LoadConst(two), 1);
        chunk.push_op(Op::StoreLocal(0), 1); // stores 2 into slot 0, and leaves it on the stack
        chunk.push_op(Op::Return, 1);

        let result = run_chunk(chunk);
        assert_eq!(result.value, Value::Int(2));
    }

    #[test]
    fn store_global_requires_preexistence() {
        let mut chunk = Chunk::new(Some("main".into()));
        let name = chunk.add_const(ConstValue::Str("g".into()));
        let v = chunk.add_const(ConstValue::Int(1));
        chunk.push_op(Op::LoadConst(v), 1);
        chunk.push_op(Op::StoreGlobal(name), 1);
        chunk.push_op(Op::ReturnVoid, 1);

        let rt = Arc::new(Runtime::new());
        let mut vm = Vm::new(rt);
        let err = vm.run(Arc::new(chunk)).unwrap_err();
        assert!(matches!(err, VmError::Unsupported(_)));
    }

    #[test]
    fn define_global_then_store_global_pushes_the_value_back() {
        let mut chunk = Chunk::new(Some("main".into()));
        let name = chunk.add_const(ConstValue::Str("g".into()));
        let one = chunk.add_const(ConstValue::Int(1));
        let two = chunk.add_const(ConstValue::Int(2));
        chunk.push_op(Op::LoadConst(one), 1);
        chunk.push_op(Op::DefineGlobal(name), 1);
        chunk.push_op(Op::LoadConst(two), 1);
        chunk.push_op(Op::StoreGlobal(name), 1);
        chunk.push_op(Op::Return, 1);

        let result = run_chunk(chunk);
        assert_eq!(result.value, Value::Int(2));
    }

    #[test]
    fn freeze_then_thaw_round_trips_through_a_global() {
        let mut chunk = Chunk::new(Some("main".into()));
        let name = chunk.add_const(ConstValue::Str("g".into()));
        let seven = chunk.add_const(ConstValue::Int(7));
        chunk.push_op(Op::LoadConst(seven), 1);
        chunk.push_op(Op::DefineGlobal(name), 1);
        chunk.push_op(Op::Freeze(name), 1);
        chunk.push_op(Op::Thaw(name), 1);
        chunk.push_op(Op::LoadGlobal(name), 1);
        chunk.push_op(Op::Return, 1);

        let result = run_chunk(chunk);
        assert_eq!(result.phase, Phase::Fluid);
        assert_eq!(result.value, Value::Int(7));
    }

    #[test]
    fn index_set_respects_pressure_guard() {
        let rt = Runtime::new();
        rt.pressure.pressurize("arr", PressureMode::ReadHeavy);
        let rt = Arc::new(rt);
        let mut vm = Vm::new(rt);
        vm.push(Phased::with_phase(Value::Array(vec![Value::Int(1)]), Phase::Fluid)).unwrap();

        let mut chunk = Chunk::new(Some("main".into()));
        let name = chunk.add_const(ConstValue::Str("arr".into()));
        let idx = chunk.add_const(ConstValue::Int(0));
        let val = chunk.add_const(ConstValue::Int(9));
        chunk.push_op(Op::LoadConst(idx), 1);
        chunk.push_op(Op::LoadConst(val), 1);
        chunk.push_op(Op::IndexSet(name), 1);
        chunk.push_op(Op::Return, 1);

        let err = vm.run(Arc::new(chunk)).unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::PressureExhausted(_))));
    }

    #[test]
    fn throw_without_handler_propagates() {
        let mut chunk = Chunk::new(Some("main".into()));
        let k = chunk.add_const(ConstValue::Str("boom".into()));
        chunk.push_op(Op::LoadConst(k), 1);
        chunk.push_op(Op::Throw, 1);

        let rt = Arc::new(Runtime::new());
        let mut vm = Vm::new(rt);
        let err = vm.run(Arc::new(chunk)).unwrap_err();
        assert!(matches!(err, VmError::Uncaught(_)));
    }

    #[test]
    fn try_begin_catches_a_throw() {
        let mut chunk = Chunk::new(Some("main".into()));
        chunk.push_op(Op::TryBegin(3), 1);
        let k = chunk.add_const(ConstValue::Str("boom".into()));
        chunk.push_op(Op::LoadConst(k), 1);
        chunk.push_op(Op::Throw, 1);
        chunk.push_op(Op::Return, 1);

        let result = run_chunk(chunk);
        assert!(matches!(result.value, Value::Error(_)));
    }

    fn double_native(args: &[Value], _rt: &Runtime) -> RResult<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i * 2)),
            _ => Err(RuntimeError::Type("expected int".into())),
        }
    }

    #[test]
    fn call_enforces_arity_before_dispatch() {
        let mut rt = Runtime::new();
        let id = rt.natives.register("test", "test.double", Some(1), double_native);
        let rt = Arc::new(rt);
        let mut vm = Vm::new(rt);

        let closure = Arc::new(Closure {
            params: vec![value::lat_str("x")],
            defaults: vec![],
            variadic: false,
            dispatch: Dispatch::Native(id),
            upvalues: vec![],
            param_phases: None,
            env: None,
            name: Some(value::lat_str("double")),
        });
        vm.push(Phased::new(Value::Closure(closure))).unwrap();

        let mut chunk = Chunk::new(Some("main".into()));
        chunk.push_op(Op::Call(0), 1);
        chunk.push_op(Op::Return, 1);

        let err = vm.run(Arc::new(chunk)).unwrap_err();
        assert!(matches!(err, VmError::Arity { .. }));
    }

    #[test]
    fn builtin_globals_are_callable() {
        let mut rt = Runtime::new();
        let ids = lattice_runtime::builtins::register(&mut rt.natives);
        let rt = Arc::new(rt);
        let mut vm = Vm::new(rt);
        vm.define_builtin_globals(&ids);

        let mut chunk = Chunk::new(Some("main".into()));
        let name_const = chunk.add_const(ConstValue::Str("track".into()));
        let arg_const = chunk.add_const(ConstValue::Str("x".into()));
        chunk.push_op(Op::LoadGlobal(name_const), 1);
        chunk.push_op(Op::LoadConst(arg_const), 1);
        chunk.push_op(Op::Call(1), 1);
        chunk.push_op(Op::Return, 1);

        let result = vm.run(Arc::new(chunk)).unwrap();
        assert_eq!(result.value, Value::Nil);
        assert!(vm.runtime().tracker.is_tracked("x"));
    }

    fn inc_upvalue_chunk() -> Chunk {
        let mut inner = Chunk::new(Some("inc".into()));
        let one = inner.add_const(ConstValue::Int(1));
        inner.push_op(Op::LoadUpvalue(0), 1);
        inner.push_op(Op::LoadConst(one), 1);
        inner.push_op(Op::Add, 1);
        inner.push_op(Op::Dup, 1);
        inner.push_op(Op::StoreUpvalue(0), 1);
        inner.push_op(Op::Return, 1);
        inner.upvalues.push(lattice_core::bytecode::UpvalueDesc { is_local: true, index: 0 });
        inner
    }

    #[test]
    fn a_returned_closure_keeps_its_upvalue_after_the_frame_closes() {
        let mut outer = Chunk::new(Some("make_counter".into()));
        let zero = outer.add_const(ConstValue::Int(0));
        let inc_ix = outer.add_function(inc_upvalue_chunk());
        outer.push_op(Op::LoadConst(zero), 1); // slot 0
        outer.push_op(Op::MakeClosure(inc_ix, 1), 1);
        outer.push_op(Op::Return, 1);

        let rt = Arc::new(Runtime::new());
        let mut vm = Vm::new(rt);
        let counter = vm.run(Arc::new(outer)).unwrap();
        let Value::Closure(counter) = counter.value else { panic!("expected a closure") };

        let mut call_chunk = Chunk::new(Some("call".into()));
        call_chunk.push_op(Op::Call(0), 1);
        call_chunk.push_op(Op::Return, 1);
        let call_chunk = Arc::new(call_chunk);

        vm.push(Phased::new(Value::Closure(counter.clone()))).unwrap();
        let first = vm.run(call_chunk.clone()).unwrap();
        assert_eq!(first.value, Value::Int(1));

        vm.push(Phased::new(Value::Closure(counter))).unwrap();
        let second = vm.run(call_chunk).unwrap();
        assert_eq!(second.value, Value::Int(2));
    }

    #[test]
    fn two_closures_over_the_same_open_local_share_one_cell() {
        let mut outer = Chunk::new(Some("share".into()));
        let zero = outer.add_const(ConstValue::Int(0));
        let inc_ix = outer.add_function(inc_upvalue_chunk());
        outer.push_op(Op::LoadConst(zero), 1); // slot 0
        outer.push_op(Op::MakeClosure(inc_ix, 1), 1); // closure_a
        outer.push_op(Op::MakeClosure(inc_ix, 1), 1); // closure_b, same slot
        outer.push_op(Op::Call(0), 1); // calls closure_b, bumps the shared counter to 1
        outer.push_op(Op::Pop, 1);
        outer.push_op(Op::Call(0), 1); // calls closure_a, bumps it to 2
        outer.push_op(Op::Return, 1);

        let result = run_chunk(outer);
        assert_eq!(result.value, Value::Int(2));
    }

    #[test]
    fn close_upvalue_severs_the_link_to_the_stack_slot() {
        let mut outer = Chunk::new(Some("close".into()));
        let zero = outer.add_const(ConstValue::Int(0));
        let five = outer.add_const(ConstValue::Int(5));
        let inc_ix = outer.add_function(inc_upvalue_chunk());
        outer.push_op(Op::LoadConst(zero), 1); // slot 0
        outer.push_op(Op::MakeClosure(inc_ix, 1), 1); // closure_a, captures slot 0 (still open)
        outer.push_op(Op::CloseUpvalue(0), 1); // closes it at its current value (0)
        outer.push_op(Op::LoadConst(five), 1);
        outer.push_op(Op::StoreLocal(0), 1); // mutates slot 0 to 5, pushed back
        outer.push_op(Op::Pop, 1);
        outer.push_op(Op::Call(0), 1); // calls closure_a: unaffected by the slot-0 mutation above
        outer.push_op(Op::Return, 1);

        let result = run_chunk(outer);
        assert_eq!(result.value, Value::Int(1));
    }

    #[test]
    fn call_dispatches_to_a_native_function() {
        let mut rt = Runtime::new();
        let id = rt.natives.register("test", "test.double", Some(1), double_native);
        let rt = Arc::new(rt);
        let mut vm = Vm::new(rt);

        let closure = Arc::new(Closure {
            params: vec![value::lat_str("x")],
            defaults: vec![],
            variadic: false,
            dispatch: Dispatch::Native(id),
            upvalues: vec![],
            param_phases: None,
            env: None,
            name: Some(value::lat_str("double")),
        });
        vm.push(Phased::new(Value::Closure(closure))).unwrap();
        vm.push(Phased::new(Value::Int(21))).unwrap();

        let mut chunk = Chunk::new(Some("main".into()));
        chunk.push_op(Op::Call(1), 1);
        chunk.push_op(Op::Return, 1);

        let result = vm.run(Arc::new(chunk)).unwrap();
        assert_eq!(result.value, Value::Int(42));
    }
}
