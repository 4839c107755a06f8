//! builtins.rs — natifs C5 exposés au langage (§4.5/§8).
//!
//! Les services de ce crate (suivi, pression, réactions, liens, graines)
//! ne sont utiles à un programme Lattice que s'ils sont appelables depuis
//! le bytecode. Ce module les enregistre dans la table native (C6) et
//! renvoie leurs identifiants ; c'est à l'appelant (`lattice-vm`, à la
//! construction de la VM) de les exposer comme des fermetures globales.
//!
//! Contrainte de [`NativeFn`](crate::registry::NativeFn) : pas d'état de
//! fermeture, pas d'accès à la pile ni aux globales de la VM. `grow` s'en
//! accommode en recevant la valeur courante en argument explicite plutôt
//! qu'en la cherchant elle-même ; les cascades de liens qu'elle pourrait
//! déclencher sur D'AUTRES globales ne sont donc pas appliquées depuis ce
//! point d'entrée (seul l'opcode `FREEZE`, qui a accès aux globales de la
//! VM, les applique) — seul le gel de `name` elle-même l'est toujours.

use lattice_core::value::{Dispatch, NativeId, Phase, Phased, Value};

use crate::bonds::BondStrategy;
use crate::error::{RResult, RuntimeError};
use crate::pressure::PressureMode;
use crate::registry::NativeRegistry;
use crate::runtime::Runtime;

fn arg_str<'a>(args: &'a [Value], i: usize) -> RResult<&'a str> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s.as_ref()),
        _ => Err(RuntimeError::Type(format!("argument {i} must be a string"))),
    }
}

fn arg_native(args: &[Value], i: usize) -> RResult<NativeId> {
    match args.get(i) {
        Some(Value::Closure(c)) => match c.dispatch {
            Dispatch::Native(id) => Ok(id),
            _ => Err(RuntimeError::Type(format!("argument {i} must be a native-backed closure"))),
        },
        _ => Err(RuntimeError::Type(format!("argument {i} must be a closure"))),
    }
}

fn parse_phase(s: &str) -> RResult<Phase> {
    match s {
        "unphased" => Ok(Phase::Unphased),
        "fluid" => Ok(Phase::Fluid),
        "crystal" => Ok(Phase::Crystal),
        "sublimated" => Ok(Phase::Sublimated),
        other => Err(RuntimeError::Type(format!("unknown phase '{other}'"))),
    }
}

fn parse_pressure_mode(s: &str) -> RResult<PressureMode> {
    match s {
        "no_grow" => Ok(PressureMode::NoGrow),
        "no_shrink" => Ok(PressureMode::NoShrink),
        "no_resize" => Ok(PressureMode::NoResize),
        "read_heavy" => Ok(PressureMode::ReadHeavy),
        other => Err(RuntimeError::Type(format!("unknown pressure mode '{other}'"))),
    }
}

fn pressure_mode_name(mode: PressureMode) -> &'static str {
    match mode {
        PressureMode::NoGrow => "no_grow",
        PressureMode::NoShrink => "no_shrink",
        PressureMode::NoResize => "no_resize",
        PressureMode::ReadHeavy => "read_heavy",
    }
}

fn parse_bond_strategy(s: &str) -> RResult<BondStrategy> {
    match s {
        "mirror" => Ok(BondStrategy::Mirror),
        "inverse" => Ok(BondStrategy::Inverse),
        "gate" => Ok(BondStrategy::Gate),
        other => Err(RuntimeError::Type(format!("unknown bond strategy '{other}'"))),
    }
}

fn native_track(args: &[Value], rt: &Runtime) -> RResult<Value> {
    rt.tracker.track(arg_str(args, 0)?);
    Ok(Value::Nil)
}

fn native_history(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let hist = rt.tracker.history(arg_str(args, 0)?)?;
    let items = hist
        .into_iter()
        .map(|p| {
            let mut m = lattice_core::value::OrderedMap::new();
            m.insert(lattice_core::value::lat_str("value"), p.value);
            m.insert(lattice_core::value::lat_str("phase"), Value::Str(lattice_core::value::lat_str(p.phase.name())));
            Value::Map(m)
        })
        .collect();
    Ok(Value::Array(items))
}

fn native_phases(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let phases = rt.tracker.phases(arg_str(args, 0)?)?;
    Ok(Value::Array(phases.into_iter().map(|p| Value::Str(lattice_core::value::lat_str(p.name()))).collect()))
}

fn native_rewind(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let name = arg_str(args, 0)?;
    let steps = match args.get(1) {
        Some(Value::Int(i)) if *i >= 0 => *i as usize,
        _ => return Err(RuntimeError::Type("rewind steps must be a non-negative int".into())),
    };
    rt.tracker.rewind(name, steps)
}

fn native_pressurize(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let mode = parse_pressure_mode(arg_str(args, 1)?)?;
    rt.pressure.pressurize(arg_str(args, 0)?, mode);
    Ok(Value::Nil)
}

fn native_depressurize(args: &[Value], rt: &Runtime) -> RResult<Value> {
    rt.pressure.depressurize(arg_str(args, 0)?);
    Ok(Value::Nil)
}

fn native_pressure_of(args: &[Value], rt: &Runtime) -> RResult<Value> {
    Ok(match rt.pressure.pressure_of(arg_str(args, 0)?) {
        Some(mode) => Value::Str(lattice_core::value::lat_str(pressure_mode_name(mode))),
        None => Value::Nil,
    })
}

fn native_on_phase(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let name = arg_str(args, 0)?.to_string();
    let phase = parse_phase(arg_str(args, 1)?)?;
    let reaction = arg_native(args, 2)?;
    rt.reactions.on_phase(&name, phase, reaction);
    Ok(Value::Nil)
}

fn native_bond(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let source = arg_str(args, 0)?.to_string();
    let target = arg_str(args, 1)?.to_string();
    let strategy = parse_bond_strategy(arg_str(args, 2)?)?;
    rt.bonds.bond(&source, &target, strategy);
    Ok(Value::Nil)
}

fn native_seed(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let name = arg_str(args, 0)?.to_string();
    let guard = arg_native(args, 1)?;
    rt.seeds.seed(&name, guard);
    Ok(Value::Nil)
}

/// `grow(name, current)` : valide les graines plantées sur `name` contre
/// `current` puis, si elles passent, gèle `name`. N'a pas accès aux
/// globales de la VM : une cascade de liens déclenchée par ce gel ne
/// pourra pas lire la valeur courante des variables liées (`lookup`
/// renvoie toujours `None` ici), donc aucun effet `Mirror`/`Inverse` ne
/// s'applique sur elles depuis ce point d'entrée.
fn native_grow(args: &[Value], rt: &Runtime) -> RResult<Value> {
    let name = arg_str(args, 0)?.to_string();
    let current = Phased::new(args.get(1).cloned().ok_or(RuntimeError::Arity { expected: 2, got: args.len() })?);
    let no_lookup = |_: &str| None;
    let (frozen, _cascades) = rt.seeds.grow(&rt.natives, rt, &name, &current, &no_lookup)?;
    Ok(frozen.value)
}

/// Identifiants des natifs de service C5, une fois enregistrés.
pub struct BuiltinIds {
    pub track: NativeId,
    pub history: NativeId,
    pub phases: NativeId,
    pub rewind: NativeId,
    pub pressurize: NativeId,
    pub depressurize: NativeId,
    pub pressure_of: NativeId,
    pub on_phase: NativeId,
    pub bond: NativeId,
    pub seed: NativeId,
    pub grow: NativeId,
}

/// Enregistre les natifs de service C5 dans `natives`, renvoyant leurs
/// identifiants pour que l'appelant les expose comme globales.
pub fn register(natives: &mut NativeRegistry) -> BuiltinIds {
    BuiltinIds {
        track: natives.register("lattice", "lattice.track", Some(1), native_track),
        history: natives.register("lattice", "lattice.history", Some(1), native_history),
        phases: natives.register("lattice", "lattice.phases", Some(1), native_phases),
        rewind: natives.register("lattice", "lattice.rewind", Some(2), native_rewind),
        pressurize: natives.register("lattice", "lattice.pressurize", Some(2), native_pressurize),
        depressurize: natives.register("lattice", "lattice.depressurize", Some(1), native_depressurize),
        pressure_of: natives.register("lattice", "lattice.pressure_of", Some(1), native_pressure_of),
        on_phase: natives.register("lattice", "lattice.on_phase", Some(3), native_on_phase),
        bond: natives.register("lattice", "lattice.bond", Some(3), native_bond),
        seed: natives.register("lattice", "lattice.seed", Some(2), native_seed),
        grow: natives.register("lattice", "lattice.grow", Some(2), native_grow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::lat_str;

    #[test]
    fn track_and_rewind_through_natives() {
        let mut rt = Runtime::new();
        let ids = register(&mut rt.natives);
        rt.natives.call(ids.track, &[Value::Str(lat_str("x"))], &rt).unwrap();
        rt.tracker.record_history("x", Phased::new(Value::Int(1))).unwrap();
        rt.tracker.record_history("x", Phased::new(Value::Int(2))).unwrap();

        let rewound =
            rt.natives.call(ids.rewind, &[Value::Str(lat_str("x")), Value::Int(1)], &rt).unwrap();
        assert_eq!(rewound, Value::Int(1));
    }

    #[test]
    fn pressurize_then_pressure_of_round_trips() {
        let mut rt = Runtime::new();
        let ids = register(&mut rt.natives);
        rt.natives
            .call(ids.pressurize, &[Value::Str(lat_str("x")), Value::Str(lat_str("no_grow"))], &rt)
            .unwrap();
        let mode = rt.natives.call(ids.pressure_of, &[Value::Str(lat_str("x"))], &rt).unwrap();
        assert_eq!(mode, Value::Str(lat_str("no_grow")));
    }

    #[test]
    fn bond_registers_a_pending_cascade() {
        let mut rt = Runtime::new();
        let ids = register(&mut rt.natives);
        rt.natives
            .call(
                ids.bond,
                &[Value::Str(lat_str("a")), Value::Str(lat_str("b")), Value::Str(lat_str("mirror"))],
                &rt,
            )
            .unwrap();
        assert_eq!(rt.bonds.pending_for("a"), 1);
    }

    fn always_true(_args: &[Value], _rt: &Runtime) -> RResult<Value> {
        Ok(Value::Bool(true))
    }

    #[test]
    fn seed_then_grow_freezes_on_a_passing_guard() {
        let mut rt = Runtime::new();
        let ids = register(&mut rt.natives);
        let guard_id = rt.natives.register("test", "test.always_true", Some(1), always_true);
        let guard_closure = Value::Closure(std::sync::Arc::new(lattice_core::value::Closure {
            params: vec![lat_str("v")],
            defaults: vec![],
            variadic: false,
            dispatch: Dispatch::Native(guard_id),
            upvalues: vec![],
            param_phases: None,
            env: None,
            name: Some(lat_str("always_true")),
        }));

        rt.natives.call(ids.seed, &[Value::Str(lat_str("x")), guard_closure], &rt).unwrap();
        let grown = rt.natives.call(ids.grow, &[Value::Str(lat_str("x")), Value::Int(5)], &rt).unwrap();
        assert_eq!(grown, Value::Int(5));
    }
}
