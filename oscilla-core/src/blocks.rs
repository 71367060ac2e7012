//! The built-in block library: a minimal but runnable set of blocks —
//! time roots, oscillators, grid/broadcast field ops, sample-and-hold, a
//! metronome, an embedded expression host, and a render sink — on top of
//! the block protocol `registry` defines.
//!
//! Every block that produces a Signal output pushes its own
//! `Step::EvalSig` immediately after allocating that output's slot, right
//! where the value is computed. This keeps step order trivially correct:
//! blocks lower in topological order, so a block's `EvalSig` is always
//! pushed before any downstream block that reads its slot gets a chance to
//! push its own steps. See `compiler::schedule_and_verify` for the pass
//! that checks this invariant rather than re-deriving order.

use crate::diagnostics::{codes, Diagnostic, Domain};
use crate::expr::{compile_expression, ExprSigEnv, ExprTypeEnv};
use crate::ir::{
    CameraMode, CameraSpec, EventExpr, FieldExpr, MathFn, RenderBinding, RenderSemantic, RenderSink, SigExpr,
    SinkKind, Step, TimeAxis, ValueRef,
};
use crate::registry::{BlockRegistry, Capability, LowerArgs, LowerResult, PortDef};
use crate::types::{AngleKind, Cardinality, Payload, Unit};
use fxhash::FxHashMap;

fn sig_ref(id: crate::ir::SigExprId, slot: crate::ir::SlotId, stride: usize) -> ValueRef {
    ValueRef::Sig { id, slot, stride }
}

fn f64_param(config: &FxHashMap<String, serde_json::Value>, key: &str, default: f64) -> f64 {
    config.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn u32_param(config: &FxHashMap<String, serde_json::Value>, key: &str, default: u32) -> u32 {
    config.get(key).and_then(|v| v.as_u64()).map(|v| v as u32).unwrap_or(default)
}

fn str_param(config: &FxHashMap<String, serde_json::Value>, key: &str, default: &str) -> String {
    config.get(key).and_then(|v| v.as_str()).unwrap_or(default).to_string()
}

fn scalar_ty(payload: Payload, unit: Unit) -> crate::types::CanonicalType {
    crate::types::canonical_type(payload, unit, crate::types::Extent::signal(crate::types::Temporality::Continuous))
}

/// `InfiniteTimeRoot`: the time-root block. Any patch with a render sink
/// must contain one of these.
fn lower_infinite_time_root(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, .. } = args;
    let t_ms = ctx.b.push_sig(SigExpr::Time(TimeAxis::TMs));
    let phase_a = ctx.b.push_sig(SigExpr::Time(TimeAxis::PhaseA));

    let t_slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::None));
    ctx.b.push_step(Step::EvalSig { sig: t_ms, slot: t_slot });
    let phase_slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::Angle(AngleKind::Phase01)));
    ctx.b.push_step(Step::EvalSig { sig: phase_a, slot: phase_slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("tMs".to_string(), sig_ref(t_ms, t_slot, 1));
    outputs_by_id.insert("phaseA".to_string(), sig_ref(phase_a, phase_slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `Oscillator`: `sin(2*pi*rate*t)` with `unit=none` (plain signal).
fn lower_oscillator(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, config, .. } = args;
    let rate = f64_param(&config, "rate", 1.0);

    let t_ms = ctx.b.push_sig(SigExpr::Time(TimeAxis::TMs));
    let rate_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(rate / 1000.0).unwrap()));
    let two_pi_c = ctx
        .b
        .push_sig(SigExpr::Const(ordered_float::NotNan::new(2.0 * std::f64::consts::PI).unwrap()));
    let phase = ctx.b.push_sig(SigExpr::Zip(MathFn::Mul, vec![t_ms, rate_c]));
    let angle = ctx.b.push_sig(SigExpr::Zip(MathFn::Mul, vec![phase, two_pi_c]));
    let value = ctx.b.push_sig(SigExpr::Map(MathFn::Sin, vec![angle]));

    let slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::None));
    ctx.b.push_step(Step::EvalSig { sig: value, slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), sig_ref(value, slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `PhaseOscillator`: same waveform as `Oscillator` but its output is
/// declared `unit=angle{phase01}` (a 0..1 ramp) rather than a bare signal,
/// so wiring it into a `unit=radians` input exercises adapter insertion
/// (Scenario 4).
fn lower_phase_oscillator(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, config, .. } = args;
    let rate = f64_param(&config, "rate", 1.0);

    let t_ms = ctx.b.push_sig(SigExpr::Time(TimeAxis::TMs));
    let rate_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(rate / 1000.0).unwrap()));
    let raw_phase = ctx.b.push_sig(SigExpr::Zip(MathFn::Mul, vec![t_ms, rate_c]));
    let one_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(1.0).unwrap()));
    let phase01 = ctx.b.push_sig(SigExpr::Zip(MathFn::Mod, vec![raw_phase, one_c]));

    let slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::Angle(AngleKind::Phase01)));
    ctx.b.push_step(Step::EvalSig { sig: phase01, slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), sig_ref(phase01, slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `phase01 -> radians` adapter: `radians = phase01 * 2*pi`.
fn lower_phase01_to_radians_adapter(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, inputs_by_id, .. } = args;
    let input = inputs_by_id.get("in").cloned().ok_or_else(|| {
        Diagnostic::error(
            codes::E_TYPE_MISMATCH,
            "adapter missing input",
            "phase01->radians adapter requires a wired 'in' port",
            crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
            Domain::Type,
        )
    })?;
    let in_sig = match input {
        ValueRef::Sig { id, .. } => id,
        _ => {
            return Err(Diagnostic::error(
                codes::E_TYPE_MISMATCH,
                "adapter type mismatch",
                "phase01->radians adapter only accepts Signal inputs",
                crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
                Domain::Type,
            ))
        }
    };
    let two_pi_c = ctx
        .b
        .push_sig(SigExpr::Const(ordered_float::NotNan::new(2.0 * std::f64::consts::PI).unwrap()));
    let radians = ctx.b.push_sig(SigExpr::Zip(MathFn::Mul, vec![in_sig, two_pi_c]));

    let slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::Angle(AngleKind::Radians)));
    ctx.b.push_step(Step::EvalSig { sig: radians, slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), sig_ref(radians, slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `GridLayout`: declares an instance domain of `count` cells, laid out as a
/// grid. Produces no signal output of its own; it exists only so a patch
/// can name a domain size for documentation/UI purposes. `BroadcastField`
/// (and any other field-producing block) is its own domain instance in
/// this minimal library — see DESIGN.md for why instance unification
/// doesn't need to thread a domain id back from `GridLayout` to its
/// consumers.
fn lower_grid_layout(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { ctx, .. } = args;
    let _ = ctx;
    Ok(LowerResult { outputs_by_id: FxHashMap::default() })
}

/// `BroadcastField`: broadcasts a Signal input into a Field of `count`
/// instances. The field's `InstanceRef` was already decided by the
/// compiler's type-resolution pass and handed to this
/// block via `ctx.out_types["out"]` — lowering reads it back rather than
/// invent its own, so the type the scheduler reasons about and the type
/// the runtime materializes against are the same value by construction.
fn lower_broadcast_field(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, inputs_by_id, config, .. } = args;
    let count = u32_param(&config, "count", 1);

    let input = inputs_by_id.get("in").cloned().ok_or_else(|| {
        Diagnostic::error(
            codes::E_TYPE_MISMATCH,
            "BroadcastField missing input",
            "BroadcastField requires a wired 'in' signal",
            crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
            Domain::Type,
        )
    })?;
    let in_sig = match input {
        ValueRef::Sig { id, .. } => id,
        ValueRef::Field { .. } => {
            return Err(Diagnostic::error(
                codes::E_TYPE_MISMATCH,
                "BroadcastField expects a Signal",
                "the 'in' port of BroadcastField must be a Signal (cardinality=one); wire a Field directly instead",
                crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
                Domain::Type,
            ))
        }
        ValueRef::Event { .. } => {
            return Err(Diagnostic::error(
                codes::E_TYPE_MISMATCH,
                "BroadcastField expects a Signal",
                "the 'in' port of BroadcastField cannot be an event",
                crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
                Domain::Type,
            ))
        }
    };

    let out_ty = ctx.out_types.get("out").cloned().ok_or_else(|| {
        Diagnostic::error(
            codes::E_UNRESOLVED_INSTANCE,
            "BroadcastField has no resolved output type",
            "internal: type resolution did not assign 'out' a field instance",
            crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
            Domain::Type,
        )
    })?;
    let instance = match &out_ty.extent.cardinality {
        Cardinality::Many(inst) => inst.clone(),
        Cardinality::One => {
            return Err(Diagnostic::error(
                codes::E_UNRESOLVED_INSTANCE,
                "BroadcastField output did not resolve to a field",
                "internal: 'out' must be cardinality=many",
                crate::address::CanonicalAddress::Block { name: ctx.label.clone() },
                Domain::Type,
            ))
        }
    };

    let broadcast = ctx.b.push_field(FieldExpr::Broadcast(in_sig));
    let slot = ctx.b.alloc_slot(out_ty);
    ctx.b.push_step(Step::Materialize { field: broadcast, instance: instance.clone(), slot, count });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), ValueRef::Field { id: broadcast, slot, stride: 1, instance });
    Ok(LowerResult { outputs_by_id })
}

/// `SampleHold`: captures its `in` input whenever `trigger` fires, otherwise
/// holds the last captured value. Read-before-write state (Scenario 5):
/// `out` reads the state slot *before* this frame's write takes effect —
/// the runtime defers `StateWrite`'s actual store to end-of-frame, so the
/// order `StateWrite`/`EvalSig` are pushed in here does not matter for
/// correctness, only for step-list legibility.
fn lower_sample_hold(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, inputs_by_id, config, .. } = args;
    let initial = f64_param(&config, "initial", 0.0);

    let state_id = ctx.stable_state_id("samplehold");
    let state_slot = ctx.b.alloc_state_slot(state_id, crate::ir::StateInitialValue::Scalar(initial));

    let held = ctx.b.push_sig(SigExpr::StateRead(state_slot));

    let in_sig = match inputs_by_id.get("in") {
        Some(ValueRef::Sig { id, .. }) => Some(*id),
        _ => None,
    };
    let trigger_slot = match inputs_by_id.get("trigger") {
        Some(ValueRef::Event { slot, .. }) => Some(*slot),
        _ => None,
    };

    // new_value = trigger ? in : held
    let new_value = match (in_sig, trigger_slot) {
        (Some(in_sig), Some(trigger_slot)) => {
            let trigger_read = ctx.b.push_sig(SigExpr::EventRead(trigger_slot));
            ctx.b.push_sig(SigExpr::Zip(MathFn::Ternary, vec![trigger_read, in_sig, held]))
        }
        _ => held,
    };

    ctx.b.push_step(Step::StateWrite { state_slot, src: new_value });

    let slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::None));
    let out_read = ctx.b.push_sig(SigExpr::StateRead(state_slot));
    ctx.b.push_step(Step::EvalSig { sig: out_read, slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), sig_ref(out_read, slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `Metronome`: emits a `tick` event that is high for the first `duty`
/// fraction of every `rate`-Hz cycle. Level-based, not edge-triggered — it
/// can read high for more than one consecutive frame if the frame rate is
/// fast relative to `rate * duty`; `SampleHold` downstream only cares that
/// it reads high at least once per cycle.
fn lower_metronome(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, config, .. } = args;
    let rate = f64_param(&config, "rate", 1.0);
    let duty = f64_param(&config, "duty", 0.05);

    let t_ms = ctx.b.push_sig(SigExpr::Time(TimeAxis::TMs));
    let rate_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(rate / 1000.0).unwrap()));
    let one_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(1.0).unwrap()));
    let duty_c = ctx.b.push_sig(SigExpr::Const(ordered_float::NotNan::new(duty).unwrap()));
    let raw_phase = ctx.b.push_sig(SigExpr::Zip(MathFn::Mul, vec![t_ms, rate_c]));
    let phase01 = ctx.b.push_sig(SigExpr::Zip(MathFn::Mod, vec![raw_phase, one_c]));
    let within_duty = ctx.b.push_sig(SigExpr::Zip(MathFn::Lt, vec![phase01, duty_c]));

    let tick = ctx.b.push_event(EventExpr::Pulse(within_duty));
    let event_slot = ctx.b.alloc_event_slot();
    ctx.b.push_step(Step::EvalEvent { event: tick, slot: event_slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("tick".to_string(), ValueRef::Event { id: tick, slot: event_slot });
    Ok(LowerResult { outputs_by_id })
}

/// `Expression`: the embedded mini-compiler's host block. `refs` is its
/// unified vararg input: each connection is exposed to the expression both
/// as `in<N>` and as `Block.port` when the source block has a display name.
fn lower_expression(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, inputs_by_id, vararg_inputs_by_id, config } = args;
    let text = str_param(&config, "text", "0");
    let target = crate::address::CanonicalAddress::Block { name: ctx.label.clone() };

    let mut sig_env = ExprSigEnv { vars: FxHashMap::default() };
    let type_env = ExprTypeEnv { vars: FxHashMap::default() };

    for (name, v) in inputs_by_id.iter() {
        if let ValueRef::Sig { id, .. } = v {
            sig_env.vars.insert(name.clone(), *id);
        }
    }

    if let Some(refs) = vararg_inputs_by_id.as_ref().and_then(|m| m.get("refs")) {
        for (i, conn) in refs.iter().enumerate() {
            if let ValueRef::Sig { id, .. } = conn.value {
                sig_env.vars.insert(format!("in{}", i), id);
                sig_env.vars.insert(conn.source_address.clone(), id);
            }
        }
    }

    let addr = ctx.address_registry;
    let value = compile_expression(&text, &type_env, &sig_env, addr, &target, ctx.b)?;

    let slot = ctx.b.alloc_slot(scalar_ty(Payload::Float, Unit::None));
    ctx.b.push_step(Step::EvalSig { sig: value, slot });

    let mut outputs_by_id = FxHashMap::default();
    outputs_by_id.insert("out".to_string(), sig_ref(value, slot, 1));
    Ok(LowerResult { outputs_by_id })
}

/// `RenderSink`: the render capability. Assembles a `renderPass` step for
/// the `color` binding (the only binding this minimal library wires up).
/// `color` is a scalar luminance signal here, not a 4-component RGBA value —
/// no block in this library produces a genuine multi-component signal.
fn lower_render_sink(args: LowerArgs) -> Result<LowerResult, Diagnostic> {
    let LowerArgs { mut ctx, inputs_by_id, config, .. } = args;
    let sink_id = str_param(&config, "sinkId", "main");

    let mut bindings = Vec::new();
    match inputs_by_id.get("color") {
        Some(ValueRef::Sig { slot, stride, .. }) => {
            bindings.push(RenderBinding { semantic: RenderSemantic::Color, from: *slot, count: 1, stride: *stride });
        }
        Some(ValueRef::Field { slot, stride, .. }) => {
            bindings.push(RenderBinding { semantic: RenderSemantic::Color, from: *slot, count: 1, stride: *stride });
        }
        _ => {}
    }
    if let Some(ValueRef::Sig { slot, stride, .. }) = inputs_by_id.get("position") {
        bindings.push(RenderBinding { semantic: RenderSemantic::Position, from: *slot, count: 1, stride: *stride });
    }

    ctx.b.push_step(Step::RenderPass {
        sink: RenderSink { kind: SinkKind::Canvas, id: sink_id },
        bindings,
        camera: Some(CameraSpec { mode: CameraMode::Ortho, view: [0.0; 16], proj: [0.0; 16] }),
    });

    Ok(LowerResult { outputs_by_id: FxHashMap::default() })
}

pub fn register_builtins(reg: &mut BlockRegistry) {
    reg.register(crate::registry::BlockDef {
        type_name: "InfiniteTimeRoot",
        inputs: vec![],
        outputs: vec![
            PortDef::signal("tMs", Payload::Float, Unit::None),
            PortDef::signal("phaseA", Payload::Float, Unit::Angle(AngleKind::Phase01)),
        ],
        params: vec![],
        capability: Capability::Pure,
        lower: lower_infinite_time_root,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "Oscillator",
        inputs: vec![],
        outputs: vec![PortDef::signal("out", Payload::Float, Unit::None)],
        params: vec!["rate"],
        capability: Capability::Pure,
        lower: lower_oscillator,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "PhaseOscillator",
        inputs: vec![],
        outputs: vec![PortDef::signal("out", Payload::Float, Unit::Angle(AngleKind::Phase01))],
        params: vec!["rate"],
        capability: Capability::Pure,
        lower: lower_phase_oscillator,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "adapter_phase01_to_radians",
        inputs: vec![PortDef::signal("in", Payload::Float, Unit::Angle(AngleKind::Phase01))],
        outputs: vec![PortDef::signal("out", Payload::Float, Unit::Angle(AngleKind::Radians))],
        params: vec![],
        capability: Capability::Pure,
        lower: lower_phase01_to_radians_adapter,
    });
    reg.register_adapter(
        Payload::Float,
        Unit::Angle(AngleKind::Phase01),
        Payload::Float,
        Unit::Angle(AngleKind::Radians),
        "adapter_phase01_to_radians",
    );

    reg.register(crate::registry::BlockDef {
        type_name: "GridLayout",
        inputs: vec![],
        outputs: vec![],
        params: vec!["count"],
        capability: Capability::Pure,
        lower: lower_grid_layout,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "BroadcastField",
        inputs: vec![PortDef::signal("in", Payload::Float, Unit::None)],
        outputs: vec![PortDef::field("out", Payload::Float, Unit::None, "grid")],
        params: vec!["count"],
        capability: Capability::Pure,
        lower: lower_broadcast_field,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "SampleHold",
        inputs: vec![
            PortDef::signal("in", Payload::Float, Unit::None),
            PortDef::event("trigger", Payload::Bool, Unit::None),
        ],
        outputs: vec![PortDef::signal("out", Payload::Float, Unit::None)],
        params: vec!["initial"],
        capability: Capability::State,
        lower: lower_sample_hold,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "Metronome",
        inputs: vec![],
        outputs: vec![PortDef::event("tick", Payload::Bool, Unit::None)],
        params: vec!["rate", "duty"],
        capability: Capability::Pure,
        lower: lower_metronome,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "Expression",
        inputs: vec![
            PortDef::signal("in0", Payload::Float, Unit::None),
            PortDef::signal("in1", Payload::Float, Unit::None),
        ],
        outputs: vec![PortDef::signal("out", Payload::Float, Unit::None)],
        params: vec!["text"],
        capability: Capability::Pure,
        lower: lower_expression,
    });

    reg.register(crate::registry::BlockDef {
        type_name: "RenderSink",
        inputs: vec![
            PortDef::signal("color", Payload::Float, Unit::None),
            PortDef::signal("position", Payload::Vec2, Unit::None),
        ],
        outputs: vec![],
        params: vec!["sinkId"],
        capability: Capability::Render,
        lower: lower_render_sink,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IRBuilder;
    use crate::patch::BlockIdx;
    use crate::registry::LowerCtx;

    fn ctx(b: &mut IRBuilder) -> LowerCtx<'_> {
        LowerCtx {
            b,
            block_idx: BlockIdx(0),
            instance_id: "osc1".to_string(),
            label: "osc1".to_string(),
            seed_const_id: 0,
            in_types: FxHashMap::default(),
            out_types: FxHashMap::default(),
            address_registry: None,
            vararg_connections: None,
        }
    }

    #[test]
    fn oscillator_value_at_half_second_matches_sine() {
        let mut b = IRBuilder::new();
        let mut config = FxHashMap::default();
        config.insert("rate".to_string(), serde_json::json!(1.0));
        let args = LowerArgs {
            ctx: ctx(&mut b),
            inputs_by_id: FxHashMap::default(),
            vararg_inputs_by_id: None,
            config,
        };
        let result = lower_oscillator(args).unwrap();
        let out = result.outputs_by_id.get("out").unwrap();
        let sig_id = match out {
            ValueRef::Sig { id, .. } => *id,
            _ => panic!("expected signal"),
        };

        // Evaluate by hand against t_ms = 500.0 the way the runtime would.
        fn eval(b: &IRBuilder, id: crate::ir::SigExprId, t_ms: f64) -> f64 {
            match b.sig(id) {
                SigExpr::Const(c) => c.into_inner(),
                SigExpr::Time(TimeAxis::TMs) => t_ms,
                SigExpr::Map(MathFn::Sin, args) => eval(b, args[0], t_ms).sin(),
                SigExpr::Zip(MathFn::Mul, args) => eval(b, args[0], t_ms) * eval(b, args[1], t_ms),
                other => panic!("unexpected expr in test eval: {:?}", other),
            }
        }

        let v = eval(&b, sig_id, 500.0);
        let expected = (2.0 * std::f64::consts::PI * 0.5).sin();
        assert!((v - expected).abs() < 1e-9, "got {} expected {}", v, expected);
    }

    #[test]
    fn metronome_ticks_only_within_duty_fraction_of_cycle() {
        let mut b = IRBuilder::new();
        let mut config = FxHashMap::default();
        config.insert("rate".to_string(), serde_json::json!(1.0));
        config.insert("duty".to_string(), serde_json::json!(0.1));
        let args = LowerArgs {
            ctx: ctx(&mut b),
            inputs_by_id: FxHashMap::default(),
            vararg_inputs_by_id: None,
            config,
        };
        let result = lower_metronome(args).unwrap();
        let (event_id, _slot) = match result.outputs_by_id.get("tick").unwrap() {
            ValueRef::Event { id, slot } => (*id, *slot),
            other => panic!("expected an event, got {:?}", other),
        };

        fn eval_sig(b: &IRBuilder, id: crate::ir::SigExprId, t_ms: f64) -> f64 {
            match b.sig(id) {
                SigExpr::Const(c) => c.into_inner(),
                SigExpr::Time(TimeAxis::TMs) => t_ms,
                SigExpr::Zip(MathFn::Mul, args) => eval_sig(b, args[0], t_ms) * eval_sig(b, args[1], t_ms),
                SigExpr::Zip(MathFn::Mod, args) => eval_sig(b, args[0], t_ms).rem_euclid(eval_sig(b, args[1], t_ms)),
                SigExpr::Zip(MathFn::Lt, args) => {
                    if eval_sig(b, args[0], t_ms) < eval_sig(b, args[1], t_ms) {
                        1.0
                    } else {
                        0.0
                    }
                }
                other => panic!("unexpected expr in test eval: {:?}", other),
            }
        }

        fn fires(b: &IRBuilder, event_id: crate::ir::EventExprId, t_ms: f64) -> bool {
            match b.event(event_id) {
                EventExpr::Pulse(sig) => eval_sig(b, *sig, t_ms) > 0.5,
                other => panic!("unexpected event in test eval: {:?}", other),
            }
        }

        // one cycle is 1000ms; duty=0.1 means the first 100ms of each cycle.
        assert!(fires(&b, event_id, 0.0));
        assert!(fires(&b, event_id, 50.0));
        assert!(!fires(&b, event_id, 500.0));
        assert!(fires(&b, event_id, 1050.0));
    }

    #[test]
    fn broadcast_field_reads_instance_from_resolved_out_type() {
        use crate::types::{canonical_type, Extent, InstanceRef, Temporality};

        let mut b = IRBuilder::new();
        let in_sig = b.push_sig(SigExpr::Const(ordered_float::NotNan::new(0.5).unwrap()));
        let mut inputs_by_id = FxHashMap::default();
        inputs_by_id.insert(
            "in".to_string(),
            ValueRef::Sig { id: in_sig, slot: b.alloc_slot(scalar_ty(Payload::Float, Unit::None)), stride: 1 },
        );

        let instance = InstanceRef { domain_type: "grid".to_string(), instance_id: 3 };
        let mut out_types = FxHashMap::default();
        out_types.insert(
            "out".to_string(),
            canonical_type(Payload::Float, Unit::None, Extent::field(instance.clone(), Temporality::Continuous)),
        );

        let mut config = FxHashMap::default();
        config.insert("count".to_string(), serde_json::json!(4));

        let mut lower_ctx = ctx(&mut b);
        lower_ctx.out_types = out_types;
        let args = LowerArgs { ctx: lower_ctx, inputs_by_id, vararg_inputs_by_id: None, config };

        let result = lower_broadcast_field(args).unwrap();
        match result.outputs_by_id.get("out").unwrap() {
            ValueRef::Field { instance: got, .. } => assert_eq!(got, &instance),
            other => panic!("expected field, got {:?}", other),
        }
    }
}
