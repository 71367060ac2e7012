//! Per-frame executor: advance time, zero event scalars, run the schedule,
//! assemble render passes, sample the tap.

use crate::error::InternalError;
use crate::ir::{
    EventExpr, FieldExpr, IRProgram, MathFn, RenderBinding, RenderSink, SigExpr, Step, TimeAxis,
};
use crate::tap::{DebugSnapshot, DebugTap, RuntimeHealth};
use fxhash::FxHashMap;

#[derive(Clone, Copy, Debug, Default)]
pub struct TimeState {
    pub t_ms: f64,
    pub dt: f64,
    pub phase_a: f64,
    pub phase_b: f64,
    pub energy: f64,
}

#[derive(Clone, Debug)]
pub enum StateValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Field buffers keyed by slot. `get_or_alloc` reuses an existing `Vec`
/// whose capacity already matches, so steady-state frames (same instance
/// count every frame, the common case) allocate nothing.
#[derive(Default)]
pub struct BufferPool {
    buffers: FxHashMap<u32, Vec<f64>>,
}

impl BufferPool {
    fn get_or_alloc(&mut self, slot: crate::ir::SlotId, len: usize) -> &mut Vec<f64> {
        let key = slot.index() as u32;
        let buf = self.buffers.entry(key).or_insert_with(Vec::new);
        if buf.len() != len {
            buf.resize(len, 0.0);
        }
        buf
    }

    pub fn get(&self, slot: crate::ir::SlotId) -> Option<&[f64]> {
        self.buffers.get(&(slot.index() as u32)).map(Vec::as_slice)
    }
}

/// The mutable store a compiled program executes against. `value_store`
/// holds one `f64` per non-field slot — every block
/// in the built-in library only ever produces scalar signals, so a
/// multi-component `valueStore.f64[]` row per slot (as a literal reading of
/// `stride` would suggest) has no producer to exercise it yet; see
/// DESIGN.md.
pub struct RuntimeState {
    pub value_store: Vec<f64>,
    pub event_scalars: Vec<u8>,
    pub state_store: FxHashMap<String, StateValue>,
    pub buffer_pool: BufferPool,
    pub time: TimeState,
}

impl RuntimeState {
    fn new(program: &IRProgram) -> RuntimeState {
        let mut state_store = FxHashMap::default();
        for meta in &program.state_slot_meta {
            let initial = match &meta.initial_value {
                crate::ir::StateInitialValue::Scalar(v) => StateValue::Scalar(*v),
                crate::ir::StateInitialValue::Vector(v) => StateValue::Vector(v.clone()),
            };
            state_store.insert(meta.stable_state_id.clone(), initial);
        }
        RuntimeState {
            value_store: vec![0.0; program.slot_meta.len()],
            event_scalars: vec![0u8; program.event_slot_count],
            state_store,
            buffer_pool: BufferPool::default(),
            time: TimeState::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderPass {
    pub sink: RenderSink,
    pub bindings: Vec<RenderBinding>,
    pub camera: Option<crate::ir::CameraSpec>,
}

/// Owns one compiled program's execution state across frames.
pub struct Runtime {
    program: IRProgram,
    state: RuntimeState,
    tap: Option<Box<dyn DebugTap>>,
    last_ms: Option<f64>,
    last_tap_sample_ms: Option<f64>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(program: IRProgram) -> Runtime {
        let state = RuntimeState::new(&program);
        log::debug!(
            "runtime created: {} slots, {} state slots, {} event slots",
            program.slot_meta.len(),
            program.state_slot_meta.len(),
            program.event_slot_count
        );
        Runtime { program, state, tap: None, last_ms: None, last_tap_sample_ms: None, health: RuntimeHealth::default() }
    }

    pub fn set_tap(&mut self, tap: Option<Box<dyn DebugTap>>) {
        self.tap = tap;
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn read_slot(&self, slot: crate::ir::SlotId) -> f64 {
        self.state.value_store[slot.index()]
    }

    pub fn read_field(&self, slot: crate::ir::SlotId) -> &[f64] {
        self.state.buffer_pool.get(slot).unwrap_or(&[])
    }

    /// Carries forward `state_store` entries whose `stable_state_id` appears
    /// in both programs' `state_slot_meta`. Entries unique to the old program are
    /// dropped; entries unique to the new program keep their fresh initial
    /// value (already seeded by `RuntimeState::new`).
    pub fn migrate_state(&mut self, new_program: IRProgram) {
        let new_ids: std::collections::HashSet<&str> =
            new_program.state_slot_meta.iter().map(|m| m.stable_state_id.as_str()).collect();
        self.state.state_store.retain(|id, _| new_ids.contains(id.as_str()));

        for meta in &new_program.state_slot_meta {
            self.state.state_store.entry(meta.stable_state_id.clone()).or_insert_with(|| match &meta.initial_value {
                crate::ir::StateInitialValue::Scalar(v) => StateValue::Scalar(*v),
                crate::ir::StateInitialValue::Vector(v) => StateValue::Vector(v.clone()),
            });
        }

        self.state.value_store = vec![0.0; new_program.slot_meta.len()];
        self.state.event_scalars = vec![0u8; new_program.event_slot_count];
        self.state.buffer_pool = BufferPool::default();
        self.program = new_program;
        log::debug!("state migrated across recompile");
    }

    pub fn execute_frame(&mut self, now_ms: f64) -> Result<Vec<RenderPass>, InternalError> {
        let dt = match self.last_ms {
            Some(last) => now_ms - last,
            None => 0.0,
        };
        self.last_ms = Some(now_ms);

        self.state.time.t_ms = now_ms;
        self.state.time.dt = dt;
        self.state.time.phase_a = (now_ms / 1000.0).fract();
        self.state.time.phase_b = (now_ms / 4000.0).fract();
        self.state.time.energy = 0.0;

        for slot in self.state.event_scalars.iter_mut() {
            *slot = 0;
        }

        if let Some(tap) = self.tap.as_mut() {
            tap.set_time(now_ms);
        }

        let should_sample = match self.last_tap_sample_ms {
            None => true,
            Some(last) => now_ms - last >= crate::config::tap_sample_interval_ms(),
        };

        let mut passes = Vec::new();
        let mut pending_state_writes: Vec<(crate::ir::StateSlotId, f64)> = Vec::new();

        let steps = self.program.steps.clone();
        for step in &steps {
            match step {
                Step::EvalSig { sig, slot } => {
                    let value = self.eval_sig(*sig)?;
                    self.state.value_store[slot.index()] = value;
                    self.track_health(value);
                    if should_sample {
                        if let Some(tap) = self.tap.as_mut() {
                            tap.record_slot_value(*slot, value);
                        }
                    }
                }
                Step::Materialize { field, instance, slot, count } => {
                    let stride = self.program.slot_meta[slot.index()].stride;
                    let values = self.eval_field(*field, *count as usize)?;
                    let _ = instance;
                    let buf = self.state.buffer_pool.get_or_alloc(*slot, (*count as usize) * stride);
                    for (i, v) in values.iter().enumerate() {
                        for s in 0..stride {
                            buf[i * stride + s] = *v;
                        }
                    }
                }
                Step::StateWrite { state_slot, src } => {
                    let value = self.eval_sig(*src)?;
                    pending_state_writes.push((*state_slot, value));
                }
                Step::EvalEvent { event, slot } => {
                    if self.eval_event(*event)? {
                        self.state.event_scalars[slot.index() as usize] = 1;
                    }
                }
                Step::RenderPass { sink, bindings, camera } => {
                    passes.push(RenderPass { sink: sink.clone(), bindings: bindings.clone(), camera: camera.clone() });
                }
                Step::Projection { camera: _, from, to } => {
                    let stride = self.program.slot_meta[from.index()].stride;
                    let len = self.state.buffer_pool.get(*from).map(|s| s.len()).unwrap_or(0);
                    let src = self.state.buffer_pool.get(*from).map(|s| s.to_vec()).unwrap_or_default();
                    let dst = self.state.buffer_pool.get_or_alloc(*to, len.max(stride));
                    dst[..src.len()].copy_from_slice(&src);
                }
            }
        }

        for (state_slot, value) in pending_state_writes {
            let id = &self.program.state_slot_meta[state_slot.index()].stable_state_id;
            self.state.state_store.insert(id.clone(), StateValue::Scalar(value));
        }

        if should_sample {
            if let Some(tap) = self.tap.as_mut() {
                let snapshot = DebugSnapshot {
                    patch_revision: 0,
                    t_ms: now_ms,
                    bus_now: Vec::new(),
                    health: self.health.clone(),
                };
                tap.on_snapshot(&snapshot);
            }
            self.last_tap_sample_ms = Some(now_ms);
        }

        Ok(passes)
    }

    fn track_health(&mut self, value: f64) {
        if value.is_nan() {
            self.health.nan_count += 1;
        } else if value.is_infinite() {
            self.health.inf_count += 1;
        }
    }

    fn eval_sig(&self, id: crate::ir::SigExprId) -> Result<f64, InternalError> {
        match self.program.sig_exprs.get(id.index()).ok_or_else(|| InternalError::SlotOutOfRange(id.index(), self.program.sig_exprs.len()))? {
            SigExpr::Const(c) => Ok(c.into_inner()),
            SigExpr::Slot(slot) => self
                .state
                .value_store
                .get(slot.index())
                .copied()
                .ok_or_else(|| InternalError::SlotOutOfRange(slot.index(), self.state.value_store.len())),
            SigExpr::Time(axis) => Ok(match axis {
                TimeAxis::TMs => self.state.time.t_ms,
                TimeAxis::Dt => self.state.time.dt,
                TimeAxis::PhaseA => self.state.time.phase_a,
                TimeAxis::PhaseB => self.state.time.phase_b,
                TimeAxis::Energy => self.state.time.energy,
            }),
            SigExpr::External(_name) => Ok(0.0),
            SigExpr::Map(f, args) => {
                let a = self.eval_sig(args[0])?;
                Ok(apply_unary(*f, a))
            }
            SigExpr::Zip(MathFn::Ternary, args) => {
                let cond = self.eval_sig(args[0])?;
                if cond > 0.5 {
                    self.eval_sig(args[1])
                } else {
                    self.eval_sig(args[2])
                }
            }
            SigExpr::Zip(f, args) => {
                let mut it = args.iter();
                let first = self.eval_sig(*it.next().expect("Zip has at least one arg"))?;
                it.try_fold(first, |acc, &id| Ok(apply_binary(*f, acc, self.eval_sig(id)?)))
            }
            SigExpr::StateRead(state_slot) => {
                let meta = &self.program.state_slot_meta[state_slot.index()];
                Ok(match self.state.state_store.get(&meta.stable_state_id) {
                    Some(StateValue::Scalar(v)) => *v,
                    Some(StateValue::Vector(v)) => v.first().copied().unwrap_or(0.0),
                    None => 0.0,
                })
            }
            SigExpr::ShapeRef(inner) => self.eval_sig(*inner),
            SigExpr::EventRead(event_slot) => {
                Ok(*self.state.event_scalars.get(event_slot.index() as usize).unwrap_or(&0) as f64)
            }
        }
    }

    fn eval_field(&self, id: crate::ir::FieldExprId, count: usize) -> Result<Vec<f64>, InternalError> {
        match &self.program.field_exprs[id.index()] {
            FieldExpr::Broadcast(sig) => {
                let v = self.eval_sig(*sig)?;
                Ok(vec![v; count])
            }
            FieldExpr::Materialize { from, count: c, .. } => {
                let v = self.eval_sig(*from)?;
                Ok(vec![v; *c as usize])
            }
            FieldExpr::IndexMap { input, map } => {
                let base = self.eval_field(*input, count)?;
                let m = self.eval_sig(*map)?;
                Ok(base.into_iter().map(|v| v * m).collect())
            }
            FieldExpr::Lens { input, .. } => self.eval_field(*input, count),
        }
    }

    fn eval_event(&self, id: crate::ir::EventExprId) -> Result<bool, InternalError> {
        match &self.program.event_exprs[id.index()] {
            EventExpr::Const(b) => Ok(*b),
            EventExpr::Pulse(sig) => Ok(self.eval_sig(*sig)? > 0.5),
            EventExpr::Wrap(sig) => {
                let v = self.eval_sig(*sig)?;
                Ok(v < 0.0 || v >= 1.0)
            }
            EventExpr::Combine(ids) => {
                for id in ids {
                    if self.eval_event(*id)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            EventExpr::Never => Ok(false),
        }
    }
}

fn apply_unary(f: MathFn, a: f64) -> f64 {
    match f {
        MathFn::Sin => a.sin(),
        MathFn::Cos => a.cos(),
        MathFn::Abs => a.abs(),
        MathFn::Neg => -a,
        MathFn::Clamp01 => a.clamp(0.0, 1.0),
        MathFn::Not => {
            if a > 0.5 {
                0.0
            } else {
                1.0
            }
        }
        other => {
            log::warn!("{:?} applied as unary with a single argument; treating as identity", other);
            a
        }
    }
}

fn apply_binary(f: MathFn, a: f64, b: f64) -> f64 {
    match f {
        MathFn::Add => a + b,
        MathFn::Sub => a - b,
        MathFn::Mul => a * b,
        MathFn::Div => {
            if b == 0.0 {
                0.0
            } else {
                a / b
            }
        }
        MathFn::Mod => {
            if b == 0.0 {
                0.0
            } else {
                a.rem_euclid(b)
            }
        }
        MathFn::Min => a.min(b),
        MathFn::Max => a.max(b),
        MathFn::Gt => bool_to_f64(a > b),
        MathFn::Lt => bool_to_f64(a < b),
        MathFn::Eq => bool_to_f64((a - b).abs() < f64::EPSILON),
        MathFn::And => bool_to_f64(a > 0.5 && b > 0.5),
        MathFn::Or => bool_to_f64(a > 0.5 || b > 0.5),
        MathFn::Mix => a + (b - a) * 0.5,
        MathFn::Ternary => unreachable!("Ternary is handled in eval_sig before reaching apply_binary"),
        other => {
            log::warn!("{:?} applied as binary; treating as Add", other);
            a + b
        }
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions, CompileResult};
    use crate::patch::{Block, Edge, EdgeRole, Patch, PortAddress, Role};
    use crate::registry::BlockRegistry;

    fn compiled(patch: &Patch) -> IRProgram {
        let reg = BlockRegistry::default();
        match compile(patch, &reg, &CompileOptions::default()) {
            CompileResult::Ok { program, .. } => program,
            CompileResult::Err { errors } => panic!("compile failed: {:?}", errors),
        }
    }

    fn time_root_oscillator_sink() -> Patch {
        let mut patch = Patch::new();
        patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
        let osc = patch.add_block(Block::new("Osc", "Oscillator").with_param("rate", serde_json::json!(1.0)));
        let sink = patch.add_block(Block::new("Sink", "RenderSink"));
        patch.add_edge(Edge {
            from: PortAddress { block: osc, port: "out".to_string() },
            to: PortAddress { block: sink, port: "color".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });
        patch
    }

    #[test]
    fn frame_at_500ms_matches_sine_of_half_a_cycle() {
        use crate::address::CanonicalAddress;
        use crate::ir::ValueRef;

        let patch = time_root_oscillator_sink();
        let reg = BlockRegistry::default();
        let (program, debug_graph) = match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Ok { program, debug_graph, .. } => (program, debug_graph),
            CompileResult::Err { errors } => panic!("compile failed: {:?}", errors),
        };
        let osc_slot = match debug_graph.probe_port(&CanonicalAddress::BlockOutput { block: "osc".to_string(), port: "out".to_string() }.to_string()) {
            Some(entry) => match &entry.value {
                ValueRef::Sig { slot, .. } => *slot,
                other => panic!("expected a signal, got {:?}", other),
            },
            None => panic!("osc.out not found in debug graph"),
        };

        let mut rt = Runtime::new(program);
        let passes = rt.execute_frame(500.0).unwrap();
        assert_eq!(passes.len(), 1);

        let v = rt.read_slot(osc_slot);
        let expected = (2.0 * std::f64::consts::PI * 0.5).sin();
        assert!((v - expected).abs() < 1e-9, "got {} expected {}", v, expected);
    }

    #[test]
    fn event_scalars_reset_each_frame() {
        let patch = time_root_oscillator_sink();
        let program = compiled(&patch);
        let mut rt = Runtime::new(program);
        rt.state.event_scalars = vec![1, 0, 1];
        rt.execute_frame(16.0).unwrap();
        assert!(rt.state.event_scalars.iter().all(|&b| b == 0 || b == 1));
    }

    #[test]
    fn migrate_state_preserves_matching_stable_ids() {
        let mut patch = Patch::new();
        patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
        let hold = patch.add_block(Block::new("Hold", "SampleHold").with_param("initial", serde_json::json!(0.0)));
        let sink = patch.add_block(Block::new("Sink", "RenderSink"));
        patch.add_edge(Edge {
            from: PortAddress { block: hold, port: "out".to_string() },
            to: PortAddress { block: sink, port: "color".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });

        let program1 = compiled(&patch);
        let mut rt = Runtime::new(program1);
        rt.state.state_store.insert("hold::samplehold".to_string(), StateValue::Scalar(0.73));

        let program2 = compiled(&patch);
        rt.migrate_state(program2);

        match rt.state.state_store.get("hold::samplehold") {
            Some(StateValue::Scalar(v)) => assert_eq!(*v, 0.73),
            other => panic!("expected preserved scalar state, got {:?}", other),
        }
    }

    fn metronome_sample_hold_patch() -> Patch {
        let mut patch = Patch::new();
        patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
        let osc = patch.add_block(Block::new("Osc", "Oscillator").with_param("rate", serde_json::json!(0.25)));
        let metro = patch
            .add_block(Block::new("Metro", "Metronome").with_param("rate", serde_json::json!(1.0)).with_param("duty", serde_json::json!(0.1)));
        let hold = patch.add_block(Block::new("Hold", "SampleHold").with_param("initial", serde_json::json!(0.0)));
        let sink = patch.add_block(Block::new("Sink", "RenderSink"));
        patch.add_edge(Edge {
            from: PortAddress { block: osc, port: "out".to_string() },
            to: PortAddress { block: hold, port: "in".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });
        patch.add_edge(Edge {
            from: PortAddress { block: metro, port: "tick".to_string() },
            to: PortAddress { block: hold, port: "trigger".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });
        patch.add_edge(Edge {
            from: PortAddress { block: hold, port: "out".to_string() },
            to: PortAddress { block: sink, port: "color".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });
        patch
    }

    #[test]
    fn sample_hold_captures_oscillator_on_tick_and_survives_recompile() {
        let patch = metronome_sample_hold_patch();
        let program1 = compiled(&patch);
        let mut rt = Runtime::new(program1);

        // Metronome is high for the first 100ms of every 1000ms cycle, so a
        // frame at t=0 falls inside the duty window and should capture
        // whatever the oscillator reads at that instant.
        rt.execute_frame(0.0).unwrap();
        let expected = (2.0 * std::f64::consts::PI * 0.25 * 0.0).sin();
        match rt.state.state_store.get("hold::samplehold") {
            Some(StateValue::Scalar(v)) => assert!((*v - expected).abs() < 1e-9, "got {} expected {}", v, expected),
            other => panic!("expected captured scalar state, got {:?}", other),
        }

        // A later frame outside the duty window must not disturb the hold.
        rt.execute_frame(500.0).unwrap();
        match rt.state.state_store.get("hold::samplehold") {
            Some(StateValue::Scalar(v)) => assert!((*v - expected).abs() < 1e-9, "hold value drifted outside the duty window"),
            other => panic!("expected preserved scalar state, got {:?}", other),
        }

        // Recompiling (e.g. after an unrelated patch edit) must migrate the
        // captured value across, not reset it to `initial`.
        let mut patch2 = patch;
        patch2.add_block(Block::new("Spare", "Oscillator").with_param("rate", serde_json::json!(2.0)));
        let program2 = compiled(&patch2);
        rt.migrate_state(program2);

        match rt.state.state_store.get("hold::samplehold") {
            Some(StateValue::Scalar(v)) => assert!((*v - expected).abs() < 1e-9, "migrate_state lost the captured value"),
            other => panic!("expected preserved scalar state after migration, got {:?}", other),
        }
    }
}
