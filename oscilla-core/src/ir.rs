//! IR: an append-only builder producing four streams (signal/field/event
//! expressions and steps), plus the slot/stride/storage-class bookkeeping
//! that the runtime executes against.

use crate::idx::{Id, IdVec};
use crate::types::{CanonicalType, InstanceRef, Payload};
use serde::{Deserialize, Serialize};

pub struct SigExprTag;
pub type SigExprId = Id<SigExprTag>;

pub struct FieldExprTag;
pub type FieldExprId = Id<FieldExprTag>;

pub struct EventExprTag;
pub type EventExprId = Id<EventExprTag>;

pub struct SlotTag;
/// Index into `ValueStore`. Assigned monotonically by `IRBuilder::alloc_slot`
/// and never reused within a compile.
pub type SlotId = Id<SlotTag>;

pub struct StateSlotTag;
pub type StateSlotId = Id<StateSlotTag>;

pub struct StepTag;
pub type StepIdx = Id<StepTag>;

pub struct EventSlotTag;
/// Index into `RuntimeState.eventScalars`, distinct from `EventExprId`: many
/// `EventExpr` nodes can feed the same slot (e.g. `combine`), and a slot is
/// what the monotone-OR discipline within a frame actually applies to.
pub type EventSlotId = Id<EventSlotTag>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    F64,
    TypedArray,
    Uint8,
}

impl StorageClass {
    pub fn for_payload(payload: Payload, is_field: bool) -> StorageClass {
        if is_field {
            StorageClass::TypedArray
        } else {
            match payload {
                Payload::Bool => StorageClass::Uint8,
                _ => StorageClass::F64,
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlotMeta {
    pub ty: CanonicalType,
    pub stride: usize,
    pub storage: StorageClass,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSlotMeta {
    pub stable_state_id: String,
    pub initial_value: StateInitialValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StateInitialValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathFn {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Sin,
    Cos,
    Abs,
    Neg,
    Clamp01,
    Gt,
    Lt,
    Eq,
    And,
    Or,
    Not,
    Ternary,
    Mix,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeAxis {
    TMs,
    Dt,
    PhaseA,
    PhaseB,
    Energy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SigExpr {
    Const(ordered_float::NotNan<f64>),
    Slot(SlotId),
    Time(TimeAxis),
    /// Value supplied from outside the graph (e.g. an editor-live param not
    /// wired as an edge). Carries the param address string for diagnostics.
    External(String),
    Map(MathFn, Vec<SigExprId>),
    Zip(MathFn, Vec<SigExprId>),
    StateRead(StateSlotId),
    ShapeRef(SigExprId),
    EventRead(EventSlotId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldLayout {
    Linear,
    Grid { cols: u32, rows: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LensKind {
    Offset,
    Scale,
    Rotate,
    Index,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FieldExpr {
    Materialize { from: SigExprId, count: u32, layout: FieldLayout },
    Broadcast(SigExprId),
    IndexMap { input: FieldExprId, map: SigExprId },
    Lens { kind: LensKind, params: Vec<f64>, input: FieldExprId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventExpr {
    Const(bool),
    Pulse(SigExprId),
    Wrap(SigExprId),
    Combine(Vec<EventExprId>),
    Never,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderSemantic {
    Position,
    Color,
    Radius,
    ScreenPos,
    Custom,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenderBinding {
    pub semantic: RenderSemantic,
    pub from: SlotId,
    pub count: u32,
    pub stride: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraMode {
    Ortho,
    Persp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraSpec {
    pub mode: CameraMode,
    pub view: [f64; 16],
    pub proj: [f64; 16],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkKind {
    Canvas,
    Offscreen,
    Custom,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenderSink {
    pub kind: SinkKind,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Step {
    EvalSig { sig: SigExprId, slot: SlotId },
    Materialize { field: FieldExprId, instance: InstanceRef, slot: SlotId, count: u32 },
    StateWrite { state_slot: StateSlotId, src: SigExprId },
    EvalEvent { event: EventExprId, slot: EventSlotId },
    RenderPass { sink: RenderSink, bindings: Vec<RenderBinding>, camera: Option<CameraSpec> },
    Projection { camera: CameraSpec, from: SlotId, to: SlotId },
}

/// A value produced by lowering a block output: enough to both wire it into
/// further IR expressions and to know its slot for the schedule.
#[derive(Clone, Debug)]
pub enum ValueRef {
    Sig { id: SigExprId, slot: SlotId, stride: usize },
    Field { id: FieldExprId, slot: SlotId, stride: usize, instance: InstanceRef },
    Event { id: EventExprId, slot: EventSlotId },
}

#[derive(Clone, Debug)]
pub struct TimeModel {
    pub rate_hz: f64,
}

impl Default for TimeModel {
    fn default() -> Self {
        TimeModel { rate_hz: 60.0 }
    }
}

/// The fully lowered, scheduled program a `compile` call produces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IRProgram {
    pub sig_exprs: Vec<SigExpr>,
    pub field_exprs: Vec<FieldExpr>,
    pub event_exprs: Vec<EventExpr>,
    pub steps: Vec<Step>,
    pub slot_meta: Vec<SlotMeta>,
    pub state_slot_meta: Vec<StateSlotMeta>,
    pub event_slot_count: usize,
    #[serde(skip, default)]
    pub time_model: TimeModel,
}

impl Default for IRProgram {
    fn default() -> Self {
        IRProgram {
            sig_exprs: Vec::new(),
            field_exprs: Vec::new(),
            event_exprs: Vec::new(),
            steps: Vec::new(),
            slot_meta: Vec::new(),
            state_slot_meta: Vec::new(),
            event_slot_count: 0,
            time_model: TimeModel::default(),
        }
    }
}

/// Append-only builder. Block `lower` implementations push into this; the
/// compiler never mutates an already-appended entry.
pub struct IRBuilder {
    sig_exprs: IdVec<SigExprTag, SigExpr>,
    field_exprs: IdVec<FieldExprTag, FieldExpr>,
    event_exprs: IdVec<EventExprTag, EventExpr>,
    steps: IdVec<StepTag, Step>,
    slot_meta: IdVec<SlotTag, SlotMeta>,
    state_slot_meta: IdVec<StateSlotTag, StateSlotMeta>,
    state_ids: std::collections::HashMap<String, StateSlotId>,
    event_slot_count: u32,
}

impl IRBuilder {
    pub fn new() -> IRBuilder {
        IRBuilder {
            sig_exprs: IdVec::new(),
            field_exprs: IdVec::new(),
            event_exprs: IdVec::new(),
            steps: IdVec::new(),
            slot_meta: IdVec::new(),
            state_slot_meta: IdVec::new(),
            state_ids: std::collections::HashMap::new(),
            event_slot_count: 0,
        }
    }

    /// Obtains a fresh index into `eventScalars`.
    pub fn alloc_event_slot(&mut self) -> EventSlotId {
        let id = EventSlotId::new(self.event_slot_count);
        self.event_slot_count += 1;
        id
    }

    pub fn push_sig(&mut self, expr: SigExpr) -> SigExprId {
        self.sig_exprs.push(expr)
    }

    pub fn push_field(&mut self, expr: FieldExpr) -> FieldExprId {
        self.field_exprs.push(expr)
    }

    pub fn push_event(&mut self, expr: EventExpr) -> EventExprId {
        self.event_exprs.push(expr)
    }

    pub fn push_step(&mut self, step: Step) -> StepIdx {
        self.steps.push(step)
    }

    /// Obtains a slot for `ty`. The single call site for stride computation:
    /// block lowering must never compute stride itself.
    pub fn alloc_slot(&mut self, ty: CanonicalType) -> SlotId {
        let stride = ty.stride();
        let storage = StorageClass::for_payload(ty.payload, ty.extent.is_field());
        self.slot_meta.push(SlotMeta { ty, stride, storage })
    }

    /// Obtains (or reuses, within this compile, for idempotent re-lowering)
    /// a persistent state slot keyed by `stable_state_id`.
    pub fn alloc_state_slot(&mut self, stable_state_id: String, initial_value: StateInitialValue) -> StateSlotId {
        if let Some(existing) = self.state_ids.get(&stable_state_id) {
            return *existing;
        }
        let id = self.state_slot_meta.push(StateSlotMeta {
            stable_state_id: stable_state_id.clone(),
            initial_value,
        });
        self.state_ids.insert(stable_state_id, id);
        id
    }

    pub fn sig(&self, id: SigExprId) -> &SigExpr {
        &self.sig_exprs[id]
    }

    pub fn field(&self, id: FieldExprId) -> &FieldExpr {
        &self.field_exprs[id]
    }

    pub fn event(&self, id: EventExprId) -> &EventExpr {
        &self.event_exprs[id]
    }

    pub fn slot_meta(&self, id: SlotId) -> &SlotMeta {
        &self.slot_meta[id]
    }

    pub fn finish(self, steps: Vec<Step>, time_model: TimeModel) -> IRProgram {
        IRProgram {
            sig_exprs: self.sig_exprs.into_vec(),
            field_exprs: self.field_exprs.into_vec(),
            event_exprs: self.event_exprs.into_vec(),
            steps,
            slot_meta: self.slot_meta.into_vec(),
            state_slot_meta: self.state_slot_meta.into_vec(),
            event_slot_count: self.event_slot_count as usize,
            time_model,
        }
    }

    pub fn steps_so_far(&self) -> &IdVec<StepTag, Step> {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{canonical_type, Extent, Temporality, Unit};

    #[test]
    fn alloc_slot_computes_stride_from_payload() {
        let mut b = IRBuilder::new();
        let ty = canonical_type(Payload::Color, Unit::None, Extent::signal(Temporality::Continuous));
        let slot = b.alloc_slot(ty);
        assert_eq!(b.slot_meta(slot).stride, 4);
    }

    #[test]
    fn alloc_state_slot_is_idempotent_per_stable_id() {
        let mut b = IRBuilder::new();
        let a = b.alloc_state_slot("block1/samplehold".into(), StateInitialValue::Scalar(0.0));
        let c = b.alloc_state_slot("block1/samplehold".into(), StateInitialValue::Scalar(0.0));
        assert_eq!(a, c);
    }
}
