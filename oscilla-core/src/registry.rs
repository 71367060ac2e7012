//! Block registry & lowering protocol: data-driven dispatch from a
//! block-type string to a `BlockDef`, favoring tagged variants over
//! polymorphism — the registry is a build-time constant map, never a vtable
//! built from trait objects wired into the patch itself.

use crate::address::AddressRegistry;
use crate::diagnostics::Diagnostic;
use crate::ir::{IRBuilder, ValueRef};
use crate::types::{canonical_type, CanonicalType, Extent, InstanceRef, Payload, Temporality, Unit};
use fxhash::FxHashMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    Pure,
    State,
    Render,
}

/// A port's declared shape: payload/unit plus the two extent axes a
/// `BlockDef` must pin down statically (temporality, and — for field ports
/// — which instance domain they range over). `cardinality`, `binding`,
/// `perspective` and `branch` are filled in by `port_canonical_type` from
/// context the registry doesn't have (see `compiler::resolve_types`).
#[derive(Clone, Debug)]
pub struct PortDef {
    pub id: &'static str,
    pub payload: Payload,
    pub unit: Unit,
    pub temporality: Temporality,
    /// `Some(domain_type)` if this port carries a Field over that domain;
    /// `None` for a plain Signal.
    pub field_domain: Option<&'static str>,
}

impl PortDef {
    pub fn signal(id: &'static str, payload: Payload, unit: Unit) -> PortDef {
        PortDef { id, payload, unit, temporality: Temporality::Continuous, field_domain: None }
    }

    pub fn event(id: &'static str, payload: Payload, unit: Unit) -> PortDef {
        PortDef { id, payload, unit, temporality: Temporality::Discrete, field_domain: None }
    }

    pub fn field(id: &'static str, payload: Payload, unit: Unit, domain: &'static str) -> PortDef {
        PortDef { id, payload, unit, temporality: Temporality::Continuous, field_domain: Some(domain) }
    }
}

/// The single place a `PortDef` becomes a `CanonicalType`: the compiler's
/// type-resolution pass calls this once per declared port,
/// supplying the concrete `InstanceRef` for field ports (derived from the
/// owning block's instance, since this minimal library treats every
/// field-producing block as its own domain instance — see DESIGN.md).
pub fn port_canonical_type(pd: &PortDef, instance: Option<InstanceRef>) -> CanonicalType {
    let extent = match instance {
        Some(inst) => Extent::field(inst, pd.temporality),
        None => Extent::signal(pd.temporality),
    };
    canonical_type(pd.payload, pd.unit.clone(), extent)
}

/// A single resolved vararg connection, already carrying the lowered value
/// of its source output (see patch::normalize::resolve_varargs, pass 2).
#[derive(Clone)]
pub struct ResolvedVarargConnection {
    pub source_address: String,
    pub sort_key: i64,
    pub value: ValueRef,
}

/// Everything a block's `lower` needs about its own call site.
pub struct LowerCtx<'a> {
    pub b: &'a mut IRBuilder,
    pub block_idx: crate::patch::BlockIdx,
    pub instance_id: String,
    pub label: String,
    pub seed_const_id: u64,
    pub in_types: FxHashMap<String, CanonicalType>,
    pub out_types: FxHashMap<String, CanonicalType>,
    pub address_registry: Option<&'a AddressRegistry>,
    pub vararg_connections: Option<&'a FxHashMap<String, Vec<ResolvedVarargConnection>>>,
}

impl<'a> LowerCtx<'a> {
    /// `stableStateId(instanceId, role)`: the persistent key used for state
    /// slots, stable across recompiles as long as block identity and role
    /// don't change (see Scenario 5).
    pub fn stable_state_id(&self, role: &str) -> String {
        format!("{}::{}", self.instance_id, role)
    }
}

pub struct LowerArgs<'a> {
    pub ctx: LowerCtx<'a>,
    pub inputs_by_id: FxHashMap<String, ValueRef>,
    pub vararg_inputs_by_id: Option<FxHashMap<String, Vec<ResolvedVarargConnection>>>,
    pub config: FxHashMap<String, serde_json::Value>,
}

pub struct LowerResult {
    pub outputs_by_id: FxHashMap<String, ValueRef>,
}

/// A block's `lower` is called exactly once per patch compile, in
/// topological order. Universally quantified over the borrow's lifetime, so
/// a plain function pointer is enough — no block needs to close over
/// per-instance state beyond what `LowerArgs` already carries.
pub type LowerFn = fn(LowerArgs) -> Result<LowerResult, Diagnostic>;

pub struct BlockDef {
    pub type_name: &'static str,
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<PortDef>,
    pub params: Vec<&'static str>,
    pub capability: Capability,
    pub lower: LowerFn,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AdapterKey {
    src_payload: Payload,
    src_unit: Unit,
    dst_payload: Payload,
    dst_unit: Unit,
}

/// Build-time constant: registered once at startup, never mutated during a
/// compile.
pub struct BlockRegistry {
    defs: FxHashMap<String, BlockDef>,
    adapters: FxHashMap<AdapterKey, String>,
}

impl BlockRegistry {
    pub fn new() -> BlockRegistry {
        BlockRegistry { defs: FxHashMap::default(), adapters: FxHashMap::default() }
    }

    pub fn register(&mut self, def: BlockDef) {
        self.defs.insert(def.type_name.to_string(), def);
    }

    /// Registers `adapter_type` as the block to insert when an edge needs to
    /// bridge `(src_payload, src_unit) -> (dst_payload, dst_unit)`.
    pub fn register_adapter(
        &mut self,
        src_payload: Payload,
        src_unit: Unit,
        dst_payload: Payload,
        dst_unit: Unit,
        adapter_type: impl Into<String>,
    ) {
        self.adapters.insert(
            AdapterKey { src_payload, src_unit, dst_payload, dst_unit },
            adapter_type.into(),
        );
    }

    pub fn get(&self, type_name: &str) -> Option<&BlockDef> {
        self.defs.get(type_name)
    }

    pub fn find_adapter(&self, src_payload: Payload, src_unit: &Unit, dst_payload: Payload, dst_unit: &Unit) -> Option<&str> {
        let key = AdapterKey {
            src_payload,
            src_unit: src_unit.clone(),
            dst_payload,
            dst_unit: dst_unit.clone(),
        };
        self.adapters.get(&key).map(String::as_str)
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        let mut reg = BlockRegistry::new();
        crate::blocks::register_builtins(&mut reg);
        reg
    }
}
