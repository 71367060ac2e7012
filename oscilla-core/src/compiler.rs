//! The multi-pass compiler pipeline: normalize → type → instance → lower →
//! schedule. Each pass is `Result<T, Vec<Diagnostic>>`; a pass that fails
//! means later passes do not run — compilation is all-or-nothing.

use crate::address::{AddressRegistry, CanonicalAddress};
use crate::diagnostics::{codes, Diagnostic, Domain};
use crate::ir::{IRBuilder, IRProgram, Step, TimeModel, ValueRef};
use crate::patch::normalize::{insert_adapters, resolve_varargs, synthesize_default_sources, ResolvedVarargs};
use crate::patch::{Block, BlockIdx, CombineMode, InputPortConfig, Patch, RoleKind};
use crate::registry::{port_canonical_type, BlockDef, BlockRegistry, LowerArgs, LowerCtx, ResolvedVarargConnection};
use crate::tap::{DebugGraph, DebugGraphEntry};
use crate::types::{CanonicalType, Cardinality, InstanceRef};
use fxhash::FxHashMap;

#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub patch_revision: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { patch_revision: 0 }
    }
}

pub enum CompileResult {
    Ok { program: IRProgram, address_registry: AddressRegistry, debug_graph: DebugGraph },
    Err { errors: Vec<Diagnostic> },
}

/// Per-block, per-port canonical types resolved by pass 4/5. Block outputs
/// carry a concrete `InstanceRef` for field ports (keyed by the owning
/// block, see DESIGN.md); block inputs carry the type the *declaration*
/// expects, used only to validate edges — the value actually flowing
/// through an edge is the *producer's* output type.
#[derive(Default)]
struct TypeTable {
    outputs: FxHashMap<(BlockIdx, String), CanonicalType>,
    inputs: FxHashMap<(BlockIdx, String), CanonicalType>,
}

pub fn compile(patch: &Patch, registry: &BlockRegistry, options: &CompileOptions) -> CompileResult {
    let mut patch = patch.clone();

    log::debug!("compile: pass 1 (default sources)");
    if let Err(errors) = synthesize_default_sources(&mut patch, registry) {
        return CompileResult::Err { errors };
    }

    log::debug!("compile: pass 2 (varargs)");
    let resolved_varargs = match resolve_varargs(&patch, registry) {
        Ok(v) => v,
        Err(errors) => return CompileResult::Err { errors },
    };

    log::debug!("compile: pass 3 (adapters)");
    if let Err(errors) = insert_adapters(&mut patch, registry) {
        return CompileResult::Err { errors };
    }

    if let Err(errors) = check_unknown_block_types(&patch, registry) {
        return CompileResult::Err { errors };
    }
    if let Err(errors) = check_duplicate_names(&patch) {
        return CompileResult::Err { errors };
    }
    if let Err(errors) = check_no_self_loops(&patch) {
        return CompileResult::Err { errors };
    }
    if let Err(errors) = check_time_root(&patch, registry) {
        return CompileResult::Err { errors };
    }

    log::debug!("compile: pass 4/5 (type resolution + instance unification)");
    let type_table = resolve_types(&patch, registry);
    if let Err(errors) = check_edge_types(&patch, registry, &type_table) {
        return CompileResult::Err { errors };
    }

    log::debug!("compile: pass 6 (topological order + lowering)");
    let order = match topo_order(&patch, &resolved_varargs) {
        Ok(o) => o,
        Err(d) => return CompileResult::Err { errors: vec![d] },
    };

    let mut address_registry = AddressRegistry::new();
    register_addresses(&patch, &mut address_registry);

    let mut builder = IRBuilder::new();
    let mut outputs: FxHashMap<(BlockIdx, String), ValueRef> = FxHashMap::default();
    let mut lowering_errors = Vec::new();

    for block_idx in &order {
        let block = patch.block(*block_idx);
        let def = registry.get(&block.block_type).expect("checked by check_unknown_block_types");
        let label = block.canonical_name();
        let target = CanonicalAddress::Block { name: label.clone() };

        let mut inputs_by_id = FxHashMap::default();
        for pd in &def.inputs {
            let cfg = block.input_ports.get(pd.id).cloned().unwrap_or_default();
            if cfg.is_vararg {
                continue;
            }
            match gather_bus(&patch, *block_idx, pd, &cfg, def, &outputs, &mut builder, &target) {
                Ok(Some(v)) => {
                    inputs_by_id.insert(pd.id.to_string(), v);
                }
                Ok(None) => {}
                Err(d) => lowering_errors.push(d),
            }
        }

        let vararg_inputs_by_id = build_vararg_inputs(*block_idx, &resolved_varargs, &outputs);

        let in_types: FxHashMap<String, CanonicalType> = def
            .inputs
            .iter()
            .filter_map(|pd| type_table.inputs.get(&(*block_idx, pd.id.to_string())).map(|t| (pd.id.to_string(), t.clone())))
            .collect();
        let out_types: FxHashMap<String, CanonicalType> = def
            .outputs
            .iter()
            .filter_map(|pd| type_table.outputs.get(&(*block_idx, pd.id.to_string())).map(|t| (pd.id.to_string(), t.clone())))
            .collect();

        let ctx = LowerCtx {
            b: &mut builder,
            block_idx: *block_idx,
            instance_id: label.clone(),
            label: label.clone(),
            seed_const_id: block_idx.index() as u64,
            in_types,
            out_types,
            address_registry: Some(&address_registry),
            vararg_connections: None,
        };
        let args = LowerArgs { ctx, inputs_by_id, vararg_inputs_by_id, config: block.params.clone() };

        match (def.lower)(args) {
            Ok(result) => {
                for (port, v) in result.outputs_by_id {
                    outputs.insert((*block_idx, port), v);
                }
            }
            Err(d) => lowering_errors.push(d),
        }
    }

    if !lowering_errors.is_empty() {
        return CompileResult::Err { errors: lowering_errors };
    }

    log::debug!("compile: pass 7 (schedule soundness)");
    let steps = match schedule_and_verify(&builder) {
        Ok(s) => s,
        Err(e) => {
            // An internal invariant break, not a user-facing diagnostic —
            // only a truly unrecoverable condition should halt like this.
            log::error!("schedule soundness check failed: {}", e);
            return CompileResult::Err {
                errors: vec![Diagnostic::error(
                    "E_INTERNAL_SCHEDULE",
                    "internal scheduler error",
                    e.to_string(),
                    CanonicalAddress::Block { name: "<program>".to_string() },
                    Domain::Schedule,
                )],
            };
        }
    };

    let debug_graph = build_debug_graph(&patch, &outputs, options.patch_revision);
    let program = builder.finish(steps, TimeModel::default());

    CompileResult::Ok { program, address_registry, debug_graph }
}

fn check_unknown_block_types(patch: &Patch, registry: &BlockRegistry) -> Result<(), Vec<Diagnostic>> {
    let mut errors = Vec::new();
    for block in &patch.blocks {
        if registry.get(&block.block_type).is_none() {
            errors.push(Diagnostic::error(
                codes::E_ADDRESS_UNKNOWN,
                "unregistered block type",
                format!("block '{}' has unregistered type '{}'", block.display_name, block.block_type),
                CanonicalAddress::Block { name: block.canonical_name() },
                Domain::Authoring,
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Unique canonical block names.
fn check_duplicate_names(patch: &Patch) -> Result<(), Vec<Diagnostic>> {
    let mut seen: FxHashMap<String, usize> = FxHashMap::default();
    for block in &patch.blocks {
        *seen.entry(block.canonical_name()).or_insert(0) += 1;
    }
    let errors: Vec<Diagnostic> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| {
            Diagnostic::error(
                codes::E_DUPLICATE_CANONICAL_NAME,
                "duplicate canonical block name",
                format!("more than one block normalizes to '{}'", name),
                CanonicalAddress::Block { name },
                Domain::Authoring,
            )
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// No self-loops.
fn check_no_self_loops(patch: &Patch) -> Result<(), Vec<Diagnostic>> {
    let errors: Vec<Diagnostic> = patch
        .edges
        .iter()
        .filter(|e| e.enabled && e.from.block == e.to.block)
        .map(|e| {
            Diagnostic::error(
                codes::E_CYCLE_DETECTED,
                "self-loop",
                format!("block '{}' wires an output back into one of its own inputs", patch.block(e.from.block).canonical_name()),
                CanonicalAddress::Block { name: patch.block(e.from.block).canonical_name() },
                Domain::Authoring,
            )
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// A patch with at least one render sink must also contain a `TimeRoot`
/// block. Time is read directly off `RuntimeState` rather than carried over
/// an edge, so presence is what matters, not graph reachability. An empty
/// patch has no sinks at all, which this treats the same as "missing" —
/// there is nothing to animate either way.
fn check_time_root(patch: &Patch, registry: &BlockRegistry) -> Result<(), Vec<Diagnostic>> {
    use crate::registry::Capability;

    let has_sink = patch
        .blocks
        .iter()
        .any(|b| registry.get(&b.block_type).map_or(false, |d| d.capability == Capability::Render));

    let missing_action = crate::diagnostics::DiagnosticAction::CreateTimeRoot { time_root_kind: "Infinite".to_string() };
    let missing = || {
        Diagnostic::error(
            codes::E_TIME_ROOT_MISSING,
            "no time root",
            "no TimeRoot block is present for any render sink to animate against",
            CanonicalAddress::Block { name: "<patch>".to_string() },
            Domain::Authoring,
        )
        .with_action(missing_action.clone())
    };

    if patch.blocks.is_empty() || !has_sink {
        return Err(vec![missing()]);
    }

    // Time is a single axis in `RuntimeState`, not a value carried over edges —
    // blocks read it directly (`SigExpr::Time`) rather than through a wired
    // input port. So a TimeRoot only needs to be present in the patch, not
    // reachable from the sink through the dataflow graph.
    let has_time_root = patch.blocks.iter().any(|b| matches!(b.role.kind, RoleKind::TimeRoot));
    if !has_time_root {
        return Err(vec![missing()]);
    }

    Ok(())
}

/// Pass 4/5: resolve every declared port's `CanonicalType`. Field-typed
/// outputs get a concrete `InstanceRef` keyed by the owning block — see
/// `registry::port_canonical_type` and DESIGN.md for why this minimal
/// library treats each field-producing block as its own domain instance.
fn resolve_types(patch: &Patch, registry: &BlockRegistry) -> TypeTable {
    let mut table = TypeTable::default();
    for (i, block) in patch.blocks.iter().enumerate() {
        let idx = BlockIdx(i);
        let def = match registry.get(&block.block_type) {
            Some(d) => d,
            None => continue,
        };
        for pd in &def.outputs {
            let instance = pd.field_domain.map(|dom| InstanceRef { domain_type: dom.to_string(), instance_id: idx.index() as u64 });
            table.outputs.insert((idx, pd.id.to_string()), port_canonical_type(pd, instance));
        }
        for pd in &def.inputs {
            // Inputs never declare a field_domain in this library (nothing
            // consumes a field through a plain wired input), so this is
            // always a Signal expectation; see DESIGN.md.
            table.inputs.insert((idx, pd.id.to_string()), port_canonical_type(pd, None));
        }
    }
    table
}

/// Short lowercase token for a `Unit`, used in adapter-type strings
/// (`"phase01→radians"`) — distinct from `Unit`'s `Display`, which brackets
/// the token with its family name for human-readable diagnostics text.
fn unit_token(unit: &crate::types::Unit) -> String {
    use crate::types::{AngleKind, ColorSpaceKind, Unit};
    match unit {
        Unit::None => "none".to_string(),
        Unit::Angle(AngleKind::Phase01) => "phase01".to_string(),
        Unit::Angle(AngleKind::Radians) => "radians".to_string(),
        Unit::Color(ColorSpaceKind::Srgb) => "srgb".to_string(),
        Unit::Color(ColorSpaceKind::Linear) => "linear".to_string(),
        Unit::Custom { name, .. } => name.clone(),
    }
}

/// Checks every enabled, non-vararg edge against the type table: payload,
/// unit, temporality, and cardinality must all agree (adapters already
/// resolved any payload/unit mismatch they could in pass 3; what's left
/// here is either something with no registered adapter, or a
/// cardinality/temporality mismatch adapters don't address).
fn check_edge_types(patch: &Patch, registry: &BlockRegistry, table: &TypeTable) -> Result<(), Vec<Diagnostic>> {
    let mut errors = Vec::new();

    for edge in &patch.edges {
        if !edge.enabled {
            continue;
        }
        let dst_block = patch.block(edge.to.block);
        let dst_cfg = dst_block.input_ports.get(&edge.to.port).cloned().unwrap_or_default();
        if dst_cfg.is_vararg {
            continue;
        }

        let src_ty = match table.outputs.get(&(edge.from.block, edge.from.port.clone())) {
            Some(t) => t,
            None => continue,
        };
        let dst_ty = match table.inputs.get(&(edge.to.block, edge.to.port.clone())) {
            Some(t) => t,
            None => continue,
        };

        let target = CanonicalAddress::BlockInput { block: dst_block.canonical_name(), port: edge.to.port.clone() };

        if src_ty.payload != dst_ty.payload {
            let adapter_type = registry
                .find_adapter(src_ty.payload, &src_ty.unit, dst_ty.payload, &dst_ty.unit)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}→{}", src_ty.unit, dst_ty.unit));
            errors.push(
                Diagnostic::error(
                    codes::E_TYPE_MISMATCH,
                    "payload mismatch",
                    format!("'{}' produces {:?}, '{}' expects {:?}", edge.from.port, src_ty.payload, edge.to.port, dst_ty.payload),
                    target,
                    Domain::Type,
                )
                .with_action(crate::diagnostics::DiagnosticAction::AddAdapter {
                    from_port: CanonicalAddress::BlockOutput { block: patch.block(edge.from.block).canonical_name(), port: edge.from.port.clone() },
                    adapter_type,
                }),
            );
            continue;
        }

        if !crate::types::units_equal(&src_ty.unit, &dst_ty.unit) {
            let adapter_type = format!("{}→{}", unit_token(&src_ty.unit), unit_token(&dst_ty.unit));
            errors.push(
                Diagnostic::error(
                    codes::E_TYPE_MISMATCH,
                    "unit mismatch",
                    format!("'{}' is {}, '{}' expects {}", edge.from.port, src_ty.unit, edge.to.port, dst_ty.unit),
                    target.clone(),
                    Domain::Type,
                )
                .with_action(crate::diagnostics::DiagnosticAction::AddAdapter {
                    from_port: CanonicalAddress::BlockOutput { block: patch.block(edge.from.block).canonical_name(), port: edge.from.port.clone() },
                    adapter_type,
                }),
            );
            continue;
        }

        if src_ty.extent.temporality != dst_ty.extent.temporality {
            errors.push(Diagnostic::error(
                codes::E_TYPE_MISMATCH,
                "temporality mismatch",
                format!("'{}' and '{}' disagree on continuous vs discrete", edge.from.port, edge.to.port),
                target,
                Domain::Type,
            ));
            continue;
        }

        match (&src_ty.extent.cardinality, &dst_ty.extent.cardinality) {
            (Cardinality::One, Cardinality::One) => {}
            (Cardinality::Many(a), Cardinality::Many(b)) if a == b => {}
            (Cardinality::Many(a), Cardinality::Many(b)) => {
                errors.push(Diagnostic::error(
                    codes::E_UNRESOLVED_INSTANCE,
                    "instance mismatch",
                    format!("'{}' ranges over {:?}, '{}' expects {:?}", edge.from.port, a, edge.to.port, b),
                    target,
                    Domain::Type,
                ));
            }
            _ => {
                errors.push(Diagnostic::error(
                    codes::E_TYPE_MISMATCH,
                    "cardinality mismatch",
                    format!("'{}' and '{}' disagree on Signal vs Field", edge.from.port, edge.to.port),
                    target,
                    Domain::Type,
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Kahn's algorithm, tie-break on canonical name. A patch graph is meant
/// to be acyclic; if Kahn's can't drain every block, the remainder is a
/// cycle.
fn topo_order(patch: &Patch, resolved_varargs: &ResolvedVarargs) -> Result<Vec<BlockIdx>, Diagnostic> {
    let n = patch.blocks.len();
    let mut indegree = vec![0usize; n];
    let mut adj: Vec<Vec<BlockIdx>> = vec![Vec::new(); n];

    for e in &patch.edges {
        if !e.enabled {
            continue;
        }
        adj[e.from.block.index()].push(e.to.block);
        indegree[e.to.block.index()] += 1;
    }

    // Vararg connections are a data dependency that bypasses patch.edges
    // entirely (authored on InputPortConfig, not the edge list) — a
    // consuming block must still come after each of its resolved sources.
    for ((owner, _port), conns) in resolved_varargs.iter() {
        for conn in conns {
            adj[conn.source_block.index()].push(*owner);
            indegree[owner.index()] += 1;
        }
    }

    let name_of = |b: BlockIdx| patch.block(b).canonical_name();

    let mut ready: Vec<BlockIdx> = (0..n).map(BlockIdx).filter(|&b| indegree[b.index()] == 0).collect();
    ready.sort_by_key(|&b| name_of(b));

    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let next = ready.remove(0);
        order.push(next);
        for &succ in &adj[next.index()] {
            indegree[succ.index()] -= 1;
            if indegree[succ.index()] == 0 {
                let pos = ready.binary_search_by_key(&name_of(succ), |&b| name_of(b)).unwrap_or_else(|p| p);
                ready.insert(pos, succ);
            }
        }
    }

    if order.len() != n {
        return Err(Diagnostic::error(
            codes::E_CYCLE_DETECTED,
            "cycle detected",
            "the patch graph contains a cycle; the dataflow graph must be acyclic by construction",
            CanonicalAddress::Block { name: "<patch>".to_string() },
            Domain::Schedule,
        ));
    }

    Ok(order)
}

fn register_addresses(patch: &Patch, registry: &mut AddressRegistry) {
    for block in &patch.blocks {
        let name = block.canonical_name();
        registry.register(CanonicalAddress::Block { name: name.clone() });
        for port in block.input_ports.keys() {
            registry.register(CanonicalAddress::BlockInput { block: name.clone(), port: port.clone() });
        }
        for port in block.output_ports.keys() {
            registry.register(CanonicalAddress::BlockOutput { block: name.clone(), port: port.clone() });
        }
        for param in block.params.keys() {
            registry.register(CanonicalAddress::BlockParam { block: name.clone(), param: param.clone() });
        }
    }
}

/// Gathers the resolved value feeding a (non-vararg) input bus: the wired
/// edge directly if there's exactly one, or a `combineMode` fold across
/// however many are enabled, sorted by `sortKey` for determinism.
fn gather_bus(
    patch: &Patch,
    block_idx: BlockIdx,
    port_def: &crate::registry::PortDef,
    cfg: &InputPortConfig,
    dst_def: &BlockDef,
    outputs: &FxHashMap<(BlockIdx, String), ValueRef>,
    b: &mut IRBuilder,
    target: &CanonicalAddress,
) -> Result<Option<ValueRef>, Diagnostic> {
    let _ = dst_def;
    let mut edges: Vec<_> = patch.incoming(block_idx, port_def.id).collect();
    edges.sort_by_key(|e| e.sort_key);

    if edges.is_empty() {
        return Ok(None);
    }
    if edges.len() == 1 {
        let e = edges[0];
        return Ok(outputs.get(&(e.from.block, e.from.port.clone())).cloned());
    }

    let mode = cfg.combine_mode.unwrap_or(CombineMode::Last);
    let mut sig_ids = Vec::with_capacity(edges.len());
    for e in &edges {
        match outputs.get(&(e.from.block, e.from.port.clone())) {
            Some(ValueRef::Sig { id, .. }) => sig_ids.push(*id),
            _ => {
                return Err(Diagnostic::error(
                    codes::E_TYPE_MISMATCH,
                    "bus combine requires signals",
                    format!("'{}' combines {} edges, but not all sources are Signals", port_def.id, edges.len()),
                    target.clone(),
                    Domain::Type,
                ))
            }
        }
    }

    let combined = combine_sigs(mode, &sig_ids, b);
    let ty = crate::types::canonical_type(
        port_def.payload,
        port_def.unit.clone(),
        crate::types::Extent::signal(port_def.temporality),
    );
    let slot = b.alloc_slot(ty);
    b.push_step(Step::EvalSig { sig: combined, slot });
    Ok(Some(ValueRef::Sig { id: combined, slot, stride: port_def.payload.stride() }))
}

/// Folds a bus's signals under `combineMode`. `Layer` is approximated as
/// `Last` (highest `sortKey` wins) — painter's-algorithm compositing over
/// arbitrary payloads needs a blend function this minimal library doesn't
/// have; see DESIGN.md.
fn combine_sigs(mode: CombineMode, ids: &[crate::ir::SigExprId], b: &mut IRBuilder) -> crate::ir::SigExprId {
    use crate::ir::{MathFn, SigExpr};
    debug_assert!(!ids.is_empty());

    match mode {
        CombineMode::Last | CombineMode::Layer => *ids.last().unwrap(),
        CombineMode::First => ids[0],
        CombineMode::Sum => fold_zip(ids, MathFn::Add, b),
        CombineMode::Mul | CombineMode::And => fold_zip(ids, if mode == CombineMode::Mul { MathFn::Mul } else { MathFn::And }, b),
        CombineMode::Max => fold_zip(ids, MathFn::Max, b),
        CombineMode::Min => fold_zip(ids, MathFn::Min, b),
        CombineMode::Or => fold_zip(ids, MathFn::Or, b),
        CombineMode::Average => {
            let sum = fold_zip(ids, MathFn::Add, b);
            let n = b.push_sig(SigExpr::Const(ordered_float::NotNan::new(ids.len() as f64).unwrap()));
            b.push_sig(SigExpr::Zip(MathFn::Div, vec![sum, n]))
        }
    }
}

fn fold_zip(ids: &[crate::ir::SigExprId], f: crate::ir::MathFn, b: &mut IRBuilder) -> crate::ir::SigExprId {
    let mut acc = ids[0];
    for &id in &ids[1..] {
        acc = b.push_sig(crate::ir::SigExpr::Zip(f, vec![acc, id]));
    }
    acc
}

fn build_vararg_inputs(
    block_idx: BlockIdx,
    resolved: &ResolvedVarargs,
    outputs: &FxHashMap<(BlockIdx, String), ValueRef>,
) -> Option<FxHashMap<String, Vec<ResolvedVarargConnection>>> {
    let mut by_port: FxHashMap<String, Vec<ResolvedVarargConnection>> = FxHashMap::default();
    for ((owner, port), conns) in resolved.iter() {
        if *owner != block_idx {
            continue;
        }
        let mut out = Vec::with_capacity(conns.len());
        for c in conns {
            if let Some(value) = outputs.get(&(c.source_block, c.source_port.clone())) {
                out.push(ResolvedVarargConnection {
                    source_address: c.source_address.clone(),
                    sort_key: c.sort_key,
                    value: value.clone(),
                });
            }
        }
        by_port.insert(port.clone(), out);
    }
    if by_port.is_empty() {
        None
    } else {
        Some(by_port)
    }
}

/// Schedule soundness: every `Step::EvalSig`/`Materialize` consumer must see
/// its dependency's writing step earlier in the list. Block lowering is
/// responsible for actually producing that order (see `blocks.rs`'s module
/// doc); this just verifies it — a broken invariant here is a bug, not a
/// diagnostic.
fn schedule_and_verify(b: &IRBuilder) -> Result<Vec<Step>, crate::error::InternalError> {
    let steps: Vec<Step> = b.steps_so_far().iter().cloned().collect();
    let mut written_slots = std::collections::HashSet::new();

    for step in &steps {
        match step {
            Step::EvalSig { sig, slot } => {
                check_sig_deps(b, *sig, &written_slots)?;
                written_slots.insert(*slot);
            }
            Step::Materialize { field, slot, .. } => {
                check_field_deps(b, *field, &written_slots)?;
                written_slots.insert(*slot);
            }
            Step::StateWrite { src, .. } => {
                check_sig_deps(b, *src, &written_slots)?;
            }
            Step::RenderPass { bindings, .. } => {
                for binding in bindings {
                    if !written_slots.contains(&binding.from) {
                        return Err(crate::error::InternalError::BuilderInvariant(format!(
                            "render pass binding references slot {:?} before it is written",
                            binding.from
                        )));
                    }
                }
            }
            Step::EvalEvent { .. } | Step::Projection { .. } => {}
        }
    }

    Ok(steps)
}

fn check_sig_deps(
    b: &IRBuilder,
    id: crate::ir::SigExprId,
    written: &std::collections::HashSet<crate::ir::SlotId>,
) -> Result<(), crate::error::InternalError> {
    use crate::ir::SigExpr;
    match b.sig(id) {
        SigExpr::Slot(slot) => {
            if !written.contains(slot) {
                return Err(crate::error::InternalError::BuilderInvariant(format!(
                    "sig {:?} reads slot {:?} before it is written",
                    id, slot
                )));
            }
            Ok(())
        }
        SigExpr::Const(_) | SigExpr::Time(_) | SigExpr::External(_) | SigExpr::StateRead(_) | SigExpr::EventRead(_) => Ok(()),
        SigExpr::Map(_, args) | SigExpr::Zip(_, args) => {
            for a in args {
                check_sig_deps(b, *a, written)?;
            }
            Ok(())
        }
        SigExpr::ShapeRef(inner) => check_sig_deps(b, *inner, written),
    }
}

fn check_field_deps(
    b: &IRBuilder,
    id: crate::ir::FieldExprId,
    written: &std::collections::HashSet<crate::ir::SlotId>,
) -> Result<(), crate::error::InternalError> {
    use crate::ir::FieldExpr;
    match b.field(id) {
        FieldExpr::Broadcast(sig) => check_sig_deps(b, *sig, written),
        FieldExpr::Materialize { from, .. } => check_sig_deps(b, *from, written),
        FieldExpr::IndexMap { input, map } => {
            check_field_deps(b, *input, written)?;
            check_sig_deps(b, *map, written)
        }
        FieldExpr::Lens { input, .. } => check_field_deps(b, *input, written),
    }
}

/// Builds the compile-time `CanonicalAddress -> (slot, type, upstream)` index.
/// A block's upstream producers are the direct predecessors feeding
/// any of its inputs — the closest the minimal block library gets to a real
/// dataflow-lineage trace, since nothing here needs to distinguish which
/// input an output logically derives from.
fn build_debug_graph(patch: &Patch, outputs: &FxHashMap<(BlockIdx, String), ValueRef>, patch_revision: u64) -> DebugGraph {
    let mut entries = Vec::new();
    for (idx, block) in patch.blocks.iter().enumerate() {
        let block_idx = BlockIdx(idx);
        let name = block.canonical_name();

        let upstream: Vec<CanonicalAddress> = patch
            .edges
            .iter()
            .filter(|e| e.enabled && e.to.block == block_idx)
            .map(|e| CanonicalAddress::BlockOutput { block: patch.block(e.from.block).canonical_name(), port: e.from.port.clone() })
            .collect();

        for (port, value) in outputs.iter().filter(|((b, _), _)| *b == block_idx).map(|((_, p), v)| (p, v)) {
            entries.push(DebugGraphEntry {
                address: CanonicalAddress::BlockOutput { block: name.clone(), port: port.clone() },
                value: value.clone(),
                upstream_producers: upstream.clone(),
            });
        }
    }
    DebugGraph::new(patch_revision, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{Edge, EdgeRole, InputPortConfig, PortAddress, Role};
    use crate::registry::BlockRegistry;

    fn registry() -> BlockRegistry {
        BlockRegistry::default()
    }

    #[test]
    fn empty_patch_reports_missing_time_root() {
        let patch = Patch::new();
        let reg = registry();
        match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Err { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].code, codes::E_TIME_ROOT_MISSING);
                assert!(matches!(errors[0].actions[0], crate::diagnostics::DiagnosticAction::CreateTimeRoot { .. }));
            }
            CompileResult::Ok { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn time_root_oscillator_render_sink_compiles_and_schedules_in_order() {
        let mut patch = Patch::new();
        let root = patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
        let _ = root;
        let osc = patch.add_block(Block::new("Osc", "Oscillator").with_param("rate", serde_json::json!(1.0)));
        let sink = patch.add_block(
            Block::new("Sink", "RenderSink").with_input(
                "color",
                InputPortConfig::default(),
            ),
        );
        patch.add_edge(Edge {
            from: PortAddress { block: osc, port: "out".to_string() },
            to: PortAddress { block: sink, port: "color".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });

        let reg = registry();
        match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Ok { program, .. } => {
                let render_pos = program.steps.iter().position(|s| matches!(s, Step::RenderPass { .. })).unwrap();
                let osc_eval_pos = program
                    .steps
                    .iter()
                    .position(|s| matches!(s, Step::EvalSig { sig, .. } if matches!(program.sig_exprs[sig.index()], crate::ir::SigExpr::Map(crate::ir::MathFn::Sin, _))))
                    .unwrap();
                assert!(osc_eval_pos < render_pos, "oscillator must evaluate before the render pass consumes it");
            }
            CompileResult::Err { errors } => panic!("expected success, got {:?}", errors),
        }
    }

    #[test]
    fn unregistered_block_type_is_an_error() {
        let mut patch = Patch::new();
        patch.add_block(Block::new("Mystery", "NotARealBlockType"));
        let reg = registry();
        match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Err { errors } => assert!(errors.iter().any(|d| d.code == codes::E_ADDRESS_UNKNOWN)),
            CompileResult::Ok { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn duplicate_canonical_names_are_rejected() {
        let mut patch = Patch::new();
        patch.add_block(Block::new("Osc", "Oscillator").with_role(Role::time_root()));
        patch.add_block(Block::new("Osc", "Oscillator"));
        let reg = registry();
        match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Err { errors } => assert!(errors.iter().any(|d| d.code == codes::E_DUPLICATE_CANONICAL_NAME)),
            CompileResult::Ok { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn expression_vararg_refs_sums_both_sources_by_sort_key() {
        use crate::patch::{VarargConnection, VarargConstraint};
        use crate::types::Payload;

        let mut patch = Patch::new();
        patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
        patch.add_block(Block::new("a", "Oscillator").with_param("rate", serde_json::json!(0.25)));
        patch.add_block(Block::new("b", "Oscillator").with_param("rate", serde_json::json!(0.5)));

        let refs_cfg = InputPortConfig {
            is_vararg: true,
            vararg_constraint: Some(VarargConstraint { payload_type: Payload::Float, min_connections: 1, max_connections: None }),
            vararg_connections: vec![
                VarargConnection { source_address: "a.out".to_string(), sort_key: 0 },
                VarargConnection { source_address: "b.out".to_string(), sort_key: 1 },
            ],
            ..Default::default()
        };
        let expr = patch.add_block(
            Block::new("expr", "Expression")
                .with_param("text", serde_json::json!("in0 + in1"))
                .with_input("refs", refs_cfg),
        );
        let sink = patch.add_block(Block::new("Sink", "RenderSink"));
        patch.add_edge(Edge {
            from: PortAddress { block: expr, port: "out".to_string() },
            to: PortAddress { block: sink, port: "color".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });

        let reg = registry();
        let (program, debug_graph) = match compile(&patch, &reg, &CompileOptions::default()) {
            CompileResult::Ok { program, debug_graph, .. } => (program, debug_graph),
            CompileResult::Err { errors } => panic!("expected success, got {:?}", errors),
        };

        let expr_slot = match debug_graph.probe_port(&CanonicalAddress::BlockOutput { block: "expr".to_string(), port: "out".to_string() }.to_string())
        {
            Some(entry) => match &entry.value {
                ValueRef::Sig { slot, .. } => *slot,
                other => panic!("expected a signal, got {:?}", other),
            },
            None => panic!("expr.out not found in debug graph"),
        };

        let mut rt = crate::runtime::Runtime::new(program);
        rt.execute_frame(500.0).unwrap();
        let expected = (2.0 * std::f64::consts::PI * 0.25 * 0.5).sin() + (2.0 * std::f64::consts::PI * 0.5 * 0.5).sin();
        let got = rt.read_slot(expr_slot);
        assert!((got - expected).abs() < 1e-9, "got {} expected {}", got, expected);
    }
}
