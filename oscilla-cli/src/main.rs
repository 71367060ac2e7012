//! Builds a handful of representative patches, compiles them, drives the
//! runtime for a few simulated frames, and prints the resulting render-pass
//! records and any diagnostics. Not a test harness — see the inline
//! `#[cfg(test)]` modules in `oscilla-core` for that; this is a thing a
//! developer runs by hand to eyeball a compile/run cycle end to end.

use oscilla_core::address::CanonicalAddress;
use oscilla_core::compiler::{compile, CompileOptions, CompileResult};
use oscilla_core::ir::ValueRef;
use oscilla_core::patch::{Block, Edge, EdgeRole, InputPortConfig, Patch, PortAddress, Role};
use oscilla_core::registry::BlockRegistry;
use oscilla_core::tap::{DebugGraph, DebugTap, RingBufferTap};
use oscilla_core::{DiagnosticAction, Runtime};
use std::cell::RefCell;
use std::rc::Rc;

fn wire(patch: &mut Patch, from: (oscilla_core::patch::BlockIdx, &str), to: (oscilla_core::patch::BlockIdx, &str)) {
    patch.add_edge(Edge {
        from: PortAddress { block: from.0, port: from.1.to_string() },
        to: PortAddress { block: to.0, port: to.1.to_string() },
        enabled: true,
        sort_key: 0,
        role: EdgeRole::User,
    });
}

fn time_root_oscillator_sink(rate_hz: f64) -> Patch {
    let mut patch = Patch::new();
    let root = patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
    let osc = patch.add_block(Block::new("Osc", "Oscillator").with_param("rate", serde_json::json!(rate_hz)));
    let sink =
        patch.add_block(Block::new("Sink", "RenderSink").with_input("color", InputPortConfig::default()));
    let _ = root;
    wire(&mut patch, (osc, "out"), (sink, "color"));
    patch
}

fn print_diagnostics(errors: &[oscilla_core::Diagnostic]) {
    for d in errors {
        println!("  [{}] {} — {}", d.code, d.title, d.message);
        for action in &d.actions {
            match action {
                DiagnosticAction::CreateTimeRoot { time_root_kind } => {
                    println!("    action: createTimeRoot({})", time_root_kind)
                }
                DiagnosticAction::AddAdapter { adapter_type, .. } => {
                    println!("    action: addAdapter({})", adapter_type)
                }
                other => println!("    action: {:?}", other),
            }
        }
    }
}

/// Scenario 1 analog: an empty patch has no time root reachable from any
/// render sink.
fn scenario_empty_patch(registry: &BlockRegistry) {
    println!("-- empty patch --");
    let patch = Patch::new();
    match compile(&patch, registry, &CompileOptions::default()) {
        CompileResult::Ok { .. } => println!("  unexpectedly compiled"),
        CompileResult::Err { errors } => print_diagnostics(&errors),
    }
}

/// Scenario 2 analog: time root + oscillator + render sink, one frame at
/// half a cycle.
fn scenario_oscillator(registry: &BlockRegistry) {
    println!("-- time root + oscillator + render sink --");
    let patch = time_root_oscillator_sink(1.0);
    let (program, debug_graph) = match compile(&patch, registry, &CompileOptions::default()) {
        CompileResult::Ok { program, debug_graph, .. } => (program, debug_graph),
        CompileResult::Err { errors } => {
            print_diagnostics(&errors);
            return;
        }
    };

    let osc_slot = match debug_graph.probe_port(&CanonicalAddress::BlockOutput { block: "osc".to_string(), port: "out".to_string() }.to_string()) {
        Some(entry) => match &entry.value {
            ValueRef::Sig { slot, .. } => *slot,
            _ => {
                println!("  osc.out did not resolve to a signal");
                return;
            }
        },
        None => {
            println!("  osc.out not found in debug graph");
            return;
        }
    };

    let mut rt = Runtime::new(program);
    for t_ms in [0.0, 250.0, 500.0, 750.0] {
        let passes = rt.execute_frame(t_ms).unwrap();
        println!("  t={:>6.1}ms  osc.out={:+.6}  render passes={}", t_ms, rt.read_slot(osc_slot), passes.len());
    }
}

/// Scenario 3 analog: a grid of instances all reading the same broadcast
/// signal. `BroadcastField`'s output is left unconnected to any sink (the
/// minimal render sink only accepts scalar signals), so a second oscillator
/// path is wired straight to `RenderSink` purely to give the patch a
/// reachable time root.
fn scenario_broadcast_field(registry: &BlockRegistry) {
    println!("-- grid layout + broadcast field --");
    let mut patch = Patch::new();
    patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
    let osc = patch.add_block(Block::new("Osc", "Oscillator").with_param("rate", serde_json::json!(0.5)));
    patch.add_block(Block::new("Grid", "GridLayout").with_param("count", serde_json::json!(4)));
    let bcast =
        patch.add_block(Block::new("Bcast", "BroadcastField").with_param("count", serde_json::json!(4)));
    let sink =
        patch.add_block(Block::new("Sink", "RenderSink").with_input("color", InputPortConfig::default()));
    wire(&mut patch, (osc, "out"), (bcast, "in"));
    wire(&mut patch, (osc, "out"), (sink, "color"));

    let (program, debug_graph) = match compile(&patch, registry, &CompileOptions::default()) {
        CompileResult::Ok { program, debug_graph, .. } => (program, debug_graph),
        CompileResult::Err { errors } => {
            print_diagnostics(&errors);
            return;
        }
    };

    let field_slot = match debug_graph.probe_port(&CanonicalAddress::BlockOutput { block: "bcast".to_string(), port: "out".to_string() }.to_string()) {
        Some(entry) => match &entry.value {
            ValueRef::Field { slot, .. } => *slot,
            _ => {
                println!("  bcast.out did not resolve to a field");
                return;
            }
        },
        None => {
            println!("  bcast.out not found in debug graph");
            return;
        }
    };

    let mut rt = Runtime::new(program);
    rt.execute_frame(250.0).unwrap();
    let values = rt.read_field(field_slot);
    println!("  materialized buffer: {:?}", values);
    let all_equal = values.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-12);
    println!("  all 4 instances equal: {}", all_equal);
}

/// Scenario 4 analog: `PhaseOscillator` produces `unit=angle{phase01}`;
/// wiring it straight into a `unit=none` input is a unit mismatch with a
/// suggested (but here unregistered for this exact pair) adapter.
fn scenario_unit_mismatch(registry: &BlockRegistry) {
    println!("-- phase oscillator wired without an adapter --");
    let mut patch = Patch::new();
    patch.add_block(Block::new("Clock", "InfiniteTimeRoot").with_role(Role::time_root()));
    let osc = patch.add_block(Block::new("PhaseOsc", "PhaseOscillator").with_param("rate", serde_json::json!(1.0)));
    let sink =
        patch.add_block(Block::new("Sink", "RenderSink").with_input("color", InputPortConfig::default()));
    wire(&mut patch, (osc, "out"), (sink, "color"));

    match compile(&patch, registry, &CompileOptions::default()) {
        CompileResult::Ok { .. } => println!("  unexpectedly compiled"),
        CompileResult::Err { errors } => print_diagnostics(&errors),
    }
}

struct SharedTap(Rc<RefCell<RingBufferTap>>);

impl DebugTap for SharedTap {
    fn record_slot_value(&mut self, slot: oscilla_core::ir::SlotId, value: f64) {
        self.0.borrow_mut().record_slot_value(slot, value);
    }

    fn on_debug_graph(&mut self, graph: &DebugGraph) {
        self.0.borrow_mut().on_debug_graph(graph);
    }

    fn set_time(&mut self, t_ms: f64) {
        self.0.borrow_mut().set_time(t_ms);
    }
}

/// Scenario 7 analog: install a tap, compile the oscillator patch, run 30
/// frames at 60fps, then ask the tap for the last second of `osc.out`.
fn scenario_debug_tap(registry: &BlockRegistry) {
    println!("-- debug tap over 30 frames at 60fps --");
    let patch = time_root_oscillator_sink(1.0);
    let (program, debug_graph) = match compile(&patch, registry, &CompileOptions::default()) {
        CompileResult::Ok { program, debug_graph, .. } => (program, debug_graph),
        CompileResult::Err { errors } => {
            print_diagnostics(&errors);
            return;
        }
    };
    let osc_slot = match debug_graph.probe_port(&CanonicalAddress::BlockOutput { block: "osc".to_string(), port: "out".to_string() }.to_string()) {
        Some(entry) => match &entry.value {
            ValueRef::Sig { slot, .. } => *slot,
            _ => return,
        },
        None => return,
    };

    let tap = Rc::new(RefCell::new(RingBufferTap::new()));
    tap.borrow_mut().on_debug_graph(&debug_graph);

    let mut rt = Runtime::new(program);
    rt.set_tap(Some(Box::new(SharedTap(tap.clone()))));

    let mut t_ms = 0.0;
    for _ in 0..30 {
        rt.execute_frame(t_ms).unwrap();
        t_ms += 1000.0 / 60.0;
    }

    let series = tap.borrow().get_bus_series(osc_slot, t_ms - 1000.0 / 60.0, 1000.0);
    println!("  samples in last 1000ms window: {}", series.len());
    if let (Some(first), Some(last)) = (series.first(), series.last()) {
        println!("  first={:?} last={:?}", first, last);
    }
}

fn main() {
    pretty_env_logger::init();
    let registry = BlockRegistry::default();

    scenario_empty_patch(&registry);
    scenario_oscillator(&registry);
    scenario_broadcast_field(&registry);
    scenario_unit_mismatch(&registry);
    scenario_debug_tap(&registry);
}
