//! Observation/debug tap: makes runtime state inspectable without ever
//! mutating execution. `DebugTap` is an optional sink the runtime calls
//! through; `DebugGraph` is the compile-time address index; ring buffers
//! back `DebugService::get_bus_series`.

use crate::address::CanonicalAddress;
use crate::config::DEBUG_RING_BUFFER_CAPACITY;
use crate::ir::{SlotId, ValueRef};
use fxhash::FxHashMap;

/// A tagged union over payload kinds, so the tap can record a value without
/// the caller threading a `CanonicalType` through every call.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueSummary {
    Num(f64),
    Phase(f64),
    Color([f64; 4]),
    Vec2([f64; 2]),
    Bool(bool),
    Trigger,
    None,
    Err { code: String },
}

/// Optional sink the runtime calls through during `executeFrame`. Never
/// mutates execution state; a tap that panics or is slow affects only
/// observability, not correctness (the runtime does not depend on its
/// return value).
pub trait DebugTap {
    fn record_slot_value(&mut self, slot: SlotId, value: f64);

    fn on_debug_graph(&mut self, _graph: &DebugGraph) {}

    fn on_snapshot(&mut self, _snapshot: &DebugSnapshot) {}

    /// Not itself part of the minimum surface; the runtime calls this once
    /// per frame, before any `record_slot_value`, so a tap that keeps
    /// per-sample history (like `RingBufferTap`) can timestamp without every
    /// call site threading `t_ms` through.
    fn set_time(&mut self, _t_ms: f64) {}
}

/// One addressable block output: its resolved value kind and its direct
/// upstream producers (see `compiler::build_debug_graph`).
#[derive(Clone, Debug)]
pub struct DebugGraphEntry {
    pub address: CanonicalAddress,
    pub value: ValueRef,
    pub upstream_producers: Vec<CanonicalAddress>,
}

/// Compile-time index from `CanonicalAddress` to `(slot, type, upstream)`.
/// Immutable across a program's life; rebuilt wholesale on recompile.
#[derive(Clone, Debug, Default)]
pub struct DebugGraph {
    pub patch_revision: u64,
    entries: Vec<DebugGraphEntry>,
    by_address: FxHashMap<String, usize>,
}

impl DebugGraph {
    pub fn new(patch_revision: u64, entries: Vec<DebugGraphEntry>) -> DebugGraph {
        let mut by_address = FxHashMap::default();
        for (i, e) in entries.iter().enumerate() {
            by_address.insert(e.address.to_string(), i);
        }
        DebugGraph { patch_revision, entries, by_address }
    }

    /// Resolves a canonical port address, stable across recompile, rather
    /// than an edge identity.
    pub fn probe_port(&self, address: &str) -> Option<&DebugGraphEntry> {
        self.by_address.get(address).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[DebugGraphEntry] {
        &self.entries
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeHealth {
    pub nan_count: u32,
    pub inf_count: u32,
    pub silent_buses: u32,
}

#[derive(Clone, Debug)]
pub struct DebugSnapshot {
    pub patch_revision: u64,
    pub t_ms: f64,
    pub bus_now: Vec<(CanonicalAddress, ValueSummary)>,
    pub health: RuntimeHealth,
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    t_ms: f64,
    value: f64,
}

/// Fixed-capacity history for one bus. ≈150 samples @ ~15 Hz ≈ 10s, matching
/// `config::DEBUG_RING_BUFFER_CAPACITY`. Numeric channels only: the minimum
/// viable tap surface (`recordSlotValue`) is always a plain `f64`, so the
/// ring buffer doesn't need to carry the full `ValueSummary` tagging.
struct RingBuffer {
    samples: Vec<Sample>,
    next: usize,
    len: usize,
}

impl RingBuffer {
    fn new() -> RingBuffer {
        RingBuffer { samples: vec![Sample { t_ms: 0.0, value: 0.0 }; DEBUG_RING_BUFFER_CAPACITY], next: 0, len: 0 }
    }

    fn push(&mut self, t_ms: f64, value: f64) {
        self.samples[self.next] = Sample { t_ms, value };
        self.next = (self.next + 1) % self.samples.len();
        self.len = (self.len + 1).min(self.samples.len());
    }

    /// Samples within the last `window_ms`, oldest first.
    fn window(&self, now_ms: f64, window_ms: f64) -> Vec<(f64, f64)> {
        let cap = self.samples.len();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            let idx = (self.next + cap - 1 - i) % cap;
            let s = self.samples[idx];
            if now_ms - s.t_ms > window_ms {
                break;
            }
            out.push((s.t_ms, s.value));
        }
        out.reverse();
        out
    }
}

/// Sample sink plus series query, wrapping a ring buffer per slot.
/// Installed via `Runtime::set_tap`.
pub struct RingBufferTap {
    buffers: FxHashMap<u32, RingBuffer>,
    graph: Option<DebugGraph>,
    current_t_ms: f64,
}

impl RingBufferTap {
    pub fn new() -> RingBufferTap {
        RingBufferTap { buffers: FxHashMap::default(), graph: None, current_t_ms: 0.0 }
    }

    fn slot_key(slot: SlotId) -> u32 {
        slot.index() as u32
    }

    /// Records with an explicit timestamp; `DebugTap::record_slot_value`
    /// doesn't carry one, so callers pair it with `set_time` first — the
    /// runtime already rations calls to ~`config::TAP_SAMPLE_RATE_HZ`.
    pub fn push_sample(&mut self, slot: SlotId, t_ms: f64, value: f64) {
        self.buffers.entry(Self::slot_key(slot)).or_insert_with(RingBuffer::new).push(t_ms, value);
    }

    /// Samples for `slot` within the last `window_ms`, oldest first.
    pub fn get_bus_series(&self, slot: SlotId, now_ms: f64, window_ms: f64) -> Vec<(f64, f64)> {
        self.buffers.get(&Self::slot_key(slot)).map(|b| b.window(now_ms, window_ms)).unwrap_or_default()
    }
}

impl Default for RingBufferTap {
    fn default() -> Self {
        RingBufferTap::new()
    }
}

impl DebugTap for RingBufferTap {
    fn record_slot_value(&mut self, slot: SlotId, value: f64) {
        let t_ms = self.current_t_ms;
        self.push_sample(slot, t_ms, value);
    }

    fn on_debug_graph(&mut self, graph: &DebugGraph) {
        self.graph = Some(graph.clone());
        self.buffers.clear();
    }

    fn set_time(&mut self, t_ms: f64) {
        self.current_t_ms = t_ms;
    }
}

/// A tiny facade over `RingBufferTap`, kept distinct from the tap itself
/// since an embedder may want to query series from a thread that doesn't
/// own the runtime.
pub struct DebugService<'a> {
    tap: &'a RingBufferTap,
}

impl<'a> DebugService<'a> {
    pub fn new(tap: &'a RingBufferTap) -> DebugService<'a> {
        DebugService { tap }
    }

    pub fn get_bus_series(&self, slot: SlotId, now_ms: f64, window_ms: f64) -> Vec<(f64, f64)> {
        self.tap.get_bus_series(slot, now_ms, window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IRBuilder;
    use crate::types::{canonical_type, Extent, Payload, Temporality, Unit};

    fn slot(i: u32) -> SlotId {
        let mut b = IRBuilder::new();
        let mut last = b.alloc_slot(canonical_type(Payload::Float, Unit::None, Extent::signal(Temporality::Continuous)));
        for _ in 0..i {
            last = b.alloc_slot(canonical_type(Payload::Float, Unit::None, Extent::signal(Temporality::Continuous)));
        }
        last
    }

    #[test]
    fn ring_buffer_window_returns_oldest_first_within_bound() {
        let mut rb = RingBuffer::new();
        rb.push(0.0, 1.0);
        rb.push(100.0, 2.0);
        rb.push(1100.0, 3.0);
        let got = rb.window(1100.0, 1000.0);
        assert_eq!(got, vec![(100.0, 2.0), (1100.0, 3.0)]);
    }

    #[test]
    fn ring_buffer_wraps_past_capacity() {
        let mut rb = RingBuffer::new();
        for i in 0..(DEBUG_RING_BUFFER_CAPACITY + 10) {
            rb.push(i as f64, i as f64);
        }
        assert_eq!(rb.len, DEBUG_RING_BUFFER_CAPACITY);
        let got = rb.window((DEBUG_RING_BUFFER_CAPACITY + 9) as f64, 1e9);
        assert_eq!(got.len(), DEBUG_RING_BUFFER_CAPACITY);
        assert_eq!(got.first().unwrap().1, 10.0);
    }

    #[test]
    fn get_bus_series_is_empty_for_unknown_slot() {
        let tap = RingBufferTap::new();
        assert!(tap.get_bus_series(slot(0), 0.0, 1000.0).is_empty());
    }
}
