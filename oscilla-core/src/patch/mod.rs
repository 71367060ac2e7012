//! The authored graph: blocks, edges, and the normalization passes that turn
//! a user-wired patch into something the compiler can type-check.

pub mod normalize;

use crate::address::normalize_canonical_name;
use crate::types::Payload;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Index of a `Block` within a `Patch`. Stable for the lifetime of one
/// compile; never reused once assigned.
///
/// Patches cross the boundary to/from the UI/editor as plain data, so this
/// is a bare newtype rather than the `sid_vec`-typed indices the IR builder
/// uses internally (see `ir::SlotId`) — the authored graph must round-trip
/// through serde without a phantom-tagged crate in the loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdx(pub usize);

impl BlockIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombineMode {
    Sum,
    Average,
    Max,
    Min,
    Mul,
    Last,
    First,
    Layer,
    Or,
    And,
}

/// An ordered vararg connection, bypassing the combine system entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VarargConnection {
    pub source_address: String,
    pub sort_key: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VarargConstraint {
    pub payload_type: Payload,
    pub min_connections: usize,
    pub max_connections: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InputPortConfig {
    /// Block-type+output descriptor that materializes as an implicit edge
    /// when this input is otherwise unwired.
    pub default_source: Option<DefaultSourceDescriptor>,
    pub combine_mode: Option<CombineMode>,
    pub is_vararg: bool,
    pub vararg_constraint: Option<VarargConstraint>,
    pub vararg_connections: Vec<VarargConnection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultSourceDescriptor {
    pub block_type: String,
    pub output_port: String,
    /// Params applied to the synthesized default-source block.
    pub params: FxHashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputPortConfig {
    pub payload: Option<Payload>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RoleKind {
    User,
    TimeRoot,
    Derived,
    Domain,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoleMeta {
    pub kind: Option<String>,
    pub serves: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Role {
    pub kind: RoleKind,
    pub meta: RoleMeta,
}

impl Role {
    pub fn user() -> Role {
        Role { kind: RoleKind::User, meta: RoleMeta::default() }
    }

    pub fn time_root() -> Role {
        Role { kind: RoleKind::TimeRoot, meta: RoleMeta::default() }
    }

    pub fn derived(kind: &str, serves: impl Into<String>) -> Role {
        Role {
            kind: RoleKind::Derived,
            meta: RoleMeta { kind: Some(kind.to_string()), serves: Some(serves.into()) },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub display_name: String,
    pub block_type: String,
    pub params: FxHashMap<String, serde_json::Value>,
    pub input_ports: FxHashMap<String, InputPortConfig>,
    pub output_ports: FxHashMap<String, OutputPortConfig>,
    pub role: Role,
}

impl Block {
    pub fn canonical_name(&self) -> String {
        normalize_canonical_name(&self.display_name)
    }

    pub fn new(display_name: impl Into<String>, block_type: impl Into<String>) -> Block {
        Block {
            display_name: display_name.into(),
            block_type: block_type.into(),
            params: FxHashMap::default(),
            input_ports: FxHashMap::default(),
            output_ports: FxHashMap::default(),
            role: Role::user(),
        }
    }

    pub fn with_param(mut self, id: impl Into<String>, value: serde_json::Value) -> Block {
        self.params.insert(id.into(), value);
        self
    }

    pub fn with_input(mut self, port: impl Into<String>, config: InputPortConfig) -> Block {
        self.input_ports.insert(port.into(), config);
        self
    }

    pub fn with_output(mut self, port: impl Into<String>, config: OutputPortConfig) -> Block {
        self.output_ports.insert(port.into(), config);
        self
    }

    pub fn with_role(mut self, role: Role) -> Block {
        self.role = role;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeRole {
    User,
    Default,
    Auto,
    Adapter,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub block: BlockIdx,
    pub port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub from: PortAddress,
    pub to: PortAddress,
    pub enabled: bool,
    pub sort_key: i64,
    pub role: EdgeRole,
}

/// `(Blocks, Edges)`: the authored graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Patch {
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
}

impl Patch {
    pub fn new() -> Patch {
        Patch::default()
    }

    pub fn add_block(&mut self, block: Block) -> BlockIdx {
        let idx = BlockIdx(self.blocks.len());
        self.blocks.push(block);
        idx
    }

    pub fn add_edge(&mut self, edge: Edge) -> usize {
        self.edges.push(edge);
        self.edges.len() - 1
    }

    pub fn block(&self, idx: BlockIdx) -> &Block {
        &self.blocks[idx.0]
    }

    pub fn block_mut(&mut self, idx: BlockIdx) -> &mut Block {
        &mut self.blocks[idx.0]
    }

    /// Edges feeding `block`'s `port`, enabled only.
    pub fn incoming(&self, block: BlockIdx, port: &str) -> impl Iterator<Item = &Edge> {
        self.edges
            .iter()
            .filter(move |e| e.enabled && e.to.block == block && e.to.port == port)
    }
}
