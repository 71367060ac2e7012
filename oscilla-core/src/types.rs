//! Canonical type algebra: payload × unit × extent.
//!
//! This module is the single source of truth for `strideOf` and `unitsEqual`
//! (see the design notes in the top-level crate docs): no other module may
//! recompute component counts or compare units structurally on its own.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The authoring-level payload kind of a value.
///
/// `Shape` aliases to `Float` at runtime (a shape block ultimately lowers to
/// a scalar signed-distance or parametric value) but is kept distinct here so
/// that block lowering and the UI can tell the two apart before lowering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    Float,
    Int,
    Bool,
    Color,
    Vec2,
    Shape,
}

impl Payload {
    /// Components per instance. The only place this number is computed.
    pub fn stride(self) -> usize {
        stride_of(self)
    }
}

/// Single source of truth for component-per-instance counts.
pub fn stride_of(payload: Payload) -> usize {
    match payload {
        Payload::Float | Payload::Int | Payload::Bool | Payload::Shape => 1,
        Payload::Vec2 => 2,
        Payload::Color => 4,
    }
}

/// Structured unit tag. Two units are equal only when structurally identical;
/// `units_equal` is the only function permitted to make that judgement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    None,
    Angle(AngleKind),
    Color(ColorSpaceKind),
    /// Escape hatch for block-defined units that don't warrant their own
    /// variant (e.g. a domain-specific "decibel" unit). `params` participates
    /// in structural equality.
    Custom { name: String, params: Vec<String> },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AngleKind {
    Phase01,
    Radians,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpaceKind {
    Srgb,
    Linear,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::None => write!(f, "none"),
            Unit::Angle(AngleKind::Phase01) => write!(f, "angle{{phase01}}"),
            Unit::Angle(AngleKind::Radians) => write!(f, "angle{{radians}}"),
            Unit::Color(ColorSpaceKind::Srgb) => write!(f, "color{{srgb}}"),
            Unit::Color(ColorSpaceKind::Linear) => write!(f, "color{{linear}}"),
            Unit::Custom { name, .. } => write!(f, "{}", name),
        }
    }
}

/// Structural unit equality. Do not compare `Unit` with `==` outside this
/// function; route every comparison through it so there is one place to
/// change if the notion of "structurally identical" ever grows.
pub fn units_equal(a: &Unit, b: &Unit) -> bool {
    a == b
}

/// A domain a field is indexed over (e.g. the cells of a `GridLayout`).
/// Two fields with different `InstanceRef`s can never unify: they iterate
/// over different universes even if they happen to have the same count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub domain_type: String,
    pub instance_id: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Temporality {
    Continuous,
    Discrete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Binding {
    Default,
    Bound,
}

/// Reserved axis. Always `Default` throughout the current model: it exists
/// to be unified but no pass consumes it (see the open question in the
/// design notes). Do not add behavior keyed on this value without a pass
/// that explicitly owns it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Perspective;

/// Reserved axis, see `Perspective`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Branch;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many(InstanceRef),
}

/// A fully resolved extent: every axis carries a concrete value. This is the
/// extent shape that is allowed to reach IR. Contrast with `InferenceExtent`,
/// whose axes may still be `Var` during unification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub cardinality: Cardinality,
    pub temporality: Temporality,
    pub binding: Binding,
    pub perspective: Perspective,
    pub branch: Branch,
}

impl Extent {
    pub fn signal(temporality: Temporality) -> Extent {
        Extent {
            cardinality: Cardinality::One,
            temporality,
            binding: Binding::Default,
            perspective: Perspective,
            branch: Branch,
        }
    }

    pub fn field(instance: InstanceRef, temporality: Temporality) -> Extent {
        Extent {
            cardinality: Cardinality::Many(instance),
            temporality,
            binding: Binding::Default,
            perspective: Perspective,
            branch: Branch,
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self.cardinality, Cardinality::Many(_))
    }
}

/// The canonical type attached to every port and every IR value.
///
/// Constructing one is a plain assembly of its three parts: `canonical_type`
/// performs no inference, no widening, no defaulting. Values reaching this
/// constructor must already be fully resolved (pass 4/5 territory); anything
/// still carrying a `var` axis belongs in `InferenceExtent`, not here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalType {
    pub payload: Payload,
    pub unit: Unit,
    pub extent: Extent,
}

pub fn canonical_type(payload: Payload, unit: Unit, extent: Extent) -> CanonicalType {
    CanonicalType { payload, unit, extent }
}

impl CanonicalType {
    pub fn stride(&self) -> usize {
        stride_of(self.payload)
    }
}

// ---------------------------------------------------------------------------
// Inference-time axes. Disjoint from the canonical type set by construction:
// `InferenceAxis<T>` has no `From`/`Into` to its canonical counterpart other
// than the explicit `resolve` below, and nothing in `ir` or `patch::Block`
// ever stores one.

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum InferenceAxis<T> {
    Var,
    Inst(T),
}

impl<T> InferenceAxis<T> {
    pub fn resolve(self) -> Option<T> {
        match self {
            InferenceAxis::Var => None,
            InferenceAxis::Inst(v) => Some(v),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot unify axis '{axis}': {reason}")]
pub struct AxisUnificationError {
    pub axis: &'static str,
    pub reason: String,
}

/// `var` absorbs `inst`; two `inst` values must structurally match.
/// Symmetric by construction: swapping `a`/`b` produces the same result
/// because every match arm that isn't `(Var, Var)` treats the two operands
/// interchangeably.
pub fn unify_axis<T: PartialEq + Clone + fmt::Debug>(
    axis: &'static str,
    a: &InferenceAxis<T>,
    b: &InferenceAxis<T>,
) -> Result<InferenceAxis<T>, AxisUnificationError> {
    match (a, b) {
        (InferenceAxis::Var, InferenceAxis::Var) => Ok(InferenceAxis::Var),
        (InferenceAxis::Var, InferenceAxis::Inst(v)) | (InferenceAxis::Inst(v), InferenceAxis::Var) => {
            Ok(InferenceAxis::Inst(v.clone()))
        }
        (InferenceAxis::Inst(x), InferenceAxis::Inst(y)) => {
            if x == y {
                Ok(InferenceAxis::Inst(x.clone()))
            } else {
                Err(AxisUnificationError {
                    axis,
                    reason: format!("{:?} != {:?}", x, y),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_table_is_exhaustive_and_matches_spec() {
        assert_eq!(stride_of(Payload::Float), 1);
        assert_eq!(stride_of(Payload::Int), 1);
        assert_eq!(stride_of(Payload::Bool), 1);
        assert_eq!(stride_of(Payload::Shape), 1);
        assert_eq!(stride_of(Payload::Vec2), 2);
        assert_eq!(stride_of(Payload::Color), 4);
    }

    #[test]
    fn units_equal_is_structural() {
        assert!(units_equal(&Unit::Angle(AngleKind::Phase01), &Unit::Angle(AngleKind::Phase01)));
        assert!(!units_equal(&Unit::Angle(AngleKind::Phase01), &Unit::Angle(AngleKind::Radians)));
        assert!(!units_equal(
            &Unit::Custom { name: "db".into(), params: vec![] },
            &Unit::Custom { name: "db".into(), params: vec!["a".into()] }
        ));
    }

    #[test]
    fn unify_axis_symmetry() {
        let var: InferenceAxis<u32> = InferenceAxis::Var;
        let inst = InferenceAxis::Inst(3u32);
        assert_eq!(unify_axis("x", &var, &inst), unify_axis("x", &inst, &var));

        let a = InferenceAxis::Inst(3u32);
        let b = InferenceAxis::Inst(3u32);
        assert_eq!(unify_axis("x", &a, &b).unwrap(), InferenceAxis::Inst(3));
    }

    #[test]
    fn unify_axis_rejects_mismatched_instances() {
        let a = InferenceAxis::Inst(3u32);
        let b = InferenceAxis::Inst(4u32);
        assert!(unify_axis("cardinality", &a, &b).is_err());
    }
}
