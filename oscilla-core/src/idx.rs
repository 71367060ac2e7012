//! Phantom-tagged typed indices over a flat `Vec` — the usual `Id<Tag>` /
//! `IdVec<Tag, T>` pattern for distinguishing index spaces (a node index
//! isn't accidentally usable as an edge index) without any runtime cost.
//!
//! Implemented locally rather than pulled in as a dependency: the slot,
//! state-slot, and IR-node IDs here need to round-trip through `serde`
//! (`IRProgram` is part of the wire format between compile and runtime) and
//! need plain-`Vec` access for the scheduler, neither of which justifies an
//! extra crate once the shape is this small.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

pub struct Id<Tag> {
    raw: u32,
    _tag: PhantomData<fn() -> Tag>,
}

impl<Tag> Id<Tag> {
    pub fn new(raw: u32) -> Self {
        Id { raw, _tag: PhantomData }
    }

    pub fn index(self) -> usize {
        self.raw as usize
    }
}

impl<Tag> Copy for Id<Tag> {}
impl<Tag> Clone for Id<Tag> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Tag> PartialEq for Id<Tag> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<Tag> Eq for Id<Tag> {}
impl<Tag> std::hash::Hash for Id<Tag> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<Tag> fmt::Debug for Id<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.raw)
    }
}
impl<Tag> Serialize for Id<Tag> {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(s)
    }
}
impl<'de, Tag> Deserialize<'de> for Id<Tag> {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Id::new(u32::deserialize(d)?))
    }
}

/// A `Vec<T>` indexed by a phantom-tagged `Id<Tag>`. IDs are assigned
/// monotonically by `push` and never reused.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdVec<Tag, T> {
    items: Vec<T>,
    #[serde(skip)]
    _tag: PhantomData<fn() -> Tag>,
}

impl<Tag, T> IdVec<Tag, T> {
    pub fn new() -> Self {
        IdVec { items: Vec::new(), _tag: PhantomData }
    }

    pub fn push(&mut self, value: T) -> Id<Tag> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(value);
        id
    }

    pub fn get(&self, id: Id<Tag>) -> &T {
        &self.items[id.index()]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = Id<Tag>> + '_ {
        (0..self.items.len()).map(|i| Id::new(i as u32))
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<Tag, T> Default for IdVec<Tag, T> {
    fn default() -> Self {
        IdVec::new()
    }
}

impl<Tag, T> std::ops::Index<Id<Tag>> for IdVec<Tag, T> {
    type Output = T;
    fn index(&self, id: Id<Tag>) -> &T {
        self.get(id)
    }
}
