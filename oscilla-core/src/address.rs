//! Canonical addressing: deterministic paths to every addressable patch
//! element, and the registry that resolves them in O(1).

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A fully resolved, stable path to a patch element. Formats as
/// `v1:blocks.<name>`, `.outputs.<port>`, `.inputs.<port>`, `.params.<id>`,
/// or `v1:edges.<edgeId>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalAddress {
    Block { name: String },
    BlockOutput { block: String, port: String },
    BlockInput { block: String, port: String },
    BlockParam { block: String, param: String },
    Edge { edge_id: String },
}

impl fmt::Display for CanonicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalAddress::Block { name } => write!(f, "v1:blocks.{}", name),
            CanonicalAddress::BlockOutput { block, port } => {
                write!(f, "v1:blocks.{}.outputs.{}", block, port)
            }
            CanonicalAddress::BlockInput { block, port } => {
                write!(f, "v1:blocks.{}.inputs.{}", block, port)
            }
            CanonicalAddress::BlockParam { block, param } => {
                write!(f, "v1:blocks.{}.params.{}", block, param)
            }
            CanonicalAddress::Edge { edge_id } => write!(f, "v1:edges.{}", edge_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum AddressParseError {
    #[error("address '{0}' is missing the 'v1:' scheme prefix")]
    MissingScheme(String),
    #[error("address '{0}' has an unrecognized shape")]
    MalformedPath(String),
}

/// Inverse of `Display`. `parseAddress(addressToString(a)) == a` for every
/// constructed address (see the address round-trip property).
pub fn parse_address(s: &str) -> Result<CanonicalAddress, AddressParseError> {
    let rest = s
        .strip_prefix("v1:")
        .ok_or_else(|| AddressParseError::MissingScheme(s.to_string()))?;

    if let Some(edge_id) = rest.strip_prefix("edges.") {
        return Ok(CanonicalAddress::Edge { edge_id: edge_id.to_string() });
    }

    let rest = rest
        .strip_prefix("blocks.")
        .ok_or_else(|| AddressParseError::MalformedPath(s.to_string()))?;

    // rest is now `<name>` or `<name>.{outputs,inputs,params}.<id>`
    if let Some(idx) = rest.find('.') {
        let (name, tail) = rest.split_at(idx);
        let tail = &tail[1..]; // drop the '.'
        if let Some(port) = tail.strip_prefix("outputs.") {
            return Ok(CanonicalAddress::BlockOutput { block: name.to_string(), port: port.to_string() });
        }
        if let Some(port) = tail.strip_prefix("inputs.") {
            return Ok(CanonicalAddress::BlockInput { block: name.to_string(), port: port.to_string() });
        }
        if let Some(param) = tail.strip_prefix("params.") {
            return Ok(CanonicalAddress::BlockParam { block: name.to_string(), param: param.to_string() });
        }
        return Err(AddressParseError::MalformedPath(s.to_string()));
    }

    Ok(CanonicalAddress::Block { name: rest.to_string() })
}

/// Derives a block's canonical name from its authoring `displayName`: strip
/// punctuation, spaces become `_`, lowercase. This is the only function
/// permitted to perform this derivation; every site that needs a canonical
/// name calls through here.
pub fn normalize_canonical_name(display_name: &str) -> String {
    let mut out = String::with_capacity(display_name.len());
    for ch in display_name.chars() {
        if ch.is_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() {
            out.push('_');
        }
        // all other punctuation is dropped
    }
    out
}

#[derive(Clone, Debug)]
pub enum ResolvedAddress {
    Address(CanonicalAddress),
    /// More than one block shares a display name and the shorthand did not
    /// disambiguate which one was meant.
    Ambiguous(Vec<CanonicalAddress>),
}

/// O(1) lookup index from canonical address strings (and `block.port`
/// shorthand) to resolved patch elements. Built once per compile.
#[derive(Default)]
pub struct AddressRegistry {
    by_string: FxHashMap<String, CanonicalAddress>,
    /// `displayName` (post-normalization) -> every block that claims it, so
    /// shorthand resolution can detect ambiguity.
    blocks_by_name: FxHashMap<String, Vec<String>>,
}

impl AddressRegistry {
    pub fn new() -> AddressRegistry {
        AddressRegistry::default()
    }

    pub fn register(&mut self, addr: CanonicalAddress) {
        let key = addr.to_string();
        if let CanonicalAddress::Block { name } = &addr {
            self.blocks_by_name.entry(name.clone()).or_default().push(name.clone());
        }
        self.by_string.insert(key, addr);
    }

    pub fn lookup(&self, address: &str) -> Option<&CanonicalAddress> {
        self.by_string.get(address)
    }

    /// Resolves `block.port` shorthand, accepted when the block display name
    /// is unique. Returns `Ambiguous` when more than one block shares the
    /// name (an error at the call site).
    pub fn resolve_shorthand(&self, shorthand: &str) -> Option<ResolvedAddress> {
        let (block, port) = shorthand.split_once('.')?;
        let candidates = self.blocks_by_name.get(block)?;
        if candidates.len() > 1 {
            let addrs = candidates
                .iter()
                .map(|_| CanonicalAddress::BlockOutput { block: block.to_string(), port: port.to_string() })
                .collect();
            return Some(ResolvedAddress::Ambiguous(addrs));
        }

        // Prefer an output, fall back to an input, so `Block.port` reads
        // naturally for either direction depending on what's wired.
        let out = CanonicalAddress::BlockOutput { block: block.to_string(), port: port.to_string() };
        if self.by_string.contains_key(&out.to_string()) {
            return Some(ResolvedAddress::Address(out));
        }
        let inp = CanonicalAddress::BlockInput { block: block.to_string(), port: port.to_string() };
        if self.by_string.contains_key(&inp.to_string()) {
            return Some(ResolvedAddress::Address(inp));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_variant() {
        let cases = vec![
            CanonicalAddress::Block { name: "osc1".into() },
            CanonicalAddress::BlockOutput { block: "osc1".into(), port: "out".into() },
            CanonicalAddress::BlockInput { block: "osc1".into(), port: "rate".into() },
            CanonicalAddress::BlockParam { block: "osc1".into(), param: "rate".into() },
            CanonicalAddress::Edge { edge_id: "e7".into() },
        ];
        for addr in cases {
            let s = addr.to_string();
            let parsed = parse_address(&s).unwrap();
            assert_eq!(parsed, addr);
        }
    }

    #[test]
    fn normalize_strips_punctuation_and_lowercases() {
        assert_eq!(normalize_canonical_name("My Oscillator #1"), "my_oscillator_1");
        assert_eq!(normalize_canonical_name("Render-Sink!"), "rendersink");
    }

    #[test]
    fn shorthand_ambiguity_is_detected() {
        let mut reg = AddressRegistry::new();
        reg.register(CanonicalAddress::Block { name: "circle".into() });
        reg.blocks_by_name.get_mut("circle").unwrap().push("circle".into());
        assert!(matches!(
            reg.resolve_shorthand("circle.radius"),
            Some(ResolvedAddress::Ambiguous(_))
        ));
    }
}
